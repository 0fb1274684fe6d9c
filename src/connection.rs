//! Per-connection state and the fine-grained lock discipline that guards it.
//!
//! Each [`Connection`] is reached through a non-owning handle keyed by remote
//! address; the player object itself lives in the external
//! [`crate::collab::PlayerManager`].

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::bigdata::BigDataAssembler;
use crate::callbacks::CallbackInvoker;
use crate::collab::PlayerId;
use crate::encrypt::Encryptor;
use crate::limiter::BandwidthLimiter;
use crate::priority::{BandwidthPriority, PRIORITY_COUNT};
use crate::reorder::ReorderBuffer;
use crate::sizedrecv::SizedReceiver;
use crate::wire;

/// Lifecycle phase of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Normal operation.
    Connected = 0,
    /// The player has begun leaving; inbound packets are rejected.
    LeavingZone = 1,
    /// Teardown in progress, waiting for in-flight sends to drain.
    TimeWait = 2,
    /// Fully torn down; the table entry is about to be removed.
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(v: u8) -> ConnectionState {
        match v {
            0 => ConnectionState::Connected,
            1 => ConnectionState::LeavingZone,
            2 => ConnectionState::TimeWait,
            _ => ConnectionState::Closed,
        }
    }
}

/// One packet sitting in a send queue, reliable or not.
pub struct QueuedPacket {
    /// Fully-framed bytes, or (for an unsent reliable packet) the raw payload
    /// awaiting a `[0x00, 0x03, seq]` header.
    pub data: Vec<u8>,
    pub flags: crate::priority::SendFlags,
    /// Sequence number, assigned only once the packet leaves the unsent queue.
    pub seq: Option<i32>,
    pub tries: u32,
    pub last_try: Option<Instant>,
    pub callback: CallbackInvoker,
}

impl QueuedPacket {
    pub fn new(data: Vec<u8>, flags: crate::priority::SendFlags) -> Self {
        Self {
            data,
            flags,
            seq: None,
            tries: 0,
            last_try: None,
            callback: CallbackInvoker::empty(),
        }
    }
}

/// State guarded by `outgoing_lock`: send queues, sequence counter, RTT
/// estimate, bandwidth limiter, and the fault flags the send pipeline sets.
pub struct OutgoingState {
    pub s2cn: i32,
    pub queues: [VecDeque<QueuedPacket>; PRIORITY_COUNT],
    pub unsent_reliable: VecDeque<QueuedPacket>,
    pub avg_rtt_ms: f64,
    pub avg_rtt_dev_ms: f64,
    pub limiter: Box<dyn BandwidthLimiter>,
    pub hit_max_retries: bool,
    pub hit_max_outlist: bool,
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub retries: u64,
    pub ack_dups: u64,
}

impl OutgoingState {
    fn new(limiter: Box<dyn BandwidthLimiter>) -> Self {
        Self {
            s2cn: 0,
            queues: Default::default(),
            unsent_reliable: VecDeque::new(),
            avg_rtt_ms: 200.0,
            avg_rtt_dev_ms: 100.0,
            limiter,
            hit_max_retries: false,
            hit_max_outlist: false,
            packets_sent: 0,
            bytes_sent: 0,
            retries: 0,
            ack_dups: 0,
        }
    }

    /// Total queued packets (unsent + sending), checked against
    /// `max_outlist_size`.
    pub fn outlist_size(&self) -> usize {
        self.unsent_reliable.len() + self.queues.iter().map(VecDeque::len).sum::<usize>()
    }
}

/// One outbound sized-send in progress.
pub struct SizedSendDescriptor {
    pub total_length: u64,
    pub offset: u64,
    pub cancelled: bool,
    pub cancelled_by_peer: bool,
}

/// State guarded by `big_lock`: the inbound big-data accumulator and the
/// inbound sized-receive state.
pub struct BigState {
    pub big_receive: Option<BigDataAssembler>,
    pub sized_receive: SizedReceiver,
}

impl BigState {
    fn new(max_big_packet: usize) -> Self {
        Self {
            big_receive: Some(BigDataAssembler::new(max_big_packet)),
            sized_receive: SizedReceiver::new(),
        }
    }
}

/// A single connection's full state, one instance per remote peer.
pub struct Connection {
    pub remote: SocketAddr,
    pub player: Option<PlayerId>,
    pub listen_index: usize,

    state: AtomicU8,
    last_receive_millis: AtomicU64,
    established_at: Instant,

    pub packets_received: AtomicU64,
    pub bytes_received: AtomicU64,
    pub rel_dups: AtomicU64,

    /// Next inbound sequence number expected (`c2sn`).
    pub c2sn: AtomicU64,

    pub outgoing: Mutex<OutgoingState>,
    pub reliable: Mutex<ReorderBuffer>,
    pub reliable_processing: Mutex<()>,
    /// Raw reliable frames held by sequence number until a reliable worker
    /// drains them in order; the reorder buffer above only tracks which
    /// sequence numbers have arrived, not their payloads.
    pub reliable_store: Mutex<HashMap<u32, Vec<u8>>>,
    /// Sequence numbers the reorder buffer has resolved as delivered, in
    /// order, awaiting a reliable worker to pop and dispatch their payload.
    pub ready_frames: Mutex<VecDeque<u32>>,
    /// Acks queued for the send pipeline to flush at `Ack` priority.
    pub acks_pending: Mutex<VecDeque<i32>>,
    pub big: Mutex<BigState>,
    pub sized_send: Mutex<VecDeque<SizedSendDescriptor>>,
    /// Sized-data chunks enqueued but not yet acked or dropped; decremented by
    /// each chunk's completion callback, not by queue occupancy (the unsent
    /// queue drains into the reliable priority queue well before the chunk is
    /// actually acked).
    pub sized_send_queued: Arc<AtomicUsize>,
    pub encryptor: Mutex<(String, Box<dyn Encryptor>)>,
}

impl Connection {
    /// Allocates a fresh connection record and resets all RTT/queue state.
    pub fn new(
        remote: SocketAddr,
        listen_index: usize,
        receive_window: u32,
        limiter: Box<dyn BandwidthLimiter>,
        encryptor: (String, Box<dyn Encryptor>),
    ) -> Self {
        let now = Instant::now();
        Self {
            remote,
            player: None,
            listen_index,
            state: AtomicU8::new(ConnectionState::Connected as u8),
            last_receive_millis: AtomicU64::new(0),
            established_at: now,
            packets_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            rel_dups: AtomicU64::new(0),
            c2sn: AtomicU64::new(0),
            outgoing: Mutex::new(OutgoingState::new(limiter)),
            reliable: Mutex::new(ReorderBuffer::new(0, receive_window)),
            reliable_processing: Mutex::new(()),
            reliable_store: Mutex::new(HashMap::new()),
            ready_frames: Mutex::new(VecDeque::new()),
            acks_pending: Mutex::new(VecDeque::new()),
            big: Mutex::new(BigState::new(wire::DEFAULT_MAX_BIG_PACKET)),
            sized_send: Mutex::new(VecDeque::new()),
            sized_send_queued: Arc::new(AtomicUsize::new(0)),
            encryptor: Mutex::new(encryptor),
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Stamps the last-receive clock to `now`, in milliseconds since the
    /// connection was established.
    pub fn stamp_received(&self, now: Instant) {
        let millis = now.saturating_duration_since(self.established_at).as_millis() as u64;
        self.last_receive_millis.store(millis, Ordering::Relaxed);
    }

    /// Milliseconds elapsed since the last received packet, relative to `now`.
    pub fn millis_since_last_receive(&self, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.established_at).as_millis() as u64;
        elapsed.saturating_sub(self.last_receive_millis.load(Ordering::Relaxed))
    }

    /// Resets all pooled resources on teardown: clears queues, cancels
    /// sized-sends, disposes big-receive storage. Reliable callbacks still
    /// queued are fired with `Dropped`.
    pub fn reset(&self) {
        {
            let mut out = self.outgoing.lock().unwrap();
            for queue in out.queues.iter_mut() {
                for mut pkt in queue.drain(..) {
                    pkt.callback.fire(crate::callbacks::CallbackOutcome::Dropped);
                }
            }
            for mut pkt in out.unsent_reliable.drain(..) {
                pkt.callback.fire(crate::callbacks::CallbackOutcome::Dropped);
            }
        }
        {
            let mut big = self.big.lock().unwrap();
            big.big_receive = None;
            big.sized_receive.reset();
        }
        self.sized_send.lock().unwrap().clear();
        self.reliable_store.lock().unwrap().clear();
        self.ready_frames.lock().unwrap().clear();
        self.acks_pending.lock().unwrap().clear();
    }
}
