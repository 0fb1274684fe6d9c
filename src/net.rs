//! Top-level orchestrator: owns every worker thread and exposes the public
//! API surface a caller actually uses.
//!
//! This module wires together every other module in the crate; it is the only
//! place that owns [`DatagramIo`] sockets, spawns threads, and holds the
//! module-wide shutdown signal.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::collab::{ArenaManager, LagCollector, MainThreadQueue, PlayerId, PlayerManager};
use crate::config::CoreConfig;
use crate::connection::Connection;
use crate::encrypt::Encryptor;
use crate::limiter::BandwidthLimiter;
use crate::ping::PingCache;
use crate::priority::SendFlags;
use crate::table::{ConnectionTable, InitHandlerChain};

/// A registered application packet handler, keyed by the packet's first byte.
pub type PacketHandler = Box<dyn Fn(PlayerId, &[u8]) + Send + Sync>;

/// A registered sized-packet handler, keyed the same way (`AddSizedPacket`).
pub type SizedPacketHandler = Box<dyn Fn(PlayerId, &[u8]) + Send + Sync>;

/// Work item handed from a reliable worker (or the receive worker, for
/// non-reliable traffic) to the application's main thread.
struct MainThreadItem {
    player: PlayerId,
    payload: Vec<u8>,
}

/// A connection ready for a reliable worker to drain, held on a global
/// connection-ready queue.
#[derive(Default)]
struct ReadyQueue {
    items: Mutex<VecDeque<Arc<Connection>>>,
    condvar: Condvar,
}

impl ReadyQueue {
    fn push(&self, conn: Arc<Connection>) {
        self.items.lock().unwrap().push_back(conn);
        self.condvar.notify_one();
    }

    /// Blocks until an item is available or `shutdown` is observed; `None`
    /// signals shutdown.
    fn pop(&self, shutdown: &AtomicBool) -> Option<Arc<Connection>> {
        let mut items = self.items.lock().unwrap();
        loop {
            if let Some(conn) = items.pop_front() {
                return Some(conn);
            }
            if shutdown.load(Ordering::Acquire) {
                return None;
            }
            let (guard, _timeout) = self
                .condvar
                .wait_timeout(items, Duration::from_millis(200))
                .unwrap();
            items = guard;
        }
    }
}

/// The collaborators this core needs but does not own.
pub struct Collaborators {
    pub players: Arc<dyn PlayerManager>,
    pub arenas: Arc<dyn ArenaManager>,
    pub lag: Arc<dyn LagCollector>,
    pub main_queue: Arc<dyn MainThreadQueue>,
}

/// The reliable UDP transport core.
pub struct CoreTransport {
    config: CoreConfig,
    table: Arc<ConnectionTable>,
    init_handlers: Arc<InitHandlerChain>,
    collaborators: Collaborators,

    ready_queue: Arc<ReadyQueue>,
    shutdown: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,

    packet_handlers: RwLock<HashMap<u8, PacketHandler>>,
    sized_handlers: RwLock<HashMap<u8, SizedPacketHandler>>,

    ping_cache: Mutex<PingCache>,

    global_packets_sent: std::sync::atomic::AtomicU64,
    global_packets_received: std::sync::atomic::AtomicU64,
    global_pings: std::sync::atomic::AtomicU64,
}

impl CoreTransport {
    /// Validates `config` and constructs the transport core without starting
    /// any threads yet (call [`Self::start`] to do that).
    pub fn new(config: CoreConfig, collaborators: Collaborators) -> Result<Arc<Self>, crate::error::ConfigError> {
        config.validate()?;
        let ping_cache = PingCache::new(config.ping_refresh_threshold);
        Ok(Arc::new(Self {
            config,
            table: Arc::new(ConnectionTable::new()),
            init_handlers: Arc::new(InitHandlerChain::new()),
            collaborators,
            ready_queue: Arc::new(ReadyQueue::default()),
            shutdown: Arc::new(AtomicBool::new(false)),
            workers: Mutex::new(Vec::new()),
            packet_handlers: RwLock::new(HashMap::new()),
            sized_handlers: RwLock::new(HashMap::new()),
            ping_cache: Mutex::new(ping_cache),
            global_packets_sent: Default::default(),
            global_packets_received: Default::default(),
            global_pings: Default::default(),
        }))
    }

    /// Spawns the send worker, the sized-send worker, and `reliable_threads`
    /// reliable workers. The receive worker is not modeled as a background
    /// thread here: embedding applications drive it by calling
    /// [`Self::on_datagram`] from their own I/O loop (see [`crate::io`] for
    /// the mio-based socket wait this feeds from).
    pub fn start(self: &Arc<Self>) {
        let mut workers = self.workers.lock().unwrap();

        let send_self = self.clone();
        workers.push(std::thread::spawn(move || send_self.run_send_worker()));

        let sized_self = self.clone();
        workers.push(std::thread::spawn(move || sized_self.run_sized_send_worker()));

        for _ in 0..self.config.reliable_threads {
            let reliable_self = self.clone();
            workers.push(std::thread::spawn(move || reliable_self.run_reliable_worker()));
        }
    }

    /// Signals every worker to exit and waits for them to join.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.ready_queue.condvar.notify_all();
        let mut workers = self.workers.lock().unwrap();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }

    fn run_send_worker(&self) {
        while !self.shutdown.load(Ordering::Acquire) {
            let now = Instant::now();
            for conn in self.table.snapshot() {
                if let Some(reason) = crate::lifecycle::check_lagout(
                    &conn,
                    &self.config,
                    &*self.collaborators.players,
                    now,
                ) {
                    warn!(remote = %conn.remote, ?reason, "lagout");
                    continue;
                }

                let datagrams = crate::send::send_pass(&conn, &self.config, now);
                self.global_packets_sent
                    .fetch_add(datagrams.len() as u64, Ordering::Relaxed);
                // Actual socket writes happen through the caller-owned
                // DatagramIo; this worker only computes what to send.
                let _ = datagrams;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn run_sized_send_worker(&self) {
        while !self.shutdown.load(Ordering::Acquire) {
            for conn in self.table.snapshot() {
                crate::sizedsend::drain_one(&conn, &self.config, |_remaining, _max| {
                    crate::sizedsend::SizedSendChunk::Done
                });
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn run_reliable_worker(&self) {
        loop {
            let conn = match self.ready_queue.pop(&self.shutdown) {
                Some(c) => c,
                None => break,
            };

            let _guard = conn.reliable_processing.lock().unwrap();
            let now = Instant::now();
            let mut notify = |c: Arc<Connection>| self.ready_queue.push(c);
            let capacity = self.config.player_reliable_receive_window_size;
            let outcomes = crate::receive::drain_reliable(&conn, capacity, now, &mut notify, &*self.collaborators.lag);

            for outcome in outcomes {
                if let crate::receive::ReceiveOutcome::Delivered(payload, _flags) = outcome {
                    if let Some(player) = conn.player {
                        self.collaborators.main_queue.post(player, payload);
                    }
                }
            }
        }
    }

    /// Feeds one received datagram through the receive pipeline. Called by
    /// the embedder's receive loop once per readable datagram.
    pub fn on_datagram(&self, remote: SocketAddr, listen_index: usize, mut data: Vec<u8>) {
        self.global_packets_received.fetch_add(1, Ordering::Relaxed);

        if crate::wire::is_connect_init(&data) {
            let conn = self.table.lookup(&remote);
            if conn.is_none() || conn.as_ref().unwrap().state() != crate::connection::ConnectionState::Connected {
                let client_type = data.get(2).copied().unwrap_or(0);
                self.init_handlers.dispatch(client_type, remote, listen_index);
            }
            return;
        }

        let conn = match self.table.lookup(&remote) {
            Some(c) => c,
            None => return,
        };

        if let Some(player) = conn.player {
            if self.collaborators.players.is_leaving(player) {
                return;
            }
        }

        if !crate::receive::decrypt_in_place(&conn, &mut data) {
            warn!(remote = %remote, "decrypt failed, dropping");
            return;
        }

        conn.stamp_received(Instant::now());
        conn.packets_received.fetch_add(1, Ordering::Relaxed);
        conn.bytes_received.fetch_add(data.len() as u64, Ordering::Relaxed);

        let mut notify = |c: Arc<Connection>| self.ready_queue.push(c);
        let outcome = crate::receive::process_buffer(
            &conn,
            &data,
            crate::receive::ReceiveFlags::default(),
            Instant::now(),
            &mut notify,
            &*self.collaborators.lag,
        );

        if let crate::receive::ReceiveOutcome::Delivered(payload, _flags) = outcome {
            if let Some(player) = conn.player {
                self.collaborators.main_queue.post(player, payload);
            }
        }
    }

    /// Accepts a newly-initialized connection for a client that passed the
    /// listen's allowlist. Returns the existing connection's player if one is
    /// already `Connected` for `remote`, so a retried init packet while the
    /// client waits for its first init-ack never allocates a second player.
    pub fn new_connection(
        &self,
        client_type: u8,
        remote: SocketAddr,
        listen_index: usize,
        limiter: Box<dyn BandwidthLimiter>,
        encryptor: (String, Box<dyn Encryptor>),
    ) -> Option<PlayerId> {
        let listen = self.config.listens.get(listen_index)?;
        let allowed = (client_type == 0 && listen.allow_vie) || (client_type == 1 && listen.allow_cont);
        if !allowed {
            return None;
        }

        if let Some(existing) = self.table.lookup(&remote) {
            if existing.state() == crate::connection::ConnectionState::Connected {
                return existing.player;
            }
        }

        let player = self.collaborators.players.allocate(remote, client_type)?;
        let window = self.config.player_reliable_receive_window_size as u32;
        self.table.insert_or_get(remote, || {
            let mut conn = Connection::new(remote, listen_index, window, limiter, encryptor);
            conn.player = Some(player);
            Arc::new(conn)
        });
        info!(remote = %remote, player, "connection established");
        Some(player)
    }

    /// Answers a simple (4-byte) ping probe, refreshing the cached population
    /// snapshot from the arena collaborator if due.
    pub fn respond_simple_ping(&self, request: &[u8; 4], now: Instant) -> [u8; 8] {
        let mut cache = self.ping_cache.lock().unwrap();
        cache.refresh(&*self.collaborators.arenas, now);
        self.global_pings.fetch_add(1, Ordering::Relaxed);
        crate::ping::respond_simple(&mut cache, request, self.config.simple_ping_population_mode, now)
    }

    /// Answers an extended (8-byte) ping probe.
    pub fn respond_extended_ping(&self, request: &[u8; 8], now: Instant) -> Vec<u8> {
        let mut cache = self.ping_cache.lock().unwrap();
        cache.refresh(&*self.collaborators.arenas, now);
        self.global_pings.fetch_add(1, Ordering::Relaxed);
        crate::ping::respond_extended(&cache, request)
    }

    /// Unencrypted send, used for connection-init responses. Actual socket
    /// write is the caller's `DatagramIo` instance.
    pub fn really_raw_send(&self, io: &crate::io::DatagramIo, listen_index: usize, remote: SocketAddr, bytes: &[u8]) -> std::io::Result<usize> {
        io.really_raw_send(listen_index, remote, bytes)
    }

    /// Sends `bytes` to one connection under `flags`. Returns a datagram for
    /// the caller to write immediately if the urgent fast path fired;
    /// otherwise the bytes were queued for the next send pass.
    pub fn send_to_one(&self, conn: &Connection, bytes: &[u8], flags: SendFlags) -> Option<crate::send::OutboundDatagram> {
        crate::send::send_to_one(conn, bytes, flags)
    }

    /// Sends `bytes` to every connection in `targets`. Returns the datagrams
    /// any urgent fast-path sends produced, for the caller to write
    /// immediately; the rest were queued for the next send pass.
    pub fn send_to_set(&self, targets: &[Arc<Connection>], bytes: &[u8], flags: SendFlags) -> Vec<crate::send::OutboundDatagram> {
        targets
            .iter()
            .filter_map(|conn| crate::send::send_to_one(conn, bytes, flags))
            .collect()
    }

    /// Sends a reliable packet with a completion callback.
    pub fn send_with_callback<F>(&self, conn: &Connection, bytes: &[u8], callback: F)
    where
        F: FnOnce(crate::callbacks::CallbackOutcome) + Send + 'static,
    {
        crate::send::send_with_callback(conn, bytes, callback);
    }

    /// Starts an outbound sized send. Returns `false` if the sized-send
    /// feature is disabled or the connection is leaving.
    pub fn send_sized(&self, conn: &Connection, total_length: u64) -> bool {
        if !self.config.sized_send_outgoing {
            return false;
        }
        crate::sizedsend::register(conn, total_length)
    }

    /// Registers an application handler for `packet_type`.
    pub fn add_packet_handler(&self, packet_type: u8, handler: PacketHandler) {
        self.packet_handlers.write().unwrap().insert(packet_type, handler);
    }

    /// Unregisters the handler for `packet_type`.
    pub fn remove_packet_handler(&self, packet_type: u8) {
        self.packet_handlers.write().unwrap().remove(&packet_type);
    }

    /// Registers an application handler for sized packets of `packet_type`.
    pub fn add_sized_packet_handler(&self, packet_type: u8, handler: SizedPacketHandler) {
        self.sized_handlers.write().unwrap().insert(packet_type, handler);
    }

    /// Unregisters the sized-packet handler for `packet_type`.
    pub fn remove_sized_packet_handler(&self, packet_type: u8) {
        self.sized_handlers.write().unwrap().remove(&packet_type);
    }

    /// Appends a connection-init handler to the dispatch chain.
    pub fn append_connection_init_handler(&self, handler: crate::table::InitHandler) {
        self.init_handlers.append(handler);
    }

    /// Global counters exposed for stats tooling.
    pub fn global_packets_sent(&self) -> u64 {
        self.global_packets_sent.load(Ordering::Relaxed)
    }

    pub fn global_packets_received(&self) -> u64 {
        self.global_packets_received.load(Ordering::Relaxed)
    }

    pub fn connection_count(&self) -> usize {
        self.table.len()
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn table(&self) -> &Arc<ConnectionTable> {
        &self.table
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::test_doubles::RecordingPlayerManager;
    use crate::stats::PopulationStats;

    struct NoopArenas;
    impl ArenaManager for NoopArenas {
        fn global_population(&self) -> PopulationStats {
            PopulationStats::default()
        }
        fn arena_summary_blob(&self) -> Vec<u8> {
            vec![0]
        }
    }

    struct NoopLag;
    impl LagCollector for NoopLag {
        fn rel_stats(&self, _player: PlayerId, _retries: u64, _drops: u64) {}
        fn rel_delay(&self, _player: PlayerId, _millis: u32) {}
        fn time_sync(&self, _player: PlayerId, _recv: u32, _sent: u32) {}
    }

    #[derive(Default)]
    struct RecordingQueue {
        posted: Mutex<Vec<(PlayerId, Vec<u8>)>>,
    }
    impl MainThreadQueue for RecordingQueue {
        fn post(&self, player: PlayerId, payload: Vec<u8>) -> bool {
            self.posted.lock().unwrap().push((player, payload));
            true
        }
    }

    fn test_config() -> CoreConfig {
        let mut cfg = CoreConfig::default();
        cfg.listens.push(crate::config::ListenConfig {
            port: 2000,
            bind_address: "127.0.0.1".parse().unwrap(),
            connect_as: "zone".into(),
            allow_vie: true,
            allow_cont: true,
        });
        cfg
    }

    fn test_collaborators() -> Collaborators {
        Collaborators {
            players: Arc::new(RecordingPlayerManager::default()),
            arenas: Arc::new(NoopArenas),
            lag: Arc::new(NoopLag),
            main_queue: Arc::new(RecordingQueue::default()),
        }
    }

    #[test]
    fn rejects_invalid_config() {
        let result = CoreTransport::new(CoreConfig::default(), test_collaborators());
        assert!(result.is_err());
    }

    #[test]
    fn new_connection_allocates_a_player_for_allowed_client_type() {
        let transport = CoreTransport::new(test_config(), test_collaborators()).unwrap();
        let player = transport.new_connection(
            0,
            "127.0.0.1:10000".parse().unwrap(),
            0,
            Box::new(crate::limiter::TokenBucketLimiter::new(1_000.0, 1_000, 32)),
            ("none".to_string(), Box::new(crate::encrypt::NullEncryptor)),
        );
        assert!(player.is_some());
        assert_eq!(transport.connection_count(), 1);
    }

    #[test]
    fn repeated_init_for_an_already_connected_remote_is_idempotent() {
        use std::sync::atomic::Ordering;

        let players = Arc::new(RecordingPlayerManager::default());
        let collaborators = Collaborators {
            players: players.clone(),
            ..test_collaborators()
        };
        let transport = CoreTransport::new(test_config(), collaborators).unwrap();
        let remote: SocketAddr = "127.0.0.1:10002".parse().unwrap();

        let make_limiter = || -> Box<dyn crate::limiter::BandwidthLimiter> {
            Box::new(crate::limiter::TokenBucketLimiter::new(1_000.0, 1_000, 32))
        };

        let first = transport.new_connection(
            0,
            remote,
            0,
            make_limiter(),
            ("none".to_string(), Box::new(crate::encrypt::NullEncryptor)),
        );
        let second = transport.new_connection(
            0,
            remote,
            0,
            make_limiter(),
            ("none".to_string(), Box::new(crate::encrypt::NullEncryptor)),
        );

        assert!(first.is_some());
        assert_eq!(first, second);
        assert_eq!(transport.connection_count(), 1);
        assert_eq!(players.next_id.load(Ordering::SeqCst), 1);

        let conn = transport.table().lookup(&remote).unwrap();
        assert_eq!(conn.player, first);
    }

    #[test]
    fn new_connection_rejects_disallowed_client_type() {
        let mut cfg = test_config();
        cfg.listens[0].allow_cont = false;
        let transport = CoreTransport::new(cfg, test_collaborators()).unwrap();
        let player = transport.new_connection(
            1,
            "127.0.0.1:10001".parse().unwrap(),
            0,
            Box::new(crate::limiter::TokenBucketLimiter::new(1_000.0, 1_000, 32)),
            ("none".to_string(), Box::new(crate::encrypt::NullEncryptor)),
        );
        assert!(player.is_none());
    }
}
