//! Send Pipeline: priority-ordered outgoing queues, reliable sequencing,
//! grouped-packet composition, and the retry scheduler.
//!
//! [`send_pass`] is what the dedicated send worker calls once per connection,
//! every 10ms, under the connection's `outgoing_lock`.

use std::time::{Duration, Instant};

use tracing::warn;

use crate::config::CoreConfig;
use crate::connection::{Connection, OutgoingState, QueuedPacket};
use crate::priority::{BandwidthPriority, SendFlags, PRIORITY_ORDER};
use crate::wire;

/// Lower/upper bound on the reliable retry timeout.
const RETRY_TIMEOUT_MIN_MS: f64 = 250.0;
const RETRY_TIMEOUT_MAX_MS: f64 = 2000.0;

/// One physical datagram the send pass produced, ready for [`crate::io`] to
/// write to the wire.
pub struct OutboundDatagram {
    pub bytes: Vec<u8>,
}

/// Runs one send pass for `conn`: flushes acks, promotes unsent reliable
/// packets, then drains each priority queue in order. Returns the datagrams
/// to actually write to the socket.
pub fn send_pass(conn: &Connection, config: &CoreConfig, now: Instant) -> Vec<OutboundDatagram> {
    let mut out = conn.outgoing.lock().unwrap();

    flush_acks(conn, &mut out);
    promote_unsent_reliable(&mut out, config);

    let mut datagrams = Vec::new();
    for priority in PRIORITY_ORDER {
        run_priority_queue(conn, &mut out, priority, now, config, &mut datagrams);
    }

    if out.outlist_size() > config.max_outlist_size {
        out.hit_max_outlist = true;
    }

    datagrams
}

/// Moves any acks queued by the receive pipeline into the `Ack` priority
/// queue, so they bypass unreliable queue back-pressure.
fn flush_acks(conn: &Connection, out: &mut OutgoingState) {
    let mut pending = conn.acks_pending.lock().unwrap();
    for seq in pending.drain(..) {
        let bytes = wire::write_ack(seq).to_vec();
        let pkt = QueuedPacket::new(bytes, SendFlags::default());
        out.queues[BandwidthPriority::Ack.index()].push_back(pkt);
    }
}

/// Step 1: assigns sequence numbers to unsent reliable packets, combining
/// adjacent small ones into a grouped-reliable frame when it pays off.
fn promote_unsent_reliable(out: &mut OutgoingState, config: &CoreConfig) {
    let send_window = out.limiter.send_window_size() as i64;
    let reliable_idx = BandwidthPriority::Reliable.index();
    let max_grouping = config.max_reliable_grouping_size();

    loop {
        let in_flight = out.queues[reliable_idx].len() as i64;
        if in_flight >= send_window {
            break;
        }
        if out.unsent_reliable.is_empty() {
            break;
        }

        let combine = out.unsent_reliable.len() >= 2
            && out.unsent_reliable[0].data.len() <= wire::MAX_GROUPED_ITEM_LEN
            && out.unsent_reliable[1].data.len() <= wire::MAX_GROUPED_ITEM_LEN
            && grouped_size(&out.unsent_reliable, 2) <= max_grouping;

        if combine {
            let packet = build_grouped_reliable(out, max_grouping);
            out.queues[reliable_idx].push_back(packet);
        } else {
            let mut pkt = out.unsent_reliable.pop_front().unwrap();
            let seq = out.s2cn;
            out.s2cn += 1;
            let mut framed = Vec::with_capacity(wire::RELIABLE_HEADER_LEN + pkt.data.len());
            wire::write_reliable(&mut framed, seq, &pkt.data);
            pkt.data = framed;
            pkt.seq = Some(seq);
            out.queues[reliable_idx].push_back(pkt);
        }
    }
}

fn grouped_size(unsent: &std::collections::VecDeque<QueuedPacket>, take: usize) -> usize {
    let inner: usize = unsent.iter().take(take).map(|p| 1 + p.data.len()).sum();
    wire::RELIABLE_HEADER_LEN + 2 + inner
}

/// Greedily packs as many leading unsent-reliable packets as fit within
/// `max_grouping`, chaining their callbacks onto the combined packet.
fn build_grouped_reliable(out: &mut OutgoingState, max_grouping: usize) -> QueuedPacket {
    let seq = out.s2cn;
    out.s2cn += 1;

    let mut inner_items: Vec<Vec<u8>> = Vec::new();
    let mut chained_callbacks = Vec::new();
    let mut running_len = wire::RELIABLE_HEADER_LEN + 2;

    while let Some(front) = out.unsent_reliable.front() {
        if front.data.len() > wire::MAX_GROUPED_ITEM_LEN {
            break;
        }
        let candidate_len = running_len + 1 + front.data.len();
        if candidate_len > max_grouping {
            break;
        }
        let pkt = out.unsent_reliable.pop_front().unwrap();
        running_len = candidate_len;
        inner_items.push(pkt.data);
        chained_callbacks.push(pkt.callback);
    }

    let mut body = Vec::new();
    body.push(wire::CORE_PREFIX);
    body.push(wire::SUBTYPE_GROUPED);
    for item in &inner_items {
        body.push(item.len() as u8);
        body.extend_from_slice(item);
    }

    let mut framed = Vec::with_capacity(wire::RELIABLE_HEADER_LEN + body.len());
    wire::write_reliable(&mut framed, seq, &body);

    let mut pkt = QueuedPacket::new(framed, SendFlags {
        reliable: true,
        ..Default::default()
    });
    pkt.seq = Some(seq);
    pkt.callback.set(move |outcome| {
        for mut cb in chained_callbacks {
            cb.fire(outcome);
        }
    });
    pkt
}

/// Retry timeout for a reliable packet.
pub fn retry_timeout_ms(avg_rtt_ms: f64, avg_rtt_dev_ms: f64) -> f64 {
    (avg_rtt_ms + 4.0 * avg_rtt_dev_ms).clamp(RETRY_TIMEOUT_MIN_MS, RETRY_TIMEOUT_MAX_MS)
}

/// Steps 2-3 for one priority queue.
fn run_priority_queue(
    conn: &Connection,
    out: &mut OutgoingState,
    priority: BandwidthPriority,
    now: Instant,
    config: &CoreConfig,
    datagrams: &mut Vec<OutboundDatagram>,
) {
    let idx = priority.index();
    let retry_timeout = retry_timeout_ms(out.avg_rtt_ms, out.avg_rtt_dev_ms);
    let mut i = 0;
    let mut to_remove = Vec::new();
    let mut abort_connection = false;

    while i < out.queues[idx].len() {
        if abort_connection {
            break;
        }
        let pkt = &out.queues[idx][i];
        let reliable = pkt.flags.reliable;

        if reliable && pkt.tries > 0 {
            let wait = retry_timeout * pkt.tries as f64;
            let elapsed = pkt
                .last_try
                .map(|t| now.saturating_duration_since(t).as_millis() as f64)
                .unwrap_or(f64::MAX);
            if elapsed < wait {
                i += 1;
                continue;
            }
        }

        if reliable && pkt.tries > config.max_retries {
            out.hit_max_retries = true;
            abort_connection = true;
            warn!(remote = %conn.remote, "reliable packet exceeded max retries");
            break;
        }

        // Grouped-reliable frames are already assembled whole above, so
        // per-packet overhead is charged uniformly here rather than per
        // incremental grouped-frame append.
        let cost = pkt.data.len() + config.per_packet_overhead;

        out.limiter.iter(now);
        if !out.limiter.check(cost, priority) {
            if pkt.flags.droppable {
                to_remove.push(i);
            }
            i += 1;
            continue;
        }

        if pkt.tries > 0 {
            out.retries += 1;
            out.limiter.adjust_for_retry();
        }

        let bytes = pkt.data.clone();
        out.packets_sent += 1;
        out.bytes_sent += bytes.len() as u64;
        datagrams.push(OutboundDatagram { bytes });

        let pkt = &mut out.queues[idx][i];
        pkt.tries += 1;
        pkt.last_try = Some(now);

        if !reliable {
            to_remove.push(i);
        }
        i += 1;
    }

    for &index in to_remove.iter().rev() {
        let mut pkt = out.queues[idx].remove(index).unwrap();
        if pkt.flags.droppable {
            pkt.callback.fire(crate::callbacks::CallbackOutcome::Dropped);
        }
    }
}

/// Fragments oversize payloads via big-data, otherwise buffers via
/// [`send_or_buffer`]. Returns the datagram to write immediately if the
/// urgent fast path fired; otherwise the payload was queued for the next
/// [`send_pass`] and the caller has nothing to write yet.
pub fn send_to_one(conn: &Connection, payload: &[u8], flags: SendFlags) -> Option<OutboundDatagram> {
    let oversize = if flags.reliable {
        payload.len() > wire::UNRELIABLE_PAYLOAD_LIMIT - wire::RELIABLE_HEADER_LEN
    } else {
        payload.len() > wire::UNRELIABLE_PAYLOAD_LIMIT
    };

    if oversize {
        send_as_big_data(conn, payload);
        None
    } else {
        send_or_buffer(conn, payload.to_vec(), flags)
    }
}

fn send_as_big_data(conn: &Connection, payload: &[u8]) {
    let mut out = conn.outgoing.lock().unwrap();
    let chunks = crate::bigdata::chunk(payload);
    let last_index = chunks.len().saturating_sub(1);
    for (i, chunk) in chunks.iter().enumerate() {
        let mut framed = Vec::new();
        wire::write_big_data(&mut framed, chunk, i == last_index);
        let pkt = QueuedPacket::new(framed, SendFlags {
            reliable: true,
            ..Default::default()
        });
        out.unsent_reliable.push_back(pkt);
    }
}

/// Fast-paths an urgent, non-reliable, limiter-admitted send by handing the
/// datagram straight back to the caller to write; otherwise queues at the
/// priority the flags select for the next [`send_pass`] to drain.
pub fn send_or_buffer(conn: &Connection, data: Vec<u8>, flags: SendFlags) -> Option<OutboundDatagram> {
    debug_assert!(
        !(flags.reliable && flags.droppable),
        "a reliable packet may never also be droppable"
    );

    let mut out = conn.outgoing.lock().unwrap();

    if flags.urgent && !flags.reliable {
        out.limiter.iter(Instant::now());
        if out.limiter.check(data.len() + 28, flags.priority()) {
            out.packets_sent += 1;
            out.bytes_sent += data.len() as u64;
            return Some(OutboundDatagram { bytes: data });
        }
    }

    if flags.reliable {
        out.unsent_reliable.push_back(QueuedPacket::new(data, flags));
    } else {
        let idx = flags.priority().index();
        out.queues[idx].push_back(QueuedPacket::new(data, flags));
    }
    None
}

/// A reliable send that must fit in one packet, with a completion callback
/// fired on ack or teardown.
pub fn send_with_callback<F>(conn: &Connection, payload: &[u8], callback: F)
where
    F: FnOnce(crate::callbacks::CallbackOutcome) + Send + 'static,
{
    debug_assert!(payload.len() <= wire::UNRELIABLE_PAYLOAD_LIMIT - wire::RELIABLE_HEADER_LEN);

    let mut out = conn.outgoing.lock().unwrap();
    let mut pkt = QueuedPacket::new(
        payload.to_vec(),
        SendFlags {
            reliable: true,
            ..Default::default()
        },
    );
    pkt.callback.set(callback);
    out.unsent_reliable.push_back(pkt);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encrypt::NullEncryptor;
    use crate::limiter::TokenBucketLimiter;

    fn test_connection() -> Connection {
        Connection::new(
            "127.0.0.1:8000".parse().unwrap(),
            0,
            32,
            Box::new(TokenBucketLimiter::new(1_000_000.0, 1_000_000, 32)),
            ("none".to_string(), Box::new(NullEncryptor)),
        )
    }

    fn test_config() -> CoreConfig {
        let mut cfg = CoreConfig::default();
        cfg.listens.push(crate::config::ListenConfig {
            port: 1000,
            bind_address: "127.0.0.1".parse().unwrap(),
            connect_as: "zone".into(),
            allow_vie: true,
            allow_cont: true,
        });
        cfg
    }

    #[test]
    fn reliable_send_gets_sequenced_and_emitted() {
        let conn = test_connection();
        send_or_buffer(
            &conn,
            b"hello".to_vec(),
            SendFlags {
                reliable: true,
                ..Default::default()
            },
        );
        let config = test_config();
        let datagrams = send_pass(&conn, &config, Instant::now());
        assert_eq!(datagrams.len(), 1);
        let (seq, payload) = wire::parse_reliable(&datagrams[0].bytes).unwrap();
        assert_eq!(seq, 0);
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn droppable_packet_denied_by_limiter_is_dropped_with_failure_callback() {
        use crate::callbacks::CallbackOutcome;
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let conn = Connection::new(
            "127.0.0.1:8001".parse().unwrap(),
            0,
            32,
            Box::new(TokenBucketLimiter::new(0.0, 0, 32)),
            ("none".to_string(), Box::new(NullEncryptor)),
        );
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();

        {
            let mut out = conn.outgoing.lock().unwrap();
            let mut pkt = QueuedPacket::new(
                b"x".to_vec(),
                SendFlags {
                    droppable: true,
                    ..Default::default()
                },
            );
            pkt.callback.set(move |outcome| {
                fired2.store(outcome == CallbackOutcome::Dropped, Ordering::SeqCst);
            });
            out.queues[BandwidthPriority::Unreliable.index()].push_back(pkt);
        }

        let config = test_config();
        let datagrams = send_pass(&conn, &config, Instant::now());
        assert!(datagrams.is_empty());
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn urgent_unreliable_send_admitted_by_limiter_returns_a_datagram_to_write() {
        let conn = test_connection();
        let sent = send_to_one(
            &conn,
            b"ping",
            SendFlags {
                urgent: true,
                ..Default::default()
            },
        );
        assert_eq!(sent.unwrap().bytes, b"ping");
        // Nothing was left behind in a queue: the caller already has the bytes.
        let out = conn.outgoing.lock().unwrap();
        assert_eq!(out.outlist_size(), 0);
    }

    #[test]
    fn urgent_unreliable_send_denied_by_limiter_falls_back_to_the_queue() {
        let conn = Connection::new(
            "127.0.0.1:8002".parse().unwrap(),
            0,
            32,
            Box::new(TokenBucketLimiter::new(0.0, 0, 32)),
            ("none".to_string(), Box::new(NullEncryptor)),
        );
        let sent = send_to_one(
            &conn,
            b"ping",
            SendFlags {
                urgent: true,
                ..Default::default()
            },
        );
        assert!(sent.is_none());
        let out = conn.outgoing.lock().unwrap();
        assert_eq!(out.queues[BandwidthPriority::Unreliable.index()].len(), 1);
    }

    #[test]
    fn retry_timeout_is_clamped() {
        assert_eq!(retry_timeout_ms(0.0, 0.0), RETRY_TIMEOUT_MIN_MS);
        assert_eq!(retry_timeout_ms(10_000.0, 10_000.0), RETRY_TIMEOUT_MAX_MS);
    }

    #[test]
    fn oversize_reliable_send_fragments_as_big_data() {
        let conn = test_connection();
        let payload = vec![0xABu8; 1000];
        send_to_one(
            &conn,
            &payload,
            SendFlags {
                reliable: true,
                ..Default::default()
            },
        );
        let out = conn.outgoing.lock().unwrap();
        assert!(out.unsent_reliable.len() > 1);
    }
}
