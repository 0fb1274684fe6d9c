//! Sized-Send Engine: streams arbitrarily large application payloads as
//! reliable chunked packets with backpressure, pulling from an
//! application-provided callback rather than buffering the whole payload
//! up front.

use std::collections::VecDeque;

use crate::config::CoreConfig;
use crate::connection::{Connection, SizedSendDescriptor};
use crate::priority::SendFlags;
use crate::wire;

/// What a sized-send data-request callback returns for one pull. The callback
/// is run outside any connection lock, so blocking I/O inside it is fine.
pub enum SizedSendChunk {
    /// More data follows; `self.offset` should advance by `data.len()`.
    Data(Vec<u8>),
    /// No more data; the sized send is complete.
    Done,
}

/// Registers a new outbound sized send. Returns `false` if the connection is
/// leaving the zone and the send was refused.
pub fn register(conn: &Connection, total_length: u64) -> bool {
    let mut list = conn.sized_send.lock().unwrap();
    list.push_back(SizedSendDescriptor {
        total_length,
        offset: 0,
        cancelled: false,
        cancelled_by_peer: false,
    });
    true
}

/// Drains the head-of-line sized send for `conn`, pulling chunks from
/// `request` until the per-pass threshold is hit or the send completes/cancels.
/// `request` is called with `(remaining, max_bytes)` and must not block on
/// anything that needs a connection lock.
pub fn drain_one<F>(conn: &Connection, config: &CoreConfig, mut request: F)
where
    F: FnMut(u64, usize) -> SizedSendChunk,
{
    let already_queued = queued_sized_chunks(conn);
    if already_queued >= config.sized_queue_threshold {
        return;
    }

    let (total_length, offset, cancelled) = {
        let list = conn.sized_send.lock().unwrap();
        match list.front() {
            Some(d) => (d.total_length, d.offset, d.cancelled),
            None => return,
        }
    };

    if cancelled {
        finish_cancelled(conn, &mut request);
        return;
    }

    let remaining = total_length.saturating_sub(offset);
    if remaining == 0 {
        finish_complete(conn, &mut request);
        return;
    }

    let needed = remaining.min((config.sized_queue_packets * wire::SIZED_CHUNK_SIZE) as u64);
    let chunk = request(remaining, needed as usize);

    match chunk {
        SizedSendChunk::Done => finish_complete(conn, &mut request),
        SizedSendChunk::Data(buf) => {
            enqueue_chunks(conn, total_length, &buf);
            if let Some(d) = conn.sized_send.lock().unwrap().front_mut() {
                d.offset += buf.len() as u64;
            }
        }
    }
}

/// Chunks enqueued but not yet resolved (acked or dropped), tracked by
/// `conn.sized_send_queued` rather than by counting the unsent queue: that
/// queue drains into the reliable priority queue on the order of
/// milliseconds, well before a chunk is actually acked, so counting its
/// occupancy would make the threshold gate almost nothing.
fn queued_sized_chunks(conn: &Connection) -> usize {
    conn.sized_send_queued.load(std::sync::atomic::Ordering::Relaxed)
}

fn enqueue_chunks(conn: &Connection, total_length: u64, buf: &[u8]) {
    let mut out = conn.outgoing.lock().unwrap();
    for chunk in buf.chunks(wire::SIZED_CHUNK_SIZE) {
        let mut framed = Vec::new();
        wire::write_sized_data(&mut framed, total_length as u32, chunk);
        let mut pkt = crate::connection::QueuedPacket::new(
            framed,
            SendFlags {
                reliable: true,
                ..Default::default()
            },
        );
        let counter = conn.sized_send_queued.clone();
        counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        pkt.callback.set(move |_outcome| {
            counter.fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
        });
        out.unsent_reliable.push_back(pkt);
    }
}

fn finish_complete<F>(conn: &Connection, request: &mut F)
where
    F: FnMut(u64, usize) -> SizedSendChunk,
{
    let _ = request(0, 0);
    conn.sized_send.lock().unwrap().pop_front();
}

fn finish_cancelled<F>(conn: &Connection, request: &mut F)
where
    F: FnMut(u64, usize) -> SizedSendChunk,
{
    let by_peer = conn
        .sized_send
        .lock()
        .unwrap()
        .front()
        .map(|d| d.cancelled_by_peer)
        .unwrap_or(false);
    let _ = request(0, 0);
    conn.sized_send.lock().unwrap().pop_front();

    if by_peer {
        let mut out = conn.outgoing.lock().unwrap();
        let pkt = crate::connection::QueuedPacket::new(
            wire::SIZED_CANCELLED_PACKET.to_vec(),
            SendFlags {
                reliable: true,
                ..Default::default()
            },
        );
        out.unsent_reliable.push_back(pkt);
    }
}

/// Queues a `[0x00, 0x0B]` request asking the peer to abort its inbound sized
/// receive (used by the local application to cancel a send it initiated on
/// the other side, not the local [`register`]ed send).
pub fn request_remote_cancel(conn: &Connection) {
    let mut out = conn.outgoing.lock().unwrap();
    let pkt = crate::connection::QueuedPacket::new(
        wire::CANCEL_SIZED_RECEIVE_PACKET.to_vec(),
        SendFlags {
            reliable: true,
            ..Default::default()
        },
    );
    out.unsent_reliable.push_back(pkt);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encrypt::NullEncryptor;
    use crate::limiter::TokenBucketLimiter;

    fn test_connection() -> Connection {
        Connection::new(
            "127.0.0.1:9000".parse().unwrap(),
            0,
            32,
            Box::new(TokenBucketLimiter::new(1_000_000.0, 1_000_000, 32)),
            ("none".to_string(), Box::new(NullEncryptor)),
        )
    }

    #[test]
    fn drains_into_chunked_reliable_sends() {
        let conn = test_connection();
        let config = CoreConfig::default();
        register(&conn, 10);

        let payload = vec![0xAAu8; 10];
        let mut calls = 0;
        drain_one(&conn, &config, |_remaining, _max| {
            calls += 1;
            SizedSendChunk::Data(payload.clone())
        });

        assert_eq!(calls, 1);
        let out = conn.outgoing.lock().unwrap();
        assert_eq!(out.unsent_reliable.len(), 1);
        let (total, chunk) = wire::parse_sized_data(&out.unsent_reliable[0].data).unwrap();
        assert_eq!(total, 10);
        assert_eq!(chunk, &payload[..]);
    }

    #[test]
    fn threshold_blocks_further_pulls_until_chunk_callbacks_resolve() {
        use crate::callbacks::CallbackOutcome;
        use std::sync::atomic::Ordering;

        let conn = test_connection();
        let config = CoreConfig::default();
        register(&conn, 100_000);

        let mut calls = 0;
        drain_one(&conn, &config, |_remaining, max| {
            calls += 1;
            SizedSendChunk::Data(vec![0xBBu8; max])
        });
        assert_eq!(calls, 1);

        let queued_after_first_pull = conn.sized_send_queued.load(Ordering::Relaxed);
        assert!(queued_after_first_pull >= config.sized_queue_threshold);

        drain_one(&conn, &config, |_remaining, max| {
            calls += 1;
            SizedSendChunk::Data(vec![0xBBu8; max])
        });
        assert_eq!(calls, 1, "threshold should have blocked the second pull");

        for pkt in conn.outgoing.lock().unwrap().unsent_reliable.iter_mut() {
            pkt.callback.fire(CallbackOutcome::Acked);
        }
        assert_eq!(conn.sized_send_queued.load(Ordering::Relaxed), 0);

        drain_one(&conn, &config, |_remaining, max| {
            calls += 1;
            SizedSendChunk::Data(vec![0xBBu8; max])
        });
        assert_eq!(calls, 2, "pulls should resume once chunks are resolved");
    }

    #[test]
    fn completion_notifies_with_empty_buffer_and_removes_descriptor() {
        let conn = test_connection();
        let config = CoreConfig::default();
        register(&conn, 0);

        let mut notified_empty = false;
        drain_one(&conn, &config, |_remaining, _max| {
            notified_empty = true;
            SizedSendChunk::Done
        });

        assert!(notified_empty);
        assert!(conn.sized_send.lock().unwrap().is_empty());
    }
}
