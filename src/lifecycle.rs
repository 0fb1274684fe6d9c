//! Lifecycle / Disconnect: lagout detection and the TimeWait teardown
//! sequence, run as part of the send worker's periodic pass.

use std::time::{Duration, Instant};

use tracing::info;

use crate::collab::{KickReason, PlayerManager};
use crate::config::CoreConfig;
use crate::connection::{Connection, ConnectionState};
use crate::table::ConnectionTable;

/// Runs lagout detection for one connection, kicking it via `players` if any
/// condition fires. Returns the reason if a kick was issued.
pub fn check_lagout(
    conn: &Connection,
    config: &CoreConfig,
    players: &dyn PlayerManager,
    now: Instant,
) -> Option<KickReason> {
    let idle = Duration::from_millis(conn.millis_since_last_receive(now));
    let reason = if idle > config.drop_timeout {
        Some(KickReason::NoDataTimeout)
    } else {
        let out = conn.outgoing.lock().unwrap();
        if out.hit_max_retries {
            Some(KickReason::MaxRetries)
        } else if out.hit_max_outlist {
            Some(KickReason::MaxOutlist)
        } else {
            None
        }
    };

    if let Some(reason) = reason {
        if let Some(player) = conn.player {
            players.kick(player, reason);
        }
        conn.set_state(ConnectionState::TimeWait);
        info!(remote = %conn.remote, ?reason, "connection kicked");
    }

    reason
}

/// TimeWait teardown: cancels sized sends, waits for the sized worker to
/// drain them, sends the disconnect packet, clears buffers, and removes the
/// connection from the table.
///
/// The caller is expected to have already released all connection locks
/// before invocation and re-acquired them to re-check cancellation afterward;
/// this function performs the final, synchronous part of teardown.
pub fn teardown(conn: &Connection, table: &ConnectionTable) {
    {
        let mut sized = conn.sized_send.lock().unwrap();
        for descriptor in sized.iter_mut() {
            descriptor.cancelled = true;
        }
    }

    {
        let mut out = conn.outgoing.lock().unwrap();
        let pkt = crate::connection::QueuedPacket::new(
            crate::wire::DROP_PACKET.to_vec(),
            crate::priority::SendFlags::default(),
        );
        out.queues[crate::priority::BandwidthPriority::Ack.index()].push_back(pkt);
    }

    conn.big.lock().unwrap().sized_receive.reset();
    conn.reset();
    conn.set_state(ConnectionState::Closed);
    table.remove(&conn.remote);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::test_doubles::RecordingPlayerManager;
    use crate::encrypt::NullEncryptor;
    use crate::limiter::TokenBucketLimiter;
    use std::sync::atomic::Ordering;

    fn test_connection() -> Connection {
        Connection::new(
            "127.0.0.1:9500".parse().unwrap(),
            0,
            32,
            Box::new(TokenBucketLimiter::new(1_000.0, 1_000, 32)),
            ("none".to_string(), Box::new(NullEncryptor)),
        )
    }

    #[test]
    fn no_data_timeout_kicks_the_player() {
        let conn = test_connection();
        let players = RecordingPlayerManager::default();
        players.next_id.store(42, Ordering::SeqCst);

        let mut config = CoreConfig::default();
        config.drop_timeout = Duration::from_millis(0);

        let now = Instant::now() + Duration::from_secs(1);
        let reason = check_lagout(&conn, &config, &players, now);
        assert_eq!(reason, Some(KickReason::NoDataTimeout));
        assert_eq!(conn.state(), ConnectionState::TimeWait);
    }

    #[test]
    fn healthy_connection_is_not_kicked() {
        let conn = test_connection();
        let players = RecordingPlayerManager::default();
        let config = CoreConfig::default();
        conn.stamp_received(Instant::now());
        let reason = check_lagout(&conn, &config, &players, Instant::now());
        assert_eq!(reason, None);
        assert_eq!(conn.state(), ConnectionState::Connected);
    }

    #[test]
    fn teardown_removes_from_table_and_clears_state() {
        let table = ConnectionTable::new();
        let addr: std::net::SocketAddr = "127.0.0.1:9501".parse().unwrap();
        let conn = std::sync::Arc::new(Connection::new(
            addr,
            0,
            32,
            Box::new(TokenBucketLimiter::new(1_000.0, 1_000, 32)),
            ("none".to_string(), Box::new(NullEncryptor)),
        ));
        table.insert_or_get(addr, || conn.clone());

        teardown(&conn, &table);
        assert!(table.lookup(&addr).is_none());
        assert_eq!(conn.state(), ConnectionState::Closed);
    }
}
