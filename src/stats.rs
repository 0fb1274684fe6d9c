//! Per-connection diagnostic snapshots: round-trip, loss, and queue-depth
//! figures for the external lag collector and admin tooling.

use std::fmt;
use std::time::Duration;

/// A point-in-time snapshot of one connection's transport-layer health.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConnectionStats {
    /// Smoothed round-trip estimate.
    pub avg_rtt: Duration,
    /// Smoothed mean RTT deviation, used to size the retry timeout.
    pub avg_rtt_deviation: Duration,
    /// Reliable packets currently awaiting first send or retry.
    pub outlist_size: usize,
    /// Reliable packets sent at least once but not yet acked.
    pub unacked_count: usize,
    /// Total reliable retransmissions since connection establishment.
    pub retry_count: u64,
    /// Total packets received and accepted by the reorder buffer.
    pub packets_received: u64,
    /// Total packets dropped as duplicates or out-of-window.
    pub packets_dropped: u64,
    /// Milliseconds since the last packet was received from the peer.
    pub millis_since_last_packet: u64,
}

impl Default for ConnectionStats {
    fn default() -> Self {
        ConnectionStats {
            avg_rtt: Duration::from_millis(0),
            avg_rtt_deviation: Duration::from_millis(0),
            outlist_size: 0,
            unacked_count: 0,
            retry_count: 0,
            packets_received: 0,
            packets_dropped: 0,
            millis_since_last_packet: 0,
        }
    }
}

impl fmt::Display for ConnectionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rtt={:?} (+/-{:?}) outlist={} unacked={} retries={} rx={} drop={} idle={}ms",
            self.avg_rtt,
            self.avg_rtt_deviation,
            self.outlist_size,
            self.unacked_count,
            self.retry_count,
            self.packets_received,
            self.packets_dropped,
            self.millis_since_last_packet,
        )
    }
}

/// Aggregate figures across every connection on a listen, used by the simple
/// ping responder's population line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PopulationStats {
    /// All established connections, regardless of playing state.
    pub total: u32,
    /// Connections the application has marked as actively playing.
    pub playing: u32,
}

impl fmt::Display for PopulationStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} total, {} playing", self.total, self.playing)
    }
}
