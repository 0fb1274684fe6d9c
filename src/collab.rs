//! Contracts for the external collaborators this core consumes but does not own:
//! player lifecycle, arena population, lag statistics, and the application's
//! main-thread queue.
//!
//! None of these are implemented here beyond trivial/test doubles — a real
//! deployment wires in its own player manager, arena manager, etc. Keeping them
//! as traits lets the transport core be built, tested, and ground completely
//! independently of game-layer concerns.

use std::net::SocketAddr;

use crate::stats::PopulationStats;

/// A stable, non-owning handle to a connection's associated player object.
pub type PlayerId = u64;

/// Why a connection is being torn down, passed to [`PlayerManager::kick`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KickReason {
    /// The peer sent a graceful disconnect (`00 07`).
    PeerDisconnected,
    /// `now - last_receive_timestamp > drop_timeout`.
    NoDataTimeout,
    /// A reliable packet exceeded `max_retries`.
    MaxRetries,
    /// The outgoing queue exceeded `max_outlist_size`.
    MaxOutlist,
    /// The module is shutting down.
    Shutdown,
}

/// External player lifecycle manager, consulted on connection birth and kick.
pub trait PlayerManager: Send + Sync {
    /// Allocates a new player object for a freshly-accepted connection, returning
    /// its id, or `None` to refuse the connection (e.g. zone full).
    fn allocate(&self, remote: SocketAddr, client_type: u8) -> Option<PlayerId>;

    /// Schedules `player` for removal with `reason`. Must not block; the actual
    /// teardown runs on the application's main thread.
    fn kick(&self, player: PlayerId, reason: KickReason);

    /// True if `player` has progressed past `LeavingZone` and should no longer
    /// accept inbound packets.
    fn is_leaving(&self, player: PlayerId) -> bool;
}

/// External arena/population summary provider, backing the ping responder.
pub trait ArenaManager: Send + Sync {
    /// Snapshot of total/playing population across the whole zone, including any
    /// federated peer-zone counts.
    fn global_population(&self) -> PopulationStats;

    /// Per-arena population, grouped by the arena's base name, serialized as
    /// `name\0 total16_le playing16_le` entries terminated by a single zero byte.
    fn arena_summary_blob(&self) -> Vec<u8>;
}

/// Lag/latency sample sink: reliability stats, round-trip delay, and time-sync
/// samples.
pub trait LagCollector: Send + Sync {
    /// A reliability sample: retries and drops observed for one connection.
    fn rel_stats(&self, player: PlayerId, retries: u64, drops: u64);

    /// A one-shot reliable round-trip delay sample, in milliseconds.
    fn rel_delay(&self, player: PlayerId, millis: u32);

    /// A time-sync exchange sample.
    fn time_sync(&self, player: PlayerId, client_pkts_recv: u32, client_pkts_sent: u32);
}

/// Bounded work queue feeding the application's single main thread. Non-core
/// payloads are posted here by the receive pipeline rather than processed
/// inline.
pub trait MainThreadQueue: Send + Sync {
    /// Enqueues one application payload for `player`, returning `false` if the
    /// queue is full and the payload was dropped.
    fn post(&self, player: PlayerId, payload: Vec<u8>) -> bool;
}

/// 32-bit PRNG collaborator, kept behind a trait so deterministic test doubles
/// can replace the real generator.
pub trait Prng: Send {
    /// Returns the next pseudo-random 32-bit value.
    fn next_u32(&mut self) -> u32;
}

impl Prng for rand::rngs::StdRng {
    fn next_u32(&mut self) -> u32 {
        use rand::RngCore;
        RngCore::next_u32(self)
    }
}

#[cfg(test)]
pub(crate) mod test_doubles {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct RecordingPlayerManager {
        pub next_id: AtomicU64,
        pub kicks: Mutex<Vec<(PlayerId, KickReason)>>,
    }

    impl PlayerManager for RecordingPlayerManager {
        fn allocate(&self, _remote: SocketAddr, _client_type: u8) -> Option<PlayerId> {
            Some(self.next_id.fetch_add(1, Ordering::SeqCst))
        }

        fn kick(&self, player: PlayerId, reason: KickReason) {
            self.kicks.lock().unwrap().push((player, reason));
        }

        fn is_leaving(&self, _player: PlayerId) -> bool {
            false
        }
    }
}
