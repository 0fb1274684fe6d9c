//! Per-connection send priority classes.

/// The five priority send queues a connection maintains. `Ack` is always served
/// first; the remaining unreliable classes are tie-breaks for `PriorityN1`/`P4`/`P5`
/// flag bits, and `Reliable` is drained only after every unreliable class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BandwidthPriority {
    /// Acks bypass unreliable queue back-pressure entirely.
    Ack,
    /// High-priority unreliable traffic.
    UnreliableHigh,
    /// Default unreliable traffic.
    Unreliable,
    /// Low-priority unreliable traffic.
    UnreliableLow,
    /// Reliable traffic, sequenced and retried.
    Reliable,
}

/// Total number of priority classes.
pub const PRIORITY_COUNT: usize = 5;

/// All priority classes in service order (highest first).
pub const PRIORITY_ORDER: [BandwidthPriority; PRIORITY_COUNT] = [
    BandwidthPriority::Ack,
    BandwidthPriority::UnreliableHigh,
    BandwidthPriority::Unreliable,
    BandwidthPriority::UnreliableLow,
    BandwidthPriority::Reliable,
];

impl BandwidthPriority {
    /// Index into a fixed-size `[T; PRIORITY_COUNT]` array of per-priority queues.
    pub fn index(self) -> usize {
        match self {
            BandwidthPriority::Ack => 0,
            BandwidthPriority::UnreliableHigh => 1,
            BandwidthPriority::Unreliable => 2,
            BandwidthPriority::UnreliableLow => 3,
            BandwidthPriority::Reliable => 4,
        }
    }
}

/// Flags attached to an application send, selecting its priority class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SendFlags {
    /// The packet must be delivered, retried until acked, and never dropped for
    /// bandwidth reasons.
    pub reliable: bool,
    /// The packet may be silently dropped under bandwidth pressure. Never
    /// combined with `reliable`.
    pub droppable: bool,
    /// Bypass buffering and attempt a synchronous send if the limiter allows it.
    pub urgent: bool,
    /// Selects `UnreliableHigh` over `Unreliable`/`UnreliableLow` for a non-reliable send.
    pub priority_n1: bool,
    /// Selects `UnreliableLow` (`P4`) over `Unreliable`.
    pub p4: bool,
    /// Selects `UnreliableLow` (`P5`), same queue as `p4`, different wire flag bit.
    pub p5: bool,
}

impl SendFlags {
    /// Resolves the effective [`BandwidthPriority`] these flags select.
    pub fn priority(&self) -> BandwidthPriority {
        if self.reliable {
            BandwidthPriority::Reliable
        } else if self.priority_n1 {
            BandwidthPriority::UnreliableHigh
        } else if self.p4 || self.p5 {
            BandwidthPriority::UnreliableLow
        } else {
            BandwidthPriority::Unreliable
        }
    }
}
