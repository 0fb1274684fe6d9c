//! Sized-data receive reassembly: each `0x0A` chunk declares the total size of
//! the transfer it belongs to, so the receiver can accumulate without waiting
//! for an explicit terminator and can report progress as it goes.
//!
//! Unlike big-data, a sized receive may be cancelled mid-transfer by either
//! side (`0x0B`/`0x0C`); this module tracks that state too.

/// Current state of one inbound sized-data transfer.
pub enum SizedReceiveState {
    /// Accumulating chunks; `received` bytes of `total` seen so far.
    Receiving { total: u32, received: Vec<u8> },
    /// A cancel request was sent or received; further chunks are discarded.
    Cancelled,
}

/// Outcome of feeding one chunk to a [`SizedReceiver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SizedChunkResult {
    /// Still accumulating; not yet complete.
    InProgress,
    /// The transfer completed; here is the whole reassembled payload.
    Complete(Vec<u8>),
    /// `total_size` in this chunk didn't match the transfer's established
    /// total; treated as a malicious-traffic disposition that drops the
    /// connection.
    TotalMismatch,
    /// Chunk arrived for an already-cancelled transfer; ignored.
    Ignored,
}

/// Reassembles one direction's sized-data transfer.
pub struct SizedReceiver {
    state: Option<SizedReceiveState>,
}

impl SizedReceiver {
    /// A receiver with no transfer in progress.
    pub fn new() -> Self {
        Self { state: None }
    }

    /// Feeds one `0x0A` chunk's `(total_size, chunk_payload)`.
    pub fn push(&mut self, total_size: u32, chunk: &[u8]) -> SizedChunkResult {
        match &mut self.state {
            None => {
                let mut received = Vec::with_capacity(total_size as usize);
                received.extend_from_slice(chunk);
                if received.len() as u64 >= total_size as u64 {
                    received.truncate(total_size as usize);
                    self.state = None;
                    return SizedChunkResult::Complete(received);
                }
                self.state = Some(SizedReceiveState::Receiving {
                    total: total_size,
                    received,
                });
                SizedChunkResult::InProgress
            }
            Some(SizedReceiveState::Cancelled) => SizedChunkResult::Ignored,
            Some(SizedReceiveState::Receiving { total, received }) => {
                if *total != total_size {
                    self.state = None;
                    return SizedChunkResult::TotalMismatch;
                }
                received.extend_from_slice(chunk);
                if received.len() as u64 >= *total as u64 {
                    received.truncate(*total as usize);
                    let out = std::mem::take(received);
                    self.state = None;
                    SizedChunkResult::Complete(out)
                } else {
                    SizedChunkResult::InProgress
                }
            }
        }
    }

    /// Marks the transfer cancelled; subsequent chunks are ignored until `reset`.
    pub fn cancel(&mut self) {
        self.state = Some(SizedReceiveState::Cancelled);
    }

    /// Clears all state, ready for a fresh transfer.
    pub fn reset(&mut self) {
        self.state = None;
    }

    /// True if a transfer is currently in progress (not cancelled, not idle).
    pub fn is_active(&self) -> bool {
        matches!(self.state, Some(SizedReceiveState::Receiving { .. }))
    }
}

impl Default for SizedReceiver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_chunk_completes_immediately() {
        let mut recv = SizedReceiver::new();
        let result = recv.push(5, b"hello");
        assert_eq!(result, SizedChunkResult::Complete(b"hello".to_vec()));
        assert!(!recv.is_active());
    }

    #[test]
    fn accumulates_across_chunks() {
        let mut recv = SizedReceiver::new();
        assert_eq!(recv.push(11, b"hello "), SizedChunkResult::InProgress);
        assert!(recv.is_active());
        assert_eq!(recv.push(11, b"world"), SizedChunkResult::Complete(b"hello world".to_vec()));
    }

    #[test]
    fn mismatched_total_is_rejected() {
        let mut recv = SizedReceiver::new();
        recv.push(20, b"partial");
        assert_eq!(recv.push(99, b"more"), SizedChunkResult::TotalMismatch);
    }

    #[test]
    fn cancel_ignores_further_chunks() {
        let mut recv = SizedReceiver::new();
        recv.push(20, b"partial");
        recv.cancel();
        assert_eq!(recv.push(20, b"more"), SizedChunkResult::Ignored);
        recv.reset();
        assert_eq!(recv.push(4, b"next"), SizedChunkResult::Complete(b"next".to_vec()));
    }
}
