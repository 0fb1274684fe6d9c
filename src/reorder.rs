//! Reliable-channel reorder buffer: delivers reliable packets to the
//! application in sequence order, holding out-of-order arrivals until the gap
//! in front of them closes or the window moves past them.
//!
//! The buffer is a fixed-capacity circular bitmap sized to the connection's
//! receive window (`player_reliable_receive_window_size` /
//! `client_connection_reliable_receive_window_size` in [`crate::config`]):
//! any sequence number within `[base_id, base_id + max_span)` may be admitted
//! and held until the gap in front of it closes, no matter how many other
//! sequence numbers are already held ahead of it.

use std::collections::VecDeque;

pub struct ReorderBuffer {
    /// `held[i]` is whether `base_id + i` has arrived, for `i` in `[0, max_span)`.
    held: VecDeque<bool>,
    base_id: u32,
    max_span: u32,
}

impl ReorderBuffer {
    /// Creates a buffer expecting `base_id` next, accepting sequence numbers up
    /// to `max_span` ahead of it.
    pub fn new(base_id: u32, max_span: u32) -> Self {
        Self {
            held: std::iter::repeat(false).take(max_span as usize).collect(),
            base_id,
            max_span,
        }
    }

    /// The next sequence number this buffer expects to deliver.
    pub fn base_id(&self) -> u32 {
        self.base_id
    }

    /// True if `seq` falls within the receive window and may be passed to `put`.
    pub fn can_put(&self, seq: u32) -> bool {
        seq.wrapping_sub(self.base_id) < self.max_span
    }

    /// Records the arrival of `seq`. `callback(seq, delivered)` fires once per
    /// sequence number that the buffer can now resolve: `delivered = true` for a
    /// sequence number that actually arrived, `false` for a gap the window has
    /// moved past without ever seeing (meaning it was lost and will not be
    /// retried, or was already delivered through some other path).
    pub fn put<F>(&mut self, seq: u32, mut callback: F)
    where
        F: FnMut(u32, bool),
    {
        debug_assert!(self.can_put(seq));

        let idx = seq.wrapping_sub(self.base_id) as usize;
        if self.held[idx] {
            return;
        }
        self.held[idx] = true;

        if idx == 0 {
            self.drain_contiguous(&mut callback);
        }
    }

    /// Delivers every held sequence number starting at `base_id` that forms an
    /// unbroken run, advancing `base_id` past each one.
    fn drain_contiguous<F>(&mut self, callback: &mut F)
    where
        F: FnMut(u32, bool),
    {
        while self.held.front() == Some(&true) {
            callback(self.base_id, true);
            self.held.pop_front();
            self.held.push_back(false);
            self.base_id = self.base_id.wrapping_add(1);
        }
    }

    /// True if `new_base_id` is a valid forward jump (resync) for `advance`.
    pub fn can_advance(&self, new_base_id: u32) -> bool {
        let delta = new_base_id.wrapping_sub(self.base_id);
        delta >= 1 && delta <= self.max_span
    }

    /// Force-advances `base_id` to `new_base_id` (used on receipt of a Resync
    /// packet), resolving every sequence number skipped or held in between via
    /// `callback(seq, delivered)` exactly as `put` does.
    pub fn advance<F>(&mut self, new_base_id: u32, mut callback: F)
    where
        F: FnMut(u32, bool),
    {
        debug_assert!(self.can_advance(new_base_id));

        while self.base_id != new_base_id {
            let delivered = self.held.pop_front().unwrap_or(false);
            callback(self.base_id, delivered);
            self.held.push_back(false);
            self.base_id = self.base_id.wrapping_add(1);
        }

        self.drain_contiguous(&mut callback);
    }
}
