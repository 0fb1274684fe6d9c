//! Pluggable bandwidth-limiter contract plus a default token-bucket
//! implementation so the crate is independently testable without a real policy
//! provider wired in.

use std::time::Instant;

/// Diagnostic snapshot a limiter implementation can expose via [`BandwidthLimiter::info`].
#[derive(Debug, Clone, Default)]
pub struct LimiterInfo {
    /// Human-readable key/value pairs (e.g. "bandwidth" -> "12000 B/s").
    pub fields: Vec<(String, String)>,
}

impl LimiterInfo {
    /// Appends one field to the snapshot.
    pub fn push(&mut self, key: &str, value: impl std::fmt::Display) {
        self.fields.push((key.to_string(), value.to_string()));
    }
}

/// A per-connection bandwidth shaper. Implementations are provided externally;
/// congestion-control tuning beyond this contract is out of scope here.
/// [`TokenBucketLimiter`] below is the crate's own minimal default so tests
/// and small deployments do not need one.
pub trait BandwidthLimiter: Send {
    /// Advances the limiter's internal clock to `now`. Called once per send-pipeline
    /// pass, before any `check` calls for that pass.
    fn iter(&mut self, now: Instant);

    /// Returns true if `bytes` may be sent right now at `priority`, and debits the
    /// budget if so.
    fn check(&mut self, bytes: usize, priority: crate::priority::BandwidthPriority) -> bool;

    /// The receive-window size (in packets) this limiter is currently willing
    /// to advertise/accept, used to size the reliable send-window promotion.
    fn send_window_size(&self) -> u32;

    /// Called when an ack arrives for a reliable packet's first send attempt: grow
    /// the window.
    fn adjust_for_ack(&mut self);

    /// Called when a reliable packet is retried: shrink the window / back off.
    fn adjust_for_retry(&mut self);

    /// Fills in a diagnostic snapshot for stats accessors.
    fn info(&self, out: &mut LimiterInfo);
}

/// A simple token-bucket limiter: tokens accrue at a fixed byte rate and are
/// spent by `check`, with retries halving the rate (capped) and acks restoring
/// it, and the advertised window scaling with the current rate.
pub struct TokenBucketLimiter {
    bytes_per_sec: f64,
    bucket_capacity: usize,
    tokens: f64,
    last_iter: Option<Instant>,
    base_window: u32,
}

impl TokenBucketLimiter {
    /// Creates a limiter that admits `bytes_per_sec` bytes/second, bursting up to
    /// `bucket_capacity` bytes, and advertises `base_window` reliable packets
    /// in flight at full rate.
    pub fn new(bytes_per_sec: f64, bucket_capacity: usize, base_window: u32) -> Self {
        Self {
            bytes_per_sec,
            bucket_capacity,
            tokens: bucket_capacity as f64,
            last_iter: None,
            base_window,
        }
    }
}

impl BandwidthLimiter for TokenBucketLimiter {
    fn iter(&mut self, now: Instant) {
        if let Some(last) = self.last_iter {
            let elapsed = now.saturating_duration_since(last).as_secs_f64();
            self.tokens = (self.tokens + elapsed * self.bytes_per_sec)
                .min(self.bucket_capacity as f64);
        }
        self.last_iter = Some(now);
    }

    fn check(&mut self, bytes: usize, priority: crate::priority::BandwidthPriority) -> bool {
        if priority == crate::priority::BandwidthPriority::Ack {
            return true;
        }
        if self.tokens >= bytes as f64 {
            self.tokens -= bytes as f64;
            true
        } else {
            false
        }
    }

    fn send_window_size(&self) -> u32 {
        let scale = (self.tokens / self.bucket_capacity.max(1) as f64).max(0.1);
        ((self.base_window as f64) * scale).max(4.0) as u32
    }

    fn adjust_for_ack(&mut self) {
        self.tokens = (self.tokens + 64.0).min(self.bucket_capacity as f64);
    }

    fn adjust_for_retry(&mut self) {
        self.tokens = (self.tokens * 0.5).max(0.0);
    }

    fn info(&self, out: &mut LimiterInfo) {
        out.push("bytes_per_sec", self.bytes_per_sec);
        out.push("bucket_capacity", self.bucket_capacity);
        out.push("tokens", self.tokens as u64);
    }
}
