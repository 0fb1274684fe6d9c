//! Reliable-send acknowledgement callbacks: callers may register a callback to
//! be invoked once a reliable packet is acked, or dropped on disconnect.
//!
//! Invoker objects are pooled rather than boxed fresh per send: a busy
//! connection may have hundreds of reliable packets in flight, and each one
//! owns an invoker slot until it is acked or the connection tears down.

/// Why a reliable-send callback fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackOutcome {
    /// The packet was acked by the peer.
    Acked,
    /// The connection was torn down before the packet was acked.
    Dropped,
}

/// A boxed, reusable slot for a reliable-send completion callback.
///
/// `take()` clears the slot after invoking its callback so a pooled invoker can
/// be handed back to [`crate::pool::Pool`] and reused for the next reliable send
/// without reallocating the closure storage.
#[derive(Default)]
pub struct CallbackInvoker {
    callback: Option<Box<dyn FnOnce(CallbackOutcome) + Send>>,
}

impl CallbackInvoker {
    /// An invoker with no callback registered; `fire` is then a no-op.
    pub fn empty() -> Self {
        Self { callback: None }
    }

    /// Registers `callback` to run exactly once, the next time `fire` is called.
    pub fn set<F>(&mut self, callback: F)
    where
        F: FnOnce(CallbackOutcome) + Send + 'static,
    {
        self.callback = Some(Box::new(callback));
    }

    /// Invokes and clears the registered callback, if any.
    pub fn fire(&mut self, outcome: CallbackOutcome) {
        if let Some(cb) = self.callback.take() {
            cb(outcome);
        }
    }

    /// True if no callback is currently registered.
    pub fn is_empty(&self) -> bool {
        self.callback.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU8, Ordering};
    use std::sync::Arc;

    #[test]
    fn fires_once_and_then_is_empty() {
        let seen = Arc::new(AtomicU8::new(0));
        let seen2 = seen.clone();
        let mut invoker = CallbackInvoker::empty();
        invoker.set(move |outcome| {
            seen2.store(
                match outcome {
                    CallbackOutcome::Acked => 1,
                    CallbackOutcome::Dropped => 2,
                },
                Ordering::SeqCst,
            );
        });
        assert!(!invoker.is_empty());
        invoker.fire(CallbackOutcome::Acked);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(invoker.is_empty());

        invoker.fire(CallbackOutcome::Dropped);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn empty_invoker_fire_is_noop() {
        let mut invoker = CallbackInvoker::empty();
        invoker.fire(CallbackOutcome::Dropped);
        assert!(invoker.is_empty());
    }
}
