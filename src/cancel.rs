use std::sync::atomic::{AtomicBool, Ordering};

/// Cooperative cancellation flag for series emission.
///
/// An event type opts in by embedding a `Cancellation` field and naming it
/// in its [`event_type!`](crate::event_type) declaration:
///
/// ```rust
/// use ripple::{event_type, Cancellation};
///
/// #[derive(Debug, Default)]
/// struct ShutdownEvent {
///     halt: Cancellation,
/// }
/// event_type!(ShutdownEvent; cancel = halt);
/// ```
///
/// During [`emit_series`](crate::EventBus::emit_series), any handler may call
/// [`cancel`](Self::cancel) to stop the remaining handlers and stages of the
/// bus currently dispatching the event, without raising an error. The flag is
/// consumed by the bus that observes it, so propagation to piped child buses
/// still takes place and delivers normally (the cancellation is local to the
/// bus whose dispatch it interrupted).
///
/// Parallel emission does not honor the flag: by the time a handler sets it,
/// every sibling is already in flight.
#[derive(Debug, Default)]
pub struct Cancellation(AtomicBool);

impl Cancellation {
    /// Creates a new, unset flag.
    #[must_use]
    pub fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Requests that the dispatching bus stop its remaining series stages.
    #[inline]
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Returns `true` if cancellation has been requested and not yet
    /// consumed by a dispatching bus.
    #[inline]
    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Consumes the flag: returns `true` once per cancel request.
    pub(crate) fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_sets_and_take_consumes() {
        let flag = Cancellation::new();
        assert!(!flag.is_canceled());
        assert!(!flag.take());

        flag.cancel();
        assert!(flag.is_canceled());
        assert!(flag.take());
        assert!(!flag.is_canceled());
        assert!(!flag.take());
    }
}
