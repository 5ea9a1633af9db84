use std::sync::Arc;

use crate::{Event, EventKind, Handler};

/// Failure of a single handler during dispatch.
///
/// Handler errors are never passed through raw: the bus wraps every failing
/// invocation into a `HandlerError` carrying the handler identity, the event
/// being processed, and the original failure as `source`. This is what lets
/// callers distinguish "the bus misbehaved" from "a handler misbehaved".
///
/// Constructing a `HandlerError` never fails, and the value is immutable
/// once built.
#[derive(Debug, Clone, thiserror::Error)]
#[error("handler '{}' failed while handling {}", .handler.name(), .event)]
pub struct HandlerError {
    handler: Handler,
    event: Arc<dyn Event>,
    source: Arc<dyn std::error::Error + Send + Sync>,
}

impl HandlerError {
    pub(crate) fn new(
        handler: Handler,
        event: Arc<dyn Event>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        Self {
            handler,
            event,
            source: Arc::from(source),
        }
    }

    /// The handler that failed.
    #[inline]
    pub fn handler(&self) -> &Handler {
        &self.handler
    }

    /// The event that was being processed.
    #[inline]
    pub fn event(&self) -> &Arc<dyn Event> {
        &self.event
    }

    /// The original failure raised by the handler.
    #[inline]
    pub fn cause(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        self.source.as_ref()
    }
}

impl PartialEq for HandlerError {
    fn eq(&self, other: &Self) -> bool {
        self.handler == other.handler
            && Arc::ptr_eq(&self.event, &other.event)
            && Arc::ptr_eq(&self.source, &other.source)
    }
}

impl Eq for HandlerError {}

/// The single error type for all ripple operations.
///
/// Every fallible API returns `ripple::Result<T>` (alias for
/// `Result<T, ripple::Error>`).
///
/// Two classes of misuse have no variant here because the type system
/// rules them out at compile time: registering against a non-event type
/// (kinds are only obtainable through
/// [`EventKind::of::<T: Event>()`](EventKind::of)) and registering a
/// non-async-callable handler (see [`Handler::new`]).
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// A handler failed during dispatch; see [`HandlerError`].
    #[error(transparent)]
    Handler(#[from] HandlerError),

    /// The same (kind, handler) pair was registered twice.
    ///
    /// Registering a handler twice under one kind is an explicit error, not
    /// a silent no-op.
    #[error("handler '{}' is already registered for {kind}", .handler.name())]
    AlreadyRegistered { kind: EventKind, handler: Handler },

    /// Removal of a (kind, handler) pair that is not registered.
    #[error("handler '{}' is not registered for {kind}", .handler.name())]
    HandlerNotFound { kind: EventKind, handler: Handler },

    /// Removal of a handler that is not registered under any kind.
    #[error("handler '{}' is not registered under any event kind", .handler.name())]
    HandlerNotRegistered { handler: Handler },

    /// Removal of all handlers for a kind that has none.
    #[error("no handlers registered for {0}")]
    KindNotFound(EventKind),

    /// [`unregister`](crate::EventBus::unregister) of a listener the bus
    /// does not hold.
    #[error("listener is not registered on this bus")]
    ListenerNotFound,

    /// [`unpipe`](crate::EventBus::unpipe) of a bus that is not a child.
    #[error("bus is not piped as a child of this bus")]
    BusNotFound,

    /// A manual [`Event`] impl produced an empty, duplicated, or misheaded
    /// propagation order. `event_type!` declarations cannot trigger this.
    #[error("event type {0} declares an invalid propagation order")]
    InvalidPropagation(EventKind),

    /// The ambient context was read outside any active dispatch.
    #[error("no event is being dispatched on this task")]
    ContextUnbound,

    /// The registration backing [`wait`](crate::EventBus::wait) was dropped
    /// before a matching event arrived.
    #[error("wait registration dropped before a matching event")]
    WaitDropped,
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Handler(a), Self::Handler(b)) => a == b,
            (
                Self::AlreadyRegistered { kind: ka, handler: ha },
                Self::AlreadyRegistered { kind: kb, handler: hb },
            ) => ka == kb && ha == hb,
            (
                Self::HandlerNotFound { kind: ka, handler: ha },
                Self::HandlerNotFound { kind: kb, handler: hb },
            ) => ka == kb && ha == hb,
            (
                Self::HandlerNotRegistered { handler: a },
                Self::HandlerNotRegistered { handler: b },
            ) => a == b,
            (Self::KindNotFound(a), Self::KindNotFound(b)) => a == b,
            (Self::ListenerNotFound, Self::ListenerNotFound) => true,
            (Self::BusNotFound, Self::BusNotFound) => true,
            (Self::InvalidPropagation(a), Self::InvalidPropagation(b)) => a == b,
            (Self::ContextUnbound, Self::ContextUnbound) => true,
            (Self::WaitDropped, Self::WaitDropped) => true,
            _ => false,
        }
    }
}

impl Eq for Error {}
