use std::{fmt, future::Future, hash, sync::Arc};

use futures_util::{future::BoxFuture, FutureExt};
use uuid::Uuid;

use crate::Event;

/// What a handler invocation returns.
///
/// Any error is wrapped by the dispatching bus into a
/// [`HandlerError`](crate::HandlerError) carrying the handler identity and
/// the event being processed.
pub type HandlerResult = std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;

type HandlerFn = Box<dyn Fn(Arc<dyn Event>) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Unique identifier for a constructed [`Handler`].
///
/// Clones of a handler share the same id; two independently constructed
/// handlers never do, even when built from the same closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, hash::Hash)]
pub struct HandlerId(u128);

impl HandlerId {
    fn new() -> Self {
        Self(Uuid::new_v4().as_u128())
    }

    /// The raw id value.
    pub fn value(&self) -> u128 {
        self.0
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Uuid::from_u128(self.0))
    }
}

/// A named asynchronous event handler.
///
/// Wraps an async callable `Fn(Arc<dyn Event>) -> Future<Output =
/// HandlerResult>` together with a human-readable name (used in errors and
/// diagnostics) and a stable [`HandlerId`]. The required signature is
/// enforced by [`Handler::new`]'s bounds, so "handler is not an async
/// callable" is a compile error rather than a registration-time one.
///
/// `Handler` is cheap to clone; clones refer to the same registration
/// identity. Keep a clone around to remove the handler later:
///
/// ```rust
/// use ripple::{event_type, Handler, Listener};
///
/// #[derive(Debug)]
/// struct Ping;
/// event_type!(Ping);
///
/// let listener = Listener::new();
/// let on_ping = Handler::new("on_ping", |_event| async { Ok(()) });
/// listener.on::<Ping>(on_ping.clone())?;
/// listener.off::<Ping>(&on_ping)?;
/// # Ok::<(), ripple::Error>(())
/// ```
#[derive(Clone)]
pub struct Handler {
    inner: Arc<Inner>,
}

struct Inner {
    id: HandlerId,
    name: String,
    f: HandlerFn,
}

impl Handler {
    /// Wrap an async callable as a handler.
    ///
    /// The callable receives the event as `Arc<dyn Event>`; use
    /// [`downcast_ref`](crate::Event) on it, or read the ambient
    /// [`current_event`](crate::current_event) context instead of the
    /// argument.
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Arc<dyn Event>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                id: HandlerId::new(),
                name: name.into(),
                f: Box::new(move |event| f(event).boxed()),
            }),
        }
    }

    /// The handler's name, as given at construction.
    #[inline]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The handler's unique id.
    #[inline]
    pub fn id(&self) -> HandlerId {
        self.inner.id
    }

    /// Invoke the handler for one event.
    pub(crate) fn call(&self, event: Arc<dyn Event>) -> BoxFuture<'static, HandlerResult> {
        (self.inner.f)(event)
    }
}

impl PartialEq for Handler {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner) || self.inner.id == other.inner.id
    }
}

impl Eq for Handler {}

impl hash::Hash for Handler {
    fn hash<H: hash::Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("name", &self.inner.name)
            .field("id", &self.inner.id)
            .finish()
    }
}

impl fmt::Display for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_type;

    #[derive(Debug)]
    struct Ping;
    event_type!(Ping);

    #[tokio::test]
    async fn call_invokes_the_closure() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let hits = Arc::new(AtomicU32::new(0));
        let handler = {
            let hits = hits.clone();
            Handler::new("counter", move |_event| {
                let hits = hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
        };

        let event: Arc<dyn Event> = Arc::new(Ping);
        handler.call(event.clone()).await.unwrap();
        handler.call(event).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn clones_share_identity() {
        let a = Handler::new("a", |_event| async { Ok(()) });
        let b = a.clone();
        let c = Handler::new("a", |_event| async { Ok(()) });

        assert_eq!(a, b);
        assert_eq!(a.id(), b.id());
        assert_ne!(a, c);
        assert_ne!(a.id(), c.id());
    }

    #[test]
    fn debug_and_display_show_the_name() {
        let handler = Handler::new("on_startup", |_event| async { Ok(()) });
        assert_eq!(handler.to_string(), "on_startup");
        assert!(format!("{handler:?}").contains("on_startup"));
    }
}
