use std::{future::Future, sync::Arc};

use crate::{Error, Event, Result};

tokio::task_local! {
    static CURRENT_EVENT: Arc<dyn Event>;
}

/// Returns the event currently being dispatched on this task.
///
/// Valid inside any handler invocation (and anything it awaits inline): the
/// bus binds the slot for the full duration of an emission, including child
/// bus propagation. Outside a dispatch the slot is unbound and this fails
/// with [`Error::ContextUnbound`] rather than producing a default, which
/// keeps accidental reads outside a dispatch loud.
///
/// The slot is task-local, not global: concurrent dispatches on different
/// tasks never observe each other's binding. A handler that spawns its own
/// task must pass the event along explicitly; the binding does not follow
/// `tokio::spawn`.
///
/// ```rust
/// use ripple::{current_event, event_type, EventBus, Handler};
///
/// #[derive(Debug)]
/// struct Tick;
/// event_type!(Tick);
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> ripple::Result {
/// let bus = EventBus::new();
/// bus.on::<Tick>(Handler::new("observer", |_event| async {
///     let event = current_event()?;
///     assert!(event.is::<Tick>());
///     Ok(())
/// }))?;
/// bus.emit_series(Tick).await?;
/// # Ok(())
/// # }
/// ```
pub fn current_event() -> Result<Arc<dyn Event>> {
    CURRENT_EVENT
        .try_with(Arc::clone)
        .map_err(|_| Error::ContextUnbound)
}

/// Like [`current_event`], but returns `None` when no dispatch is active.
pub fn try_current_event() -> Option<Arc<dyn Event>> {
    CURRENT_EVENT.try_with(Arc::clone).ok()
}

/// Runs `fut` with the ambient slot bound to `event`.
///
/// Scoping gives the bind/unbind discipline for free: the binding is
/// released exactly when `fut` completes, even on early return. If the slot
/// is already bound to the same event instance (a handler re-emitted the
/// event it is handling), the future runs under the existing binding so the
/// outer emission's exit remains the one that clears the slot.
pub(crate) async fn bind<F: Future>(event: Arc<dyn Event>, fut: F) -> F::Output {
    let bound_to_same = CURRENT_EVENT
        .try_with(|current| Arc::ptr_eq(current, &event))
        .unwrap_or(false);

    if bound_to_same {
        fut.await
    } else {
        CURRENT_EVENT.scope(event, fut).await
    }
}
