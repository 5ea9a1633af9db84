use std::{
    collections::HashSet,
    fmt,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use futures_util::future::{self, join_all, try_join_all, BoxFuture};
use tokio::sync::{oneshot, Mutex};

use crate::{
    context, Error, Event, EventKind, Handler, HandlerError, IntoEvent, Listener, Registrar,
    Result,
};

/// Dispatches events to listeners and piped child buses.
///
/// A bus owns a built-in default listener (served by [`on`](Self::on) /
/// [`off`](Self::off)), any number of [`register`](Self::register)ed
/// listeners, and any number of [`pipe`](Self::pipe)d child buses that
/// receive every emission after local dispatch.
///
/// Dispatch walks the event's propagation order one kind at a time, most
/// specific first; per kind, handlers run in listener-registration order
/// (default listener first), then within-listener registration order.
///
/// Two emission strategies are available:
///
/// | Method | Delivery | Error policy |
/// |--------|----------|--------------|
/// | [`emit_series`](Self::emit_series) | strictly ordered, one at a time | first failure returned, rest skipped |
/// | [`emit_parallel`](Self::emit_parallel) | all units concurrently | first failure returned, rest cancelled |
/// | [`emit_parallel_collect`](Self::emit_parallel_collect) | all units concurrently | every failure collected, in submission order |
///
/// `EventBus` is a cheap-clone handle: clones share the same listeners and
/// children, and equality is handle identity.
///
/// Piping cycles are not detected; introducing one makes emission recurse
/// without bound. Keeping the pipe graph acyclic is the caller's
/// responsibility.
///
/// # Example
///
/// ```rust
/// use ripple::{event_type, EventBus, Handler};
///
/// #[derive(Debug)]
/// struct LifecycleEvent;
/// event_type!(LifecycleEvent);
///
/// #[derive(Debug)]
/// struct StartupEvent;
/// event_type!(StartupEvent: LifecycleEvent);
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> ripple::Result {
/// let bus = EventBus::new();
/// bus.on::<StartupEvent>(Handler::new("on_startup", |_event| async { Ok(()) }))?;
/// bus.on::<LifecycleEvent>(Handler::new("on_lifecycle", |_event| async { Ok(()) }))?;
///
/// // Runs on_startup, then on_lifecycle (most specific kind first).
/// bus.emit_series(StartupEvent).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

#[derive(Default)]
struct BusInner {
    default_listener: Listener,
    listeners: RwLock<Vec<Listener>>,
    children: RwLock<Vec<EventBus>>,
}

impl EventBus {
    /// Creates a bus with no handlers and no children.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // ---- default-listener convenience ----

    /// Registers `handler` for kind `T` on the bus's default listener.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyRegistered`] for a duplicate pair.
    pub fn on<T: Event>(&self, handler: Handler) -> Result<()> {
        self.inner.default_listener.on::<T>(handler)
    }

    /// Removes the (kind `T`, `handler`) pair from the default listener.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HandlerNotFound`] carrying the pair if absent.
    pub fn off<T: Event>(&self, handler: &Handler) -> Result<()> {
        self.inner.default_listener.off::<T>(handler)
    }

    /// Removes every default-listener handler for kind `T`.
    pub fn off_kind<T: Event>(&self) -> Result<()> {
        self.inner.default_listener.off_kind::<T>()
    }

    /// Removes one occurrence of `handler` from the default listener.
    pub fn off_handler(&self, handler: &Handler) -> Result<()> {
        self.inner.default_listener.off_handler(handler)
    }

    /// Returns a [`Registrar`] bound to kind `T` on the default listener.
    #[must_use]
    pub fn registrar<T: Event>(&self) -> Registrar {
        self.inner.default_listener.registrar::<T>()
    }

    // ---- listener bookkeeping ----

    /// Appends `listener` to the bus. Registration order across listeners
    /// is delivery priority order; the default listener always runs first.
    pub fn register(&self, listener: &Listener) {
        self.write_listeners().push(listener.clone());
    }

    /// Removes `listener` from the bus.
    ///
    /// Handlers already snapshotted for an in-flight dispatch stage keep
    /// running; stages not yet started no longer see the listener.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ListenerNotFound`] if the listener is not
    /// registered here.
    pub fn unregister(&self, listener: &Listener) -> Result<()> {
        let mut listeners = self.write_listeners();
        match listeners.iter().position(|l| l == listener) {
            Some(index) => {
                listeners.remove(index);
                Ok(())
            }
            None => Err(Error::ListenerNotFound),
        }
    }

    /// Drops every registered listener (the default listener is kept; use
    /// [`off_handler`](Self::off_handler) / [`off_kind`](Self::off_kind)
    /// for its handlers).
    pub fn clear_listeners(&self) {
        self.write_listeners().clear();
    }

    // ---- bus composition ----

    /// Appends `child` to this bus's children. Every emission is forwarded
    /// to each child exactly once, after local dispatch completes.
    ///
    /// A bus may be piped into multiple parents. Cycles are not checked.
    pub fn pipe(&self, child: &EventBus) {
        self.write_children().push(child.clone());
    }

    /// Removes `child` from this bus's children.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BusNotFound`] if `child` is not piped here.
    pub fn unpipe(&self, child: &EventBus) -> Result<()> {
        let mut children = self.write_children();
        match children.iter().position(|c| c == child) {
            Some(index) => {
                children.remove(index);
                Ok(())
            }
            None => Err(Error::BusNotFound),
        }
    }

    /// Pipes this bus as a child of `parent` (symmetric form of
    /// [`pipe`](Self::pipe)).
    pub fn attach(&self, parent: &EventBus) {
        parent.pipe(self);
    }

    /// Removes this bus from `parent`'s children (symmetric form of
    /// [`unpipe`](Self::unpipe)).
    pub fn detach(&self, parent: &EventBus) -> Result<()> {
        parent.unpipe(self)
    }

    // ---- propagation resolution ----

    /// The propagation order the bus will walk for `event`: its concrete
    /// kind first, then declared ancestors, most specific first.
    pub fn propagation_order(&self, event: &dyn Event) -> &'static [EventKind] {
        event.propagation()
    }

    /// The handlers that would run for one `kind` stage right now:
    /// default-listener handlers first, then each registered listener's,
    /// in registration order.
    ///
    /// This is queried fresh for every dispatch stage, so listener changes
    /// are visible to stages (and dispatches) that have not started yet.
    pub fn handlers_for(&self, kind: EventKind) -> Vec<Handler> {
        let mut handlers = self.inner.default_listener.handlers_for(kind);
        for listener in self.read_listeners().iter() {
            handlers.extend(listener.handlers_for(kind));
        }
        handlers
    }

    // ---- emission ----

    /// Emits `event` sequentially: for each kind in propagation order, each
    /// handler runs to completion before the next starts; afterwards each
    /// child bus receives the event, one sibling at a time. The ambient
    /// [`current_event`](crate::current_event) context is bound for the
    /// whole call.
    ///
    /// A handler may stop the bus's remaining stages without error through
    /// the event's [`Cancellation`](crate::Cancellation) flag; child
    /// propagation still takes place.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Handler`] wrapping the first failing handler
    /// (remaining handlers, stages, and children are skipped), or
    /// [`Error::InvalidPropagation`] for a malformed manual [`Event`] impl.
    pub async fn emit_series(&self, event: impl IntoEvent) -> Result<()> {
        let event = event.into_event();
        validate(&event)?;
        context::bind(event.clone(), self.dispatch_series(event)).await
    }

    /// Emits `event` concurrently with fail-fast error policy: the full
    /// (kind, handler) unit set is snapshotted up front and run as
    /// cooperatively concurrent futures, together with one recursive unit
    /// per child bus. The first handler failure is returned and the
    /// remaining fan-out is cancelled by dropping it.
    ///
    /// Unlike series emission, the cancellation flag is not honored here:
    /// every sibling is already in flight when a handler could set it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Handler`] wrapping some failing handler, or
    /// [`Error::InvalidPropagation`] as for series.
    pub async fn emit_parallel(&self, event: impl IntoEvent) -> Result<()> {
        let event = event.into_event();
        validate(&event)?;
        context::bind(event.clone(), self.dispatch_parallel(event)).await
    }

    /// Like [`emit_parallel`](Self::emit_parallel), but waits for every
    /// unit regardless of failures and returns all handler errors: own
    /// handlers' errors first in unit-submission order, then each child's
    /// collected errors in pipe order (child-internal order preserved).
    /// Zero failures yield an empty vec.
    ///
    /// # Errors
    ///
    /// Only [`Error::InvalidPropagation`]; handler failures are collected,
    /// not raised.
    pub async fn emit_parallel_collect(&self, event: impl IntoEvent) -> Result<Vec<HandlerError>> {
        let event = event.into_event();
        validate(&event)?;
        Ok(context::bind(event.clone(), self.dispatch_parallel_collect(event)).await)
    }

    /// Resolves with the next event of kind `T` (or any descendant)
    /// emitted on this bus, using a transient default-listener handler.
    ///
    /// The transient handler is removed when the returned future
    /// completes or is dropped, so wrapping the call in an external
    /// timeout does not leave a stale registration behind.
    pub async fn wait<T: Event>(&self) -> Result<Arc<dyn Event>> {
        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(Mutex::new(Some(tx)));
        let handler = Handler::new("wait", {
            let slot = slot.clone();
            move |event| {
                let slot = slot.clone();
                async move {
                    if let Some(tx) = slot.lock().await.take() {
                        let _ = tx.send(event);
                    }
                    Ok(())
                }
            }
        });
        drop(slot);

        self.on::<T>(handler.clone())?;
        let _guard = WaitGuard {
            bus: self.clone(),
            handler,
        };
        rx.await.map_err(|_| Error::WaitDropped)
    }

    // ---- queries ----

    /// The set of kinds with at least one handler on this bus (default
    /// listener included; children excluded).
    pub fn events(&self) -> HashSet<EventKind> {
        let mut kinds: HashSet<EventKind> =
            self.inner.default_listener.kinds().into_iter().collect();
        for listener in self.read_listeners().iter() {
            kinds.extend(listener.kinds());
        }
        kinds
    }

    /// Number of kinds with at least one handler.
    pub fn len(&self) -> usize {
        self.events().len()
    }

    /// Returns `true` if no handler is registered on this bus.
    pub fn is_empty(&self) -> bool {
        self.inner.default_listener.is_empty()
            && self.read_listeners().iter().all(Listener::is_empty)
    }

    /// Returns `true` if `listener` is registered on this bus.
    pub fn contains_listener(&self, listener: &Listener) -> bool {
        self.read_listeners().iter().any(|l| l == listener)
    }

    /// Returns `true` if `handler` is registered anywhere on this bus.
    pub fn contains_handler(&self, handler: &Handler) -> bool {
        self.inner.default_listener.contains_handler(handler)
            || self
                .read_listeners()
                .iter()
                .any(|l| l.contains_handler(handler))
    }

    /// Returns `true` if any listener has handlers directly for kind `T`.
    pub fn contains_kind<T: Event>(&self) -> bool {
        let kind = EventKind::of::<T>();
        self.inner.default_listener.has_kind(kind)
            || self.read_listeners().iter().any(|l| l.has_kind(kind))
    }

    // ---- dispatch internals ----

    fn dispatch_series(&self, event: Arc<dyn Event>) -> BoxFuture<'static, Result<()>> {
        let bus = self.clone();
        Box::pin(async move {
            tracing::debug!(event = %event, "series dispatch");

            'stages: for kind in event.propagation() {
                // Snapshot per stage: listener changes made from here on
                // affect later stages, never this one.
                let handlers = bus.handlers_for(*kind);
                for handler in handlers {
                    tracing::trace!(handler = %handler, stage = %kind, "invoking handler");
                    if let Err(source) = handler.call(event.clone()).await {
                        tracing::warn!(handler = %handler, event = %event, "handler failed");
                        return Err(HandlerError::new(handler, event, source).into());
                    }
                    // take() consumes the request right after the handler
                    // that may have set it, even when it is the last one of
                    // the last stage; the halt stays local to this bus and
                    // children still deliver.
                    if let Some(flag) = event.cancellation() {
                        if flag.take() {
                            tracing::debug!(event = %event, "series dispatch canceled");
                            break 'stages;
                        }
                    }
                }
            }

            for child in bus.children_snapshot() {
                child.dispatch_series(event.clone()).await?;
            }
            Ok(())
        })
    }

    fn dispatch_parallel(&self, event: Arc<dyn Event>) -> BoxFuture<'static, Result<()>> {
        let bus = self.clone();
        Box::pin(async move {
            tracing::debug!(event = %event, "parallel dispatch (fail-fast)");

            let units = bus.invocation_units(&event);
            let children = bus.children_snapshot();

            let local = try_join_all(units.into_iter().map(|handler| {
                let event = event.clone();
                async move {
                    handler.call(event.clone()).await.map_err(|source| {
                        tracing::warn!(handler = %handler, event = %event, "handler failed");
                        Error::from(HandlerError::new(handler, event, source))
                    })
                }
            }));
            let downstream = try_join_all(
                children
                    .into_iter()
                    .map(|child| child.dispatch_parallel(event.clone())),
            );

            future::try_join(local, downstream).await?;
            Ok(())
        })
    }

    fn dispatch_parallel_collect(
        &self,
        event: Arc<dyn Event>,
    ) -> BoxFuture<'static, Vec<HandlerError>> {
        let bus = self.clone();
        Box::pin(async move {
            tracing::debug!(event = %event, "parallel dispatch (collecting)");

            let units = bus.invocation_units(&event);
            let children = bus.children_snapshot();

            let local = join_all(units.into_iter().map(|handler| {
                let event = event.clone();
                async move {
                    match handler.call(event.clone()).await {
                        Ok(()) => None,
                        Err(source) => {
                            tracing::warn!(handler = %handler, event = %event, "handler failed");
                            Some(HandlerError::new(handler, event, source))
                        }
                    }
                }
            }));
            let downstream = join_all(
                children
                    .into_iter()
                    .map(|child| child.dispatch_parallel_collect(event.clone())),
            );

            let (local, downstream) = future::join(local, downstream).await;
            let mut errors: Vec<HandlerError> = local.into_iter().flatten().collect();
            for child_errors in downstream {
                errors.extend(child_errors);
            }
            errors
        })
    }

    /// The full local (kind, handler) unit list for one parallel emission,
    /// fixed before any invocation starts.
    fn invocation_units(&self, event: &Arc<dyn Event>) -> Vec<Handler> {
        let mut units = Vec::new();
        for kind in event.propagation() {
            units.extend(self.handlers_for(*kind));
        }
        units
    }

    fn children_snapshot(&self) -> Vec<EventBus> {
        self.read_children().clone()
    }

    // Poison recovery as in Listener: the guarded data is plain Vecs.
    fn read_listeners(&self) -> RwLockReadGuard<'_, Vec<Listener>> {
        self.inner
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write_listeners(&self) -> RwLockWriteGuard<'_, Vec<Listener>> {
        self.inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn read_children(&self) -> RwLockReadGuard<'_, Vec<EventBus>> {
        self.inner
            .children
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write_children(&self) -> RwLockWriteGuard<'_, Vec<EventBus>> {
        self.inner
            .children
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

// Removes a wait()'s transient handler however its future ends, dropped
// before a match included. The handler is registered under exactly one
// kind, so the single-occurrence removal finds it.
struct WaitGuard {
    bus: EventBus,
    handler: Handler,
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        let _ = self.bus.off_handler(&self.handler);
    }
}

fn validate(event: &Arc<dyn Event>) -> Result<()> {
    let path = event.propagation();
    let headed = path.first() == Some(&event.kind());
    let unique = path
        .iter()
        .enumerate()
        .all(|(i, kind)| !path[i + 1..].contains(kind));
    if headed && unique {
        Ok(())
    } else {
        Err(Error::InvalidPropagation(event.kind()))
    }
}

impl PartialEq for EventBus {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for EventBus {}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("events", &self.len())
            .field("listeners", &self.read_listeners().len())
            .field("children", &self.read_children().len())
            .finish()
    }
}

/// Topology export: which kinds feed which handlers on this bus.
///
/// Kinds are shown as circles, handlers as boxes, mirroring declared
/// registration only (not runtime flow and not piped children).
impl EventBus {
    /// Generate a Mermaid flowchart of this bus's kind → handler edges.
    ///
    /// # Example output
    ///
    /// ```text
    /// flowchart LR
    ///     LifecycleEvent((LifecycleEvent)) --> on_lifecycle
    ///     StartupEvent((StartupEvent)) --> on_startup
    /// ```
    pub fn to_mermaid(&self) -> String {
        let mut kinds: Vec<EventKind> = self.events().into_iter().collect();
        kinds.sort_unstable_by_key(|kind| kind.name());

        let mut lines = vec!["flowchart LR".to_string()];
        for kind in kinds {
            for handler in self.handlers_for(kind) {
                lines.push(format!(
                    "    {name}(({name})) --> {handler}",
                    name = kind.name(),
                    handler = handler.name(),
                ));
            }
        }
        lines.join("\n")
    }
}

#[cfg(feature = "serde")]
#[cfg_attr(docsrs, doc(cfg(feature = "serde")))]
impl EventBus {
    /// Export the bus topology as JSON: per kind, the handler names in
    /// delivery order, plus each piped child's topology recursively.
    ///
    /// Like emission, the export recurses through children, so it must not
    /// be called on a cyclic pipe graph.
    ///
    /// # Errors
    ///
    /// Returns any serialization error produced by `serde_json`.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.export())
    }

    fn export(&self) -> BusExport {
        let mut kinds: Vec<EventKind> = self.events().into_iter().collect();
        kinds.sort_unstable_by_key(|kind| kind.name());

        BusExport {
            events: kinds
                .into_iter()
                .map(|kind| KindExport {
                    kind: kind.name().to_string(),
                    handlers: self
                        .handlers_for(kind)
                        .iter()
                        .map(|h| h.name().to_string())
                        .collect(),
                })
                .collect(),
            children: self
                .children_snapshot()
                .iter()
                .map(EventBus::export)
                .collect(),
        }
    }
}

#[cfg(feature = "serde")]
#[derive(serde::Serialize)]
struct BusExport {
    events: Vec<KindExport>,
    children: Vec<BusExport>,
}

#[cfg(feature = "serde")]
#[derive(serde::Serialize)]
struct KindExport {
    kind: String,
    handlers: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{current_event, event_type, Cancellation};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[derive(Debug)]
    struct LifecycleEvent;
    event_type!(LifecycleEvent);

    #[derive(Debug)]
    struct StartupEvent;
    event_type!(StartupEvent: LifecycleEvent);

    #[derive(Debug)]
    struct Tick;
    event_type!(Tick);

    #[derive(Debug)]
    struct Tock;
    event_type!(Tock);

    #[derive(Debug, Default)]
    struct HaltEvent {
        halt: Cancellation,
    }
    event_type!(HaltEvent; cancel = halt);

    type Log = Arc<StdMutex<Vec<String>>>;

    fn log() -> Log {
        Arc::new(StdMutex::new(Vec::new()))
    }

    fn taken(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    fn record(log: &Log, name: &str) -> Handler {
        let log = log.clone();
        let tag = name.to_string();
        Handler::new(name, move |_event| {
            let log = log.clone();
            let tag = tag.clone();
            async move {
                log.lock().unwrap().push(tag);
                Ok(())
            }
        })
    }

    fn failing(name: &str) -> Handler {
        Handler::new(name, |_event| async { Err("boom".into()) })
    }

    fn failed_handler_name(err: Error) -> String {
        match err {
            Error::Handler(e) => e.handler().name().to_string(),
            other => panic!("expected a handler error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn series_runs_most_specific_stage_first_exactly_once() {
        let bus = EventBus::new();
        let log = log();
        bus.on::<LifecycleEvent>(record(&log, "on_lifecycle")).unwrap();
        bus.on::<StartupEvent>(record(&log, "on_startup")).unwrap();

        bus.emit_series(StartupEvent).await.unwrap();
        assert_eq!(taken(&log), ["on_startup", "on_lifecycle"]);

        // A root-kind emission never reaches the descendant stage.
        bus.emit_series(LifecycleEvent).await.unwrap();
        assert_eq!(taken(&log), ["on_startup", "on_lifecycle", "on_lifecycle"]);
    }

    #[tokio::test]
    async fn handler_under_two_kinds_observes_each_events_identity() {
        let bus = EventBus::new();
        let log = log();
        let origin = {
            let log = log.clone();
            Handler::new("origin", move |event| {
                let log = log.clone();
                async move {
                    log.lock().unwrap().push(event.kind().name().to_string());
                    Ok(())
                }
            })
        };
        bus.on::<Tick>(origin.clone()).unwrap();
        bus.on::<Tock>(origin).unwrap();

        bus.emit_series(Tick).await.unwrap();
        bus.emit_series(Tock).await.unwrap();
        assert_eq!(taken(&log), ["Tick", "Tock"]);
    }

    #[tokio::test]
    async fn series_is_fail_fast() {
        let bus = EventBus::new();
        let log = log();
        bus.on::<Tick>(record(&log, "h1")).unwrap();
        bus.on::<Tick>(failing("h2")).unwrap();
        bus.on::<Tick>(record(&log, "h3")).unwrap();

        let err = bus.emit_series(Tick).await.unwrap_err();
        assert_eq!(failed_handler_name(err), "h2");
        assert_eq!(taken(&log), ["h1"]);
    }

    #[tokio::test]
    async fn series_orders_default_listener_then_registration_order() {
        let bus = EventBus::new();
        let log = log();
        let first = Listener::new();
        first.on::<Tick>(record(&log, "first")).unwrap();
        let second = Listener::new();
        second.on::<Tick>(record(&log, "second")).unwrap();

        bus.register(&first);
        bus.register(&second);
        bus.on::<Tick>(record(&log, "default")).unwrap();

        bus.emit_series(Tick).await.unwrap();
        assert_eq!(taken(&log), ["default", "first", "second"]);
    }

    #[tokio::test(start_paused = true)]
    async fn parallel_collect_keeps_submission_order_not_completion_order() {
        let bus = EventBus::new();
        let log = log();
        bus.on::<Tick>(record(&log, "ok")).unwrap();
        bus.on::<Tick>(Handler::new("f_slow", |_event| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Err("late".into())
        }))
        .unwrap();
        bus.on::<Tick>(Handler::new("f_fast", |_event| async { Err("early".into()) }))
            .unwrap();

        let errors = bus.emit_parallel_collect(Tick).await.unwrap();
        let names: Vec<_> = errors.iter().map(|e| e.handler().name()).collect();
        assert_eq!(names, ["f_slow", "f_fast"]);
        assert_eq!(taken(&log), ["ok"]);
    }

    #[tokio::test]
    async fn parallel_collect_with_no_failures_is_an_empty_list() {
        let bus = EventBus::new();
        let log = log();
        bus.on::<Tick>(record(&log, "a")).unwrap();
        bus.on::<Tick>(record(&log, "b")).unwrap();

        let errors = bus.emit_parallel_collect(Tick).await.unwrap();
        assert!(errors.is_empty());
        assert_eq!(taken(&log).len(), 2);
    }

    #[tokio::test]
    async fn parallel_fail_fast_surfaces_a_handler_error() {
        let bus = EventBus::new();
        bus.on::<Tick>(failing("f1")).unwrap();
        bus.on::<Tick>(failing("f2")).unwrap();

        let err = bus.emit_parallel(Tick).await.unwrap_err();
        let name = failed_handler_name(err);
        assert!(name == "f1" || name == "f2");
    }

    #[tokio::test]
    async fn series_pipes_through_the_whole_chain_in_order() {
        let a = EventBus::new();
        let b = EventBus::new();
        let c = EventBus::new();
        a.pipe(&b);
        b.pipe(&c);

        let log = log();
        a.on::<Tick>(record(&log, "a")).unwrap();
        b.on::<Tick>(record(&log, "b")).unwrap();
        c.on::<Tick>(record(&log, "c")).unwrap();

        a.emit_series(Tick).await.unwrap();
        assert_eq!(taken(&log), ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn child_failure_reaches_the_top_level_caller() {
        let parent = EventBus::new();
        let child = EventBus::new();
        parent.pipe(&child);
        child.on::<Tick>(failing("deep")).unwrap();

        let err = parent.emit_series(Tick).await.unwrap_err();
        assert_eq!(failed_handler_name(err), "deep");
    }

    #[tokio::test]
    async fn parallel_collect_appends_child_errors_after_own() {
        let parent = EventBus::new();
        let child = EventBus::new();
        parent.pipe(&child);
        parent.on::<Tick>(failing("fa")).unwrap();
        child.on::<Tick>(failing("fb")).unwrap();

        let errors = parent.emit_parallel_collect(Tick).await.unwrap();
        let names: Vec<_> = errors.iter().map(|e| e.handler().name()).collect();
        assert_eq!(names, ["fa", "fb"]);
    }

    #[tokio::test]
    async fn parallel_runs_own_handlers_concurrently_with_children() {
        let parent = EventBus::new();
        let child = EventBus::new();
        parent.pipe(&child);

        // Both sides must be in flight at once for either to finish.
        let barrier = Arc::new(tokio::sync::Barrier::new(2));
        let meet = |name: &str| {
            let barrier = barrier.clone();
            Handler::new(name, move |_event| {
                let barrier = barrier.clone();
                async move {
                    barrier.wait().await;
                    Ok(())
                }
            })
        };
        parent.on::<Tick>(meet("parent_side")).unwrap();
        child.on::<Tick>(meet("child_side")).unwrap();

        tokio::time::timeout(Duration::from_secs(1), parent.emit_parallel(Tick))
            .await
            .expect("parallel dispatch interleaves parent and child")
            .unwrap();
    }

    #[tokio::test]
    async fn unregister_between_stages_excludes_the_later_stage() {
        let bus = EventBus::new();
        let log = log();
        let late = Listener::new();
        late.on::<LifecycleEvent>(record(&log, "late")).unwrap();
        bus.register(&late);

        let remover = {
            let bus = bus.clone();
            let late = late.clone();
            Handler::new("remover", move |_event| {
                let bus = bus.clone();
                let late = late.clone();
                async move {
                    bus.unregister(&late)?;
                    Ok(())
                }
            })
        };
        bus.on::<StartupEvent>(remover).unwrap();

        bus.emit_series(StartupEvent).await.unwrap();
        assert!(taken(&log).is_empty());
    }

    #[tokio::test]
    async fn cancellation_halts_local_stages_but_children_still_deliver() {
        let parent = EventBus::new();
        let child = EventBus::new();
        parent.pipe(&child);
        let log = log();

        let canceler = {
            let log = log.clone();
            Handler::new("canceler", move |event| {
                let log = log.clone();
                async move {
                    log.lock().unwrap().push("canceler".into());
                    event.cancellation().expect("halt flag").cancel();
                    Ok(())
                }
            })
        };
        parent.on::<HaltEvent>(canceler).unwrap();
        parent.on::<HaltEvent>(record(&log, "skipped")).unwrap();
        child.on::<HaltEvent>(record(&log, "child")).unwrap();

        parent.emit_series(HaltEvent::default()).await.unwrap();
        assert_eq!(taken(&log), ["canceler", "child"]);
    }

    #[tokio::test]
    async fn cancellation_by_the_final_handler_still_reaches_children() {
        let parent = EventBus::new();
        let child = EventBus::new();
        parent.pipe(&child);
        let log = log();

        // The sole parent handler ends its bus's dispatch with the flag
        // set; the child must still consume its own delivery, not the flag.
        let canceler = Handler::new("canceler", |event: Arc<dyn Event>| async move {
            event.cancellation().expect("halt flag").cancel();
            Ok(())
        });
        parent.on::<HaltEvent>(canceler).unwrap();
        child.on::<HaltEvent>(record(&log, "child")).unwrap();

        parent.emit_series(HaltEvent::default()).await.unwrap();
        assert_eq!(taken(&log), ["child"]);
    }

    #[tokio::test]
    async fn parallel_does_not_honor_the_cancellation_flag() {
        let bus = EventBus::new();
        let log = log();
        let canceler = Handler::new("canceler", |event: Arc<dyn Event>| async move {
            event.cancellation().expect("halt flag").cancel();
            Ok(())
        });
        bus.on::<HaltEvent>(canceler).unwrap();
        bus.on::<HaltEvent>(record(&log, "sibling")).unwrap();

        let errors = bus.emit_parallel_collect(HaltEvent::default()).await.unwrap();
        assert!(errors.is_empty());
        assert_eq!(taken(&log), ["sibling"]);
    }

    #[tokio::test]
    async fn context_is_bound_to_the_dispatched_event() {
        let bus = EventBus::new();
        let probe = Handler::new("probe", |event: Arc<dyn Event>| async move {
            let current = current_event()?;
            assert!(Arc::ptr_eq(&current, &event));
            Ok(())
        });
        bus.on::<Tick>(probe).unwrap();

        bus.emit_series(Tick).await.unwrap();
        bus.emit_parallel(Tick).await.unwrap();

        // Released once the dispatch completes.
        assert_eq!(current_event().unwrap_err(), Error::ContextUnbound);
    }

    #[tokio::test]
    async fn reemitting_the_current_event_is_reentrant_safe() {
        let outer = EventBus::new();
        let inner = EventBus::new();
        let log = log();

        let probe = {
            let log = log.clone();
            Handler::new("inner_probe", move |event| {
                let log = log.clone();
                async move {
                    assert!(Arc::ptr_eq(&current_event()?, &event));
                    log.lock().unwrap().push("inner".into());
                    Ok(())
                }
            })
        };
        inner.on::<Tick>(probe).unwrap();

        let reemit = {
            let inner = inner.clone();
            Handler::new("reemit", move |event| {
                let inner = inner.clone();
                async move {
                    inner.emit_series(event.clone()).await?;
                    // Outer binding intact after the nested dispatch.
                    assert!(Arc::ptr_eq(&current_event()?, &event));
                    Ok(())
                }
            })
        };
        outer.on::<Tick>(reemit).unwrap();

        outer.emit_series(Tick).await.unwrap();
        assert_eq!(taken(&log), ["inner"]);
    }

    #[tokio::test]
    async fn wait_resolves_with_the_next_matching_event() {
        let bus = EventBus::new();

        let (waited, emitted) = tokio::join!(
            bus.wait::<LifecycleEvent>(),
            bus.emit_series(StartupEvent)
        );
        emitted.unwrap();

        let event = waited.unwrap();
        assert!(event.is::<StartupEvent>());
        // The transient registration is gone.
        assert!(!bus.contains_kind::<LifecycleEvent>());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_wait_unregisters_its_transient_handler() {
        let bus = EventBus::new();

        let timed_out =
            tokio::time::timeout(Duration::from_millis(10), bus.wait::<Tick>()).await;
        assert!(timed_out.is_err());
        assert!(!bus.contains_kind::<Tick>());

        // A later emission finds no stale registration to feed.
        bus.emit_series(Tick).await.unwrap();
    }

    #[tokio::test]
    async fn multi_parent_child_receives_from_each_parent() {
        let left = EventBus::new();
        let right = EventBus::new();
        let shared = EventBus::new();
        shared.attach(&left);
        shared.attach(&right);

        let log = log();
        shared.on::<Tick>(record(&log, "shared")).unwrap();

        left.emit_series(Tick).await.unwrap();
        right.emit_series(Tick).await.unwrap();
        assert_eq!(taken(&log), ["shared", "shared"]);

        shared.detach(&left).unwrap();
        left.emit_series(Tick).await.unwrap();
        assert_eq!(taken(&log).len(), 2);
    }

    #[tokio::test]
    async fn composition_and_bookkeeping_misses_are_lookup_failures() {
        let bus = EventBus::new();
        assert_eq!(bus.unpipe(&EventBus::new()).unwrap_err(), Error::BusNotFound);
        assert_eq!(
            bus.unregister(&Listener::new()).unwrap_err(),
            Error::ListenerNotFound
        );
    }

    #[tokio::test]
    async fn queries_cover_default_and_registered_listeners() {
        let bus = EventBus::new();
        assert!(bus.is_empty());
        assert_eq!(bus.len(), 0);

        let tick = Handler::new("tick", |_event| async { Ok(()) });
        bus.on::<Tick>(tick.clone()).unwrap();

        let listener = Listener::new();
        let tock = Handler::new("tock", |_event| async { Ok(()) });
        listener.on::<Tock>(tock.clone()).unwrap();
        bus.register(&listener);

        assert!(!bus.is_empty());
        assert_eq!(bus.len(), 2);
        assert_eq!(
            bus.events(),
            HashSet::from([EventKind::of::<Tick>(), EventKind::of::<Tock>()])
        );
        assert!(bus.contains_kind::<Tick>());
        assert!(bus.contains_kind::<Tock>());
        assert!(!bus.contains_kind::<LifecycleEvent>());
        assert!(bus.contains_handler(&tick));
        assert!(bus.contains_handler(&tock));
        assert!(bus.contains_listener(&listener));
        assert!(!bus.contains_listener(&Listener::new()));
    }

    #[tokio::test]
    async fn handlers_for_concatenates_in_priority_order() {
        let bus = EventBus::new();
        let d = Handler::new("d", |_event| async { Ok(()) });
        let r = Handler::new("r", |_event| async { Ok(()) });
        bus.on::<Tick>(d.clone()).unwrap();
        let listener = Listener::new();
        listener.on::<Tick>(r.clone()).unwrap();
        bus.register(&listener);

        assert_eq!(bus.handlers_for(EventKind::of::<Tick>()), vec![d, r]);
        assert!(bus.handlers_for(EventKind::of::<Tock>()).is_empty());
    }

    #[tokio::test]
    async fn malformed_manual_event_impls_are_rejected() {
        use std::any::Any;

        #[derive(Debug)]
        struct Broken;
        impl Event for Broken {
            fn kind(&self) -> EventKind {
                EventKind::of::<Broken>()
            }
            fn propagation(&self) -> &'static [EventKind] {
                &[]
            }
            fn as_any(&self) -> &dyn Any {
                self
            }
        }

        let bus = EventBus::new();
        let err = bus.emit_series(Broken).await.unwrap_err();
        assert_eq!(err, Error::InvalidPropagation(EventKind::of::<Broken>()));
    }

    #[tokio::test]
    async fn to_mermaid_lists_kind_to_handler_edges() {
        let bus = EventBus::new();
        bus.on::<StartupEvent>(Handler::new("on_startup", |_event| async { Ok(()) }))
            .unwrap();
        bus.on::<LifecycleEvent>(Handler::new("on_lifecycle", |_event| async { Ok(()) }))
            .unwrap();

        let mermaid = bus.to_mermaid();
        assert!(mermaid.starts_with("flowchart LR"));
        assert!(mermaid.contains("StartupEvent((StartupEvent)) --> on_startup"));
        assert!(mermaid.contains("LifecycleEvent((LifecycleEvent)) --> on_lifecycle"));
    }

    #[cfg(feature = "serde")]
    #[tokio::test]
    async fn to_json_exports_children_recursively() {
        use serde_json::Value;

        let parent = EventBus::new();
        let child = EventBus::new();
        parent.pipe(&child);
        parent
            .on::<Tick>(Handler::new("on_tick", |_event| async { Ok(()) }))
            .unwrap();
        child
            .on::<Tock>(Handler::new("on_tock", |_event| async { Ok(()) }))
            .unwrap();

        let parsed: Value = serde_json::from_str(&parent.to_json().unwrap()).unwrap();
        assert_eq!(parsed["events"][0]["kind"], "Tick");
        assert_eq!(parsed["events"][0]["handlers"][0], "on_tick");
        assert_eq!(parsed["children"][0]["events"][0]["kind"], "Tock");
    }
}
