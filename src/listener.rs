use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use crate::{Error, Event, EventKind, Handler, Result};

type HandlerMap = HashMap<EventKind, Vec<Handler>>;

/// A named group of handlers keyed by event kind.
///
/// Within one kind, registration order is delivery order. A handler may be
/// registered under multiple kinds; the same (kind, handler) pair may not be
/// registered twice (explicit [`Error::AlreadyRegistered`]).
///
/// `Listener` is a cheap-clone handle: clones share the same handler table,
/// and equality is handle identity. Register a listener on one or more
/// buses with [`EventBus::register`](crate::EventBus::register) and keep a
/// clone to unregister it later. Handler changes made through any clone are
/// visible to the next dispatch stage that queries the listener.
///
/// ```rust
/// use ripple::{event_type, Handler, Listener};
///
/// #[derive(Debug)]
/// struct LifecycleEvent;
/// event_type!(LifecycleEvent);
///
/// let listener = Listener::new();
/// listener.on::<LifecycleEvent>(Handler::new("log", |_event| async { Ok(()) }))?;
/// assert!(listener.contains_kind::<LifecycleEvent>());
/// assert!(!listener.is_empty());
/// # Ok::<(), ripple::Error>(())
/// ```
#[derive(Clone, Default)]
pub struct Listener {
    inner: Arc<RwLock<HandlerMap>>,
}

impl Listener {
    /// Creates an empty listener.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for events of kind `T` (and, through propagation,
    /// every descendant of `T`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyRegistered`] if this exact handler is already
    /// registered under `T`.
    pub fn on<T: Event>(&self, handler: Handler) -> Result<()> {
        self.insert(EventKind::of::<T>(), handler)
    }

    /// Returns a [`Registrar`] bound to kind `T`, the two-step form of
    /// registration for call sites that fix the kind first and attach
    /// handlers later.
    #[must_use]
    pub fn registrar<T: Event>(&self) -> Registrar {
        Registrar {
            listener: self.clone(),
            kind: EventKind::of::<T>(),
        }
    }

    /// Removes the (kind `T`, `handler`) pair.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HandlerNotFound`] carrying the pair if it is not
    /// registered.
    pub fn off<T: Event>(&self, handler: &Handler) -> Result<()> {
        let kind = EventKind::of::<T>();
        let mut map = self.write();

        let Some(handlers) = map.get_mut(&kind) else {
            return Err(Error::HandlerNotFound {
                kind,
                handler: handler.clone(),
            });
        };
        let Some(index) = handlers.iter().position(|h| h == handler) else {
            return Err(Error::HandlerNotFound {
                kind,
                handler: handler.clone(),
            });
        };

        handlers.remove(index);
        if handlers.is_empty() {
            map.remove(&kind);
        }
        Ok(())
    }

    /// Removes every handler registered for kind `T`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KindNotFound`] if `T` has no handlers.
    pub fn off_kind<T: Event>(&self) -> Result<()> {
        let kind = EventKind::of::<T>();
        match self.write().remove(&kind) {
            Some(_) => Ok(()),
            None => Err(Error::KindNotFound(kind)),
        }
    }

    /// Removes one occurrence of `handler`, whichever kind it is found
    /// under first. When the handler is registered under several kinds,
    /// only a single occurrence is removed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HandlerNotRegistered`] if the handler is not
    /// registered anywhere.
    pub fn off_handler(&self, handler: &Handler) -> Result<()> {
        let mut map = self.write();

        let mut removed = None;
        for (kind, handlers) in map.iter_mut() {
            if let Some(index) = handlers.iter().position(|h| h == handler) {
                handlers.remove(index);
                removed = Some((*kind, handlers.is_empty()));
                break;
            }
        }

        match removed {
            Some((kind, true)) => {
                map.remove(&kind);
                Ok(())
            }
            Some((_, false)) => Ok(()),
            None => Err(Error::HandlerNotRegistered {
                handler: handler.clone(),
            }),
        }
    }

    /// Removes everything.
    pub fn clear(&self) {
        self.write().clear();
    }

    /// Returns `true` if `handler` is registered under any kind.
    pub fn contains_handler(&self, handler: &Handler) -> bool {
        self.read()
            .values()
            .any(|handlers| handlers.contains(handler))
    }

    /// Returns `true` if at least one handler is registered directly for
    /// kind `T` (propagation is not considered).
    pub fn contains_kind<T: Event>(&self) -> bool {
        self.read().contains_key(&EventKind::of::<T>())
    }

    /// The kinds that currently have at least one handler.
    pub fn kinds(&self) -> Vec<EventKind> {
        self.read().keys().copied().collect()
    }

    /// Number of kinds with at least one handler.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Returns `true` if no handler is registered at all.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Snapshot of the handlers registered for `kind`, in registration
    /// order. Queried fresh by the bus for each dispatch stage.
    pub(crate) fn handlers_for(&self, kind: EventKind) -> Vec<Handler> {
        self.read().get(&kind).cloned().unwrap_or_default()
    }

    pub(crate) fn has_kind(&self, kind: EventKind) -> bool {
        self.read().contains_key(&kind)
    }

    fn insert(&self, kind: EventKind, handler: Handler) -> Result<()> {
        let mut map = self.write();
        let handlers = map.entry(kind).or_default();
        if handlers.contains(&handler) {
            // Entries stay non-empty: the entry was either pre-existing and
            // populated, or just created and about to be populated below.
            return Err(Error::AlreadyRegistered { kind, handler });
        }
        handlers.push(handler);
        Ok(())
    }

    // A poisoned lock only means a panic mid-mutation of plain collections;
    // the map is still structurally valid, so recover the guard.
    fn read(&self) -> RwLockReadGuard<'_, HandlerMap> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HandlerMap> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PartialEq for Listener {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Listener {}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let map = self.read();
        let mut counts: Vec<(&str, usize)> = map
            .iter()
            .map(|(kind, handlers)| (kind.name(), handlers.len()))
            .collect();
        counts.sort_unstable();

        let mut dbg = f.debug_map();
        for (name, count) in counts {
            dbg.entry(&name, &count);
        }
        dbg.finish()
    }
}

/// Kind-bound registration handle, created by
/// [`Listener::registrar`] (or [`EventBus::registrar`](crate::EventBus::registrar)).
///
/// This is the explicit two-step equivalent of a curried `on(kind)`:
///
/// ```rust
/// use ripple::{event_type, Handler, Listener};
///
/// #[derive(Debug)]
/// struct Tick;
/// event_type!(Tick);
///
/// let listener = Listener::new();
/// let on_tick = listener.registrar::<Tick>();
/// on_tick.register(Handler::new("a", |_event| async { Ok(()) }))?;
/// on_tick.register(Handler::new("b", |_event| async { Ok(()) }))?;
/// # Ok::<(), ripple::Error>(())
/// ```
#[derive(Debug, Clone)]
pub struct Registrar {
    listener: Listener,
    kind: EventKind,
}

impl Registrar {
    /// Registers `handler` under the bound kind.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyRegistered`] for a duplicate pair.
    pub fn register(&self, handler: Handler) -> Result<()> {
        self.listener.insert(self.kind, handler)
    }

    /// The kind this registrar is bound to.
    #[inline]
    pub fn kind(&self) -> EventKind {
        self.kind
    }
}
