use std::{any::Any, fmt, sync::Arc};

use crate::{Cancellation, EventKind};

/// Trait for values dispatched through an [`EventBus`](crate::EventBus).
///
/// Events must be `Send + Sync + 'static` because they are wrapped in
/// `Arc<dyn Event>` and shared across concurrently running handlers, and
/// `Debug` so diagnostics can show the payload.
///
/// Use the [`event_type!`](crate::event_type) macro instead of implementing
/// this trait manually. The macro derives [`kind`](Event::kind),
/// [`propagation`](Event::propagation) and [`as_any`](Event::as_any) from an
/// explicitly declared ancestor list:
///
/// ```rust
/// use ripple::event_type;
///
/// #[derive(Debug)]
/// struct LifecycleEvent;
/// event_type!(LifecycleEvent);
///
/// #[derive(Debug)]
/// struct StartupEvent;
/// event_type!(StartupEvent: LifecycleEvent);
/// ```
///
/// Handlers registered for `LifecycleEvent` then fire for every
/// `StartupEvent` as well, in the pass corresponding to `LifecycleEvent`.
pub trait Event: Send + Sync + fmt::Debug + 'static {
    /// The concrete runtime type tag of this instance.
    fn kind(&self) -> EventKind;

    /// The propagation order: this type's kind first, then its ancestor
    /// event kinds, most specific first.
    ///
    /// The slice is fixed at declaration, never contains duplicates, and
    /// never includes a universal root type. Dispatch walks it front to
    /// back, one handler stage per kind.
    fn propagation(&self) -> &'static [EventKind];

    /// Upcast for downcasting support on `dyn Event`.
    fn as_any(&self) -> &dyn Any;

    /// The cooperative cancellation flag, for event types that opt in.
    ///
    /// Series emission checks this between handler invocations; see
    /// [`Cancellation`]. The default is `None` (not cancellable).
    fn cancellation(&self) -> Option<&Cancellation> {
        None
    }
}

impl dyn Event {
    /// Returns `true` if the concrete type of this event is `T`.
    #[inline]
    pub fn is<T: Event>(&self) -> bool {
        self.as_any().is::<T>()
    }

    /// Downcast to the concrete event type `T`.
    ///
    /// Note that a handler registered for an ancestor kind may receive any
    /// descendant type, so downcasts in such handlers should try each
    /// expected concrete type.
    #[inline]
    pub fn downcast_ref<T: Event>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }
}

// `<Event Name>` leads with the type tag only, never payload fields, so a
// payload referencing the event's own Arc cannot recurse here.
impl fmt::Display for dyn Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Event {}>", self.kind().name())
    }
}

/// Conversion into the shared event form the dispatcher works with.
///
/// Emission methods accept `impl IntoEvent`, so both an owned event value
/// and an already-shared `Arc<dyn Event>` (for example the current event a
/// handler wants to re-emit on another bus) can be passed directly.
pub trait IntoEvent {
    /// Convert into a shared event.
    fn into_event(self) -> Arc<dyn Event>;
}

impl<E: Event> IntoEvent for E {
    fn into_event(self) -> Arc<dyn Event> {
        Arc::new(self)
    }
}

impl IntoEvent for Arc<dyn Event> {
    fn into_event(self) -> Arc<dyn Event> {
        self
    }
}

/// Declares a type as an [`Event`] with an explicit ancestor list.
///
/// Forms:
///
/// ```rust,ignore
/// event_type!(MyEvent);                          // no ancestors
/// event_type!(MyEvent: ParentEvent);             // one ancestor
/// event_type!(MyEvent: Parent, Grandparent);     // full chain, most specific first
/// event_type!(MyEvent; cancel = flag);           // expose a Cancellation field
/// event_type!(MyEvent: Parent; cancel = flag);
/// ```
///
/// The ancestor list is the *complete* chain of ancestor event types, most
/// specific first; each listed type must itself implement [`Event`]. The
/// `cancel = field` form wires [`Event::cancellation`] to a
/// [`Cancellation`] field of the struct.
#[macro_export]
macro_rules! event_type {
    ($ty:ty $(: $($ancestor:ty),+ $(,)?)? ; cancel = $field:ident) => {
        impl $crate::Event for $ty {
            fn kind(&self) -> $crate::EventKind {
                $crate::EventKind::of::<$ty>()
            }

            fn propagation(&self) -> &'static [$crate::EventKind] {
                $crate::__propagation_path!($ty $(, $($ancestor),+)?)
            }

            fn as_any(&self) -> &dyn ::core::any::Any {
                self
            }

            fn cancellation(&self) -> ::core::option::Option<&$crate::Cancellation> {
                ::core::option::Option::Some(&self.$field)
            }
        }
    };
    ($ty:ty $(: $($ancestor:ty),+ $(,)?)?) => {
        impl $crate::Event for $ty {
            fn kind(&self) -> $crate::EventKind {
                $crate::EventKind::of::<$ty>()
            }

            fn propagation(&self) -> &'static [$crate::EventKind] {
                $crate::__propagation_path!($ty $(, $($ancestor),+)?)
            }

            fn as_any(&self) -> &dyn ::core::any::Any {
                self
            }
        }
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __propagation_path {
    ($($ty:ty),+) => {{
        static PATH: ::std::sync::OnceLock<::std::vec::Vec<$crate::EventKind>> =
            ::std::sync::OnceLock::new();
        PATH.get_or_init(|| ::std::vec![$($crate::EventKind::of::<$ty>()),+])
            .as_slice()
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct LifecycleEvent;
    event_type!(LifecycleEvent);

    #[derive(Debug)]
    struct StartupEvent {
        pub exit_code: i32,
    }
    event_type!(StartupEvent: LifecycleEvent);

    #[derive(Debug, Default)]
    struct StoppableEvent {
        flag: Cancellation,
    }
    event_type!(StoppableEvent; cancel = flag);

    #[test]
    fn propagation_is_most_specific_first() {
        let event = StartupEvent { exit_code: 0 };
        let kinds: Vec<_> = event.propagation().iter().map(|k| k.name()).collect();
        assert_eq!(kinds, ["StartupEvent", "LifecycleEvent"]);
    }

    #[test]
    fn propagation_of_root_is_just_itself() {
        assert_eq!(
            LifecycleEvent.propagation(),
            &[EventKind::of::<LifecycleEvent>()]
        );
    }

    #[test]
    fn propagation_has_no_duplicates() {
        let event = StartupEvent { exit_code: 0 };
        let path = event.propagation();
        for (i, kind) in path.iter().enumerate() {
            assert!(!path[i + 1..].contains(kind));
        }
    }

    #[test]
    fn downcast_through_dyn() {
        let event: Arc<dyn Event> = Arc::new(StartupEvent { exit_code: 7 });
        assert!(event.is::<StartupEvent>());
        assert!(!event.is::<LifecycleEvent>());
        assert_eq!(
            event.downcast_ref::<StartupEvent>().map(|e| e.exit_code),
            Some(7)
        );
    }

    #[test]
    fn display_shows_concrete_type_name() {
        let event: Arc<dyn Event> = Arc::new(StartupEvent { exit_code: 0 });
        assert_eq!(event.to_string(), "<Event StartupEvent>");
    }

    #[test]
    fn cancellation_wiring() {
        let plain = LifecycleEvent;
        assert!(plain.cancellation().is_none());

        let stoppable = StoppableEvent::default();
        let flag = stoppable.cancellation().expect("flag wired");
        assert!(!flag.is_canceled());
        flag.cancel();
        assert!(flag.is_canceled());
    }
}
