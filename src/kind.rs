use std::{any::TypeId, fmt, hash::Hash};

use crate::Event;

/// Runtime type tag for an event type.
///
/// `EventKind` is the key under which handlers are registered and the unit
/// the dispatcher walks when resolving a propagation order. It pairs the
/// type's [`TypeId`] with its short type name, so it is `Copy`, hashable,
/// and prints something a human can read.
///
/// Kinds are only obtainable for types implementing [`Event`], which is what
/// makes "register against a non-event type" a compile error rather than a
/// runtime one.
///
/// # Example
///
/// ```rust
/// use ripple::{event_type, EventKind};
///
/// #[derive(Debug)]
/// struct Tick;
/// event_type!(Tick);
///
/// assert_eq!(EventKind::of::<Tick>().name(), "Tick");
/// assert_eq!(EventKind::of::<Tick>(), EventKind::of::<Tick>());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventKind {
    id: TypeId,
    name: &'static str,
}

impl EventKind {
    /// Returns the kind tag for the event type `T`.
    #[must_use]
    pub fn of<T: Event>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: short_type_name::<T>(),
        }
    }

    /// The short type name, without module path.
    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The underlying [`TypeId`].
    #[inline]
    pub fn type_id(&self) -> TypeId {
        self.id
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

fn short_type_name<T>() -> &'static str {
    let full = std::any::type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}
