#![cfg_attr(docsrs, feature(doc_cfg))]
//! # Ripple
//!
//! An in-process async event bus for Tokio.
//!
//! Ripple routes typed events to async handlers without channels or spawned
//! tasks. Declare event types with a propagation hierarchy, hang handlers on
//! a bus (directly or grouped in listeners), and emit: every handler whose
//! kind appears in the event's propagation order runs, most specific kind
//! first. Buses compose through piping, so one emission can fan out across a
//! whole tree of buses.
//!
//! ## Quick Start
//!
//! ```rust
//! use ripple::{event_type, EventBus, Handler};
//!
//! #[derive(Debug)]
//! struct LifecycleEvent;
//! event_type!(LifecycleEvent);
//!
//! #[derive(Debug)]
//! struct StartupEvent {
//!     port: u16,
//! }
//! event_type!(StartupEvent: LifecycleEvent);
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> ripple::Result {
//!     let bus = EventBus::new();
//!
//!     bus.on::<StartupEvent>(Handler::new("announce", |event| async move {
//!         let startup = event.downcast_ref::<StartupEvent>().ok_or("wrong event")?;
//!         println!("listening on port {}", startup.port);
//!         Ok(())
//!     }))?;
//!     bus.on::<LifecycleEvent>(Handler::new("audit", |event| async move {
//!         println!("lifecycle: {event}");
//!         Ok(())
//!     }))?;
//!
//!     // Runs "announce", then "audit" (most specific kind first).
//!     bus.emit_series(StartupEvent { port: 8080 }).await
//! }
//! ```
//!
//! ## Core Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Event`] | Trait for event payloads (implement via [`event_type!`]) |
//! | [`EventKind`] | Type-level identity of an event, the routing key |
//! | [`Handler`] | Named async callback with a stable identity |
//! | [`Listener`] | A detachable group of kind → handler registrations |
//! | [`EventBus`] | Dispatches events to listeners and piped child buses |
//! | [`Cancellation`] | One-shot flag that halts the emitting bus's remaining stages |
//! | [`Error`] | Everything that can go wrong registering or emitting |
//!
//! ## Emission Strategies
//!
//! | Method | Delivery | Error policy |
//! |--------|----------|--------------|
//! | [`EventBus::emit_series`] | one handler at a time, strictly ordered | fail fast |
//! | [`EventBus::emit_parallel`] | all handlers concurrently | fail fast |
//! | [`EventBus::emit_parallel_collect`] | all handlers concurrently | collect every failure |
//!
//! All three run handlers cooperatively inside the emitting task. Nothing is
//! spawned, so emission needs no `'static` gymnastics and inherits the
//! caller's cancellation.
//!
//! ## Ambient Current Event
//!
//! While a dispatch is in flight, [`current_event`] exposes the event being
//! delivered to any code in the same task, however deep in the call stack.
//! Handlers that re-emit into another bus nest cleanly.
//!
//! ## Features
//!
//! - **`serde`** - JSON topology export ([`EventBus::to_json`])

mod bus;
mod cancel;
mod context;
mod error;
mod event;
mod handler;
mod kind;
mod listener;

pub use bus::EventBus;
pub use cancel::Cancellation;
pub use context::{current_event, try_current_event};
pub use error::{Error, HandlerError};
pub use event::{Event, IntoEvent};
pub use handler::{Handler, HandlerId, HandlerResult};
pub use kind::EventKind;
pub use listener::{Listener, Registrar};

/// Convenience alias for `Result<T, ripple::Error>`.
pub type Result<T = ()> = std::result::Result<T, Error>;
