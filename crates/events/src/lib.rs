//! Event primitives shared by every event-sourced aggregate in the workspace.
//!
//! Aggregates emit typed events implementing [`Event`]; the infrastructure wraps
//! them in tenant-scoped [`EventEnvelope`]s and fans them out over an [`EventBus`].

pub mod bus;
pub mod envelope;
pub mod event;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use envelope::EventEnvelope;
pub use event::Event;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
