//! Append-only event store boundary.
//!
//! Aggregates are persisted as tenant-scoped event streams. The in-memory store
//! backs tests and local runs; the Postgres store is the durable backend.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use r#trait::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};
