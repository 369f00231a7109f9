use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use std::sync::Arc;
use tally_core::{AggregateId, ExpectedVersion, TenantId};

/// An event decided by an aggregate but not yet written.
///
/// The store assigns the `sequence_number` on append. Build one from a typed
/// domain event with [`UncommittedEvent::from_typed`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UncommittedEvent {
    pub event_id: Uuid,
    pub tenant_id: TenantId,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,

    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,

    pub payload: JsonValue,
}

/// A committed event of a `(tenant_id, aggregate_id)` stream.
///
/// Sequence numbers start at 1, increase by one per event and are never
/// reassigned. The sequence number of the last event is the stream version that
/// `ExpectedVersion::Exact` is checked against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event_id: Uuid,
    pub tenant_id: TenantId,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,

    pub sequence_number: u64,

    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,

    pub payload: JsonValue,
}

impl StoredEvent {
    pub fn stream_version(&self) -> u64 {
        self.sequence_number
    }

    /// Tenant-scoped envelope for the bus and the projections.
    pub fn to_envelope(&self) -> tally_events::EventEnvelope<JsonValue> {
        tally_events::EventEnvelope::new(
            self.event_id,
            self.tenant_id,
            self.aggregate_id,
            self.aggregate_type.clone(),
            self.sequence_number,
            self.payload.clone(),
        )
    }

    /// Decode the payload into the aggregate's event type.
    pub fn decode<E>(&self) -> Result<E, EventStoreError>
    where
        E: serde::de::DeserializeOwned,
    {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            EventStoreError::InvalidAppend(format!(
                "cannot decode '{}' at sequence {}: {e}",
                self.event_type, self.sequence_number
            ))
        })
    }
}

/// Storage-level failure.
///
/// Business rule failures never show up here; they are `DomainError`s raised by
/// the aggregates before anything is appended.
#[derive(Debug, Error)]
pub enum EventStoreError {
    /// The stream moved since it was loaded (another writer won the race).
    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),

    #[error("aggregate type mismatch: {0}")]
    AggregateTypeMismatch(String),

    #[error("invalid append: {0}")]
    InvalidAppend(String),

    /// The append committed but fan-out to the bus failed.
    #[error("event publication failed: {0}")]
    Publish(String),
}

impl EventStoreError {
    pub fn is_concurrency(&self) -> bool {
        matches!(self, EventStoreError::Concurrency(_))
    }
}

/// Append-only, tenant-scoped event store.
///
/// One stream per aggregate instance, keyed by `(tenant_id, aggregate_id)`.
/// A stream keeps the aggregate type of its first event. An append is atomic
/// and checked against the caller's `ExpectedVersion`; this check is what keeps
/// invoice numbers unique and payment confirmations single.
pub trait EventStore: Send + Sync {
    /// Append a batch to one stream.
    ///
    /// Every event in the batch must carry the same tenant, aggregate and
    /// aggregate type. Sequence numbers continue from the current version.
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Full stream in sequence order; empty when the aggregate does not exist.
    fn load_stream(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Every event of one tenant for one aggregate type, ordered by stream and
    /// sequence. Used to rebuild read models.
    fn load_tenant_events(
        &self,
        tenant_id: TenantId,
        aggregate_type: &str,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;
}

impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).append(events, expected_version)
    }

    fn load_stream(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).load_stream(tenant_id, aggregate_id)
    }

    fn load_tenant_events(
        &self,
        tenant_id: TenantId,
        aggregate_type: &str,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).load_tenant_events(tenant_id, aggregate_type)
    }
}

impl UncommittedEvent {
    /// Wrap a typed domain event, capturing its type name, schema version and
    /// business time next to the JSON payload.
    pub fn from_typed<E>(
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        event_id: Uuid,
        event: &E,
    ) -> Result<Self, EventStoreError>
    where
        E: tally_events::Event + Serialize,
    {
        let payload = serde_json::to_value(event)
            .map_err(|e| EventStoreError::InvalidAppend(format!("payload serialization failed: {e}")))?;

        Ok(Self {
            event_id,
            tenant_id,
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            event_type: event.event_type().to_string(),
            event_version: event.version(),
            occurred_at: event.occurred_at(),
            payload,
        })
    }
}
