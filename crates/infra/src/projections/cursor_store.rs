//! Projection cursors: the last applied sequence number per
//! `(tenant, aggregate, projection)`.
//!
//! Replays at or below the cursor are skipped, which makes every projection
//! safe under at-least-once delivery. Clearing a tenant's cursors together
//! with its records gives a deterministic rebuild.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use sqlx::{PgPool, Row};
use tokio::runtime::Handle;

use tally_core::{AggregateId, TenantId};
use tally_events::EventEnvelope;

use super::ProjectionError;

/// Durable cursor storage shared by projections.
pub trait ProjectionCursorStore: Send + Sync {
    fn get_cursor(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        projection_name: &str,
    ) -> Option<u64>;

    fn update_cursor(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        projection_name: &str,
        sequence_number: u64,
    );

    fn clear_cursors(&self, tenant_id: TenantId, projection_name: &str);
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
struct CursorKey {
    tenant_id: TenantId,
    aggregate_id: AggregateId,
}

/// Process-local cursor store.
#[derive(Debug, Default)]
pub struct InMemoryCursorStore {
    cursors: RwLock<HashMap<(CursorKey, String), u64>>,
}

impl InMemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProjectionCursorStore for InMemoryCursorStore {
    fn get_cursor(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        projection_name: &str,
    ) -> Option<u64> {
        let cursors = self.cursors.read().ok()?;
        cursors
            .get(&(CursorKey { tenant_id, aggregate_id }, projection_name.to_string()))
            .copied()
    }

    fn update_cursor(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        projection_name: &str,
        sequence_number: u64,
    ) {
        if let Ok(mut cursors) = self.cursors.write() {
            cursors.insert(
                (CursorKey { tenant_id, aggregate_id }, projection_name.to_string()),
                sequence_number,
            );
        }
    }

    fn clear_cursors(&self, tenant_id: TenantId, projection_name: &str) {
        if let Ok(mut cursors) = self.cursors.write() {
            cursors.retain(|(key, name), _| key.tenant_id != tenant_id || name != projection_name);
        }
    }
}

/// Postgres-backed cursor store (`projection_offsets` table).
///
/// Like [`crate::event_store::PostgresEventStore`], it blocks on the given
/// runtime handle and must not be called from async code.
#[derive(Debug)]
pub struct PostgresCursorStore {
    pool: Arc<PgPool>,
    runtime: Handle,
}

impl PostgresCursorStore {
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime,
        }
    }
}

impl ProjectionCursorStore for PostgresCursorStore {
    fn get_cursor(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        projection_name: &str,
    ) -> Option<u64> {
        let row = self
            .runtime
            .block_on(
                sqlx::query(
                    r#"
                    SELECT last_sequence_number
                    FROM projection_offsets
                    WHERE tenant_id = $1 AND aggregate_id = $2 AND projection_name = $3
                    "#,
                )
                .bind(tenant_id.as_uuid())
                .bind(aggregate_id.as_uuid())
                .bind(projection_name)
                .fetch_optional(&*self.pool),
            )
            .map_err(|e| tracing::warn!(error = %e, projection_name, "cursor read failed"))
            .ok()??;

        row.try_get::<i64, _>("last_sequence_number")
            .ok()
            .map(|seq| seq as u64)
    }

    fn update_cursor(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        projection_name: &str,
        sequence_number: u64,
    ) {
        let result = self.runtime.block_on(
            sqlx::query(
                r#"
                INSERT INTO projection_offsets (tenant_id, aggregate_id, projection_name, last_sequence_number)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (tenant_id, aggregate_id, projection_name)
                DO UPDATE SET last_sequence_number = EXCLUDED.last_sequence_number, updated_at = NOW()
                "#,
            )
            .bind(tenant_id.as_uuid())
            .bind(aggregate_id.as_uuid())
            .bind(projection_name)
            .bind(sequence_number as i64)
            .execute(&*self.pool),
        );
        if let Err(e) = result {
            tracing::warn!(error = %e, projection_name, "cursor update failed");
        }
    }

    fn clear_cursors(&self, tenant_id: TenantId, projection_name: &str) {
        let result = self.runtime.block_on(
            sqlx::query("DELETE FROM projection_offsets WHERE tenant_id = $1 AND projection_name = $2")
                .bind(tenant_id.as_uuid())
                .bind(projection_name)
                .execute(&*self.pool),
        );
        if let Err(e) = result {
            tracing::warn!(error = %e, projection_name, "cursor reset failed");
        }
    }
}

/// What a projection should do with an incoming envelope.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CursorDecision {
    /// Next event of the stream: apply, then advance.
    Apply(u64),
    /// Already applied (redelivery).
    Skip,
}

/// Per-stream cursors of one named projection.
pub struct StreamCursors {
    projection_name: String,
    store: Arc<dyn ProjectionCursorStore>,
}

impl StreamCursors {
    pub fn new(projection_name: impl Into<String>) -> Self {
        Self::with_store(projection_name, Arc::new(InMemoryCursorStore::new()))
    }

    pub fn with_store(projection_name: impl Into<String>, store: Arc<dyn ProjectionCursorStore>) -> Self {
        Self {
            projection_name: projection_name.into(),
            store,
        }
    }

    pub fn projection_name(&self) -> &str {
        &self.projection_name
    }

    pub fn position(&self, tenant_id: TenantId, aggregate_id: AggregateId) -> u64 {
        self.store
            .get_cursor(tenant_id, aggregate_id, &self.projection_name)
            .unwrap_or(0)
    }

    /// Gapless, at-least-once check against the stream's cursor.
    pub fn decide<P>(&self, envelope: &EventEnvelope<P>) -> Result<CursorDecision, ProjectionError> {
        let seq = envelope.sequence_number();
        let last = self.position(envelope.tenant_id(), envelope.aggregate_id());

        if seq == 0 {
            return Err(ProjectionError::NonMonotonicSequence { last, found: seq });
        }
        if seq <= last {
            return Ok(CursorDecision::Skip);
        }
        if seq != last + 1 {
            return Err(ProjectionError::NonMonotonicSequence { last, found: seq });
        }
        Ok(CursorDecision::Apply(seq))
    }

    pub fn advance(&self, tenant_id: TenantId, aggregate_id: AggregateId, seq: u64) {
        self.store
            .update_cursor(tenant_id, aggregate_id, &self.projection_name, seq);
    }

    pub fn clear(&self, tenant_id: TenantId) {
        self.store.clear_cursors(tenant_id, &self.projection_name);
    }
}

impl core::fmt::Debug for StreamCursors {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StreamCursors")
            .field("projection_name", &self.projection_name)
            .finish_non_exhaustive()
    }
}
