//! Projections (read model builders).
//!
//! Projections consume committed envelopes and maintain query-side views.
//! All of them are:
//! - **Rebuildable**: they can be reconstructed from the event store
//! - **Tenant-isolated**: records are partitioned by tenant
//! - **Idempotent**: safe under at-least-once delivery (per-stream cursors)

use std::sync::Arc;

use serde_json::Value as JsonValue;
use thiserror::Error;

use tally_clients::ClientId;
use tally_core::TenantId;
use tally_events::EventEnvelope;
use tally_invoicing::InvoiceId;

use crate::event_store::{EventStore, EventStoreError, StoredEvent};
use crate::read_model::InMemoryTenantStore;

pub mod billing_accounts;
pub mod clients;
pub mod cursor_store;
pub mod invoices;

pub use billing_accounts::{BILLING_AGGREGATE, BillingAccountReadModel, BillingAccountsProjection};
pub use clients::{CLIENT_AGGREGATE, ClientDirectoryProjection, ClientReadModel};
pub use cursor_store::{InMemoryCursorStore, PostgresCursorStore, ProjectionCursorStore, StreamCursors};
pub use invoices::{
    INVOICE_AGGREGATE, InvoiceFilter, InvoiceReadModel, InvoiceStats, InvoicesProjection, month_start,
};

#[derive(Debug, Error)]
pub enum ProjectionError {
    #[error("failed to deserialize event payload: {0}")]
    Deserialize(String),

    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),

    #[error("non-monotonic sequence number (last={last}, found={found})")]
    NonMonotonicSequence { last: u64, found: u64 },

    /// An update arrived for a record the projection never saw created.
    #[error("missing read model record: {0}")]
    MissingRecord(String),

    #[error("event store error: {0}")]
    Store(#[from] EventStoreError),
}

/// Collect `envelopes`, reset every tenant they touch and order them for a
/// deterministic replay (tenant, aggregate, sequence).
pub(crate) fn prepare_rebuild(
    envelopes: impl IntoIterator<Item = EventEnvelope<JsonValue>>,
    mut reset_tenant: impl FnMut(TenantId),
) -> Vec<EventEnvelope<JsonValue>> {
    let mut envs: Vec<_> = envelopes.into_iter().collect();

    let mut tenants = envs.iter().map(|e| e.tenant_id()).collect::<Vec<_>>();
    tenants.sort_by_key(|t| *t.as_uuid().as_bytes());
    tenants.dedup();
    for t in tenants {
        reset_tenant(t);
    }

    envs.sort_by_key(|e| {
        (
            *e.tenant_id().as_uuid().as_bytes(),
            *e.aggregate_id().as_uuid().as_bytes(),
            e.sequence_number(),
        )
    });
    envs
}

pub type InvoiceStore = Arc<InMemoryTenantStore<InvoiceId, InvoiceReadModel>>;
pub type ClientStore = Arc<InMemoryTenantStore<ClientId, ClientReadModel>>;
pub type BillingStore = Arc<InMemoryTenantStore<(), BillingAccountReadModel>>;

/// Every read model of the service layer, fed from the same envelopes.
#[derive(Debug)]
pub struct ReadModels {
    pub invoices: InvoicesProjection<InvoiceStore>,
    pub clients: ClientDirectoryProjection<ClientStore>,
    pub billing: BillingAccountsProjection<BillingStore>,
}

impl Default for ReadModels {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl ReadModels {
    pub fn in_memory() -> Self {
        Self {
            invoices: InvoicesProjection::new(Arc::new(InMemoryTenantStore::new())),
            clients: ClientDirectoryProjection::new(Arc::new(InMemoryTenantStore::new())),
            billing: BillingAccountsProjection::new(Arc::new(InMemoryTenantStore::new())),
        }
    }

    /// In-memory records with cursors kept in `cursors`. Records do not
    /// survive a restart while durable cursors do, so call
    /// [`ReadModels::rebuild_tenant`] before serving a tenant.
    pub fn with_cursor_store(cursors: Arc<dyn ProjectionCursorStore>) -> Self {
        Self {
            invoices: InvoicesProjection::with_cursors(
                Arc::new(InMemoryTenantStore::new()),
                StreamCursors::with_store("invoicing.invoices", cursors.clone()),
            ),
            clients: ClientDirectoryProjection::with_cursors(
                Arc::new(InMemoryTenantStore::new()),
                StreamCursors::with_store("clients.directory", cursors.clone()),
            ),
            billing: BillingAccountsProjection::with_cursors(
                Arc::new(InMemoryTenantStore::new()),
                StreamCursors::with_store("billing.accounts", cursors),
            ),
        }
    }

    /// Route one envelope to every projection; each ignores foreign aggregate types.
    pub fn apply_envelope(&self, envelope: &EventEnvelope<JsonValue>) -> Result<(), ProjectionError> {
        self.invoices.apply_envelope(envelope)?;
        self.clients.apply_envelope(envelope)?;
        self.billing.apply_envelope(envelope)
    }

    pub fn apply(&self, committed: &[StoredEvent]) -> Result<(), ProjectionError> {
        for stored in committed {
            self.apply_envelope(&stored.to_envelope())?;
        }
        Ok(())
    }

    /// Drop and replay one tenant's read models from the event store.
    #[tracing::instrument(skip(self, store), fields(tenant_id = %tenant_id), err)]
    pub fn rebuild_tenant<S: EventStore>(&self, store: &S, tenant_id: TenantId) -> Result<(), ProjectionError> {
        let envelopes = |aggregate_type: &str| -> Result<Vec<EventEnvelope<JsonValue>>, ProjectionError> {
            Ok(store
                .load_tenant_events(tenant_id, aggregate_type)?
                .iter()
                .map(StoredEvent::to_envelope)
                .collect())
        };

        self.clients.rebuild_from_scratch(envelopes(CLIENT_AGGREGATE)?)?;
        self.invoices.rebuild_from_scratch(envelopes(INVOICE_AGGREGATE)?)?;
        self.billing.rebuild_from_scratch(envelopes(BILLING_AGGREGATE)?)?;
        Ok(())
    }
}
