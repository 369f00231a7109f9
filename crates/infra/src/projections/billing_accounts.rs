use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use tally_billing::{BillingAccount, BillingEvent, PlanTier, Subscription};
use tally_core::{Aggregate, TenantId};
use tally_events::EventEnvelope;

use super::ProjectionError;
use super::cursor_store::{CursorDecision, StreamCursors};
use crate::read_model::TenantStore;

pub const BILLING_AGGREGATE: &str = "billing.account";

/// Billing summary of one tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BillingAccountReadModel {
    pub tenant_id: TenantId,
    pub plan: PlanTier,
    pub plan_expires_at: Option<DateTime<Utc>>,
    pub customer_id: Option<String>,
    pub subscription: Option<Subscription>,
    account: BillingAccount,
}

impl BillingAccountReadModel {
    pub fn effective_plan(&self, now: DateTime<Utc>) -> PlanTier {
        self.account.effective_plan(now)
    }

    fn refresh(&mut self) {
        self.plan = self.account.plan();
        self.plan_expires_at = self.account.plan_expires_at();
        self.customer_id = self.account.customer_id().map(str::to_string);
        self.subscription = self.account.subscription().cloned();
    }
}

/// One record per tenant, plus process-wide indexes from processor customer and
/// subscription ids back to the owning tenant.
#[derive(Debug)]
pub struct BillingAccountsProjection<S>
where
    S: TenantStore<(), BillingAccountReadModel>,
{
    store: S,
    cursors: StreamCursors,
    customers: RwLock<HashMap<String, TenantId>>,
    subscriptions: RwLock<HashMap<String, TenantId>>,
}

impl<S> BillingAccountsProjection<S>
where
    S: TenantStore<(), BillingAccountReadModel>,
{
    pub fn new(store: S) -> Self {
        Self::with_cursors(store, StreamCursors::new("billing.accounts"))
    }

    pub fn with_cursors(store: S, cursors: StreamCursors) -> Self {
        Self {
            store,
            cursors,
            customers: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, tenant_id: TenantId) -> Option<BillingAccountReadModel> {
        self.store.get(tenant_id, &())
    }

    pub fn tenant_for_customer(&self, customer_id: &str) -> Option<TenantId> {
        self.customers.read().ok()?.get(customer_id).copied()
    }

    pub fn tenant_for_subscription(&self, subscription_id: &str) -> Option<TenantId> {
        self.subscriptions.read().ok()?.get(subscription_id).copied()
    }

    pub fn apply_envelope(&self, envelope: &EventEnvelope<JsonValue>) -> Result<(), ProjectionError> {
        if envelope.aggregate_type() != BILLING_AGGREGATE {
            return Ok(());
        }

        let seq = match self.cursors.decide(envelope)? {
            CursorDecision::Skip => return Ok(()),
            CursorDecision::Apply(seq) => seq,
        };

        let tenant_id = envelope.tenant_id();
        let ev: BillingEvent = serde_json::from_value(envelope.payload().clone())
            .map_err(|e| ProjectionError::Deserialize(e.to_string()))?;
        if ev.tenant_id() != tenant_id {
            return Err(ProjectionError::TenantIsolation(
                "event tenant_id does not match envelope tenant_id".to_string(),
            ));
        }
        if envelope.aggregate_id() != BillingAccount::stream_id(tenant_id) {
            return Err(ProjectionError::TenantIsolation(
                "billing event outside the tenant's account stream".to_string(),
            ));
        }

        let mut rm = self.store.get(tenant_id, &()).unwrap_or_else(|| {
            let account = BillingAccount::empty(envelope.aggregate_id());
            BillingAccountReadModel {
                tenant_id,
                plan: account.plan(),
                plan_expires_at: None,
                customer_id: None,
                subscription: None,
                account,
            }
        });
        rm.account.apply(&ev);
        rm.refresh();
        self.index(tenant_id, &rm.account);
        self.store.upsert(tenant_id, (), rm);

        self.cursors.advance(tenant_id, envelope.aggregate_id(), seq);
        Ok(())
    }

    /// Earlier ids keep pointing at the tenant so late events still resolve.
    fn index(&self, tenant_id: TenantId, account: &BillingAccount) {
        if let Some(customer_id) = account.customer_id() {
            if let Ok(mut customers) = self.customers.write() {
                customers.insert(customer_id.to_string(), tenant_id);
            }
        }

        let subscription_ids = account
            .subscription_id()
            .into_iter()
            .chain(account.subscription().map(|s| s.external_id.as_str()));
        if let Ok(mut subscriptions) = self.subscriptions.write() {
            for id in subscription_ids {
                subscriptions.insert(id.to_string(), tenant_id);
            }
        }
    }

    fn clear_tenant(&self, tenant_id: TenantId) {
        self.store.clear_tenant(tenant_id);
        self.cursors.clear(tenant_id);
        if let Ok(mut customers) = self.customers.write() {
            customers.retain(|_, t| *t != tenant_id);
        }
        if let Ok(mut subscriptions) = self.subscriptions.write() {
            subscriptions.retain(|_, t| *t != tenant_id);
        }
    }

    pub fn rebuild_from_scratch(
        &self,
        envelopes: impl IntoIterator<Item = EventEnvelope<JsonValue>>,
    ) -> Result<(), ProjectionError> {
        let envelopes = super::prepare_rebuild(envelopes, |tenant_id| self.clear_tenant(tenant_id));
        for env in &envelopes {
            self.apply_envelope(env)?;
        }
        Ok(())
    }
}
