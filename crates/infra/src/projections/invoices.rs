use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use serde_json::Value as JsonValue;

use tally_clients::ClientId;
use tally_core::{Money, TaxRate, TenantId};
use tally_events::EventEnvelope;
use tally_invoicing::{
    InvoiceEvent, InvoiceId, InvoiceNumber, InvoiceStatus, InvoiceTotals, LineItem, PaymentMethod,
    PaymentRecord, PaymentStatus,
};

use super::ProjectionError;
use super::cursor_store::{CursorDecision, StreamCursors};
use crate::read_model::TenantStore;

pub const INVOICE_AGGREGATE: &str = "invoicing.invoice";

/// Queryable invoice: header, items, totals and payment history.
///
/// `status` is the persisted status. Reads through [`InvoicesProjection`] return
/// it with the overdue predicate already applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceReadModel {
    pub invoice_id: InvoiceId,
    pub client_id: ClientId,
    pub number: InvoiceNumber,
    pub status: InvoiceStatus,
    pub issue_date: NaiveDate,
    pub due_date: NaiveDate,
    pub items: Vec<LineItem>,
    pub tax_rate: TaxRate,
    pub totals: InvoiceTotals,
    pub notes: Option<String>,
    pub terms: Option<String>,
    pub paid_amount: Option<Money>,
    pub paid_at: Option<DateTime<Utc>>,
    pub payment_method: Option<PaymentMethod>,
    pub payment_ref: Option<String>,
    pub payments: Vec<PaymentRecord>,
    pub reminder_count: u32,
    pub reminder_sent_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl InvoiceReadModel {
    pub fn is_overdue(&self, today: NaiveDate) -> bool {
        self.status == InvoiceStatus::Pending && today > self.due_date
    }

    pub fn effective_status(&self, today: NaiveDate) -> InvoiceStatus {
        if self.is_overdue(today) {
            InvoiceStatus::Overdue
        } else {
            self.status
        }
    }

    fn observed(mut self, today: NaiveDate) -> Self {
        self.status = self.effective_status(today);
        self
    }
}

/// `listInvoices` filters. Status matches the effective status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InvoiceFilter {
    pub status: Option<InvoiceStatus>,
    pub client_id: Option<ClientId>,
}

/// Dashboard figures for one tenant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InvoiceStats {
    pub total_invoices: u32,
    pub draft: u32,
    pub pending: u32,
    pub overdue: u32,
    pub paid: u32,
    pub cancelled: u32,
    /// Totals of pending and overdue invoices.
    pub outstanding_amount: Money,
    pub overdue_amount: Money,
    /// Sum of paid amounts.
    pub collected_amount: Money,
    pub created_this_month: u32,
}

/// Builds [`InvoiceReadModel`]s from `invoicing.invoice` streams.
#[derive(Debug)]
pub struct InvoicesProjection<S>
where
    S: TenantStore<InvoiceId, InvoiceReadModel>,
{
    store: S,
    cursors: StreamCursors,
}

impl<S> InvoicesProjection<S>
where
    S: TenantStore<InvoiceId, InvoiceReadModel>,
{
    pub fn new(store: S) -> Self {
        Self::with_cursors(store, StreamCursors::new("invoicing.invoices"))
    }

    pub fn with_cursors(store: S, cursors: StreamCursors) -> Self {
        Self { store, cursors }
    }

    pub fn get(&self, tenant_id: TenantId, invoice_id: &InvoiceId, today: NaiveDate) -> Option<InvoiceReadModel> {
        self.store
            .get(tenant_id, invoice_id)
            .map(|rm| rm.observed(today))
    }

    /// Newest number first.
    pub fn list(&self, tenant_id: TenantId, filter: &InvoiceFilter, today: NaiveDate) -> Vec<InvoiceReadModel> {
        let mut invoices: Vec<InvoiceReadModel> = self
            .store
            .list(tenant_id)
            .into_iter()
            .map(|rm| rm.observed(today))
            .filter(|rm| filter.status.is_none_or(|s| rm.status == s))
            .filter(|rm| filter.client_id.is_none_or(|c| rm.client_id == c))
            .collect();
        invoices.sort_by(|a, b| b.number.cmp(&a.number));
        invoices
    }

    pub fn find_by_number(&self, tenant_id: TenantId, number: &InvoiceNumber) -> Option<InvoiceReadModel> {
        self.store
            .list(tenant_id)
            .into_iter()
            .find(|rm| rm.number == *number)
    }

    /// Invoices created on or after `since` (monthly plan usage).
    pub fn created_since(&self, tenant_id: TenantId, since: DateTime<Utc>) -> u32 {
        let count = self
            .store
            .list(tenant_id)
            .iter()
            .filter(|rm| rm.created_at >= since)
            .count();
        u32::try_from(count).unwrap_or(u32::MAX)
    }

    pub fn references_client(&self, tenant_id: TenantId, client_id: ClientId) -> bool {
        self.store
            .list(tenant_id)
            .iter()
            .any(|rm| rm.client_id == client_id)
    }

    /// Pending invoices whose due date has passed and are not yet stored as overdue.
    pub fn overdue_candidates(&self, tenant_id: TenantId, today: NaiveDate) -> Vec<InvoiceId> {
        let mut due: Vec<InvoiceReadModel> = self
            .store
            .list(tenant_id)
            .into_iter()
            .filter(|rm| rm.is_overdue(today))
            .collect();
        due.sort_by_key(|rm| rm.number);
        due.into_iter().map(|rm| rm.invoice_id).collect()
    }

    pub fn stats(&self, tenant_id: TenantId, now: DateTime<Utc>) -> InvoiceStats {
        let today = now.date_naive();
        let month_start = month_start(now);
        let mut stats = InvoiceStats::default();

        for rm in self.store.list(tenant_id) {
            stats.total_invoices += 1;
            if rm.created_at >= month_start {
                stats.created_this_month += 1;
            }
            match rm.effective_status(today) {
                InvoiceStatus::Draft => stats.draft += 1,
                InvoiceStatus::Pending => {
                    stats.pending += 1;
                    stats.outstanding_amount = stats.outstanding_amount.saturating_add(rm.totals.total);
                }
                InvoiceStatus::Overdue => {
                    stats.overdue += 1;
                    stats.outstanding_amount = stats.outstanding_amount.saturating_add(rm.totals.total);
                    stats.overdue_amount = stats.overdue_amount.saturating_add(rm.totals.total);
                }
                InvoiceStatus::Paid => {
                    stats.paid += 1;
                    let paid = rm.paid_amount.unwrap_or(rm.totals.total);
                    stats.collected_amount = stats.collected_amount.saturating_add(paid);
                }
                InvoiceStatus::Cancelled => stats.cancelled += 1,
            }
        }

        stats
    }

    pub fn apply_envelope(&self, envelope: &EventEnvelope<JsonValue>) -> Result<(), ProjectionError> {
        if envelope.aggregate_type() != INVOICE_AGGREGATE {
            return Ok(());
        }

        let seq = match self.cursors.decide(envelope)? {
            CursorDecision::Skip => return Ok(()),
            CursorDecision::Apply(seq) => seq,
        };

        let tenant_id = envelope.tenant_id();
        let aggregate_id = envelope.aggregate_id();

        let ev: InvoiceEvent = serde_json::from_value(envelope.payload().clone())
            .map_err(|e| ProjectionError::Deserialize(e.to_string()))?;

        let event_tenant = match &ev {
            InvoiceEvent::InvoiceCreated(e) => e.tenant_id,
            InvoiceEvent::ItemsReplaced(e) => e.tenant_id,
            InvoiceEvent::InvoiceDetailsUpdated(e) => e.tenant_id,
            InvoiceEvent::InvoiceSent(e) => e.tenant_id,
            InvoiceEvent::ReminderSent(e) => e.tenant_id,
            InvoiceEvent::InvoicePaid(e) => e.tenant_id,
            InvoiceEvent::PaymentFailed(e) => e.tenant_id,
            InvoiceEvent::InvoiceMarkedOverdue(e) => e.tenant_id,
            InvoiceEvent::InvoiceCancelled(e) => e.tenant_id,
            InvoiceEvent::InvoiceDeleted(e) => e.tenant_id,
        };
        if event_tenant != tenant_id {
            return Err(ProjectionError::TenantIsolation(
                "event tenant_id does not match envelope tenant_id".to_string(),
            ));
        }
        let invoice_id = ev.invoice_id();
        if invoice_id.0 != aggregate_id {
            return Err(ProjectionError::TenantIsolation(
                "event invoice_id does not match envelope aggregate_id".to_string(),
            ));
        }

        match ev {
            InvoiceEvent::InvoiceCreated(e) => {
                self.store.upsert(
                    tenant_id,
                    invoice_id,
                    InvoiceReadModel {
                        invoice_id,
                        client_id: e.client_id,
                        number: e.number,
                        status: e.status,
                        issue_date: e.issue_date,
                        due_date: e.due_date,
                        items: e.items,
                        tax_rate: e.tax_rate,
                        totals: e.totals,
                        notes: e.notes,
                        terms: e.terms,
                        paid_amount: None,
                        paid_at: None,
                        payment_method: None,
                        payment_ref: None,
                        payments: vec![],
                        reminder_count: 0,
                        reminder_sent_at: None,
                        sent_at: (e.status == InvoiceStatus::Pending).then_some(e.occurred_at),
                        created_at: e.occurred_at,
                    },
                );
            }
            InvoiceEvent::InvoiceDeleted(_) => {
                self.store.remove(tenant_id, &invoice_id);
            }
            other => {
                let mut rm = self.store.get(tenant_id, &invoice_id).ok_or_else(|| {
                    ProjectionError::MissingRecord(format!("invoice {invoice_id} has no read model"))
                })?;
                evolve(&mut rm, other);
                self.store.upsert(tenant_id, invoice_id, rm);
            }
        }

        self.cursors.advance(tenant_id, aggregate_id, seq);
        Ok(())
    }

    /// Clear the tenants present in `envelopes` and replay them in stream order.
    pub fn rebuild_from_scratch(
        &self,
        envelopes: impl IntoIterator<Item = EventEnvelope<JsonValue>>,
    ) -> Result<(), ProjectionError> {
        let envelopes = super::prepare_rebuild(envelopes, |tenant_id| {
            self.store.clear_tenant(tenant_id);
            self.cursors.clear(tenant_id);
        });
        for env in &envelopes {
            self.apply_envelope(env)?;
        }
        Ok(())
    }
}

fn evolve(rm: &mut InvoiceReadModel, event: InvoiceEvent) {
    match event {
        InvoiceEvent::ItemsReplaced(e) => {
            rm.items = e.items;
            rm.totals = e.totals;
        }
        InvoiceEvent::InvoiceDetailsUpdated(e) => {
            rm.due_date = e.due_date;
            rm.tax_rate = e.tax_rate;
            rm.totals = e.totals;
            rm.notes = e.notes;
            rm.terms = e.terms;
        }
        InvoiceEvent::InvoiceSent(e) => {
            if rm.status == InvoiceStatus::Draft {
                rm.status = InvoiceStatus::Pending;
            }
            rm.sent_at = Some(e.occurred_at);
        }
        InvoiceEvent::ReminderSent(e) => {
            rm.reminder_count = e.reminder_count;
            rm.reminder_sent_at = Some(e.occurred_at);
        }
        InvoiceEvent::InvoicePaid(e) => {
            rm.status = InvoiceStatus::Paid;
            rm.paid_amount = Some(e.amount);
            rm.paid_at = Some(e.occurred_at);
            rm.payment_method = Some(e.method.clone());
            rm.payment_ref = e.external_ref.clone();
            rm.payments.push(PaymentRecord {
                amount: e.amount,
                method: e.method,
                external_ref: e.external_ref,
                status: PaymentStatus::Completed,
                recorded_at: e.occurred_at,
            });
        }
        InvoiceEvent::PaymentFailed(e) => {
            rm.payments.push(PaymentRecord {
                amount: e.amount,
                method: e.method,
                external_ref: e.external_ref,
                status: PaymentStatus::Failed,
                recorded_at: e.occurred_at,
            });
        }
        InvoiceEvent::InvoiceMarkedOverdue(_) => rm.status = InvoiceStatus::Overdue,
        InvoiceEvent::InvoiceCancelled(_) => rm.status = InvoiceStatus::Cancelled,
        InvoiceEvent::InvoiceCreated(_) | InvoiceEvent::InvoiceDeleted(_) => {}
    }
}

/// Midnight UTC on the first day of `now`'s month.
pub fn month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(now.year(), now.month(), 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| Utc.from_utc_datetime(&dt))
        .unwrap_or(now)
}
