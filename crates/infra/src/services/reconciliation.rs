//! Applies verified payment-processor events to billing accounts and invoices.
//!
//! Every effect is idempotent: account-level effects record the processor event
//! id on the tenant's billing account, invoice payments are keyed by the
//! processor's payment reference. Redelivering an event yields
//! [`ReconcileOutcome::Duplicate`] and appends nothing.

use std::sync::Arc;

use serde_json::Value as JsonValue;
use tracing::{debug, info, instrument, warn};

use tally_billing::{
    AcknowledgeEvent, BillingAccount, BillingCommand, CheckoutSession, CompleteCheckout,
    EndSubscription, PaymentIntent, PlanTier, ProcessorEvent, ProcessorEventKind,
    ProcessorEventRef, ProcessorInvoice, ProcessorInvoiceOutcome, RecordProcessorInvoice,
    Subscription, SubscriptionObject, SubscriptionStatus, SyncSubscription,
};
use tally_core::TenantId;
use tally_events::{EventBus, EventEnvelope};
use tally_invoicing::{
    Invoice, InvoiceCommand, InvoiceId, InvoiceStatus, MarkInvoicePaid, PaymentMethod,
    RecordFailedPayment,
};

use super::error::ServiceError;
use super::invoicing::InvoicingService;
use crate::event_store::EventStore;
use crate::projections::{BILLING_AGGREGATE, INVOICE_AGGREGATE};

/// What reconciliation did with one processor event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Applied { tenant_id: TenantId, effect: ReconcileEffect },
    /// Already applied earlier; nothing changed.
    Duplicate,
    /// Acknowledged without effect (unknown type, unresolvable tenant, ...).
    Ignored { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileEffect {
    CheckoutCompleted { tier: PlanTier },
    /// Checkout without plan metadata: recorded for audit only.
    CheckoutAcknowledged,
    SubscriptionSynced { tier: PlanTier, status: SubscriptionStatus },
    SubscriptionEnded,
    ProcessorInvoicePaid,
    ProcessorPaymentFailed,
    InvoicePaid { invoice_id: InvoiceId },
    InvoicePaymentFailed { invoice_id: InvoiceId },
}

pub struct ReconciliationService<S, B> {
    invoicing: Arc<InvoicingService<S, B>>,
}

impl<S, B> core::fmt::Debug for ReconciliationService<S, B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ReconciliationService").finish_non_exhaustive()
    }
}

impl<S, B> ReconciliationService<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    pub fn new(invoicing: Arc<InvoicingService<S, B>>) -> Self {
        Self { invoicing }
    }

    /// Apply one authenticated processor event.
    ///
    /// Errors are returned only for events that could not be applied and may
    /// succeed on redelivery (storage, conflicts) or are malformed.
    #[instrument(skip(self, event), fields(event_id = %event.id, event_type = %event.event_type), err)]
    pub fn reconcile(&self, event: &ProcessorEvent) -> Result<ReconcileOutcome, ServiceError> {
        if let ProcessorEventKind::Unknown(kind) = &event.kind {
            debug!(kind = %kind, "unhandled processor event type");
            return Ok(ReconcileOutcome::Ignored {
                reason: format!("unhandled event type '{kind}'"),
            });
        }

        let Some(tenant_id) = self.resolve_tenant(event) else {
            warn!("processor event does not map to any tenant");
            return Ok(ReconcileOutcome::Ignored {
                reason: "no tenant for event".to_string(),
            });
        };

        let source = ProcessorEventRef {
            event_id: event.id.clone(),
            event_type: event.event_type.clone(),
        };

        let outcome = match &event.kind {
            ProcessorEventKind::CheckoutCompleted(session) => self.checkout(tenant_id, source, session)?,
            ProcessorEventKind::SubscriptionUpserted(sub) => self.sync_subscription(tenant_id, source, sub)?,
            ProcessorEventKind::SubscriptionDeleted(sub) => self.end_subscription(tenant_id, source, sub)?,
            ProcessorEventKind::InvoicePaid(inv) => {
                self.processor_invoice(tenant_id, source, inv, ProcessorInvoiceOutcome::Paid)?
            }
            ProcessorEventKind::InvoicePaymentFailed(inv) => {
                self.processor_invoice(tenant_id, source, inv, ProcessorInvoiceOutcome::PaymentFailed)?
            }
            ProcessorEventKind::PaymentSucceeded(payment) => self.payment_succeeded(tenant_id, payment)?,
            ProcessorEventKind::PaymentFailed(payment) => self.payment_failed(tenant_id, payment)?,
            ProcessorEventKind::Unknown(kind) => ReconcileOutcome::Ignored {
                reason: format!("unhandled event type '{kind}'"),
            },
        };

        match &outcome {
            ReconcileOutcome::Applied { effect, .. } => info!(%tenant_id, ?effect, "processor event applied"),
            ReconcileOutcome::Duplicate => info!(%tenant_id, "processor event already applied"),
            ReconcileOutcome::Ignored { reason } => info!(%tenant_id, %reason, "processor event ignored"),
        }
        Ok(outcome)
    }

    /// Metadata first, then the subscription and customer indexes.
    fn resolve_tenant(&self, event: &ProcessorEvent) -> Option<TenantId> {
        let billing = &self.invoicing.read_models().billing;
        event
            .tenant_hint()
            .or_else(|| event.subscription_id().and_then(|s| billing.tenant_for_subscription(s)))
            .or_else(|| event.customer_id().and_then(|c| billing.tenant_for_customer(c)))
    }

    fn billing(
        &self,
        tenant_id: TenantId,
        command: BillingCommand,
        effect: ReconcileEffect,
    ) -> Result<ReconcileOutcome, ServiceError> {
        let committed = self.invoicing.execute::<BillingAccount>(
            tenant_id,
            BillingAccount::stream_id(tenant_id),
            BILLING_AGGREGATE,
            "billing account",
            command,
            BillingAccount::empty,
        )?;
        if committed.is_empty() {
            return Ok(ReconcileOutcome::Duplicate);
        }
        Ok(ReconcileOutcome::Applied { tenant_id, effect })
    }

    fn checkout(
        &self,
        tenant_id: TenantId,
        source: ProcessorEventRef,
        session: &CheckoutSession,
    ) -> Result<ReconcileOutcome, ServiceError> {
        let occurred_at = self.invoicing.now();
        match session.plan {
            Some(tier) => self.billing(
                tenant_id,
                BillingCommand::CompleteCheckout(CompleteCheckout {
                    tenant_id,
                    source,
                    tier,
                    customer_id: session.customer_id.clone(),
                    subscription_id: session.subscription_id.clone(),
                    occurred_at,
                }),
                ReconcileEffect::CheckoutCompleted { tier },
            ),
            None => self.billing(
                tenant_id,
                BillingCommand::AcknowledgeEvent(AcknowledgeEvent {
                    tenant_id,
                    source,
                    summary: format!("checkout {} completed without plan metadata", session.id),
                    occurred_at,
                }),
                ReconcileEffect::CheckoutAcknowledged,
            ),
        }
    }

    /// Local snapshot of a processor subscription. The tier comes from the
    /// event metadata, then the price book, then the tenant's stored plan.
    fn snapshot(&self, tenant_id: TenantId, sub: &SubscriptionObject) -> Result<Subscription, ServiceError> {
        let config = self.invoicing.config();
        let tier = match sub
            .plan
            .or_else(|| sub.price_id.as_deref().and_then(|p| config.prices.tier_for_price(p)))
        {
            Some(tier) => tier,
            None => self.invoicing.load_account(tenant_id)?.plan(),
        };

        Ok(Subscription {
            external_id: sub.id.clone(),
            tier,
            status: sub.status,
            current_period_start: sub.current_period_start,
            current_period_end: sub.current_period_end,
            cancel_at_period_end: sub.cancel_at_period_end,
            cancel_at: sub.cancel_at,
        })
    }

    fn sync_subscription(
        &self,
        tenant_id: TenantId,
        source: ProcessorEventRef,
        sub: &SubscriptionObject,
    ) -> Result<ReconcileOutcome, ServiceError> {
        let subscription = self.snapshot(tenant_id, sub)?;
        let effect = ReconcileEffect::SubscriptionSynced {
            tier: subscription.tier,
            status: subscription.status,
        };

        self.billing(
            tenant_id,
            BillingCommand::SyncSubscription(SyncSubscription {
                tenant_id,
                source,
                customer_id: sub.customer_id.clone(),
                subscription,
                occurred_at: self.invoicing.now(),
            }),
            effect,
        )
    }

    fn end_subscription(
        &self,
        tenant_id: TenantId,
        source: ProcessorEventRef,
        sub: &SubscriptionObject,
    ) -> Result<ReconcileOutcome, ServiceError> {
        let subscription = self.snapshot(tenant_id, sub)?;
        self.billing(
            tenant_id,
            BillingCommand::EndSubscription(EndSubscription {
                tenant_id,
                source,
                subscription,
                occurred_at: self.invoicing.now(),
            }),
            ReconcileEffect::SubscriptionEnded,
        )
    }

    fn processor_invoice(
        &self,
        tenant_id: TenantId,
        source: ProcessorEventRef,
        invoice: &ProcessorInvoice,
        outcome: ProcessorInvoiceOutcome,
    ) -> Result<ReconcileOutcome, ServiceError> {
        let effect = match outcome {
            ProcessorInvoiceOutcome::Paid => ReconcileEffect::ProcessorInvoicePaid,
            ProcessorInvoiceOutcome::PaymentFailed => ReconcileEffect::ProcessorPaymentFailed,
        };
        self.billing(
            tenant_id,
            BillingCommand::RecordProcessorInvoice(RecordProcessorInvoice {
                tenant_id,
                source,
                invoice_ref: invoice.id.clone(),
                subscription_id: invoice.subscription_id.clone(),
                amount: invoice.amount,
                outcome,
                occurred_at: self.invoicing.now(),
            }),
            effect,
        )
    }

    fn payment_succeeded(&self, tenant_id: TenantId, payment: &PaymentIntent) -> Result<ReconcileOutcome, ServiceError> {
        let Some(invoice_id) = payment.invoice_id.map(InvoiceId::new) else {
            return Ok(ReconcileOutcome::Ignored {
                reason: format!("payment {} is not tagged with an invoice", payment.id),
            });
        };

        let invoice = match self.invoicing.load_invoice(tenant_id, invoice_id) {
            Ok(invoice) => invoice,
            Err(ServiceError::NotFound { .. }) => {
                return Ok(ReconcileOutcome::Ignored {
                    reason: format!("invoice {invoice_id} not found"),
                });
            }
            Err(other) => return Err(other),
        };
        if let Some(outcome) = settled_outcome(&invoice, &payment.id) {
            return Ok(outcome);
        }

        let result = self.invoicing.execute::<Invoice>(
            tenant_id,
            invoice_id.0,
            INVOICE_AGGREGATE,
            "invoice",
            InvoiceCommand::MarkInvoicePaid(MarkInvoicePaid {
                tenant_id,
                invoice_id,
                amount: payment.amount,
                method: payment_method(payment),
                external_ref: Some(payment.id.clone()),
                occurred_at: self.invoicing.now(),
            }),
            |id| Invoice::empty(InvoiceId::new(id)),
        );

        match result {
            Ok(committed) if committed.is_empty() => Ok(ReconcileOutcome::Duplicate),
            Ok(_) => Ok(ReconcileOutcome::Applied {
                tenant_id,
                effect: ReconcileEffect::InvoicePaid { invoice_id },
            }),
            // Settled or cancelled between the load and the write.
            Err(ServiceError::InvalidStateTransition { from, action }) => {
                let invoice = self.invoicing.load_invoice(tenant_id, invoice_id)?;
                Ok(settled_outcome(&invoice, &payment.id).unwrap_or_else(|| ReconcileOutcome::Ignored {
                    reason: format!("cannot {action} an invoice in status '{from}'"),
                }))
            }
            Err(other) => Err(other),
        }
    }

    fn payment_failed(&self, tenant_id: TenantId, payment: &PaymentIntent) -> Result<ReconcileOutcome, ServiceError> {
        let Some(invoice_id) = payment.invoice_id.map(InvoiceId::new) else {
            return Ok(ReconcileOutcome::Ignored {
                reason: format!("payment {} is not tagged with an invoice", payment.id),
            });
        };

        let result = self.invoicing.execute::<Invoice>(
            tenant_id,
            invoice_id.0,
            INVOICE_AGGREGATE,
            "invoice",
            InvoiceCommand::RecordFailedPayment(RecordFailedPayment {
                tenant_id,
                invoice_id,
                amount: payment.amount,
                method: payment_method(payment),
                external_ref: Some(payment.id.clone()),
                occurred_at: self.invoicing.now(),
            }),
            |id| Invoice::empty(InvoiceId::new(id)),
        );

        match result {
            Ok(committed) if committed.is_empty() => Ok(ReconcileOutcome::Duplicate),
            Ok(_) => Ok(ReconcileOutcome::Applied {
                tenant_id,
                effect: ReconcileEffect::InvoicePaymentFailed { invoice_id },
            }),
            Err(ServiceError::NotFound { .. }) => Ok(ReconcileOutcome::Ignored {
                reason: format!("invoice {invoice_id} not found"),
            }),
            Err(other) => Err(other),
        }
    }
}

/// Outcome for a payment against an invoice that no longer accepts one.
fn settled_outcome(invoice: &Invoice, payment_ref: &str) -> Option<ReconcileOutcome> {
    match invoice.status() {
        InvoiceStatus::Paid if invoice.payments().iter().any(|p| p.is_completed() && p.has_ref(payment_ref)) => {
            Some(ReconcileOutcome::Duplicate)
        }
        InvoiceStatus::Paid | InvoiceStatus::Cancelled | InvoiceStatus::Draft => Some(ReconcileOutcome::Ignored {
            reason: format!("invoice is {}; payment {payment_ref} not applied", invoice.status()),
        }),
        InvoiceStatus::Pending | InvoiceStatus::Overdue => None,
    }
}

fn payment_method(payment: &PaymentIntent) -> PaymentMethod {
    payment
        .method
        .as_deref()
        .and_then(|m| m.parse().ok())
        .unwrap_or(PaymentMethod::Card)
}
