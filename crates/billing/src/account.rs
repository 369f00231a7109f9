//! Tenant billing account (event-sourced).
//!
//! One account per tenant (singleton stream `billing.account`). It holds the
//! tenant's plan tier, the linked processor subscription and the ids of every
//! processor event already applied. Commands driven by processor events carry
//! the event id; a redelivered id produces no events.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tally_core::{Aggregate, AggregateId, AggregateRoot, DomainError, Money, TenantId};
use tally_events::Event;

use crate::plan::PlanTier;

pub const ACCOUNT_STREAM: &str = "billing.account";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    PastDue,
    Cancelled,
    Trialing,
}

impl SubscriptionStatus {
    /// Statuses that grant the subscription's tier.
    pub fn grants_plan(self) -> bool {
        matches!(self, SubscriptionStatus::Active | SubscriptionStatus::Trialing)
    }
}

/// Snapshot of the processor's subscription record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub external_id: String,
    pub tier: PlanTier,
    pub status: SubscriptionStatus,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    pub cancel_at: Option<DateTime<Utc>>,
}

/// Identity of the processor event that caused a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorEventRef {
    pub event_id: String,
    pub event_type: String,
}

/// Audit trail entry for an applied processor event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub event_id: String,
    pub event_type: String,
    pub summary: String,
    pub recorded_at: DateTime<Utc>,
}

/// Aggregate root: BillingAccount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BillingAccount {
    id: AggregateId,
    tenant_id: Option<TenantId>,
    plan: PlanTier,
    plan_expires_at: Option<DateTime<Utc>>,
    customer_id: Option<String>,
    subscription_id: Option<String>,
    subscription: Option<Subscription>,
    processed: BTreeSet<String>,
    audit: Vec<AuditEntry>,
    version: u64,
}

impl BillingAccount {
    pub fn stream_id(tenant_id: TenantId) -> AggregateId {
        AggregateId::singleton(tenant_id, ACCOUNT_STREAM)
    }

    pub fn empty(id: AggregateId) -> Self {
        Self {
            id,
            tenant_id: None,
            plan: PlanTier::Free,
            plan_expires_at: None,
            customer_id: None,
            subscription_id: None,
            subscription: None,
            processed: BTreeSet::new(),
            audit: Vec::new(),
            version: 0,
        }
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        self.tenant_id
    }

    /// Stored plan tier (see [`BillingAccount::effective_plan`]).
    pub fn plan(&self) -> PlanTier {
        self.plan
    }

    pub fn plan_expires_at(&self) -> Option<DateTime<Utc>> {
        self.plan_expires_at
    }

    /// Tier in force at `now`: the stored tier until its expiry passes.
    pub fn effective_plan(&self, now: DateTime<Utc>) -> PlanTier {
        match self.plan_expires_at {
            Some(expiry) if now >= expiry => PlanTier::Free,
            _ => self.plan,
        }
    }

    pub fn customer_id(&self) -> Option<&str> {
        self.customer_id.as_deref()
    }

    /// Linked (current) processor subscription id.
    pub fn subscription_id(&self) -> Option<&str> {
        self.subscription_id.as_deref()
    }

    pub fn subscription(&self) -> Option<&Subscription> {
        self.subscription.as_ref()
    }

    pub fn has_processed(&self, event_id: &str) -> bool {
        self.processed.contains(event_id)
    }

    pub fn audit(&self) -> &[AuditEntry] {
        &self.audit
    }
}

impl AggregateRoot for BillingAccount {
    type Id = AggregateId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: LinkCustomer (checkout started for this tenant).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkCustomer {
    pub tenant_id: TenantId,
    pub customer_id: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CompleteCheckout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteCheckout {
    pub tenant_id: TenantId,
    pub source: ProcessorEventRef,
    pub tier: PlanTier,
    pub customer_id: Option<String>,
    pub subscription_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: SyncSubscription (subscription created/updated at the processor).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSubscription {
    pub tenant_id: TenantId,
    pub source: ProcessorEventRef,
    pub customer_id: Option<String>,
    pub subscription: Subscription,
    pub occurred_at: DateTime<Utc>,
}

/// Command: EndSubscription (subscription deleted at the processor).
///
/// `subscription` is the processor's final record; it is stored as cancelled
/// whatever status it carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndSubscription {
    pub tenant_id: TenantId,
    pub source: ProcessorEventRef,
    pub subscription: Subscription,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorInvoiceOutcome {
    Paid,
    PaymentFailed,
}

/// Command: RecordProcessorInvoice (the tenant's own subscription bill).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordProcessorInvoice {
    pub tenant_id: TenantId,
    pub source: ProcessorEventRef,
    pub invoice_ref: String,
    pub subscription_id: Option<String>,
    pub amount: Money,
    pub outcome: ProcessorInvoiceOutcome,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ScheduleCancellation (tenant asked to cancel).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleCancellation {
    pub tenant_id: TenantId,
    pub at_period_end: bool,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AcknowledgeEvent (record a processed event that changes nothing here).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcknowledgeEvent {
    pub tenant_id: TenantId,
    pub source: ProcessorEventRef,
    pub summary: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BillingCommand {
    LinkCustomer(LinkCustomer),
    CompleteCheckout(CompleteCheckout),
    SyncSubscription(SyncSubscription),
    EndSubscription(EndSubscription),
    RecordProcessorInvoice(RecordProcessorInvoice),
    ScheduleCancellation(ScheduleCancellation),
    AcknowledgeEvent(AcknowledgeEvent),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerLinked {
    pub tenant_id: TenantId,
    pub customer_id: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutCompleted {
    pub tenant_id: TenantId,
    pub source: ProcessorEventRef,
    pub tier: PlanTier,
    pub customer_id: Option<String>,
    pub subscription_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// `plan` / `plan_expires_at` are set only when the subscription grants its tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionSynced {
    pub tenant_id: TenantId,
    pub source: ProcessorEventRef,
    pub customer_id: Option<String>,
    pub subscription: Subscription,
    pub plan: Option<PlanTier>,
    pub plan_expires_at: Option<DateTime<Utc>>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionEnded {
    pub tenant_id: TenantId,
    pub source: ProcessorEventRef,
    pub subscription: Subscription,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorInvoicePaid {
    pub tenant_id: TenantId,
    pub source: ProcessorEventRef,
    pub invoice_ref: String,
    pub amount: Money,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorPaymentFailed {
    pub tenant_id: TenantId,
    pub source: ProcessorEventRef,
    pub invoice_ref: String,
    pub subscription_id: Option<String>,
    pub amount: Money,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancellationScheduled {
    pub tenant_id: TenantId,
    pub subscription_id: String,
    pub at_period_end: bool,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventAcknowledged {
    pub tenant_id: TenantId,
    pub source: ProcessorEventRef,
    pub summary: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BillingEvent {
    CustomerLinked(CustomerLinked),
    CheckoutCompleted(CheckoutCompleted),
    SubscriptionSynced(SubscriptionSynced),
    SubscriptionEnded(SubscriptionEnded),
    ProcessorInvoicePaid(ProcessorInvoicePaid),
    ProcessorPaymentFailed(ProcessorPaymentFailed),
    CancellationScheduled(CancellationScheduled),
    EventAcknowledged(EventAcknowledged),
}

impl BillingEvent {
    pub fn tenant_id(&self) -> TenantId {
        match self {
            BillingEvent::CustomerLinked(e) => e.tenant_id,
            BillingEvent::CheckoutCompleted(e) => e.tenant_id,
            BillingEvent::SubscriptionSynced(e) => e.tenant_id,
            BillingEvent::SubscriptionEnded(e) => e.tenant_id,
            BillingEvent::ProcessorInvoicePaid(e) => e.tenant_id,
            BillingEvent::ProcessorPaymentFailed(e) => e.tenant_id,
            BillingEvent::CancellationScheduled(e) => e.tenant_id,
            BillingEvent::EventAcknowledged(e) => e.tenant_id,
        }
    }

    fn source(&self) -> Option<&ProcessorEventRef> {
        match self {
            BillingEvent::CheckoutCompleted(e) => Some(&e.source),
            BillingEvent::SubscriptionSynced(e) => Some(&e.source),
            BillingEvent::SubscriptionEnded(e) => Some(&e.source),
            BillingEvent::ProcessorInvoicePaid(e) => Some(&e.source),
            BillingEvent::ProcessorPaymentFailed(e) => Some(&e.source),
            BillingEvent::EventAcknowledged(e) => Some(&e.source),
            BillingEvent::CustomerLinked(_) | BillingEvent::CancellationScheduled(_) => None,
        }
    }

    fn summary(&self) -> String {
        match self {
            BillingEvent::CheckoutCompleted(e) => format!("checkout completed for {} plan", e.tier),
            BillingEvent::SubscriptionSynced(e) => format!(
                "subscription {} is {:?}",
                e.subscription.external_id, e.subscription.status
            ),
            BillingEvent::SubscriptionEnded(e) => {
                format!("subscription {} cancelled, downgraded to free", e.subscription.external_id)
            }
            BillingEvent::ProcessorInvoicePaid(e) => {
                format!("subscription invoice {} paid ({})", e.invoice_ref, e.amount)
            }
            BillingEvent::ProcessorPaymentFailed(e) => {
                format!("subscription invoice {} payment failed ({})", e.invoice_ref, e.amount)
            }
            BillingEvent::EventAcknowledged(e) => e.summary.clone(),
            BillingEvent::CustomerLinked(e) => format!("customer {} linked", e.customer_id),
            BillingEvent::CancellationScheduled(e) => {
                format!("cancellation of {} requested", e.subscription_id)
            }
        }
    }
}

impl Event for BillingEvent {
    fn event_type(&self) -> &'static str {
        match self {
            BillingEvent::CustomerLinked(_) => "billing.account.customer_linked",
            BillingEvent::CheckoutCompleted(_) => "billing.account.checkout_completed",
            BillingEvent::SubscriptionSynced(_) => "billing.account.subscription_synced",
            BillingEvent::SubscriptionEnded(_) => "billing.account.subscription_ended",
            BillingEvent::ProcessorInvoicePaid(_) => "billing.account.processor_invoice_paid",
            BillingEvent::ProcessorPaymentFailed(_) => "billing.account.processor_payment_failed",
            BillingEvent::CancellationScheduled(_) => "billing.account.cancellation_scheduled",
            BillingEvent::EventAcknowledged(_) => "billing.account.event_acknowledged",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            BillingEvent::CustomerLinked(e) => e.occurred_at,
            BillingEvent::CheckoutCompleted(e) => e.occurred_at,
            BillingEvent::SubscriptionSynced(e) => e.occurred_at,
            BillingEvent::SubscriptionEnded(e) => e.occurred_at,
            BillingEvent::ProcessorInvoicePaid(e) => e.occurred_at,
            BillingEvent::ProcessorPaymentFailed(e) => e.occurred_at,
            BillingEvent::CancellationScheduled(e) => e.occurred_at,
            BillingEvent::EventAcknowledged(e) => e.occurred_at,
        }
    }
}

impl Aggregate for BillingAccount {
    type Command = BillingCommand;
    type Event = BillingEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        self.tenant_id = Some(event.tenant_id());

        match event {
            BillingEvent::CustomerLinked(e) => {
                self.customer_id = Some(e.customer_id.clone());
            }
            BillingEvent::CheckoutCompleted(e) => {
                self.plan = e.tier;
                // The next subscription sync supplies the new period end.
                self.plan_expires_at = None;
                if e.customer_id.is_some() {
                    self.customer_id = e.customer_id.clone();
                }
                if e.subscription_id.is_some() {
                    self.subscription_id = e.subscription_id.clone();
                }
            }
            BillingEvent::SubscriptionSynced(e) => {
                if e.customer_id.is_some() {
                    self.customer_id = e.customer_id.clone();
                }
                if let Some(plan) = e.plan {
                    self.plan = plan;
                    self.plan_expires_at = e.plan_expires_at;
                    self.subscription_id = Some(e.subscription.external_id.clone());
                }
                self.subscription = Some(e.subscription.clone());
            }
            BillingEvent::SubscriptionEnded(e) => {
                self.subscription = Some(Subscription {
                    status: SubscriptionStatus::Cancelled,
                    ..e.subscription.clone()
                });
                self.plan = PlanTier::Free;
                self.plan_expires_at = None;
                self.subscription_id = None;
            }
            BillingEvent::ProcessorInvoicePaid(_) => {}
            BillingEvent::ProcessorPaymentFailed(e) => {
                if let Some(sub) = self.subscription.as_mut() {
                    let same = e.subscription_id.as_deref().is_none_or(|id| id == sub.external_id);
                    if same && sub.status != SubscriptionStatus::Cancelled {
                        sub.status = SubscriptionStatus::PastDue;
                    }
                }
            }
            BillingEvent::CancellationScheduled(e) => {
                if let Some(sub) = self.subscription.as_mut() {
                    if e.at_period_end {
                        sub.cancel_at_period_end = true;
                        sub.cancel_at = sub.current_period_end;
                    } else {
                        sub.cancel_at = Some(e.occurred_at);
                    }
                }
            }
            BillingEvent::EventAcknowledged(_) => {}
        }

        if let Some(source) = event.source() {
            self.processed.insert(source.event_id.clone());
            self.audit.push(AuditEntry {
                event_id: source.event_id.clone(),
                event_type: source.event_type.clone(),
                summary: event.summary(),
                recorded_at: event.occurred_at(),
            });
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            BillingCommand::LinkCustomer(cmd) => self.handle_link_customer(cmd),
            BillingCommand::CompleteCheckout(cmd) => self.handle_checkout(cmd),
            BillingCommand::SyncSubscription(cmd) => self.handle_sync(cmd),
            BillingCommand::EndSubscription(cmd) => self.handle_end(cmd),
            BillingCommand::RecordProcessorInvoice(cmd) => self.handle_processor_invoice(cmd),
            BillingCommand::ScheduleCancellation(cmd) => self.handle_schedule_cancellation(cmd),
            BillingCommand::AcknowledgeEvent(cmd) => self.handle_acknowledge(cmd),
        }
    }
}

impl BillingAccount {
    fn ensure_tenant(&self, tenant_id: TenantId) -> Result<(), DomainError> {
        if self.tenant_id.is_some_and(|t| t != tenant_id) {
            return Err(DomainError::invariant("tenant mismatch"));
        }
        Ok(())
    }

    /// `true` when the source event was already applied (redelivery).
    fn already_applied(&self, tenant_id: TenantId, source: &ProcessorEventRef) -> Result<bool, DomainError> {
        self.ensure_tenant(tenant_id)?;
        if source.event_id.trim().is_empty() {
            return Err(DomainError::validation("processor event id is empty"));
        }
        Ok(self.processed.contains(&source.event_id))
    }

    fn handle_link_customer(&self, cmd: &LinkCustomer) -> Result<Vec<BillingEvent>, DomainError> {
        self.ensure_tenant(cmd.tenant_id)?;
        if cmd.customer_id.trim().is_empty() {
            return Err(DomainError::validation("customer id cannot be empty"));
        }
        if self.customer_id.as_deref() == Some(cmd.customer_id.as_str()) {
            return Ok(vec![]);
        }

        Ok(vec![BillingEvent::CustomerLinked(CustomerLinked {
            tenant_id: cmd.tenant_id,
            customer_id: cmd.customer_id.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_checkout(&self, cmd: &CompleteCheckout) -> Result<Vec<BillingEvent>, DomainError> {
        if self.already_applied(cmd.tenant_id, &cmd.source)? {
            return Ok(vec![]);
        }

        Ok(vec![BillingEvent::CheckoutCompleted(CheckoutCompleted {
            tenant_id: cmd.tenant_id,
            source: cmd.source.clone(),
            tier: cmd.tier,
            customer_id: cmd.customer_id.clone(),
            subscription_id: cmd.subscription_id.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_sync(&self, cmd: &SyncSubscription) -> Result<Vec<BillingEvent>, DomainError> {
        if self.already_applied(cmd.tenant_id, &cmd.source)? {
            return Ok(vec![]);
        }

        let (plan, plan_expires_at) = if cmd.subscription.status.grants_plan() {
            (Some(cmd.subscription.tier), cmd.subscription.current_period_end)
        } else {
            (None, None)
        };

        Ok(vec![BillingEvent::SubscriptionSynced(SubscriptionSynced {
            tenant_id: cmd.tenant_id,
            source: cmd.source.clone(),
            customer_id: cmd.customer_id.clone(),
            subscription: cmd.subscription.clone(),
            plan,
            plan_expires_at,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_end(&self, cmd: &EndSubscription) -> Result<Vec<BillingEvent>, DomainError> {
        if self.already_applied(cmd.tenant_id, &cmd.source)? {
            return Ok(vec![]);
        }

        if cmd.subscription.external_id.trim().is_empty() {
            return Err(DomainError::validation("subscription id cannot be empty"));
        }

        Ok(vec![BillingEvent::SubscriptionEnded(SubscriptionEnded {
            tenant_id: cmd.tenant_id,
            source: cmd.source.clone(),
            subscription: Subscription {
                status: SubscriptionStatus::Cancelled,
                ..cmd.subscription.clone()
            },
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_processor_invoice(
        &self,
        cmd: &RecordProcessorInvoice,
    ) -> Result<Vec<BillingEvent>, DomainError> {
        if self.already_applied(cmd.tenant_id, &cmd.source)? {
            return Ok(vec![]);
        }

        let event = match cmd.outcome {
            ProcessorInvoiceOutcome::Paid => BillingEvent::ProcessorInvoicePaid(ProcessorInvoicePaid {
                tenant_id: cmd.tenant_id,
                source: cmd.source.clone(),
                invoice_ref: cmd.invoice_ref.clone(),
                amount: cmd.amount,
                occurred_at: cmd.occurred_at,
            }),
            ProcessorInvoiceOutcome::PaymentFailed => {
                BillingEvent::ProcessorPaymentFailed(ProcessorPaymentFailed {
                    tenant_id: cmd.tenant_id,
                    source: cmd.source.clone(),
                    invoice_ref: cmd.invoice_ref.clone(),
                    subscription_id: cmd.subscription_id.clone(),
                    amount: cmd.amount,
                    occurred_at: cmd.occurred_at,
                })
            }
        };
        Ok(vec![event])
    }

    fn handle_schedule_cancellation(
        &self,
        cmd: &ScheduleCancellation,
    ) -> Result<Vec<BillingEvent>, DomainError> {
        self.ensure_tenant(cmd.tenant_id)?;

        let subscription_id = self.subscription_id.clone().ok_or_else(DomainError::not_found)?;
        if let Some(sub) = &self.subscription {
            if sub.status == SubscriptionStatus::Cancelled {
                return Err(DomainError::conflict("subscription is already cancelled"));
            }
            if cmd.at_period_end && sub.cancel_at_period_end {
                return Ok(vec![]);
            }
        }

        Ok(vec![BillingEvent::CancellationScheduled(CancellationScheduled {
            tenant_id: cmd.tenant_id,
            subscription_id,
            at_period_end: cmd.at_period_end,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_acknowledge(&self, cmd: &AcknowledgeEvent) -> Result<Vec<BillingEvent>, DomainError> {
        if self.already_applied(cmd.tenant_id, &cmd.source)? {
            return Ok(vec![]);
        }

        Ok(vec![BillingEvent::EventAcknowledged(EventAcknowledged {
            tenant_id: cmd.tenant_id,
            source: cmd.source.clone(),
            summary: cmd.summary.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn test_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, 9, 30, 0).unwrap()
    }

    fn source(id: &str, event_type: &str) -> ProcessorEventRef {
        ProcessorEventRef {
            event_id: id.to_string(),
            event_type: event_type.to_string(),
        }
    }

    fn subscription(status: SubscriptionStatus, period_end: DateTime<Utc>) -> Subscription {
        Subscription {
            external_id: "sub_1".to_string(),
            tier: PlanTier::Pro,
            status,
            current_period_start: Some(period_end - Duration::days(30)),
            current_period_end: Some(period_end),
            cancel_at_period_end: false,
            cancel_at: None,
        }
    }

    fn run(account: &mut BillingAccount, command: BillingCommand) -> Vec<BillingEvent> {
        let events = account.handle(&command).unwrap();
        for e in &events {
            account.apply(e);
        }
        events
    }

    fn sync(tenant_id: TenantId, event_id: &str, sub: Subscription) -> BillingCommand {
        BillingCommand::SyncSubscription(SyncSubscription {
            tenant_id,
            source: source(event_id, "customer.subscription.updated"),
            customer_id: Some("cus_1".to_string()),
            subscription: sub,
            occurred_at: test_time(),
        })
    }

    #[test]
    fn active_subscription_sets_plan_and_expiry() {
        let tenant_id = TenantId::new();
        let mut account = BillingAccount::empty(BillingAccount::stream_id(tenant_id));
        let period_end = test_time() + Duration::days(30);

        run(&mut account, sync(tenant_id, "evt_1", subscription(SubscriptionStatus::Active, period_end)));

        assert_eq!(account.plan(), PlanTier::Pro);
        assert_eq!(account.plan_expires_at(), Some(period_end));
        assert_eq!(account.subscription_id(), Some("sub_1"));
        assert_eq!(account.customer_id(), Some("cus_1"));
        assert_eq!(account.effective_plan(test_time()), PlanTier::Pro);
        assert_eq!(account.effective_plan(period_end), PlanTier::Free);
        assert!(account.has_processed("evt_1"));
        assert_eq!(account.audit().len(), 1);
    }

    #[test]
    fn redelivered_event_produces_no_events() {
        let tenant_id = TenantId::new();
        let mut account = BillingAccount::empty(BillingAccount::stream_id(tenant_id));
        let cmd = sync(
            tenant_id,
            "evt_1",
            subscription(SubscriptionStatus::Active, test_time() + Duration::days(30)),
        );

        assert_eq!(run(&mut account, cmd.clone()).len(), 1);
        assert!(run(&mut account, cmd).is_empty());
        assert_eq!(account.version(), 1);
    }

    #[test]
    fn past_due_update_keeps_plan_but_records_status() {
        let tenant_id = TenantId::new();
        let mut account = BillingAccount::empty(BillingAccount::stream_id(tenant_id));
        let period_end = test_time() + Duration::days(30);
        run(&mut account, sync(tenant_id, "evt_1", subscription(SubscriptionStatus::Active, period_end)));
        run(&mut account, sync(tenant_id, "evt_2", subscription(SubscriptionStatus::PastDue, period_end)));

        assert_eq!(account.plan(), PlanTier::Pro);
        assert_eq!(
            account.subscription().map(|s| s.status),
            Some(SubscriptionStatus::PastDue)
        );
    }

    #[test]
    fn subscription_deleted_downgrades_and_unlinks() {
        let tenant_id = TenantId::new();
        let mut account = BillingAccount::empty(BillingAccount::stream_id(tenant_id));
        run(
            &mut account,
            sync(tenant_id, "evt_1", subscription(SubscriptionStatus::Active, test_time() + Duration::days(30))),
        );
        run(&mut account, end(tenant_id, "evt_2", subscription(SubscriptionStatus::Active, test_time())));

        assert_eq!(account.plan(), PlanTier::Free);
        assert_eq!(account.subscription_id(), None);
        assert_eq!(
            account.subscription().map(|s| s.status),
            Some(SubscriptionStatus::Cancelled)
        );
    }

    fn checkout(tenant_id: TenantId, event_id: &str, tier: PlanTier, at: DateTime<Utc>) -> BillingCommand {
        BillingCommand::CompleteCheckout(CompleteCheckout {
            tenant_id,
            source: source(event_id, "checkout.session.completed"),
            tier,
            customer_id: Some("cus_1".to_string()),
            subscription_id: Some("sub_1".to_string()),
            occurred_at: at,
        })
    }

    fn end(tenant_id: TenantId, event_id: &str, sub: Subscription) -> BillingCommand {
        BillingCommand::EndSubscription(EndSubscription {
            tenant_id,
            source: source(event_id, "customer.subscription.deleted"),
            subscription: sub,
            occurred_at: test_time(),
        })
    }

    #[test]
    fn deletion_after_checkout_only_records_cancelled_subscription() {
        let tenant_id = TenantId::new();
        let mut account = BillingAccount::empty(BillingAccount::stream_id(tenant_id));
        run(&mut account, checkout(tenant_id, "evt_1", PlanTier::Pro, test_time()));
        assert!(account.subscription().is_none());

        let period_end = test_time() + Duration::days(30);
        run(&mut account, end(tenant_id, "evt_2", subscription(SubscriptionStatus::Active, period_end)));

        assert_eq!(account.plan(), PlanTier::Free);
        assert_eq!(account.subscription_id(), None);
        let sub = account.subscription().unwrap();
        assert_eq!(sub.external_id, "sub_1");
        assert_eq!(sub.status, SubscriptionStatus::Cancelled);
        assert_eq!(sub.current_period_end, Some(period_end));
    }

    #[test]
    fn deletion_of_another_subscription_replaces_the_snapshot() {
        let tenant_id = TenantId::new();
        let mut account = BillingAccount::empty(BillingAccount::stream_id(tenant_id));
        run(
            &mut account,
            sync(tenant_id, "evt_1", subscription(SubscriptionStatus::Active, test_time() + Duration::days(30))),
        );

        let other = Subscription {
            external_id: "sub_2".to_string(),
            ..subscription(SubscriptionStatus::PastDue, test_time())
        };
        run(&mut account, end(tenant_id, "evt_2", other));

        let sub = account.subscription().unwrap();
        assert_eq!(sub.external_id, "sub_2");
        assert_eq!(sub.status, SubscriptionStatus::Cancelled);
    }

    #[test]
    fn checkout_after_lapsed_period_grants_the_new_tier() {
        let tenant_id = TenantId::new();
        let mut account = BillingAccount::empty(BillingAccount::stream_id(tenant_id));
        let period_end = test_time() + Duration::days(30);
        run(&mut account, sync(tenant_id, "evt_1", subscription(SubscriptionStatus::Active, period_end)));

        let later = period_end + Duration::days(2);
        assert_eq!(account.effective_plan(later), PlanTier::Free);

        run(&mut account, checkout(tenant_id, "evt_2", PlanTier::Business, later));

        assert_eq!(account.plan(), PlanTier::Business);
        assert_eq!(account.plan_expires_at(), None);
        assert_eq!(account.effective_plan(later), PlanTier::Business);
    }

    #[test]
    fn failed_subscription_invoice_marks_past_due() {
        let tenant_id = TenantId::new();
        let mut account = BillingAccount::empty(BillingAccount::stream_id(tenant_id));
        run(
            &mut account,
            sync(tenant_id, "evt_1", subscription(SubscriptionStatus::Active, test_time() + Duration::days(30))),
        );
        run(
            &mut account,
            BillingCommand::RecordProcessorInvoice(RecordProcessorInvoice {
                tenant_id,
                source: source("evt_2", "invoice.payment_failed"),
                invoice_ref: "in_1".to_string(),
                subscription_id: Some("sub_1".to_string()),
                amount: Money::from_minor(1_900).unwrap(),
                outcome: ProcessorInvoiceOutcome::PaymentFailed,
                occurred_at: test_time(),
            }),
        );

        assert_eq!(
            account.subscription().map(|s| s.status),
            Some(SubscriptionStatus::PastDue)
        );
        assert_eq!(account.audit().len(), 2);
    }

    #[test]
    fn cancellation_requires_linked_subscription() {
        let tenant_id = TenantId::new();
        let mut account = BillingAccount::empty(BillingAccount::stream_id(tenant_id));
        let cancel = BillingCommand::ScheduleCancellation(ScheduleCancellation {
            tenant_id,
            at_period_end: true,
            occurred_at: test_time(),
        });
        assert_eq!(account.handle(&cancel).unwrap_err(), DomainError::NotFound);

        let period_end = test_time() + Duration::days(30);
        run(&mut account, sync(tenant_id, "evt_1", subscription(SubscriptionStatus::Active, period_end)));
        run(&mut account, cancel.clone());

        let sub = account.subscription().unwrap();
        assert!(sub.cancel_at_period_end);
        assert_eq!(sub.cancel_at, Some(period_end));
        assert!(run(&mut account, cancel).is_empty());
    }
}
