//! Subscription billing domain.
//!
//! - `plan`: plan tiers, their limits and the stateless entitlement policy.
//! - `account`: the per-tenant `BillingAccount` aggregate (plan, subscription,
//!   processed processor events).
//! - `processor_event`: inbound payment-processor events parsed into a closed set
//!   of variants.

pub mod account;
pub mod plan;
pub mod processor_event;

pub use account::{
    AuditEntry, BillingAccount, BillingCommand, BillingEvent, CancellationScheduled,
    CheckoutCompleted, CompleteCheckout, CustomerLinked, EndSubscription, EventAcknowledged,
    LinkCustomer, ProcessorEventRef, ProcessorInvoicePaid, ProcessorPaymentFailed,
    RecordProcessorInvoice, ProcessorInvoiceOutcome, AcknowledgeEvent, ScheduleCancellation,
    Subscription, SubscriptionEnded, SubscriptionStatus, SubscriptionSynced, SyncSubscription,
};
pub use plan::{LimitCheck, PlanAction, PlanCatalog, PlanLimits, PlanTier, PriceBook, Usage};
pub use processor_event::{
    CheckoutSession, PaymentIntent, ProcessorEvent, ProcessorEventKind, ProcessorInvoice,
    SubscriptionObject,
};
