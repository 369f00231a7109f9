use chrono::{DateTime, Utc};

/// A domain event: an immutable, versioned fact about an aggregate.
///
/// Event type names are namespaced by aggregate (`invoicing.invoice.paid`,
/// `billing.account.subscription_synced`, ...) and never reused.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name/type identifier.
    fn event_type(&self) -> &'static str;

    /// Schema version for this event type.
    fn version(&self) -> u32;

    /// Business time of the fact.
    fn occurred_at(&self) -> DateTime<Utc>;
}
