//! Inbound payment-processor events.
//!
//! Payloads follow the processor's envelope (`{ id, type, created, data: { object } }`).
//! They are parsed once, at the boundary, into [`ProcessorEventKind`]; business
//! logic never sees the raw JSON. Event types this crate does not know become
//! [`ProcessorEventKind::Unknown`] and are acknowledged without effect.
//!
//! Authenticity (signature) verification happens before parsing, in the transport
//! layer.

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};

use tally_core::{AggregateId, DomainError, DomainResult, Money, TenantId};

use crate::account::SubscriptionStatus;
use crate::plan::PlanTier;

#[derive(Debug, Deserialize)]
struct RawEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    created: i64,
    data: RawEventData,
}

#[derive(Debug, Deserialize)]
struct RawEventData {
    object: Value,
}

/// A verified processor event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorEvent {
    /// Processor event id; the idempotency key for redeliveries.
    pub id: String,
    pub event_type: String,
    /// `None` when the payload has no positive `created` timestamp.
    pub created: Option<DateTime<Utc>>,
    pub kind: ProcessorEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessorEventKind {
    CheckoutCompleted(CheckoutSession),
    SubscriptionUpserted(SubscriptionObject),
    SubscriptionDeleted(SubscriptionObject),
    /// Subscription billing invoice (the tenant's own bill) was paid.
    InvoicePaid(ProcessorInvoice),
    InvoicePaymentFailed(ProcessorInvoice),
    /// A payment for one of the tenant's invoices succeeded.
    PaymentSucceeded(PaymentIntent),
    PaymentFailed(PaymentIntent),
    Unknown(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutSession {
    pub id: String,
    pub customer_id: Option<String>,
    pub subscription_id: Option<String>,
    pub tenant_id: Option<TenantId>,
    pub plan: Option<PlanTier>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionObject {
    pub id: String,
    pub customer_id: Option<String>,
    pub status: SubscriptionStatus,
    pub price_id: Option<String>,
    pub plan: Option<PlanTier>,
    pub tenant_id: Option<TenantId>,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    pub cancel_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorInvoice {
    pub id: String,
    pub customer_id: Option<String>,
    pub subscription_id: Option<String>,
    pub amount: Money,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentIntent {
    pub id: String,
    pub amount: Money,
    pub customer_id: Option<String>,
    /// Tenant invoice this payment settles (`metadata.invoice_id`).
    pub invoice_id: Option<AggregateId>,
    pub tenant_id: Option<TenantId>,
    pub method: Option<String>,
}

impl ProcessorEvent {
    /// Parse a raw, already-verified payload.
    pub fn parse(payload: &[u8]) -> DomainResult<Self> {
        let raw: RawEvent = serde_json::from_slice(payload)
            .map_err(|e| DomainError::validation(format!("malformed processor event: {e}")))?;
        Self::from_raw(raw)
    }

    pub fn from_value(value: Value) -> DomainResult<Self> {
        let raw: RawEvent = serde_json::from_value(value)
            .map_err(|e| DomainError::validation(format!("malformed processor event: {e}")))?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawEvent) -> DomainResult<Self> {
        if raw.id.trim().is_empty() {
            return Err(DomainError::validation("processor event id is empty"));
        }

        let object = &raw.data.object;
        let kind = match raw.event_type.as_str() {
            "checkout.session.completed" => {
                ProcessorEventKind::CheckoutCompleted(parse_checkout(object)?)
            }
            "customer.subscription.created" | "customer.subscription.updated" => {
                ProcessorEventKind::SubscriptionUpserted(parse_subscription(object)?)
            }
            "customer.subscription.deleted" => {
                ProcessorEventKind::SubscriptionDeleted(parse_subscription(object)?)
            }
            "invoice.paid" | "invoice.payment_succeeded" => {
                ProcessorEventKind::InvoicePaid(parse_invoice(object)?)
            }
            "invoice.payment_failed" => {
                ProcessorEventKind::InvoicePaymentFailed(parse_invoice(object)?)
            }
            "payment_intent.succeeded" => {
                ProcessorEventKind::PaymentSucceeded(parse_payment_intent(object)?)
            }
            "payment_intent.payment_failed" => {
                ProcessorEventKind::PaymentFailed(parse_payment_intent(object)?)
            }
            other => ProcessorEventKind::Unknown(other.to_string()),
        };

        Ok(Self {
            created: timestamp(raw.created),
            id: raw.id,
            event_type: raw.event_type,
            kind,
        })
    }

    /// Tenant named in the event metadata, if any.
    pub fn tenant_hint(&self) -> Option<TenantId> {
        match &self.kind {
            ProcessorEventKind::CheckoutCompleted(s) => s.tenant_id,
            ProcessorEventKind::SubscriptionUpserted(s)
            | ProcessorEventKind::SubscriptionDeleted(s) => s.tenant_id,
            ProcessorEventKind::PaymentSucceeded(p) | ProcessorEventKind::PaymentFailed(p) => {
                p.tenant_id
            }
            ProcessorEventKind::InvoicePaid(_)
            | ProcessorEventKind::InvoicePaymentFailed(_)
            | ProcessorEventKind::Unknown(_) => None,
        }
    }

    /// Subscription the event refers to, if any.
    pub fn subscription_id(&self) -> Option<&str> {
        match &self.kind {
            ProcessorEventKind::CheckoutCompleted(s) => s.subscription_id.as_deref(),
            ProcessorEventKind::SubscriptionUpserted(s)
            | ProcessorEventKind::SubscriptionDeleted(s) => Some(&s.id),
            ProcessorEventKind::InvoicePaid(i) | ProcessorEventKind::InvoicePaymentFailed(i) => {
                i.subscription_id.as_deref()
            }
            _ => None,
        }
    }

    /// Processor customer the event refers to, if any.
    pub fn customer_id(&self) -> Option<&str> {
        match &self.kind {
            ProcessorEventKind::CheckoutCompleted(s) => s.customer_id.as_deref(),
            ProcessorEventKind::SubscriptionUpserted(s)
            | ProcessorEventKind::SubscriptionDeleted(s) => s.customer_id.as_deref(),
            ProcessorEventKind::InvoicePaid(i) | ProcessorEventKind::InvoicePaymentFailed(i) => {
                i.customer_id.as_deref()
            }
            ProcessorEventKind::PaymentSucceeded(p) | ProcessorEventKind::PaymentFailed(p) => {
                p.customer_id.as_deref()
            }
            ProcessorEventKind::Unknown(_) => None,
        }
    }
}

/// Map the processor's subscription status string.
pub fn parse_status(status: &str) -> SubscriptionStatus {
    match status {
        "active" => SubscriptionStatus::Active,
        "trialing" => SubscriptionStatus::Trialing,
        "past_due" | "incomplete" => SubscriptionStatus::PastDue,
        // canceled, cancelled, unpaid, incomplete_expired, paused
        _ => SubscriptionStatus::Cancelled,
    }
}

fn as_object<'a>(object: &'a Value, what: &str) -> DomainResult<&'a Map<String, Value>> {
    object
        .as_object()
        .ok_or_else(|| DomainError::validation(format!("invalid {what} object")))
}

fn required_str(obj: &Map<String, Value>, key: &str, what: &str) -> DomainResult<String> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(String::from)
        .ok_or_else(|| DomainError::validation(format!("missing {what} {key}")))
}

fn optional_str(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key).and_then(Value::as_str).map(String::from)
}

fn metadata_str<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    obj.get("metadata")
        .and_then(|m| m.get(key))
        .and_then(Value::as_str)
        .filter(|v| !v.is_empty())
}

fn metadata_tenant(obj: &Map<String, Value>) -> DomainResult<Option<TenantId>> {
    metadata_str(obj, "tenant_id")
        .map(str::parse::<TenantId>)
        .transpose()
}

fn metadata_plan(obj: &Map<String, Value>) -> DomainResult<Option<PlanTier>> {
    metadata_str(obj, "plan")
        .map(str::parse::<PlanTier>)
        .transpose()
}

fn timestamp(secs: i64) -> Option<DateTime<Utc>> {
    if secs <= 0 {
        return None;
    }
    Utc.timestamp_opt(secs, 0).single()
}

fn optional_timestamp(obj: &Map<String, Value>, key: &str) -> Option<DateTime<Utc>> {
    obj.get(key).and_then(Value::as_i64).and_then(timestamp)
}

fn amount(obj: &Map<String, Value>, keys: &[&str], what: &str) -> DomainResult<Money> {
    let minor = keys
        .iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_u64))
        .ok_or_else(|| DomainError::validation(format!("missing {what} amount")))?;
    Money::from_minor(minor)
}

fn parse_checkout(object: &Value) -> DomainResult<CheckoutSession> {
    let obj = as_object(object, "checkout session")?;
    Ok(CheckoutSession {
        id: required_str(obj, "id", "checkout session")?,
        customer_id: optional_str(obj, "customer"),
        subscription_id: optional_str(obj, "subscription"),
        tenant_id: metadata_tenant(obj)?,
        plan: metadata_plan(obj)?,
    })
}

fn parse_subscription(object: &Value) -> DomainResult<SubscriptionObject> {
    let obj = as_object(object, "subscription")?;

    let price_id = obj
        .get("items")
        .and_then(|v| v.get("data"))
        .and_then(Value::as_array)
        .and_then(|items| items.first())
        .and_then(|item| item.get("price"))
        .and_then(|price| price.get("id"))
        .and_then(Value::as_str)
        .map(String::from);

    Ok(SubscriptionObject {
        id: required_str(obj, "id", "subscription")?,
        customer_id: optional_str(obj, "customer"),
        status: parse_status(obj.get("status").and_then(Value::as_str).unwrap_or("active")),
        price_id,
        plan: metadata_plan(obj)?,
        tenant_id: metadata_tenant(obj)?,
        current_period_start: optional_timestamp(obj, "current_period_start"),
        current_period_end: optional_timestamp(obj, "current_period_end"),
        cancel_at_period_end: obj
            .get("cancel_at_period_end")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        cancel_at: optional_timestamp(obj, "cancel_at"),
    })
}

fn parse_invoice(object: &Value) -> DomainResult<ProcessorInvoice> {
    let obj = as_object(object, "invoice")?;
    Ok(ProcessorInvoice {
        id: required_str(obj, "id", "invoice")?,
        customer_id: optional_str(obj, "customer"),
        subscription_id: optional_str(obj, "subscription"),
        amount: amount(obj, &["amount_paid", "amount_due"], "invoice").unwrap_or(Money::ZERO),
    })
}

fn parse_payment_intent(object: &Value) -> DomainResult<PaymentIntent> {
    let obj = as_object(object, "payment intent")?;

    let invoice_id = metadata_str(obj, "invoice_id")
        .map(str::parse::<AggregateId>)
        .transpose()?;

    let method = obj
        .get("payment_method_types")
        .and_then(Value::as_array)
        .and_then(|types| types.first())
        .and_then(Value::as_str)
        .map(String::from);

    Ok(PaymentIntent {
        id: required_str(obj, "id", "payment intent")?,
        amount: amount(obj, &["amount_received", "amount"], "payment intent")?,
        customer_id: optional_str(obj, "customer"),
        invoice_id,
        tenant_id: metadata_tenant(obj)?,
        method,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn subscription_update_is_parsed_with_period_and_price() {
        let tenant = TenantId::new();
        let event = ProcessorEvent::from_value(json!({
            "id": "evt_1",
            "type": "customer.subscription.updated",
            "created": 1_767_225_600,
            "data": { "object": {
                "id": "sub_1",
                "customer": "cus_1",
                "status": "trialing",
                "current_period_start": 1_767_225_600,
                "current_period_end": 1_769_904_000,
                "cancel_at_period_end": true,
                "items": { "data": [ { "id": "si_1", "price": { "id": "price_pro" } } ] },
                "metadata": { "tenant_id": tenant.to_string() }
            }}
        }))
        .unwrap();
        assert_eq!(event.created, Utc.timestamp_opt(1_767_225_600, 0).single());

        match event.kind {
            ProcessorEventKind::SubscriptionUpserted(sub) => {
                assert_eq!(sub.id, "sub_1");
                assert_eq!(sub.status, SubscriptionStatus::Trialing);
                assert_eq!(sub.price_id.as_deref(), Some("price_pro"));
                assert_eq!(sub.tenant_id, Some(tenant));
                assert!(sub.cancel_at_period_end);
                assert!(sub.current_period_end.is_some());
            }
            other => panic!("Expected SubscriptionUpserted, got {other:?}"),
        }
    }

    #[test]
    fn unknown_types_are_kept_as_unknown() {
        let event = ProcessorEvent::parse(
            br#"{"id":"evt_9","type":"customer.tax_id.created","created":0,"data":{"object":{}}}"#,
        )
        .unwrap();
        assert_eq!(
            event.kind,
            ProcessorEventKind::Unknown("customer.tax_id.created".to_string())
        );
        assert_eq!(event.tenant_hint(), None);
        assert_eq!(event.created, None);
    }

    #[test]
    fn payment_intent_carries_invoice_reference() {
        let invoice_id = AggregateId::new();
        let event = ProcessorEvent::from_value(json!({
            "id": "evt_2",
            "type": "payment_intent.succeeded",
            "created": 1_767_225_600,
            "data": { "object": {
                "id": "pi_1",
                "amount_received": 13250,
                "payment_method_types": ["card"],
                "metadata": { "invoice_id": invoice_id.to_string() }
            }}
        }))
        .unwrap();

        match event.kind {
            ProcessorEventKind::PaymentSucceeded(p) => {
                assert_eq!(p.amount.to_string(), "132.50");
                assert_eq!(p.invoice_id, Some(invoice_id));
                assert_eq!(p.method.as_deref(), Some("card"));
            }
            other => panic!("Expected PaymentSucceeded, got {other:?}"),
        }
    }

    #[test]
    fn malformed_payloads_are_validation_errors() {
        assert!(matches!(
            ProcessorEvent::parse(b"not json").unwrap_err(),
            DomainError::Validation(_)
        ));
        let missing_id = json!({
            "id": "evt_3",
            "type": "customer.subscription.deleted",
            "data": { "object": { "status": "canceled" } }
        });
        assert!(ProcessorEvent::from_value(missing_id).is_err());
        let bad_tenant = json!({
            "id": "evt_4",
            "type": "checkout.session.completed",
            "data": { "object": { "id": "cs_1", "metadata": { "tenant_id": "nope" } } }
        });
        assert!(ProcessorEvent::from_value(bad_tenant).is_err());
    }

    #[test]
    fn status_strings_map_to_closed_set() {
        assert_eq!(parse_status("active"), SubscriptionStatus::Active);
        assert_eq!(parse_status("incomplete"), SubscriptionStatus::PastDue);
        assert_eq!(parse_status("unpaid"), SubscriptionStatus::Cancelled);
        assert_eq!(parse_status("canceled"), SubscriptionStatus::Cancelled);
    }
}
