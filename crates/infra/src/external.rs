//! Outbound collaborators: document rendering, email delivery, the payment
//! processor and the clock.
//!
//! Implementations live outside this crate (PDF engine, SMTP relay, processor
//! SDK). The in-memory versions back tests and local runs.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use thiserror::Error;

use tally_billing::PlanTier;
use tally_core::TenantId;
use tally_invoicing::InvoiceNumber;

use crate::projections::InvoiceReadModel;

/// A collaborator call failed. The caller's state is left unchanged.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{service} unavailable: {message}")]
pub struct UpstreamError {
    pub service: &'static str,
    pub message: String,
}

impl UpstreamError {
    pub fn new(service: &'static str, message: impl Into<String>) -> Self {
        Self {
            service,
            message: message.into(),
        }
    }
}

/// Issuer block printed on documents and used as the email sender.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IssuerProfile {
    pub name: String,
    pub email: String,
    pub company: Option<String>,
    pub address: Option<String>,
}

pub trait DocumentRenderer: Send + Sync + 'static {
    /// Opaque document bytes (PDF).
    fn render(&self, invoice: &InvoiceReadModel, issuer: &IssuerProfile) -> Result<Vec<u8>, UpstreamError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmailKind {
    Invoice,
    Reminder,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceEmail {
    pub to: String,
    pub reply_to: Option<String>,
    pub subject: String,
    pub kind: EmailKind,
    pub invoice_number: InvoiceNumber,
    pub attachment: Option<Vec<u8>>,
}

pub trait Notifier: Send + Sync + 'static {
    /// Deliver once. Retrying is the caller's decision.
    fn deliver(&self, email: &InvoiceEmail) -> Result<(), UpstreamError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutRequest {
    pub tenant_id: TenantId,
    pub tier: PlanTier,
    pub price_id: String,
    /// Existing processor customer, if the tenant already has one.
    pub customer_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutStarted {
    pub customer_id: String,
    pub session_id: String,
    pub url: String,
}

pub trait PaymentProcessor: Send + Sync + 'static {
    fn create_checkout(&self, request: &CheckoutRequest) -> Result<CheckoutStarted, UpstreamError>;

    fn cancel_subscription(&self, subscription_id: &str, at_period_end: bool) -> Result<(), UpstreamError>;
}

pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock pinned to a settable instant.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(now) }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        if let Ok(mut guard) = self.now.lock() {
            *guard = now;
        }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map(|guard| *guard).unwrap_or_else(|_| Utc::now())
    }
}

/// Renders a plain-text summary. Stands in for the PDF engine.
#[derive(Debug, Default)]
pub struct PlainTextRenderer;

impl DocumentRenderer for PlainTextRenderer {
    fn render(&self, invoice: &InvoiceReadModel, issuer: &IssuerProfile) -> Result<Vec<u8>, UpstreamError> {
        let mut out = format!(
            "{}\nInvoice {}\nIssued {} / due {}\n",
            issuer.name, invoice.number, invoice.issue_date, invoice.due_date
        );
        for item in &invoice.items {
            out.push_str(&format!("{}  {}\n", item.description, item.amount));
        }
        out.push_str(&format!("Total {}\n", invoice.totals.total));
        Ok(out.into_bytes())
    }
}

/// Captures delivered emails; can be switched to fail.
#[derive(Debug, Default)]
pub struct InMemoryNotifier {
    sent: Mutex<Vec<InvoiceEmail>>,
    failing: Mutex<bool>,
}

impl InMemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        if let Ok(mut guard) = self.failing.lock() {
            *guard = failing;
        }
    }

    pub fn sent(&self) -> Vec<InvoiceEmail> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl Notifier for InMemoryNotifier {
    fn deliver(&self, email: &InvoiceEmail) -> Result<(), UpstreamError> {
        if self.failing.lock().map(|f| *f).unwrap_or(false) {
            return Err(UpstreamError::new("notifier", "smtp relay refused the message"));
        }
        self.sent
            .lock()
            .map_err(|_| UpstreamError::new("notifier", "outbox lock poisoned"))?
            .push(email.clone());
        Ok(())
    }
}

/// Processor double: issues deterministic customer and session ids.
#[derive(Debug, Default)]
pub struct InMemoryPaymentProcessor {
    cancellations: Mutex<Vec<(String, bool)>>,
}

impl InMemoryPaymentProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancellations(&self) -> Vec<(String, bool)> {
        self.cancellations.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl PaymentProcessor for InMemoryPaymentProcessor {
    fn create_checkout(&self, request: &CheckoutRequest) -> Result<CheckoutStarted, UpstreamError> {
        let customer_id = request
            .customer_id
            .clone()
            .unwrap_or_else(|| format!("cus_{}", request.tenant_id.as_uuid().simple()));
        let session_id = format!("cs_{}", uuid::Uuid::now_v7().simple());
        Ok(CheckoutStarted {
            url: format!("https://checkout.invalid/{session_id}"),
            customer_id,
            session_id,
        })
    }

    fn cancel_subscription(&self, subscription_id: &str, at_period_end: bool) -> Result<(), UpstreamError> {
        self.cancellations
            .lock()
            .map_err(|_| UpstreamError::new("payment processor", "lock poisoned"))?
            .push((subscription_id.to_string(), at_period_end));
        Ok(())
    }
}
