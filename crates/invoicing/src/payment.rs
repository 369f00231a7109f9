//! Payment records attached to an invoice.

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tally_core::{DomainError, Money};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
}

/// How a payment was collected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    /// Marked paid by hand (no processor involved).
    Manual,
    BankTransfer,
    Cash,
    Check,
    /// Settled through the payment processor.
    Card,
    Other(String),
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PaymentMethod::Manual => f.write_str("manual"),
            PaymentMethod::BankTransfer => f.write_str("bank_transfer"),
            PaymentMethod::Cash => f.write_str("cash"),
            PaymentMethod::Check => f.write_str("check"),
            PaymentMethod::Card => f.write_str("card"),
            PaymentMethod::Other(tag) => f.write_str(tag),
        }
    }
}

impl FromStr for PaymentMethod {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tag = s.trim().to_lowercase();
        Ok(match tag.as_str() {
            "" => return Err(DomainError::validation("payment method cannot be empty")),
            "manual" => PaymentMethod::Manual,
            "bank_transfer" | "bank" => PaymentMethod::BankTransfer,
            "cash" => PaymentMethod::Cash,
            "check" | "cheque" => PaymentMethod::Check,
            "card" | "stripe" => PaymentMethod::Card,
            _ => PaymentMethod::Other(tag),
        })
    }
}

/// Immutable, append-only record of a payment attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub amount: Money,
    pub method: PaymentMethod,
    pub external_ref: Option<String>,
    pub status: PaymentStatus,
    pub recorded_at: DateTime<Utc>,
}

impl PaymentRecord {
    pub fn is_completed(&self) -> bool {
        self.status == PaymentStatus::Completed
    }

    pub fn has_ref(&self, external_ref: &str) -> bool {
        self.external_ref.as_deref() == Some(external_ref)
    }
}
