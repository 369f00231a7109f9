//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Deterministic business failures only. Storage and collaborator failures are
/// modelled in the infrastructure crate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (malformed money, zero quantity, ...).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A domain invariant was violated.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// The referenced entity does not exist for the requesting tenant.
    #[error("not found")]
    NotFound,

    /// A conflict occurred (stale version, duplicate key).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Authorization failure at the domain boundary.
    #[error("unauthorized")]
    Unauthorized,

    /// The requested status change is not allowed from the current status.
    #[error("cannot {action} an invoice in status '{from}'")]
    InvalidStateTransition { from: String, action: String },

    /// Items or financial fields were mutated on a paid invoice.
    #[error("invoice is immutable: {0}")]
    InvoiceImmutable(String),

    /// A reminder or payment action targeted an invoice that is already settled.
    #[error("invoice is already paid")]
    AlreadyPaid,

    /// The tenant's plan does not permit the action.
    #[error("plan limit reached on '{plan}' plan: {limit}")]
    EntitlementExceeded {
        plan: String,
        limit: String,
        upgrade_to: Option<String>,
    },
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found() -> Self {
        Self::NotFound
    }

    pub fn transition(from: impl core::fmt::Display, action: impl Into<String>) -> Self {
        Self::InvalidStateTransition {
            from: from.to_string(),
            action: action.into(),
        }
    }

    pub fn immutable(msg: impl Into<String>) -> Self {
        Self::InvoiceImmutable(msg.into())
    }
}
