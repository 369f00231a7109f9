use thiserror::Error;

use crate::command_dispatcher::DispatchError;
use crate::external::UpstreamError;
use crate::projections::ProjectionError;

/// Transport-independent error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    InvalidStateTransition,
    InvoiceImmutable,
    AlreadyPaid,
    EntitlementExceeded,
    Conflict,
    ValidationFailure,
    UpstreamUnavailable,
    Internal,
}

/// Error returned by the service facade.
///
/// Carries the kind, a message and the ids needed to map it to a transport status.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("cannot {action} an invoice in status '{from}'")]
    InvalidStateTransition { from: String, action: String },

    #[error("invoice is immutable: {0}")]
    InvoiceImmutable(String),

    #[error("invoice is already paid")]
    AlreadyPaid,

    #[error("plan limit reached on '{plan}' plan: {limit}")]
    EntitlementExceeded {
        plan: String,
        limit: String,
        upgrade_to: Option<String>,
    },

    /// Concurrency retries exhausted, or a duplicate key.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::NotFound { .. } => ErrorKind::NotFound,
            ServiceError::InvalidStateTransition { .. } => ErrorKind::InvalidStateTransition,
            ServiceError::InvoiceImmutable(_) => ErrorKind::InvoiceImmutable,
            ServiceError::AlreadyPaid => ErrorKind::AlreadyPaid,
            ServiceError::EntitlementExceeded { .. } => ErrorKind::EntitlementExceeded,
            ServiceError::Conflict(_) => ErrorKind::Conflict,
            ServiceError::Validation(_) => ErrorKind::ValidationFailure,
            ServiceError::Upstream(_) => ErrorKind::UpstreamUnavailable,
            ServiceError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Stable machine code.
    pub fn code(&self) -> &'static str {
        match self.kind() {
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::InvalidStateTransition => "INVALID_STATE_TRANSITION",
            ErrorKind::InvoiceImmutable => "INVOICE_IMMUTABLE",
            ErrorKind::AlreadyPaid => "ALREADY_PAID",
            ErrorKind::EntitlementExceeded => "PLAN_LIMIT",
            ErrorKind::Conflict => "CONFLICT",
            ErrorKind::ValidationFailure => "VALIDATION_ERROR",
            ErrorKind::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            ErrorKind::Internal => "INTERNAL_ERROR",
        }
    }

    /// Map a dispatch failure for an operation on `entity` `id`.
    ///
    /// A concurrency error reaching this point has exhausted its retries.
    pub(crate) fn from_dispatch(err: DispatchError, entity: &'static str, id: impl ToString) -> Self {
        match err {
            DispatchError::NotFound | DispatchError::Unauthorized => Self::not_found(entity, id),
            DispatchError::Concurrency(msg) | DispatchError::Conflict(msg) => Self::Conflict(msg),
            DispatchError::Validation(msg) => Self::Validation(msg),
            DispatchError::InvariantViolation(msg) => Self::Validation(msg),
            DispatchError::InvalidStateTransition { from, action } => {
                Self::InvalidStateTransition { from, action }
            }
            DispatchError::InvoiceImmutable(msg) => Self::InvoiceImmutable(msg),
            DispatchError::AlreadyPaid => Self::AlreadyPaid,
            DispatchError::EntitlementExceeded {
                plan,
                limit,
                upgrade_to,
            } => Self::EntitlementExceeded {
                plan,
                limit,
                upgrade_to,
            },
            DispatchError::TenantIsolation(msg) | DispatchError::Deserialize(msg) | DispatchError::Publish(msg) => {
                Self::Internal(msg)
            }
            DispatchError::Store(e) => Self::Internal(e.to_string()),
        }
    }
}

impl From<DispatchError> for ServiceError {
    fn from(value: DispatchError) -> Self {
        Self::from_dispatch(value, "resource", "")
    }
}

impl From<tally_core::DomainError> for ServiceError {
    fn from(value: tally_core::DomainError) -> Self {
        Self::from_dispatch(DispatchError::from(value), "resource", "")
    }
}

impl From<ProjectionError> for ServiceError {
    fn from(value: ProjectionError) -> Self {
        Self::Internal(format!("read model update failed: {value}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::DomainError;

    #[test]
    fn plan_denials_carry_the_upgrade_hint() {
        let err = ServiceError::from(DomainError::EntitlementExceeded {
            plan: "free".into(),
            limit: "5 invoices per calendar month".into(),
            upgrade_to: Some("pro".into()),
        });
        assert_eq!(err.kind(), ErrorKind::EntitlementExceeded);
        assert_eq!(err.code(), "PLAN_LIMIT");
        assert!(matches!(err, ServiceError::EntitlementExceeded { upgrade_to: Some(ref t), .. } if t == "pro"));
    }

    #[test]
    fn unauthorized_reads_as_not_found() {
        let err = ServiceError::from_dispatch(DispatchError::Unauthorized, "invoice", "42");
        assert_eq!(err.code(), "NOT_FOUND");
        assert_eq!(err.to_string(), "invoice 42 not found");
    }

    #[test]
    fn exhausted_retries_are_conflicts() {
        let err = ServiceError::from_dispatch(DispatchError::Concurrency("stale".into()), "invoice", "1");
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let err = ServiceError::from(UpstreamError::new("notifier", "down"));
        assert_eq!(err.code(), "UPSTREAM_UNAVAILABLE");
    }
}
