//! Service facade: the operations callers invoke, each returning a success
//! payload or a typed [`ServiceError`].

mod error;
mod invoicing;
mod reconciliation;

#[cfg(test)]
pub(crate) mod fixtures;

pub use error::{ErrorKind, ServiceError};
pub use invoicing::{
    ClientRemoval, Collaborators, InvoiceDetailsPatch, InvoicingService, NewInvoice, PaymentInput,
};
pub use reconciliation::{ReconcileEffect, ReconcileOutcome, ReconciliationService};
