//! Invoicing domain module (event-sourced).
//!
//! Business rules for tenant invoices: line items and derived totals, the status
//! state machine, payment records, reminders and per-tenant numbering. Pure
//! deterministic domain logic (no IO, no HTTP, no storage).

pub mod invoice;
pub mod numbering;
pub mod payment;
pub mod totals;

pub use invoice::{
    CancelInvoice, CreateInvoice, DeleteInvoice, InitialStatus, Invoice, InvoiceCancelled,
    InvoiceCommand, InvoiceCreated, InvoiceDeleted, InvoiceDetailsUpdated, InvoiceEvent,
    InvoiceId, InvoiceMarkedOverdue, InvoicePaid, InvoiceSent, InvoiceStatus, ItemsReplaced,
    MarkInvoiceOverdue, MarkInvoicePaid, PaymentFailed, RecordFailedPayment, ReminderSent,
    RemindInvoice, ReplaceItems, SendInvoice, UpdateInvoiceDetails,
};
pub use numbering::{
    InvoiceNumber, InvoiceSequence, NumberReserved, ReserveNumber, SequenceCommand, SequenceEvent,
};
pub use payment::{PaymentMethod, PaymentRecord, PaymentStatus};
pub use totals::{InvoiceTotals, LineItem, LineItemDraft, build_line_items};
