use core::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use tally_clients::ClientId;
use tally_core::{Aggregate, AggregateId, AggregateRoot, DomainError, Money, TaxRate, TenantId};
use tally_events::Event;

use crate::numbering::InvoiceNumber;
use crate::payment::{PaymentMethod, PaymentRecord, PaymentStatus};
use crate::totals::{InvoiceTotals, LineItem, LineItemDraft, build_line_items};

/// Invoice identifier (tenant-scoped via `tenant_id` fields in events/commands).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InvoiceId(pub AggregateId);

impl InvoiceId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl fmt::Display for InvoiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Invoice lifecycle status.
///
/// `Paid` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceStatus {
    Draft,
    Pending,
    Paid,
    Overdue,
    Cancelled,
}

impl InvoiceStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, InvoiceStatus::Paid | InvoiceStatus::Cancelled)
    }

    /// Awaiting payment (sent, not settled).
    pub fn is_open(self) -> bool {
        matches!(self, InvoiceStatus::Pending | InvoiceStatus::Overdue)
    }
}

impl fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::Pending => "pending",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Overdue => "overdue",
            InvoiceStatus::Cancelled => "cancelled",
        })
    }
}

/// Status chosen at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitialStatus {
    #[default]
    Draft,
    Pending,
}

/// Aggregate root: Invoice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invoice {
    id: InvoiceId,
    tenant_id: Option<TenantId>,
    client_id: Option<ClientId>,
    number: Option<InvoiceNumber>,
    status: InvoiceStatus,
    issue_date: Option<NaiveDate>,
    due_date: Option<NaiveDate>,
    items: Vec<LineItem>,
    tax_rate: TaxRate,
    totals: InvoiceTotals,
    notes: Option<String>,
    terms: Option<String>,
    paid_amount: Option<Money>,
    paid_at: Option<DateTime<Utc>>,
    payment_method: Option<PaymentMethod>,
    payment_ref: Option<String>,
    payments: Vec<PaymentRecord>,
    reminder_count: u32,
    reminder_sent_at: Option<DateTime<Utc>>,
    sent_at: Option<DateTime<Utc>>,
    created_at: Option<DateTime<Utc>>,
    version: u64,
    created: bool,
    deleted: bool,
}

impl Invoice {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: InvoiceId) -> Self {
        Self {
            id,
            tenant_id: None,
            client_id: None,
            number: None,
            status: InvoiceStatus::Draft,
            issue_date: None,
            due_date: None,
            items: Vec::new(),
            tax_rate: TaxRate::ZERO,
            totals: InvoiceTotals::default(),
            notes: None,
            terms: None,
            paid_amount: None,
            paid_at: None,
            payment_method: None,
            payment_ref: None,
            payments: Vec::new(),
            reminder_count: 0,
            reminder_sent_at: None,
            sent_at: None,
            created_at: None,
            version: 0,
            created: false,
            deleted: false,
        }
    }

    pub fn id_typed(&self) -> InvoiceId {
        self.id
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        self.tenant_id
    }

    pub fn client_id(&self) -> Option<ClientId> {
        self.client_id
    }

    pub fn number(&self) -> Option<InvoiceNumber> {
        self.number
    }

    /// Stored status (see [`Invoice::effective_status`] for the time-aware view).
    pub fn status(&self) -> InvoiceStatus {
        self.status
    }

    pub fn issue_date(&self) -> Option<NaiveDate> {
        self.issue_date
    }

    pub fn due_date(&self) -> Option<NaiveDate> {
        self.due_date
    }

    pub fn items(&self) -> &[LineItem] {
        &self.items
    }

    pub fn tax_rate(&self) -> TaxRate {
        self.tax_rate
    }

    pub fn totals(&self) -> InvoiceTotals {
        self.totals
    }

    pub fn notes(&self) -> Option<&str> {
        self.notes.as_deref()
    }

    pub fn terms(&self) -> Option<&str> {
        self.terms.as_deref()
    }

    pub fn paid_amount(&self) -> Option<Money> {
        self.paid_amount
    }

    pub fn paid_at(&self) -> Option<DateTime<Utc>> {
        self.paid_at
    }

    pub fn payment_method(&self) -> Option<&PaymentMethod> {
        self.payment_method.as_ref()
    }

    pub fn payment_ref(&self) -> Option<&str> {
        self.payment_ref.as_deref()
    }

    pub fn payments(&self) -> &[PaymentRecord] {
        &self.payments
    }

    pub fn reminder_count(&self) -> u32 {
        self.reminder_count
    }

    pub fn reminder_sent_at(&self) -> Option<DateTime<Utc>> {
        self.reminder_sent_at
    }

    pub fn sent_at(&self) -> Option<DateTime<Utc>> {
        self.sent_at
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    /// Created and not deleted.
    pub fn exists(&self) -> bool {
        self.created && !self.deleted
    }

    /// `today > due_date && status == pending`.
    ///
    /// The due date is inclusive: an invoice due today is not yet overdue.
    pub fn is_overdue(&self, today: NaiveDate) -> bool {
        self.status == InvoiceStatus::Pending && self.due_date.is_some_and(|due| today > due)
    }

    /// Status as observed at `today`, with the overdue predicate applied.
    pub fn effective_status(&self, today: NaiveDate) -> InvoiceStatus {
        if self.is_overdue(today) {
            InvoiceStatus::Overdue
        } else {
            self.status
        }
    }

    /// Amount still owed while the invoice is open.
    pub fn amount_due(&self) -> Money {
        if self.status.is_open() {
            self.totals.total
        } else {
            Money::ZERO
        }
    }
}

impl AggregateRoot for Invoice {
    type Id = InvoiceId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreateInvoice.
///
/// `number` has already been reserved from the tenant's numbering sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateInvoice {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub client_id: ClientId,
    pub number: InvoiceNumber,
    pub issue_date: NaiveDate,
    pub due_date: NaiveDate,
    pub items: Vec<LineItemDraft>,
    pub tax_rate: TaxRate,
    pub discount: Money,
    pub notes: Option<String>,
    pub terms: Option<String>,
    pub initial_status: InitialStatus,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ReplaceItems (full replace of the item set).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplaceItems {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub items: Vec<LineItemDraft>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: UpdateInvoiceDetails. `None` leaves a field unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateInvoiceDetails {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub due_date: Option<NaiveDate>,
    pub tax_rate: Option<TaxRate>,
    pub discount: Option<Money>,
    pub notes: Option<String>,
    pub terms: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl UpdateInvoiceDetails {
    /// An update that changes nothing; set the fields to change.
    pub fn new(tenant_id: TenantId, invoice_id: InvoiceId, occurred_at: DateTime<Utc>) -> Self {
        Self {
            tenant_id,
            invoice_id,
            due_date: None,
            tax_rate: None,
            discount: None,
            notes: None,
            terms: None,
            occurred_at,
        }
    }
}

/// Command: SendInvoice. Moves a draft to pending; re-sends an open invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendInvoice {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub recipient: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RemindInvoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemindInvoice {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub recipient: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: MarkInvoicePaid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkInvoicePaid {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub amount: Money,
    pub method: PaymentMethod,
    pub external_ref: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RecordFailedPayment (audit only, no status change).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFailedPayment {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub amount: Money,
    pub method: PaymentMethod,
    pub external_ref: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: MarkInvoiceOverdue (persist the overdue predicate as of a date).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkInvoiceOverdue {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub as_of: NaiveDate,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CancelInvoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelInvoice {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: DeleteInvoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteInvoice {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvoiceCommand {
    CreateInvoice(CreateInvoice),
    ReplaceItems(ReplaceItems),
    UpdateInvoiceDetails(UpdateInvoiceDetails),
    SendInvoice(SendInvoice),
    RemindInvoice(RemindInvoice),
    MarkInvoicePaid(MarkInvoicePaid),
    RecordFailedPayment(RecordFailedPayment),
    MarkInvoiceOverdue(MarkInvoiceOverdue),
    CancelInvoice(CancelInvoice),
    DeleteInvoice(DeleteInvoice),
}

/// Event: invoice created with its full item set (one atomic fact).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceCreated {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub client_id: ClientId,
    pub number: InvoiceNumber,
    pub status: InvoiceStatus,
    pub issue_date: NaiveDate,
    pub due_date: NaiveDate,
    pub items: Vec<LineItem>,
    pub tax_rate: TaxRate,
    pub totals: InvoiceTotals,
    pub notes: Option<String>,
    pub terms: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemsReplaced {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub items: Vec<LineItem>,
    pub totals: InvoiceTotals,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceDetailsUpdated {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub due_date: NaiveDate,
    pub tax_rate: TaxRate,
    pub totals: InvoiceTotals,
    pub notes: Option<String>,
    pub terms: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceSent {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub recipient: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReminderSent {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub recipient: String,
    pub reminder_count: u32,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoicePaid {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub amount: Money,
    pub method: PaymentMethod,
    pub external_ref: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentFailed {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub amount: Money,
    pub method: PaymentMethod,
    pub external_ref: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceMarkedOverdue {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub as_of: NaiveDate,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceCancelled {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceDeleted {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvoiceEvent {
    InvoiceCreated(InvoiceCreated),
    ItemsReplaced(ItemsReplaced),
    InvoiceDetailsUpdated(InvoiceDetailsUpdated),
    InvoiceSent(InvoiceSent),
    ReminderSent(ReminderSent),
    InvoicePaid(InvoicePaid),
    PaymentFailed(PaymentFailed),
    InvoiceMarkedOverdue(InvoiceMarkedOverdue),
    InvoiceCancelled(InvoiceCancelled),
    InvoiceDeleted(InvoiceDeleted),
}

impl InvoiceEvent {
    pub fn invoice_id(&self) -> InvoiceId {
        match self {
            InvoiceEvent::InvoiceCreated(e) => e.invoice_id,
            InvoiceEvent::ItemsReplaced(e) => e.invoice_id,
            InvoiceEvent::InvoiceDetailsUpdated(e) => e.invoice_id,
            InvoiceEvent::InvoiceSent(e) => e.invoice_id,
            InvoiceEvent::ReminderSent(e) => e.invoice_id,
            InvoiceEvent::InvoicePaid(e) => e.invoice_id,
            InvoiceEvent::PaymentFailed(e) => e.invoice_id,
            InvoiceEvent::InvoiceMarkedOverdue(e) => e.invoice_id,
            InvoiceEvent::InvoiceCancelled(e) => e.invoice_id,
            InvoiceEvent::InvoiceDeleted(e) => e.invoice_id,
        }
    }
}

impl Event for InvoiceEvent {
    fn event_type(&self) -> &'static str {
        match self {
            InvoiceEvent::InvoiceCreated(_) => "invoicing.invoice.created",
            InvoiceEvent::ItemsReplaced(_) => "invoicing.invoice.items_replaced",
            InvoiceEvent::InvoiceDetailsUpdated(_) => "invoicing.invoice.details_updated",
            InvoiceEvent::InvoiceSent(_) => "invoicing.invoice.sent",
            InvoiceEvent::ReminderSent(_) => "invoicing.invoice.reminder_sent",
            InvoiceEvent::InvoicePaid(_) => "invoicing.invoice.paid",
            InvoiceEvent::PaymentFailed(_) => "invoicing.invoice.payment_failed",
            InvoiceEvent::InvoiceMarkedOverdue(_) => "invoicing.invoice.overdue",
            InvoiceEvent::InvoiceCancelled(_) => "invoicing.invoice.cancelled",
            InvoiceEvent::InvoiceDeleted(_) => "invoicing.invoice.deleted",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            InvoiceEvent::InvoiceCreated(e) => e.occurred_at,
            InvoiceEvent::ItemsReplaced(e) => e.occurred_at,
            InvoiceEvent::InvoiceDetailsUpdated(e) => e.occurred_at,
            InvoiceEvent::InvoiceSent(e) => e.occurred_at,
            InvoiceEvent::ReminderSent(e) => e.occurred_at,
            InvoiceEvent::InvoicePaid(e) => e.occurred_at,
            InvoiceEvent::PaymentFailed(e) => e.occurred_at,
            InvoiceEvent::InvoiceMarkedOverdue(e) => e.occurred_at,
            InvoiceEvent::InvoiceCancelled(e) => e.occurred_at,
            InvoiceEvent::InvoiceDeleted(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Invoice {
    type Command = InvoiceCommand;
    type Event = InvoiceEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            InvoiceEvent::InvoiceCreated(e) => {
                self.id = e.invoice_id;
                self.tenant_id = Some(e.tenant_id);
                self.client_id = Some(e.client_id);
                self.number = Some(e.number);
                self.status = e.status;
                self.issue_date = Some(e.issue_date);
                self.due_date = Some(e.due_date);
                self.items = e.items.clone();
                self.tax_rate = e.tax_rate;
                self.totals = e.totals;
                self.notes = e.notes.clone();
                self.terms = e.terms.clone();
                self.created_at = Some(e.occurred_at);
                if e.status == InvoiceStatus::Pending {
                    self.sent_at = Some(e.occurred_at);
                }
                self.created = true;
            }
            InvoiceEvent::ItemsReplaced(e) => {
                self.items = e.items.clone();
                self.totals = e.totals;
            }
            InvoiceEvent::InvoiceDetailsUpdated(e) => {
                self.due_date = Some(e.due_date);
                self.tax_rate = e.tax_rate;
                self.totals = e.totals;
                self.notes = e.notes.clone();
                self.terms = e.terms.clone();
            }
            InvoiceEvent::InvoiceSent(e) => {
                if self.status == InvoiceStatus::Draft {
                    self.status = InvoiceStatus::Pending;
                }
                self.sent_at = Some(e.occurred_at);
            }
            InvoiceEvent::ReminderSent(e) => {
                self.reminder_count = e.reminder_count;
                self.reminder_sent_at = Some(e.occurred_at);
            }
            InvoiceEvent::InvoicePaid(e) => {
                self.status = InvoiceStatus::Paid;
                self.paid_amount = Some(e.amount);
                self.paid_at = Some(e.occurred_at);
                self.payment_method = Some(e.method.clone());
                self.payment_ref = e.external_ref.clone();
                self.payments.push(PaymentRecord {
                    amount: e.amount,
                    method: e.method.clone(),
                    external_ref: e.external_ref.clone(),
                    status: PaymentStatus::Completed,
                    recorded_at: e.occurred_at,
                });
            }
            InvoiceEvent::PaymentFailed(e) => {
                self.payments.push(PaymentRecord {
                    amount: e.amount,
                    method: e.method.clone(),
                    external_ref: e.external_ref.clone(),
                    status: PaymentStatus::Failed,
                    recorded_at: e.occurred_at,
                });
            }
            InvoiceEvent::InvoiceMarkedOverdue(_) => {
                self.status = InvoiceStatus::Overdue;
            }
            InvoiceEvent::InvoiceCancelled(_) => {
                self.status = InvoiceStatus::Cancelled;
            }
            InvoiceEvent::InvoiceDeleted(_) => {
                self.deleted = true;
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            InvoiceCommand::CreateInvoice(cmd) => self.handle_create(cmd),
            InvoiceCommand::ReplaceItems(cmd) => self.handle_replace_items(cmd),
            InvoiceCommand::UpdateInvoiceDetails(cmd) => self.handle_update_details(cmd),
            InvoiceCommand::SendInvoice(cmd) => self.handle_send(cmd),
            InvoiceCommand::RemindInvoice(cmd) => self.handle_remind(cmd),
            InvoiceCommand::MarkInvoicePaid(cmd) => self.handle_mark_paid(cmd),
            InvoiceCommand::RecordFailedPayment(cmd) => self.handle_failed_payment(cmd),
            InvoiceCommand::MarkInvoiceOverdue(cmd) => self.handle_mark_overdue(cmd),
            InvoiceCommand::CancelInvoice(cmd) => self.handle_cancel(cmd),
            InvoiceCommand::DeleteInvoice(cmd) => self.handle_delete(cmd),
        }
    }
}

impl Invoice {
    /// Existing, same-tenant, not deleted. Anything else reads as "not found".
    fn ensure_visible(&self, tenant_id: TenantId, invoice_id: InvoiceId) -> Result<(), DomainError> {
        if !self.exists() || self.tenant_id != Some(tenant_id) {
            return Err(DomainError::not_found());
        }
        if self.id != invoice_id {
            return Err(DomainError::invariant("invoice_id mismatch"));
        }
        Ok(())
    }

    /// Items and financial fields may change only while the invoice is not settled.
    fn ensure_editable(&self, action: &str) -> Result<(), DomainError> {
        match self.status {
            InvoiceStatus::Paid => Err(DomainError::immutable(format!(
                "cannot {action} on a paid invoice"
            ))),
            InvoiceStatus::Cancelled => Err(DomainError::transition(self.status, action)),
            _ => Ok(()),
        }
    }

    fn handle_create(&self, cmd: &CreateInvoice) -> Result<Vec<InvoiceEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("invoice already exists"));
        }

        if cmd.due_date < cmd.issue_date {
            return Err(DomainError::validation("due date cannot be before issue date"));
        }

        let items = build_line_items(&cmd.items)?;
        let status = match cmd.initial_status {
            InitialStatus::Draft => InvoiceStatus::Draft,
            InitialStatus::Pending => {
                if items.is_empty() {
                    return Err(DomainError::validation(
                        "cannot create a pending invoice without line items",
                    ));
                }
                InvoiceStatus::Pending
            }
        };
        let totals = InvoiceTotals::compute(&items, cmd.tax_rate, cmd.discount)?;

        Ok(vec![InvoiceEvent::InvoiceCreated(InvoiceCreated {
            tenant_id: cmd.tenant_id,
            invoice_id: cmd.invoice_id,
            client_id: cmd.client_id,
            number: cmd.number,
            status,
            issue_date: cmd.issue_date,
            due_date: cmd.due_date,
            items,
            tax_rate: cmd.tax_rate,
            totals,
            notes: cmd.notes.clone(),
            terms: cmd.terms.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_replace_items(&self, cmd: &ReplaceItems) -> Result<Vec<InvoiceEvent>, DomainError> {
        self.ensure_visible(cmd.tenant_id, cmd.invoice_id)?;
        self.ensure_editable("replace items")?;

        let items = build_line_items(&cmd.items)?;
        if items.is_empty() && self.status.is_open() {
            return Err(DomainError::validation(
                "a sent invoice must keep at least one line item",
            ));
        }
        let totals = InvoiceTotals::compute(&items, self.tax_rate, self.totals.discount_amount)?;

        Ok(vec![InvoiceEvent::ItemsReplaced(ItemsReplaced {
            tenant_id: cmd.tenant_id,
            invoice_id: cmd.invoice_id,
            items,
            totals,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_update_details(
        &self,
        cmd: &UpdateInvoiceDetails,
    ) -> Result<Vec<InvoiceEvent>, DomainError> {
        self.ensure_visible(cmd.tenant_id, cmd.invoice_id)?;
        self.ensure_editable("update details")?;

        let due_date = cmd.due_date.or(self.due_date).ok_or_else(|| {
            DomainError::invariant("created invoice has no due date")
        })?;
        if self.issue_date.is_some_and(|issued| due_date < issued) {
            return Err(DomainError::validation("due date cannot be before issue date"));
        }
        let tax_rate = cmd.tax_rate.unwrap_or(self.tax_rate);
        let discount = cmd.discount.unwrap_or(self.totals.discount_amount);
        let totals = InvoiceTotals::compute(&self.items, tax_rate, discount)?;
        let notes = cmd.notes.clone().or_else(|| self.notes.clone());
        let terms = cmd.terms.clone().or_else(|| self.terms.clone());

        if Some(due_date) == self.due_date
            && tax_rate == self.tax_rate
            && totals == self.totals
            && notes == self.notes
            && terms == self.terms
        {
            return Ok(vec![]);
        }

        Ok(vec![InvoiceEvent::InvoiceDetailsUpdated(InvoiceDetailsUpdated {
            tenant_id: cmd.tenant_id,
            invoice_id: cmd.invoice_id,
            due_date,
            tax_rate,
            totals,
            notes,
            terms,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_send(&self, cmd: &SendInvoice) -> Result<Vec<InvoiceEvent>, DomainError> {
        self.ensure_visible(cmd.tenant_id, cmd.invoice_id)?;

        match self.status {
            InvoiceStatus::Draft if self.items.is_empty() => {
                return Err(DomainError::validation("cannot send an invoice without line items"));
            }
            InvoiceStatus::Draft | InvoiceStatus::Pending | InvoiceStatus::Overdue => {}
            InvoiceStatus::Paid | InvoiceStatus::Cancelled => {
                return Err(DomainError::transition(self.status, "send"));
            }
        }

        Ok(vec![InvoiceEvent::InvoiceSent(InvoiceSent {
            tenant_id: cmd.tenant_id,
            invoice_id: cmd.invoice_id,
            recipient: cmd.recipient.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_remind(&self, cmd: &RemindInvoice) -> Result<Vec<InvoiceEvent>, DomainError> {
        self.ensure_visible(cmd.tenant_id, cmd.invoice_id)?;

        match self.status {
            InvoiceStatus::Pending | InvoiceStatus::Overdue => {}
            InvoiceStatus::Paid => return Err(DomainError::AlreadyPaid),
            InvoiceStatus::Draft | InvoiceStatus::Cancelled => {
                return Err(DomainError::transition(self.status, "remind"));
            }
        }

        let reminder_count = self
            .reminder_count
            .checked_add(1)
            .ok_or_else(|| DomainError::invariant("reminder count overflow"))?;

        Ok(vec![InvoiceEvent::ReminderSent(ReminderSent {
            tenant_id: cmd.tenant_id,
            invoice_id: cmd.invoice_id,
            recipient: cmd.recipient.clone(),
            reminder_count,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_mark_paid(&self, cmd: &MarkInvoicePaid) -> Result<Vec<InvoiceEvent>, DomainError> {
        self.ensure_visible(cmd.tenant_id, cmd.invoice_id)?;

        if cmd.amount.is_zero() {
            return Err(DomainError::validation("payment amount must be positive"));
        }
        if cmd.external_ref.as_deref().is_some_and(|r| r.trim().is_empty()) {
            return Err(DomainError::validation("external payment reference cannot be blank"));
        }

        match self.status {
            InvoiceStatus::Pending | InvoiceStatus::Overdue => {}
            InvoiceStatus::Paid => {
                // Redelivery of the confirmation that settled this invoice.
                let same_ref = cmd.external_ref.as_deref().is_some_and(|r| {
                    self.payments.iter().any(|p| p.is_completed() && p.has_ref(r))
                });
                if same_ref {
                    return Ok(vec![]);
                }
                return Err(DomainError::transition(self.status, "mark paid"));
            }
            InvoiceStatus::Draft | InvoiceStatus::Cancelled => {
                return Err(DomainError::transition(self.status, "mark paid"));
            }
        }

        Ok(vec![InvoiceEvent::InvoicePaid(InvoicePaid {
            tenant_id: cmd.tenant_id,
            invoice_id: cmd.invoice_id,
            amount: cmd.amount,
            method: cmd.method.clone(),
            external_ref: cmd.external_ref.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_failed_payment(
        &self,
        cmd: &RecordFailedPayment,
    ) -> Result<Vec<InvoiceEvent>, DomainError> {
        self.ensure_visible(cmd.tenant_id, cmd.invoice_id)?;

        let duplicate = cmd.external_ref.as_deref().is_some_and(|r| {
            self.payments
                .iter()
                .any(|p| p.status == PaymentStatus::Failed && p.has_ref(r))
        });
        if duplicate {
            return Ok(vec![]);
        }

        Ok(vec![InvoiceEvent::PaymentFailed(PaymentFailed {
            tenant_id: cmd.tenant_id,
            invoice_id: cmd.invoice_id,
            amount: cmd.amount,
            method: cmd.method.clone(),
            external_ref: cmd.external_ref.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_mark_overdue(
        &self,
        cmd: &MarkInvoiceOverdue,
    ) -> Result<Vec<InvoiceEvent>, DomainError> {
        self.ensure_visible(cmd.tenant_id, cmd.invoice_id)?;

        match self.status {
            InvoiceStatus::Overdue => Ok(vec![]),
            InvoiceStatus::Pending if self.is_overdue(cmd.as_of) => {
                Ok(vec![InvoiceEvent::InvoiceMarkedOverdue(InvoiceMarkedOverdue {
                    tenant_id: cmd.tenant_id,
                    invoice_id: cmd.invoice_id,
                    as_of: cmd.as_of,
                    occurred_at: cmd.occurred_at,
                })])
            }
            InvoiceStatus::Pending => Err(DomainError::validation(format!(
                "invoice is not past due as of {}",
                cmd.as_of
            ))),
            _ => Err(DomainError::transition(self.status, "mark overdue")),
        }
    }

    fn handle_cancel(&self, cmd: &CancelInvoice) -> Result<Vec<InvoiceEvent>, DomainError> {
        self.ensure_visible(cmd.tenant_id, cmd.invoice_id)?;

        if self.status.is_terminal() {
            return Err(DomainError::transition(self.status, "cancel"));
        }

        Ok(vec![InvoiceEvent::InvoiceCancelled(InvoiceCancelled {
            tenant_id: cmd.tenant_id,
            invoice_id: cmd.invoice_id,
            reason: cmd.reason.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_delete(&self, cmd: &DeleteInvoice) -> Result<Vec<InvoiceEvent>, DomainError> {
        self.ensure_visible(cmd.tenant_id, cmd.invoice_id)?;

        if self.status == InvoiceStatus::Paid {
            return Err(DomainError::immutable("cannot delete a paid invoice"));
        }

        Ok(vec![InvoiceEvent::InvoiceDeleted(InvoiceDeleted {
            tenant_id: cmd.tenant_id,
            invoice_id: cmd.invoice_id,
            occurred_at: cmd.occurred_at,
        })])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn test_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, 9, 30, 0).unwrap()
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn money(s: &str) -> Money {
        s.parse().unwrap()
    }

    fn scenario_items() -> Vec<LineItemDraft> {
        vec![
            LineItemDraft::new("Design", "2".parse().unwrap(), money("50.00")),
            LineItemDraft::new("Hosting", "1".parse().unwrap(), money("25.00")),
        ]
    }

    struct Fixture {
        tenant_id: TenantId,
        invoice_id: InvoiceId,
        invoice: Invoice,
    }

    impl Fixture {
        fn created(initial_status: InitialStatus, items: Vec<LineItemDraft>) -> Self {
            let tenant_id = TenantId::new();
            let invoice_id = InvoiceId::new(AggregateId::new());
            let mut invoice = Invoice::empty(invoice_id);
            let events = invoice
                .handle(&InvoiceCommand::CreateInvoice(CreateInvoice {
                    tenant_id,
                    invoice_id,
                    client_id: ClientId::new(AggregateId::new()),
                    number: InvoiceNumber::new(2026, 1).unwrap(),
                    issue_date: date(2026, 3, 1),
                    due_date: date(2026, 3, 31),
                    items,
                    tax_rate: "10".parse().unwrap(),
                    discount: money("5.00"),
                    notes: None,
                    terms: Some("Net 30".to_string()),
                    initial_status,
                    occurred_at: test_time(),
                }))
                .unwrap();
            for e in &events {
                invoice.apply(e);
            }
            Self {
                tenant_id,
                invoice_id,
                invoice,
            }
        }

        fn pending() -> Self {
            Self::created(InitialStatus::Pending, scenario_items())
        }

        fn run(&mut self, command: InvoiceCommand) -> Result<Vec<InvoiceEvent>, DomainError> {
            let events = self.invoice.handle(&command)?;
            for e in &events {
                self.invoice.apply(e);
            }
            Ok(events)
        }

        fn mark_paid(&self, amount: &str, external_ref: Option<&str>) -> InvoiceCommand {
            InvoiceCommand::MarkInvoicePaid(MarkInvoicePaid {
                tenant_id: self.tenant_id,
                invoice_id: self.invoice_id,
                amount: money(amount),
                method: PaymentMethod::Manual,
                external_ref: external_ref.map(str::to_string),
                occurred_at: test_time(),
            })
        }

        fn cancel(&self) -> InvoiceCommand {
            InvoiceCommand::CancelInvoice(CancelInvoice {
                tenant_id: self.tenant_id,
                invoice_id: self.invoice_id,
                reason: None,
                occurred_at: test_time(),
            })
        }

        fn send(&self) -> InvoiceCommand {
            InvoiceCommand::SendInvoice(SendInvoice {
                tenant_id: self.tenant_id,
                invoice_id: self.invoice_id,
                recipient: "a@x.com".to_string(),
                occurred_at: test_time(),
            })
        }

        fn remind(&self) -> InvoiceCommand {
            InvoiceCommand::RemindInvoice(RemindInvoice {
                tenant_id: self.tenant_id,
                invoice_id: self.invoice_id,
                recipient: "a@x.com".to_string(),
                occurred_at: test_time(),
            })
        }

        fn replace_items(&self, items: Vec<LineItemDraft>) -> InvoiceCommand {
            InvoiceCommand::ReplaceItems(ReplaceItems {
                tenant_id: self.tenant_id,
                invoice_id: self.invoice_id,
                items,
                occurred_at: test_time(),
            })
        }
    }

    #[test]
    fn create_computes_totals_and_keeps_item_order() {
        let fx = Fixture::pending();
        let totals = fx.invoice.totals();

        assert_eq!(totals.subtotal, money("125.00"));
        assert_eq!(totals.tax_amount, money("12.50"));
        assert_eq!(totals.total, money("132.50"));
        assert_eq!(fx.invoice.status(), InvoiceStatus::Pending);
        assert_eq!(fx.invoice.items()[0].description, "Design");
        assert_eq!(fx.invoice.items()[1].position, 2);
        assert_eq!(fx.invoice.number().unwrap().to_string(), "INV-2026-0001");
        assert_eq!(fx.invoice.version(), 1);
    }

    #[test]
    fn create_rejects_pending_without_items_and_backdated_due_date() {
        let tenant_id = TenantId::new();
        let invoice_id = InvoiceId::new(AggregateId::new());
        let invoice = Invoice::empty(invoice_id);
        let mut cmd = CreateInvoice {
            tenant_id,
            invoice_id,
            client_id: ClientId::new(AggregateId::new()),
            number: InvoiceNumber::new(2026, 1).unwrap(),
            issue_date: date(2026, 3, 1),
            due_date: date(2026, 3, 31),
            items: vec![],
            tax_rate: TaxRate::ZERO,
            discount: Money::ZERO,
            notes: None,
            terms: None,
            initial_status: InitialStatus::Pending,
            occurred_at: test_time(),
        };

        let err = invoice
            .handle(&InvoiceCommand::CreateInvoice(cmd.clone()))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));

        cmd.initial_status = InitialStatus::Draft;
        cmd.due_date = date(2026, 2, 1);
        let err = invoice
            .handle(&InvoiceCommand::CreateInvoice(cmd))
            .unwrap_err();
        match err {
            DomainError::Validation(msg) if msg.contains("due date") => {}
            _ => panic!("Expected Validation error for due date before issue date"),
        }
    }

    #[test]
    fn draft_send_requires_items_then_moves_to_pending() {
        let mut fx = Fixture::created(InitialStatus::Draft, vec![]);
        let err = fx.run(fx.send()).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));

        fx.run(fx.replace_items(scenario_items())).unwrap();
        fx.run(fx.send()).unwrap();
        assert_eq!(fx.invoice.status(), InvoiceStatus::Pending);
        assert!(fx.invoice.sent_at().is_some());

        // Re-sending an open invoice is allowed and does not change status.
        fx.run(fx.send()).unwrap();
        assert_eq!(fx.invoice.status(), InvoiceStatus::Pending);
    }

    #[test]
    fn mark_paid_then_cancel_is_an_invalid_transition() {
        let mut fx = Fixture::pending();
        fx.run(fx.mark_paid("132.50", None)).unwrap();

        assert_eq!(fx.invoice.status(), InvoiceStatus::Paid);
        assert_eq!(fx.invoice.paid_amount(), Some(money("132.50")));
        assert_eq!(fx.invoice.payment_method(), Some(&PaymentMethod::Manual));
        assert!(fx.invoice.paid_at().is_some());

        let err = fx.run(fx.cancel()).unwrap_err();
        match err {
            DomainError::InvalidStateTransition { from, action } => {
                assert_eq!(from, "paid");
                assert_eq!(action, "cancel");
            }
            _ => panic!("Expected InvalidStateTransition for cancelling paid invoice"),
        }
    }

    #[test]
    fn mark_paid_is_idempotent_per_external_reference() {
        let mut fx = Fixture::pending();
        fx.run(fx.mark_paid("132.50", Some("pi_123"))).unwrap();

        let again = fx.run(fx.mark_paid("132.50", Some("pi_123"))).unwrap();
        assert!(again.is_empty());

        let err = fx.run(fx.mark_paid("132.50", Some("pi_999"))).unwrap_err();
        assert!(matches!(err, DomainError::InvalidStateTransition { .. }));

        let completed = fx
            .invoice
            .payments()
            .iter()
            .filter(|p| p.is_completed())
            .count();
        assert_eq!(completed, 1);
        assert_eq!(fx.invoice.payment_ref(), Some("pi_123"));
    }

    #[test]
    fn paid_invoice_is_immutable() {
        let mut fx = Fixture::pending();
        fx.run(fx.mark_paid("132.50", None)).unwrap();

        let err = fx.run(fx.replace_items(scenario_items())).unwrap_err();
        assert!(matches!(err, DomainError::InvoiceImmutable(_)));

        let err = fx
            .run(InvoiceCommand::UpdateInvoiceDetails(UpdateInvoiceDetails {
                discount: Some(Money::ZERO),
                ..UpdateInvoiceDetails::new(fx.tenant_id, fx.invoice_id, test_time())
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvoiceImmutable(_)));

        let err = fx
            .run(InvoiceCommand::DeleteInvoice(DeleteInvoice {
                tenant_id: fx.tenant_id,
                invoice_id: fx.invoice_id,
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvoiceImmutable(_)));

        let err = fx.run(fx.remind()).unwrap_err();
        assert_eq!(err, DomainError::AlreadyPaid);
        assert_eq!(fx.invoice.status(), InvoiceStatus::Paid);
    }

    #[test]
    fn draft_cannot_be_marked_paid_or_reminded() {
        let mut fx = Fixture::created(InitialStatus::Draft, scenario_items());
        let err = fx.run(fx.mark_paid("132.50", None)).unwrap_err();
        assert!(matches!(err, DomainError::InvalidStateTransition { .. }));
        let err = fx.run(fx.remind()).unwrap_err();
        assert!(matches!(err, DomainError::InvalidStateTransition { .. }));
    }

    #[test]
    fn zero_payment_is_rejected() {
        let mut fx = Fixture::pending();
        let err = fx.run(fx.mark_paid("0", None)).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
        assert_eq!(fx.invoice.status(), InvoiceStatus::Pending);
    }

    #[test]
    fn remind_increments_count_and_stamps_time() {
        let mut fx = Fixture::pending();
        fx.run(fx.remind()).unwrap();
        fx.run(fx.remind()).unwrap();

        assert_eq!(fx.invoice.reminder_count(), 2);
        assert!(fx.invoice.reminder_sent_at().is_some());
    }

    #[test]
    fn overdue_is_derived_from_due_date_and_can_be_persisted() {
        let mut fx = Fixture::pending();
        assert!(!fx.invoice.is_overdue(date(2026, 3, 31)));
        assert!(fx.invoice.is_overdue(date(2026, 4, 1)));
        assert_eq!(
            fx.invoice.effective_status(date(2026, 4, 1)),
            InvoiceStatus::Overdue
        );

        let mark = InvoiceCommand::MarkInvoiceOverdue(MarkInvoiceOverdue {
            tenant_id: fx.tenant_id,
            invoice_id: fx.invoice_id,
            as_of: date(2026, 4, 1),
            occurred_at: test_time(),
        });
        fx.run(mark.clone()).unwrap();
        assert_eq!(fx.invoice.status(), InvoiceStatus::Overdue);
        assert!(fx.run(mark).unwrap().is_empty());

        // Overdue invoices can still be reminded and paid.
        fx.run(fx.remind()).unwrap();
        fx.run(fx.mark_paid("132.50", None)).unwrap();
        assert_eq!(fx.invoice.status(), InvoiceStatus::Paid);
        assert!(!fx.invoice.is_overdue(date(2026, 5, 1)));
    }

    #[test]
    fn failed_payment_is_recorded_without_status_change() {
        let mut fx = Fixture::pending();
        let cmd = InvoiceCommand::RecordFailedPayment(RecordFailedPayment {
            tenant_id: fx.tenant_id,
            invoice_id: fx.invoice_id,
            amount: money("132.50"),
            method: PaymentMethod::Card,
            external_ref: Some("pi_fail".to_string()),
            occurred_at: test_time(),
        });
        fx.run(cmd.clone()).unwrap();
        assert!(fx.run(cmd).unwrap().is_empty());

        assert_eq!(fx.invoice.status(), InvoiceStatus::Pending);
        assert_eq!(fx.invoice.payments().len(), 1);
        assert_eq!(fx.invoice.payments()[0].status, PaymentStatus::Failed);
    }

    #[test]
    fn cancelled_invoice_rejects_edits_as_transition() {
        let mut fx = Fixture::pending();
        fx.run(fx.cancel()).unwrap();

        let err = fx.run(fx.replace_items(scenario_items())).unwrap_err();
        assert!(matches!(err, DomainError::InvalidStateTransition { .. }));
        let err = fx.run(fx.cancel()).unwrap_err();
        assert!(matches!(err, DomainError::InvalidStateTransition { .. }));
        let err = fx.run(fx.send()).unwrap_err();
        assert!(matches!(err, DomainError::InvalidStateTransition { .. }));
    }

    #[test]
    fn deleted_invoice_is_not_found() {
        let mut fx = Fixture::created(InitialStatus::Draft, scenario_items());
        fx.run(InvoiceCommand::DeleteInvoice(DeleteInvoice {
            tenant_id: fx.tenant_id,
            invoice_id: fx.invoice_id,
            occurred_at: test_time(),
        }))
        .unwrap();

        assert!(!fx.invoice.exists());
        assert_eq!(fx.run(fx.send()).unwrap_err(), DomainError::NotFound);
    }

    #[test]
    fn other_tenant_cannot_see_invoice() {
        let fx = Fixture::pending();
        let err = fx
            .invoice
            .handle(&InvoiceCommand::CancelInvoice(CancelInvoice {
                tenant_id: TenantId::new(),
                invoice_id: fx.invoice_id,
                reason: None,
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert_eq!(err, DomainError::NotFound);
    }

    #[test]
    fn update_details_recomputes_totals() {
        let mut fx = Fixture::pending();
        fx.run(InvoiceCommand::UpdateInvoiceDetails(UpdateInvoiceDetails {
            tax_rate: Some(TaxRate::ZERO),
            discount: Some(Money::ZERO),
            ..UpdateInvoiceDetails::new(fx.tenant_id, fx.invoice_id, test_time())
        }))
        .unwrap();

        assert_eq!(fx.invoice.totals().total, money("125.00"));
        assert_eq!(fx.invoice.terms(), Some("Net 30"));
    }

    #[test]
    fn handle_does_not_mutate_state() {
        let fx = Fixture::pending();
        let before = fx.invoice.clone();
        let _ = fx.invoice.handle(&fx.mark_paid("132.50", None)).unwrap();
        assert_eq!(fx.invoice, before);
    }

    fn any_command(fx: &Fixture, pick: u8) -> InvoiceCommand {
        match pick % 6 {
            0 => fx.cancel(),
            1 => fx.send(),
            2 => fx.remind(),
            3 => fx.mark_paid("10.00", Some("pi_other")),
            4 => fx.replace_items(scenario_items()),
            _ => InvoiceCommand::DeleteInvoice(DeleteInvoice {
                tenant_id: fx.tenant_id,
                invoice_id: fx.invoice_id,
                occurred_at: test_time(),
            }),
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 128,
            ..ProptestConfig::default()
        })]

        /// Once paid, no command sequence moves the invoice out of `paid` or adds
        /// a second completed payment.
        #[test]
        fn paid_is_absorbing(picks in prop::collection::vec(any::<u8>(), 1..20)) {
            let mut fx = Fixture::pending();
            fx.run(fx.mark_paid("132.50", Some("pi_123"))).unwrap();

            for pick in picks {
                let cmd = any_command(&fx, pick);
                let _ = fx.run(cmd);
                prop_assert_eq!(fx.invoice.status(), InvoiceStatus::Paid);
                prop_assert!(fx.invoice.exists());
            }

            let again = fx.run(fx.mark_paid("132.50", Some("pi_123"))).unwrap();
            prop_assert!(again.is_empty());
            let completed = fx.invoice.payments().iter().filter(|p| p.is_completed()).count();
            prop_assert_eq!(completed, 1);
            prop_assert_eq!(fx.invoice.paid_amount(), Some(money("132.50")));
        }
    }
}
