//! Tenant-facing operations over clients, invoices and the tenant's plan.
//!
//! ```text
//! request ─▶ plan check ─▶ collaborators (render/notify/processor) ─▶ dispatch ─▶ project
//! ```
//!
//! Every mutation goes through the [`CommandDispatcher`]; the committed events
//! are then applied to the read models before returning, so a caller always
//! reads its own writes. Collaborator calls happen before the dispatch: when
//! they fail nothing is appended.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use tracing::{debug, info, instrument, warn};

use tally_billing::{
    BillingAccount, BillingCommand, LinkCustomer, PlanAction, PlanTier, ScheduleCancellation, Usage,
};
use tally_clients::{
    Client, ClientCommand, ClientDetails, ClientId, ClientStatus, DeactivateClient, DeleteClient,
    ReactivateClient, RegisterClient, UpdateClient, normalize_email,
};
use tally_core::{Aggregate, AggregateId, DomainError, Money, TaxRate, TenantId};
use tally_events::{EventBus, EventEnvelope};
use tally_invoicing::{
    CancelInvoice, CreateInvoice, DeleteInvoice, InitialStatus, Invoice, InvoiceCommand, InvoiceId,
    InvoiceTotals, LineItemDraft, MarkInvoiceOverdue, MarkInvoicePaid, PaymentMethod, RemindInvoice,
    ReplaceItems, SendInvoice, UpdateInvoiceDetails, build_line_items,
};

use super::error::ServiceError;
use crate::command_dispatcher::CommandDispatcher;
use crate::config::TallyConfig;
use crate::event_store::{EventStore, StoredEvent};
use crate::external::{
    CheckoutRequest, CheckoutStarted, Clock, DocumentRenderer, EmailKind, InMemoryNotifier,
    InMemoryPaymentProcessor, InvoiceEmail, IssuerProfile, Notifier, PaymentProcessor,
    PlainTextRenderer, SystemClock,
};
use crate::numbering::{NumberAllocator, retry_on_conflict};
use crate::projections::{
    BILLING_AGGREGATE, BillingAccountReadModel, CLIENT_AGGREGATE, ClientReadModel, INVOICE_AGGREGATE,
    InvoiceFilter, InvoiceReadModel, InvoiceStats, ReadModels, month_start,
};

/// Outbound collaborators of the service.
#[derive(Clone)]
pub struct Collaborators {
    pub renderer: Arc<dyn DocumentRenderer>,
    pub notifier: Arc<dyn Notifier>,
    pub processor: Arc<dyn PaymentProcessor>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// Local doubles and the system clock.
    pub fn in_memory() -> Self {
        Self {
            renderer: Arc::new(PlainTextRenderer),
            notifier: Arc::new(InMemoryNotifier::new()),
            processor: Arc::new(InMemoryPaymentProcessor::new()),
            clock: Arc::new(SystemClock),
        }
    }
}

impl core::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

/// Input of `create_invoice`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewInvoice {
    pub client_id: ClientId,
    /// Defaults to today.
    pub issue_date: Option<NaiveDate>,
    pub due_date: NaiveDate,
    pub items: Vec<LineItemDraft>,
    pub tax_rate: TaxRate,
    pub discount: Money,
    pub notes: Option<String>,
    pub terms: Option<String>,
    pub initial_status: InitialStatus,
}

/// Fields of `update_invoice_details`; `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvoiceDetailsPatch {
    pub due_date: Option<NaiveDate>,
    pub tax_rate: Option<TaxRate>,
    pub discount: Option<Money>,
    pub notes: Option<String>,
    pub terms: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentInput {
    pub amount: Money,
    pub method: PaymentMethod,
    pub external_ref: Option<String>,
}

/// Outcome of `delete_client`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientRemoval {
    Deleted,
    /// Invoices still reference the client, so it was deactivated instead.
    Deactivated,
}

/// Facade over the invoicing core for one deployment (all tenants).
pub struct InvoicingService<S, B> {
    dispatcher: Arc<CommandDispatcher<S, B>>,
    read_models: Arc<ReadModels>,
    config: TallyConfig,
    numbers: NumberAllocator,
    collaborators: Collaborators,
}

impl<S, B> core::fmt::Debug for InvoicingService<S, B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InvoicingService")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S, B> InvoicingService<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    pub fn new(
        dispatcher: Arc<CommandDispatcher<S, B>>,
        read_models: Arc<ReadModels>,
        config: TallyConfig,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            numbers: NumberAllocator::new(config.conflict_retries),
            dispatcher,
            read_models,
            config,
            collaborators,
        }
    }

    pub fn dispatcher(&self) -> &Arc<CommandDispatcher<S, B>> {
        &self.dispatcher
    }

    pub fn read_models(&self) -> &Arc<ReadModels> {
        &self.read_models
    }

    pub fn config(&self) -> &TallyConfig {
        &self.config
    }

    pub(super) fn now(&self) -> DateTime<Utc> {
        self.collaborators.clock.now()
    }

    /// Dispatch with bounded conflict retries, then project the committed events.
    pub(super) fn execute<A>(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        aggregate_type: &'static str,
        entity: &'static str,
        command: A::Command,
        make: fn(AggregateId) -> A,
    ) -> Result<Vec<StoredEvent>, ServiceError>
    where
        A: Aggregate<Error = DomainError>,
        A::Event: tally_events::Event + Serialize + DeserializeOwned,
    {
        let committed = retry_on_conflict(self.config.conflict_retries, || {
            self.dispatcher.dispatch::<A>(
                tenant_id,
                aggregate_id,
                aggregate_type,
                command.clone(),
                |_, id| make(id),
            )
        })
        .map_err(|e| ServiceError::from_dispatch(e, entity, aggregate_id))?;

        if let Err(err) = self.read_models.apply(&committed) {
            // Another writer's events for this stream have not been projected yet.
            debug!(error = %err, %aggregate_id, "read models behind the stream, catching up");
            let stream = self
                .dispatcher
                .store()
                .load_stream(tenant_id, aggregate_id)
                .map_err(|e| ServiceError::Internal(e.to_string()))?;
            self.read_models.apply(&stream)?;
        }
        if committed.is_empty() {
            debug!(entity, %aggregate_id, "command was a no-op");
        }
        Ok(committed)
    }

    pub(super) fn load_invoice(&self, tenant_id: TenantId, invoice_id: InvoiceId) -> Result<Invoice, ServiceError> {
        let invoice: Invoice = self
            .dispatcher
            .load(tenant_id, invoice_id.0, |_, id| Invoice::empty(InvoiceId::new(id)))
            .map_err(|e| ServiceError::from_dispatch(e, "invoice", invoice_id))?;
        if !invoice.exists() {
            return Err(ServiceError::not_found("invoice", invoice_id));
        }
        Ok(invoice)
    }

    fn load_client(&self, tenant_id: TenantId, client_id: ClientId) -> Result<Client, ServiceError> {
        let client: Client = self
            .dispatcher
            .load(tenant_id, client_id.0, |_, id| Client::empty(ClientId::new(id)))
            .map_err(|e| ServiceError::from_dispatch(e, "client", client_id))?;
        if !client.exists() {
            return Err(ServiceError::not_found("client", client_id));
        }
        Ok(client)
    }

    pub(super) fn load_account(&self, tenant_id: TenantId) -> Result<BillingAccount, ServiceError> {
        self.dispatcher
            .load(tenant_id, BillingAccount::stream_id(tenant_id), |_, id| BillingAccount::empty(id))
            .map_err(|e| ServiceError::from_dispatch(e, "billing account", tenant_id))
    }

    fn invoice_view(&self, tenant_id: TenantId, invoice_id: InvoiceId) -> Result<InvoiceReadModel, ServiceError> {
        self.read_models
            .invoices
            .get(tenant_id, &invoice_id, self.now().date_naive())
            .ok_or_else(|| ServiceError::not_found("invoice", invoice_id))
    }

    fn usage(&self, tenant_id: TenantId, now: DateTime<Utc>) -> Usage {
        Usage {
            invoices_this_month: self.read_models.invoices.created_since(tenant_id, month_start(now)),
            active_clients: self.read_models.clients.active_count(tenant_id),
        }
    }

    /// Usage is read before acting, so concurrent requests may overshoot a
    /// limit by a little. Limits are soft.
    fn check_plan(&self, tenant_id: TenantId, action: PlanAction) -> Result<(), ServiceError> {
        let now = self.now();
        let plan = self.load_account(tenant_id)?.effective_plan(now);
        let usage = self.usage(tenant_id, now);
        self.config.plans.check(plan, action, usage).map_err(|e| {
            warn!(%tenant_id, %plan, %action, "plan limit reached");
            ServiceError::from(e)
        })
    }

    // ---- clients ----

    #[instrument(skip(self, details), fields(tenant_id = %tenant_id), err)]
    pub fn register_client(&self, tenant_id: TenantId, details: ClientDetails) -> Result<ClientReadModel, ServiceError> {
        self.check_plan(tenant_id, PlanAction::ActivateClient)?;
        self.ensure_email_free(tenant_id, &details.email, None)?;

        let client_id = ClientId::new(AggregateId::new());
        self.execute::<Client>(
            tenant_id,
            client_id.0,
            CLIENT_AGGREGATE,
            "client",
            ClientCommand::RegisterClient(RegisterClient {
                tenant_id,
                client_id,
                details,
                occurred_at: self.now(),
            }),
            |id| Client::empty(ClientId::new(id)),
        )?;

        info!(%client_id, "client registered");
        self.get_client(tenant_id, client_id)
    }

    #[instrument(skip(self, details), fields(tenant_id = %tenant_id, client_id = %client_id), err)]
    pub fn update_client(
        &self,
        tenant_id: TenantId,
        client_id: ClientId,
        details: ClientDetails,
    ) -> Result<ClientReadModel, ServiceError> {
        self.ensure_email_free(tenant_id, &details.email, Some(client_id))?;
        self.execute::<Client>(
            tenant_id,
            client_id.0,
            CLIENT_AGGREGATE,
            "client",
            ClientCommand::UpdateClient(UpdateClient {
                tenant_id,
                client_id,
                details,
                occurred_at: self.now(),
            }),
            |id| Client::empty(ClientId::new(id)),
        )?;
        self.get_client(tenant_id, client_id)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, client_id = %client_id), err)]
    pub fn deactivate_client(&self, tenant_id: TenantId, client_id: ClientId) -> Result<ClientReadModel, ServiceError> {
        self.execute::<Client>(
            tenant_id,
            client_id.0,
            CLIENT_AGGREGATE,
            "client",
            ClientCommand::DeactivateClient(DeactivateClient {
                tenant_id,
                client_id,
                occurred_at: self.now(),
            }),
            |id| Client::empty(ClientId::new(id)),
        )?;
        self.get_client(tenant_id, client_id)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, client_id = %client_id), err)]
    pub fn reactivate_client(&self, tenant_id: TenantId, client_id: ClientId) -> Result<ClientReadModel, ServiceError> {
        let client = self.load_client(tenant_id, client_id)?;
        if client.status() == ClientStatus::Active {
            return self.get_client(tenant_id, client_id);
        }
        self.check_plan(tenant_id, PlanAction::ActivateClient)?;

        self.execute::<Client>(
            tenant_id,
            client_id.0,
            CLIENT_AGGREGATE,
            "client",
            ClientCommand::ReactivateClient(ReactivateClient {
                tenant_id,
                client_id,
                occurred_at: self.now(),
            }),
            |id| Client::empty(ClientId::new(id)),
        )?;
        self.get_client(tenant_id, client_id)
    }

    /// Hard delete when no invoice references the client, otherwise deactivate.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, client_id = %client_id), err)]
    pub fn delete_client(&self, tenant_id: TenantId, client_id: ClientId) -> Result<ClientRemoval, ServiceError> {
        if self.read_models.invoices.references_client(tenant_id, client_id) {
            self.deactivate_client(tenant_id, client_id)?;
            info!("client has invoices, deactivated instead of deleted");
            return Ok(ClientRemoval::Deactivated);
        }

        self.execute::<Client>(
            tenant_id,
            client_id.0,
            CLIENT_AGGREGATE,
            "client",
            ClientCommand::DeleteClient(DeleteClient {
                tenant_id,
                client_id,
                occurred_at: self.now(),
            }),
            |id| Client::empty(ClientId::new(id)),
        )?;
        Ok(ClientRemoval::Deleted)
    }

    pub fn get_client(&self, tenant_id: TenantId, client_id: ClientId) -> Result<ClientReadModel, ServiceError> {
        self.read_models
            .clients
            .get(tenant_id, &client_id)
            .ok_or_else(|| ServiceError::not_found("client", client_id))
    }

    pub fn list_clients(&self, tenant_id: TenantId, status: Option<ClientStatus>) -> Vec<ClientReadModel> {
        self.read_models.clients.list(tenant_id, status)
    }

    fn ensure_email_free(
        &self,
        tenant_id: TenantId,
        email: &str,
        owner: Option<ClientId>,
    ) -> Result<(), ServiceError> {
        match self.read_models.clients.find_by_email(tenant_id, email) {
            Some(existing) if Some(existing.client_id) != owner => Err(ServiceError::Conflict(format!(
                "a client with email '{}' already exists",
                normalize_email(email)
            ))),
            _ => Ok(()),
        }
    }

    // ---- invoices ----

    #[instrument(skip(self, input), fields(tenant_id = %tenant_id, client_id = %input.client_id), err)]
    pub fn create_invoice(&self, tenant_id: TenantId, input: NewInvoice) -> Result<InvoiceReadModel, ServiceError> {
        let now = self.now();
        let issue_date = input.issue_date.unwrap_or_else(|| now.date_naive());

        let client = self.load_client(tenant_id, input.client_id)?;
        if !client.can_be_invoiced() {
            return Err(ServiceError::Validation(format!(
                "client {} is inactive",
                input.client_id
            )));
        }
        self.check_plan(tenant_id, PlanAction::CreateInvoice)?;

        // Reject bad input before a number is reserved.
        if input.due_date < issue_date {
            return Err(ServiceError::Validation("due date cannot be before issue date".to_string()));
        }
        let items = build_line_items(&input.items)?;
        InvoiceTotals::compute(&items, input.tax_rate, input.discount)?;

        let number = self
            .numbers
            .reserve(&self.dispatcher, tenant_id, issue_date, now)
            .map_err(|e| ServiceError::from_dispatch(e, "invoice sequence", tenant_id))?;

        let invoice_id = InvoiceId::new(AggregateId::new());
        self.execute::<Invoice>(
            tenant_id,
            invoice_id.0,
            INVOICE_AGGREGATE,
            "invoice",
            InvoiceCommand::CreateInvoice(CreateInvoice {
                tenant_id,
                invoice_id,
                client_id: input.client_id,
                number,
                issue_date,
                due_date: input.due_date,
                items: input.items,
                tax_rate: input.tax_rate,
                discount: input.discount,
                notes: input.notes,
                terms: input.terms,
                initial_status: input.initial_status,
                occurred_at: now,
            }),
            |id| Invoice::empty(InvoiceId::new(id)),
        )?;

        info!(%invoice_id, %number, "invoice created");
        self.invoice_view(tenant_id, invoice_id)
    }

    #[instrument(skip(self, items), fields(tenant_id = %tenant_id, invoice_id = %invoice_id), err)]
    pub fn replace_invoice_items(
        &self,
        tenant_id: TenantId,
        invoice_id: InvoiceId,
        items: Vec<LineItemDraft>,
    ) -> Result<InvoiceReadModel, ServiceError> {
        self.execute::<Invoice>(
            tenant_id,
            invoice_id.0,
            INVOICE_AGGREGATE,
            "invoice",
            InvoiceCommand::ReplaceItems(ReplaceItems {
                tenant_id,
                invoice_id,
                items,
                occurred_at: self.now(),
            }),
            |id| Invoice::empty(InvoiceId::new(id)),
        )?;
        self.invoice_view(tenant_id, invoice_id)
    }

    #[instrument(skip(self, patch), fields(tenant_id = %tenant_id, invoice_id = %invoice_id), err)]
    pub fn update_invoice_details(
        &self,
        tenant_id: TenantId,
        invoice_id: InvoiceId,
        patch: InvoiceDetailsPatch,
    ) -> Result<InvoiceReadModel, ServiceError> {
        let mut cmd = UpdateInvoiceDetails::new(tenant_id, invoice_id, self.now());
        cmd.due_date = patch.due_date;
        cmd.tax_rate = patch.tax_rate;
        cmd.discount = patch.discount;
        cmd.notes = patch.notes;
        cmd.terms = patch.terms;

        self.execute::<Invoice>(
            tenant_id,
            invoice_id.0,
            INVOICE_AGGREGATE,
            "invoice",
            InvoiceCommand::UpdateInvoiceDetails(cmd),
            |id| Invoice::empty(InvoiceId::new(id)),
        )?;
        self.invoice_view(tenant_id, invoice_id)
    }

    /// Render, email, then record the send. Draft invoices become pending.
    #[instrument(skip(self, issuer), fields(tenant_id = %tenant_id, invoice_id = %invoice_id), err)]
    pub fn send_invoice(
        &self,
        tenant_id: TenantId,
        invoice_id: InvoiceId,
        issuer: &IssuerProfile,
    ) -> Result<InvoiceReadModel, ServiceError> {
        self.check_plan(tenant_id, PlanAction::SendInvoice)?;
        let (invoice, recipient) = self.invoice_and_recipient(tenant_id, invoice_id)?;

        let command = InvoiceCommand::SendInvoice(SendInvoice {
            tenant_id,
            invoice_id,
            recipient: recipient.clone(),
            occurred_at: self.now(),
        });
        invoice.handle(&command)?;

        let view = self.invoice_view(tenant_id, invoice_id)?;
        let subject = format!("Invoice {} from {}", view.number, issuer.name);
        self.deliver(&view, issuer, recipient, subject, EmailKind::Invoice)?;

        self.execute::<Invoice>(
            tenant_id,
            invoice_id.0,
            INVOICE_AGGREGATE,
            "invoice",
            command,
            |id| Invoice::empty(InvoiceId::new(id)),
        )?;
        info!("invoice sent");
        self.invoice_view(tenant_id, invoice_id)
    }

    /// Email a reminder for a pending or overdue invoice.
    #[instrument(skip(self, issuer), fields(tenant_id = %tenant_id, invoice_id = %invoice_id), err)]
    pub fn remind_invoice(
        &self,
        tenant_id: TenantId,
        invoice_id: InvoiceId,
        issuer: &IssuerProfile,
    ) -> Result<InvoiceReadModel, ServiceError> {
        self.check_plan(tenant_id, PlanAction::RemindInvoice)?;
        let (invoice, recipient) = self.invoice_and_recipient(tenant_id, invoice_id)?;

        let command = InvoiceCommand::RemindInvoice(RemindInvoice {
            tenant_id,
            invoice_id,
            recipient: recipient.clone(),
            occurred_at: self.now(),
        });
        invoice.handle(&command)?;

        let view = self.invoice_view(tenant_id, invoice_id)?;
        let subject = format!("Reminder: invoice {} is due {}", view.number, view.due_date);
        self.deliver(&view, issuer, recipient, subject, EmailKind::Reminder)?;

        self.execute::<Invoice>(
            tenant_id,
            invoice_id.0,
            INVOICE_AGGREGATE,
            "invoice",
            command,
            |id| Invoice::empty(InvoiceId::new(id)),
        )?;
        info!("reminder sent");
        self.invoice_view(tenant_id, invoice_id)
    }

    fn invoice_and_recipient(&self, tenant_id: TenantId, invoice_id: InvoiceId) -> Result<(Invoice, String), ServiceError> {
        let invoice = self.load_invoice(tenant_id, invoice_id)?;
        let client_id = invoice
            .client_id()
            .ok_or_else(|| ServiceError::Internal(format!("invoice {invoice_id} has no client")))?;
        let client = self.load_client(tenant_id, client_id)?;
        Ok((invoice, client.details().email.clone()))
    }

    fn deliver(
        &self,
        view: &InvoiceReadModel,
        issuer: &IssuerProfile,
        to: String,
        subject: String,
        kind: EmailKind,
    ) -> Result<(), ServiceError> {
        let document = self.collaborators.renderer.render(view, issuer).map_err(|e| {
            warn!(error = %e, "document rendering failed");
            ServiceError::from(e)
        })?;

        let email = InvoiceEmail {
            to,
            reply_to: (!issuer.email.is_empty()).then(|| issuer.email.clone()),
            subject,
            kind,
            invoice_number: view.number,
            attachment: Some(document),
        };
        self.collaborators.notifier.deliver(&email).map_err(|e| {
            warn!(error = %e, "email delivery failed");
            ServiceError::from(e)
        })
    }

    /// Settle a pending or overdue invoice. Repeating a payment with the same
    /// external reference changes nothing.
    #[instrument(skip(self, payment), fields(tenant_id = %tenant_id, invoice_id = %invoice_id), err)]
    pub fn mark_invoice_paid(
        &self,
        tenant_id: TenantId,
        invoice_id: InvoiceId,
        payment: PaymentInput,
    ) -> Result<InvoiceReadModel, ServiceError> {
        let committed = self.execute::<Invoice>(
            tenant_id,
            invoice_id.0,
            INVOICE_AGGREGATE,
            "invoice",
            InvoiceCommand::MarkInvoicePaid(MarkInvoicePaid {
                tenant_id,
                invoice_id,
                amount: payment.amount,
                method: payment.method,
                external_ref: payment.external_ref,
                occurred_at: self.now(),
            }),
            |id| Invoice::empty(InvoiceId::new(id)),
        )?;
        if !committed.is_empty() {
            info!("invoice paid");
        }
        self.invoice_view(tenant_id, invoice_id)
    }

    #[instrument(skip(self, reason), fields(tenant_id = %tenant_id, invoice_id = %invoice_id), err)]
    pub fn cancel_invoice(
        &self,
        tenant_id: TenantId,
        invoice_id: InvoiceId,
        reason: Option<String>,
    ) -> Result<InvoiceReadModel, ServiceError> {
        self.execute::<Invoice>(
            tenant_id,
            invoice_id.0,
            INVOICE_AGGREGATE,
            "invoice",
            InvoiceCommand::CancelInvoice(CancelInvoice {
                tenant_id,
                invoice_id,
                reason,
                occurred_at: self.now(),
            }),
            |id| Invoice::empty(InvoiceId::new(id)),
        )?;
        info!("invoice cancelled");
        self.invoice_view(tenant_id, invoice_id)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, invoice_id = %invoice_id), err)]
    pub fn delete_invoice(&self, tenant_id: TenantId, invoice_id: InvoiceId) -> Result<(), ServiceError> {
        self.execute::<Invoice>(
            tenant_id,
            invoice_id.0,
            INVOICE_AGGREGATE,
            "invoice",
            InvoiceCommand::DeleteInvoice(DeleteInvoice {
                tenant_id,
                invoice_id,
                occurred_at: self.now(),
            }),
            |id| Invoice::empty(InvoiceId::new(id)),
        )?;
        info!("invoice deleted");
        Ok(())
    }

    /// Persist `pending → overdue` for every invoice past its due date.
    ///
    /// Invoices settled or cancelled between the read and the write are skipped.
    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    pub fn sweep_overdue(&self, tenant_id: TenantId) -> Result<Vec<InvoiceId>, ServiceError> {
        let now = self.now();
        let today = now.date_naive();
        let mut marked = Vec::new();

        for invoice_id in self.read_models.invoices.overdue_candidates(tenant_id, today) {
            let result = self.execute::<Invoice>(
                tenant_id,
                invoice_id.0,
                INVOICE_AGGREGATE,
                "invoice",
                InvoiceCommand::MarkInvoiceOverdue(MarkInvoiceOverdue {
                    tenant_id,
                    invoice_id,
                    as_of: today,
                    occurred_at: now,
                }),
                |id| Invoice::empty(InvoiceId::new(id)),
            );
            match result {
                Ok(committed) if !committed.is_empty() => marked.push(invoice_id),
                Ok(_) => {}
                Err(ServiceError::InvalidStateTransition { .. } | ServiceError::Validation(_)) => {
                    debug!(%invoice_id, "invoice changed before the overdue sweep reached it");
                }
                Err(other) => return Err(other),
            }
        }

        if !marked.is_empty() {
            info!(count = marked.len(), "invoices marked overdue");
        }
        Ok(marked)
    }

    pub fn get_invoice(&self, tenant_id: TenantId, invoice_id: InvoiceId) -> Result<InvoiceReadModel, ServiceError> {
        self.invoice_view(tenant_id, invoice_id)
    }

    pub fn list_invoices(&self, tenant_id: TenantId, filter: &InvoiceFilter) -> Vec<InvoiceReadModel> {
        self.read_models
            .invoices
            .list(tenant_id, filter, self.now().date_naive())
    }

    pub fn get_invoice_stats(&self, tenant_id: TenantId) -> InvoiceStats {
        self.read_models.invoices.stats(tenant_id, self.now())
    }

    // ---- plan & subscription ----

    /// Tier in force now (expired paid periods read as free).
    pub fn current_plan(&self, tenant_id: TenantId) -> Result<PlanTier, ServiceError> {
        Ok(self.load_account(tenant_id)?.effective_plan(self.now()))
    }

    pub fn billing_account(&self, tenant_id: TenantId) -> Option<BillingAccountReadModel> {
        self.read_models.billing.get(tenant_id)
    }

    /// Open a processor checkout for a paid tier and link the processor customer.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, tier = %tier), err)]
    pub fn start_checkout(&self, tenant_id: TenantId, tier: PlanTier) -> Result<CheckoutStarted, ServiceError> {
        if !tier.is_paid() {
            return Err(ServiceError::Validation(format!("cannot check out the {tier} plan")));
        }
        let price_id = self
            .config
            .prices
            .price_for_tier(tier)
            .ok_or_else(|| ServiceError::Validation(format!("no processor price configured for the {tier} plan")))?
            .to_string();

        let account = self.load_account(tenant_id)?;
        let started = self
            .collaborators
            .processor
            .create_checkout(&CheckoutRequest {
                tenant_id,
                tier,
                price_id,
                customer_id: account.customer_id().map(str::to_string),
            })
            .map_err(|e| {
                warn!(error = %e, "checkout could not be started");
                ServiceError::from(e)
            })?;

        self.execute::<BillingAccount>(
            tenant_id,
            BillingAccount::stream_id(tenant_id),
            BILLING_AGGREGATE,
            "billing account",
            BillingCommand::LinkCustomer(LinkCustomer {
                tenant_id,
                customer_id: started.customer_id.clone(),
                occurred_at: self.now(),
            }),
            BillingAccount::empty,
        )?;
        Ok(started)
    }

    /// Ask the processor to cancel the linked subscription. The plan changes
    /// once the processor reports the cancellation.
    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    pub fn cancel_subscription(&self, tenant_id: TenantId, at_period_end: bool) -> Result<(), ServiceError> {
        let account = self.load_account(tenant_id)?;
        let subscription_id = account
            .subscription_id()
            .ok_or_else(|| ServiceError::not_found("subscription", tenant_id))?
            .to_string();

        self.collaborators
            .processor
            .cancel_subscription(&subscription_id, at_period_end)
            .map_err(|e| {
                warn!(error = %e, "subscription cancellation failed");
                ServiceError::from(e)
            })?;

        self.execute::<BillingAccount>(
            tenant_id,
            BillingAccount::stream_id(tenant_id),
            BILLING_AGGREGATE,
            "billing account",
            BillingCommand::ScheduleCancellation(ScheduleCancellation {
                tenant_id,
                at_period_end,
                occurred_at: self.now(),
            }),
            BillingAccount::empty,
        )?;
        info!(%subscription_id, at_period_end, "subscription cancellation requested");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    use tally_invoicing::InvoiceStatus;

    use crate::services::ErrorKind;
    use crate::services::fixtures::{Harness, issuer, item, money, test_now};

    #[test]
    fn client_emails_are_unique_per_tenant_ignoring_case() {
        let h = Harness::new();
        let acme = h.client("Acme", "billing@acme.test");

        let err = h
            .service
            .register_client(
                h.tenant_id,
                ClientDetails {
                    name: "Acme again".to_string(),
                    email: " Billing@ACME.test ".to_string(),
                    ..ClientDetails::default()
                },
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let updated = h
            .service
            .update_client(
                h.tenant_id,
                acme.client_id,
                ClientDetails {
                    name: "Acme Corp".to_string(),
                    email: "BILLING@acme.test".to_string(),
                    ..ClientDetails::default()
                },
            )
            .unwrap();
        assert_eq!(updated.details.name, "Acme Corp");

        // Another tenant may reuse the address.
        let other = Harness::new();
        other.client("Acme", "billing@acme.test");
    }

    #[test]
    fn free_tier_caps_active_clients() {
        let h = Harness::new();
        let first = h.client("One", "one@clients.test");
        h.client("Two", "two@clients.test");

        let err = h
            .service
            .register_client(
                h.tenant_id,
                ClientDetails {
                    name: "Three".to_string(),
                    email: "three@clients.test".to_string(),
                    ..ClientDetails::default()
                },
            )
            .unwrap_err();
        assert_eq!(err.code(), "PLAN_LIMIT");

        h.service.deactivate_client(h.tenant_id, first.client_id).unwrap();
        h.client("Three", "three@clients.test");

        let err = h.service.reactivate_client(h.tenant_id, first.client_id).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EntitlementExceeded);
        assert_eq!(
            h.service.list_clients(h.tenant_id, Some(ClientStatus::Active)).len(),
            2
        );
    }

    #[test]
    fn referenced_clients_are_deactivated_instead_of_deleted() {
        let h = Harness::new();
        let billed = h.client("Billed", "billed@clients.test");
        let idle = h.client("Idle", "idle@clients.test");
        h.pending_invoice(billed.client_id);

        assert_eq!(
            h.service.delete_client(h.tenant_id, billed.client_id).unwrap(),
            ClientRemoval::Deactivated
        );
        assert_eq!(
            h.service.get_client(h.tenant_id, billed.client_id).unwrap().status,
            ClientStatus::Inactive
        );

        assert_eq!(
            h.service.delete_client(h.tenant_id, idle.client_id).unwrap(),
            ClientRemoval::Deleted
        );
        let err = h.service.get_client(h.tenant_id, idle.client_id).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn invoices_require_an_active_client_of_the_tenant() {
        let h = Harness::new();
        let client = h.client("Acme", "billing@acme.test");

        let stranger = ClientId::new(AggregateId::new());
        let err = h
            .service
            .create_invoice(h.tenant_id, h.new_invoice(stranger, vec![item("Work", 1, 1_000)]))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let other_tenant = Harness::new();
        let err = other_tenant
            .service
            .create_invoice(other_tenant.tenant_id, h.new_invoice(client.client_id, vec![item("Work", 1, 1_000)]))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        h.service.deactivate_client(h.tenant_id, client.client_id).unwrap();
        let err = h
            .service
            .create_invoice(h.tenant_id, h.new_invoice(client.client_id, vec![item("Work", 1, 1_000)]))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationFailure);
    }

    #[test]
    fn rejected_input_does_not_consume_a_number() {
        let h = Harness::new();
        let client = h.client("Acme", "billing@acme.test");

        let mut bad_dates = h.new_invoice(client.client_id, vec![item("Work", 1, 1_000)]);
        bad_dates.due_date = test_now().date_naive() - Duration::days(1);
        assert_eq!(
            h.service.create_invoice(h.tenant_id, bad_dates).unwrap_err().kind(),
            ErrorKind::ValidationFailure
        );

        let mut over_discounted = h.new_invoice(client.client_id, vec![item("Work", 1, 1_000)]);
        over_discounted.discount = money(1_001);
        assert_eq!(
            h.service.create_invoice(h.tenant_id, over_discounted).unwrap_err().kind(),
            ErrorKind::ValidationFailure
        );

        let created = h
            .service
            .create_invoice(h.tenant_id, h.new_invoice(client.client_id, vec![item("Work", 1, 1_000)]))
            .unwrap();
        assert_eq!(created.number.to_string(), "INV-2026-0001");
        assert_eq!(created.status, InvoiceStatus::Draft);
    }

    #[test]
    fn sending_is_a_paid_plan_feature() {
        let h = Harness::new();
        let client = h.client("Acme", "billing@acme.test");
        let draft = h
            .service
            .create_invoice(h.tenant_id, h.new_invoice(client.client_id, vec![item("Work", 3, 2_000)]))
            .unwrap();

        let err = h.service.send_invoice(h.tenant_id, draft.invoice_id, &issuer()).unwrap_err();
        assert!(matches!(
            err,
            ServiceError::EntitlementExceeded { ref plan, upgrade_to: Some(ref to), .. } if plan == "free" && to == "pro"
        ));
        assert!(h.notifier.sent().is_empty());

        h.upgrade(PlanTier::Pro);
        let sent = h.service.send_invoice(h.tenant_id, draft.invoice_id, &issuer()).unwrap();
        assert_eq!(sent.status, InvoiceStatus::Pending);
        assert!(sent.sent_at.is_some());

        let outbox = h.notifier.sent();
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].to, "billing@acme.test");
        assert_eq!(outbox[0].kind, EmailKind::Invoice);
        assert_eq!(outbox[0].reply_to.as_deref(), Some("accounts@northwind.test"));
        assert!(outbox[0].attachment.as_ref().is_some_and(|doc| !doc.is_empty()));
    }

    #[test]
    fn reminders_count_and_reject_unsent_invoices() {
        let h = Harness::new();
        h.upgrade(PlanTier::Business);
        let client = h.client("Acme", "billing@acme.test");
        let draft = h
            .service
            .create_invoice(h.tenant_id, h.new_invoice(client.client_id, vec![item("Work", 1, 9_900)]))
            .unwrap();

        let err = h.service.remind_invoice(h.tenant_id, draft.invoice_id, &issuer()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidStateTransition);

        h.service.send_invoice(h.tenant_id, draft.invoice_id, &issuer()).unwrap();
        h.service.remind_invoice(h.tenant_id, draft.invoice_id, &issuer()).unwrap();
        let reminded = h.service.remind_invoice(h.tenant_id, draft.invoice_id, &issuer()).unwrap();
        assert_eq!(reminded.reminder_count, 2);
        assert_eq!(reminded.reminder_sent_at, Some(test_now()));

        let kinds: Vec<EmailKind> = h.notifier.sent().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EmailKind::Invoice, EmailKind::Reminder, EmailKind::Reminder]);
    }

    #[test]
    fn overdue_is_derived_on_read_and_persisted_by_the_sweep() {
        let h = Harness::new();
        let client = h.client("Acme", "billing@acme.test");
        let invoice = h.pending_invoice(client.client_id);

        assert!(h.service.sweep_overdue(h.tenant_id).unwrap().is_empty());

        // Due date itself is not overdue.
        h.clock.set(test_now() + Duration::days(14));
        assert_eq!(
            h.service.get_invoice(h.tenant_id, invoice.invoice_id).unwrap().status,
            InvoiceStatus::Pending
        );

        h.clock.set(test_now() + Duration::days(15));
        assert_eq!(
            h.service.get_invoice(h.tenant_id, invoice.invoice_id).unwrap().status,
            InvoiceStatus::Overdue
        );
        let overdue_filter = InvoiceFilter {
            status: Some(InvoiceStatus::Overdue),
            client_id: None,
        };
        assert_eq!(h.service.list_invoices(h.tenant_id, &overdue_filter).len(), 1);

        assert_eq!(h.service.sweep_overdue(h.tenant_id).unwrap(), vec![invoice.invoice_id]);
        assert!(h.service.sweep_overdue(h.tenant_id).unwrap().is_empty());

        let stats = h.service.get_invoice_stats(h.tenant_id);
        assert_eq!(stats.overdue, 1);
        assert_eq!(stats.overdue_amount, money(13_250));
        assert_eq!(stats.outstanding_amount, money(13_250));
    }

    #[test]
    fn details_update_recomputes_totals_until_paid() {
        let h = Harness::new();
        let client = h.client("Acme", "billing@acme.test");
        let invoice = h.pending_invoice(client.client_id);

        let updated = h
            .service
            .update_invoice_details(
                h.tenant_id,
                invoice.invoice_id,
                InvoiceDetailsPatch {
                    tax_rate: Some(TaxRate::ZERO),
                    discount: Some(Money::ZERO),
                    notes: Some("Thanks!".to_string()),
                    ..InvoiceDetailsPatch::default()
                },
            )
            .unwrap();
        assert_eq!(updated.totals.total, money(12_500));
        assert_eq!(updated.notes.as_deref(), Some("Thanks!"));

        h.service
            .mark_invoice_paid(
                h.tenant_id,
                invoice.invoice_id,
                PaymentInput {
                    amount: money(12_500),
                    method: PaymentMethod::BankTransfer,
                    external_ref: None,
                },
            )
            .unwrap();

        let err = h
            .service
            .replace_invoice_items(h.tenant_id, invoice.invoice_id, vec![item("More", 1, 100)])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvoiceImmutable);
        let err = h.service.delete_invoice(h.tenant_id, invoice.invoice_id).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvoiceImmutable);
    }

    #[test]
    fn checkout_links_the_processor_customer() {
        let h = Harness::new();

        let err = h.service.start_checkout(h.tenant_id, PlanTier::Free).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationFailure);

        let started = h.service.start_checkout(h.tenant_id, PlanTier::Pro).unwrap();
        assert!(started.customer_id.starts_with("cus_"));
        let account = h.service.billing_account(h.tenant_id).unwrap();
        assert_eq!(account.customer_id.as_deref(), Some(started.customer_id.as_str()));
        assert_eq!(
            h.service.read_models().billing.tenant_for_customer(&started.customer_id),
            Some(h.tenant_id)
        );

        let err = h.service.cancel_subscription(h.tenant_id, true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        h.upgrade(PlanTier::Pro);
        h.service.cancel_subscription(h.tenant_id, true).unwrap();
        assert_eq!(h.processor.cancellations(), vec![("sub_test".to_string(), true)]);
        // The processor decides when the plan ends.
        assert_eq!(h.service.current_plan(h.tenant_id).unwrap(), PlanTier::Pro);
    }
}
