//! Shared wiring for service tests: in-memory store and bus, pinned clock,
//! capturing notifier and a price book with one price per paid tier.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::{Value as JsonValue, json};

use tally_billing::{PlanTier, PriceBook, ProcessorEvent};
use tally_clients::{ClientDetails, ClientId};
use tally_core::{Money, Quantity, TaxRate, TenantId};
use tally_events::{EventEnvelope, InMemoryEventBus};
use tally_invoicing::{InitialStatus, LineItemDraft};

use super::invoicing::{Collaborators, InvoicingService, NewInvoice};
use super::reconciliation::ReconciliationService;
use crate::command_dispatcher::CommandDispatcher;
use crate::config::TallyConfig;
use crate::event_store::InMemoryEventStore;
use crate::external::{FixedClock, InMemoryNotifier, InMemoryPaymentProcessor, IssuerProfile, PlainTextRenderer};
use crate::projections::{ClientReadModel, InvoiceReadModel, ReadModels};

pub(crate) type TestBus = Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>;
pub(crate) type TestService = InvoicingService<InMemoryEventStore, TestBus>;

pub(crate) struct Harness {
    pub service: Arc<TestService>,
    pub reconciler: ReconciliationService<InMemoryEventStore, TestBus>,
    pub notifier: Arc<InMemoryNotifier>,
    pub processor: Arc<InMemoryPaymentProcessor>,
    pub clock: Arc<FixedClock>,
    pub tenant_id: TenantId,
}

/// Mid-month so "this month" windows are unambiguous.
pub(crate) fn test_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 14, 9, 30, 0).unwrap()
}

pub(crate) fn money(minor: u64) -> Money {
    Money::from_minor(minor).unwrap()
}

pub(crate) fn item(description: &str, qty: u32, price_minor: u64) -> LineItemDraft {
    LineItemDraft::new(description, Quantity::whole(qty).unwrap(), money(price_minor))
}

pub(crate) fn issuer() -> IssuerProfile {
    IssuerProfile {
        name: "Northwind Studio".to_string(),
        email: "accounts@northwind.test".to_string(),
        company: Some("Northwind Studio Ltd".to_string()),
        address: None,
    }
}

impl Harness {
    pub fn new() -> Self {
        let config = TallyConfig {
            prices: PriceBook {
                pro_price_id: Some("price_pro".to_string()),
                business_price_id: Some("price_business".to_string()),
            },
            ..TallyConfig::default()
        };
        Self::with_config(config)
    }

    pub fn with_config(config: TallyConfig) -> Self {
        tally_observability::init_for_tests();
        let notifier = Arc::new(InMemoryNotifier::new());
        let processor = Arc::new(InMemoryPaymentProcessor::new());
        let clock = Arc::new(FixedClock::new(test_now()));

        let dispatcher = Arc::new(CommandDispatcher::new(
            InMemoryEventStore::new(),
            Arc::new(InMemoryEventBus::new()),
        ));
        let collaborators = Collaborators {
            renderer: Arc::new(PlainTextRenderer),
            notifier: notifier.clone(),
            processor: processor.clone(),
            clock: clock.clone(),
        };
        let service = Arc::new(InvoicingService::new(
            dispatcher,
            Arc::new(ReadModels::in_memory()),
            config,
            collaborators,
        ));

        Self {
            reconciler: ReconciliationService::new(Arc::clone(&service)),
            service,
            notifier,
            processor,
            clock,
            tenant_id: TenantId::new(),
        }
    }

    pub fn client(&self, name: &str, email: &str) -> ClientReadModel {
        self.service
            .register_client(
                self.tenant_id,
                ClientDetails {
                    name: name.to_string(),
                    email: email.to_string(),
                    ..ClientDetails::default()
                },
            )
            .unwrap()
    }

    pub fn new_invoice(&self, client_id: ClientId, items: Vec<LineItemDraft>) -> NewInvoice {
        let today = test_now().date_naive();
        NewInvoice {
            client_id,
            issue_date: Some(today),
            due_date: today + Duration::days(14),
            items,
            tax_rate: TaxRate::ZERO,
            discount: Money::ZERO,
            notes: None,
            terms: None,
            initial_status: InitialStatus::Draft,
        }
    }

    /// 2 × 50.00 + 1 × 25.00 at 10% tax with a 5.00 discount (total 132.50), pending.
    pub fn pending_invoice(&self, client_id: ClientId) -> InvoiceReadModel {
        let mut input = self.new_invoice(client_id, vec![item("Design", 2, 5_000), item("Hosting", 1, 2_500)]);
        input.tax_rate = TaxRate::from_percent(10).unwrap();
        input.discount = money(500);
        input.initial_status = InitialStatus::Pending;
        self.service.create_invoice(self.tenant_id, input).unwrap()
    }

    /// Move the tenant to a paid tier through a processor checkout.
    pub fn upgrade(&self, tier: PlanTier) {
        let checkout = ProcessorEvent::from_value(json!({
            "id": format!("evt_checkout_{tier}"),
            "type": "checkout.session.completed",
            "data": { "object": {
                "id": "cs_test",
                "customer": "cus_test",
                "subscription": "sub_test",
                "metadata": { "tenant_id": self.tenant_id.to_string(), "plan": tier.to_string() }
            }}
        }))
        .unwrap();
        self.reconciler.reconcile(&checkout).unwrap();
        assert_eq!(self.service.current_plan(self.tenant_id).unwrap(), tier);
    }
}
