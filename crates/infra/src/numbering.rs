//! Per-tenant invoice number allocation.
//!
//! Each `(tenant, year)` has an `invoicing.sequence` stream. Reserving a number
//! appends one `NumberReserved` event with `ExpectedVersion::Exact`, so two
//! concurrent reservations cannot both commit the same ordinal: the loser gets a
//! concurrency error, reloads and takes the next one. A reserved number whose
//! invoice is never created leaves a gap.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde_json::Value as JsonValue;
use tracing::debug;

use tally_core::TenantId;
use tally_events::{EventBus, EventEnvelope};
use tally_invoicing::{InvoiceNumber, InvoiceSequence, ReserveNumber, SequenceCommand, SequenceEvent};

use crate::command_dispatcher::{CommandDispatcher, DispatchError};
use crate::event_store::EventStore;

pub const SEQUENCE_AGGREGATE: &str = "invoicing.sequence";

/// Run `op` up to `attempts` times while it fails with a concurrency error.
///
/// Every other outcome is returned as is. When the budget is spent the last
/// concurrency error is returned.
pub fn retry_on_conflict<T>(
    attempts: u32,
    mut op: impl FnMut() -> Result<T, DispatchError>,
) -> Result<T, DispatchError> {
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op() {
            Err(err) if err.is_concurrency() && attempt < attempts => {
                debug!(attempt, error = %err, "retrying after concurrency conflict");
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct NumberAllocator {
    attempts: u32,
}

impl NumberAllocator {
    pub fn new(attempts: u32) -> Self {
        Self { attempts }
    }

    /// Reserve the next number of the issue date's year.
    pub fn reserve<S, B>(
        &self,
        dispatcher: &CommandDispatcher<S, B>,
        tenant_id: TenantId,
        issue_date: NaiveDate,
        occurred_at: DateTime<Utc>,
    ) -> Result<InvoiceNumber, DispatchError>
    where
        S: EventStore,
        B: EventBus<EventEnvelope<JsonValue>>,
    {
        let year = issue_date.year();
        let stream_id = InvoiceSequence::stream_id(tenant_id, year);

        let committed = retry_on_conflict(self.attempts, || {
            dispatcher.dispatch::<InvoiceSequence>(
                tenant_id,
                stream_id,
                SEQUENCE_AGGREGATE,
                SequenceCommand::ReserveNumber(ReserveNumber {
                    tenant_id,
                    year,
                    occurred_at,
                }),
                |_, id| InvoiceSequence::empty(id),
            )
        })?;

        let reserved = committed
            .first()
            .ok_or_else(|| DispatchError::InvariantViolation("number reservation produced no event".to_string()))?;
        let SequenceEvent::NumberReserved(event) = reserved.decode::<SequenceEvent>()?;
        Ok(event.number()?)
    }
}
