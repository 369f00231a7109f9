//! Per-tenant invoice numbering.
//!
//! Each `(tenant, year)` owns one `InvoiceSequence` stream. Reserving a number
//! appends a `NumberReserved` event with the stream's expected version, so two
//! concurrent reservations cannot both commit the same ordinal: the loser gets a
//! concurrency conflict and retries against the new stream head. Ordinals whose
//! invoice creation later fails are never reused (gaps are tolerated).

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tally_core::{Aggregate, AggregateId, AggregateRoot, DomainError, TenantId};
use tally_events::Event;

/// Human-readable invoice number: `INV-<year>-<ordinal, zero-padded to 4>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InvoiceNumber {
    year: i32,
    ordinal: u32,
}

impl InvoiceNumber {
    pub fn new(year: i32, ordinal: u32) -> Result<Self, DomainError> {
        if !(1..=9999).contains(&year) {
            return Err(DomainError::validation(format!("invalid invoice year {year}")));
        }
        if ordinal == 0 {
            return Err(DomainError::validation("invoice ordinal must start at 1"));
        }
        Ok(Self { year, ordinal })
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn ordinal(&self) -> u32 {
        self.ordinal
    }
}

impl fmt::Display for InvoiceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "INV-{}-{:04}", self.year, self.ordinal)
    }
}

impl FromStr for InvoiceNumber {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || DomainError::validation(format!("invalid invoice number '{s}'"));

        let rest = s.strip_prefix("INV-").ok_or_else(invalid)?;
        let (year, ordinal) = rest.split_once('-').ok_or_else(invalid)?;
        if year.len() != 4 || ordinal.len() < 4 {
            return Err(invalid());
        }
        let year: i32 = year.parse().map_err(|_| invalid())?;
        let ordinal: u32 = ordinal.parse().map_err(|_| invalid())?;
        InvoiceNumber::new(year, ordinal)
    }
}

/// Aggregate root: the numbering sequence of one tenant for one issue year.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceSequence {
    id: AggregateId,
    tenant_id: Option<TenantId>,
    year: i32,
    last_ordinal: u32,
    version: u64,
}

impl InvoiceSequence {
    /// Deterministic stream id for `(tenant, year)`.
    pub fn stream_id(tenant_id: TenantId, year: i32) -> AggregateId {
        AggregateId::singleton(tenant_id, &format!("invoicing.sequence.{year}"))
    }

    pub fn empty(id: AggregateId) -> Self {
        Self {
            id,
            tenant_id: None,
            year: 0,
            last_ordinal: 0,
            version: 0,
        }
    }

    pub fn last_ordinal(&self) -> u32 {
        self.last_ordinal
    }

    pub fn year(&self) -> i32 {
        self.year
    }
}

impl AggregateRoot for InvoiceSequence {
    type Id = AggregateId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveNumber {
    pub tenant_id: TenantId,
    pub year: i32,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SequenceCommand {
    ReserveNumber(ReserveNumber),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumberReserved {
    pub tenant_id: TenantId,
    pub year: i32,
    pub ordinal: u32,
    pub occurred_at: DateTime<Utc>,
}

impl NumberReserved {
    pub fn number(&self) -> Result<InvoiceNumber, DomainError> {
        InvoiceNumber::new(self.year, self.ordinal)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SequenceEvent {
    NumberReserved(NumberReserved),
}

impl Event for SequenceEvent {
    fn event_type(&self) -> &'static str {
        match self {
            SequenceEvent::NumberReserved(_) => "invoicing.sequence.number_reserved",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            SequenceEvent::NumberReserved(e) => e.occurred_at,
        }
    }
}

impl Aggregate for InvoiceSequence {
    type Command = SequenceCommand;
    type Event = SequenceEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            SequenceEvent::NumberReserved(e) => {
                self.tenant_id = Some(e.tenant_id);
                self.year = e.year;
                self.last_ordinal = e.ordinal;
            }
        }
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            SequenceCommand::ReserveNumber(cmd) => {
                if self.tenant_id.is_some_and(|t| t != cmd.tenant_id) {
                    return Err(DomainError::invariant("tenant mismatch"));
                }
                if self.version > 0 && self.year != cmd.year {
                    return Err(DomainError::invariant("sequence year mismatch"));
                }

                let ordinal = self
                    .last_ordinal
                    .checked_add(1)
                    .ok_or_else(|| DomainError::invariant("invoice sequence exhausted"))?;

                Ok(vec![SequenceEvent::NumberReserved(NumberReserved {
                    tenant_id: cmd.tenant_id,
                    year: cmd.year,
                    ordinal,
                    occurred_at: cmd.occurred_at,
                })])
            }
        }
    }
}
