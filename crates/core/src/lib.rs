//! `tally-core`: domain foundation building blocks.
//!
//! Pure domain primitives shared by the invoicing and billing crates: aggregate
//! traits, the domain error model, typed identifiers and fixed-point money.

pub mod aggregate;
pub mod error;
pub mod id;
pub mod money;
pub mod value_object;

pub use aggregate::{Aggregate, AggregateRoot, ExpectedVersion};
pub use error::{DomainError, DomainResult};
pub use id::{AggregateId, TenantId};
pub use money::{Money, Quantity, TaxRate};
pub use value_object::ValueObject;
