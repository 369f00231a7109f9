//! Value object trait: equality by value, not identity.

/// Marker trait for value objects.
///
/// Value objects have no identity and are immutable: `Money`, `Quantity` and
/// `TaxRate` are compared by their attribute values and replaced, never mutated.
/// Line items are *not* value objects; they are owned by their invoice and
/// ordered by position.
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
