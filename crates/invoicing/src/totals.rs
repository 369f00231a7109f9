//! Line items and derived invoice totals.

use serde::{Deserialize, Serialize};

use tally_core::{DomainError, DomainResult, Money, Quantity, TaxRate};

/// Caller-supplied line item, before positions and amounts are assigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItemDraft {
    pub description: String,
    pub quantity: Quantity,
    pub unit_price: Money,
}

impl LineItemDraft {
    pub fn new(description: impl Into<String>, quantity: Quantity, unit_price: Money) -> Self {
        Self {
            description: description.into(),
            quantity,
            unit_price,
        }
    }
}

/// A line item owned by an invoice.
///
/// `position` is 1-based and defines display/print order. `amount` is the
/// quantity × unit price rounded for display; totals are computed from the exact
/// products, not from these rounded amounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub position: u32,
    pub description: String,
    pub quantity: Quantity,
    pub unit_price: Money,
    pub amount: Money,
}

impl LineItem {
    /// Exact extension in hundredths of a minor unit.
    pub fn exact_amount(&self) -> u128 {
        self.quantity.extend(self.unit_price)
    }
}

/// Validate drafts and assign positions in the given order.
pub fn build_line_items(drafts: &[LineItemDraft]) -> DomainResult<Vec<LineItem>> {
    drafts
        .iter()
        .enumerate()
        .map(|(idx, draft)| {
            let description = draft.description.trim();
            if description.is_empty() {
                return Err(DomainError::validation(format!(
                    "line item {} description cannot be empty",
                    idx + 1
                )));
            }
            let position = u32::try_from(idx + 1)
                .map_err(|_| DomainError::validation("too many line items"))?;

            Ok(LineItem {
                position,
                description: description.to_string(),
                quantity: draft.quantity,
                unit_price: draft.unit_price,
                amount: Money::round_from_hundredths(draft.quantity.extend(draft.unit_price))?,
            })
        })
        .collect()
}

/// Derived financial fields of an invoice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceTotals {
    pub subtotal: Money,
    pub tax_amount: Money,
    pub discount_amount: Money,
    pub total: Money,
}

impl InvoiceTotals {
    /// Compute totals, rounding each stored field exactly once (half-up).
    ///
    /// `subtotal = round(Σ qty × price)`, `tax = round(Σ qty × price × rate)`,
    /// `total = subtotal + tax − discount`. A discount larger than
    /// `subtotal + tax` is rejected.
    pub fn compute(items: &[LineItem], tax_rate: TaxRate, discount: Money) -> DomainResult<Self> {
        let exact_subtotal = items.iter().try_fold(0u128, |acc, item| {
            acc.checked_add(item.exact_amount())
                .ok_or_else(|| DomainError::validation("invoice subtotal overflow"))
        })?;

        let subtotal = Money::round_from_hundredths(exact_subtotal)?;
        let tax_amount = tax_rate.tax_on(exact_subtotal)?;
        let gross = subtotal.checked_add(tax_amount)?;

        let total = gross.checked_sub(discount).ok_or_else(|| {
            DomainError::validation(format!(
                "discount {discount} exceeds subtotal plus tax {gross}"
            ))
        })?;

        Ok(Self {
            subtotal,
            tax_amount,
            discount_amount: discount,
            total,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn draft(qty: &str, price: &str) -> LineItemDraft {
        LineItemDraft::new("Consulting", qty.parse().unwrap(), price.parse().unwrap())
    }

    #[test]
    fn two_items_with_tax_and_discount() {
        let items = build_line_items(&[draft("2", "50.00"), draft("1", "25.00")]).unwrap();
        let totals =
            InvoiceTotals::compute(&items, "10".parse().unwrap(), "5.00".parse().unwrap()).unwrap();

        assert_eq!(totals.subtotal.to_string(), "125.00");
        assert_eq!(totals.tax_amount.to_string(), "12.50");
        assert_eq!(totals.total.to_string(), "132.50");
        assert_eq!(items[0].position, 1);
        assert_eq!(items[1].position, 2);
        assert_eq!(items[0].amount.to_string(), "100.00");
    }

    #[test]
    fn intermediate_amounts_are_not_rounded_before_summing() {
        // Three lines of 0.33 × 0.05 = 0.0165 each. Rounding per line would give 0.06.
        let items = build_line_items(&[
            draft("0.33", "0.05"),
            draft("0.33", "0.05"),
            draft("0.33", "0.05"),
        ])
        .unwrap();
        let totals = InvoiceTotals::compute(&items, TaxRate::ZERO, Money::ZERO).unwrap();
        assert_eq!(totals.subtotal.minor_units(), 5);
    }

    #[test]
    fn discount_larger_than_gross_is_rejected() {
        let items = build_line_items(&[draft("1", "10.00")]).unwrap();
        let err = InvoiceTotals::compute(&items, "10".parse().unwrap(), "11.01".parse().unwrap())
            .unwrap_err();
        match err {
            DomainError::Validation(msg) if msg.contains("exceeds subtotal plus tax") => {}
            _ => panic!("Expected Validation error for oversized discount"),
        }

        let totals =
            InvoiceTotals::compute(&items, "10".parse().unwrap(), "11.00".parse().unwrap()).unwrap();
        assert!(totals.total.is_zero());
    }

    #[test]
    fn blank_description_is_rejected() {
        let mut bad = draft("1", "1.00");
        bad.description = "   ".to_string();
        assert!(build_line_items(&[draft("1", "1.00"), bad]).is_err());
    }

    #[test]
    fn empty_item_set_totals_to_zero() {
        let totals = InvoiceTotals::compute(&[], "20".parse().unwrap(), Money::ZERO).unwrap();
        assert_eq!(totals, InvoiceTotals::default());
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// total == round(Σ qty×price + tax − discount) and is never negative.
        #[test]
        fn total_matches_exact_formula(
            lines in prop::collection::vec((1u32..=999_900u32, 0u64..=1_000_000u64), 0..12),
            rate_bp in 0u32..=10_000u32,
            discount_seed in 0u64..=u64::MAX,
        ) {
            let drafts: Vec<LineItemDraft> = lines
                .iter()
                .map(|(q, p)| LineItemDraft::new(
                    "item",
                    Quantity::from_hundredths(*q).unwrap(),
                    Money::from_minor(*p).unwrap(),
                ))
                .collect();
            let items = build_line_items(&drafts).unwrap();
            let rate = TaxRate::from_basis_points(rate_bp).unwrap();

            let exact: u128 = lines.iter().map(|(q, p)| u128::from(*q) * u128::from(*p)).sum();
            let subtotal = (exact + 50) / 100;
            let tax = (exact * u128::from(rate_bp) + 500_000) / 1_000_000;
            let discount = discount_seed as u128 % (subtotal + tax + 1);

            let totals = InvoiceTotals::compute(
                &items,
                rate,
                Money::from_minor(discount as u64).unwrap(),
            ).unwrap();

            prop_assert_eq!(u128::from(totals.subtotal.minor_units()), subtotal);
            prop_assert_eq!(u128::from(totals.tax_amount.minor_units()), tax);
            prop_assert_eq!(u128::from(totals.total.minor_units()), subtotal + tax - discount);
        }
    }
}
