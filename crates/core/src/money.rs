//! Fixed-point money and quantity primitives.
//!
//! Amounts are integer minor units (cents), quantities are hundredths, tax rates
//! are basis points. Products are carried exactly (in hundredths of a cent) and
//! rounded half-up exactly once, when a stored field is produced.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::value_object::ValueObject;

/// Largest representable amount: 9_999_999_999.99 in major units.
pub const MAX_MINOR_UNITS: u64 = 999_999_999_999;

/// Largest accepted quantity: 9999.00.
pub const MAX_QUANTITY_HUNDREDTHS: u32 = 999_900;

/// Largest accepted tax rate: 100.00%.
pub const MAX_TAX_BASIS_POINTS: u32 = 10_000;

/// Non-negative currency amount in minor units (e.g. cents).
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(u64);

impl ValueObject for Money {}

impl Money {
    pub const ZERO: Money = Money(0);

    pub fn from_minor(minor: u64) -> DomainResult<Self> {
        if minor > MAX_MINOR_UNITS {
            return Err(DomainError::validation(format!(
                "amount {minor} exceeds the maximum of {MAX_MINOR_UNITS} minor units"
            )));
        }
        Ok(Self(minor))
    }

    /// Convert a floating point major-unit amount at an API boundary.
    ///
    /// Rounds half-up to the nearest cent. NaN, infinities and negatives are rejected.
    pub fn try_from_major(value: f64) -> DomainResult<Self> {
        if !value.is_finite() {
            return Err(DomainError::validation("amount must be a finite number"));
        }
        if value < 0.0 {
            return Err(DomainError::validation("amount must not be negative"));
        }
        let cents = (value * 100.0 + 0.5).floor();
        if cents > MAX_MINOR_UNITS as f64 {
            return Err(DomainError::validation("amount is too large"));
        }
        Self::from_minor(cents as u64)
    }

    /// Round an exact amount expressed in hundredths of a minor unit.
    pub fn round_from_hundredths(exact: u128) -> DomainResult<Self> {
        let rounded = div_round_half_up(exact, 100);
        let minor = u64::try_from(rounded)
            .map_err(|_| DomainError::validation("amount overflow"))?;
        Self::from_minor(minor)
    }

    pub fn minor_units(self) -> u64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Money) -> DomainResult<Money> {
        let sum = self
            .0
            .checked_add(other.0)
            .ok_or_else(|| DomainError::validation("amount overflow"))?;
        Money::from_minor(sum)
    }

    pub fn checked_sub(self, other: Money) -> Option<Money> {
        self.0.checked_sub(other.0).map(Money)
    }

    pub fn saturating_sub(self, other: Money) -> Money {
        Money(self.0.saturating_sub(other.0))
    }

    /// Sum that never fails; used for reporting aggregates only.
    pub fn saturating_add(self, other: Money) -> Money {
        Money(self.0.saturating_add(other.0))
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

impl FromStr for Money {
    type Err = DomainError;

    /// Parse a decimal string with at most two fractional digits ("132.50").
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let minor = parse_fixed(s, 2, "amount")?;
        let minor = u64::try_from(minor).map_err(|_| DomainError::validation("amount is too large"))?;
        Money::from_minor(minor)
    }
}

/// Strictly positive quantity in hundredths (2 fractional digits), at most 9999.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Quantity(u32);

impl ValueObject for Quantity {}

impl Quantity {
    pub fn from_hundredths(hundredths: u32) -> DomainResult<Self> {
        if hundredths == 0 {
            return Err(DomainError::validation("quantity must be greater than zero"));
        }
        if hundredths > MAX_QUANTITY_HUNDREDTHS {
            return Err(DomainError::validation("quantity must not exceed 9999"));
        }
        Ok(Self(hundredths))
    }

    pub fn whole(units: u32) -> DomainResult<Self> {
        let hundredths = units
            .checked_mul(100)
            .ok_or_else(|| DomainError::validation("quantity must not exceed 9999"))?;
        Self::from_hundredths(hundredths)
    }

    /// Convert a floating point quantity at an API boundary (rounded half-up to 0.01).
    pub fn try_from_f64(value: f64) -> DomainResult<Self> {
        if !value.is_finite() {
            return Err(DomainError::validation("quantity must be a finite number"));
        }
        if value <= 0.0 {
            return Err(DomainError::validation("quantity must be greater than zero"));
        }
        let hundredths = (value * 100.0 + 0.5).floor();
        if hundredths > MAX_QUANTITY_HUNDREDTHS as f64 {
            return Err(DomainError::validation("quantity must not exceed 9999"));
        }
        Self::from_hundredths(hundredths as u32)
    }

    pub fn hundredths(self) -> u32 {
        self.0
    }

    /// Exact `quantity × unit_price`, in hundredths of a minor unit (no rounding).
    pub fn extend(self, unit_price: Money) -> u128 {
        u128::from(self.0) * u128::from(unit_price.minor_units())
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 % 100 == 0 {
            write!(f, "{}", self.0 / 100)
        } else {
            write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
        }
    }
}

impl FromStr for Quantity {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hundredths = parse_fixed(s, 2, "quantity")?;
        let hundredths = u32::try_from(hundredths)
            .map_err(|_| DomainError::validation("quantity must not exceed 9999"))?;
        Quantity::from_hundredths(hundredths)
    }
}

/// Tax rate as a percentage with two decimals, stored in basis points (10% = 1000).
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaxRate(u32);

impl ValueObject for TaxRate {}

impl TaxRate {
    pub const ZERO: TaxRate = TaxRate(0);

    pub fn from_basis_points(bp: u32) -> DomainResult<Self> {
        if bp > MAX_TAX_BASIS_POINTS {
            return Err(DomainError::validation("tax rate must be between 0 and 100 percent"));
        }
        Ok(Self(bp))
    }

    pub fn from_percent(percent: u32) -> DomainResult<Self> {
        let bp = percent
            .checked_mul(100)
            .ok_or_else(|| DomainError::validation("tax rate must be between 0 and 100 percent"))?;
        Self::from_basis_points(bp)
    }

    pub fn try_from_percent_f64(value: f64) -> DomainResult<Self> {
        if !value.is_finite() || value < 0.0 {
            return Err(DomainError::validation("tax rate must be a finite, non-negative number"));
        }
        let bp = (value * 100.0 + 0.5).floor();
        if bp > MAX_TAX_BASIS_POINTS as f64 {
            return Err(DomainError::validation("tax rate must be between 0 and 100 percent"));
        }
        Self::from_basis_points(bp as u32)
    }

    pub fn basis_points(self) -> u32 {
        self.0
    }

    /// Tax on an exact subtotal (hundredths of a minor unit), rounded once.
    pub fn tax_on(self, exact_subtotal: u128) -> DomainResult<Money> {
        // hundredths-of-cent × bp / (100 × 10_000) = cents
        let numerator = exact_subtotal * u128::from(self.0);
        let cents = div_round_half_up(numerator, 100 * u128::from(MAX_TAX_BASIS_POINTS));
        let cents = u64::try_from(cents).map_err(|_| DomainError::validation("tax overflow"))?;
        Money::from_minor(cents)
    }
}

impl fmt::Display for TaxRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}%", self.0 / 100, self.0 % 100)
    }
}

impl FromStr for TaxRate {
    type Err = DomainError;

    /// Parse a percentage such as "10" or "7.25".
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bp = parse_fixed(s.trim_end_matches('%'), 2, "tax rate")?;
        let bp = u32::try_from(bp)
            .map_err(|_| DomainError::validation("tax rate must be between 0 and 100 percent"))?;
        TaxRate::from_basis_points(bp)
    }
}

/// Integer division rounding half away from zero (inputs are non-negative).
pub fn div_round_half_up(numerator: u128, denominator: u128) -> u128 {
    (numerator + denominator / 2) / denominator
}

/// Parse a non-negative decimal string into an integer scaled by `10^scale`.
fn parse_fixed(input: &str, scale: u32, what: &str) -> DomainResult<u128> {
    let s = input.trim();
    if s.is_empty() {
        return Err(DomainError::validation(format!("{what} must not be empty")));
    }
    if s.starts_with('-') {
        return Err(DomainError::validation(format!("{what} must not be negative")));
    }

    let (whole, frac) = match s.split_once('.') {
        Some((w, f)) => (w, f),
        None => (s, ""),
    };

    if whole.is_empty() && frac.is_empty() {
        return Err(DomainError::validation(format!("{what} is not a number: '{input}'")));
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
        return Err(DomainError::validation(format!("{what} is not a number: '{input}'")));
    }
    if frac.len() > scale as usize {
        return Err(DomainError::validation(format!(
            "{what} allows at most {scale} decimal places"
        )));
    }
    if whole.len() > 20 {
        return Err(DomainError::validation(format!("{what} is too large")));
    }

    let factor = 10u128.pow(scale);
    let whole_value: u128 = if whole.is_empty() {
        0
    } else {
        whole
            .parse()
            .map_err(|_| DomainError::validation(format!("{what} is not a number: '{input}'")))?
    };
    let mut frac_value: u128 = if frac.is_empty() {
        0
    } else {
        frac.parse()
            .map_err(|_| DomainError::validation(format!("{what} is not a number: '{input}'")))?
    };
    frac_value *= 10u128.pow(scale - frac.len() as u32);

    whole_value
        .checked_mul(factor)
        .and_then(|w| w.checked_add(frac_value))
        .ok_or_else(|| DomainError::validation(format!("{what} is too large")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn money_parses_and_displays_two_decimals() {
        let m: Money = "132.5".parse().unwrap();
        assert_eq!(m.minor_units(), 13_250);
        assert_eq!(m.to_string(), "132.50");
        assert_eq!("0.05".parse::<Money>().unwrap().minor_units(), 5);
        assert_eq!("7".parse::<Money>().unwrap().to_string(), "7.00");
    }

    #[test]
    fn money_rejects_malformed_input() {
        assert!("-1.00".parse::<Money>().is_err());
        assert!("1.005".parse::<Money>().is_err());
        assert!("abc".parse::<Money>().is_err());
        assert!("".parse::<Money>().is_err());
        assert!(Money::try_from_major(f64::NAN).is_err());
        assert!(Money::try_from_major(f64::INFINITY).is_err());
        assert!(Money::try_from_major(-0.01).is_err());
    }

    #[test]
    fn float_boundary_rounds_half_up_once() {
        assert_eq!(Money::try_from_major(0.125).unwrap().minor_units(), 13);
        assert_eq!(Money::try_from_major(19.99).unwrap().minor_units(), 1_999);
    }

    #[test]
    fn quantity_bounds() {
        assert!(Quantity::from_hundredths(0).is_err());
        assert!("0".parse::<Quantity>().is_err());
        assert!("10000".parse::<Quantity>().is_err());
        assert_eq!("9999".parse::<Quantity>().unwrap().hundredths(), 999_900);
        assert_eq!("1.5".parse::<Quantity>().unwrap().to_string(), "1.50");
        assert!(Quantity::try_from_f64(f64::NAN).is_err());
    }

    #[test]
    fn tax_is_rounded_half_up_from_exact_subtotal() {
        let rate: TaxRate = "10".parse().unwrap();
        // 125.00 exact -> 12.50
        assert_eq!(rate.tax_on(12_500 * 100).unwrap().minor_units(), 1_250);
        // 0.05 at 10% = 0.005 -> 0.01
        assert_eq!(rate.tax_on(5 * 100).unwrap().minor_units(), 1);
        assert!("100.01".parse::<TaxRate>().is_err());
        assert_eq!("7.25%".parse::<TaxRate>().unwrap().basis_points(), 725);
    }

    #[test]
    fn fractional_quantity_extension_is_exact() {
        let qty: Quantity = "0.33".parse().unwrap();
        let price: Money = "0.10".parse().unwrap();
        // 0.033 exactly, in hundredths of a cent
        assert_eq!(qty.extend(price), 330);
        assert_eq!(Money::round_from_hundredths(330).unwrap().minor_units(), 3);
        assert_eq!(Money::round_from_hundredths(350).unwrap().minor_units(), 4);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Display/parse agree for every representable amount.
        #[test]
        fn money_display_parses_back(minor in 0u64..=MAX_MINOR_UNITS) {
            let m = Money::from_minor(minor).unwrap();
            let parsed: Money = m.to_string().parse().unwrap();
            prop_assert_eq!(parsed, m);
        }

        /// Rounding never moves more than half a cent.
        #[test]
        fn rounding_error_is_at_most_half_a_cent(exact in 0u128..1_000_000_000u128) {
            let rounded = Money::round_from_hundredths(exact).unwrap();
            let back = u128::from(rounded.minor_units()) * 100;
            let diff = back.abs_diff(exact);
            prop_assert!(diff <= 50);
        }
    }
}
