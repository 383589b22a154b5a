use rust_decimal::Decimal;
use rust_decimal::RoundingStrategy;
use serde::Deserialize;
use serde::Serialize;

use crate::StoreError;
use crate::StoreResult;

/// Monetary amount, decimal(12,2). Parses from the string form used at
/// the wire/database boundary; bounds are validated on every
/// construction so an out-of-range value can never be persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Money(Decimal);

/// Percentage, decimal(5,2), bounded to `[-1000, 1000]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Percent(Decimal);

/// Exchange rate, decimal(12,6), bounded to `[0, 1e6]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Rate(Decimal);

fn bounded(value: Decimal, scale: u32, min: Decimal, max: Decimal, what: &str) -> StoreResult<Decimal> {
    if value.scale() > scale {
        return Err(StoreError::Validation(format!(
            "{what} {value} exceeds {scale} decimal places"
        )));
    }
    if value < min || value > max {
        return Err(StoreError::Validation(format!(
            "{what} {value} outside [{min}, {max}]"
        )));
    }
    Ok(value)
}

fn parse_decimal(raw: &str, what: &str) -> StoreResult<Decimal> {
    raw.trim()
        .parse::<Decimal>()
        .map_err(|err| StoreError::Validation(format!("{what} {raw:?} is not numeric: {err}")))
}

impl Money {
    const SCALE: u32 = 2;

    fn min() -> Decimal {
        -Self::max()
    }

    fn max() -> Decimal {
        Decimal::new(1_000_000_000_000, 0)
    }

    pub fn new(value: Decimal) -> StoreResult<Self> {
        bounded(value, Self::SCALE, Self::min(), Self::max(), "amount").map(Self)
    }

    /// Rounds an arbitrary-precision intermediate (a commission split, a
    /// currency conversion) to cents before bounds-checking it.
    pub fn rounded(value: Decimal) -> StoreResult<Self> {
        Self::new(value.round_dp_with_strategy(Self::SCALE, RoundingStrategy::MidpointAwayFromZero))
    }

    /// Database/wire transformer: string in.
    pub fn parse(raw: &str) -> StoreResult<Self> {
        Self::new(parse_decimal(raw, "amount")?)
    }

    #[must_use]
    pub fn zero() -> Self {
        Self(Decimal::ZERO)
    }

    #[must_use]
    pub fn amount(&self) -> Decimal {
        self.0
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    #[must_use]
    pub fn is_negative(&self) -> bool {
        self.0.is_sign_negative() && !self.0.is_zero()
    }

    pub fn checked_add(&self, other: Money) -> StoreResult<Self> {
        let sum = self
            .0
            .checked_add(other.0)
            .ok_or_else(|| StoreError::Validation("amount addition overflow".into()))?;
        Self::new(sum)
    }

    pub fn checked_sub(&self, other: Money) -> StoreResult<Self> {
        let diff = self
            .0
            .checked_sub(other.0)
            .ok_or_else(|| StoreError::Validation("amount subtraction overflow".into()))?;
        Self::new(diff)
    }

    /// `self * percent / 100`, rounded to cents.
    pub fn apply_percent(&self, percent: Percent) -> StoreResult<Self> {
        let scaled = self
            .0
            .checked_mul(percent.0)
            .and_then(|product| product.checked_div(Decimal::ONE_HUNDRED))
            .ok_or_else(|| StoreError::Validation("percentage application overflow".into()))?;
        Self::rounded(scaled)
    }

    /// Converts through an exchange rate, rounded to cents.
    pub fn convert(&self, rate: Rate) -> StoreResult<Self> {
        let converted = self
            .0
            .checked_mul(rate.0)
            .ok_or_else(|| StoreError::Validation("rate conversion overflow".into()))?;
        Self::rounded(converted)
    }

    /// Database/wire transformer: string out, fixed two decimal places.
    #[must_use]
    pub fn to_db_string(&self) -> String {
        let mut value = self.0;
        value.rescale(Self::SCALE);
        value.to_string()
    }
}

impl std::fmt::Display for Money {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_db_string())
    }
}

impl From<Money> for String {
    fn from(value: Money) -> Self {
        value.to_db_string()
    }
}

impl TryFrom<String> for Money {
    type Error = StoreError;

    fn try_from(value: String) -> StoreResult<Self> {
        Self::parse(&value)
    }
}

impl Percent {
    const SCALE: u32 = 2;

    fn bound() -> Decimal {
        Decimal::ONE_THOUSAND
    }

    pub fn new(value: Decimal) -> StoreResult<Self> {
        bounded(
            value,
            Self::SCALE,
            -Self::bound(),
            Self::bound(),
            "percentage",
        )
        .map(Self)
    }

    pub fn parse(raw: &str) -> StoreResult<Self> {
        Self::new(parse_decimal(raw, "percentage")?)
    }

    #[must_use]
    pub fn value(&self) -> Decimal {
        self.0
    }

    #[must_use]
    pub fn to_db_string(&self) -> String {
        let mut value = self.0;
        value.rescale(Self::SCALE);
        value.to_string()
    }
}

impl From<Percent> for String {
    fn from(value: Percent) -> Self {
        value.to_db_string()
    }
}

impl TryFrom<String> for Percent {
    type Error = StoreError;

    fn try_from(value: String) -> StoreResult<Self> {
        Self::parse(&value)
    }
}

impl Rate {
    const SCALE: u32 = 6;

    fn max() -> Decimal {
        Decimal::new(1_000_000, 0)
    }

    pub fn new(value: Decimal) -> StoreResult<Self> {
        bounded(value, Self::SCALE, Decimal::ZERO, Self::max(), "rate").map(Self)
    }

    pub fn parse(raw: &str) -> StoreResult<Self> {
        Self::new(parse_decimal(raw, "rate")?)
    }

    #[must_use]
    pub fn one() -> Self {
        Self(Decimal::ONE)
    }

    #[must_use]
    pub fn value(&self) -> Decimal {
        self.0
    }

    #[must_use]
    pub fn to_db_string(&self) -> String {
        let mut value = self.0;
        value.rescale(Self::SCALE);
        value.to_string()
    }
}

impl From<Rate> for String {
    fn from(value: Rate) -> Self {
        value.to_db_string()
    }
}

impl TryFrom<String> for Rate {
    type Error = StoreError;

    fn try_from(value: String) -> StoreResult<Self> {
        Self::parse(&value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn money_round_trips_through_db_strings() {
        let money = Money::parse("1234.50").expect("parse");
        assert_eq!(money.to_db_string(), "1234.50");
        assert_eq!(Money::parse("7").expect("parse").to_db_string(), "7.00");
    }

    #[test]
    fn money_rejects_garbage_and_non_finite_input() {
        for raw in ["", "abc", "NaN", "Infinity", "-inf", "1.2.3"] {
            let err = Money::parse(raw).unwrap_err();
            assert!(matches!(err, StoreError::Validation(_)), "raw {raw}");
        }
    }

    #[test]
    fn money_enforces_bounds_and_scale() {
        assert!(Money::parse("1000000000000.00").is_ok());
        assert!(Money::parse("1000000000000.01").is_err());
        assert!(Money::parse("-1000000000000.01").is_err());
        assert!(Money::parse("10.001").is_err());
    }

    #[test]
    fn percent_and_rate_bounds() {
        assert!(Percent::parse("-1000").is_ok());
        assert!(Percent::parse("1000.01").is_err());
        assert!(Rate::parse("0").is_ok());
        assert!(Rate::parse("-0.000001").is_err());
        assert!(Rate::parse("1000000.000001").is_err());
        assert!(Rate::parse("1.1234567").is_err());
    }

    #[test]
    fn percent_application_rounds_to_cents() {
        let total = Money::parse("100.00").expect("total");
        let half = Percent::parse("50").expect("half");
        assert_eq!(total.apply_percent(half).expect("apply").to_db_string(), "50.00");

        let third = Percent::parse("33.33").expect("third");
        assert_eq!(
            total.apply_percent(third).expect("apply").to_db_string(),
            "33.33"
        );
    }

    #[test]
    fn conversion_applies_the_stored_rate() {
        let amount = Money::parse("10.00").expect("amount");
        let rate = Rate::parse("1.096500").expect("rate");
        assert_eq!(amount.convert(rate).expect("convert").to_db_string(), "10.97");
    }

    #[test]
    fn checked_arithmetic_keeps_bounds() {
        let max = Money::parse("1000000000000.00").expect("max");
        let cent = Money::parse("0.01").expect("cent");
        assert!(max.checked_add(cent).is_err());
        assert!(max.checked_sub(cent).is_ok());
    }
}
