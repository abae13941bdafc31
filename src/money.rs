use serde::{
    Deserialize,
    Deserializer,
    Serialize,
    Serializer,
};
use std::{
    fmt,
    iter::Sum,
    str::FromStr,
};
use thiserror::Error;

const CENTS_PER_UNIT: u64 = 100;

/// An amount of currency held as whole cents.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Money(u64);

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("invalid amount: {0:?}")]
pub struct MoneyParseError(String);

impl Money {
    pub const ZERO: Money = Money(0);

    pub const fn from_cents(cents: u64) -> Self {
        Money(cents)
    }

    pub const fn from_units(units: u64) -> Self {
        Money(units.saturating_mul(CENTS_PER_UNIT))
    }

    /// Converts a decimal amount as sent by the server. Negative and
    /// non-finite values have no representation.
    pub fn from_decimal(value: f64) -> Option<Self> {
        if !value.is_finite() || value < 0.0 {
            return None;
        }
        Some(Money((value * CENTS_PER_UNIT as f64).round() as u64))
    }

    pub const fn cents(self) -> u64 {
        self.0
    }

    pub fn as_decimal(self) -> f64 {
        self.0 as f64 / CENTS_PER_UNIT as f64
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// `self × multiplier`, rounded to the nearest cent.
    pub fn times(self, multiplier: f64) -> Money {
        if !multiplier.is_finite() || multiplier <= 0.0 {
            return Money::ZERO;
        }
        Money((self.0 as f64 * multiplier).round() as u64)
    }

    pub fn saturating_sub(self, other: Money) -> Money {
        Money(self.0.saturating_sub(other.0))
    }

    pub fn saturating_add(self, other: Money) -> Money {
        Money(self.0.saturating_add(other.0))
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / CENTS_PER_UNIT, self.0 % CENTS_PER_UNIT)
    }
}

impl FromStr for Money {
    type Err = MoneyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<f64>()
            .ok()
            .and_then(Money::from_decimal)
            .ok_or_else(|| MoneyParseError(s.to_string()))
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Self {
        iter.fold(Money::ZERO, Money::saturating_add)
    }
}

impl Serialize for Money {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.as_decimal())
    }
}

impl<'de> Deserialize<'de> for Money {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(f64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Money::from_decimal(n)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid amount {n}"))),
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}
