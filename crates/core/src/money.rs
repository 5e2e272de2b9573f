//! Money
//!
//! Exact decimal amounts in euros. Every [`Amount`] is kept at cent precision,
//! rounding half away from zero whenever a computation produces more digits.

use std::{
    fmt::{self, Display},
    iter::Sum,
    str::FromStr,
};

use rust_decimal::{Decimal, RoundingStrategy, prelude::ToPrimitive};
use rusty_money::{Money, iso};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of decimal places kept for amounts.
pub const CENT_SCALE: u32 = 2;

/// Errors raised by amount arithmetic.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MoneyError {
    /// The result does not fit the decimal representation.
    #[error("amount arithmetic overflowed")]
    Overflow,

    /// A textual amount could not be parsed.
    #[error("invalid amount: {0}")]
    Invalid(String),

    /// A share was requested with a zero denominator.
    #[error("cannot share an amount over zero parts")]
    ZeroDenominator,
}

/// A signed euro amount with cent precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Amount(Decimal);

impl Amount {
    /// Zero euros.
    pub const ZERO: Amount = Amount(Decimal::ZERO);

    /// Create an amount from a decimal, rounding to the cent.
    #[must_use]
    pub fn new(value: Decimal) -> Self {
        Self(value.round_dp_with_strategy(CENT_SCALE, RoundingStrategy::MidpointAwayFromZero))
    }

    /// Create an amount from a number of cents.
    #[must_use]
    pub fn from_cents(cents: i64) -> Self {
        Self(Decimal::new(cents, CENT_SCALE))
    }

    /// Create an amount from whole euros.
    #[must_use]
    pub fn from_euros(euros: i64) -> Self {
        Self(Decimal::from(euros))
    }

    /// The amount expressed in cents.
    ///
    /// # Errors
    ///
    /// Returns [`MoneyError::Overflow`] if the value does not fit an `i64`.
    pub fn to_cents(self) -> Result<i64, MoneyError> {
        self.0
            .checked_mul(Decimal::ONE_HUNDRED)
            .and_then(|cents| cents.to_i64())
            .ok_or(MoneyError::Overflow)
    }

    /// The underlying decimal value.
    #[must_use]
    pub const fn value(self) -> Decimal {
        self.0
    }

    /// Whether the amount is strictly below zero.
    #[must_use]
    pub fn is_negative(self) -> bool {
        self.0.is_sign_negative() && !self.0.is_zero()
    }

    /// Whether the amount is strictly above zero.
    #[must_use]
    pub fn is_positive(self) -> bool {
        self.0.is_sign_positive() && !self.0.is_zero()
    }

    /// Clamp negative amounts to zero.
    #[must_use]
    pub fn clamp_to_zero(self) -> Self {
        if self.is_negative() { Self::ZERO } else { self }
    }

    /// Add two amounts.
    ///
    /// # Errors
    ///
    /// Returns [`MoneyError::Overflow`] if the sum is not representable.
    pub fn checked_add(self, other: Self) -> Result<Self, MoneyError> {
        self.0
            .checked_add(other.0)
            .map(Self)
            .ok_or(MoneyError::Overflow)
    }

    /// Subtract an amount; the result may be negative.
    ///
    /// # Errors
    ///
    /// Returns [`MoneyError::Overflow`] if the difference is not representable.
    pub fn checked_sub(self, other: Self) -> Result<Self, MoneyError> {
        self.0
            .checked_sub(other.0)
            .map(Self)
            .ok_or(MoneyError::Overflow)
    }

    /// Multiply a unit price by a quantity.
    ///
    /// # Errors
    ///
    /// Returns [`MoneyError::Overflow`] if the product is not representable.
    pub fn times(self, quantity: u32) -> Result<Self, MoneyError> {
        self.0
            .checked_mul(Decimal::from(quantity))
            .map(Self)
            .ok_or(MoneyError::Overflow)
    }

    /// Apply a rate (e.g. `0.95` for a 95% reimbursement rate), rounding half
    /// away from zero to the cent.
    ///
    /// # Errors
    ///
    /// Returns [`MoneyError::Overflow`] if the product is not representable.
    pub fn apply_rate(self, rate: Decimal) -> Result<Self, MoneyError> {
        self.0
            .checked_mul(rate)
            .map(Self::new)
            .ok_or(MoneyError::Overflow)
    }

    /// `self * numerator / denominator`, floored to the cent.
    ///
    /// # Errors
    ///
    /// Returns [`MoneyError::ZeroDenominator`] if `denominator` is zero and
    /// [`MoneyError::Overflow`] if the value does not fit in cents.
    pub fn share(self, numerator: u64, denominator: u64) -> Result<Self, MoneyError> {
        if denominator == 0 {
            return Err(MoneyError::ZeroDenominator);
        }

        let cents = i128::from(self.to_cents()?);
        let shared = cents
            .checked_mul(i128::from(numerator))
            .ok_or(MoneyError::Overflow)?
            .div_euclid(i128::from(denominator));

        i64::try_from(shared)
            .map(Self::from_cents)
            .map_err(|_conversion| MoneyError::Overflow)
    }

    /// Convert to a displayable euro [`Money`] value.
    ///
    /// # Errors
    ///
    /// Returns [`MoneyError::Overflow`] if the value does not fit in cents.
    pub fn to_money(self) -> Result<Money<'static, iso::Currency>, MoneyError> {
        Ok(Money::from_minor(self.to_cents()?, iso::EUR))
    }
}

impl TryFrom<Decimal> for Amount {
    type Error = MoneyError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Ok(Self::new(value))
    }
}

impl From<Amount> for Decimal {
    fn from(value: Amount) -> Self {
        value.0
    }
}

impl FromStr for Amount {
    type Err = MoneyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Decimal::from_str(s.trim())
            .map(Self::new)
            .map_err(|error| MoneyError::Invalid(format!("{s}: {error}")))
    }
}

impl Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}

impl Sum for Amount {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        Self::new(iter.map(|amount| amount.0).sum())
    }
}
