//! Non-negative decimal amounts used for payment amounts and prepaid balances.

use rust_decimal::Decimal;
use rust_decimal::prelude::Zero;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fmt::Display;
use std::str::FromStr;

/// A non-negative decimal amount in the chain's base unit.
///
/// Mirrors the role of `MoneyAmount` in the teacher facilitator, but enforces
/// non-negativity unconditionally since every quantity this crate passes
/// around (payment amounts, prepaid balances, rollback credits) is a
/// non-negative ledger quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Amount(Decimal);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AmountError {
    #[error("invalid decimal amount: {0}")]
    InvalidFormat(String),
    #[error("amount must not be negative")]
    Negative,
}

impl Amount {
    pub const ZERO: Amount = Amount(Decimal::ZERO);

    pub fn new(value: Decimal) -> Result<Self, AmountError> {
        if value.is_sign_negative() && !value.is_zero() {
            return Err(AmountError::Negative);
        }
        Ok(Amount(value))
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn inner(&self) -> Decimal {
        self.0
    }

    /// Checked addition; ledger credits never overflow in practice but this
    /// keeps the invariant explicit rather than assumed.
    pub fn checked_add(&self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    /// Checked subtraction; returns `None` if the result would go negative,
    /// which call sites use to enforce "ledger never goes negative".
    pub fn checked_sub(&self, other: Amount) -> Option<Amount> {
        let result = self.0.checked_sub(other.0)?;
        if result.is_sign_negative() {
            None
        } else {
            Some(Amount(result))
        }
    }
}

impl FromStr for Amount {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parsed =
            Decimal::from_str(s).map_err(|e| AmountError::InvalidFormat(e.to_string()))?;
        Amount::new(parsed)
    }
}

impl Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.normalize())
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.normalize().to_string())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Amount::from_str(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_negative() {
        let err = Amount::from_str("-1.0").unwrap_err();
        assert_eq!(err, AmountError::Negative);
    }

    #[test]
    fn checked_sub_rejects_underflow() {
        let balance = Amount::from_str("0.10").unwrap();
        let debit = Amount::from_str("0.25").unwrap();
        assert!(balance.checked_sub(debit).is_none());
    }

    #[test]
    fn checked_sub_allows_exact_balance() {
        let balance = Amount::from_str("0.25").unwrap();
        let debit = Amount::from_str("0.25").unwrap();
        let remaining = balance.checked_sub(debit).unwrap();
        assert!(remaining.is_zero());
    }

    #[test]
    fn display_normalizes_trailing_zeros() {
        let amount = Amount::from_str("1.500").unwrap();
        assert_eq!(amount.to_string(), "1.5");
    }
}
