//! # Money Types
//!
//! Fixed-point amounts and ISO 4217 currencies.
//! Order totals are currency-agnostic `Amount`s; a currency is attached
//! only when a payment is created against a provider.

use crate::error::EngineError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, Sub};
use std::str::FromStr;

/// Fixed-point decimal with two fractional digits, stored as hundredths.
///
/// `Amount::from_str("100.00")` and `Amount::from_minor(10_000)` are equal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount(i64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    /// Create from hundredths (cents, paisa, ...)
    pub const fn from_minor(minor: i64) -> Self {
        Amount(minor)
    }

    /// Value in hundredths
    pub const fn minor_units(&self) -> i64 {
        self.0
    }

    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Multiply by a line quantity, `None` on overflow
    pub fn checked_mul(self, quantity: u32) -> Option<Amount> {
        self.0.checked_mul(i64::from(quantity)).map(Amount)
    }

    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    pub fn checked_sub(self, other: Amount) -> Option<Amount> {
        self.0.checked_sub(other.0).map(Amount)
    }

    /// Sum a sequence of amounts, `None` on overflow
    pub fn checked_sum<I: IntoIterator<Item = Amount>>(amounts: I) -> Option<Amount> {
        amounts
            .into_iter()
            .try_fold(Amount::ZERO, |acc, a| acc.checked_add(a))
    }
}

impl Add for Amount {
    type Output = Amount;

    fn add(self, rhs: Amount) -> Amount {
        Amount(self.0 + rhs.0)
    }
}

impl Sub for Amount {
    type Output = Amount;

    fn sub(self, rhs: Amount) -> Amount {
        Amount(self.0 - rhs.0)
    }
}

impl Sum for Amount {
    fn sum<I: Iterator<Item = Amount>>(iter: I) -> Amount {
        iter.fold(Amount::ZERO, |acc, a| acc + a)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{}{}.{:02}", sign, abs / 100, abs % 100)
    }
}

impl FromStr for Amount {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || EngineError::Validation(format!("Invalid amount: {:?}", s));

        let trimmed = s.trim();
        let (negative, digits) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed),
        };
        let (whole, frac) = digits.split_once('.').unwrap_or((digits, ""));

        let all_digits = |part: &str| part.bytes().all(|b| b.is_ascii_digit());
        if whole.is_empty() || !all_digits(whole) || frac.len() > 2 || !all_digits(frac) {
            return Err(invalid());
        }

        let whole: i64 = whole.parse().map_err(|_| invalid())?;
        let frac: i64 = match frac.len() {
            0 => 0,
            1 => frac.parse::<i64>().map_err(|_| invalid())? * 10,
            _ => frac.parse().map_err(|_| invalid())?,
        };

        let minor = whole
            .checked_mul(100)
            .and_then(|w| w.checked_add(frac))
            .ok_or_else(invalid)?;

        Ok(Amount(if negative { -minor } else { minor }))
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Supported currencies (ISO 4217)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Currency {
    USD,
    EUR,
    GBP,
    JPY,
    CAD,
    AUD,
    BDT,
}

impl Currency {
    /// Returns the ISO 4217 currency code
    pub fn as_str(&self) -> &'static str {
        match self {
            Currency::USD => "usd",
            Currency::EUR => "eur",
            Currency::GBP => "gbp",
            Currency::JPY => "jpy",
            Currency::CAD => "cad",
            Currency::AUD => "aud",
            Currency::BDT => "bdt",
        }
    }

    /// Returns the number of decimal places for this currency
    /// (JPY has 0 decimals, most others have 2)
    pub fn decimal_places(&self) -> u8 {
        match self {
            Currency::JPY => 0,
            _ => 2,
        }
    }

    /// Convert an amount to the smallest currency unit (cents, etc.)
    pub fn to_smallest_unit(&self, amount: Amount) -> i64 {
        let divisor = 10_i64.pow(2 - u32::from(self.decimal_places()));
        amount.minor_units() / divisor
    }

    /// Convert from smallest unit back to an amount
    pub fn from_smallest_unit(&self, units: i64) -> Amount {
        let multiplier = 10_i64.pow(2 - u32::from(self.decimal_places()));
        Amount::from_minor(units.saturating_mul(multiplier))
    }
}

impl Default for Currency {
    fn default() -> Self {
        Currency::USD
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str().to_uppercase())
    }
}

impl FromStr for Currency {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "usd" => Ok(Currency::USD),
            "eur" => Ok(Currency::EUR),
            "gbp" => Ok(Currency::GBP),
            "jpy" => Ok(Currency::JPY),
            "cad" => Ok(Currency::CAD),
            "aud" => Ok(Currency::AUD),
            "bdt" => Ok(Currency::BDT),
            other => Err(EngineError::Validation(format!(
                "Unsupported currency: {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_amount_parse_and_display() {
        assert_eq!("100.00".parse::<Amount>().unwrap(), Amount::from_minor(10_000));
        assert_eq!("12.5".parse::<Amount>().unwrap(), Amount::from_minor(1_250));
        assert_eq!("7".parse::<Amount>().unwrap(), Amount::from_minor(700));
        assert_eq!("-0.05".parse::<Amount>().unwrap(), Amount::from_minor(-5));

        assert_eq!(Amount::from_minor(10_000).to_string(), "100.00");
        assert_eq!(Amount::from_minor(5).to_string(), "0.05");
        assert_eq!(Amount::from_minor(-1_999).to_string(), "-19.99");
    }

    #[test]
    fn test_amount_rejects_garbage() {
        assert!("".parse::<Amount>().is_err());
        assert!("1.234".parse::<Amount>().is_err());
        assert!("abc".parse::<Amount>().is_err());
        assert!(".50".parse::<Amount>().is_err());
        assert!("1e3".parse::<Amount>().is_err());
    }

    #[test]
    fn test_amount_arithmetic() {
        let price = Amount::from_minor(1_099);
        assert_eq!(price.checked_mul(3), Some(Amount::from_minor(3_297)));
        assert_eq!(Amount::from_minor(i64::MAX).checked_mul(2), None);

        let total: Amount = vec![Amount::from_minor(100), Amount::from_minor(250)]
            .into_iter()
            .sum();
        assert_eq!(total, Amount::from_minor(350));
        assert_eq!(
            Amount::checked_sum([Amount::from_minor(i64::MAX), Amount::from_minor(1)]),
            None
        );
    }

    #[test]
    fn test_amount_serde_as_string() {
        let json = serde_json::to_string(&Amount::from_minor(4_500)).unwrap();
        assert_eq!(json, "\"45.00\"");
        let back: Amount = serde_json::from_str("\"45.00\"").unwrap();
        assert_eq!(back, Amount::from_minor(4_500));
    }

    #[test]
    fn test_currency_conversion() {
        let usd = Currency::USD;
        assert_eq!(usd.to_smallest_unit(Amount::from_minor(1_099)), 1_099);
        assert_eq!(usd.from_smallest_unit(1_099), Amount::from_minor(1_099));

        let jpy = Currency::JPY;
        assert_eq!(jpy.to_smallest_unit(Amount::from_minor(100_000)), 1_000);
        assert_eq!(jpy.from_smallest_unit(1_000), Amount::from_minor(100_000));
    }

    #[test]
    fn test_currency_parse() {
        assert_eq!("BDT".parse::<Currency>().unwrap(), Currency::BDT);
        assert_eq!("usd".parse::<Currency>().unwrap(), Currency::USD);
        assert!("xyz".parse::<Currency>().is_err());
        assert_eq!(Currency::BDT.to_string(), "BDT");
    }
}
