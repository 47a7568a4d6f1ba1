//! Fixed-point money and currency codes.
//!
//! Amounts are `rust_decimal::Decimal`, never floats. Arithmetic that feeds
//! the ledger rounds explicitly to the currency's minor-unit precision.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// ISO 4217 alphabetic currency code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CurrencyCode(String);

impl CurrencyCode {
    pub fn new(code: impl AsRef<str>) -> EngineResult<Self> {
        let code = code.as_ref().trim().to_ascii_uppercase();
        if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_uppercase()) {
            return Err(EngineError::validation(format!(
                "invalid currency code: {code:?}"
            )));
        }
        Ok(Self(code))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Minor-unit precision (decimal places) for the currency.
    pub fn precision(&self) -> u32 {
        match self.0.as_str() {
            "JPY" | "KRW" | "VND" => 0,
            "BHD" | "KWD" | "OMR" | "TND" => 3,
            _ => 2,
        }
    }
}

impl core::fmt::Display for CurrencyCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// An amount in a specific currency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    pub amount: Decimal,
    pub currency: CurrencyCode,
}

impl Money {
    pub fn new(amount: Decimal, currency: CurrencyCode) -> Self {
        Self { amount, currency }
    }

    /// Round to the currency's minor-unit precision (banker-unfriendly:
    /// midpoints round away from zero, matching bank statement conventions).
    pub fn rounded(&self) -> Money {
        Money {
            amount: self.amount.round_dp_with_strategy(
                self.currency.precision(),
                RoundingStrategy::MidpointAwayFromZero,
            ),
            currency: self.currency.clone(),
        }
    }

    pub fn is_positive(&self) -> bool {
        self.amount > Decimal::ZERO
    }
}

impl core::fmt::Display for Money {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{} {}", self.amount, self.currency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn currency_codes_normalize_to_uppercase() {
        let gbp = CurrencyCode::new("gbp").unwrap();
        assert_eq!(gbp.as_str(), "GBP");
        assert_eq!(gbp.precision(), 2);
    }

    #[test]
    fn invalid_currency_codes_are_rejected()  {
        assert!(CurrencyCode::new("").is_err());
        assert!(CurrencyCode::new("POUNDS").is_err());
        assert!(CurrencyCode::new("G1P").is_err());
    }

    #[test]
    fn zero_decimal_currencies_round_to_whole_units() {
        let jpy = CurrencyCode::new("JPY").unwrap();
        let m = Money::new(dec!(1000.6), jpy).rounded();
        assert_eq!(m.amount, dec!(1001));
    }

    #[test]
    fn midpoints_round_away_from_zero() {
        let gbp = CurrencyCode::new("GBP").unwrap();
        let m = Money::new(dec!(10.005), gbp).rounded();
        assert_eq!(m.amount, dec!(10.01));
    }
}
