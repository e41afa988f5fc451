use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{EngineError, ResultEngine};

/// ISO-like currency code selected by a user or used as the ledger base.
///
/// Codes are three ASCII letters and always stored upper-cased, so `"usd"`
/// and `"USD"` are the same currency.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CurrencyCode(String);

impl CurrencyCode {
    /// Canonical currency code.
    #[must_use]
    pub fn code(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for CurrencyCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for CurrencyCode {
    type Error = EngineError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let code = value.trim();
        if code.len() != 3 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(EngineError::Validation(format!(
                "invalid currency code: {value:?}"
            )));
        }
        Ok(Self(code.to_ascii_uppercase()))
    }
}

impl TryFrom<String> for CurrencyCode {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::try_from(value.as_str())
    }
}

impl From<CurrencyCode> for String {
    fn from(value: CurrencyCode) -> Self {
        value.0
    }
}

/// Exchange rate of `currency` against the base currency on a given day.
///
/// `rate` reads as "one unit of base currency equals `rate` units of
/// `currency`".
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeRate {
    pub currency: CurrencyCode,
    pub rate: Decimal,
    pub date: NaiveDate,
}

impl ExchangeRate {
    pub fn new(currency: CurrencyCode, rate: Decimal, date: NaiveDate) -> ResultEngine<Self> {
        if rate <= Decimal::ZERO {
            return Err(EngineError::Validation(format!(
                "exchange rate for {currency} must be > 0, got {rate}"
            )));
        }
        Ok(Self {
            currency,
            rate,
            date,
        })
    }

    /// Converts an amount expressed in `currency` into the base currency.
    pub fn convert_to_base(&self, amount: Decimal) -> ResultEngine<Decimal> {
        amount.checked_div(self.rate).ok_or_else(|| {
            EngineError::Validation(format!(
                "cannot convert {amount} {} to base currency",
                self.currency
            ))
        })
    }

    /// Converts a base-currency amount into `currency`.
    pub fn convert_from_base(&self, amount: Decimal) -> ResultEngine<Decimal> {
        amount.checked_mul(self.rate).ok_or_else(|| {
            EngineError::Validation(format!(
                "cannot convert {amount} from base currency to {}",
                self.currency
            ))
        })
    }
}
