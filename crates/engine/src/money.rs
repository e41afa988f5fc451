//! Amount bounds shared by expenses and monthly limits.
//!
//! Amounts are `rust_decimal::Decimal` values. They must be strictly positive
//! and below [`MAX_AMOUNT`], so that summing a month (or a report range) of
//! them cannot overflow the 96-bit mantissa.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::{EngineError, ResultEngine};

/// Exclusive upper bound for a single amount (`10^22`).
pub const MAX_AMOUNT: Decimal = dec!(10000000000000000000000);

/// Checks `0 < amount < MAX_AMOUNT`.
pub fn validate_amount(amount: Decimal, label: &str) -> ResultEngine<()> {
    if amount <= Decimal::ZERO {
        return Err(EngineError::Validation(format!(
            "{label} must be > 0, got {amount}"
        )));
    }
    if amount >= MAX_AMOUNT {
        return Err(EngineError::Validation(format!(
            "{label} must be < {MAX_AMOUNT}, got {amount}"
        )));
    }
    Ok(())
}

/// Adds two amounts, reporting overflow as a validation error.
pub(crate) fn checked_sum(a: Decimal, b: Decimal) -> ResultEngine<Decimal> {
    a.checked_add(b)
        .ok_or_else(|| EngineError::Validation("amount sum overflow".to_string()))
}
