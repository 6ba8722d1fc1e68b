//! Partial-period pricing.
//!
//! A partial period is charged `amount × partial_days / full_days`, rounded to
//! the currency's minor units. The default rounding is banker's rounding
//! (half to even); truncation toward zero can be selected instead.

use core::str::FromStr;

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use cadence_core::{Currency, DomainError, DomainResult};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundingMode {
    #[default]
    HalfEven,
    Truncate,
}

impl RoundingMode {
    fn strategy(self) -> RoundingStrategy {
        match self {
            RoundingMode::HalfEven => RoundingStrategy::MidpointNearestEven,
            RoundingMode::Truncate => RoundingStrategy::ToZero,
        }
    }
}

impl FromStr for RoundingMode {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "half_even" | "bankers" => Ok(RoundingMode::HalfEven),
            "truncate" => Ok(RoundingMode::Truncate),
            other => Err(DomainError::validation(format!("unknown rounding mode '{other}'"))),
        }
    }
}

/// Round `amount` to the currency's minor units.
pub fn round_amount(amount: Decimal, currency: Currency, mode: RoundingMode) -> Decimal {
    match mode {
        RoundingMode::HalfEven => currency.round(amount),
        RoundingMode::Truncate => amount.round_dp_with_strategy(currency.minor_units(), mode.strategy()),
    }
}

/// Price of `partial_days` out of a `full_days` period priced at `amount`.
pub fn prorate(
    amount: Decimal,
    partial_days: i64,
    full_days: i64,
    currency: Currency,
    mode: RoundingMode,
) -> DomainResult<Decimal> {
    if full_days <= 0 || partial_days < 0 || partial_days > full_days {
        return Err(DomainError::invariant(format!(
            "cannot prorate {partial_days} of {full_days} days"
        )));
    }
    if partial_days == full_days {
        return Ok(round_amount(amount, currency, mode));
    }
    let raw = amount
        .checked_mul(Decimal::from(partial_days))
        .and_then(|v| v.checked_div(Decimal::from(full_days)))
        .ok_or_else(|| DomainError::invariant("proration overflow"))?;
    Ok(round_amount(raw, currency, mode))
}
