//! Fixed-precision decimal helpers shared by admission and settlement.
//!
//! Prices and quantities never touch binary floats: they arrive as strings,
//! are parsed into `rust_decimal::Decimal` at the boundary, and are scaled to
//! integer base units (`U256`) only when a chain call is built.

use std::str::FromStr;

use alloy::primitives::U256;
use anyhow::{anyhow, bail, Result};
use rust_decimal::Decimal;

use crate::error::ApiError;

/// Parse a strictly positive decimal out of a request field.
pub fn parse_positive_decimal(raw: &str, field: &str) -> Result<Decimal, ApiError> {
    let value = Decimal::from_str(raw.trim())
        .map_err(|_| ApiError::validation(format!("Invalid {field}: {raw:?}")))?;
    if value <= Decimal::ZERO {
        return Err(ApiError::validation(format!("{field} must be positive")));
    }
    Ok(value)
}

/// A price sits on the grid when it is an exact multiple of the tick size.
pub fn on_tick(price: Decimal, tick: Decimal) -> bool {
    if tick <= Decimal::ZERO {
        return false;
    }
    (price % tick).is_zero()
}

/// Quote-side amount of a fill: `price * quantity`, exact.
pub fn quote_amount(price: Decimal, quantity: Decimal) -> Decimal {
    price * quantity
}

pub fn symbol_of(base: &str, quote: &str) -> String {
    format!("{}_{}", base.to_uppercase(), quote.to_uppercase())
}

pub fn split_symbol(symbol: &str) -> Option<(&str, &str)> {
    let mut parts = symbol.splitn(2, '_');
    match (parts.next(), parts.next()) {
        (Some(base), Some(quote)) if !base.is_empty() && !quote.is_empty() => Some((base, quote)),
        _ => None,
    }
}

/// Scale a decimal amount to integer base units for a token with the given
/// number of on-chain decimals. Fails rather than rounds when the amount
/// carries more precision than the token can represent.
pub fn to_base_units(amount: Decimal, decimals: u32) -> Result<U256> {
    if amount < Decimal::ZERO {
        bail!("amount must be non-negative, got {amount}");
    }
    let normalized = amount.normalize();
    if normalized.scale() > decimals {
        bail!("amount {amount} exceeds token precision of {decimals} decimals");
    }
    let mantissa = u128::try_from(normalized.mantissa())
        .map_err(|_| anyhow!("amount {amount} out of range"))?;
    let shift = decimals - normalized.scale();
    Ok(U256::from(mantissa) * U256::from(10u64).pow(U256::from(shift)))
}

/// Inverse of [`to_base_units`], used when reading escrow balances back.
pub fn from_base_units(units: U256, decimals: u32) -> Result<Decimal> {
    if decimals > 28 {
        bail!("token decimals {decimals} exceed representable precision");
    }
    let raw = u128::try_from(units).map_err(|_| anyhow!("on-chain amount out of range"))?;
    let mantissa =
        i128::try_from(raw).map_err(|_| anyhow!("on-chain amount out of range"))?;
    Ok(Decimal::from_i128_with_scale(mantissa, decimals).normalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn tick_grid() {
        assert!(on_tick(d("1.000000"), d("0.000001")));
        assert!(on_tick(d("5.25"), d("0.05")));
        assert!(!on_tick(d("5.26"), d("0.05")));
        assert!(!on_tick(d("1.0000005"), d("0.000001")));
        assert!(!on_tick(d("1"), d("0")));
    }

    #[test]
    fn symbol_round_trip() {
        assert_eq!(symbol_of("hbar", "usdt"), "HBAR_USDT");
        assert_eq!(split_symbol("HBAR_USDT"), Some(("HBAR", "USDT")));
        assert_eq!(split_symbol("HBARUSDT"), None);
        assert_eq!(split_symbol("_USDT"), None);
    }

    #[test]
    fn base_unit_scaling() {
        assert_eq!(to_base_units(d("1"), 18).unwrap(), U256::from(10u128.pow(18)));
        assert_eq!(to_base_units(d("0.5"), 6).unwrap(), U256::from(500_000u64));
        assert_eq!(to_base_units(d("0"), 6).unwrap(), U256::ZERO);
        // 7 fractional digits do not fit a 6-decimal token.
        assert!(to_base_units(d("0.0000001"), 6).is_err());
        assert!(to_base_units(d("-1"), 6).is_err());
    }

    #[test]
    fn base_unit_round_trip() {
        let amount = d("123.456789");
        let units = to_base_units(amount, 18).unwrap();
        assert_eq!(from_base_units(units, 18).unwrap(), amount);
    }

    #[test]
    fn quote_amount_is_exact() {
        assert_eq!(quote_amount(d("5"), d("100")), d("500"));
        assert_eq!(quote_amount(d("1.01"), d("3")), d("3.03"));
    }
}
