use rust_decimal::Decimal;

use crate::error::{Result, VaultError};
use crate::models::{U256, WAD};

/// Fractional digits of every on-chain amount.
pub const DECIMALS: u32 = 18;

/// Parses a human decimal string such as `"1.25"` into an 18-decimal integer.
pub fn parse_units(input: &str) -> Result<U256> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(VaultError::InvalidAmount("amount is empty".to_string()));
    }

    // `from_str` would round past 28 significant digits.
    let value = Decimal::from_str_exact(trimmed)
        .map_err(|e| VaultError::InvalidAmount(format!("'{}' is not a decimal amount: {}", trimmed, e)))?
        .normalize();
    if value.is_sign_negative() && !value.is_zero() {
        return Err(VaultError::InvalidAmount(format!("'{}' is negative", trimmed)));
    }
    if value.scale() > DECIMALS {
        return Err(VaultError::InvalidAmount(format!(
            "'{}' has more than {} fractional digits",
            trimmed, DECIMALS
        )));
    }

    let mantissa = U256::from(value.mantissa().unsigned_abs());
    let multiplier = U256::from(10u64).pow(U256::from(DECIMALS - value.scale()));
    Ok(mantissa * multiplier)
}

/// Formats an 18-decimal integer without trailing zeros.
pub fn format_units(value: U256) -> String {
    let whole = value / WAD;
    let fraction = value % WAD;
    if fraction.is_zero() {
        return whole.to_string();
    }
    let digits = format!("{:0>18}", fraction.to_string());
    format!("{}.{}", whole, digits.trim_end_matches('0'))
}

/// Formats an 18-decimal integer truncated to `places` fractional digits.
pub fn format_units_truncated(value: U256, places: u32) -> String {
    let places = places.min(DECIMALS);
    let step = U256::from(10u64).pow(U256::from(DECIMALS - places));
    format_units(value - value % step)
}
