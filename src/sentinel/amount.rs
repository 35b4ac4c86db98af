//! Base-unit ↔ human-unit conversion.
//!
//! All scaling goes through `rust_decimal`; binary floating point never
//! touches an amount.

use num_bigint::BigUint;
use rust_decimal::Decimal;
use tracing::warn;

use super::error::{AmountError, ChainError};

/// Native coin decimals (wei → ether)
pub const NATIVE_DECIMALS: u32 = 18;

/// Largest scale `rust_decimal` can represent
const MAX_SCALE: u32 = 28;

/// Scale a raw on-chain integer down by `10^decimals`
pub fn scale_amount(raw: &BigUint, decimals: u32) -> Result<Decimal, AmountError> {
    if decimals > MAX_SCALE {
        return Err(AmountError::Decimals(decimals));
    }

    let mantissa = i128::try_from(raw).map_err(|_| AmountError::Overflow(raw.to_string()))?;
    Decimal::try_from_i128_with_scale(mantissa, decimals)
        .map_err(|_| AmountError::Overflow(raw.to_string()))
}

/// Scale for reporting: an amount `Decimal` cannot hold is logged and
/// left unscaled instead of failing the caller
pub fn try_scale_amount(raw: &BigUint, decimals: u32) -> Option<Decimal> {
    scale_amount(raw, decimals)
        .map_err(|e| warn!("Leaving amount unscaled: {}", e))
        .ok()
}

pub fn display_amount(amount: Option<Decimal>) -> String {
    amount.map_or_else(|| "(unscaled)".to_string(), |a| a.to_string())
}

/// Convert wei to the native coin unit (18 decimals)
pub fn wei_to_native(wei: &BigUint) -> Result<Decimal, AmountError> {
    scale_amount(wei, NATIVE_DECIMALS)
}

/// Parse a JSON-RPC hex quantity (`0x1a`) into a u64
pub fn parse_quantity(value: &str) -> Result<u64, ChainError> {
    let digits = value.trim_start_matches("0x");
    if digits.is_empty() {
        return Ok(0);
    }
    u64::from_str_radix(digits, 16)
        .map_err(|e| ChainError::Parse(format!("invalid quantity {}: {}", value, e)))
}

/// Parse a JSON-RPC hex quantity or 32-byte word into an arbitrary-size integer
pub fn parse_big_quantity(value: &str) -> Result<BigUint, ChainError> {
    let digits = value.trim_start_matches("0x");
    if digits.is_empty() {
        return Ok(BigUint::default());
    }
    BigUint::parse_bytes(digits.as_bytes(), 16)
        .ok_or_else(|| ChainError::Parse(format!("invalid quantity {}", value)))
}

/// Format a block number as a JSON-RPC quantity
pub fn to_quantity(value: u64) -> String {
    format!("0x{:x}", value)
}
