//! Exact conversion between human-readable token amounts and onchain base
//! units.
//!
//! Token amounts travel through the treasury as `rust_decimal::Decimal`
//! values (`"12.5"` USDT) while contract calls take the integral base-unit
//! representation (`12_500_000` for a 6-decimal token). The conversion
//! never rounds: an amount with more fractional digits than the token
//! supports is rejected instead of truncated, since onchain amounts must be
//! integral and silently dropping dust would under-claim.

use alloy::primitives::U256;
use rust_decimal::Decimal;

/// Largest scale a `Decimal` can carry.
const MAX_DECIMAL_SCALE: u32 = 28;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BaseUnitsError {
    #[error("Amount cannot be negative: {0}")]
    Negative(Decimal),
    #[error("Amount {amount} is not representable with {decimals} decimals")]
    NonIntegral { amount: Decimal, decimals: u8 },
    #[error("Amount {amount} scaled by 10^{decimals} overflows U256")]
    Overflow { amount: Decimal, decimals: u8 },
    #[error("Base-unit value {value} with {decimals} decimals does not fit a Decimal")]
    Unrepresentable { value: U256, decimals: u8 },
}

/// Scales `amount` by `10^decimals` and returns the integral result.
///
/// E.g., `to_base_units(dec!(1.5), 6)` returns `U256::from(1_500_000)`.
///
/// # Errors
///
/// Fails for negative amounts, for amounts with more fractional digits than
/// `decimals` ([`BaseUnitsError::NonIntegral`]) and when the scaled value
/// does not fit a `U256`.
pub fn to_base_units(amount: Decimal, decimals: u8) -> Result<U256, BaseUnitsError> {
    if amount.is_sign_negative() && !amount.is_zero() {
        return Err(BaseUnitsError::Negative(amount));
    }

    // Normalizing strips trailing zeros, so any remaining scale beyond
    // `decimals` carries a non-zero digit that scaling cannot absorb.
    let normalized = amount.normalize();
    let scale = normalized.scale();
    let target = u32::from(decimals);

    if scale > target {
        return Err(BaseUnitsError::NonIntegral { amount, decimals });
    }

    let mantissa = normalized.mantissa().unsigned_abs();
    let overflow = || BaseUnitsError::Overflow { amount, decimals };

    let factor = U256::from(10u8)
        .checked_pow(U256::from(target - scale))
        .ok_or_else(overflow)?;

    U256::from(mantissa).checked_mul(factor).ok_or_else(overflow)
}

/// Inverse of [`to_base_units`]: divides `value` by `10^decimals`.
///
/// # Errors
///
/// Fails when the result cannot be held by a `Decimal` (more than 28
/// significant fractional digits or a mantissa beyond 96 bits).
pub fn from_base_units(value: U256, decimals: u8) -> Result<Decimal, BaseUnitsError> {
    if value.is_zero() {
        return Ok(Decimal::ZERO);
    }

    let unrepresentable = || BaseUnitsError::Unrepresentable { value, decimals };
    let ten = U256::from(10u8);

    let mut remaining = value;
    let mut scale = u32::from(decimals);

    while scale > 0 && (remaining % ten).is_zero() {
        remaining /= ten;
        scale -= 1;
    }

    if scale > MAX_DECIMAL_SCALE {
        return Err(unrepresentable());
    }

    let raw: u128 = remaining.try_into().map_err(|_| unrepresentable())?;
    let signed = i128::try_from(raw).map_err(|_| unrepresentable())?;

    Decimal::try_from_i128_with_scale(signed, scale).map_err(|_| unrepresentable())
}
