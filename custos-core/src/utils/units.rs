//! Exact conversions between human-unit decimals and integer token units.
//!
//! Settlement amounts must be wei-exact: full payouts reuse the stored
//! integer balance verbatim, and partial payouts are derived with integer
//! arithmetic only. Decimal -> integer conversion is the last resort, used
//! when no integer balance was recorded.

use alloy_primitives::U256;
use rust_decimal::Decimal;

/// Tolerance for comparing human-unit decimal amounts (1e-5).
///
/// Two amounts closer than this are treated as equal; in particular a
/// requested amount within epsilon of the full balance settles as a full
/// payout using the stored integer balance.
pub const DUST_EPSILON: Decimal = Decimal::from_parts(1, 0, 0, false, 5);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UnitsError {
    #[error("amount {0} is negative")]
    Negative(Decimal),
    #[error("amount {amount} carries more than {decimals} decimal places")]
    PrecisionLoss { amount: Decimal, decimals: u8 },
    #[error("balance must be positive for a proportional settlement")]
    ZeroBalance,
    #[error("integer amount does not fit the working range")]
    Overflow,
}

/// Convert a human-unit amount into exact integer units (`amount * 10^decimals`).
///
/// Rejects amounts with more fractional digits than the token carries rather
/// than silently rounding.
pub fn decimal_to_wei(amount: Decimal, decimals: u8) -> Result<U256, UnitsError> {
    if amount.is_sign_negative() {
        return Err(UnitsError::Negative(amount));
    }
    let normalized = amount.normalize();
    let scale = normalized.scale();
    if scale > u32::from(decimals) {
        return Err(UnitsError::PrecisionLoss { amount, decimals });
    }
    let mantissa = U256::from(normalized.mantissa().unsigned_abs());
    let shift = u32::from(decimals) - scale;
    let factor = U256::from(10u64).pow(U256::from(shift));
    mantissa.checked_mul(factor).ok_or(UnitsError::Overflow)
}

/// Convert integer token units back to a human-unit decimal.
///
/// `Decimal` holds 96 bits of mantissa; amounts wider than that are not
/// representable and reported as overflow rather than truncated.
pub fn wei_to_decimal(wei: U256, decimals: u8) -> Result<Decimal, UnitsError> {
    let units: u128 = wei.try_into().map_err(|_| UnitsError::Overflow)?;
    if units > i128::MAX as u128 {
        return Err(UnitsError::Overflow);
    }
    let value = Decimal::try_from_i128_with_scale(units as i128, u32::from(decimals))
        .map_err(|_| UnitsError::Overflow)?;
    Ok(value.normalize())
}

/// `floor(balance_wei * requested / balance)` in pure integer arithmetic.
///
/// The two decimals are cross-scaled to a common exponent first so the
/// division sees exact integers on both sides; no intermediate result is a
/// float or a rounded decimal.
pub fn proportional_wei(
    balance_wei: U256,
    requested: Decimal,
    balance: Decimal,
) -> Result<U256, UnitsError> {
    if requested.is_sign_negative() {
        return Err(UnitsError::Negative(requested));
    }
    if balance.is_sign_negative() || balance.is_zero() {
        return Err(UnitsError::ZeroBalance);
    }
    let scale = requested.scale().max(balance.scale());
    let requested_units = rescale_mantissa(requested, scale)?;
    let balance_units = rescale_mantissa(balance, scale)?;
    if balance_units == 0 {
        return Err(UnitsError::ZeroBalance);
    }
    let numerator = balance_wei
        .checked_mul(U256::from(requested_units))
        .ok_or(UnitsError::Overflow)?;
    Ok(numerator / U256::from(balance_units))
}

/// Fee amount for reporting. Fees never alter the transferred amount.
pub fn fee_amount(amount: Decimal, fee_percent: Decimal) -> Decimal {
    (amount * fee_percent / Decimal::ONE_HUNDRED).round_dp(8)
}

fn rescale_mantissa(value: Decimal, scale: u32) -> Result<u128, UnitsError> {
    let mantissa = value.mantissa().unsigned_abs();
    let shift = scale - value.scale();
    let factor = 10u128.checked_pow(shift).ok_or(UnitsError::Overflow)?;
    mantissa.checked_mul(factor).ok_or(UnitsError::Overflow)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::str::FromStr;

    fn wei(s: &str) -> U256 {
        U256::from_str(s).unwrap()
    }

    #[test]
    fn epsilon_is_ten_to_minus_five() {
        assert_eq!(DUST_EPSILON, dec!(0.00001));
    }

    #[test]
    fn decimal_to_wei_scales_exactly() {
        assert_eq!(decimal_to_wei(dec!(1), 6).unwrap(), U256::from(1_000_000u64));
        assert_eq!(decimal_to_wei(dec!(0.5), 6).unwrap(), U256::from(500_000u64));
        assert_eq!(
            decimal_to_wei(dec!(1000.00), 18).unwrap(),
            wei("1000000000000000000000")
        );
        assert_eq!(decimal_to_wei(Decimal::ZERO, 18).unwrap(), U256::ZERO);
    }

    #[test]
    fn decimal_to_wei_rejects_excess_precision() {
        assert_eq!(
            decimal_to_wei(dec!(0.0000001), 6),
            Err(UnitsError::PrecisionLoss {
                amount: dec!(0.0000001),
                decimals: 6
            })
        );
        // Trailing zeros are not precision.
        assert!(decimal_to_wei(dec!(0.5000000000), 6).is_ok());
    }

    #[test]
    fn decimal_to_wei_rejects_negative() {
        assert!(matches!(
            decimal_to_wei(dec!(-1), 6),
            Err(UnitsError::Negative(_))
        ));
    }

    #[test]
    fn wei_round_trips_through_decimal() {
        let wei = decimal_to_wei(dec!(123.456789), 18).unwrap();
        assert_eq!(wei_to_decimal(wei, 18).unwrap(), dec!(123.456789));
    }

    #[test]
    fn proportional_partial_is_exact_for_round_amounts() {
        // 1000.00 balance backed by 1000 * 10^18 wei; 400 requested must be
        // exactly 400 * 10^18.
        let balance_wei = wei("1000000000000000000000");
        let got = proportional_wei(balance_wei, dec!(400), dec!(1000.00)).unwrap();
        assert_eq!(got, wei("400000000000000000000"));
    }

    #[test]
    fn proportional_partial_floors_odd_ratios() {
        // 1 wei of balance cannot be split: floor(1 * 1 / 3) = 0.
        assert_eq!(
            proportional_wei(U256::from(1u64), dec!(1), dec!(3)).unwrap(),
            U256::ZERO
        );
        // floor(100 * 1 / 3) = 33.
        assert_eq!(
            proportional_wei(U256::from(100u64), dec!(1), dec!(3)).unwrap(),
            U256::from(33u64)
        );
    }

    #[test]
    fn proportional_handles_mixed_scales() {
        // requested at scale 0, balance at scale 2.
        let balance_wei = U256::from(123_456_789u64);
        let half = proportional_wei(balance_wei, dec!(50), dec!(100.00)).unwrap();
        assert_eq!(half, U256::from(61_728_394u64)); // floored
    }

    #[test]
    fn proportional_rejects_zero_balance() {
        assert_eq!(
            proportional_wei(U256::from(10u64), dec!(1), Decimal::ZERO),
            Err(UnitsError::ZeroBalance)
        );
    }

    #[test]
    fn fee_is_reporting_only_arithmetic() {
        assert_eq!(fee_amount(dec!(400), dec!(1.5)), dec!(6));
        assert_eq!(fee_amount(dec!(1000), dec!(0)), dec!(0));
    }
}
