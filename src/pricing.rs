// Swap Pricing
//
// Unit price and base-token volume of a V2 swap. All outputs are fixed point
// with 18 decimals.

use alloy_primitives::utils::format_units;
use alloy_primitives::U256;

pub const PRICE_DECIMALS: u8 = 18;

/// 1.0 at 18 decimals
pub const ONE: U256 = U256::from_limbs([1_000_000_000_000_000_000, 0, 0, 0]);

/// Pick the token0 / token1 amounts that describe the trade.
///
/// A clean token0 -> token1 swap uses (amount0In, amount1Out), the reverse
/// uses (amount0Out, amount1In). Anything else (multi-hop routes touching
/// both directions) falls back to whichever amount is non-zero per side.
pub fn trade_amounts(
    amount0_in: U256,
    amount1_in: U256,
    amount0_out: U256,
    amount1_out: U256,
) -> (U256, U256) {
    if !amount0_in.is_zero() && !amount1_out.is_zero() {
        return (amount0_in, amount1_out);
    }
    if !amount1_in.is_zero() && !amount0_out.is_zero() {
        return (amount0_out, amount1_in);
    }

    let amount0 = if !amount0_in.is_zero() { amount0_in } else { amount0_out };
    let amount1 = if !amount1_in.is_zero() { amount1_in } else { amount1_out };
    (amount0, amount1)
}

/// token1 per token0 in raw units; `None` when no token0 moved
pub fn unit_price(
    amount0_in: U256,
    amount1_in: U256,
    amount0_out: U256,
    amount1_out: U256,
) -> Option<U256> {
    let (amount0, amount1) = trade_amounts(amount0_in, amount1_in, amount0_out, amount1_out);
    if amount0.is_zero() {
        return None;
    }
    amount1.checked_mul(ONE).map(|scaled| scaled / amount0)
}

/// Traded token0 valued at its oracle price: (in + out) * price / 10^decimals
pub fn volume(
    amount0_in: U256,
    amount0_out: U256,
    token0_price: Option<U256>,
    decimals0: u8,
) -> Option<U256> {
    let price = token0_price.filter(|p| !p.is_zero())?;
    let total = amount0_in.checked_add(amount0_out)?;
    if total.is_zero() {
        return None;
    }

    let unit = U256::from(10u64).pow(U256::from(decimals0));
    total.checked_mul(price).map(|value| value / unit)
}

/// Decimal rendering of a fixed-point value with trailing zeros removed
pub fn format_fixed(value: U256, decimals: u8) -> eyre::Result<String> {
    let formatted = format_units(value, decimals)?;
    if !formatted.contains('.') {
        return Ok(formatted);
    }
    Ok(formatted
        .trim_end_matches('0')
        .trim_end_matches('.')
        .to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u(v: u64) -> U256 {
        U256::from(v)
    }

    #[test]
    fn test_token0_in_token1_out() {
        // 100 units of a 6-decimal token0 buy 50 units of token1
        let price = unit_price(u(100), U256::ZERO, U256::ZERO, u(50)).unwrap();
        assert_eq!(price, ONE / u(2));
        assert_eq!(format_fixed(price, PRICE_DECIMALS).unwrap(), "0.5");

        let volume = volume(u(100), U256::ZERO, Some(ONE), 6).unwrap();
        assert_eq!(volume, u(100_000_000_000_000));
        assert_eq!(format_fixed(volume, PRICE_DECIMALS).unwrap(), "0.0001");
    }

    #[test]
    fn test_token1_in_token0_out() {
        let (a0, a1) = trade_amounts(U256::ZERO, u(30), u(10), U256::ZERO);
        assert_eq!((a0, a1), (u(10), u(30)));
        assert_eq!(unit_price(U256::ZERO, u(30), u(10), U256::ZERO), Some(ONE * u(3)));
    }

    #[test]
    fn test_both_directions_use_nonzero_amount_per_side() {
        // Both tokens in, nothing out: neither directional pattern matches
        let (a0, a1) = trade_amounts(u(7), u(5), U256::ZERO, U256::ZERO);
        assert_eq!((a0, a1), (u(7), u(5)));
        assert_eq!(unit_price(u(8), u(2), U256::ZERO, U256::ZERO), Some(ONE / u(4)));
    }

    #[test]
    fn test_no_token0_means_no_price() {
        assert_eq!(unit_price(U256::ZERO, u(5), U256::ZERO, u(1)), None);
    }

    #[test]
    fn test_volume_absent_without_price_or_amount() {
        assert_eq!(volume(u(100), U256::ZERO, None, 6), None);
        assert_eq!(volume(u(100), U256::ZERO, Some(U256::ZERO), 6), None);
        assert_eq!(volume(U256::ZERO, U256::ZERO, Some(ONE), 6), None);
    }

    #[test]
    fn test_format_fixed_whole_numbers() {
        assert_eq!(format_fixed(ONE * u(3), 18).unwrap(), "3");
        assert_eq!(format_fixed(u(1234), 0).unwrap(), "1234");
    }
}
