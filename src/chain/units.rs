//! Fixed-point conversion for 18-decimal contract values.

use alloy_primitives::U256;

/// Implied decimals of every value returned by the claim contract
pub const BASE_UNIT_DECIMALS: u32 = 18;

/// Places used for token amounts (allocation, consumed, claimed)
pub const AMOUNT_PLACES: u32 = 2;

/// Places used for fractions (part percentage, initial unlock)
pub const FRACTION_PLACES: u32 = 4;

/// Format a base-unit value as a decimal string with `places` digits,
/// rounding half up.
///
/// Runs entirely in integer arithmetic, so `854700000000000000000` always
/// becomes `"854.70"` with no float drift.
pub fn format_fixed(value: U256, places: u32) -> String {
    let places = places.min(BASE_UNIT_DECIMALS);
    let divisor = U256::from(10u64).pow(U256::from(BASE_UNIT_DECIMALS - places));
    let half = divisor / U256::from(2u64);
    let scaled = value.saturating_add(half) / divisor;

    if places == 0 {
        return scaled.to_string();
    }

    let unit = U256::from(10u64).pow(U256::from(places));
    let whole = scaled / unit;
    let frac = scaled % unit;

    format!(
        "{}.{:0width$}",
        whole,
        frac.to::<u64>(),
        width = places as usize
    )
}

/// Amount formatting (2 places)
pub fn format_amount(value: U256) -> String {
    format_fixed(value, AMOUNT_PLACES)
}

/// Fraction formatting (4 places)
pub fn format_fraction(value: U256) -> String {
    format_fixed(value, FRACTION_PLACES)
}
