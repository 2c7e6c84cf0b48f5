// =============================================================================
// Money helpers — Decimal conversions with explicit store-boundary rounding
// =============================================================================
//
// Balances, notionals, fees and PnL are `rust_decimal::Decimal`; ratios and
// indicator math stay `f64`. Rounding is applied exactly once, where a value
// crosses into the accounting domain: prices to 6 dp, sizes to 8 dp.
// =============================================================================

use rust_decimal::prelude::*;
use rust_decimal::Decimal;

/// Decimal places kept for prices at store boundaries.
pub const PRICE_DP: u32 = 6;
/// Decimal places kept for quantities at store boundaries.
pub const QTY_DP: u32 = 8;

/// Convert an f64 price into a 6-dp `Decimal`.
pub fn price(value: f64) -> Decimal {
    Decimal::from_f64_retain(value)
        .unwrap_or_default()
        .round_dp(PRICE_DP)
}

/// Convert an f64 quantity into an 8-dp `Decimal`.
pub fn qty(value: f64) -> Decimal {
    Decimal::from_f64_retain(value)
        .unwrap_or_default()
        .round_dp(QTY_DP)
}

/// Convert an f64 quote-currency amount (fees, PnL, balances) into an 8-dp
/// `Decimal`.
pub fn usd(value: f64) -> Decimal {
    Decimal::from_f64_retain(value)
        .unwrap_or_default()
        .round_dp(QTY_DP)
}

/// Back to f64 for ratio math. Accounting never round-trips through this; it
/// exists for sizing formulas and display only.
pub fn to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn price_rounds_to_six_places() {
        assert_eq!(price(60000.123456789), dec!(60000.123457));
    }

    #[test]
    fn qty_rounds_to_eight_places() {
        assert_eq!(qty(0.123456789123), dec!(0.12345679));
    }

    #[test]
    fn non_finite_maps_to_zero() {
        assert_eq!(price(f64::NAN), Decimal::ZERO);
        assert_eq!(usd(f64::INFINITY), Decimal::ZERO);
    }

    #[test]
    fn round_trip_is_close() {
        let v = 1234.567891;
        assert!((to_f64(price(v)) - v).abs() < 1e-6);
    }
}
