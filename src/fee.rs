//! Fee calculation utilities
//!
//! Rates are basis points: 100 = 1.00%

use crate::core_types::Cents;

/// Basis-point precision (10^4)
pub const BPS_PRECISION: i64 = 10_000;

/// Fee on a positive amount in cents.
///
/// Uses i128 intermediate to prevent overflow. A positive rate on a positive
/// amount always charges at least 1 cent.
///
/// # Example
/// ```
/// use spendguard::fee::calculate_fee;
/// // $100.00 at 0.25% = 25 cents
/// assert_eq!(calculate_fee(10_000, 25), 25);
/// ```
#[inline]
pub fn calculate_fee(amount_cents: Cents, rate_bps: i64) -> Cents {
    if amount_cents <= 0 || rate_bps <= 0 {
        return 0;
    }
    let fee = (amount_cents as i128 * rate_bps as i128) / BPS_PRECISION as i128;
    if fee == 0 { 1 } else { fee.min(Cents::MAX as i128) as Cents }
}

/// Percentage fee plus a flat component
#[inline]
pub fn calculate_fee_with_flat(amount_cents: Cents, rate_bps: i64, flat_cents: Cents) -> Cents {
    if amount_cents <= 0 {
        return 0;
    }
    calculate_fee(amount_cents, rate_bps).saturating_add(flat_cents.max(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calculate_fee_basic() {
        assert_eq!(calculate_fee(10_000, 100), 100);
        assert_eq!(calculate_fee(2_000, 25), 5);
    }

    #[test]
    fn test_calculate_fee_small_amount() {
        // Rounds to 0 -> minimum fee is 1
        assert_eq!(calculate_fee(10, 25), 1);
    }

    #[test]
    fn test_calculate_fee_zero() {
        assert_eq!(calculate_fee(0, 100), 0);
        assert_eq!(calculate_fee(10_000, 0), 0);
        assert_eq!(calculate_fee(-500, 100), 0);
    }

    #[test]
    fn test_flat_component() {
        assert_eq!(calculate_fee_with_flat(10_000, 0, 30), 30);
        assert_eq!(calculate_fee_with_flat(10_000, 100, 30), 130);
        assert_eq!(calculate_fee_with_flat(0, 100, 30), 0);
    }

    #[test]
    fn test_no_overflow() {
        assert_eq!(calculate_fee(Cents::MAX, BPS_PRECISION), Cents::MAX);
    }
}
