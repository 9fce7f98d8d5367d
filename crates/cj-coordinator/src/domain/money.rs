//! Fee rates and amount ranges.

use std::fmt;

use bitcoin::Amount;
use serde::{Deserialize, Serialize};

/// Mining fee rate in satoshis per 1000 virtual bytes.
///
/// Fees are rounded up so a transaction priced at a rate never pays less than it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FeeRate {
    sat_per_kvb: u64,
}

impl FeeRate {
    pub const ZERO: FeeRate = FeeRate { sat_per_kvb: 0 };

    pub const fn from_sat_per_kvb(sat_per_kvb: u64) -> Self {
        Self { sat_per_kvb }
    }

    pub const fn from_sat_per_vb(sat_per_vb: u64) -> Self {
        Self {
            sat_per_kvb: sat_per_vb * 1000,
        }
    }

    /// Rate implied by paying `fee` for `vsize` virtual bytes (rounded down).
    pub fn from_fee(fee: Amount, vsize: u64) -> Self {
        if vsize == 0 {
            return Self::ZERO;
        }
        let sat_per_kvb = (fee.to_sat() as u128 * 1000 / vsize as u128).min(u64::MAX as u128);
        Self {
            sat_per_kvb: sat_per_kvb as u64,
        }
    }

    pub fn sat_per_kvb(&self) -> u64 {
        self.sat_per_kvb
    }

    pub fn fee_for(&self, vsize: u64) -> Amount {
        let sats = (self.sat_per_kvb as u128 * vsize as u128).div_ceil(1000);
        Amount::from_sat(sats.min(u64::MAX as u128) as u64)
    }
}

impl fmt::Display for FeeRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:03} sat/vB", self.sat_per_kvb / 1000, self.sat_per_kvb % 1000)
    }
}

/// Coordination fee charged on registered input value.
///
/// Inputs at or below `plebs_dont_pay_threshold` are not charged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinationFeeRate {
    /// Parts per million of the input amount
    pub rate_ppm: u64,
    pub plebs_dont_pay_threshold: Amount,
}

impl CoordinationFeeRate {
    pub const FREE: CoordinationFeeRate = CoordinationFeeRate {
        rate_ppm: 0,
        plebs_dont_pay_threshold: Amount::ZERO,
    };

    pub fn new(rate_ppm: u64, plebs_dont_pay_threshold: Amount) -> Self {
        Self {
            rate_ppm,
            plebs_dont_pay_threshold,
        }
    }

    pub fn is_waived_for(&self, amount: Amount) -> bool {
        amount <= self.plebs_dont_pay_threshold
    }

    pub fn get_fee(&self, amount: Amount) -> Amount {
        if self.is_waived_for(amount) {
            return Amount::ZERO;
        }
        let sats = amount.to_sat() as u128 * self.rate_ppm as u128 / 1_000_000;
        Amount::from_sat(sats as u64)
    }
}

/// Inclusive amount range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoneyRange {
    pub min: Amount,
    pub max: Amount,
}

impl MoneyRange {
    pub fn new(min: Amount, max: Amount) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, amount: Amount) -> bool {
        amount >= self.min && amount <= self.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fee_rounds_up() {
        let rate = FeeRate::from_sat_per_kvb(1_500);
        assert_eq!(rate.fee_for(1), Amount::from_sat(2));
        assert_eq!(rate.fee_for(2), Amount::from_sat(3));
        assert_eq!(FeeRate::from_sat_per_vb(5).fee_for(69), Amount::from_sat(345));
    }

    #[test]
    fn test_from_fee_is_inverse_for_whole_rates() {
        let rate = FeeRate::from_fee(Amount::from_sat(1_000), 200);
        assert_eq!(rate, FeeRate::from_sat_per_vb(5));
        assert_eq!(FeeRate::from_fee(Amount::from_sat(10), 0), FeeRate::ZERO);
    }

    #[test]
    fn test_coordination_fee_waived_below_threshold() {
        let rate = CoordinationFeeRate::new(3_000, Amount::from_sat(1_000_000));
        assert_eq!(rate.get_fee(Amount::from_sat(1_000_000)), Amount::ZERO);
        assert_eq!(rate.get_fee(Amount::from_sat(5_000_000)), Amount::from_sat(15_000));
    }

    #[test]
    fn test_money_range_is_inclusive() {
        let range = MoneyRange::new(Amount::from_sat(10), Amount::from_sat(20));
        assert!(range.contains(Amount::from_sat(10)));
        assert!(range.contains(Amount::from_sat(20)));
        assert!(!range.contains(Amount::from_sat(21)));
    }

    #[test]
    fn test_display() {
        assert_eq!(FeeRate::from_sat_per_kvb(5_250).to_string(), "5.250 sat/vB");
    }
}
