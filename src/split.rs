use anyhow::{bail, Result};
use serde::Serialize;

use crate::config::Payment;

/// The settlement token carries 6 decimal places.
pub const MINOR_UNITS_PER_TOKEN: u64 = 1_000_000;

/// How a fee divides across the configured recipients, in integer minor
/// units. `referral_commission + sum(amounts) == total`; the final recipient
/// absorbs the rounding remainder so no minor unit is lost or invented.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeeSplit {
    pub referral_commission: u64,
    pub amounts: Vec<u64>,
    pub total: u64,
}

impl FeeSplit {
    pub fn allocated(&self) -> u64 {
        self.referral_commission + self.amounts.iter().sum::<u64>()
    }
}

pub fn to_minor_units(fee: f64) -> u64 {
    (fee * MINOR_UNITS_PER_TOKEN as f64).round() as u64
}

/// Split the configured fee across the recipient list, taking the referral
/// commission off the top when a referrer is present.
///
/// Percentages that don't sum to 100 are a configuration error and are
/// reported, never silently corrected.
pub fn compute(payment: &Payment, with_referrer: bool) -> Result<FeeSplit> {
    if payment.recipients.is_empty() {
        bail!("no payment recipients configured");
    }
    let pct_sum: u64 = payment.recipients.iter().map(|r| r.percent).sum();
    if pct_sum != 100 {
        bail!("recipient percentages sum to {pct_sum}, expected 100");
    }
    if payment.referral_percent > 100 {
        bail!("referral percentage {} exceeds 100", payment.referral_percent);
    }
    if !payment.fee.is_finite() || payment.fee < 0.0 {
        bail!("invalid fee amount {}", payment.fee);
    }

    let total = to_minor_units(payment.fee);
    let referral_commission = if with_referrer {
        total * payment.referral_percent / 100
    } else {
        0
    };
    let remaining = total - referral_commission;

    let mut amounts = Vec::with_capacity(payment.recipients.len());
    let mut assigned = 0u64;
    for r in &payment.recipients[..payment.recipients.len() - 1] {
        let share = remaining * r.percent / 100;
        assigned += share;
        amounts.push(share);
    }
    // Remainder absorption: floor division above can under-allocate.
    amounts.push(remaining - assigned);

    Ok(FeeSplit { referral_commission, amounts, total })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Recipient;

    fn payment(fee: f64, percents: &[u64]) -> Payment {
        Payment {
            fee,
            mint: "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v".into(),
            recipients: percents
                .iter()
                .map(|p| Recipient { address: format!("wallet-{p}"), percent: *p })
                .collect(),
            referral_percent: 10,
            recency_secs: 300,
            tolerance_percent: 1,
        }
    }

    #[test]
    fn even_split_without_referrer() {
        let s = compute(&payment(0.30, &[50, 50]), false).unwrap();
        assert_eq!(s.total, 300_000);
        assert_eq!(s.referral_commission, 0);
        assert_eq!(s.amounts, vec![150_000, 150_000]);
        assert_eq!(s.allocated(), s.total);
    }

    #[test]
    fn referrer_takes_commission_off_the_top() {
        let s = compute(&payment(0.30, &[50, 50]), true).unwrap();
        assert_eq!(s.total, 300_000);
        assert_eq!(s.referral_commission, 30_000);
        assert_eq!(s.amounts, vec![135_000, 135_000]);
        assert_eq!(s.allocated(), s.total);
    }

    #[test]
    fn last_recipient_absorbs_remainder() {
        // 100001 minor units at 33/33/34: floor shares under-allocate.
        let s = compute(&payment(0.100_001, &[33, 33, 34]), false).unwrap();
        assert_eq!(s.total, 100_001);
        assert_eq!(s.amounts[0], 33_000);
        assert_eq!(s.amounts[1], 33_000);
        assert_eq!(s.amounts[2], 34_001);
        assert_eq!(s.allocated(), s.total);
    }

    #[test]
    fn split_invariant_holds_with_referrer_and_odd_totals() {
        for fee in [0.01, 0.07, 0.333_333, 1.0, 2.499_999] {
            for with_ref in [false, true] {
                let s = compute(&payment(fee, &[70, 30]), with_ref).unwrap();
                assert_eq!(s.allocated(), s.total, "fee={fee} referrer={with_ref}");
            }
        }
    }

    #[test]
    fn zero_fee_yields_all_zero_split() {
        let s = compute(&payment(0.0, &[50, 50]), true).unwrap();
        assert_eq!(s.total, 0);
        assert_eq!(s.referral_commission, 0);
        assert_eq!(s.amounts, vec![0, 0]);
    }

    #[test]
    fn bad_percentage_sum_is_reported() {
        let err = compute(&payment(0.30, &[50, 40]), false).unwrap_err();
        assert!(err.to_string().contains("sum to 90"));
    }

    #[test]
    fn empty_recipient_list_is_rejected() {
        let mut p = payment(0.30, &[100]);
        p.recipients.clear();
        assert!(compute(&p, false).is_err());
    }
}
