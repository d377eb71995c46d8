//! Card surcharge calculation.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

use crate::config::FeePolicy;
use crate::models::{Customer, Payer};

#[derive(Debug, Clone)]
pub struct FeeCalculator {
    policy: FeePolicy,
}

impl FeeCalculator {
    pub fn new(policy: FeePolicy) -> Self {
        Self { policy }
    }

    /// Whether a card payment of `amount` in `currency` is exempt from
    /// surcharge, and the percent to apply when it is not.
    pub fn exempt(
        &self,
        customer: &Customer,
        payer: &Payer,
        currency: &str,
        amount: i64,
    ) -> (bool, Decimal) {
        if customer.surcharge_opt_out {
            return (true, Decimal::ZERO);
        }

        if let Some(percent) = self
            .policy
            .currency_overrides
            .get(&currency.to_ascii_uppercase())
        {
            return (false, *percent);
        }

        let state = payer.state.as_deref().unwrap_or_default();
        let in_exempt_region = self.policy.exempt_regions.iter().any(|(country, region)| {
            payer.country.eq_ignore_ascii_case(country) && state.eq_ignore_ascii_case(region)
        });
        if in_exempt_region {
            return (true, Decimal::ZERO);
        }

        if amount < self.policy.exempt_below {
            return (true, Decimal::ZERO);
        }

        (false, self.policy.default_percent)
    }

    /// Gross-up fee so that charging `amount + fee` and losing `percent` to
    /// the processor nets `amount`.
    pub fn total_fee(&self, amount: i64, percent: Decimal) -> i64 {
        total_fee(amount, percent)
    }

    /// Tax on the surcharge itself. Export transactions carry none.
    pub fn fee_tax(&self, fee: i64, payer: &Payer) -> i64 {
        if fee <= 0 || payer.is_export() {
            return 0;
        }

        let Some(rate) = self.policy.fee_tax_rates.get(&payer.company_country) else {
            return 0;
        };

        (Decimal::from(fee) * rate)
            .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
            .to_i64()
            .unwrap_or_default()
    }
}

impl Default for FeeCalculator {
    fn default() -> Self {
        Self::new(FeePolicy::default())
    }
}

pub fn total_fee(amount: i64, percent: Decimal) -> i64 {
    if amount <= 0 || percent <= Decimal::ZERO || percent >= Decimal::ONE_HUNDRED {
        return 0;
    }

    let net_share = Decimal::ONE - percent / Decimal::ONE_HUNDRED;
    let gross = (Decimal::from(amount) / net_share)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .unwrap_or(amount);

    gross - amount
}
