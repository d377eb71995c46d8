use crate::config::ChargeLimits;
use crate::models::{AttemptStatus, Invoice};

/// Guards against double charges and uncollectable stub balances.
#[derive(Debug, Clone, Copy)]
pub struct AmountValidator {
    min_remainder: i64,
}

impl AmountValidator {
    pub fn new(limits: ChargeLimits) -> Self {
        Self {
            min_remainder: limits.min_remainder,
        }
    }

    /// Balance still collectable once in-flight attempts are accounted for.
    ///
    /// Authorized or settled attempts count only while the invoice debit has
    /// not moved since they were made; processing debit pulls always count.
    pub fn adjusted_balance(&self, invoice: &Invoice, cached_balance: i64) -> i64 {
        let settled: i64 = invoice
            .payment_attempts
            .iter()
            .filter(|a| a.debit == invoice.debit)
            .filter(|a| {
                matches!(
                    a.status,
                    AttemptStatus::Succeeded | AttemptStatus::RequiresCapture
                )
            })
            .map(|a| a.amount_received)
            .sum();

        let processing: i64 = invoice
            .payment_attempts
            .iter()
            .filter(|a| a.status == AttemptStatus::Processing)
            .map(|a| a.amount)
            .sum();

        cached_balance - settled - processing
    }

    /// A charge of `requested` is allowed when the cached and ledger balances
    /// agree and it leaves either nothing or at least the minimum remainder.
    pub fn is_valid(
        &self,
        invoice: &Invoice,
        requested: i64,
        cached_balance: i64,
        open_balance: i64,
    ) -> bool {
        if cached_balance != open_balance {
            return false;
        }

        let remaining = self.adjusted_balance(invoice, cached_balance) - requested;
        remaining == 0 || remaining >= self.min_remainder
    }
}

impl Default for AmountValidator {
    fn default() -> Self {
        Self::new(ChargeLimits::default())
    }
}
