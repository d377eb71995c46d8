use std::sync::Arc;

use tracing::{debug, info};

use crate::error::PaymentError;
use crate::services::store::{compare_and_swap, InvoiceStore, Mutation};

/// Transactional mutex over an invoice's payable state.
///
/// Contention is reported immediately with [`PaymentError::InvoiceLocked`];
/// callers never wait for the lock.
#[derive(Clone)]
pub struct InvoiceLockManager {
    store: Arc<dyn InvoiceStore>,
    max_attempts: u32,
}

impl InvoiceLockManager {
    pub fn new(store: Arc<dyn InvoiceStore>, max_attempts: u32) -> Self {
        Self {
            store,
            max_attempts,
        }
    }

    pub async fn lock(&self, invoice_id: &str) -> Result<(), PaymentError> {
        compare_and_swap(self.store.as_ref(), invoice_id, self.max_attempts, |current| {
            let mut invoice =
                current.ok_or_else(|| PaymentError::InvoiceNotFound(invoice_id.to_string()))?;
            if invoice.locked {
                return Err(PaymentError::InvoiceLocked(invoice_id.to_string()));
            }
            invoice.locked = true;
            Ok(Mutation::Write(invoice, ()))
        })
        .await
        .inspect(|_| debug!(invoice_id = %invoice_id, "Invoice locked"))
        .inspect_err(|err| {
            if let PaymentError::InvoiceLocked(_) = err {
                info!(invoice_id = %invoice_id, "Invoice already locked");
            }
        })
    }

    /// Release the lock. Unlocking a deleted invoice is not an error.
    pub async fn unlock(&self, invoice_id: &str) -> Result<(), PaymentError> {
        compare_and_swap(self.store.as_ref(), invoice_id, self.max_attempts, |current| {
            Ok(match current {
                Some(mut invoice) if invoice.locked => {
                    invoice.locked = false;
                    Mutation::Write(invoice, ())
                }
                _ => Mutation::Abort(()),
            })
        })
        .await?;

        debug!(invoice_id = %invoice_id, "Invoice unlocked");
        Ok(())
    }
}
