//! Accounting ledger seam and the draft-document lifecycle around a payment.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use tracing::{error, info, warn};

use crate::error::{LedgerError, PaymentError};
use crate::models::{
    DraftFeeInvoice, DraftReceipt, Invoice, LedgerInvoice, LedgerReceipt, NewFeeInvoice,
    NewReceipt, OpenBalance, PaymentLine, ReceiptStatus,
};

/// Ledger client operations used by the collections engine.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Open balance of an invoice, or `None` once the ledger shows it settled.
    async fn open_balance(
        &self,
        company: &str,
        customer: &str,
        invoice_number: &str,
    ) -> Result<Option<OpenBalance>, LedgerError>;

    async fn create_invoice(&self, invoice: NewFeeInvoice) -> Result<LedgerInvoice, LedgerError>;

    /// Finalize a draft invoice. The approved invoice gets its final number.
    async fn approve_invoice(
        &self,
        company: &str,
        number: &str,
    ) -> Result<LedgerInvoice, LedgerError>;

    async fn delete_invoice(&self, company: &str, number: &str) -> Result<(), LedgerError>;

    async fn create_receipt(&self, receipt: NewReceipt) -> Result<LedgerReceipt, LedgerError>;

    /// Open-item lines of a receipt whose reference is one of `references`.
    async fn receipt_payment_lines(
        &self,
        company: &str,
        receipt_id: &str,
        references: &[String],
    ) -> Result<Vec<PaymentLine>, LedgerError>;

    /// Mark a receipt line as paid.
    async fn flag_payment_line(
        &self,
        company: &str,
        receipt_id: &str,
        line: &PaymentLine,
    ) -> Result<(), LedgerError>;

    /// All credit lines of a receipt.
    async fn receipt_credit_lines(
        &self,
        company: &str,
        receipt_id: &str,
    ) -> Result<Vec<PaymentLine>, LedgerError>;

    async fn set_line_credit(
        &self,
        company: &str,
        receipt_id: &str,
        line: &PaymentLine,
        credit: i64,
    ) -> Result<(), LedgerError>;

    /// Finalize a draft receipt. The approved receipt gets its final id.
    async fn approve_receipt(
        &self,
        company: &str,
        receipt_id: &str,
    ) -> Result<LedgerReceipt, LedgerError>;

    async fn delete_receipt(&self, company: &str, receipt_id: &str) -> Result<(), LedgerError>;
}

/// Creates, patches, approves and deletes the ledger documents that record a
/// payment.
#[derive(Clone)]
pub struct LedgerReceiptCoordinator {
    ledger: Arc<dyn Ledger>,
}

impl LedgerReceiptCoordinator {
    pub fn new(ledger: Arc<dyn Ledger>) -> Self {
        Self { ledger }
    }

    pub async fn open_balance(&self, invoice: &Invoice) -> Result<Option<i64>, PaymentError> {
        let snapshot = self
            .ledger
            .open_balance(&invoice.ledger_company, &invoice.ledger_customer, &invoice.number)
            .await?;
        Ok(snapshot.map(|balance| balance.debit))
    }

    pub async fn create_fee_invoice(
        &self,
        invoice: &Invoice,
        fee: i64,
        tax: i64,
        date: NaiveDate,
    ) -> Result<DraftFeeInvoice, PaymentError> {
        let draft = self
            .ledger
            .create_invoice(NewFeeInvoice {
                company: invoice.ledger_company.clone(),
                customer: invoice.ledger_customer.clone(),
                currency: invoice.currency.clone(),
                amount: fee,
                tax,
                reference: invoice.number.clone(),
                details: format!("Card processing fee for invoice {}", invoice.number),
                date,
            })
            .await?;

        info!(
            invoice_id = %invoice.id,
            fee_invoice = %draft.number,
            amount = fee,
            "Created draft fee invoice"
        );
        Ok(draft)
    }

    pub async fn approve_fee_invoice(
        &self,
        draft: &DraftFeeInvoice,
    ) -> Result<LedgerInvoice, PaymentError> {
        let approved = self
            .ledger
            .approve_invoice(&draft.company, &draft.number)
            .await?;
        info!(fee_invoice = %approved.number, "Fee invoice approved");
        Ok(approved)
    }

    pub async fn delete_fee_invoice(&self, draft: &DraftFeeInvoice) -> Result<(), PaymentError> {
        self.ledger
            .delete_invoice(&draft.company, &draft.number)
            .await?;
        info!(fee_invoice = %draft.number, "Deleted draft fee invoice");
        Ok(())
    }

    pub async fn create_receipt(
        &self,
        invoice: &Invoice,
        amount: i64,
        fee_invoice_number: Option<&str>,
        charge_id: Option<&str>,
        date: NaiveDate,
    ) -> Result<DraftReceipt, PaymentError> {
        let receipt = self
            .ledger
            .create_receipt(NewReceipt {
                company: invoice.ledger_company.clone(),
                customer: invoice.ledger_customer.clone(),
                currency: invoice.currency.clone(),
                amount,
                invoice_number: invoice.number.clone(),
                fee_invoice_number: fee_invoice_number.map(str::to_string),
                charge_id: charge_id.map(str::to_string),
                date,
            })
            .await?;

        info!(
            invoice_id = %invoice.id,
            receipt_id = %receipt.id,
            amount,
            "Created draft receipt"
        );
        Ok(receipt)
    }

    /// Flag the receipt lines that settle the invoice (and its fee invoice)
    /// and, for a partial payment, set the invoice's credit to what was paid
    /// towards it.
    pub async fn patch_receipt(
        &self,
        receipt: &DraftReceipt,
        invoice_number: &str,
        fee_invoice_number: Option<&str>,
        partial_payment: bool,
    ) -> Result<(), PaymentError> {
        let mut references = vec![invoice_number.to_string()];
        if let Some(fee_number) = fee_invoice_number {
            references.push(fee_number.to_string());
        }
        let expected = references.len();

        let lines = self
            .ledger
            .receipt_payment_lines(&receipt.company, &receipt.id, &references)
            .await?;

        if lines.len() != expected {
            error!(
                alert = true,
                receipt_id = %receipt.id,
                invoice_number,
                expected,
                found = lines.len(),
                "Receipt payment lines do not match invoice references"
            );
            return Err(PaymentError::ReceiptCreateFailed(format!(
                "receipt {} has {} matching lines, expected {}",
                receipt.id,
                lines.len(),
                expected
            )));
        }

        for line in &lines {
            self.ledger
                .flag_payment_line(&receipt.company, &receipt.id, line)
                .await?;
        }

        if !partial_payment {
            return Ok(());
        }

        let credit_lines = self
            .ledger
            .receipt_credit_lines(&receipt.company, &receipt.id)
            .await?;

        if credit_lines.len() != expected {
            error!(
                alert = true,
                receipt_id = %receipt.id,
                expected,
                found = credit_lines.len(),
                "Receipt credit lines do not match invoice references"
            );
            return Err(PaymentError::ReceiptUpdatePartial(receipt.id.clone()));
        }

        let mut invoice_line = None;
        let mut credit = receipt.total;
        for line in &credit_lines {
            if line.reference == invoice_number {
                invoice_line = Some(line);
            } else if Some(line.reference.as_str()) == fee_invoice_number {
                credit -= line.credit;
            } else {
                error!(
                    alert = true,
                    receipt_id = %receipt.id,
                    reference = %line.reference,
                    "Unexpected credit line on receipt"
                );
                return Err(PaymentError::ReceiptUpdatePartial(receipt.id.clone()));
            }
        }

        let invoice_line =
            invoice_line.ok_or_else(|| PaymentError::ReceiptUpdatePartial(receipt.id.clone()))?;

        self.ledger
            .set_line_credit(&receipt.company, &receipt.id, invoice_line, credit)
            .await?;

        info!(receipt_id = %receipt.id, credit, "Set partial payment credit");
        Ok(())
    }

    pub async fn approve_receipt(&self, receipt: &DraftReceipt) -> Result<LedgerReceipt, PaymentError> {
        let approved = self
            .ledger
            .approve_receipt(&receipt.company, &receipt.id)
            .await?;
        info!(
            draft_receipt_id = %receipt.id,
            receipt_id = %approved.id,
            "Receipt approved"
        );
        Ok(approved)
    }

    /// Delete a receipt that is still a draft. Approved receipts are left alone.
    pub async fn delete_receipt(&self, receipt: &DraftReceipt) -> Result<(), PaymentError> {
        if receipt.status != ReceiptStatus::Draft {
            warn!(receipt_id = %receipt.id, "Refusing to delete non-draft receipt");
            return Ok(());
        }

        self.ledger
            .delete_receipt(&receipt.company, &receipt.id)
            .await?;
        info!(receipt_id = %receipt.id, "Deleted draft receipt");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Serves fixed receipt lines and records writes.
    #[derive(Default)]
    struct ScriptedLedger {
        payment_lines: Vec<PaymentLine>,
        credit_lines: Vec<PaymentLine>,
        flagged: Mutex<Vec<String>>,
        credits: Mutex<Vec<(String, i64)>>,
        deleted: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Ledger for ScriptedLedger {
        async fn open_balance(
            &self,
            _: &str,
            _: &str,
            _: &str,
        ) -> Result<Option<OpenBalance>, LedgerError> {
            Ok(None)
        }

        async fn create_invoice(&self, _: NewFeeInvoice) -> Result<LedgerInvoice, LedgerError> {
            Err(LedgerError::Unavailable("not scripted".to_string()))
        }

        async fn approve_invoice(&self, _: &str, _: &str) -> Result<LedgerInvoice, LedgerError> {
            Err(LedgerError::Unavailable("not scripted".to_string()))
        }

        async fn delete_invoice(&self, _: &str, _: &str) -> Result<(), LedgerError> {
            Ok(())
        }

        async fn create_receipt(&self, _: NewReceipt) -> Result<LedgerReceipt, LedgerError> {
            Err(LedgerError::Unavailable("not scripted".to_string()))
        }

        async fn receipt_payment_lines(
            &self,
            _: &str,
            _: &str,
            references: &[String],
        ) -> Result<Vec<PaymentLine>, LedgerError> {
            Ok(self
                .payment_lines
                .iter()
                .filter(|l| references.contains(&l.reference))
                .cloned()
                .collect())
        }

        async fn flag_payment_line(
            &self,
            _: &str,
            _: &str,
            line: &PaymentLine,
        ) -> Result<(), LedgerError> {
            self.flagged.lock().unwrap().push(line.reference.clone());
            Ok(())
        }

        async fn receipt_credit_lines(&self, _: &str, _: &str) -> Result<Vec<PaymentLine>, LedgerError> {
            Ok(self.credit_lines.clone())
        }

        async fn set_line_credit(
            &self,
            _: &str,
            _: &str,
            line: &PaymentLine,
            credit: i64,
        ) -> Result<(), LedgerError> {
            self.credits
                .lock()
                .unwrap()
                .push((line.reference.clone(), credit));
            Ok(())
        }

        async fn approve_receipt(&self, _: &str, _: &str) -> Result<LedgerReceipt, LedgerError> {
            Err(LedgerError::Unavailable("not scripted".to_string()))
        }

        async fn delete_receipt(&self, _: &str, receipt_id: &str) -> Result<(), LedgerError> {
            self.deleted.lock().unwrap().push(receipt_id.to_string());
            Ok(())
        }
    }

    fn line(reference: &str, kline: i64, credit: i64) -> PaymentLine {
        PaymentLine {
            reference: reference.to_string(),
            trans: 100,
            line: kline,
            credit,
            paid: false,
        }
    }

    fn draft_receipt(total: i64) -> DraftReceipt {
        DraftReceipt {
            id: "T100".to_string(),
            company: "acme".to_string(),
            total,
            status: ReceiptStatus::Draft,
        }
    }

    #[tokio::test]
    async fn test_patch_flags_invoice_and_fee_lines() {
        let ledger = Arc::new(ScriptedLedger {
            payment_lines: vec![line("IV1", 1, 10_000), line("FEE1", 2, 300), line("IV9", 3, 50)],
            ..Default::default()
        });
        let coordinator = LedgerReceiptCoordinator::new(ledger.clone());

        coordinator
            .patch_receipt(&draft_receipt(10_300), "IV1", Some("FEE1"), false)
            .await
            .unwrap();

        assert_eq!(*ledger.flagged.lock().unwrap(), vec!["IV1", "FEE1"]);
        assert!(ledger.credits.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_patch_rejects_missing_fee_line() {
        let ledger = Arc::new(ScriptedLedger {
            payment_lines: vec![line("IV1", 1, 10_000)],
            ..Default::default()
        });
        let coordinator = LedgerReceiptCoordinator::new(ledger.clone());

        let result = coordinator
            .patch_receipt(&draft_receipt(10_300), "IV1", Some("FEE1"), false)
            .await;

        assert!(matches!(result, Err(PaymentError::ReceiptCreateFailed(_))));
        assert!(ledger.flagged.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_partial_payment_credit_excludes_fee() {
        let ledger = Arc::new(ScriptedLedger {
            payment_lines: vec![line("IV1", 1, 10_000), line("FEE1", 2, 120)],
            credit_lines: vec![line("IV1", 1, 10_000), line("FEE1", 2, 120)],
            ..Default::default()
        });
        let coordinator = LedgerReceiptCoordinator::new(ledger.clone());

        coordinator
            .patch_receipt(&draft_receipt(4_120), "IV1", Some("FEE1"), true)
            .await
            .unwrap();

        assert_eq!(*ledger.credits.lock().unwrap(), vec![("IV1".to_string(), 4_000)]);
    }

    #[tokio::test]
    async fn test_partial_payment_with_foreign_line_fails() {
        let ledger = Arc::new(ScriptedLedger {
            payment_lines: vec![line("IV1", 1, 10_000)],
            credit_lines: vec![line("IV7", 1, 10_000)],
            ..Default::default()
        });
        let coordinator = LedgerReceiptCoordinator::new(ledger.clone());

        let result = coordinator
            .patch_receipt(&draft_receipt(4_000), "IV1", None, true)
            .await;

        assert!(matches!(result, Err(PaymentError::ReceiptUpdatePartial(_))));
    }

    #[tokio::test]
    async fn test_only_drafts_are_deleted() {
        let ledger = Arc::new(ScriptedLedger::default());
        let coordinator = LedgerReceiptCoordinator::new(ledger.clone());

        let mut approved = draft_receipt(100);
        approved.id = "RC100".to_string();
        approved.status = ReceiptStatus::Approved;

        coordinator.delete_receipt(&approved).await.unwrap();
        coordinator.delete_receipt(&draft_receipt(100)).await.unwrap();

        assert_eq!(*ledger.deleted.lock().unwrap(), vec!["T100"]);
    }
}
