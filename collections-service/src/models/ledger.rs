use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Point-in-time read of what the ledger says is still owed on an invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenBalance {
    pub invoice_number: String,
    pub debit: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    Draft,
    Approved,
    Deleted,
}

/// Surcharge invoice to open in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewFeeInvoice {
    pub company: String,
    /// Ledger customer the fee is billed to.
    pub customer: String,
    pub currency: String,
    pub amount: i64,
    pub tax: i64,
    /// Number of the invoice the surcharge belongs to.
    pub reference: String,
    pub details: String,
    pub date: NaiveDate,
}

/// Invoice as stored in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerInvoice {
    pub number: String,
    pub company: String,
    pub amount: i64,
    pub tax: i64,
    pub total_after_tax: i64,
    pub status: ReceiptStatus,
}

pub type DraftFeeInvoice = LedgerInvoice;

/// Receipt to open in the ledger for money collected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewReceipt {
    pub company: String,
    pub customer: String,
    pub currency: String,
    /// Total collected, fees included.
    pub amount: i64,
    pub invoice_number: String,
    pub fee_invoice_number: Option<String>,
    /// Gateway charge id, when the charge already exists.
    pub charge_id: Option<String>,
    pub date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerReceipt {
    pub id: String,
    pub company: String,
    pub total: i64,
    pub status: ReceiptStatus,
}

pub type DraftReceipt = LedgerReceipt;

/// An open-item line on a receipt, matched against an invoice by reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentLine {
    /// Invoice number the line settles.
    pub reference: String,
    pub trans: i64,
    pub line: i64,
    /// Amount credited against the referenced invoice.
    pub credit: i64,
    pub paid: bool,
}
