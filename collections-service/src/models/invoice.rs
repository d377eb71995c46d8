//! Invoice document and the payment attempts recorded against it.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::ChargeStatus;

/// Payment-method family used to charge an invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethodFamily {
    Card,
    /// ACH pull from a US bank account.
    UsBankAccount,
    SepaDebit,
    BacsDebit,
    AcssDebit,
}

impl PaymentMethodFamily {
    /// Funds are pulled off-session and confirmed asynchronously.
    pub fn is_debit_pull(&self) -> bool {
        !matches!(self, PaymentMethodFamily::Card)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethodFamily::Card => "card",
            PaymentMethodFamily::UsBankAccount => "us_bank_account",
            PaymentMethodFamily::SepaDebit => "sepa_debit",
            PaymentMethodFamily::BacsDebit => "bacs_debit",
            PaymentMethodFamily::AcssDebit => "acss_debit",
        }
    }

    pub fn from_gateway_type(s: &str) -> Option<Self> {
        match s {
            "card" => Some(PaymentMethodFamily::Card),
            "us_bank_account" => Some(PaymentMethodFamily::UsBankAccount),
            "sepa_debit" => Some(PaymentMethodFamily::SepaDebit),
            "bacs_debit" => Some(PaymentMethodFamily::BacsDebit),
            "acss_debit" => Some(PaymentMethodFamily::AcssDebit),
            _ => None,
        }
    }
}

impl std::fmt::Display for PaymentMethodFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a payment attempt as last observed from the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Created,
    RequiresCapture,
    Processing,
    Succeeded,
    Failed,
    Canceled,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Created => "created",
            AttemptStatus::RequiresCapture => "requires_capture",
            AttemptStatus::Processing => "processing",
            AttemptStatus::Succeeded => "succeeded",
            AttemptStatus::Failed => "failed",
            AttemptStatus::Canceled => "canceled",
        }
    }
}

impl From<ChargeStatus> for AttemptStatus {
    fn from(status: ChargeStatus) -> Self {
        match status {
            ChargeStatus::RequiresPaymentMethod
            | ChargeStatus::RequiresConfirmation
            | ChargeStatus::RequiresAction => AttemptStatus::Created,
            ChargeStatus::RequiresCapture => AttemptStatus::RequiresCapture,
            ChargeStatus::Processing => AttemptStatus::Processing,
            ChargeStatus::Succeeded => AttemptStatus::Succeeded,
            ChargeStatus::Canceled => AttemptStatus::Canceled,
            ChargeStatus::Failed => AttemptStatus::Failed,
        }
    }
}

/// Surcharge invoice linked to a card payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkedFeeInvoice {
    pub number: String,
    pub amount_fees: i64,
}

/// One charge attempt against an invoice. Appended once, then only its status
/// and settlement fields change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentAttempt {
    /// Gateway-assigned charge id.
    pub id: String,
    /// Amount requested against the invoice, excluding fees.
    pub amount: i64,
    pub amount_with_fees: i64,
    pub amount_received: i64,
    pub currency: String,
    pub status: AttemptStatus,
    pub family: PaymentMethodFamily,
    /// Invoice debit when the attempt was made.
    pub debit: i64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub linked_fee_invoice: Option<LinkedFeeInvoice>,
    #[serde(default)]
    pub draft_receipt_id: Option<String>,
    #[serde(default)]
    pub receipt_id: Option<String>,
    #[serde(default)]
    pub canceled_at: Option<DateTime<Utc>>,
}

/// Invoice document in the system of record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    #[serde(rename = "_id")]
    pub id: String,
    /// Invoice number in the ledger.
    pub number: String,
    pub payer_id: String,
    pub customer_id: String,
    pub ledger_company: String,
    /// Customer id in the ledger.
    pub ledger_customer: String,
    /// Currency symbol, e.g. "USD".
    pub currency: String,
    pub total: i64,
    pub tax: i64,
    /// Outstanding balance in minor units, as last synced from the ledger.
    pub debit: i64,
    #[serde(default)]
    pub details: String,
    pub date: NaiveDate,
    pub pay_date: NaiveDate,
    #[serde(default)]
    pub paid: bool,
    #[serde(default)]
    pub canceled: bool,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub payment_attempts: Vec<PaymentAttempt>,
    /// Optimistic-concurrency counter, bumped on every committed write.
    #[serde(default)]
    pub version: i64,
}

impl Invoice {
    pub fn attempt(&self, charge_id: &str) -> Option<&PaymentAttempt> {
        self.payment_attempts.iter().find(|a| a.id == charge_id)
    }

    pub fn attempt_mut(&mut self, charge_id: &str) -> Option<&mut PaymentAttempt> {
        self.payment_attempts.iter_mut().find(|a| a.id == charge_id)
    }

    /// Not canceled, not paid and with something left to collect.
    pub fn has_open_debit(&self) -> bool {
        !self.canceled && !self.paid && self.debit > 0
    }

    /// Reduce the cached balance by a settled amount.
    pub fn apply_payment(&mut self, amount: i64) {
        self.debit = (self.debit - amount).max(0);
        if self.debit == 0 {
            self.paid = true;
        }
    }
}
