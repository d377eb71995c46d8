use service_core::error::AppError;
use service_core::utils::signature::SignatureError;
use thiserror::Error;

use crate::models::{ChargeStatus, PaymentMethodFamily};

/// Errors surfaced by the collections engine.
#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("invalid invoice: {0}")]
    InvalidInvoice(String),

    #[error("invoice {0} is locked")]
    InvoiceLocked(String),

    #[error("invoice {0} not found")]
    InvoiceNotFound(String),

    #[error("payer {0} not found")]
    PayerNotFound(String),

    #[error("payment method {0} is the default; set another default before detaching")]
    DetachDefaultPaymentMethod(String),

    #[error("payment method disabled: {0}")]
    PaymentMethodDisabled(String),

    #[error("invalid payment method: {0}")]
    InvalidPaymentMethod(String),

    #[error("online payments are unavailable for {0}")]
    OnlinePaymentsUnavailable(PaymentMethodFamily),

    #[error("invalid currency: {0}")]
    InvalidCurrency(String),

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error(
        "amount mismatch on invoice {invoice_id}: requested {requested}, cached {cached}, open {open}"
    )]
    AmountMismatch {
        invoice_id: String,
        requested: i64,
        cached: i64,
        open: i64,
    },

    #[error("gateway customer does not belong to payer {0}")]
    CustomerMismatch(String),

    #[error("receipt creation failed: {0}")]
    ReceiptCreateFailed(String),

    #[error("receipt {0} was only partially updated")]
    ReceiptUpdatePartial(String),

    #[error("payment intent {0} already processed")]
    PaymentIntentAlreadyProcessed(String),

    #[error("unexpected status {status:?} for charge {charge_id}")]
    UnexpectedChargeStatus {
        charge_id: String,
        status: ChargeStatus,
    },

    #[error("transaction on invoice {0} kept conflicting")]
    TransactionConflict(String),

    #[error("payment attempt {charge_id} not found on invoice {invoice_id}")]
    AttemptNotFound {
        invoice_id: String,
        charge_id: String,
    },

    #[error("webhook rejected: {0}")]
    WebhookSignature(#[from] SignatureError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    App(#[from] AppError),
}

impl PaymentError {
    /// Outcomes that are part of normal operation and must not page anyone.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            PaymentError::InvoiceLocked(_) | PaymentError::PaymentIntentAlreadyProcessed(_)
        )
    }

    pub fn gateway(&self) -> Option<&GatewayError> {
        match self {
            PaymentError::Gateway(err) => Some(err),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayErrorKind {
    /// The issuer or bank declined the payment.
    Card,
    InvalidRequest,
    Authentication,
    RateLimit,
    Connection,
    Api,
}

/// Error returned by the payment gateway, with its decline classification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("gateway {kind:?} error: {message}")]
pub struct GatewayError {
    pub kind: GatewayErrorKind,
    pub code: Option<String>,
    pub decline_code: Option<String>,
    pub message: String,
}

impl GatewayError {
    pub fn new(kind: GatewayErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: None,
            decline_code: None,
            message: message.into(),
        }
    }

    pub fn declined(decline_code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: GatewayErrorKind::Card,
            code: Some("card_declined".to_string()),
            decline_code: Some(decline_code.into()),
            message: message.into(),
        }
    }

    pub fn is_decline(&self) -> bool {
        self.kind == GatewayErrorKind::Card
    }

    pub fn is_insufficient_funds(&self) -> bool {
        const INSUFFICIENT_FUNDS: &str = "insufficient_funds";
        self.decline_code.as_deref() == Some(INSUFFICIENT_FUNDS)
            || self.code.as_deref() == Some(INSUFFICIENT_FUNDS)
    }
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger request failed with status {status}: {message}")]
    Request { status: u16, message: String },

    #[error("ledger record not found: {0}")]
    NotFound(String),

    #[error("ledger unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] mongodb::error::Error),

    #[error("document encoding error: {0}")]
    Encoding(String),
}

impl From<mongodb::bson::ser::Error> for StoreError {
    fn from(err: mongodb::bson::ser::Error) -> Self {
        StoreError::Encoding(err.to_string())
    }
}
