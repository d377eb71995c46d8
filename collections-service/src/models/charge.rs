//! Payment gateway resources as seen by the collections engine.

use std::collections::HashMap;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::PaymentMethodFamily;

/// Metadata keys written on gateway charges.
pub mod metadata_keys {
    pub const EMAIL: &str = "email";
    pub const CUSTOMER_ID: &str = "customer_id";
    pub const PAYER_ID: &str = "payer_id";
    pub const INVOICE_ID: &str = "invoice_id";
    pub const DRAFT_RECEIPT_ID: &str = "draft_receipt_id";
    pub const RECEIPT_ID: &str = "receipt_id";
    pub const DRAFT_FEES_INVOICE_ID: &str = "draft_fees_invoice_id";
    pub const FEES_INVOICE_ID: &str = "fees_invoice_id";
    pub const MANDATE_STATUS: &str = "mandate_status";
    pub const MANDATE_ID: &str = "mandate_id";
    /// Set on setup intents created while onboarding a payer.
    pub const NEW_PAYER: &str = "new_payer";

    /// Placeholder for ids that do not apply to a charge.
    pub const NOT_APPLICABLE: &str = "N/A";
}

/// Currencies the gateway accepts for invoice collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Currency {
    Usd,
    Ils,
    Eur,
    Gbp,
    Aud,
    Cad,
    Dkk,
    Nok,
    Sek,
    Brl,
    Sgd,
    Mxn,
    Chf,
    Myr,
    Twd,
    Egp,
    Zar,
    Jpy,
    Idr,
}

impl Currency {
    /// Map an invoice currency symbol to a gateway currency.
    pub fn from_symbol(symbol: &str) -> Option<Self> {
        let currency = match symbol.trim().to_ascii_uppercase().as_str() {
            "USD" => Currency::Usd,
            "ILS" => Currency::Ils,
            "EUR" => Currency::Eur,
            "GBP" => Currency::Gbp,
            "AUD" => Currency::Aud,
            "CAD" => Currency::Cad,
            "DKK" => Currency::Dkk,
            "NOK" => Currency::Nok,
            "SEK" => Currency::Sek,
            "BRL" => Currency::Brl,
            "SGD" => Currency::Sgd,
            "MXN" => Currency::Mxn,
            "CHF" => Currency::Chf,
            "MYR" => Currency::Myr,
            "TWD" => Currency::Twd,
            "EGP" => Currency::Egp,
            "ZAR" => Currency::Zar,
            "JPY" => Currency::Jpy,
            "IDR" => Currency::Idr,
            _ => return None,
        };
        Some(currency)
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Currency::Usd => "USD",
            Currency::Ils => "ILS",
            Currency::Eur => "EUR",
            Currency::Gbp => "GBP",
            Currency::Aud => "AUD",
            Currency::Cad => "CAD",
            Currency::Dkk => "DKK",
            Currency::Nok => "NOK",
            Currency::Sek => "SEK",
            Currency::Brl => "BRL",
            Currency::Sgd => "SGD",
            Currency::Mxn => "MXN",
            Currency::Chf => "CHF",
            Currency::Myr => "MYR",
            Currency::Twd => "TWD",
            Currency::Egp => "EGP",
            Currency::Zar => "ZAR",
            Currency::Jpy => "JPY",
            Currency::Idr => "IDR",
        }
    }
}

/// Gateway charge lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargeStatus {
    RequiresPaymentMethod,
    RequiresConfirmation,
    RequiresAction,
    Processing,
    RequiresCapture,
    Canceled,
    Succeeded,
    /// Terminal failure reported by a `payment_failed` event.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMethod {
    Automatic,
    /// Authorize now, capture later.
    Manual,
}

/// Last error the gateway recorded on a charge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeError {
    pub code: Option<String>,
    pub decline_code: Option<String>,
    pub message: Option<String>,
}

/// A payment intent on the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Charge {
    pub id: String,
    pub amount: i64,
    #[serde(default)]
    pub amount_received: i64,
    pub currency: Currency,
    pub status: ChargeStatus,
    pub customer_id: String,
    pub payment_method_id: Option<String>,
    pub family: PaymentMethodFamily,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub last_error: Option<ChargeError>,
    pub created: DateTime<Utc>,
}

impl Charge {
    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Finalized ledger receipt id, once the payment has been reconciled.
    pub fn receipt_id(&self) -> Option<&str> {
        self.metadata_value(metadata_keys::RECEIPT_ID)
    }
}

/// Parameters for creating a charge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeRequest {
    pub customer_id: String,
    pub payment_method_id: String,
    pub family: PaymentMethodFamily,
    pub amount: i64,
    pub currency: Currency,
    pub capture_method: CaptureMethod,
    /// Confirm immediately without the customer present.
    pub off_session: bool,
    /// Save a not-yet-attached method on the customer for later off-session use.
    pub setup_future_usage: bool,
    pub description: String,
    pub statement_descriptor_suffix: Option<String>,
    pub metadata: HashMap<String, String>,
    /// Deduplicates retried create calls on the gateway side.
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayCustomer {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl GatewayCustomer {
    pub fn payer_id(&self) -> Option<&str> {
        self.metadata
            .get(metadata_keys::PAYER_ID)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}

/// Stored payment instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentMethod {
    pub id: String,
    pub family: PaymentMethodFamily,
    pub customer_id: Option<String>,
    /// Card expiry as (year, month).
    #[serde(default)]
    pub card_expiry: Option<(i32, u32)>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl PaymentMethod {
    /// Reason the method may not be charged, if any.
    pub fn disabled_reason(&self, today: NaiveDate) -> Option<String> {
        match self.family {
            PaymentMethodFamily::Card => {
                let (year, month) = self.card_expiry?;
                let expired = (today.year(), today.month()) > (year, month);
                expired.then(|| format!("card expired {month:02}/{year}"))
            }
            PaymentMethodFamily::BacsDebit => {
                let status = self
                    .metadata
                    .get(metadata_keys::MANDATE_STATUS)
                    .map(String::as_str)
                    .unwrap_or("active");
                (status != "active").then(|| format!("bacs mandate is {status}"))
            }
            _ => None,
        }
    }
}
