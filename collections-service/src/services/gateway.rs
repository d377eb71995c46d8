//! Payment gateway seam and webhook event verification.

use std::collections::HashMap;

use async_trait::async_trait;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use service_core::utils::signature::{verify_webhook_signature, SignatureError};
use thiserror::Error;

use crate::error::GatewayError;
use crate::models::{Charge, ChargeRequest, GatewayCustomer, PaymentMethod};

/// Operations the collections engine needs from the payment gateway.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn get_customer(&self, customer_id: &str) -> Result<GatewayCustomer, GatewayError>;

    async fn get_payment_method(&self, payment_method_id: &str)
        -> Result<PaymentMethod, GatewayError>;

    /// Payment methods attached to a gateway customer.
    async fn list_payment_methods(&self, customer_id: &str)
        -> Result<Vec<PaymentMethod>, GatewayError>;

    /// Detach a payment method from its customer. It can no longer be charged.
    async fn detach_payment_method(&self, payment_method_id: &str)
        -> Result<PaymentMethod, GatewayError>;

    /// Merge `metadata` into the payment method's metadata.
    async fn update_payment_method_metadata(
        &self,
        payment_method_id: &str,
        metadata: HashMap<String, String>,
    ) -> Result<PaymentMethod, GatewayError>;

    /// Create and confirm a charge.
    async fn create_charge(&self, request: ChargeRequest) -> Result<Charge, GatewayError>;

    async fn capture_charge(&self, charge_id: &str) -> Result<Charge, GatewayError>;

    async fn cancel_charge(&self, charge_id: &str) -> Result<Charge, GatewayError>;

    async fn get_charge(&self, charge_id: &str) -> Result<Charge, GatewayError>;

    /// Merge `metadata` into the charge's metadata.
    async fn update_charge_metadata(
        &self,
        charge_id: &str,
        metadata: HashMap<String, String>,
    ) -> Result<Charge, GatewayError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dispute {
    pub id: String,
    pub charge_id: String,
    pub amount: i64,
    pub currency: String,
    pub status: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mandate {
    pub id: String,
    pub payment_method_id: String,
    pub status: String,
}

/// A completed setup of a payment method for off-session use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupIntent {
    pub id: String,
    #[serde(default)]
    pub customer_id: Option<String>,
    #[serde(default)]
    pub payment_method_id: Option<String>,
    /// Mandate authorizing future debits, for debit families that need one.
    #[serde(default)]
    pub mandate_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WebhookEventKind {
    PaymentSucceeded(Charge),
    PaymentFailed(Charge),
    DisputeCreated(Dispute),
    MandateUpdated(Mandate),
    SetupIntentSucceeded(SetupIntent),
    /// Delivered but not handled by this service.
    Other(String),
}

impl WebhookEventKind {
    pub fn name(&self) -> &str {
        match self {
            WebhookEventKind::PaymentSucceeded(_) => "payment_intent.succeeded",
            WebhookEventKind::PaymentFailed(_) => "payment_intent.payment_failed",
            WebhookEventKind::DisputeCreated(_) => "charge.dispute.created",
            WebhookEventKind::MandateUpdated(_) => "mandate.updated",
            WebhookEventKind::SetupIntentSucceeded(_) => "setup_intent.succeeded",
            WebhookEventKind::Other(name) => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WebhookEvent {
    pub id: String,
    pub api_version: Option<String>,
    pub kind: WebhookEventKind,
}

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error(transparent)]
    Signature(#[from] SignatureError),

    #[error("malformed webhook payload: {0}")]
    Malformed(String),

    #[error("webhook api version {received:?} does not match pinned {expected}")]
    ApiVersionMismatch {
        expected: String,
        received: Option<String>,
    },
}

#[derive(Deserialize)]
struct RawEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    api_version: Option<String>,
    data: RawEventData,
}

#[derive(Deserialize)]
struct RawEventData {
    object: serde_json::Value,
}

/// Verifies and decodes webhook deliveries signed with the account's key.
#[derive(Clone)]
pub struct WebhookVerifier {
    signing_key: Secret<String>,
    api_version: Option<String>,
    tolerance_secs: i64,
}

impl WebhookVerifier {
    /// `api_version` is the version this service is built against.
    pub fn new(signing_key: Secret<String>, api_version: Option<String>, tolerance_secs: i64) -> Self {
        Self {
            signing_key,
            api_version,
            tolerance_secs,
        }
    }

    /// Check the signature, then decode the event.
    ///
    /// A version mismatch between the event and this service is only an
    /// error when the delivery pins the same version this service is built
    /// against.
    pub fn construct_event(
        &self,
        body: &[u8],
        signature: &str,
        api_version: Option<&str>,
        now: i64,
    ) -> Result<WebhookEvent, WebhookError> {
        verify_webhook_signature(
            self.signing_key.expose_secret(),
            signature,
            body,
            now,
            self.tolerance_secs,
        )?;

        let raw: RawEvent =
            serde_json::from_slice(body).map_err(|e| WebhookError::Malformed(e.to_string()))?;

        if let Some(expected) = self.api_version.as_deref() {
            let pinned = api_version == Some(expected);
            if pinned && raw.api_version.as_deref() != Some(expected) {
                return Err(WebhookError::ApiVersionMismatch {
                    expected: expected.to_string(),
                    received: raw.api_version,
                });
            }
        }

        let object = raw.data.object;
        let decode_err = |e: serde_json::Error| WebhookError::Malformed(e.to_string());
        let kind = match raw.event_type.as_str() {
            "payment_intent.succeeded" => {
                WebhookEventKind::PaymentSucceeded(serde_json::from_value(object).map_err(decode_err)?)
            }
            "payment_intent.payment_failed" => {
                WebhookEventKind::PaymentFailed(serde_json::from_value(object).map_err(decode_err)?)
            }
            "charge.dispute.created" => {
                WebhookEventKind::DisputeCreated(serde_json::from_value(object).map_err(decode_err)?)
            }
            "mandate.updated" => {
                WebhookEventKind::MandateUpdated(serde_json::from_value(object).map_err(decode_err)?)
            }
            "setup_intent.succeeded" => WebhookEventKind::SetupIntentSucceeded(
                serde_json::from_value(object).map_err(decode_err)?,
            ),
            _ => WebhookEventKind::Other(raw.event_type),
        };

        Ok(WebhookEvent {
            id: raw.id,
            api_version: raw.api_version,
            kind,
        })
    }
}
