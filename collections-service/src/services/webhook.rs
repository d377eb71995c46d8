//! Reconciles gateway webhook events with invoices and the ledger.
//!
//! Debit pulls settle days after they are confirmed; the success event is
//! where their receipt gets written. Deliveries can repeat, so a charge that
//! already carries a receipt id is acknowledged without touching anything.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use service_core::retry::{retry_with_backoff, RetryConfig};
use tracing::{debug, error, info, instrument, warn};

use crate::config::CollectionsConfig;
use crate::error::PaymentError;
use crate::models::{
    metadata_keys, AttemptStatus, Charge, ChargeStatus, DefaultPaymentMethod, Invoice,
    PaymentMethodFamily,
};
use crate::services::gateway::{
    Dispute, Mandate, PaymentGateway, SetupIntent, WebhookError, WebhookEventKind,
    WebhookVerifier,
};
use crate::services::ledger::{Ledger, LedgerReceiptCoordinator};
use crate::services::lock::InvoiceLockManager;
use crate::services::metrics::{record_amount, record_webhook};
use crate::services::payers::PayerStore;
use crate::services::saga::Saga;
use crate::services::store::{update_attempt, InvoiceStore};

/// How a delivery was handled. Every variant answers the gateway with
/// success; errors ask it to redeliver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// The event changed invoice or ledger state.
    Processed,
    /// Seen before; nothing left to do.
    AlreadyProcessed,
    /// Noted without state changes.
    Acknowledged,
    /// Not for this service, or unreadable.
    Ignored,
}

impl WebhookOutcome {
    fn label(&self) -> &'static str {
        match self {
            WebhookOutcome::Processed => "processed",
            WebhookOutcome::AlreadyProcessed => "already_processed",
            WebhookOutcome::Acknowledged => "acknowledged",
            WebhookOutcome::Ignored => "ignored",
        }
    }
}

#[derive(Clone)]
pub struct WebhookReconciler {
    store: Arc<dyn InvoiceStore>,
    gateway: Arc<dyn PaymentGateway>,
    ledger: LedgerReceiptCoordinator,
    payers: Arc<dyn PayerStore>,
    locks: InvoiceLockManager,
    verifier: WebhookVerifier,
    propagation: RetryConfig,
    store_max_attempts: u32,
}

impl WebhookReconciler {
    pub fn new(
        store: Arc<dyn InvoiceStore>,
        gateway: Arc<dyn PaymentGateway>,
        ledger: Arc<dyn Ledger>,
        payers: Arc<dyn PayerStore>,
        verifier: WebhookVerifier,
        store_max_attempts: u32,
    ) -> Self {
        Self {
            locks: InvoiceLockManager::new(store.clone(), store_max_attempts),
            store,
            gateway,
            ledger: LedgerReceiptCoordinator::new(ledger),
            payers,
            verifier,
            propagation: RetryConfig::propagation(),
            store_max_attempts,
        }
    }

    pub fn from_config(
        store: Arc<dyn InvoiceStore>,
        gateway: Arc<dyn PaymentGateway>,
        ledger: Arc<dyn Ledger>,
        payers: Arc<dyn PayerStore>,
        config: &CollectionsConfig,
    ) -> Self {
        let verifier = WebhookVerifier::new(
            config.gateway.webhook_secret.clone(),
            config.gateway.api_version.clone(),
            config.gateway.webhook_tolerance_secs,
        );
        Self::new(
            store,
            gateway,
            ledger,
            payers,
            verifier,
            config.payments.store_max_attempts,
        )
    }

    /// Backoff used while waiting for a just-confirmed attempt to become
    /// visible in the store.
    pub fn with_propagation_retry(mut self, config: RetryConfig) -> Self {
        self.propagation = config;
        self
    }

    /// Verify and handle one delivery.
    ///
    /// `api_version` is the version the delivery endpoint is pinned to, if
    /// any.
    pub async fn handle_event(
        &self,
        body: &[u8],
        signature: &str,
        api_version: Option<&str>,
    ) -> Result<WebhookOutcome, PaymentError> {
        let now = Utc::now().timestamp();
        let event = match self
            .verifier
            .construct_event(body, signature, api_version, now)
        {
            Ok(event) => event,
            Err(WebhookError::Signature(err)) => {
                warn!(error = %err, "Rejected webhook with invalid signature");
                record_webhook("unknown", "rejected");
                return Err(err.into());
            }
            Err(WebhookError::Malformed(reason)) => {
                warn!(reason = %reason, "Ignoring malformed webhook");
                record_webhook("unknown", "malformed");
                return Ok(WebhookOutcome::Ignored);
            }
            Err(err @ WebhookError::ApiVersionMismatch { .. }) => {
                warn!(error = %err, "Ignoring webhook for another api version");
                record_webhook("unknown", "version_mismatch");
                return Ok(WebhookOutcome::Ignored);
            }
        };

        let name = event.kind.name().to_string();
        info!(event_id = %event.id, event_type = %name, "Processing webhook");

        let result = match event.kind {
            WebhookEventKind::PaymentSucceeded(charge) => self.handle_success(charge).await,
            WebhookEventKind::PaymentFailed(charge) => self.record_failure(&charge).await,
            WebhookEventKind::DisputeCreated(dispute) => Ok(self.handle_dispute(&dispute).await),
            WebhookEventKind::MandateUpdated(mandate) => {
                self.handle_mandate_updated(&mandate).await
            }
            WebhookEventKind::SetupIntentSucceeded(intent) => {
                self.handle_setup_succeeded(&intent).await
            }
            WebhookEventKind::Other(_) => {
                debug!(event_type = %name, "Unhandled webhook event type");
                Ok(WebhookOutcome::Ignored)
            }
        };

        match &result {
            Ok(outcome) => record_webhook(&name, outcome.label()),
            Err(err) => {
                record_webhook(&name, "failed");
                warn!(event_id = %event.id, error = %err, "Webhook handling failed");
            }
        }
        result
    }

    async fn handle_success(&self, charge: Charge) -> Result<WebhookOutcome, PaymentError> {
        if !charge.family.is_debit_pull() {
            debug!(charge_id = %charge.id, "Card success already reconciled at capture");
            return Ok(WebhookOutcome::Acknowledged);
        }

        let Some(invoice_id) = charge.metadata_value(metadata_keys::INVOICE_ID) else {
            warn!(charge_id = %charge.id, "Charge carries no invoice id");
            return Ok(WebhookOutcome::Ignored);
        };

        match self.reconcile_debit_success(invoice_id, &charge.id).await {
            Err(PaymentError::PaymentIntentAlreadyProcessed(charge_id)) => {
                info!(charge_id = %charge_id, "Debit pull already reconciled");
                Ok(WebhookOutcome::AlreadyProcessed)
            }
            other => other,
        }
    }

    /// Write and approve the receipt for a settled debit pull, then settle
    /// its attempt on the invoice.
    #[instrument(skip(self))]
    pub async fn reconcile_debit_success(
        &self,
        invoice_id: &str,
        charge_id: &str,
    ) -> Result<WebhookOutcome, PaymentError> {
        // The webhook can outrun the write that recorded the attempt
        retry_with_backoff(
            &self.propagation,
            "await_attempt_visible",
            |err: &PaymentError| matches!(err, PaymentError::AttemptNotFound { .. }),
            || self.load_with_attempt(invoice_id, charge_id),
        )
        .await?;

        self.locks.lock(invoice_id).await?;
        let mut saga = Saga::new(format!("debit settlement {invoice_id}"));
        let locks = self.locks.clone();
        let id = invoice_id.to_string();
        saga.push("unlock_invoice", move || async move { locks.unlock(&id).await });

        let result = self.settle(invoice_id, charge_id, &mut saga).await;
        saga.compensate().await;
        result
    }

    async fn settle(
        &self,
        invoice_id: &str,
        charge_id: &str,
        saga: &mut Saga,
    ) -> Result<WebhookOutcome, PaymentError> {
        let charge = self.gateway.get_charge(charge_id).await?;
        if charge.receipt_id().is_some() {
            return Err(PaymentError::PaymentIntentAlreadyProcessed(charge.id));
        }
        if charge.status != ChargeStatus::Succeeded {
            return Err(PaymentError::UnexpectedChargeStatus {
                charge_id: charge.id,
                status: charge.status,
            });
        }

        let invoice = self.load_with_attempt(invoice_id, charge_id).await?;
        let partial = charge.amount_received < invoice.debit;
        let today = Utc::now().date_naive();

        let receipt = self
            .ledger
            .create_receipt(
                &invoice,
                charge.amount_received,
                None,
                Some(&charge.id),
                today,
            )
            .await?;

        let ledger = self.ledger.clone();
        let to_delete = receipt.clone();
        saga.push("delete_draft_receipt", move || async move {
            ledger.delete_receipt(&to_delete).await
        });

        self.ledger
            .patch_receipt(&receipt, &invoice.number, None, partial)
            .await?;

        saga.disarm_all();

        let approved = self.ledger.approve_receipt(&receipt).await.inspect_err(|err| {
            error!(
                alert = true,
                draft_receipt_id = %receipt.id,
                error = %err,
                "Failed to approve debit receipt, invoice left locked"
            );
        })?;

        let metadata = HashMap::from([
            (metadata_keys::DRAFT_RECEIPT_ID.to_string(), receipt.id.clone()),
            (metadata_keys::RECEIPT_ID.to_string(), approved.id.clone()),
        ]);
        self.gateway
            .update_charge_metadata(&charge.id, metadata)
            .await
            .inspect_err(|err| {
                error!(
                    alert = true,
                    receipt_id = %approved.id,
                    error = %err,
                    "Failed to record receipt on charge, invoice left locked"
                );
            })?;

        let received = charge.amount_received;
        let status = AttemptStatus::from(charge.status);
        let settled = update_attempt(
            self.store.as_ref(),
            invoice_id,
            charge_id,
            self.store_max_attempts,
            Some(received),
            |attempt| {
                attempt.status = status;
                attempt.amount_received = received;
                attempt.draft_receipt_id = Some(receipt.id.clone());
                attempt.receipt_id = Some(approved.id.clone());
            },
        )
        .await;
        if let Err(err) = settled {
            error!(
                alert = true,
                receipt_id = %approved.id,
                error = %err,
                "Debit receipt approved but invoice not updated, invoice left locked"
            );
            return Ok(WebhookOutcome::Processed);
        }

        self.locks.unlock(invoice_id).await?;
        record_amount(charge.currency.symbol(), received);
        info!(receipt_id = %approved.id, amount = received, "Debit pull reconciled");
        Ok(WebhookOutcome::Processed)
    }

    /// Mark a failed debit pull on its invoice. Card failures surface
    /// synchronously and are only logged.
    pub async fn record_failure(&self, charge: &Charge) -> Result<WebhookOutcome, PaymentError> {
        let reason = charge
            .last_error
            .as_ref()
            .and_then(|e| e.message.clone())
            .unwrap_or_default();

        if !charge.family.is_debit_pull() {
            info!(charge_id = %charge.id, reason = %reason, "Card payment failed");
            return Ok(WebhookOutcome::Acknowledged);
        }

        let Some(invoice_id) = charge.metadata_value(metadata_keys::INVOICE_ID) else {
            warn!(charge_id = %charge.id, "Failed charge carries no invoice id");
            return Ok(WebhookOutcome::Ignored);
        };

        warn!(
            invoice_id,
            charge_id = %charge.id,
            family = %charge.family,
            reason = %reason,
            "Debit pull failed"
        );

        let recorded = update_attempt(
            self.store.as_ref(),
            invoice_id,
            &charge.id,
            self.store_max_attempts,
            None,
            |attempt| attempt.status = AttemptStatus::Failed,
        )
        .await;

        match recorded {
            Ok(()) => Ok(WebhookOutcome::Processed),
            Err(err) => {
                warn!(invoice_id, charge_id = %charge.id, error = %err, "Failed to record debit failure");
                Ok(WebhookOutcome::Acknowledged)
            }
        }
    }

    /// Disputes need a human; raise an alert with enough context to act.
    pub async fn handle_dispute(&self, dispute: &Dispute) -> WebhookOutcome {
        let invoice_id = match self.gateway.get_charge(&dispute.charge_id).await {
            Ok(charge) => charge
                .metadata_value(metadata_keys::INVOICE_ID)
                .map(str::to_string),
            Err(err) => {
                warn!(charge_id = %dispute.charge_id, error = %err, "Could not load disputed charge");
                None
            }
        };

        error!(
            alert = true,
            dispute_id = %dispute.id,
            charge_id = %dispute.charge_id,
            invoice_id = invoice_id.as_deref().unwrap_or_default(),
            amount = dispute.amount,
            currency = %dispute.currency,
            reason = dispute.reason.as_deref().unwrap_or_default(),
            "Payment disputed"
        );
        WebhookOutcome::Acknowledged
    }

    /// Mirror a mandate status change onto its payment method so later
    /// charges see it.
    pub async fn handle_mandate_updated(
        &self,
        mandate: &Mandate,
    ) -> Result<WebhookOutcome, PaymentError> {
        let metadata = HashMap::from([(
            metadata_keys::MANDATE_STATUS.to_string(),
            mandate.status.clone(),
        )]);
        self.gateway
            .update_payment_method_metadata(&mandate.payment_method_id, metadata)
            .await?;

        info!(
            mandate_id = %mandate.id,
            payment_method_id = %mandate.payment_method_id,
            status = %mandate.status,
            "Mandate status recorded"
        );
        Ok(WebhookOutcome::Processed)
    }

    /// Finish setting up a payment method: keep the ACSS mandate on the
    /// method, and make it the default when it was added by a payer signing
    /// up.
    #[instrument(skip(self, intent), fields(setup_intent_id = %intent.id))]
    pub async fn handle_setup_succeeded(
        &self,
        intent: &SetupIntent,
    ) -> Result<WebhookOutcome, PaymentError> {
        let Some(payment_method_id) = intent.payment_method_id.as_deref() else {
            error!(alert = true, "Setup intent succeeded without a payment method");
            return Ok(WebhookOutcome::Ignored);
        };

        let payer_id = match intent.metadata.get(metadata_keys::PAYER_ID) {
            Some(id) if !id.is_empty() => Some(id.clone()),
            _ => match intent.customer_id.as_deref() {
                Some(customer_id) => self
                    .gateway
                    .get_customer(customer_id)
                    .await?
                    .payer_id()
                    .map(str::to_string),
                None => None,
            },
        };
        let Some(payer_id) = payer_id else {
            warn!("Setup intent has no payer");
            return Ok(WebhookOutcome::Ignored);
        };

        let method = self.gateway.get_payment_method(payment_method_id).await?;

        let mut mandate_recorded = false;
        if method.family == PaymentMethodFamily::AcssDebit {
            match intent.mandate_id.as_deref() {
                Some(mandate_id) => {
                    let metadata = HashMap::from([(
                        metadata_keys::MANDATE_ID.to_string(),
                        mandate_id.to_string(),
                    )]);
                    self.gateway
                        .update_payment_method_metadata(payment_method_id, metadata)
                        .await?;
                    info!(payment_method_id, mandate_id, "ACSS mandate recorded");
                    mandate_recorded = true;
                }
                None => warn!(payment_method_id, "ACSS setup completed without a mandate"),
            }
        }

        let new_payer = intent
            .metadata
            .get(metadata_keys::NEW_PAYER)
            .is_some_and(|v| v == "true");
        if !new_payer {
            return Ok(if mandate_recorded {
                WebhookOutcome::Processed
            } else {
                WebhookOutcome::Acknowledged
            });
        }

        let default = DefaultPaymentMethod {
            id: method.id,
            family: method.family,
        };
        if !self
            .payers
            .set_default_payment_method(&payer_id, Some(&default))
            .await?
        {
            warn!(payer_id = %payer_id, "Payer for setup intent not found");
            return Ok(WebhookOutcome::Acknowledged);
        }

        info!(
            payer_id = %payer_id,
            payment_method_id,
            family = %default.family,
            "Default payment method set for new payer"
        );
        Ok(WebhookOutcome::Processed)
    }

    async fn load_with_attempt(
        &self,
        invoice_id: &str,
        charge_id: &str,
    ) -> Result<Invoice, PaymentError> {
        let invoice = self
            .store
            .fetch(invoice_id)
            .await?
            .ok_or_else(|| PaymentError::InvoiceNotFound(invoice_id.to_string()))?;

        if invoice.attempt(charge_id).is_none() {
            return Err(PaymentError::AttemptNotFound {
                invoice_id: invoice_id.to_string(),
                charge_id: charge_id.to_string(),
            });
        }
        Ok(invoice)
    }
}

