//! Payment execution against a single invoice, and the scheduled batch that
//! drives automatic payments for a payer.
//!
//! Card payments authorize, capture and reconcile the ledger in one call.
//! Debit pulls stop once the charge is confirmed; the gateway reports
//! settlement later through a webhook.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{NaiveDate, Utc};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::{ChargeLimits, CollectionsConfig, FeePolicy, PaymentsConfig};
use crate::error::PaymentError;
use crate::models::{
    metadata_keys, AttemptStatus, CaptureMethod, Charge, ChargeRequest, ChargeStatus, Currency,
    DraftFeeInvoice, DraftReceipt, GatewayCustomer, Invoice, LinkedFeeInvoice, Payer,
    PaymentAttempt, PaymentMethod, PaymentMethodFamily,
};
use crate::services::fees::FeeCalculator;
use crate::services::gateway::PaymentGateway;
use crate::services::ledger::{Ledger, LedgerReceiptCoordinator};
use crate::services::lock::InvoiceLockManager;
use crate::services::metrics::{observe_payment_duration, record_amount, record_payment};
use crate::services::saga::Saga;
use crate::services::store::{compare_and_swap, update_attempt, InvoiceStore, Mutation};
use crate::services::validator::AmountValidator;

const DEFAULT_OVERDUE_DAYS_REMAINDER: i64 = 7;

/// A request to collect an invoice with a saved payment method.
#[derive(Debug, Clone)]
pub struct PaymentRequest {
    pub invoice_id: String,
    pub payer: Payer,
    pub payment_method_id: String,
    pub family: PaymentMethodFamily,
    /// Amount to collect, excluding fees. Defaults to the open balance.
    pub amount: Option<i64>,
    /// Receipt address written on the charge. Falls back to the payer's.
    pub email: Option<String>,
    /// Business date the payment is made on.
    pub today: NaiveDate,
}

/// Why an invoice was left alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Canceled,
    Paid,
    NothingDue,
    /// Invoice date is still in the future.
    NotYetIssued,
}

impl SkipReason {
    pub fn for_invoice(invoice: &Invoice, today: NaiveDate) -> Option<Self> {
        if invoice.canceled {
            Some(SkipReason::Canceled)
        } else if invoice.paid {
            Some(SkipReason::Paid)
        } else if invoice.debit <= 0 {
            Some(SkipReason::NothingDue)
        } else if today < invoice.date {
            Some(SkipReason::NotYetIssued)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Canceled => "canceled",
            SkipReason::Paid => "paid",
            SkipReason::NothingDue => "nothing_due",
            SkipReason::NotYetIssued => "not_yet_issued",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentOutcome {
    /// Card charge captured and recorded on an approved ledger receipt.
    Captured {
        charge_id: String,
        amount: i64,
        fee: i64,
        receipt_id: String,
    },
    /// Debit pull confirmed. Settlement arrives by webhook.
    Processing { charge_id: String, amount: i64 },
    Skipped(SkipReason),
}

impl PaymentOutcome {
    fn label(&self) -> &'static str {
        match self {
            PaymentOutcome::Captured { .. } => "captured",
            PaymentOutcome::Processing { .. } => "processing",
            PaymentOutcome::Skipped(_) => "skipped",
        }
    }
}

/// Parameters of a scheduled automatic payments run.
#[derive(Debug, Clone)]
pub struct AutomaticPaymentsInput {
    /// Families to charge. Empty means all of them.
    pub families: Vec<PaymentMethodFamily>,
    /// Overdue invoices are retried every this many days. Non-positive
    /// values fall back to weekly.
    pub overdue_days_remainder: i64,
    pub today: NaiveDate,
}

impl AutomaticPaymentsInput {
    pub fn new(today: NaiveDate) -> Self {
        Self {
            families: Vec::new(),
            overdue_days_remainder: DEFAULT_OVERDUE_DAYS_REMAINDER,
            today,
        }
    }

    fn remainder(&self) -> i64 {
        if self.overdue_days_remainder <= 0 {
            DEFAULT_OVERDUE_DAYS_REMAINDER
        } else {
            self.overdue_days_remainder
        }
    }

    fn includes(&self, family: PaymentMethodFamily) -> bool {
        self.families.is_empty() || self.families.contains(&family)
    }
}

/// Tally of one payer's batch run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub attempted: usize,
    pub captured: usize,
    pub processing: usize,
    pub skipped: usize,
    /// Invoices held by another payment and left for the next run.
    pub locked: usize,
    pub failed: usize,
    /// A card failure other than insufficient funds ended the run early.
    pub stopped: bool,
}

/// Everything checked before money moves.
struct Prepared {
    invoice: Invoice,
    open_balance: i64,
    amount: i64,
    partial: bool,
    currency: Currency,
    customer: GatewayCustomer,
    method: PaymentMethod,
}

enum Preflight {
    Skip(SkipReason),
    Ready(Box<Prepared>),
}

#[derive(Clone)]
pub struct PaymentOrchestrator {
    store: Arc<dyn InvoiceStore>,
    gateway: Arc<dyn PaymentGateway>,
    ledger: LedgerReceiptCoordinator,
    locks: InvoiceLockManager,
    validator: AmountValidator,
    fees: FeeCalculator,
    limits: ChargeLimits,
    payments: PaymentsConfig,
}

impl PaymentOrchestrator {
    pub fn new(
        store: Arc<dyn InvoiceStore>,
        gateway: Arc<dyn PaymentGateway>,
        ledger: Arc<dyn Ledger>,
    ) -> Self {
        let payments = PaymentsConfig::default();
        let limits = ChargeLimits::default();
        Self {
            locks: InvoiceLockManager::new(store.clone(), payments.store_max_attempts),
            store,
            gateway,
            ledger: LedgerReceiptCoordinator::new(ledger),
            validator: AmountValidator::new(limits),
            fees: FeeCalculator::default(),
            limits,
            payments,
        }
    }

    pub fn from_config(
        store: Arc<dyn InvoiceStore>,
        gateway: Arc<dyn PaymentGateway>,
        ledger: Arc<dyn Ledger>,
        config: &CollectionsConfig,
    ) -> Self {
        Self::new(store, gateway, ledger)
            .with_payments(config.payments.clone())
            .with_fee_policy(config.fees.clone())
            .with_limits(config.limits)
    }

    pub fn with_payments(mut self, payments: PaymentsConfig) -> Self {
        self.locks = InvoiceLockManager::new(self.store.clone(), payments.store_max_attempts);
        self.payments = payments;
        self
    }

    pub fn with_fee_policy(mut self, policy: FeePolicy) -> Self {
        self.fees = FeeCalculator::new(policy);
        self
    }

    pub fn with_limits(mut self, limits: ChargeLimits) -> Self {
        self.validator = AmountValidator::new(limits);
        self.limits = limits;
        self
    }

    /// Collect an invoice with the method family named in the request.
    #[instrument(
        skip(self, request),
        fields(
            invoice_id = %request.invoice_id,
            payer_id = %request.payer.id,
            family = %request.family
        )
    )]
    pub async fn pay_invoice(
        &self,
        request: &PaymentRequest,
    ) -> Result<PaymentOutcome, PaymentError> {
        let started = Instant::now();
        let result = if request.family.is_debit_pull() {
            self.pay_debit(request).await
        } else {
            self.pay_card(request).await
        };

        let family = request.family.as_str();
        observe_payment_duration(family, started.elapsed().as_secs_f64());
        match &result {
            Ok(outcome) => record_payment(family, outcome.label()),
            Err(err) if err.is_expected() => {
                record_payment(family, "contended");
                info!(error = %err, "Payment not attempted");
            }
            Err(err) => {
                record_payment(family, "failed");
                warn!(error = %err, "Payment failed");
            }
        }
        result
    }

    /// Authorize, capture and reconcile a card payment, surcharge included.
    pub async fn pay_card(&self, request: &PaymentRequest) -> Result<PaymentOutcome, PaymentError> {
        self.ensure_enabled(PaymentMethodFamily::Card)?;
        if request.family != PaymentMethodFamily::Card {
            return Err(PaymentError::InvalidPaymentMethod(format!(
                "{} is a {} method, not a card",
                request.payment_method_id, request.family
            )));
        }

        let mut saga = self.begin(&request.invoice_id, "card").await?;
        let result = self.card_payment(request, &mut saga).await;
        saga.compensate().await;
        result
    }

    /// Confirm a debit pull and record it as processing.
    pub async fn pay_debit(&self, request: &PaymentRequest) -> Result<PaymentOutcome, PaymentError> {
        self.ensure_enabled(request.family)?;
        if !request.family.is_debit_pull() {
            return Err(PaymentError::InvalidPaymentMethod(format!(
                "{} is not a debit pull method",
                request.family
            )));
        }

        let mut saga = self.begin(&request.invoice_id, request.family.as_str()).await?;
        let result = self.debit_payment(request, &mut saga).await;
        saga.compensate().await;
        result
    }

    /// Void an authorized charge and mark its attempt canceled.
    pub async fn cancel_charge(
        &self,
        invoice_id: &str,
        charge_id: &str,
    ) -> Result<Charge, PaymentError> {
        let charge = self.gateway.cancel_charge(charge_id).await?;
        let canceled_at = Utc::now();

        let recorded = update_attempt(
            self.store.as_ref(),
            invoice_id,
            charge_id,
            self.payments.store_max_attempts,
            None,
            |attempt| {
                attempt.status = AttemptStatus::Canceled;
                attempt.canceled_at = Some(canceled_at);
            },
        )
        .await;

        match recorded {
            Ok(()) => {}
            Err(PaymentError::AttemptNotFound { .. }) => {
                debug!(invoice_id, charge_id, "Canceled charge had no recorded attempt");
            }
            Err(err) => return Err(err),
        }

        info!(invoice_id, charge_id, "Charge canceled");
        Ok(charge)
    }

    /// Charge a payer's due invoices with their default payment method.
    ///
    /// Invoices are charged on their pay date and then every
    /// `overdue_days_remainder` days, smallest balance first.
    #[instrument(skip(self, payer, input), fields(payer_id = %payer.id))]
    pub async fn run_batch(
        &self,
        payer: &Payer,
        input: &AutomaticPaymentsInput,
    ) -> Result<BatchReport, PaymentError> {
        let mut report = BatchReport::default();

        let Some(method) = payer.default_payment_method.as_ref() else {
            debug!("Payer has no default payment method");
            return Ok(report);
        };
        if !input.includes(method.family) {
            debug!(family = %method.family, "Payment method family not in this run");
            return Ok(report);
        }

        let today = input.today;
        let remainder = input.remainder();

        let mut invoices: Vec<Invoice> = self
            .store
            .list_open_for_payer(&payer.id)
            .await?
            .into_iter()
            .filter(|invoice| invoice.pay_date <= today)
            .collect();
        invoices.sort_by(|a, b| {
            a.debit
                .cmp(&b.debit)
                .then_with(|| a.pay_date.cmp(&b.pay_date))
        });

        for invoice in invoices {
            if invoice.locked {
                info!(invoice_id = %invoice.id, "Invoice locked, leaving for next run");
                report.locked += 1;
                continue;
            }
            if !is_collection_day(invoice.pay_date, today, remainder) {
                continue;
            }

            if report.attempted > 0 && !self.payments.rate_limit.is_zero() {
                tokio::time::sleep(self.payments.rate_limit).await;
            }
            report.attempted += 1;

            let request = PaymentRequest {
                invoice_id: invoice.id.clone(),
                payer: payer.clone(),
                payment_method_id: method.id.clone(),
                family: method.family,
                amount: None,
                email: None,
                today,
            };

            match self.pay_invoice(&request).await {
                Ok(PaymentOutcome::Captured { .. }) => report.captured += 1,
                Ok(PaymentOutcome::Processing { .. }) => report.processing += 1,
                Ok(PaymentOutcome::Skipped(_)) => report.skipped += 1,
                Err(err) if err.is_expected() => report.locked += 1,
                Err(err) => {
                    report.failed += 1;
                    if method.family == PaymentMethodFamily::Card && stops_card_run(&err) {
                        warn!(
                            invoice_id = %invoice.id,
                            error = %err,
                            "Card declined, stopping payer's run"
                        );
                        report.stopped = true;
                        break;
                    }
                }
            }
        }

        info!(
            attempted = report.attempted,
            captured = report.captured,
            processing = report.processing,
            failed = report.failed,
            locked = report.locked,
            stopped = report.stopped,
            "Automatic payments run finished"
        );
        Ok(report)
    }

    fn ensure_enabled(&self, family: PaymentMethodFamily) -> Result<(), PaymentError> {
        if self.payments.is_enabled(family) {
            Ok(())
        } else {
            Err(PaymentError::OnlinePaymentsUnavailable(family))
        }
    }

    /// Lock the invoice and open a saga whose first compensation unlocks it.
    async fn begin(&self, invoice_id: &str, flow: &str) -> Result<Saga, PaymentError> {
        self.locks.lock(invoice_id).await?;

        let mut saga = Saga::new(format!("{flow} payment {invoice_id}"));
        let locks = self.locks.clone();
        let id = invoice_id.to_string();
        saga.push("unlock_invoice", move || async move { locks.unlock(&id).await });
        Ok(saga)
    }

    async fn preflight(&self, request: &PaymentRequest) -> Result<Preflight, PaymentError> {
        let invoice = self
            .store
            .fetch(&request.invoice_id)
            .await?
            .ok_or_else(|| PaymentError::InvoiceNotFound(request.invoice_id.clone()))?;

        if let Some(reason) = SkipReason::for_invoice(&invoice, request.today) {
            info!(reason = reason.as_str(), "Invoice not payable, skipping");
            return Ok(Preflight::Skip(reason));
        }

        if request.payment_method_id.is_empty() {
            return Err(PaymentError::InvalidPaymentMethod(
                "no payment method given".to_string(),
            ));
        }

        let open_balance = self.ledger.open_balance(&invoice).await?.ok_or_else(|| {
            PaymentError::InvalidInvoice(format!(
                "invoice {} is already paid in the ledger",
                invoice.number
            ))
        })?;

        let amount = request.amount.unwrap_or(open_balance);
        if amount < self.limits.min_charge {
            return Err(PaymentError::InvalidAmount(format!(
                "{amount} is below the minimum charge of {}",
                self.limits.min_charge
            )));
        }

        if !self
            .validator
            .is_valid(&invoice, amount, invoice.debit, open_balance)
        {
            error!(
                alert = true,
                requested = amount,
                cached = invoice.debit,
                open = open_balance,
                "Payment amount failed validation"
            );
            return Err(PaymentError::AmountMismatch {
                invoice_id: invoice.id.clone(),
                requested: amount,
                cached: invoice.debit,
                open: open_balance,
            });
        }

        let currency = Currency::from_symbol(&invoice.currency)
            .ok_or_else(|| PaymentError::InvalidCurrency(invoice.currency.clone()))?;

        let (customer, method) = self.verify_payment_method(request).await?;

        Ok(Preflight::Ready(Box::new(Prepared {
            partial: amount < invoice.debit,
            invoice,
            open_balance,
            amount,
            currency,
            customer,
            method,
        })))
    }

    /// The gateway customer must belong to the payer and the method must be
    /// usable by that customer today.
    async fn verify_payment_method(
        &self,
        request: &PaymentRequest,
    ) -> Result<(GatewayCustomer, PaymentMethod), PaymentError> {
        let payer = &request.payer;
        let customer_id = payer
            .gateway_customer_id
            .as_deref()
            .ok_or_else(|| PaymentError::CustomerMismatch(payer.id.clone()))?;

        let customer = self.gateway.get_customer(customer_id).await?;
        if customer.payer_id() != Some(payer.id.as_str()) {
            warn!(customer_id, "Gateway customer belongs to another payer");
            return Err(PaymentError::CustomerMismatch(payer.id.clone()));
        }

        let method = self
            .gateway
            .get_payment_method(&request.payment_method_id)
            .await?;

        if method.family != request.family {
            return Err(PaymentError::InvalidPaymentMethod(format!(
                "{} is a {} method",
                method.id, method.family
            )));
        }
        if let Some(owner) = method.customer_id.as_deref() {
            if owner != customer.id {
                return Err(PaymentError::InvalidPaymentMethod(format!(
                    "{} is attached to another customer",
                    method.id
                )));
            }
        }
        if let Some(reason) = method.disabled_reason(request.today) {
            return Err(PaymentError::PaymentMethodDisabled(reason));
        }

        Ok((customer, method))
    }

    async fn card_payment(
        &self,
        request: &PaymentRequest,
        saga: &mut Saga,
    ) -> Result<PaymentOutcome, PaymentError> {
        let Prepared {
            invoice,
            open_balance,
            amount,
            partial,
            currency,
            customer,
            method,
        } = match self.preflight(request).await? {
            Preflight::Skip(reason) => return Ok(PaymentOutcome::Skipped(reason)),
            Preflight::Ready(prepared) => *prepared,
        };
        let payer = &request.payer;

        let (exempt, percent) = self
            .fees
            .exempt(&payer.customer, payer, &invoice.currency, amount);

        let fee_invoice = if exempt {
            None
        } else {
            let fee = self.fees.total_fee(amount, percent);
            let tax = self.fees.fee_tax(fee, payer);
            let draft = self
                .ledger
                .create_fee_invoice(&invoice, fee, tax, request.today)
                .await?;

            let ledger = self.ledger.clone();
            let to_delete = draft.clone();
            saga.push("delete_fee_invoice", move || async move {
                ledger.delete_fee_invoice(&to_delete).await
            });

            if draft.total_after_tax < 0 || draft.total_after_tax > amount {
                return Err(PaymentError::InvalidAmount(format!(
                    "fee {} out of range for a payment of {amount}",
                    draft.total_after_tax
                )));
            }
            Some(draft)
        };

        let fee_total = fee_invoice.as_ref().map_or(0, |f| f.total_after_tax);
        let charge_amount = amount + fee_total;

        let receipt = self
            .ledger
            .create_receipt(
                &invoice,
                charge_amount,
                fee_invoice.as_ref().map(|f| f.number.as_str()),
                None,
                request.today,
            )
            .await?;

        let ledger = self.ledger.clone();
        let to_delete = receipt.clone();
        saga.push("delete_draft_receipt", move || async move {
            ledger.delete_receipt(&to_delete).await
        });

        let mut metadata = charge_metadata(&invoice, request, &receipt.id);
        match &fee_invoice {
            Some(draft) => {
                metadata.insert(
                    metadata_keys::DRAFT_FEES_INVOICE_ID.to_string(),
                    draft.number.clone(),
                );
                metadata.insert(metadata_keys::FEES_INVOICE_ID.to_string(), String::new());
            }
            None => mark_no_fees(&mut metadata),
        }

        let attached = method.customer_id.is_some();
        let charge = self
            .gateway
            .create_charge(ChargeRequest {
                customer_id: customer.id.clone(),
                payment_method_id: method.id.clone(),
                family: PaymentMethodFamily::Card,
                amount: charge_amount,
                currency,
                capture_method: CaptureMethod::Manual,
                off_session: attached,
                setup_future_usage: !attached,
                description: charge_description(&invoice),
                statement_descriptor_suffix: Some(invoice.number.clone()),
                metadata,
                idempotency_key: Uuid::new_v4().to_string(),
            })
            .await?;

        let this = self.clone();
        let (invoice_id, charge_id) = (invoice.id.clone(), charge.id.clone());
        saga.push("cancel_charge", move || async move {
            this.cancel_charge(&invoice_id, &charge_id).await.map(|_| ())
        });

        if charge.status != ChargeStatus::RequiresCapture {
            warn!(charge_id = %charge.id, status = ?charge.status, "Card authorization incomplete");
            return Err(PaymentError::UnexpectedChargeStatus {
                charge_id: charge.id,
                status: charge.status,
            });
        }

        self.record_attempt(&invoice.id, &charge, amount, open_balance)
            .await?;

        let captured = self
            .gateway
            .capture_charge(&charge.id)
            .await
            .inspect_err(|err| warn!(charge_id = %charge.id, error = %err, "Capture failed"))?;

        // Money has moved. Nothing from here on is rolled back.
        saga.disarm_all();
        record_amount(currency.symbol(), captured.amount_received);
        info!(
            charge_id = %captured.id,
            amount,
            fee = fee_total,
            "Card payment captured"
        );

        let receipt_id = self
            .settle_card_payment(&invoice, &captured, amount, partial, fee_invoice.as_ref(), &receipt)
            .await
            .inspect_err(|err| {
                error!(
                    alert = true,
                    charge_id = %captured.id,
                    draft_receipt_id = %receipt.id,
                    error = %err,
                    "Captured card payment not reconciled, invoice left locked"
                );
            })?;

        Ok(PaymentOutcome::Captured {
            charge_id: captured.id,
            amount,
            fee: fee_total,
            receipt_id,
        })
    }

    /// Post-capture bookkeeping. Errors here leave the invoice locked for a
    /// human to finish.
    async fn settle_card_payment(
        &self,
        invoice: &Invoice,
        captured: &Charge,
        amount: i64,
        partial: bool,
        fee_invoice: Option<&DraftFeeInvoice>,
        receipt: &DraftReceipt,
    ) -> Result<String, PaymentError> {
        let approved_fee = match fee_invoice {
            Some(draft) => Some(self.ledger.approve_fee_invoice(draft).await?),
            None => None,
        };
        let fee_number = approved_fee.as_ref().map(|f| f.number.clone());
        let linked = approved_fee.as_ref().map(|f| LinkedFeeInvoice {
            number: f.number.clone(),
            amount_fees: f.total_after_tax,
        });

        let status = AttemptStatus::from(captured.status);
        update_attempt(
            self.store.as_ref(),
            &invoice.id,
            &captured.id,
            self.payments.store_max_attempts,
            None,
            |attempt| {
                attempt.status = status;
                attempt.amount_received = captured.amount_received;
                attempt.linked_fee_invoice = linked.clone();
                attempt.draft_receipt_id = Some(receipt.id.clone());
            },
        )
        .await?;

        self.ledger
            .patch_receipt(receipt, &invoice.number, fee_number.as_deref(), partial)
            .await?;
        let approved = self.ledger.approve_receipt(receipt).await?;

        let metadata = HashMap::from([
            (metadata_keys::RECEIPT_ID.to_string(), approved.id.clone()),
            (
                metadata_keys::FEES_INVOICE_ID.to_string(),
                fee_number
                    .clone()
                    .unwrap_or_else(|| metadata_keys::NOT_APPLICABLE.to_string()),
            ),
        ]);
        if let Err(err) = self
            .gateway
            .update_charge_metadata(&captured.id, metadata)
            .await
        {
            error!(charge_id = %captured.id, error = %err, "Failed to record receipt on charge");
        }

        let finalized = update_attempt(
            self.store.as_ref(),
            &invoice.id,
            &captured.id,
            self.payments.store_max_attempts,
            Some(amount),
            |attempt| attempt.receipt_id = Some(approved.id.clone()),
        )
        .await;
        if let Err(err) = finalized {
            error!(
                alert = true,
                charge_id = %captured.id,
                receipt_id = %approved.id,
                error = %err,
                "Failed to record receipt on invoice"
            );
        }

        if let Err(err) = self.locks.unlock(&invoice.id).await {
            warn!(error = %err, "Failed to unlock invoice after payment");
        }

        info!(
            charge_id = %captured.id,
            receipt_id = %approved.id,
            "Card payment reconciled"
        );
        Ok(approved.id)
    }

    async fn debit_payment(
        &self,
        request: &PaymentRequest,
        saga: &mut Saga,
    ) -> Result<PaymentOutcome, PaymentError> {
        let Prepared {
            invoice,
            open_balance,
            amount,
            currency,
            customer,
            method,
            ..
        } = match self.preflight(request).await? {
            Preflight::Skip(reason) => return Ok(PaymentOutcome::Skipped(reason)),
            Preflight::Ready(prepared) => *prepared,
        };

        let mut metadata = charge_metadata(&invoice, request, "");
        mark_no_fees(&mut metadata);

        let charge = self
            .gateway
            .create_charge(ChargeRequest {
                customer_id: customer.id.clone(),
                payment_method_id: method.id.clone(),
                family: request.family,
                amount,
                currency,
                capture_method: CaptureMethod::Automatic,
                off_session: true,
                setup_future_usage: false,
                description: charge_description(&invoice),
                statement_descriptor_suffix: Some(invoice.number.clone()),
                metadata,
                idempotency_key: Uuid::new_v4().to_string(),
            })
            .await?;

        if !matches!(
            charge.status,
            ChargeStatus::Processing | ChargeStatus::Succeeded
        ) {
            warn!(charge_id = %charge.id, status = ?charge.status, "Debit pull not confirmed");
            if let Err(err) = self.gateway.cancel_charge(&charge.id).await {
                warn!(charge_id = %charge.id, error = %err, "Failed to cancel unconfirmed debit pull");
            }
            return Err(PaymentError::UnexpectedChargeStatus {
                charge_id: charge.id,
                status: charge.status,
            });
        }

        if let Err(err) = self
            .record_attempt(&invoice.id, &charge, amount, open_balance)
            .await
        {
            error!(
                alert = true,
                charge_id = %charge.id,
                error = %err,
                "Debit pull confirmed but not recorded on invoice, invoice left locked"
            );
            // Money is in flight; a released lock would let the next run pull again
            saga.disarm_all();
            return Err(err);
        }

        saga.disarm_all();
        if let Err(err) = self.locks.unlock(&invoice.id).await {
            warn!(error = %err, "Failed to unlock invoice after debit pull");
        }

        info!(charge_id = %charge.id, amount, "Debit pull processing");
        Ok(PaymentOutcome::Processing {
            charge_id: charge.id,
            amount,
        })
    }

    /// Append the attempt, re-validating the amount against the stored
    /// invoice inside the same transaction.
    async fn record_attempt(
        &self,
        invoice_id: &str,
        charge: &Charge,
        amount: i64,
        open_balance: i64,
    ) -> Result<(), PaymentError> {
        let validator = self.validator;
        compare_and_swap(
            self.store.as_ref(),
            invoice_id,
            self.payments.store_max_attempts,
            |current| {
                let mut invoice = current
                    .ok_or_else(|| PaymentError::InvoiceNotFound(invoice_id.to_string()))?;

                if !validator.is_valid(&invoice, amount, invoice.debit, open_balance) {
                    return Err(PaymentError::AmountMismatch {
                        invoice_id: invoice_id.to_string(),
                        requested: amount,
                        cached: invoice.debit,
                        open: open_balance,
                    });
                }

                let debit = invoice.debit;
                invoice.payment_attempts.push(PaymentAttempt {
                    id: charge.id.clone(),
                    amount,
                    amount_with_fees: charge.amount,
                    amount_received: charge.amount_received,
                    currency: charge.currency.symbol().to_ascii_lowercase(),
                    status: charge.status.into(),
                    family: charge.family,
                    debit,
                    created_at: Utc::now(),
                    linked_fee_invoice: None,
                    draft_receipt_id: None,
                    receipt_id: None,
                    canceled_at: None,
                });
                Ok(Mutation::Write(invoice, ()))
            },
        )
        .await
    }
}

fn charge_metadata(
    invoice: &Invoice,
    request: &PaymentRequest,
    draft_receipt_id: &str,
) -> HashMap<String, String> {
    let email = request
        .email
        .clone()
        .or_else(|| request.payer.email.clone())
        .unwrap_or_default();

    [
        (metadata_keys::EMAIL, email),
        (metadata_keys::CUSTOMER_ID, request.payer.customer.id.clone()),
        (metadata_keys::PAYER_ID, request.payer.id.clone()),
        (metadata_keys::INVOICE_ID, invoice.id.clone()),
        (metadata_keys::DRAFT_RECEIPT_ID, draft_receipt_id.to_string()),
        (metadata_keys::RECEIPT_ID, String::new()),
    ]
    .into_iter()
    .map(|(key, value)| (key.to_string(), value))
    .collect()
}

fn mark_no_fees(metadata: &mut HashMap<String, String>) {
    for key in [
        metadata_keys::DRAFT_FEES_INVOICE_ID,
        metadata_keys::FEES_INVOICE_ID,
    ] {
        metadata.insert(key.to_string(), metadata_keys::NOT_APPLICABLE.to_string());
    }
}

fn charge_description(invoice: &Invoice) -> String {
    format!("{} invoice {}", invoice.ledger_customer, invoice.number)
}

/// Charge on the pay date itself, then every `remainder` days after it.
fn is_collection_day(pay_date: NaiveDate, today: NaiveDate, remainder: i64) -> bool {
    let overdue = (today - pay_date).num_days();
    overdue == 0 || (overdue > 0 && overdue % remainder == 0)
}

/// Insufficient funds may clear for the next invoice; any other card
/// failure will not.
fn stops_card_run(err: &PaymentError) -> bool {
    err.gateway().is_some_and(|g| !g.is_insufficient_funds())
}
