#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use collections_service::config::{ChargeLimits, FeePolicy, PaymentsConfig};
use collections_service::error::{GatewayError, GatewayErrorKind, LedgerError};
use collections_service::models::{
    CaptureMethod, Charge, ChargeRequest, ChargeStatus, Customer, DefaultPaymentMethod,
    GatewayCustomer, Invoice, LedgerInvoice, LedgerReceipt, NewFeeInvoice, NewReceipt,
    OpenBalance, Payer, PaymentLine, PaymentMethod, PaymentMethodFamily, ReceiptStatus,
};
use collections_service::services::{
    InMemoryInvoiceStore, InMemoryPayerStore, InvoiceStore, Ledger, PayerStore, PaymentGateway,
    PaymentMethodService, PaymentOrchestrator, PaymentRequest, WebhookReconciler, WebhookVerifier,
};
use once_cell::sync::Lazy;
use secrecy::Secret;
use service_core::observability::init_tracing;
use service_core::retry::RetryConfig;
use service_core::utils::signature::signature_header;

pub const PAYER_ID: &str = "payer-1";
pub const CUSTOMER_ID: &str = "cust-1";
pub const GATEWAY_CUSTOMER_ID: &str = "cus_test";
pub const CARD_ID: &str = "pm_card";
pub const SEPA_ID: &str = "pm_sepa";
pub const BACS_ID: &str = "pm_bacs";
pub const WEBHOOK_SECRET: &str = "whsec_test";

static TRACING: Lazy<()> = Lazy::new(|| {
    if std::env::var("TEST_LOG").is_ok() {
        init_tracing("collections-service-test", "collections_service=debug", None)
            .expect("Failed to install subscriber");
    }
});

pub fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 6, 10).unwrap()
}

pub fn days_before_today(days: i64) -> NaiveDate {
    today() - chrono::Duration::days(days)
}

pub fn invoice(id: &str, debit: i64) -> Invoice {
    Invoice {
        id: id.to_string(),
        number: format!("IV-{id}"),
        payer_id: PAYER_ID.to_string(),
        customer_id: CUSTOMER_ID.to_string(),
        ledger_company: "acme".to_string(),
        ledger_customer: "C100".to_string(),
        currency: "USD".to_string(),
        total: debit,
        tax: 0,
        debit,
        details: String::new(),
        date: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
        pay_date: today(),
        paid: false,
        canceled: false,
        locked: false,
        payment_attempts: Vec::new(),
        version: 0,
    }
}

pub fn payer() -> Payer {
    Payer {
        id: PAYER_ID.to_string(),
        name: "Acme Inc".to_string(),
        email: Some("ap@acme.test".to_string()),
        company_country: "United States".to_string(),
        country: "United States".to_string(),
        state: Some("NY".to_string()),
        gateway_customer_id: Some(GATEWAY_CUSTOMER_ID.to_string()),
        default_payment_method: Some(DefaultPaymentMethod {
            id: CARD_ID.to_string(),
            family: PaymentMethodFamily::Card,
        }),
        customer: Customer {
            id: CUSTOMER_ID.to_string(),
            name: "Acme".to_string(),
            surcharge_opt_out: false,
        },
    }
}

#[derive(Default)]
struct GatewayState {
    customers: HashMap<String, GatewayCustomer>,
    methods: HashMap<String, PaymentMethod>,
    charges: HashMap<String, Charge>,
    requests: Vec<ChargeRequest>,
    canceled: Vec<String>,
    detached: Vec<String>,
    next_id: u32,
    fail_next_create: Option<GatewayError>,
    fail_capture: Option<GatewayError>,
    create_status: Option<ChargeStatus>,
}

/// In-process gateway. Charges move through the same statuses the real one
/// reports; failures are scripted per test.
#[derive(Default)]
pub struct FakeGateway {
    state: Mutex<GatewayState>,
}

impl FakeGateway {
    pub fn add_customer(&self, id: &str, payer_id: &str) {
        self.state.lock().unwrap().customers.insert(
            id.to_string(),
            GatewayCustomer {
                id: id.to_string(),
                email: None,
                metadata: HashMap::from([("payer_id".to_string(), payer_id.to_string())]),
            },
        );
    }

    pub fn add_payment_method(&self, method: PaymentMethod) {
        self.state
            .lock()
            .unwrap()
            .methods
            .insert(method.id.clone(), method);
    }

    pub fn fail_next_create(&self, err: GatewayError) {
        self.state.lock().unwrap().fail_next_create = Some(err);
    }

    pub fn fail_capture(&self, err: GatewayError) {
        self.state.lock().unwrap().fail_capture = Some(err);
    }

    /// Status reported for newly created charges instead of the natural one.
    pub fn set_create_status(&self, status: ChargeStatus) {
        self.state.lock().unwrap().create_status = Some(status);
    }

    /// Settle a debit pull the way the bank eventually does.
    pub fn settle(&self, charge_id: &str) -> Charge {
        let mut state = self.state.lock().unwrap();
        let charge = state.charges.get_mut(charge_id).unwrap();
        charge.status = ChargeStatus::Succeeded;
        charge.amount_received = charge.amount;
        charge.clone()
    }

    pub fn charge(&self, charge_id: &str) -> Charge {
        self.state.lock().unwrap().charges[charge_id].clone()
    }

    pub fn requests(&self) -> Vec<ChargeRequest> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn canceled(&self) -> Vec<String> {
        self.state.lock().unwrap().canceled.clone()
    }

    pub fn detached(&self) -> Vec<String> {
        self.state.lock().unwrap().detached.clone()
    }

    pub fn payment_method(&self, id: &str) -> PaymentMethod {
        self.state.lock().unwrap().methods[id].clone()
    }

    fn not_found(what: &str, id: &str) -> GatewayError {
        GatewayError::new(
            GatewayErrorKind::InvalidRequest,
            format!("No such {what}: '{id}'"),
        )
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn get_customer(&self, customer_id: &str) -> Result<GatewayCustomer, GatewayError> {
        tokio::task::yield_now().await;
        self.state
            .lock()
            .unwrap()
            .customers
            .get(customer_id)
            .cloned()
            .ok_or_else(|| Self::not_found("customer", customer_id))
    }

    async fn get_payment_method(
        &self,
        payment_method_id: &str,
    ) -> Result<PaymentMethod, GatewayError> {
        self.state
            .lock()
            .unwrap()
            .methods
            .get(payment_method_id)
            .cloned()
            .ok_or_else(|| Self::not_found("payment_method", payment_method_id))
    }

    async fn list_payment_methods(
        &self,
        customer_id: &str,
    ) -> Result<Vec<PaymentMethod>, GatewayError> {
        let state = self.state.lock().unwrap();
        let mut methods: Vec<PaymentMethod> = state
            .methods
            .values()
            .filter(|m| m.customer_id.as_deref() == Some(customer_id))
            .cloned()
            .collect();
        methods.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(methods)
    }

    async fn detach_payment_method(
        &self,
        payment_method_id: &str,
    ) -> Result<PaymentMethod, GatewayError> {
        let mut state = self.state.lock().unwrap();
        let method = state
            .methods
            .get_mut(payment_method_id)
            .ok_or_else(|| Self::not_found("payment_method", payment_method_id))?;
        method.customer_id = None;
        let detached = method.clone();
        state.detached.push(payment_method_id.to_string());
        Ok(detached)
    }

    async fn update_payment_method_metadata(
        &self,
        payment_method_id: &str,
        metadata: HashMap<String, String>,
    ) -> Result<PaymentMethod, GatewayError> {
        let mut state = self.state.lock().unwrap();
        let method = state
            .methods
            .get_mut(payment_method_id)
            .ok_or_else(|| Self::not_found("payment_method", payment_method_id))?;
        method.metadata.extend(metadata);
        Ok(method.clone())
    }

    async fn create_charge(&self, request: ChargeRequest) -> Result<Charge, GatewayError> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock().unwrap();
        state.requests.push(request.clone());

        if let Some(err) = state.fail_next_create.take() {
            return Err(err);
        }

        state.next_id += 1;
        let natural = match (request.capture_method, request.family.is_debit_pull()) {
            (CaptureMethod::Manual, _) => ChargeStatus::RequiresCapture,
            (CaptureMethod::Automatic, true) => ChargeStatus::Processing,
            (CaptureMethod::Automatic, false) => ChargeStatus::Succeeded,
        };
        let status = state.create_status.unwrap_or(natural);

        let charge = Charge {
            id: format!("pi_{}", state.next_id),
            amount: request.amount,
            amount_received: if status == ChargeStatus::Succeeded {
                request.amount
            } else {
                0
            },
            currency: request.currency,
            status,
            customer_id: request.customer_id,
            payment_method_id: Some(request.payment_method_id),
            family: request.family,
            metadata: request.metadata,
            last_error: None,
            created: Utc::now(),
        };
        state.charges.insert(charge.id.clone(), charge.clone());
        Ok(charge)
    }

    async fn capture_charge(&self, charge_id: &str) -> Result<Charge, GatewayError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.fail_capture.take() {
            return Err(err);
        }
        let charge = state
            .charges
            .get_mut(charge_id)
            .ok_or_else(|| Self::not_found("payment_intent", charge_id))?;
        charge.status = ChargeStatus::Succeeded;
        charge.amount_received = charge.amount;
        Ok(charge.clone())
    }

    async fn cancel_charge(&self, charge_id: &str) -> Result<Charge, GatewayError> {
        let mut state = self.state.lock().unwrap();
        state.canceled.push(charge_id.to_string());
        let charge = state
            .charges
            .get_mut(charge_id)
            .ok_or_else(|| Self::not_found("payment_intent", charge_id))?;
        charge.status = ChargeStatus::Canceled;
        Ok(charge.clone())
    }

    async fn get_charge(&self, charge_id: &str) -> Result<Charge, GatewayError> {
        self.state
            .lock()
            .unwrap()
            .charges
            .get(charge_id)
            .cloned()
            .ok_or_else(|| Self::not_found("payment_intent", charge_id))
    }

    async fn update_charge_metadata(
        &self,
        charge_id: &str,
        metadata: HashMap<String, String>,
    ) -> Result<Charge, GatewayError> {
        let mut state = self.state.lock().unwrap();
        let charge = state
            .charges
            .get_mut(charge_id)
            .ok_or_else(|| Self::not_found("payment_intent", charge_id))?;
        charge.metadata.extend(metadata);
        Ok(charge.clone())
    }
}

#[derive(Debug, Clone)]
pub struct StoredReceipt {
    pub receipt: LedgerReceipt,
    pub request: NewReceipt,
    pub lines: Vec<PaymentLine>,
    pub approved_id: Option<String>,
}

#[derive(Default)]
struct LedgerState {
    balances: HashMap<String, i64>,
    invoices: HashMap<String, LedgerInvoice>,
    receipts: Vec<StoredReceipt>,
    deletions: Vec<String>,
    next_id: u32,
    fail_receipt_approval: bool,
}

/// Ledger with open balances per invoice number and receipts whose lines
/// settle them.
#[derive(Default)]
pub struct FakeLedger {
    state: Mutex<LedgerState>,
}

impl FakeLedger {
    pub fn set_balance(&self, invoice_number: &str, balance: i64) {
        self.state
            .lock()
            .unwrap()
            .balances
            .insert(invoice_number.to_string(), balance);
    }

    pub fn balance(&self, invoice_number: &str) -> i64 {
        self.state
            .lock()
            .unwrap()
            .balances
            .get(invoice_number)
            .copied()
            .unwrap_or_default()
    }

    pub fn fail_receipt_approval(&self) {
        self.state.lock().unwrap().fail_receipt_approval = true;
    }

    pub fn receipts(&self) -> Vec<StoredReceipt> {
        self.state.lock().unwrap().receipts.clone()
    }

    /// Deleted documents in deletion order, as `receipt:<id>` or
    /// `invoice:<number>`.
    pub fn deletions(&self) -> Vec<String> {
        self.state.lock().unwrap().deletions.clone()
    }

    pub fn fee_invoices(&self) -> Vec<LedgerInvoice> {
        self.state.lock().unwrap().invoices.values().cloned().collect()
    }

    fn receipt_mut<'a>(
        state: &'a mut LedgerState,
        receipt_id: &str,
    ) -> Result<&'a mut StoredReceipt, LedgerError> {
        state
            .receipts
            .iter_mut()
            .find(|r| r.receipt.id == receipt_id)
            .ok_or_else(|| LedgerError::NotFound(format!("receipt {receipt_id}")))
    }
}

#[async_trait]
impl Ledger for FakeLedger {
    async fn open_balance(
        &self,
        _company: &str,
        _customer: &str,
        invoice_number: &str,
    ) -> Result<Option<OpenBalance>, LedgerError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .balances
            .get(invoice_number)
            .filter(|balance| **balance > 0)
            .map(|balance| OpenBalance {
                invoice_number: invoice_number.to_string(),
                debit: *balance,
            }))
    }

    async fn create_invoice(&self, invoice: NewFeeInvoice) -> Result<LedgerInvoice, LedgerError> {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let created = LedgerInvoice {
            number: format!("FI{}", state.next_id),
            company: invoice.company,
            amount: invoice.amount,
            tax: invoice.tax,
            total_after_tax: invoice.amount + invoice.tax,
            status: ReceiptStatus::Draft,
        };
        state.invoices.insert(created.number.clone(), created.clone());
        Ok(created)
    }

    async fn approve_invoice(
        &self,
        _company: &str,
        number: &str,
    ) -> Result<LedgerInvoice, LedgerError> {
        let mut state = self.state.lock().unwrap();
        let invoice = state
            .invoices
            .get_mut(number)
            .ok_or_else(|| LedgerError::NotFound(format!("invoice {number}")))?;
        invoice.status = ReceiptStatus::Approved;
        Ok(invoice.clone())
    }

    async fn delete_invoice(&self, _company: &str, number: &str) -> Result<(), LedgerError> {
        let mut state = self.state.lock().unwrap();
        let invoice = state
            .invoices
            .get_mut(number)
            .ok_or_else(|| LedgerError::NotFound(format!("invoice {number}")))?;
        invoice.status = ReceiptStatus::Deleted;
        state.deletions.push(format!("invoice:{number}"));
        Ok(())
    }

    async fn create_receipt(&self, receipt: NewReceipt) -> Result<LedgerReceipt, LedgerError> {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;

        let balance = state
            .balances
            .get(&receipt.invoice_number)
            .copied()
            .unwrap_or_default();
        let mut lines = vec![PaymentLine {
            reference: receipt.invoice_number.clone(),
            trans: 1,
            line: 1,
            credit: balance,
            paid: false,
        }];
        if let Some(fee_number) = &receipt.fee_invoice_number {
            let fee_total = state
                .invoices
                .get(fee_number)
                .map(|i| i.total_after_tax)
                .unwrap_or_default();
            lines.push(PaymentLine {
                reference: fee_number.clone(),
                trans: 2,
                line: 2,
                credit: fee_total,
                paid: false,
            });
        }

        let created = LedgerReceipt {
            id: format!("T{}", state.next_id),
            company: receipt.company.clone(),
            total: receipt.amount,
            status: ReceiptStatus::Draft,
        };
        state.receipts.push(StoredReceipt {
            receipt: created.clone(),
            request: receipt,
            lines,
            approved_id: None,
        });
        Ok(created)
    }

    async fn receipt_payment_lines(
        &self,
        _company: &str,
        receipt_id: &str,
        references: &[String],
    ) -> Result<Vec<PaymentLine>, LedgerError> {
        let mut state = self.state.lock().unwrap();
        let stored = Self::receipt_mut(&mut state, receipt_id)?;
        Ok(stored
            .lines
            .iter()
            .filter(|l| references.contains(&l.reference))
            .cloned()
            .collect())
    }

    async fn flag_payment_line(
        &self,
        _company: &str,
        receipt_id: &str,
        line: &PaymentLine,
    ) -> Result<(), LedgerError> {
        let mut state = self.state.lock().unwrap();
        let stored = Self::receipt_mut(&mut state, receipt_id)?;
        for l in stored.lines.iter_mut().filter(|l| l.line == line.line) {
            l.paid = true;
        }
        Ok(())
    }

    async fn receipt_credit_lines(
        &self,
        _company: &str,
        receipt_id: &str,
    ) -> Result<Vec<PaymentLine>, LedgerError> {
        let mut state = self.state.lock().unwrap();
        Ok(Self::receipt_mut(&mut state, receipt_id)?.lines.clone())
    }

    async fn set_line_credit(
        &self,
        _company: &str,
        receipt_id: &str,
        line: &PaymentLine,
        credit: i64,
    ) -> Result<(), LedgerError> {
        let mut state = self.state.lock().unwrap();
        let stored = Self::receipt_mut(&mut state, receipt_id)?;
        for l in stored.lines.iter_mut().filter(|l| l.line == line.line) {
            l.credit = credit;
        }
        Ok(())
    }

    async fn approve_receipt(
        &self,
        _company: &str,
        receipt_id: &str,
    ) -> Result<LedgerReceipt, LedgerError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_receipt_approval {
            return Err(LedgerError::Unavailable("ledger is down".to_string()));
        }

        state.next_id += 1;
        let approved_id = format!("RC{}", state.next_id);
        let stored = Self::receipt_mut(&mut state, receipt_id)?;
        stored.receipt.status = ReceiptStatus::Approved;
        stored.approved_id = Some(approved_id.clone());

        let invoice_number = stored.request.invoice_number.clone();
        let credit = stored
            .lines
            .iter()
            .find(|l| l.reference == invoice_number)
            .map(|l| l.credit)
            .unwrap_or_default();
        let mut approved = stored.receipt.clone();
        approved.id = approved_id;

        if let Some(balance) = state.balances.get_mut(&invoice_number) {
            *balance -= credit;
        }
        Ok(approved)
    }

    async fn delete_receipt(&self, _company: &str, receipt_id: &str) -> Result<(), LedgerError> {
        let mut state = self.state.lock().unwrap();
        Self::receipt_mut(&mut state, receipt_id)?.receipt.status = ReceiptStatus::Deleted;
        state.deletions.push(format!("receipt:{receipt_id}"));
        Ok(())
    }
}

pub struct TestApp {
    pub store: Arc<InMemoryInvoiceStore>,
    pub gateway: Arc<FakeGateway>,
    pub ledger: Arc<FakeLedger>,
    pub payers: Arc<InMemoryPayerStore>,
    pub orchestrator: PaymentOrchestrator,
    pub reconciler: WebhookReconciler,
    pub payment_methods: PaymentMethodService,
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::spawn_with(PaymentsConfig {
            rate_limit: Duration::ZERO,
            ..PaymentsConfig::default()
        })
        .await
    }

    pub async fn spawn_with(payments: PaymentsConfig) -> Self {
        Lazy::force(&TRACING);

        let store = Arc::new(InMemoryInvoiceStore::new());
        let gateway = Arc::new(FakeGateway::default());
        let ledger = Arc::new(FakeLedger::default());
        let payers = Arc::new(InMemoryPayerStore::new());
        payers.insert(&payer()).await.expect("Failed to seed payer");

        gateway.add_customer(GATEWAY_CUSTOMER_ID, PAYER_ID);
        gateway.add_payment_method(PaymentMethod {
            id: CARD_ID.to_string(),
            family: PaymentMethodFamily::Card,
            customer_id: Some(GATEWAY_CUSTOMER_ID.to_string()),
            card_expiry: Some((2030, 12)),
            metadata: HashMap::new(),
        });
        gateway.add_payment_method(PaymentMethod {
            id: SEPA_ID.to_string(),
            family: PaymentMethodFamily::SepaDebit,
            customer_id: Some(GATEWAY_CUSTOMER_ID.to_string()),
            card_expiry: None,
            metadata: HashMap::new(),
        });
        gateway.add_payment_method(PaymentMethod {
            id: BACS_ID.to_string(),
            family: PaymentMethodFamily::BacsDebit,
            customer_id: Some(GATEWAY_CUSTOMER_ID.to_string()),
            card_expiry: None,
            metadata: HashMap::new(),
        });

        let store_max_attempts = payments.store_max_attempts;
        let orchestrator = PaymentOrchestrator::new(store.clone(), gateway.clone(), ledger.clone())
            .with_payments(payments)
            .with_fee_policy(FeePolicy::default())
            .with_limits(ChargeLimits::default());

        let verifier = WebhookVerifier::new(Secret::new(WEBHOOK_SECRET.to_string()), None, 300);
        let reconciler = WebhookReconciler::new(
            store.clone(),
            gateway.clone(),
            ledger.clone(),
            payers.clone(),
            verifier,
            store_max_attempts,
        )
        .with_propagation_retry(RetryConfig {
            max_retries: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            add_jitter: false,
        });

        let payment_methods = PaymentMethodService::new(gateway.clone(), payers.clone());

        TestApp {
            store,
            gateway,
            ledger,
            payers,
            orchestrator,
            reconciler,
            payment_methods,
        }
    }

    /// Store the invoice and give the ledger a matching open balance.
    pub async fn seed_invoice(&self, invoice: Invoice) {
        self.ledger.set_balance(&invoice.number, invoice.debit);
        self.store
            .insert(&invoice)
            .await
            .expect("Failed to seed invoice");
    }

    pub async fn payer(&self, id: &str) -> Payer {
        self.payers
            .fetch(id)
            .await
            .expect("Failed to fetch payer")
            .expect("Payer missing")
    }

    pub async fn invoice(&self, id: &str) -> Invoice {
        self.store
            .fetch(id)
            .await
            .expect("Failed to fetch invoice")
            .expect("Invoice missing")
    }

    pub fn card_request(&self, invoice_id: &str, amount: Option<i64>) -> PaymentRequest {
        PaymentRequest {
            invoice_id: invoice_id.to_string(),
            payer: payer(),
            payment_method_id: CARD_ID.to_string(),
            family: PaymentMethodFamily::Card,
            amount,
            email: None,
            today: today(),
        }
    }

    pub fn debit_request(&self, invoice_id: &str, method_id: &str) -> PaymentRequest {
        let family = self.gateway.payment_method(method_id).family;
        PaymentRequest {
            invoice_id: invoice_id.to_string(),
            payer: payer(),
            payment_method_id: method_id.to_string(),
            family,
            amount: None,
            email: None,
            today: today(),
        }
    }

    /// Body and signature header of a webhook delivery signed now.
    pub fn signed_event(&self, event_type: &str, object: serde_json::Value) -> (Vec<u8>, String) {
        let body = serde_json::to_vec(&serde_json::json!({
            "id": format!("evt_{}", uuid::Uuid::new_v4()),
            "type": event_type,
            "data": { "object": object },
        }))
        .expect("Failed to encode event");
        let header = signature_header(WEBHOOK_SECRET, Utc::now().timestamp(), &body)
            .expect("Failed to sign event");
        (body, header)
    }

    pub async fn deliver(
        &self,
        event_type: &str,
        object: serde_json::Value,
    ) -> Result<collections_service::services::WebhookOutcome, collections_service::PaymentError>
    {
        let (body, header) = self.signed_event(event_type, object);
        self.reconciler.handle_event(&body, &header, None).await
    }
}
