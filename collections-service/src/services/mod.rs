pub mod fees;
pub mod gateway;
pub mod ledger;
pub mod lock;
pub mod metrics;
pub mod orchestrator;
pub mod payers;
pub mod saga;
pub mod store;
pub mod validator;
pub mod webhook;

pub use fees::FeeCalculator;
pub use gateway::{PaymentGateway, WebhookEvent, WebhookEventKind, WebhookVerifier};
pub use ledger::{Ledger, LedgerReceiptCoordinator};
pub use lock::InvoiceLockManager;
pub use metrics::get_metrics;
pub use orchestrator::{
    AutomaticPaymentsInput, BatchReport, PaymentOrchestrator, PaymentOutcome, PaymentRequest,
    SkipReason,
};
pub use payers::{
    InMemoryPayerStore, ListedPaymentMethod, MongoPayerStore, PayerStore, PaymentMethodService,
};
pub use saga::{Saga, StepId};
pub use store::{
    compare_and_swap, update_attempt, CommitOutcome, InMemoryInvoiceStore, InvoiceStore,
    MongoInvoiceStore, Mutation,
};
pub use validator::AmountValidator;
pub use webhook::{WebhookOutcome, WebhookReconciler};
