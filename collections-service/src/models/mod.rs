//! Domain models for collections-service.

mod charge;
mod invoice;
mod ledger;
mod payer;

pub use charge::{
    CaptureMethod, Charge, ChargeError, ChargeRequest, ChargeStatus, Currency, GatewayCustomer,
    PaymentMethod, metadata_keys,
};
pub use invoice::{AttemptStatus, Invoice, LinkedFeeInvoice, PaymentAttempt, PaymentMethodFamily};
pub use ledger::{
    DraftFeeInvoice, DraftReceipt, LedgerInvoice, LedgerReceipt, NewFeeInvoice, NewReceipt,
    OpenBalance, PaymentLine, ReceiptStatus,
};
pub use payer::{Customer, DefaultPaymentMethod, Payer};
