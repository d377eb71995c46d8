//! Invoice collections engine.
//!
//! Charges invoices through the payment gateway and keeps the invoice store
//! and the accounting ledger consistent with what the gateway collected.

pub mod config;
pub mod error;
pub mod models;
pub mod services;

pub use config::CollectionsConfig;
pub use error::PaymentError;
