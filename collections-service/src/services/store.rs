//! Invoice document store with optimistic concurrency.
//!
//! Every write goes through [`compare_and_swap`]: read the current document,
//! let the caller decide what to write, and commit only if nobody else
//! committed in between. Conflicts are retried a bounded number of times.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::{doc, Document};
use mongodb::options::IndexOptions;
use mongodb::{Client, Collection, Database, IndexModel};
use secrecy::ExposeSecret;
use service_core::error::AppError;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::config::DatabaseConfig;
use crate::error::{PaymentError, StoreError};
use crate::models::{Invoice, PaymentAttempt};
use crate::services::metrics::record_store_conflict;

/// Result of a version-checked write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// The stored version moved on since it was read.
    Conflict,
}

/// Decision returned by a [`compare_and_swap`] closure.
#[derive(Debug)]
pub enum Mutation<T> {
    /// Commit this document and return the value.
    Write(Invoice, T),
    /// Leave the document untouched and return the value.
    Abort(T),
}

#[async_trait]
pub trait InvoiceStore: Send + Sync {
    async fn fetch(&self, invoice_id: &str) -> Result<Option<Invoice>, StoreError>;

    /// Replace the stored invoice if its version still equals
    /// `expected_version`. The committed document carries `expected_version + 1`.
    async fn commit(
        &self,
        invoice: &Invoice,
        expected_version: i64,
    ) -> Result<CommitOutcome, StoreError>;

    async fn insert(&self, invoice: &Invoice) -> Result<(), StoreError>;

    /// Unpaid, uncanceled invoices of a payer with a positive balance.
    async fn list_open_for_payer(&self, payer_id: &str) -> Result<Vec<Invoice>, StoreError>;
}

/// Run `mutate` against the current invoice and commit its result, retrying
/// on version conflicts up to `max_attempts` times.
///
/// The closure may run several times and must not have side effects beyond
/// the returned mutation. An error from the closure aborts the transaction.
pub async fn compare_and_swap<S, T, F>(
    store: &S,
    invoice_id: &str,
    max_attempts: u32,
    mut mutate: F,
) -> Result<T, PaymentError>
where
    S: InvoiceStore + ?Sized,
    F: FnMut(Option<Invoice>) -> Result<Mutation<T>, PaymentError>,
{
    let max_attempts = max_attempts.max(1);

    for attempt in 1..=max_attempts {
        let current = store.fetch(invoice_id).await?;
        let expected_version = current.as_ref().map(|i| i.version).unwrap_or_default();

        match mutate(current)? {
            Mutation::Abort(out) => return Ok(out),
            Mutation::Write(next, out) => match store.commit(&next, expected_version).await? {
                CommitOutcome::Committed => return Ok(out),
                CommitOutcome::Conflict => {
                    record_store_conflict("retried");
                    debug!(
                        invoice_id = %invoice_id,
                        attempt,
                        "Invoice transaction conflicted, retrying"
                    );
                }
            },
        }
    }

    record_store_conflict("exhausted");
    warn!(
        invoice_id = %invoice_id,
        max_attempts,
        "Invoice transaction failed after max attempts"
    );
    Err(PaymentError::TransactionConflict(invoice_id.to_string()))
}

/// Update one payment attempt in place and, when `settled` is given, reduce
/// the invoice balance by that amount in the same transaction.
pub async fn update_attempt<S, F>(
    store: &S,
    invoice_id: &str,
    charge_id: &str,
    max_attempts: u32,
    settled: Option<i64>,
    mut apply: F,
) -> Result<(), PaymentError>
where
    S: InvoiceStore + ?Sized,
    F: FnMut(&mut PaymentAttempt),
{
    compare_and_swap(store, invoice_id, max_attempts, |current| {
        let mut invoice =
            current.ok_or_else(|| PaymentError::InvoiceNotFound(invoice_id.to_string()))?;
        let attempt =
            invoice
                .attempt_mut(charge_id)
                .ok_or_else(|| PaymentError::AttemptNotFound {
                    invoice_id: invoice_id.to_string(),
                    charge_id: charge_id.to_string(),
                })?;
        apply(attempt);
        if let Some(amount) = settled {
            invoice.apply_payment(amount);
        }
        Ok(Mutation::Write(invoice, ()))
    })
    .await
}

/// Process-local store, used by tests and local runs.
#[derive(Clone, Default)]
pub struct InMemoryInvoiceStore {
    invoices: Arc<RwLock<HashMap<String, Invoice>>>,
}

impl InMemoryInvoiceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InvoiceStore for InMemoryInvoiceStore {
    async fn fetch(&self, invoice_id: &str) -> Result<Option<Invoice>, StoreError> {
        Ok(self.invoices.read().await.get(invoice_id).cloned())
    }

    async fn commit(
        &self,
        invoice: &Invoice,
        expected_version: i64,
    ) -> Result<CommitOutcome, StoreError> {
        let mut invoices = self.invoices.write().await;
        match invoices.get(&invoice.id) {
            Some(stored) if stored.version == expected_version => {
                let mut next = invoice.clone();
                next.version = expected_version + 1;
                invoices.insert(next.id.clone(), next);
                Ok(CommitOutcome::Committed)
            }
            _ => Ok(CommitOutcome::Conflict),
        }
    }

    async fn insert(&self, invoice: &Invoice) -> Result<(), StoreError> {
        self.invoices
            .write()
            .await
            .insert(invoice.id.clone(), invoice.clone());
        Ok(())
    }

    async fn list_open_for_payer(&self, payer_id: &str) -> Result<Vec<Invoice>, StoreError> {
        Ok(self
            .invoices
            .read()
            .await
            .values()
            .filter(|i| i.payer_id == payer_id && i.has_open_debit())
            .cloned()
            .collect())
    }
}

/// MongoDB-backed store. The `version` field guards every replace.
#[derive(Clone)]
pub struct MongoInvoiceStore {
    collection: Collection<Invoice>,
}

impl MongoInvoiceStore {
    pub fn new(db: &Database) -> Self {
        Self {
            collection: db.collection("invoices"),
        }
    }

    /// Connect to the configured database and make sure indexes exist.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, PaymentError> {
        let client = Client::with_uri_str(config.url.expose_secret())
            .await
            .map_err(AppError::from)?;
        let store = Self::new(&client.database(&config.db_name));
        store.init_indexes().await?;
        Ok(store)
    }

    pub async fn init_indexes(&self) -> Result<(), StoreError> {
        // Open invoices per payer, for batch runs
        let payer_open_index = IndexModel::builder()
            .keys(doc! { "payer_id": 1, "paid": 1, "canceled": 1 })
            .options(
                IndexOptions::builder()
                    .name("payer_open_invoices_idx".to_string())
                    .build(),
            )
            .build();

        self.collection
            .create_indexes([payer_open_index], None)
            .await?;

        tracing::info!("Invoice store indexes initialized");
        Ok(())
    }
}

#[async_trait]
impl InvoiceStore for MongoInvoiceStore {
    async fn fetch(&self, invoice_id: &str) -> Result<Option<Invoice>, StoreError> {
        let invoice = self
            .collection
            .find_one(doc! { "_id": invoice_id }, None)
            .await?;
        Ok(invoice)
    }

    async fn commit(
        &self,
        invoice: &Invoice,
        expected_version: i64,
    ) -> Result<CommitOutcome, StoreError> {
        // Documents written before versioning have no field and read as 0
        let filter = if expected_version == 0 {
            doc! {
                "_id": &invoice.id,
                "$or": [{ "version": 0_i64 }, { "version": { "$exists": false } }],
            }
        } else {
            doc! { "_id": &invoice.id, "version": expected_version }
        };

        let mut next = invoice.clone();
        next.version = expected_version + 1;

        let replacement = mongodb::bson::to_document(&next)?;
        let result = self
            .collection
            .clone_with_type::<Document>()
            .replace_one(filter, replacement, None)
            .await?;
        if result.matched_count == 0 {
            return Ok(CommitOutcome::Conflict);
        }
        Ok(CommitOutcome::Committed)
    }

    async fn insert(&self, invoice: &Invoice) -> Result<(), StoreError> {
        self.collection.insert_one(invoice, None).await?;
        Ok(())
    }

    async fn list_open_for_payer(&self, payer_id: &str) -> Result<Vec<Invoice>, StoreError> {
        let filter = doc! {
            "payer_id": payer_id,
            "paid": false,
            "canceled": false,
            "debit": { "$gt": 0_i64 },
        };
        let cursor = self.collection.find(filter, None).await?;
        let invoices: Vec<Invoice> = cursor.try_collect().await?;
        Ok(invoices)
    }
}
