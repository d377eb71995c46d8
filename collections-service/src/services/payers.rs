//! Payer documents and management of their stored payment methods.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use mongodb::bson::{self, doc};
use mongodb::{Collection, Database};
use tokio::sync::RwLock;
use tracing::{info, instrument};

use crate::error::{PaymentError, StoreError};
use crate::models::{DefaultPaymentMethod, Payer, PaymentMethod};
use crate::services::gateway::PaymentGateway;

#[async_trait]
pub trait PayerStore: Send + Sync {
    async fn fetch(&self, payer_id: &str) -> Result<Option<Payer>, StoreError>;

    async fn insert(&self, payer: &Payer) -> Result<(), StoreError>;

    /// Replace the payer's default payment method. Returns false when the
    /// payer does not exist.
    async fn set_default_payment_method(
        &self,
        payer_id: &str,
        method: Option<&DefaultPaymentMethod>,
    ) -> Result<bool, StoreError>;
}

#[derive(Default)]
pub struct InMemoryPayerStore {
    payers: RwLock<HashMap<String, Payer>>,
}

impl InMemoryPayerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PayerStore for InMemoryPayerStore {
    async fn fetch(&self, payer_id: &str) -> Result<Option<Payer>, StoreError> {
        Ok(self.payers.read().await.get(payer_id).cloned())
    }

    async fn insert(&self, payer: &Payer) -> Result<(), StoreError> {
        self.payers
            .write()
            .await
            .insert(payer.id.clone(), payer.clone());
        Ok(())
    }

    async fn set_default_payment_method(
        &self,
        payer_id: &str,
        method: Option<&DefaultPaymentMethod>,
    ) -> Result<bool, StoreError> {
        let mut payers = self.payers.write().await;
        match payers.get_mut(payer_id) {
            Some(payer) => {
                payer.default_payment_method = method.cloned();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[derive(Clone)]
pub struct MongoPayerStore {
    collection: Collection<Payer>,
}

impl MongoPayerStore {
    pub fn new(db: &Database) -> Self {
        Self {
            collection: db.collection("payers"),
        }
    }
}

#[async_trait]
impl PayerStore for MongoPayerStore {
    async fn fetch(&self, payer_id: &str) -> Result<Option<Payer>, StoreError> {
        Ok(self
            .collection
            .find_one(doc! { "_id": payer_id }, None)
            .await?)
    }

    async fn insert(&self, payer: &Payer) -> Result<(), StoreError> {
        self.collection.insert_one(payer, None).await?;
        Ok(())
    }

    async fn set_default_payment_method(
        &self,
        payer_id: &str,
        method: Option<&DefaultPaymentMethod>,
    ) -> Result<bool, StoreError> {
        let value = bson::to_bson(&method)?;
        let result = self
            .collection
            .update_one(
                doc! { "_id": payer_id },
                doc! { "$set": { "default_payment_method": value } },
                None,
            )
            .await?;
        Ok(result.matched_count > 0)
    }
}

/// A stored payment method as shown to the payer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedPaymentMethod {
    pub method: PaymentMethod,
    pub is_default: bool,
    /// Why the method cannot be charged right now, if it cannot.
    pub disabled_reason: Option<String>,
}

/// Lists, detaches and selects the payment methods a payer pays with.
#[derive(Clone)]
pub struct PaymentMethodService {
    gateway: Arc<dyn PaymentGateway>,
    payers: Arc<dyn PayerStore>,
}

impl PaymentMethodService {
    pub fn new(gateway: Arc<dyn PaymentGateway>, payers: Arc<dyn PayerStore>) -> Self {
        Self { gateway, payers }
    }

    async fn payer(&self, payer_id: &str) -> Result<Payer, PaymentError> {
        self.payers
            .fetch(payer_id)
            .await?
            .ok_or_else(|| PaymentError::PayerNotFound(payer_id.to_string()))
    }

    /// Payment methods on the payer's gateway customer. A payer without a
    /// gateway customer has none.
    pub async fn list(
        &self,
        payer_id: &str,
        today: NaiveDate,
    ) -> Result<Vec<ListedPaymentMethod>, PaymentError> {
        let payer = self.payer(payer_id).await?;
        let Some(customer_id) = payer.gateway_customer_id.as_deref() else {
            return Ok(Vec::new());
        };
        let default_id = payer.default_payment_method.as_ref().map(|m| m.id.as_str());

        let methods = self.gateway.list_payment_methods(customer_id).await?;
        Ok(methods
            .into_iter()
            .map(|method| ListedPaymentMethod {
                is_default: Some(method.id.as_str()) == default_id,
                disabled_reason: method.disabled_reason(today),
                method,
            })
            .collect())
    }

    /// Detach a payment method from the payer. The current default cannot be
    /// detached.
    #[instrument(skip(self))]
    pub async fn detach(&self, payer_id: &str, payment_method_id: &str) -> Result<(), PaymentError> {
        let payer = self.payer(payer_id).await?;
        let is_default = payer
            .default_payment_method
            .as_ref()
            .is_some_and(|m| m.id == payment_method_id);
        if is_default {
            return Err(PaymentError::DetachDefaultPaymentMethod(
                payment_method_id.to_string(),
            ));
        }

        let method = self.gateway.get_payment_method(payment_method_id).await?;
        match method.customer_id.as_deref() {
            None => {
                info!("Payment method already detached");
                return Ok(());
            }
            Some(owner) if payer.gateway_customer_id.as_deref() != Some(owner) => {
                return Err(PaymentError::InvalidPaymentMethod(format!(
                    "payment method {payment_method_id} does not belong to payer {payer_id}"
                )));
            }
            Some(_) => {}
        }

        self.gateway.detach_payment_method(payment_method_id).await?;
        info!("Payment method detached");
        Ok(())
    }

    /// Make an attached payment method the payer's default.
    #[instrument(skip(self))]
    pub async fn set_default(
        &self,
        payer_id: &str,
        payment_method_id: &str,
    ) -> Result<DefaultPaymentMethod, PaymentError> {
        let payer = self.payer(payer_id).await?;
        let method = self.gateway.get_payment_method(payment_method_id).await?;
        if method.customer_id.is_none() || method.customer_id != payer.gateway_customer_id {
            return Err(PaymentError::InvalidPaymentMethod(format!(
                "payment method {payment_method_id} is not attached to payer {payer_id}"
            )));
        }

        let default = DefaultPaymentMethod {
            id: method.id,
            family: method.family,
        };
        if !self
            .payers
            .set_default_payment_method(payer_id, Some(&default))
            .await?
        {
            return Err(PaymentError::PayerNotFound(payer_id.to_string()));
        }

        let previous = payer.default_payment_method.as_ref().map(|m| m.family);
        if previous != Some(default.family) {
            info!(
                notify = true,
                previous = previous.map(|f| f.as_str()).unwrap_or("none"),
                current = %default.family,
                "Default payment method type changed"
            );
        } else {
            info!("Default payment method updated");
        }
        Ok(default)
    }
}
