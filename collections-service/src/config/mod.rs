use std::collections::HashMap;
use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use secrecy::Secret;
use service_core::config::{env_flag, env_or};
use service_core::error::AppError;
use service_core::observability::init_tracing;

use crate::models::PaymentMethodFamily;

#[derive(Clone, Debug)]
pub struct CollectionsConfig {
    pub service_name: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub gateway: GatewayConfig,
    pub payments: PaymentsConfig,
    pub fees: FeePolicy,
    pub limits: ChargeLimits,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: Secret<String>,
    pub db_name: String,
}

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub webhook_secret: Secret<String>,
    /// API version webhook payloads are expected in. `None` accepts any.
    pub api_version: Option<String>,
    pub webhook_tolerance_secs: i64,
}

#[derive(Clone, Debug)]
pub struct PaymentsConfig {
    /// Delay between consecutive charges in a batch run.
    pub rate_limit: Duration,
    /// Optimistic transaction attempts before giving up.
    pub store_max_attempts: u32,
    pub card_enabled: bool,
    pub ach_enabled: bool,
    pub sepa_enabled: bool,
}

impl PaymentsConfig {
    pub fn is_enabled(&self, family: PaymentMethodFamily) -> bool {
        match family {
            PaymentMethodFamily::Card => self.card_enabled,
            PaymentMethodFamily::UsBankAccount => self.ach_enabled,
            PaymentMethodFamily::SepaDebit => self.sepa_enabled,
            PaymentMethodFamily::BacsDebit | PaymentMethodFamily::AcssDebit => true,
        }
    }
}

impl Default for PaymentsConfig {
    fn default() -> Self {
        Self {
            rate_limit: Duration::from_millis(250),
            store_max_attempts: 10,
            card_enabled: true,
            ach_enabled: true,
            sepa_enabled: true,
        }
    }
}

/// Card surcharge rules.
#[derive(Clone, Debug)]
pub struct FeePolicy {
    pub default_percent: Decimal,
    /// Currency symbol to surcharge percent.
    pub currency_overrides: HashMap<String, Decimal>,
    /// (country, state) pairs that are never surcharged.
    pub exempt_regions: Vec<(String, String)>,
    /// Payments below this amount are not surcharged.
    pub exempt_below: i64,
    /// Country to tax rate applied on the surcharge itself.
    pub fee_tax_rates: HashMap<String, Decimal>,
}

impl Default for FeePolicy {
    fn default() -> Self {
        Self {
            default_percent: dec!(2.9),
            currency_overrides: HashMap::from([("AUD".to_string(), dec!(4.9))]),
            exempt_regions: vec![
                ("United States".to_string(), "Connecticut".to_string()),
                ("United States".to_string(), "MA".to_string()),
            ],
            exempt_below: 700_000,
            fee_tax_rates: HashMap::from([
                ("Israel".to_string(), dec!(0.17)),
                ("United Kingdom".to_string(), dec!(0.20)),
                ("Australia".to_string(), dec!(0.10)),
            ]),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ChargeLimits {
    /// Smallest balance that may be left on an invoice after a partial charge.
    pub min_remainder: i64,
    pub min_charge: i64,
}

impl Default for ChargeLimits {
    fn default() -> Self {
        Self {
            min_remainder: 500,
            min_charge: 50,
        }
    }
}

impl CollectionsConfig {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let db_url = env::var("COLLECTIONS_DATABASE_URL")
            .context("COLLECTIONS_DATABASE_URL must be set")?;
        let db_name = env::var("COLLECTIONS_DATABASE_NAME")
            .unwrap_or_else(|_| "collections_db".to_string());

        let webhook_secret =
            env::var("GATEWAY_WEBHOOK_SECRET").context("GATEWAY_WEBHOOK_SECRET must be set")?;

        Ok(Self {
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "collections-service".to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|s| !s.is_empty()),
            database: DatabaseConfig {
                url: Secret::new(db_url),
                db_name,
            },
            gateway: GatewayConfig {
                webhook_secret: Secret::new(webhook_secret),
                api_version: env::var("GATEWAY_API_VERSION").ok().filter(|s| !s.is_empty()),
                webhook_tolerance_secs: env_or(
                    "GATEWAY_WEBHOOK_TOLERANCE_SECS",
                    service_core::utils::signature::DEFAULT_TOLERANCE_SECS,
                ),
            },
            payments: PaymentsConfig {
                rate_limit: Duration::from_millis(env_or("PAYMENT_RATE_LIMIT_MS", 250)),
                store_max_attempts: env_or("STORE_MAX_ATTEMPTS", 10),
                card_enabled: !env_flag("DISABLE_CARD_PAYMENTS", false),
                ach_enabled: !env_flag("DISABLE_ACH_PAYMENTS", false),
                sepa_enabled: !env_flag("DISABLE_SEPA_PAYMENTS", false),
            },
            fees: FeePolicy::default(),
            limits: ChargeLimits::default(),
        })
    }

    /// Install the process-wide subscriber for this service.
    pub fn init_tracing(&self) -> Result<(), AppError> {
        init_tracing(
            &self.service_name,
            &self.log_level,
            self.otlp_endpoint.as_deref(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kill_switches() {
        let payments = PaymentsConfig {
            sepa_enabled: false,
            ..Default::default()
        };
        assert!(payments.is_enabled(PaymentMethodFamily::Card));
        assert!(payments.is_enabled(PaymentMethodFamily::BacsDebit));
        assert!(!payments.is_enabled(PaymentMethodFamily::SepaDebit));
    }

    #[test]
    fn test_default_fee_policy() {
        let policy = FeePolicy::default();
        assert_eq!(policy.default_percent, dec!(2.9));
        assert_eq!(policy.currency_overrides.get("AUD"), Some(&dec!(4.9)));
        assert_eq!(policy.exempt_below, 700_000);
    }
}
