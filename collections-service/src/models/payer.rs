use serde::{Deserialize, Serialize};

use super::PaymentMethodFamily;

/// Billing customer that owns one or more paying entities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    /// Customer has negotiated card payments without surcharge.
    #[serde(default)]
    pub surcharge_opt_out: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultPaymentMethod {
    pub id: String,
    pub family: PaymentMethodFamily,
}

/// Entity that pays invoices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payer {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    pub email: Option<String>,
    /// Home country of the billing company.
    pub company_country: String,
    pub country: String,
    #[serde(default)]
    pub state: Option<String>,
    pub gateway_customer_id: Option<String>,
    #[serde(default)]
    pub default_payment_method: Option<DefaultPaymentMethod>,
    pub customer: Customer,
}

impl Payer {
    /// Payer and billing company are in different countries.
    pub fn is_export(&self) -> bool {
        !self.country.eq_ignore_ascii_case(&self.company_country)
    }
}
