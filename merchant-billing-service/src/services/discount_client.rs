//! Client for the external discount-computation service.
//!
//! Public voucher validation is delegated wholesale: this service resolves the
//! merchant and forwards the order, and the collaborator's typed errors are
//! surfaced unchanged.

use crate::config::DiscountServiceConfig;
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use service_core::observability::TracedClientExt;
use std::fmt;
use std::time::Duration;
use tracing::{instrument, warn};
use uuid::Uuid;

/// One order line submitted for discount computation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderLine {
    pub menu_id: String,
    pub subtotal: Decimal,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscountQuery {
    pub merchant_id: Uuid,
    pub voucher_code: String,
    pub order_type: String,
    pub items: Vec<OrderLine>,
}

/// Typed failure reported by the collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscountError {
    pub status: u16,
    pub code: String,
    pub message: String,
}

impl DiscountError {
    fn unavailable(message: impl Into<String>) -> Self {
        Self {
            status: 502,
            code: "DISCOUNT_SERVICE_UNAVAILABLE".to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for DiscountError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.code, self.status, self.message)
    }
}

impl std::error::Error for DiscountError {}

#[async_trait]
pub trait DiscountCalculator: Send + Sync {
    /// Compute eligibility and discount. Returns the collaborator's payload.
    async fn validate(
        &self,
        query: &DiscountQuery,
        request_id: Option<&str>,
    ) -> Result<serde_json::Value, DiscountError>;
}

/// Envelope the collaborator answers with.
#[derive(Debug, Deserialize)]
struct DiscountEnvelope {
    #[serde(default)]
    data: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

pub struct HttpDiscountClient {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl HttpDiscountClient {
    pub fn new(config: &DiscountServiceConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: config.url.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

#[async_trait]
impl DiscountCalculator for HttpDiscountClient {
    #[instrument(skip(self, query), fields(merchant_id = %query.merchant_id, voucher_code = %query.voucher_code))]
    async fn validate(
        &self,
        query: &DiscountQuery,
        request_id: Option<&str>,
    ) -> Result<serde_json::Value, DiscountError> {
        let url = format!("{}/vouchers/validate", self.base_url);

        let response = self
            .client
            .traced_post(&url)
            .json(query)
            .timeout(self.timeout)
            .request_id(request_id)
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, "Discount service request failed");
                DiscountError::unavailable("Discount service is unavailable")
            })?;

        let status = response.status();
        let envelope: DiscountEnvelope = response.json().await.map_err(|e| {
            warn!(error = %e, status = status.as_u16(), "Unreadable discount service response");
            DiscountError::unavailable("Discount service returned an unreadable response")
        })?;

        if status.is_success() {
            return Ok(envelope.data.unwrap_or(serde_json::Value::Null));
        }

        Err(DiscountError {
            status: status.as_u16(),
            code: envelope
                .error
                .unwrap_or_else(|| "VOUCHER_INVALID".to_string()),
            message: envelope
                .message
                .unwrap_or_else(|| "Voucher cannot be applied".to_string()),
        })
    }
}
