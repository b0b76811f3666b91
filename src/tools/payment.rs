//! # Payment Link Service Client
//!
//! Creates payment links for settling balances. Amounts are sent in minor
//! currency units (paise for INR), and the raw service response is returned
//! untouched - the reasoning stage narrates whatever the service said.

use crate::config::ServicesConfig;
use crate::error::{AppError, AppResult};
use crate::providers::truncate_body;
use crate::tools::ToolError;
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

/// Seam for the payment-link backend; tests substitute a recording fake.
#[async_trait]
pub trait PaymentService: Send + Sync {
    /// Create a payment link. `link_amount` is in minor currency units.
    async fn create_payment_link(
        &self,
        customer_email: &str,
        link_amount: i64,
        customer_name: &str,
    ) -> Result<Value, ToolError>;
}

pub struct HttpPaymentService {
    base_url: String,
    client: reqwest::Client,
}

impl HttpPaymentService {
    pub fn new(config: &ServicesConfig, timeout_ms: u64) -> AppResult<Self> {
        if config.payment_base_url.trim().is_empty() {
            return Err(AppError::Config(
                "payment base URL not configured (set PAYMENT_BASE_URL)".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(timeout_ms.max(1)))
            .build()
            .map_err(|e| AppError::Config(format!("failed to initialize payment client: {}", e)))?;

        Ok(Self {
            base_url: config.payment_base_url.trim().trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl PaymentService for HttpPaymentService {
    async fn create_payment_link(
        &self,
        customer_email: &str,
        link_amount: i64,
        customer_name: &str,
    ) -> Result<Value, ToolError> {
        debug!(customer_email, link_amount, "requesting payment link");

        let payload = json!({
            "customer_email": customer_email,
            "link_amount": link_amount,
            "customer_name": customer_name,
        });

        let response = self
            .client
            .post(format!("{}/create_payment_link", self.base_url))
            .json(&payload)
            .send()
            .await
            .map_err(|e| ToolError::Payment {
                message: format!("create_payment_link request failed: {}", e),
            })?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(ToolError::Payment {
                message: format!(
                    "create_payment_link returned status {}: {}",
                    status.as_u16(),
                    truncate_body(&body)
                ),
            });
        }

        serde_json::from_str(&body).map_err(|e| ToolError::Payment {
            message: format!("create_payment_link returned invalid JSON: {}", e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    #[test]
    fn test_requires_base_url() {
        let config = AppConfig::default().services;
        assert!(HttpPaymentService::new(&config, 5000).is_err());
    }
}
