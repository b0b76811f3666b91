//! # Ledger Service Client
//!
//! Identity and expense lookups against the external expense ledger. The
//! ledger is the source of truth: every tool invocation fetches fresh and
//! nothing is cached locally.

use crate::config::ServicesConfig;
use crate::error::{AppError, AppResult};
use crate::providers::truncate_body;
use crate::tools::ToolError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// The caller's account identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentUser {
    pub name: String,
    pub email: String,
}

/// One party on an expense record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// One expense record as the ledger reports it.
///
/// Deserialization keeps only the fields the assistant needs - whatever else
/// the ledger attaches is discarded at this boundary. `debtor` owes
/// `creditor` the amount until the expense is settled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expense {
    pub description: String,
    pub amount: f64,
    pub currency_code: String,
    /// ISO-8601 date, which also gives lexicographic recency ordering
    pub date: String,
    #[serde(rename = "from")]
    pub debtor: Participant,
    #[serde(rename = "to")]
    pub creditor: Participant,
    pub settled: bool,
}

/// Seam for the ledger backend; tests substitute an in-memory fixture.
#[async_trait]
pub trait LedgerService: Send + Sync {
    async fn get_current_user(&self) -> Result<CurrentUser, ToolError>;
    async fn get_expenses(&self) -> Result<Vec<Expense>, ToolError>;
}

#[derive(Debug, Deserialize)]
struct CurrentUserEnvelope {
    user: CurrentUser,
}

#[derive(Debug, Deserialize)]
struct ExpensesEnvelope {
    expenses: Vec<Expense>,
}

/// HTTP client for the ledger service (authenticated POST endpoints).
pub struct HttpLedgerService {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl HttpLedgerService {
    pub fn new(config: &ServicesConfig, timeout_ms: u64) -> AppResult<Self> {
        if config.ledger_base_url.trim().is_empty() {
            return Err(AppError::Config(
                "ledger base URL not configured (set LEDGER_BASE_URL)".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(timeout_ms.max(1)))
            .build()
            .map_err(|e| AppError::Config(format!("failed to initialize ledger client: {}", e)))?;

        Ok(Self {
            base_url: config.ledger_base_url.trim().trim_end_matches('/').to_string(),
            api_key: config.ledger_api_key.clone(),
            client,
        })
    }

    async fn post(&self, path: &str) -> Result<reqwest::Response, ToolError> {
        debug!(path, "calling ledger service");
        let response = self
            .client
            .post(format!("{}/{}", self.base_url, path))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| ToolError::Ledger {
                message: format!("{} request failed: {}", path, e),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ToolError::Ledger {
                message: format!(
                    "{} returned status {}: {}",
                    path,
                    status.as_u16(),
                    truncate_body(&body)
                ),
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl LedgerService for HttpLedgerService {
    async fn get_current_user(&self) -> Result<CurrentUser, ToolError> {
        let envelope: CurrentUserEnvelope = self
            .post("get_current_user")
            .await?
            .json()
            .await
            .map_err(|e| ToolError::Ledger {
                message: format!("get_current_user returned unexpected JSON: {}", e),
            })?;
        Ok(envelope.user)
    }

    async fn get_expenses(&self) -> Result<Vec<Expense>, ToolError> {
        let envelope: ExpensesEnvelope = self
            .post("get_expenses")
            .await?
            .json()
            .await
            .map_err(|e| ToolError::Ledger {
                message: format!("get_expenses returned unexpected JSON: {}", e),
            })?;
        Ok(envelope.expenses)
    }
}
