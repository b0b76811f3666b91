//! # Tool Invocation Layer
//!
//! The reasoning stage can answer a caller directly or ask for one of a
//! small fixed set of financial operations. This module owns that set: the
//! strict tool-call request shape, dispatch against the registered tools,
//! and the net-balance computation behind payments.
//!
//! ## Registered tools:
//! - `get_current_user` - identity lookup against the ledger
//! - `get_expenses` - recent expenses, reduced to a bounded summary
//! - `initiate_payment` - net-balance settlement via a payment link
//!
//! ## Error model:
//! A `ToolError` is data, not a crash. It serializes to a payload that goes
//! back through the narration pass so the caller hears an explanation
//! ("I couldn't find an email for Bob") instead of silence. Nothing here is
//! retried - each tool call is fire-and-interpret, scoped to one turn.

pub mod ledger;
pub mod payment;

pub use ledger::{CurrentUser, Expense, HttpLedgerService, LedgerService, Participant};
pub use payment::{HttpPaymentService, PaymentService};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::info;

/// Most recent expenses kept when summarizing for the reasoning context.
const EXPENSE_SUMMARY_LIMIT: usize = 15;

/// The structured form the reasoning stage emits to request a tool.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ToolCallRequest {
    pub tool_name: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

impl ToolCallRequest {
    /// Try to read a model reply as a tool call.
    ///
    /// The routing instruction demands a bare JSON object with a string
    /// `tool_name` and string-to-string `parameters`; anything that does not
    /// parse as exactly that shape is a conversational answer, not a tool
    /// call. An unrecognized `tool_name` still parses - dispatch turns it
    /// into an unknown-tool payload so the model hears about its mistake.
    pub fn parse(raw: &str) -> Option<Self> {
        serde_json::from_str(raw.trim()).ok()
    }
}

/// Tool invocation failures, captured as payloads for narration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "error", rename_all = "snake_case")]
pub enum ToolError {
    /// The reasoning stage asked for a tool that does not exist
    UnknownTool { tool_name: String },
    /// A required parameter was absent or blank
    MissingParameter { tool_name: String, parameter: String },
    /// The ledger service failed or answered with garbage
    Ledger { message: String },
    /// The payment-link service failed or answered with garbage
    Payment { message: String },
    /// A balance exists but no email was found for the counterpart,
    /// so there is nowhere to send a payment link
    MissingRecipientEmail { recipient: String },
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolError::UnknownTool { tool_name } => {
                write!(f, "unknown tool '{}'", tool_name)
            }
            ToolError::MissingParameter { tool_name, parameter } => {
                write!(f, "tool '{}' needs parameter '{}'", tool_name, parameter)
            }
            ToolError::Ledger { message } => write!(f, "ledger service failed: {}", message),
            ToolError::Payment { message } => write!(f, "payment service failed: {}", message),
            ToolError::MissingRecipientEmail { recipient } => {
                write!(
                    f,
                    "no email on record for '{}'; a payment link cannot be sent",
                    recipient
                )
            }
        }
    }
}

/// Static description of one registered tool, surfaced to the model.
pub struct ToolDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: &'static str,
}

pub const REGISTERED_TOOLS: [ToolDescriptor; 3] = [
    ToolDescriptor {
        name: "get_current_user",
        description: "Look up the name and email of the caller's account.",
        parameters: "none",
    },
    ToolDescriptor {
        name: "get_expenses",
        description: "List the caller's most recent expenses with amounts, dates and counterparties.",
        parameters: "none",
    },
    ToolDescriptor {
        name: "initiate_payment",
        description: "Work out the outstanding balance with a named person and create a payment link to settle it.",
        parameters: "recipient_name (required): the name of the person to pay",
    },
];

/// Render the registered tool set for the routing system instruction.
pub fn tool_catalog() -> String {
    REGISTERED_TOOLS
        .iter()
        .map(|tool| {
            format!(
                "- {}: {} Parameters: {}",
                tool.name, tool.description, tool.parameters
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Outcome of the signed net-balance computation between two people.
#[derive(Debug, Clone, PartialEq)]
pub struct BalanceOutcome {
    /// Positive: the current user owes the recipient. Negative: vice versa.
    pub net_balance: f64,
    /// Email of the matched counterpart, when any matched record carried one
    pub recipient_email: Option<String>,
    /// Full name of the matched counterpart as the ledger spells it
    pub recipient_name: Option<String>,
}

/// Word-set subset match on people's names.
///
/// A query matches a candidate when every word of the query appears among
/// the candidate's words, ignoring case - so "Bob" finds "Bob Lee", but
/// "Bob Smith" does not. Exact equality would make short spoken names
/// useless.
pub fn name_matches(query: &str, candidate: &str) -> bool {
    let candidate_words: HashSet<String> = candidate
        .split_whitespace()
        .map(|word| word.to_lowercase())
        .collect();
    let mut query_words = query.split_whitespace().peekable();
    if query_words.peek().is_none() {
        return false;
    }
    query_words.all(|word| candidate_words.contains(&word.to_lowercase()))
}

/// Compute the signed net balance between the current user and whoever the
/// recipient query names, over the unsettled expenses.
///
/// For each unsettled expense: add the amount when the current user is the
/// debtor and the query matches the creditor, subtract when the roles are
/// reversed. The first matched counterpart's email and ledger-spelled name
/// are carried along for the payment step.
pub fn net_balance(
    current_user_name: &str,
    recipient_query: &str,
    expenses: &[Expense],
) -> BalanceOutcome {
    let mut outcome = BalanceOutcome {
        net_balance: 0.0,
        recipient_email: None,
        recipient_name: None,
    };

    for expense in expenses.iter().filter(|e| !e.settled) {
        let user_owes = name_matches(current_user_name, &expense.debtor.name)
            && name_matches(recipient_query, &expense.creditor.name);
        let user_is_owed = name_matches(current_user_name, &expense.creditor.name)
            && name_matches(recipient_query, &expense.debtor.name);

        let counterpart = if user_owes {
            outcome.net_balance += expense.amount;
            &expense.creditor
        } else if user_is_owed {
            outcome.net_balance -= expense.amount;
            &expense.debtor
        } else {
            continue;
        };

        if outcome.recipient_email.is_none() {
            outcome.recipient_email = counterpart.email.clone();
        }
        if outcome.recipient_name.is_none() {
            outcome.recipient_name = Some(counterpart.name.clone());
        }
    }

    outcome
}

/// Resolves tool-call requests against the registered set.
pub struct ToolExecutor {
    ledger: Arc<dyn LedgerService>,
    payment: Arc<dyn PaymentService>,
}

impl ToolExecutor {
    pub fn new(ledger: Arc<dyn LedgerService>, payment: Arc<dyn PaymentService>) -> Self {
        Self { ledger, payment }
    }

    /// Run one tool call and return its payload.
    ///
    /// Both arms of the Result are payloads destined for the narration pass;
    /// the Err arm just marks that the payload describes a failure.
    pub async fn dispatch(&self, request: &ToolCallRequest) -> Result<Value, ToolError> {
        info!(tool = %request.tool_name, "dispatching tool call");
        match request.tool_name.as_str() {
            "get_current_user" => self.get_current_user().await,
            "get_expenses" => self.get_expenses().await,
            "initiate_payment" => self.initiate_payment(request).await,
            other => Err(ToolError::UnknownTool {
                tool_name: other.to_string(),
            }),
        }
    }

    async fn get_current_user(&self) -> Result<Value, ToolError> {
        let user = self.ledger.get_current_user().await?;
        Ok(json!({ "user": user }))
    }

    /// Fetch expenses and reduce them to a bounded, recency-ordered summary.
    ///
    /// The Expense type already keeps only the narratable fields; this just
    /// caps how many records reach the reasoning context.
    async fn get_expenses(&self) -> Result<Value, ToolError> {
        let mut expenses = self.ledger.get_expenses().await?;
        expenses.sort_by(|a, b| b.date.cmp(&a.date));
        expenses.truncate(EXPENSE_SUMMARY_LIMIT);
        Ok(json!({ "expenses": expenses }))
    }

    async fn initiate_payment(&self, request: &ToolCallRequest) -> Result<Value, ToolError> {
        let recipient_query = request
            .parameters
            .get("recipient_name")
            .map(|name| name.trim())
            .filter(|name| !name.is_empty())
            .ok_or_else(|| ToolError::MissingParameter {
                tool_name: "initiate_payment".to_string(),
                parameter: "recipient_name".to_string(),
            })?;

        let user = self.ledger.get_current_user().await?;
        let expenses = self.ledger.get_expenses().await?;
        let outcome = net_balance(&user.name, recipient_query, &expenses);

        if outcome.net_balance <= 0.0 {
            // Nothing to pay - possibly the other party owes the caller
            return Ok(json!({
                "status": "no_outstanding_balance",
                "recipient": recipient_query,
                "net_balance": outcome.net_balance,
                "detail": if outcome.net_balance < 0.0 {
                    "the other party owes you money"
                } else {
                    "no unsettled expenses between you"
                },
            }));
        }

        let recipient_email =
            outcome
                .recipient_email
                .as_deref()
                .ok_or_else(|| ToolError::MissingRecipientEmail {
                    recipient: recipient_query.to_string(),
                })?;
        let recipient_name = outcome.recipient_name.as_deref().unwrap_or(recipient_query);

        // Payment links take minor currency units
        let link_amount = (outcome.net_balance * 100.0).round() as i64;
        info!(
            recipient = recipient_name,
            link_amount, "creating payment link for outstanding balance"
        );

        self.payment
            .create_payment_link(recipient_email, link_amount, recipient_name)
            .await
    }
}

/// In-memory service fixtures shared by the tool and pipeline tests.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Ledger that answers from fixed data.
    #[derive(Debug)]
    pub struct FixtureLedger {
        pub user: CurrentUser,
        pub expenses: Vec<Expense>,
    }

    #[async_trait]
    impl LedgerService for FixtureLedger {
        async fn get_current_user(&self) -> Result<CurrentUser, ToolError> {
            Ok(self.user.clone())
        }

        async fn get_expenses(&self) -> Result<Vec<Expense>, ToolError> {
            Ok(self.expenses.clone())
        }
    }

    /// Payment service that records calls and mints a fixed link.
    #[derive(Debug, Default)]
    pub struct RecordingPayment {
        pub calls: Mutex<Vec<(String, i64, String)>>,
    }

    #[async_trait]
    impl PaymentService for RecordingPayment {
        async fn create_payment_link(
            &self,
            customer_email: &str,
            link_amount: i64,
            customer_name: &str,
        ) -> Result<Value, ToolError> {
            self.calls.lock().unwrap().push((
                customer_email.to_string(),
                link_amount,
                customer_name.to_string(),
            ));
            Ok(json!({
                "payment_link": {
                    "url": "https://pay.example/abc123",
                    "amount": link_amount,
                }
            }))
        }
    }

    pub fn expense(
        description: &str,
        amount: f64,
        date: &str,
        debtor: (&str, Option<&str>),
        creditor: (&str, Option<&str>),
        settled: bool,
    ) -> Expense {
        Expense {
            description: description.to_string(),
            amount,
            currency_code: "INR".to_string(),
            date: date.to_string(),
            debtor: Participant {
                name: debtor.0.to_string(),
                email: debtor.1.map(str::to_string),
            },
            creditor: Participant {
                name: creditor.0.to_string(),
                email: creditor.1.map(str::to_string),
            },
            settled,
        }
    }

    pub fn alice() -> CurrentUser {
        CurrentUser {
            name: "Alice Roy".to_string(),
            email: "alice@example.com".to_string(),
        }
    }
}
