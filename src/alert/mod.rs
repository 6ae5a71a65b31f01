//! Out-of-band stage reports.
//!
//! Delivery is best-effort: [`AlertPublisher`] logs failures and never
//! propagates them, so a dead webhook cannot undo or block a workflow
//! transition that has already been committed.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;

use crate::transaction_task::{PreparedTransaction, TransactionTask, TransactionType};
use crate::workflow::RebalanceWorkflow;

#[cfg(test)]
pub(crate) mod mock;

/// Channel all claim stage reports go to.
pub const CLAIM_CHANNEL: &str = "claimlp";

#[derive(Debug, Error)]
pub enum NotifierError {
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
    #[error("Webhook rejected message (status {status}): {message}")]
    Api { status: StatusCode, message: String },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Informational message.
    async fn notify(&self, channel: &str, message: &str) -> Result<(), NotifierError>;

    /// Message that needs an operator, mentioning `recipients`.
    async fn alert(
        &self,
        channel: &str,
        message: &str,
        recipients: &[String],
    ) -> Result<(), NotifierError>;
}

/// Writes reports to the log when no webhook is configured.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, channel: &str, message: &str) -> Result<(), NotifierError> {
        info!(channel, "{message}");
        Ok(())
    }

    async fn alert(
        &self,
        channel: &str,
        message: &str,
        recipients: &[String],
    ) -> Result<(), NotifierError> {
        warn!(channel, ?recipients, "{message}");
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WebhookMessage<'a> {
    msgtype: &'static str,
    text: WebhookText,
    at: WebhookMentions<'a>,
}

#[derive(Serialize)]
struct WebhookText {
    content: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WebhookMentions<'a> {
    at_mobiles: &'a [String],
    is_at_all: bool,
}

/// Posts reports to a chat-robot webhook.
pub struct WebhookNotifier {
    client: Client,
    url: Url,
}

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

impl WebhookNotifier {
    pub fn new(url: Url) -> Result<Self, NotifierError> {
        Self::with_timeout(url, REQUEST_TIMEOUT)
    }

    pub(crate) fn with_timeout(url: Url, timeout: Duration) -> Result<Self, NotifierError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()?;

        Ok(Self { client, url })
    }

    async fn post(
        &self,
        channel: &str,
        message: &str,
        recipients: &[String],
    ) -> Result<(), NotifierError> {
        let body = WebhookMessage {
            msgtype: "text",
            text: WebhookText {
                content: format!("[{channel}]\n{message}"),
            },
            at: WebhookMentions {
                at_mobiles: recipients,
                is_at_all: false,
            },
        };

        let response = self
            .client
            .post(self.url.clone())
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());

            return Err(NotifierError::Api { status, message });
        }

        Ok(())
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, channel: &str, message: &str) -> Result<(), NotifierError> {
        self.post(channel, message, &[]).await
    }

    async fn alert(
        &self,
        channel: &str,
        message: &str,
        recipients: &[String],
    ) -> Result<(), NotifierError> {
        self.post(channel, message, recipients).await
    }
}

/// One sub-transaction line of a [`StageReport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportedTransaction {
    pub transaction_type: TransactionType,
    pub nonce: u64,
    pub gas_price: String,
    pub gas_limit: u64,
    /// Human-readable params of the sub-transaction.
    pub amount: String,
    pub chain_id: u64,
    pub chain_name: String,
    pub from: String,
    pub to: String,
}

impl From<&PreparedTransaction> for ReportedTransaction {
    fn from(PreparedTransaction { draft, gas }: &PreparedTransaction) -> Self {
        Self {
            transaction_type: draft.transaction_type,
            nonce: gas.nonce,
            gas_price: gas.gas_price.to_string(),
            gas_limit: gas.gas_limit,
            amount: draft.params.to_string(),
            chain_id: draft.chain_id,
            chain_name: draft.chain_name.clone(),
            from: draft.from.to_string(),
            to: draft.to.to_string(),
        }
    }
}

impl From<&TransactionTask> for ReportedTransaction {
    fn from(task: &TransactionTask) -> Self {
        Self::from(&PreparedTransaction {
            draft: task.draft.clone(),
            gas: task.gas,
        })
    }
}

/// Rendered summary of one stage transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    pub stage: String,
    pub workflow_id: i64,
    pub workflow_params: String,
    pub transactions: Vec<ReportedTransaction>,
}

impl StageReport {
    pub fn new(
        stage: &str,
        workflow: &RebalanceWorkflow,
        transactions: impl IntoIterator<Item = ReportedTransaction>,
    ) -> Self {
        Self {
            stage: stage.to_string(),
            workflow_id: workflow.id,
            workflow_params: workflow.params_json(),
            transactions: transactions.into_iter().collect(),
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();

        // Writing into a String cannot fail.
        let _ = writeln!(out, "stage: {}", self.stage);
        let _ = writeln!(out, "workflow_id: {}", self.workflow_id);
        let _ = writeln!(out, "workflow_params: {}", self.workflow_params);

        for transaction in &self.transactions {
            let _ = writeln!(out, "type: {}", transaction.transaction_type);
            let _ = writeln!(out, "nonce: {}", transaction.nonce);
            let _ = writeln!(out, "gas_price: {}", transaction.gas_price);
            let _ = writeln!(out, "gas_limit: {}", transaction.gas_limit);
            let _ = writeln!(out, "amount: {}", transaction.amount);
            let _ = writeln!(out, "chain_id: {}", transaction.chain_id);
            let _ = writeln!(out, "chain_name: {}", transaction.chain_name);
            let _ = writeln!(out, "from: {}", transaction.from);
            let _ = writeln!(out, "to: {}", transaction.to);
            let _ = writeln!(out, "--------------------");
        }

        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Notify,
    Alert,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageAlert {
    pub severity: Severity,
    pub channel: &'static str,
    pub report: StageReport,
}

/// Delivers stage alerts through a [`Notifier`], mentioning the configured
/// recipients on alerts.
#[derive(Clone)]
pub struct AlertPublisher {
    notifier: Arc<dyn Notifier>,
    recipients: Vec<String>,
}

impl AlertPublisher {
    pub fn new(notifier: Arc<dyn Notifier>, recipients: Vec<String>) -> Self {
        Self {
            notifier,
            recipients,
        }
    }

    pub async fn publish(&self, alert: &StageAlert) {
        let message = alert.report.render();

        let result = match alert.severity {
            Severity::Notify => self.notifier.notify(alert.channel, &message).await,
            Severity::Alert => {
                self.notifier
                    .alert(alert.channel, &message, &self.recipients)
                    .await
            }
        };

        if let Err(error) = result {
            error!(
                workflow_id = alert.report.workflow_id,
                stage = %alert.report.stage,
                ?error,
                "Failed to deliver stage alert"
            );
        }
    }
}
