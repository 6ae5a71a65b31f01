//! Liquidity and vault data consumed by the claim stage.
//!
//! The data provider reports every open liquidity position grouped by LP
//! token, plus the treasury vaults with their per-chain controller
//! addresses. Amounts arrive as decimal strings and are parsed into
//! [`Decimal`] at this boundary.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

#[cfg(test)]
pub(crate) mod mock;

#[derive(Debug, Error)]
pub enum LiquidityDataError {
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
    #[error("API error (status {status}): {message}")]
    Api { status: StatusCode, message: String },
    #[error("Liquidity provider rejected request (code {code}): {message}")]
    Rejected { code: i64, message: String },
}

/// Source of the current liquidity snapshot.
#[async_trait]
pub trait LiquidityDataSource: Send + Sync {
    async fn fetch(&self) -> Result<LiquiditySnapshot, LiquidityDataError>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiquiditySnapshot {
    #[serde(default, rename = "threshold")]
    pub thresholds: Vec<Threshold>,
    #[serde(default)]
    pub vault_info_list: Vec<VaultInfo>,
    #[serde(default)]
    pub liquidity_provider_list: Vec<LiquidityProvider>,
}

/// Minimum amount per token worth rebalancing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Threshold {
    pub token_address: String,
    pub token_symbol: String,
    pub chain: String,
    pub chain_id: u64,
    pub threshold_amount: Decimal,
    pub decimal: u8,
}

/// Positions held in one LP token on one chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiquidityProvider {
    pub chain: String,
    pub chain_id: u64,
    #[serde(default)]
    pub lp_symbol: String,
    #[serde(default)]
    pub lp_amount: Option<Decimal>,
    #[serde(default)]
    pub lp_token_address: String,
    #[serde(default)]
    pub lp_platform: String,
    #[serde(default)]
    pub lp_info_list: Vec<LpInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LpInfo {
    pub lp_index: u64,
    #[serde(default)]
    pub lp_amount: Option<Decimal>,
    #[serde(default)]
    pub base_token_address: String,
    #[serde(default)]
    pub quote_token_address: String,
    pub base_token_symbol: String,
    pub quote_token_symbol: String,
    pub base_token_amount: Decimal,
    pub quote_token_amount: Decimal,
    /// Strategy contract the position's funds are claimed from.
    #[serde(default)]
    pub strategy_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultInfo {
    pub token_symbol: String,
    #[serde(default)]
    pub chain: String,
    pub currency: String,
    /// Keyed by chain name.
    #[serde(default)]
    pub active_amount: BTreeMap<String, ControllerInfo>,
}

impl VaultInfo {
    /// Controller for `chain`, matching the chain name case-insensitively.
    pub fn controller(&self, chain: &str) -> Option<&ControllerInfo> {
        self.active_amount.get(chain).or_else(|| {
            self.active_amount
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(chain))
                .map(|(_, controller)| controller)
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerInfo {
    #[serde(default)]
    pub amount: Option<Decimal>,
    pub controller_address: String,
}

#[derive(Deserialize)]
struct LiquidityResponse {
    code: i64,
    #[serde(default)]
    msg: String,
    data: Option<LiquiditySnapshot>,
}

/// Reads the snapshot from the liquidity data provider over HTTP.
pub struct HttpLiquiditySource {
    client: Client,
    url: Url,
}

/// Bounds a fetch well inside the tick lease.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

impl HttpLiquiditySource {
    pub fn new(url: Url) -> Result<Self, LiquidityDataError> {
        Self::with_timeout(url, REQUEST_TIMEOUT)
    }

    pub(crate) fn with_timeout(url: Url, timeout: Duration) -> Result<Self, LiquidityDataError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()?;

        Ok(Self { client, url })
    }
}

#[async_trait]
impl LiquidityDataSource for HttpLiquiditySource {
    async fn fetch(&self) -> Result<LiquiditySnapshot, LiquidityDataError> {
        let response = self.client.get(self.url.clone()).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());

            return Err(LiquidityDataError::Api { status, message });
        }

        let body: LiquidityResponse = response.json().await?;

        if body.code != 0 {
            return Err(LiquidityDataError::Rejected {
                code: body.code,
                message: body.msg,
            });
        }

        let snapshot = body.data.unwrap_or_default();
        debug!(
            providers = snapshot.liquidity_provider_list.len(),
            vaults = snapshot.vault_info_list.len(),
            "Fetched liquidity snapshot"
        );

        Ok(snapshot)
    }
}
