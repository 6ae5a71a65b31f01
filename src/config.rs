use alloy::primitives::Address;
use serde::Deserialize;
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::Level;
use url::Url;

use crate::tokens::{ConfiguredTokens, TokenConfig, TokenRegistryError};

/// Settings deserialized from the plaintext config TOML.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct Config {
    database_url: String,
    log_level: Option<LogLevel>,
    liquidity_url: Url,
    #[serde(default)]
    chains: BTreeMap<String, ChainConfig>,
    #[serde(default)]
    tokens: Vec<TokenConfig>,
    alerts: Option<AlertConfig>,
}

/// Per-chain transaction settings from a `[chains.<name>]` table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChainConfig {
    pub chain_id: u64,
    /// Sender of every transaction the treasury builds on this chain.
    pub bridge_address: Address,
    /// Gas price in wei.
    pub gas_price: u64,
    pub gas_limit: u64,
}

/// Chain settings keyed by lowercase chain name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Chains(BTreeMap<String, ChainConfig>);

impl Chains {
    pub fn get(&self, chain_name: &str) -> Option<&ChainConfig> {
        self.0.get(&chain_name.to_lowercase())
    }

    pub fn find_by_id(&self, chain_id: u64) -> Option<(&str, &ChainConfig)> {
        self.0
            .iter()
            .find(|(_, chain)| chain.chain_id == chain_id)
            .map(|(name, chain)| (name.as_str(), chain))
    }

    fn from_config(chains: BTreeMap<String, ChainConfig>) -> Result<Self, ConfigError> {
        let mut normalized = BTreeMap::new();

        for (name, chain) in chains {
            if chain.gas_limit == 0 {
                return Err(ConfigError::InvalidChain {
                    chain: name,
                    reason: "gas_limit must be positive",
                });
            }

            let key = name.to_lowercase();
            if normalized.contains_key(&key) {
                return Err(ConfigError::InvalidChain {
                    chain: name,
                    reason: "configured more than once",
                });
            }

            normalized.insert(key, chain);
        }

        Ok(Self(normalized))
    }
}

impl FromIterator<(String, ChainConfig)> for Chains {
    fn from_iter<I: IntoIterator<Item = (String, ChainConfig)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(name, chain)| (name.to_lowercase(), chain))
                .collect(),
        )
    }
}

/// Webhook delivery for stage reports. Without it reports only reach the
/// log.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AlertConfig {
    pub webhook_url: Url,
    #[serde(default)]
    pub recipients: Vec<String>,
}

/// Runtime context assembled from the config file.
#[derive(Debug, Clone)]
pub struct Ctx {
    pub(crate) database_url: String,
    pub log_level: LogLevel,
    pub(crate) liquidity_url: Url,
    pub(crate) chains: Chains,
    pub(crate) tokens: ConfiguredTokens,
    pub(crate) alerts: Option<AlertConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(log_level: LogLevel) -> Self {
        match log_level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

pub(crate) async fn configure_sqlite_pool(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    let pool = SqlitePool::connect(database_url).await?;

    // WAL lets `status` read while a cron-triggered `tick` writes.
    sqlx::query("PRAGMA journal_mode = WAL")
        .execute(&pool)
        .await?;

    // Overlapping ticks wait for the writer instead of failing with
    // "database is locked".
    sqlx::query("PRAGMA busy_timeout = 10000")
        .execute(&pool)
        .await?;

    Ok(pool)
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file")]
    Io(#[from] std::io::Error),
    #[error("failed to parse TOML")]
    Toml(#[from] toml::de::Error),
    #[error(transparent)]
    Tokens(#[from] TokenRegistryError),
    #[error("invalid config for chain {chain}: {reason}")]
    InvalidChain { chain: String, reason: &'static str },
    #[error("token {symbol} references unconfigured chain {chain}")]
    TokenOnUnknownChain { chain: String, symbol: String },
}

impl Ctx {
    pub fn load_file(config: &Path) -> Result<Self, ConfigError> {
        let config_str = std::fs::read_to_string(config)?;
        Self::from_toml(&config_str)
    }

    pub fn from_toml(config_toml: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(config_toml)?;

        let chains = Chains::from_config(config.chains)?;

        if let Some(token) = config
            .tokens
            .iter()
            .find(|token| chains.get(&token.chain).is_none())
        {
            return Err(ConfigError::TokenOnUnknownChain {
                chain: token.chain.clone(),
                symbol: token.symbol.clone(),
            });
        }

        let tokens = ConfiguredTokens::new(config.tokens)?;

        Ok(Self {
            database_url: config.database_url,
            log_level: config.log_level.unwrap_or(LogLevel::Debug),
            liquidity_url: config.liquidity_url,
            chains,
            tokens,
            alerts: config.alerts,
        })
    }

    pub async fn get_sqlite_pool(&self) -> Result<SqlitePool, sqlx::Error> {
        configure_sqlite_pool(&self.database_url).await
    }
}

pub fn setup_tracing(log_level: LogLevel) {
    let level: Level = log_level.into();
    let default_filter = format!("st0x_treasury={level},treasury={level}");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();
}
