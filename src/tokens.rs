//! Token metadata lookup: decimal precision and the currency a token
//! belongs to, per chain.

use serde::Deserialize;
use std::collections::HashMap;

/// Metadata the claim stage needs for routing and amount conversion.
pub trait TokenRegistry: Send + Sync {
    /// Decimal precision of `symbol` on `chain`.
    fn decimals(&self, chain: &str, symbol: &str) -> Option<u8>;

    /// Currency `symbol` is accounted in on `chain`, matched against the
    /// vault list to find the claiming vault.
    fn currency(&self, chain: &str, symbol: &str) -> Option<&str>;
}

/// One `[[tokens]]` entry of the config file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TokenConfig {
    pub chain: String,
    pub symbol: String,
    pub decimals: u8,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TokenMetadata {
    decimals: u8,
    currency: String,
}

#[derive(Debug, thiserror::Error)]
pub enum TokenRegistryError {
    #[error("token {symbol} on chain {chain} is configured more than once")]
    Duplicate { chain: String, symbol: String },
}

/// Registry backed by the `[[tokens]]` config entries. Chain names are
/// case-insensitive; symbols are exact.
#[derive(Debug, Clone, Default)]
pub struct ConfiguredTokens {
    tokens: HashMap<(String, String), TokenMetadata>,
}

impl ConfiguredTokens {
    pub fn new(tokens: Vec<TokenConfig>) -> Result<Self, TokenRegistryError> {
        let mut registry = HashMap::with_capacity(tokens.len());

        for token in tokens {
            let key = (token.chain.to_lowercase(), token.symbol);

            if registry.contains_key(&key) {
                let (chain, symbol) = key;
                return Err(TokenRegistryError::Duplicate { chain, symbol });
            }

            registry.insert(
                key,
                TokenMetadata {
                    decimals: token.decimals,
                    currency: token.currency,
                },
            );
        }

        Ok(Self { tokens: registry })
    }

    fn lookup(&self, chain: &str, symbol: &str) -> Option<&TokenMetadata> {
        self.tokens
            .get(&(chain.to_lowercase(), symbol.to_string()))
    }
}

impl TokenRegistry for ConfiguredTokens {
    fn decimals(&self, chain: &str, symbol: &str) -> Option<u8> {
        self.lookup(chain, symbol).map(|token| token.decimals)
    }

    fn currency(&self, chain: &str, symbol: &str) -> Option<&str> {
        self.lookup(chain, symbol)
            .map(|token| token.currency.as_str())
    }
}
