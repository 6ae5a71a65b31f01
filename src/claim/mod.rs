//! Aggregation of liquidity positions into per-vault claims.
//!
//! Every position names the strategy contract its funds sit in. Positions
//! sharing a strategy on the same chain are summed into one [`Strategy`],
//! and strategies are bucketed by the vault that claims them. Both levels
//! keep first-seen order so the resulting calls are reproducible.

use alloy::primitives::Address;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::liquidity::{LiquidityProvider, VaultInfo};
use crate::tokens::TokenRegistry;

mod call;

pub use call::{ClaimCallError, IVault, build_claim_call};

/// Claimable amounts held by one strategy contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Strategy {
    pub strategy_address: Address,
    pub base_symbol: String,
    pub quote_symbol: String,
    pub base_amount: Decimal,
    pub quote_amount: Decimal,
}

/// Everything one vault claims in a single `claimAll` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimParam {
    pub chain_id: u64,
    pub chain_name: String,
    pub vault_address: Address,
    pub strategies: Vec<Strategy>,
}

#[derive(Debug, Error)]
pub enum AggregationError {
    #[error("Position {lp_index} on {chain} has no strategy address")]
    MissingStrategyAddress { chain: String, lp_index: u64 },
    #[error("Invalid {field}: {value}")]
    InvalidAddress { field: &'static str, value: String },
    #[error("Negative {side} amount {amount} for strategy {strategy}")]
    NegativeAmount {
        strategy: Address,
        side: &'static str,
        amount: Decimal,
    },
    #[error(
        "Strategy {strategy} on {chain} reported as {found_base}/{found_quote} \
         after {expected_base}/{expected_quote}"
    )]
    SymbolMismatch {
        chain: String,
        strategy: Address,
        expected_base: String,
        expected_quote: String,
        found_base: String,
        found_quote: String,
    },
    #[error("No currency registered for {symbol} on {chain}")]
    UnknownCurrency { chain: String, symbol: String },
    #[error("No vault manages currency {currency} (token {symbol} on {chain})")]
    VaultNotFound {
        chain: String,
        symbol: String,
        currency: String,
    },
    #[error("Vault for currency {currency} has no controller on {chain}")]
    ControllerNotFound { chain: String, currency: String },
    #[error("Accumulated amount for strategy {strategy} overflows")]
    Overflow { strategy: Address },
}

/// Builds one [`ClaimParam`] per vault referenced by `providers`.
///
/// Fails on the first position that cannot be attributed or routed, without
/// returning any partial result.
pub fn aggregate_claims(
    providers: &[LiquidityProvider],
    vaults: &[VaultInfo],
    tokens: &dyn TokenRegistry,
) -> Result<Vec<ClaimParam>, AggregationError> {
    let mut params: Vec<ClaimParam> = Vec::new();
    // (chain, strategy) -> (index into params, index into its strategies)
    let mut seen: HashMap<(String, Address), (usize, usize)> = HashMap::new();

    for provider in providers {
        let chain_key = provider.chain.to_lowercase();

        for info in &provider.lp_info_list {
            let raw_strategy = info
                .strategy_address
                .as_deref()
                .map(str::trim)
                .filter(|address| !address.is_empty())
                .ok_or_else(|| AggregationError::MissingStrategyAddress {
                    chain: provider.chain.clone(),
                    lp_index: info.lp_index,
                })?;

            let strategy_address = parse_address("strategyAddress", raw_strategy)?;

            for (side, amount) in [
                ("base", info.base_token_amount),
                ("quote", info.quote_token_amount),
            ] {
                if amount.is_sign_negative() && !amount.is_zero() {
                    return Err(AggregationError::NegativeAmount {
                        strategy: strategy_address,
                        side,
                        amount,
                    });
                }
            }

            if let Some(&(param_index, strategy_index)) =
                seen.get(&(chain_key.clone(), strategy_address))
            {
                let strategy = &mut params[param_index].strategies[strategy_index];

                if strategy.base_symbol != info.base_token_symbol
                    || strategy.quote_symbol != info.quote_token_symbol
                {
                    return Err(AggregationError::SymbolMismatch {
                        chain: provider.chain.clone(),
                        strategy: strategy_address,
                        expected_base: strategy.base_symbol.clone(),
                        expected_quote: strategy.quote_symbol.clone(),
                        found_base: info.base_token_symbol.clone(),
                        found_quote: info.quote_token_symbol.clone(),
                    });
                }

                let overflow = || AggregationError::Overflow {
                    strategy: strategy_address,
                };
                strategy.base_amount = strategy
                    .base_amount
                    .checked_add(info.base_token_amount)
                    .ok_or_else(overflow)?;
                strategy.quote_amount = strategy
                    .quote_amount
                    .checked_add(info.quote_token_amount)
                    .ok_or_else(overflow)?;

                continue;
            }

            let vault_address =
                resolve_vault(&provider.chain, &info.base_token_symbol, vaults, tokens)?;

            let param_index = match params.iter().position(|param| {
                param.vault_address == vault_address
                    && param.chain_name.eq_ignore_ascii_case(&provider.chain)
            }) {
                Some(index) => index,
                None => {
                    params.push(ClaimParam {
                        chain_id: provider.chain_id,
                        chain_name: provider.chain.clone(),
                        vault_address,
                        strategies: Vec::new(),
                    });
                    params.len() - 1
                }
            };

            let strategies = &mut params[param_index].strategies;
            strategies.push(Strategy {
                strategy_address,
                base_symbol: info.base_token_symbol.clone(),
                quote_symbol: info.quote_token_symbol.clone(),
                base_amount: info.base_token_amount,
                quote_amount: info.quote_token_amount,
            });

            seen.insert(
                (chain_key.clone(), strategy_address),
                (param_index, strategies.len() - 1),
            );
        }
    }

    Ok(params)
}

/// token -> currency -> vault managing that currency -> its controller on
/// `chain`.
fn resolve_vault(
    chain: &str,
    symbol: &str,
    vaults: &[VaultInfo],
    tokens: &dyn TokenRegistry,
) -> Result<Address, AggregationError> {
    let currency =
        tokens
            .currency(chain, symbol)
            .ok_or_else(|| AggregationError::UnknownCurrency {
                chain: chain.to_string(),
                symbol: symbol.to_string(),
            })?;

    let vault = vaults
        .iter()
        .find(|vault| vault.currency == currency)
        .ok_or_else(|| AggregationError::VaultNotFound {
            chain: chain.to_string(),
            symbol: symbol.to_string(),
            currency: currency.to_string(),
        })?;

    let controller =
        vault
            .controller(chain)
            .ok_or_else(|| AggregationError::ControllerNotFound {
                chain: chain.to_string(),
                currency: currency.to_string(),
            })?;

    parse_address("controllerAddress", &controller.controller_address)
}

fn parse_address(field: &'static str, value: &str) -> Result<Address, AggregationError> {
    value
        .trim()
        .parse()
        .map_err(|_| AggregationError::InvalidAddress {
            field,
            value: value.to_string(),
        })
}
