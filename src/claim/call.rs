use alloy::primitives::{Bytes, U256};
use alloy::sol;
use alloy::sol_types::SolCall;
use st0x_base_units::{BaseUnitsError, to_base_units};
use thiserror::Error;

use super::ClaimParam;
use crate::tokens::TokenRegistry;

sol! {
    interface IVault {
        function claimAll(
            address[] _strategies,
            uint256[] _baseTokensAmount,
            uint256[] _counterTokensAmount,
            uint256[] _lpClaimIds
        ) external;
    }
}

#[derive(Debug, Error)]
pub enum ClaimCallError {
    #[error("No decimals registered for {symbol} on {chain}")]
    UnknownDecimals { chain: String, symbol: String },
    #[error("Cannot convert {symbol} amount to base units")]
    BaseUnits {
        symbol: String,
        #[source]
        source: BaseUnitsError,
    },
}

/// ABI-encodes the vault's `claimAll` call for every strategy in `param`,
/// in strategy order.
///
/// Claim ids are always zero: the vault claims the full position for each
/// strategy.
pub fn build_claim_call(
    param: &ClaimParam,
    tokens: &dyn TokenRegistry,
) -> Result<Bytes, ClaimCallError> {
    let strategy_count = param.strategies.len();
    let mut call = IVault::claimAllCall {
        _strategies: Vec::with_capacity(strategy_count),
        _baseTokensAmount: Vec::with_capacity(strategy_count),
        _counterTokensAmount: Vec::with_capacity(strategy_count),
        _lpClaimIds: Vec::with_capacity(strategy_count),
    };

    for strategy in &param.strategies {
        let base = scaled(
            tokens,
            &param.chain_name,
            &strategy.base_symbol,
            strategy.base_amount,
        )?;
        let quote = scaled(
            tokens,
            &param.chain_name,
            &strategy.quote_symbol,
            strategy.quote_amount,
        )?;

        call._strategies.push(strategy.strategy_address);
        call._baseTokensAmount.push(base);
        call._counterTokensAmount.push(quote);
        call._lpClaimIds.push(U256::ZERO);
    }

    tracing::info!(
        chain = %param.chain_name,
        vault = %param.vault_address,
        strategies = ?call._strategies,
        base_amounts = ?call._baseTokensAmount,
        quote_amounts = ?call._counterTokensAmount,
        "Built claimAll call"
    );

    Ok(call.abi_encode().into())
}

fn scaled(
    tokens: &dyn TokenRegistry,
    chain: &str,
    symbol: &str,
    amount: rust_decimal::Decimal,
) -> Result<U256, ClaimCallError> {
    let decimals =
        tokens
            .decimals(chain, symbol)
            .ok_or_else(|| ClaimCallError::UnknownDecimals {
                chain: chain.to_string(),
                symbol: symbol.to_string(),
            })?;

    to_base_units(amount, decimals).map_err(|source| ClaimCallError::BaseUnits {
        symbol: symbol.to_string(),
        source,
    })
}
