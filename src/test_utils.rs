//! Shared test fixtures: database setup, a two-chain treasury layout
//! (BSC and Polygon) and builders for liquidity data and sub-transactions.

use alloy::primitives::{Address, U256, address, bytes};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;
use sqlx::SqlitePool;
use std::collections::BTreeMap;

use crate::config::{ChainConfig, Chains};
use crate::liquidity::{ControllerInfo, LiquidityProvider, LiquiditySnapshot, LpInfo, VaultInfo};
use crate::tokens::{ConfiguredTokens, TokenConfig};
use crate::transaction_task::{
    GasAssignment, PreparedTransaction, TaskOwner, TransactionDraft, TransactionType,
};

pub(crate) const BSC_BRIDGE: Address = address!("0x1111111111111111111111111111111111111111");
pub(crate) const POLYGON_BRIDGE: Address = address!("0x1111111111111111111111111111111111000137");
pub(crate) const BSC_USD_VAULT: Address = address!("0xa000000000000000000000000000000000000056");
pub(crate) const POLYGON_USD_VAULT: Address =
    address!("0xa000000000000000000000000000000000000137");
pub(crate) const BSC_USDT_STRATEGY: Address =
    address!("0xb000000000000000000000000000000000000001");
pub(crate) const BSC_USDC_STRATEGY: Address =
    address!("0xb000000000000000000000000000000000000002");

/// Centralized test database setup to eliminate duplication across test files.
/// Creates an in-memory SQLite database with all migrations applied.
pub(crate) async fn setup_test_db() -> SqlitePool {
    let pool = SqlitePool::connect(":memory:").await.unwrap();
    sqlx::migrate!().run(&pool).await.unwrap();
    pool
}

pub(crate) fn test_chains() -> Chains {
    [
        (
            "bsc".to_string(),
            ChainConfig {
                chain_id: 56,
                bridge_address: BSC_BRIDGE,
                gas_price: 3_000_000_000,
                gas_limit: 800_000,
            },
        ),
        (
            "polygon".to_string(),
            ChainConfig {
                chain_id: 137,
                bridge_address: POLYGON_BRIDGE,
                gas_price: 30_000_000_000,
                gas_limit: 500_000,
            },
        ),
    ]
    .into_iter()
    .collect()
}

/// 18-decimal stablecoins on BSC, 6-decimal ones on Polygon, all in USD.
pub(crate) fn test_tokens() -> ConfiguredTokens {
    let token = |chain: &str, symbol: &str, decimals: u8, currency: &str| TokenConfig {
        chain: chain.to_string(),
        symbol: symbol.to_string(),
        decimals,
        currency: currency.to_string(),
    };

    ConfiguredTokens::new(vec![
        token("bsc", "USDT", 18, "USD"),
        token("bsc", "USDC", 18, "USD"),
        token("bsc", "BUSD", 18, "USD"),
        token("bsc", "ETH", 18, "ETH"),
        token("polygon", "USDC", 6, "USD"),
        token("polygon", "USDT", 6, "USD"),
    ])
    .unwrap()
}

/// A USD vault controlled per chain, plus an ETH vault with no BSC
/// controller.
pub(crate) fn test_vaults() -> Vec<VaultInfo> {
    let controller = |address: Address| ControllerInfo {
        amount: None,
        controller_address: format!("{address:#x}"),
    };

    vec![
        VaultInfo {
            token_symbol: "ETH".to_string(),
            chain: "ethereum".to_string(),
            currency: "ETH".to_string(),
            active_amount: BTreeMap::from([(
                "ethereum".to_string(),
                controller(address!("0xa000000000000000000000000000000000000001")),
            )]),
        },
        VaultInfo {
            token_symbol: "USDT".to_string(),
            chain: "bsc".to_string(),
            currency: "USD".to_string(),
            active_amount: BTreeMap::from([
                ("bsc".to_string(), controller(BSC_USD_VAULT)),
                ("polygon".to_string(), controller(POLYGON_USD_VAULT)),
            ]),
        },
    ]
}

pub(crate) fn lp_info(
    lp_index: u64,
    strategy: Address,
    base_symbol: &str,
    quote_symbol: &str,
    base_amount: Decimal,
    quote_amount: Decimal,
) -> LpInfo {
    LpInfo {
        lp_index,
        lp_amount: None,
        base_token_address: String::new(),
        quote_token_address: String::new(),
        base_token_symbol: base_symbol.to_string(),
        quote_token_symbol: quote_symbol.to_string(),
        base_token_amount: base_amount,
        quote_token_amount: quote_amount,
        strategy_address: Some(format!("{strategy:#x}")),
    }
}

pub(crate) fn provider(chain: &str, chain_id: u64, lp_info_list: Vec<LpInfo>) -> LiquidityProvider {
    LiquidityProvider {
        chain: chain.to_string(),
        chain_id,
        lp_symbol: String::new(),
        lp_amount: None,
        lp_token_address: String::new(),
        lp_platform: String::new(),
        lp_info_list,
    }
}

/// A BSC claim from the bridge to the USD vault with the given nonce.
pub(crate) fn prepared_claim(workflow_id: i64, nonce: u64) -> PreparedTransaction {
    PreparedTransaction {
        draft: TransactionDraft {
            owner: TaskOwner::Workflow(workflow_id),
            transaction_type: TransactionType::ClaimFromVault,
            chain_id: 56,
            chain_name: "bsc".to_string(),
            from: BSC_BRIDGE,
            to: BSC_USD_VAULT,
            input_data: bytes!("0x12345678"),
            params: json!({"vault_address": format!("{BSC_USD_VAULT:#x}")}),
        },
        gas: GasAssignment {
            nonce,
            gas_price: U256::from(3_000_000_000u64),
            gas_limit: 800_000,
        },
    }
}

/// Two BSC strategies (one reported twice) and one Polygon strategy, all
/// routed to the USD vault.
pub(crate) fn two_chain_snapshot() -> LiquiditySnapshot {
    let polygon_strategy = address!("0xb000000000000000000000000000000000000137");

    LiquiditySnapshot {
        thresholds: vec![],
        vault_info_list: test_vaults(),
        liquidity_provider_list: vec![
            provider(
                "bsc",
                56,
                vec![
                    lp_info(0, BSC_USDT_STRATEGY, "USDT", "BUSD", dec!(100.5), dec!(99.5)),
                    lp_info(1, BSC_USDC_STRATEGY, "USDC", "USDT", dec!(10), dec!(10)),
                    lp_info(2, BSC_USDT_STRATEGY, "USDT", "BUSD", dec!(0.5), dec!(0.5)),
                ],
            ),
            provider(
                "polygon",
                137,
                vec![lp_info(0, polygon_strategy, "USDC", "USDT", dec!(1.25), dec!(2))],
            ),
        ],
    }
}
