//! Nonce and gas assignment for batches of sub-transactions.

use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use sqlx::SqlitePool;
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

use crate::config::Chains;
use crate::error::PersistenceError;
use crate::transaction_task::{GasAssignment, PreparedTransaction, TransactionDraft, highest_nonce};

#[derive(Debug, Error)]
pub enum GasAssignmentError {
    #[error("No chain configured with id {chain_id} ({chain_name})")]
    UnknownChain { chain_id: u64, chain_name: String },
    #[error("Nonce space exhausted for {from} on chain {chain_id}")]
    NonceOverflow { chain_id: u64, from: Address },
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// Assigns nonce, gas price and gas limit to a batch, preserving batch
/// order.
#[async_trait]
pub trait GasNonceAssigner: Send + Sync {
    async fn assign(
        &self,
        drafts: Vec<TransactionDraft>,
    ) -> Result<Vec<PreparedTransaction>, GasAssignmentError>;
}

/// Continues each `(chain, sender)` after the highest nonce already
/// persisted and prices gas from the chain config.
///
/// Safe against concurrent batches only while callers are serialized (the
/// orchestrator lease); the unique `(chain_id, from_address, nonce)` index
/// rejects any collision that slips through.
pub struct SequentialNonceAssigner {
    pool: SqlitePool,
    chains: Chains,
}

impl SequentialNonceAssigner {
    pub fn new(pool: SqlitePool, chains: Chains) -> Self {
        Self { pool, chains }
    }
}

#[async_trait]
impl GasNonceAssigner for SequentialNonceAssigner {
    async fn assign(
        &self,
        drafts: Vec<TransactionDraft>,
    ) -> Result<Vec<PreparedTransaction>, GasAssignmentError> {
        let mut next_nonces: HashMap<(u64, Address), u64> = HashMap::new();
        let mut prepared = Vec::with_capacity(drafts.len());

        for draft in drafts {
            let (_, chain) = self.chains.find_by_id(draft.chain_id).ok_or_else(|| {
                GasAssignmentError::UnknownChain {
                    chain_id: draft.chain_id,
                    chain_name: draft.chain_name.clone(),
                }
            })?;

            let key = (draft.chain_id, draft.from);
            let nonce = match next_nonces.get(&key) {
                Some(&nonce) => nonce,
                None => match highest_nonce(&self.pool, draft.chain_id, draft.from).await? {
                    Some(highest) => {
                        highest
                            .checked_add(1)
                            .ok_or(GasAssignmentError::NonceOverflow {
                                chain_id: draft.chain_id,
                                from: draft.from,
                            })?
                    }
                    None => 0,
                },
            };

            next_nonces.insert(key, nonce.saturating_add(1));

            debug!(
                chain_id = draft.chain_id,
                from = %draft.from,
                nonce,
                "Assigned nonce"
            );

            prepared.push(PreparedTransaction {
                draft,
                gas: GasAssignment {
                    nonce,
                    gas_price: U256::from(chain.gas_price),
                    gas_limit: chain.gas_limit,
                },
            });
        }

        Ok(prepared)
    }
}
