//! Sub-transactions derived from a workflow stage.
//!
//! A stage builds [`TransactionDraft`]s (what to call), the gas/nonce
//! assigner turns them into [`PreparedTransaction`]s (how to send it) and
//! they are persisted as [`TransactionTask`]s. From then on the external
//! submission pipeline owns them: it signs, broadcasts and confirms each one
//! and records the terminal state, which stages only ever read.

use alloy::primitives::{Address, Bytes, TxHash, U256};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::fmt::Display;
use std::str::FromStr;

use crate::error::{PersistenceError, UnknownTagError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    ClaimFromVault,
    AssetTransferOut,
    AssetTransferIn,
    Invest,
}

impl TransactionType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ClaimFromVault => "claim_from_vault",
            Self::AssetTransferOut => "asset_transfer_out",
            Self::AssetTransferIn => "asset_transfer_in",
            Self::Invest => "invest",
        }
    }
}

impl Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TransactionType {
    type Err = UnknownTagError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "claim_from_vault" => Ok(Self::ClaimFromVault),
            "asset_transfer_out" => Ok(Self::AssetTransferOut),
            "asset_transfer_in" => Ok(Self::AssetTransferIn),
            "invest" => Ok(Self::Invest),
            other => Err(UnknownTagError::new("transaction type", other)),
        }
    }
}

/// Lifecycle: `Unsigned -> Signed -> Submitted -> Success | Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Unsigned,
    Signed,
    Submitted,
    Success,
    Failed,
}

impl TransactionState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unsigned => "unsigned",
            Self::Signed => "signed",
            Self::Submitted => "submitted",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

impl Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TransactionState {
    type Err = UnknownTagError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "unsigned" => Ok(Self::Unsigned),
            "signed" => Ok(Self::Signed),
            "submitted" => Ok(Self::Submitted),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            other => Err(UnknownTagError::new("transaction state", other)),
        }
    }
}

/// The record a sub-transaction belongs to. Workflow and asset transfer ids
/// come from separate tables and may coincide, so the kind is part of the
/// key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskOwner {
    Workflow(i64),
    AssetTransfer(i64),
}

impl TaskOwner {
    pub const fn kind(self) -> &'static str {
        match self {
            Self::Workflow(_) => "rebalance_workflow",
            Self::AssetTransfer(_) => "asset_transfer",
        }
    }

    pub const fn id(self) -> i64 {
        match self {
            Self::Workflow(id) | Self::AssetTransfer(id) => id,
        }
    }

    fn from_columns(kind: &str, id: i64) -> Result<Self, UnknownTagError> {
        match kind {
            "rebalance_workflow" => Ok(Self::Workflow(id)),
            "asset_transfer" => Ok(Self::AssetTransfer(id)),
            other => Err(UnknownTagError::new("task owner", other)),
        }
    }
}

/// A contract call a stage wants executed, before nonce and gas are known.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionDraft {
    pub owner: TaskOwner,
    pub transaction_type: TransactionType,
    pub chain_id: u64,
    pub chain_name: String,
    pub from: Address,
    pub to: Address,
    pub input_data: Bytes,
    /// Human-readable record of what the call does, kept for audit and
    /// alerting.
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GasAssignment {
    pub nonce: u64,
    pub gas_price: U256,
    pub gas_limit: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PreparedTransaction {
    pub draft: TransactionDraft,
    pub gas: GasAssignment,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransactionTask {
    pub id: i64,
    pub draft: TransactionDraft,
    pub gas: GasAssignment,
    pub state: TransactionState,
    pub message: String,
    pub tx_hash: Option<TxHash>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Success/failure tally over a stage's sub-transactions, recomputed on
/// every poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub all: usize,
    pub success: usize,
    pub failed: usize,
}

impl Progress {
    pub fn from_tasks(tasks: &[TransactionTask]) -> Self {
        tasks.iter().fold(
            Self {
                all: tasks.len(),
                ..Self::default()
            },
            |mut progress, task| {
                match task.state {
                    TransactionState::Success => progress.success += 1,
                    TransactionState::Failed => progress.failed += 1,
                    TransactionState::Unsigned
                    | TransactionState::Signed
                    | TransactionState::Submitted => {}
                }
                progress
            },
        )
    }

    pub const fn pending(&self) -> usize {
        self.all - self.success - self.failed
    }

    pub const fn all_succeeded(&self) -> bool {
        self.success == self.all
    }

    pub const fn has_failures(&self) -> bool {
        self.failed > 0
    }
}

impl Display for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{} failed:{}", self.success, self.all, self.failed)
    }
}

#[derive(sqlx::FromRow)]
struct TransactionTaskRow {
    id: i64,
    owner_kind: String,
    owner_id: i64,
    transaction_type: String,
    chain_id: i64,
    chain_name: String,
    from_address: String,
    to_address: String,
    nonce: i64,
    gas_price: String,
    gas_limit: i64,
    input_data: String,
    params: String,
    state: String,
    message: String,
    tx_hash: Option<String>,
    created_at: NaiveDateTime,
    updated_at: NaiveDateTime,
}

fn parse_column<T: FromStr>(field: &'static str, value: &str) -> Result<T, PersistenceError> {
    value.parse().map_err(|_| PersistenceError::InvalidColumn {
        field,
        value: value.to_string(),
    })
}

fn unsigned_column(field: &'static str, value: i64) -> Result<u64, PersistenceError> {
    u64::try_from(value).map_err(|_| PersistenceError::InvalidColumn {
        field,
        value: value.to_string(),
    })
}

fn sqlite_integer(field: &'static str, value: u64) -> Result<i64, PersistenceError> {
    i64::try_from(value).map_err(|_| PersistenceError::IntegerOverflow { field, value })
}

impl TryFrom<TransactionTaskRow> for TransactionTask {
    type Error = PersistenceError;

    fn try_from(row: TransactionTaskRow) -> Result<Self, Self::Error> {
        let params = serde_json::from_str(&row.params).map_err(|source| {
            PersistenceError::MalformedParams {
                entity: "transaction task",
                id: row.id,
                source,
            }
        })?;

        let gas_price = U256::from_str_radix(&row.gas_price, 10).map_err(|_| {
            PersistenceError::InvalidColumn {
                field: "gas_price",
                value: row.gas_price.clone(),
            }
        })?;

        let tx_hash = row
            .tx_hash
            .as_deref()
            .map(|hash| parse_column("tx_hash", hash))
            .transpose()?;

        Ok(Self {
            id: row.id,
            draft: TransactionDraft {
                owner: TaskOwner::from_columns(&row.owner_kind, row.owner_id)?,
                transaction_type: row.transaction_type.parse()?,
                chain_id: unsigned_column("chain_id", row.chain_id)?,
                chain_name: row.chain_name,
                from: parse_column("from_address", &row.from_address)?,
                to: parse_column("to_address", &row.to_address)?,
                input_data: parse_column("input_data", &row.input_data)?,
                params,
            },
            gas: GasAssignment {
                nonce: unsigned_column("nonce", row.nonce)?,
                gas_price,
                gas_limit: unsigned_column("gas_limit", row.gas_limit)?,
            },
            state: row.state.parse()?,
            message: row.message,
            tx_hash,
            created_at: row.created_at.and_utc(),
            updated_at: row.updated_at.and_utc(),
        })
    }
}

/// Inserts a batch of sub-transactions inside the caller's transaction and
/// returns their ids in batch order.
///
/// Nothing is visible to other connections until the caller commits, and a
/// failure on any row leaves the whole batch to be rolled back with the
/// transaction.
#[tracing::instrument(
    skip_all,
    fields(batch_size = transactions.len()),
    level = tracing::Level::DEBUG
)]
pub async fn save_transaction_tasks(
    sql_tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    transactions: &[PreparedTransaction],
) -> Result<Vec<i64>, PersistenceError> {
    let mut ids = Vec::with_capacity(transactions.len());

    for PreparedTransaction { draft, gas } in transactions {
        let id = sqlx::query(
            "INSERT INTO transaction_tasks (
                owner_kind, owner_id, transaction_type, chain_id, chain_name,
                from_address, to_address, nonce, gas_price, gas_limit,
                input_data, params, state
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        )
        .bind(draft.owner.kind())
        .bind(draft.owner.id())
        .bind(draft.transaction_type.as_str())
        .bind(sqlite_integer("chain_id", draft.chain_id)?)
        .bind(&draft.chain_name)
        .bind(format!("{:#x}", draft.from))
        .bind(format!("{:#x}", draft.to))
        .bind(sqlite_integer("nonce", gas.nonce)?)
        .bind(gas.gas_price.to_string())
        .bind(sqlite_integer("gas_limit", gas.gas_limit)?)
        .bind(draft.input_data.to_string())
        .bind(serde_json::to_string(&draft.params)?)
        .bind(TransactionState::Unsigned.as_str())
        .execute(&mut **sql_tx)
        .await?
        .last_insert_rowid();

        ids.push(id);
    }

    Ok(ids)
}

/// All sub-transactions of one type belonging to `owner`, in creation
/// order.
#[tracing::instrument(skip(pool), level = tracing::Level::DEBUG)]
pub async fn find_transaction_tasks(
    pool: &SqlitePool,
    owner: TaskOwner,
    transaction_type: TransactionType,
) -> Result<Vec<TransactionTask>, PersistenceError> {
    let rows = sqlx::query_as::<_, TransactionTaskRow>(
        "SELECT
            id, owner_kind, owner_id, transaction_type, chain_id, chain_name,
            from_address, to_address, nonce, gas_price, gas_limit,
            input_data, params, state, message, tx_hash, created_at, updated_at
         FROM transaction_tasks
         WHERE owner_kind = ?1 AND owner_id = ?2 AND transaction_type = ?3
         ORDER BY id ASC",
    )
    .bind(owner.kind())
    .bind(owner.id())
    .bind(transaction_type.as_str())
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(TransactionTask::try_from).collect()
}

/// Records progress reported by the submission pipeline.
#[tracing::instrument(skip(pool, message), level = tracing::Level::DEBUG)]
pub async fn update_transaction_task_state(
    pool: &SqlitePool,
    id: i64,
    state: TransactionState,
    message: &str,
    tx_hash: Option<TxHash>,
) -> Result<(), PersistenceError> {
    sqlx::query(
        "UPDATE transaction_tasks
         SET state = ?1, message = ?2, tx_hash = COALESCE(?3, tx_hash),
             updated_at = CURRENT_TIMESTAMP
         WHERE id = ?4",
    )
    .bind(state.as_str())
    .bind(message)
    .bind(tx_hash.map(|hash| format!("{hash:#x}")))
    .bind(id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Highest nonce already persisted for a sender on a chain.
pub async fn highest_nonce(
    pool: &SqlitePool,
    chain_id: u64,
    from: Address,
) -> Result<Option<u64>, PersistenceError> {
    let nonce: Option<i64> = sqlx::query_scalar(
        "SELECT MAX(nonce) FROM transaction_tasks WHERE chain_id = ?1 AND from_address = ?2",
    )
    .bind(sqlite_integer("chain_id", chain_id)?)
    .bind(format!("{from:#x}"))
    .fetch_one(pool)
    .await?;

    nonce.map(|nonce| unsigned_column("nonce", nonce)).transpose()
}
