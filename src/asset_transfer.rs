//! Asset transfer tasks: a reduced two-step saga moving funds into or out of
//! the treasury with pre-encoded transfer calls.
//!
//! `Init` persists the transfer calls as sub-transactions and moves to
//! `Ongoing` in one transaction; `Ongoing` tallies them until every call
//! succeeded (`Success`) or any failed (`Failed`).

use alloy::primitives::{Address, Bytes};
use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::error::{PersistenceError, UnknownTagError};
use crate::gas::{GasAssignmentError, GasNonceAssigner};
use crate::lock::{ASSET_TRANSFER_LEASE, Lease, release_lease, try_acquire_lease};
use crate::transaction_task::{
    Progress, TaskOwner, TransactionDraft, TransactionType, find_transaction_tasks,
    save_transaction_tasks,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetTransferState {
    Init,
    Ongoing,
    Success,
    Failed,
}

impl AssetTransferState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Ongoing => "ongoing",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Init, Self::Init | Self::Ongoing | Self::Failed)
                | (Self::Ongoing, Self::Ongoing | Self::Success | Self::Failed)
        )
    }
}

impl Display for AssetTransferState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for AssetTransferState {
    type Err = UnknownTagError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "init" => Ok(Self::Init),
            "ongoing" => Ok(Self::Ongoing),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            other => Err(UnknownTagError::new("asset transfer state", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferType {
    Out,
    In,
}

impl TransferType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Out => "out",
            Self::In => "in",
        }
    }

    pub const fn transaction_type(self) -> TransactionType {
        match self {
            Self::Out => TransactionType::AssetTransferOut,
            Self::In => TransactionType::AssetTransferIn,
        }
    }
}

impl FromStr for TransferType {
    type Err = UnknownTagError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "out" => Ok(Self::Out),
            "in" => Ok(Self::In),
            other => Err(UnknownTagError::new("transfer type", other)),
        }
    }
}

/// A transfer call prepared by whoever opened the task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferCall {
    pub chain_id: u64,
    pub chain_name: String,
    pub from: Address,
    pub to: Address,
    pub input_data: Bytes,
    pub symbol: String,
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "version", rename_all = "snake_case")]
pub enum TransferParams {
    V1 { transfers: Vec<TransferCall> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssetTransferTask {
    pub id: i64,
    pub rebalance_id: i64,
    pub transfer_type: TransferType,
    pub state: AssetTransferState,
    pub params: TransferParams,
    pub progress: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AssetTransferTask {
    pub const fn owner(&self) -> TaskOwner {
        TaskOwner::AssetTransfer(self.id)
    }
}

#[derive(sqlx::FromRow)]
struct AssetTransferRow {
    id: i64,
    rebalance_id: i64,
    transfer_type: String,
    state: String,
    params: String,
    progress: String,
    message: String,
    created_at: NaiveDateTime,
    updated_at: NaiveDateTime,
}

impl TryFrom<AssetTransferRow> for AssetTransferTask {
    type Error = PersistenceError;

    fn try_from(row: AssetTransferRow) -> Result<Self, Self::Error> {
        let params = serde_json::from_str(&row.params).map_err(|source| {
            PersistenceError::MalformedParams {
                entity: "asset transfer task",
                id: row.id,
                source,
            }
        })?;

        Ok(Self {
            id: row.id,
            rebalance_id: row.rebalance_id,
            transfer_type: row.transfer_type.parse()?,
            state: row.state.parse()?,
            params,
            progress: row.progress,
            message: row.message,
            created_at: row.created_at.and_utc(),
            updated_at: row.updated_at.and_utc(),
        })
    }
}

const SELECT_ASSET_TRANSFER: &str = "
    SELECT id, rebalance_id, transfer_type, state, params, progress, message,
           created_at, updated_at
    FROM asset_transfer_tasks
";

pub async fn create_asset_transfer_task(
    pool: &SqlitePool,
    rebalance_id: i64,
    transfer_type: TransferType,
    params: &TransferParams,
) -> Result<AssetTransferTask, PersistenceError> {
    let id = sqlx::query(
        "INSERT INTO asset_transfer_tasks (rebalance_id, transfer_type, state, params)
         VALUES (?1, ?2, ?3, ?4)",
    )
    .bind(rebalance_id)
    .bind(transfer_type.as_str())
    .bind(AssetTransferState::Init.as_str())
    .bind(serde_json::to_string(params)?)
    .execute(pool)
    .await?
    .last_insert_rowid();

    info!(asset_transfer_id = id, rebalance_id, "Created asset transfer task");
    find_asset_transfer_task(pool, id).await
}

pub async fn find_asset_transfer_task(
    pool: &SqlitePool,
    id: i64,
) -> Result<AssetTransferTask, PersistenceError> {
    sqlx::query_as::<_, AssetTransferRow>(&format!("{SELECT_ASSET_TRANSFER} WHERE id = ?1"))
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or(PersistenceError::AssetTransferNotFound(id))?
        .try_into()
}

pub async fn find_open_asset_transfer_tasks(
    pool: &SqlitePool,
) -> Result<Vec<AssetTransferTask>, PersistenceError> {
    let rows = sqlx::query_as::<_, AssetTransferRow>(&format!(
        "{SELECT_ASSET_TRANSFER} WHERE state IN ('init', 'ongoing') ORDER BY id ASC"
    ))
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(AssetTransferTask::try_from).collect()
}

/// Writes state, progress and message if the task is still in `expected`.
pub async fn update_asset_transfer_task(
    sql_tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    expected: AssetTransferState,
    task: &AssetTransferTask,
) -> Result<(), PersistenceError> {
    if !expected.can_transition_to(task.state) {
        return Err(PersistenceError::InvalidTransferTransition {
            id: task.id,
            from: expected,
            to: task.state,
        });
    }

    let updated = sqlx::query(
        "UPDATE asset_transfer_tasks
         SET state = ?1, progress = ?2, message = ?3, updated_at = CURRENT_TIMESTAMP
         WHERE id = ?4 AND state = ?5",
    )
    .bind(task.state.as_str())
    .bind(&task.progress)
    .bind(&task.message)
    .bind(task.id)
    .bind(expected.as_str())
    .execute(&mut **sql_tx)
    .await?
    .rows_affected();

    if updated == 0 {
        let stored: Option<String> =
            sqlx::query_scalar("SELECT state FROM asset_transfer_tasks WHERE id = ?1")
                .bind(task.id)
                .fetch_optional(&mut **sql_tx)
                .await?;

        let stored: AssetTransferState = stored
            .ok_or(PersistenceError::AssetTransferNotFound(task.id))?
            .parse()?;

        return Err(PersistenceError::StaleAssetTransfer {
            id: task.id,
            expected,
            stored,
        });
    }

    Ok(())
}

#[derive(Debug, Error)]
pub enum AssetTransferError {
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    GasAssignment(#[from] GasAssignmentError),
    #[error("Failed to serialize transfer call")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferTickOutcome {
    LeaseHeld,
    Idle,
    Submitted { task_id: i64, transactions: usize },
    Polled {
        task_id: i64,
        state: AssetTransferState,
        progress: Progress,
    },
}

pub struct AssetTransferService {
    pool: SqlitePool,
    gas: Arc<dyn GasNonceAssigner>,
}

impl AssetTransferService {
    pub fn new(pool: SqlitePool, gas: Arc<dyn GasNonceAssigner>) -> Self {
        Self { pool, gas }
    }

    pub async fn tick(&self) -> Result<TransferTickOutcome, AssetTransferError> {
        let mut sql_tx = self.pool.begin().await?;
        let lease = try_acquire_lease(&mut sql_tx, ASSET_TRANSFER_LEASE).await?;
        sql_tx.commit().await?;

        let Some(lease) = lease else {
            return Ok(TransferTickOutcome::LeaseHeld);
        };

        let result = self.run().await;

        let released = self.release(&lease).await;
        if let (Err(release_error), Err(_)) = (&released, &result) {
            error!(?release_error, "Failed to release asset transfer lease");
        }

        let outcome = result?;
        released?;
        Ok(outcome)
    }

    async fn release(&self, lease: &Lease) -> Result<(), AssetTransferError> {
        let mut sql_tx = self.pool.begin().await?;
        release_lease(&mut sql_tx, lease).await?;
        sql_tx.commit().await?;
        Ok(())
    }

    async fn run(&self) -> Result<TransferTickOutcome, AssetTransferError> {
        let open = find_open_asset_transfer_tasks(&self.pool).await?;

        let Some(task) = open.first() else {
            info!("No open asset transfer task");
            return Ok(TransferTickOutcome::Idle);
        };

        if open.len() > 1 {
            error!(
                open_task_ids = ?open.iter().map(|task| task.id).collect::<Vec<_>>(),
                "More than one asset transfer task open, continuing with the oldest"
            );
        }

        match task.state {
            AssetTransferState::Init => self.submit(task).await,
            AssetTransferState::Ongoing => self.poll(task).await,
            AssetTransferState::Success | AssetTransferState::Failed => {
                warn!(task_id = task.id, state = %task.state, "Terminal task listed as open");
                Ok(TransferTickOutcome::Idle)
            }
        }
    }

    async fn submit(
        &self,
        task: &AssetTransferTask,
    ) -> Result<TransferTickOutcome, AssetTransferError> {
        let TransferParams::V1 { transfers } = &task.params;

        let drafts = transfers
            .iter()
            .map(|transfer| {
                Ok(TransactionDraft {
                    owner: task.owner(),
                    transaction_type: task.transfer_type.transaction_type(),
                    chain_id: transfer.chain_id,
                    chain_name: transfer.chain_name.clone(),
                    from: transfer.from,
                    to: transfer.to,
                    input_data: transfer.input_data.clone(),
                    params: serde_json::to_value(transfer)?,
                })
            })
            .collect::<Result<Vec<_>, serde_json::Error>>()?;

        let prepared = self.gas.assign(drafts).await?;

        let mut ongoing = task.clone();
        ongoing.state = AssetTransferState::Ongoing;
        ongoing.progress = Progress {
            all: prepared.len(),
            ..Progress::default()
        }
        .to_string();

        let mut sql_tx = self.pool.begin().await?;
        save_transaction_tasks(&mut sql_tx, &prepared).await?;
        update_asset_transfer_task(&mut sql_tx, task.state, &ongoing).await?;
        sql_tx.commit().await?;

        info!(
            task_id = task.id,
            transactions = prepared.len(),
            "Submitted asset transfer transactions"
        );

        Ok(TransferTickOutcome::Submitted {
            task_id: task.id,
            transactions: prepared.len(),
        })
    }

    async fn poll(
        &self,
        task: &AssetTransferTask,
    ) -> Result<TransferTickOutcome, AssetTransferError> {
        let tasks =
            find_transaction_tasks(&self.pool, task.owner(), task.transfer_type.transaction_type())
                .await?;
        let progress = Progress::from_tasks(&tasks);

        let mut updated = task.clone();
        updated.progress = progress.to_string();
        updated.state = if progress.has_failures() {
            AssetTransferState::Failed
        } else if progress.all_succeeded() {
            AssetTransferState::Success
        } else {
            AssetTransferState::Ongoing
        };

        let mut sql_tx = self.pool.begin().await?;
        update_asset_transfer_task(&mut sql_tx, task.state, &updated).await?;
        sql_tx.commit().await?;

        if updated.state != task.state {
            info!(task_id = task.id, state = %updated.state, %progress, "Asset transfer settled");
        }

        Ok(TransferTickOutcome::Polled {
            task_id: task.id,
            state: updated.state,
            progress,
        })
    }
}
