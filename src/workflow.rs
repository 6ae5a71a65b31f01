//! The rebalance workflow: the persisted top-level saga that moves through
//! a fixed sequence of stages.
//!
//! At most one workflow is open (non-terminal) at a time. Workflows are
//! never deleted; they only move forward until they reach `Success` or the
//! absorbing `Failed` state.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::fmt::Display;
use std::str::FromStr;
use tracing::info;

use crate::error::{PersistenceError, UnknownTagError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebalanceState {
    Init,
    ClaimLp,
    MarginBalanceTransferOut,
    Success,
    Failed,
}

impl RebalanceState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::ClaimLp => "claim_lp",
            Self::MarginBalanceTransferOut => "margin_balance_transfer_out",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    const fn position(self) -> u8 {
        match self {
            Self::Init => 0,
            Self::ClaimLp => 1,
            Self::MarginBalanceTransferOut => 2,
            Self::Success | Self::Failed => 3,
        }
    }

    /// Staying put is always allowed. Otherwise workflows only move
    /// forward, `Failed` is reachable from every open state and terminal
    /// states never change.
    pub const fn can_transition_to(self, next: Self) -> bool {
        if self as u8 == next as u8 {
            return true;
        }

        if self.is_terminal() {
            return false;
        }

        matches!(next, Self::Failed) || next.position() > self.position()
    }
}

impl Display for RebalanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RebalanceState {
    type Err = UnknownTagError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "init" => Ok(Self::Init),
            "claim_lp" => Ok(Self::ClaimLp),
            "margin_balance_transfer_out" => Ok(Self::MarginBalanceTransferOut),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            other => Err(UnknownTagError::new("rebalance state", other)),
        }
    }
}

/// Input the workflow was opened with. Versioned so that records written by
/// older releases keep deserializing and malformed payloads are caught when
/// the row is loaded rather than deep inside a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "version", rename_all = "snake_case")]
pub enum WorkflowParams {
    V1 {
        initiated_by: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
}

impl WorkflowParams {
    pub fn v1(initiated_by: impl Into<String>) -> Self {
        Self::V1 {
            initiated_by: initiated_by.into(),
            note: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RebalanceWorkflow {
    pub id: i64,
    pub state: RebalanceState,
    pub params: WorkflowParams,
    /// Operator-facing outcome of the last transition.
    pub message: String,
    /// Human-readable sub-transaction progress, e.g. `"2/3 failed:1"`.
    pub progress: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RebalanceWorkflow {
    /// Params as stored, for reports and the CLI.
    pub fn params_json(&self) -> String {
        serde_json::to_string(&self.params).unwrap_or_else(|_| format!("{:?}", self.params))
    }
}

#[derive(sqlx::FromRow)]
struct WorkflowRow {
    id: i64,
    state: String,
    params: String,
    message: String,
    progress: String,
    created_at: NaiveDateTime,
    updated_at: NaiveDateTime,
}

impl TryFrom<WorkflowRow> for RebalanceWorkflow {
    type Error = PersistenceError;

    fn try_from(row: WorkflowRow) -> Result<Self, Self::Error> {
        let params = serde_json::from_str(&row.params).map_err(|source| {
            PersistenceError::MalformedParams {
                entity: "rebalance workflow",
                id: row.id,
                source,
            }
        })?;

        Ok(Self {
            id: row.id,
            state: row.state.parse()?,
            params,
            message: row.message,
            progress: row.progress,
            created_at: row.created_at.and_utc(),
            updated_at: row.updated_at.and_utc(),
        })
    }
}

const SELECT_WORKFLOW: &str = "
    SELECT id, state, params, message, progress, created_at, updated_at
    FROM rebalance_workflows
";

/// Opens a new workflow in `Init`.
///
/// Refuses while another workflow is still open so that the orchestrator
/// never has to pick between competing workflows.
#[tracing::instrument(skip(pool), level = tracing::Level::DEBUG)]
pub async fn open_workflow(
    pool: &SqlitePool,
    params: &WorkflowParams,
) -> Result<RebalanceWorkflow, PersistenceError> {
    let params_json = serde_json::to_string(params)?;
    let mut sql_tx = pool.begin().await?;

    let open_id: Option<i64> = sqlx::query_scalar(
        "SELECT id FROM rebalance_workflows
         WHERE state NOT IN ('success', 'failed')
         ORDER BY id ASC
         LIMIT 1",
    )
    .fetch_optional(&mut *sql_tx)
    .await?;

    if let Some(open_id) = open_id {
        return Err(PersistenceError::WorkflowAlreadyOpen { open_id });
    }

    let id = sqlx::query("INSERT INTO rebalance_workflows (state, params) VALUES (?1, ?2)")
        .bind(RebalanceState::Init.as_str())
        .bind(params_json)
        .execute(&mut *sql_tx)
        .await?
        .last_insert_rowid();

    sql_tx.commit().await?;

    info!(workflow_id = id, "Opened rebalance workflow");
    find_workflow(pool, id).await
}

pub async fn find_workflow(
    pool: &SqlitePool,
    id: i64,
) -> Result<RebalanceWorkflow, PersistenceError> {
    let row = sqlx::query_as::<_, WorkflowRow>(&format!("{SELECT_WORKFLOW} WHERE id = ?1"))
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or(PersistenceError::WorkflowNotFound(id))?;

    row.try_into()
}

/// Every non-terminal workflow, oldest first.
#[tracing::instrument(skip(pool), level = tracing::Level::DEBUG)]
pub async fn find_open_workflows(
    pool: &SqlitePool,
) -> Result<Vec<RebalanceWorkflow>, PersistenceError> {
    let rows = sqlx::query_as::<_, WorkflowRow>(&format!(
        "{SELECT_WORKFLOW} WHERE state NOT IN ('success', 'failed') ORDER BY id ASC"
    ))
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(RebalanceWorkflow::try_from).collect()
}

/// Persists state, message and progress within the caller's transaction,
/// provided the stored state is still `expected`.
///
/// `expected` is the state the caller loaded the workflow in. If another
/// tick moved the workflow in the meantime the update matches no row and
/// fails with [`PersistenceError::StaleWorkflow`], rolling back whatever
/// the caller wrote in the same transaction.
#[tracing::instrument(
    skip(sql_tx, workflow),
    fields(workflow_id = workflow.id, state = %workflow.state),
    level = tracing::Level::DEBUG
)]
pub async fn update_workflow(
    sql_tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    expected: RebalanceState,
    workflow: &RebalanceWorkflow,
) -> Result<(), PersistenceError> {
    if !expected.can_transition_to(workflow.state) {
        return Err(PersistenceError::InvalidTransition {
            id: workflow.id,
            from: expected,
            to: workflow.state,
        });
    }

    let updated = sqlx::query(
        "UPDATE rebalance_workflows
         SET state = ?1, message = ?2, progress = ?3, updated_at = CURRENT_TIMESTAMP
         WHERE id = ?4 AND state = ?5",
    )
    .bind(workflow.state.as_str())
    .bind(&workflow.message)
    .bind(&workflow.progress)
    .bind(workflow.id)
    .bind(expected.as_str())
    .execute(&mut **sql_tx)
    .await?
    .rows_affected();

    if updated == 0 {
        let stored: Option<String> =
            sqlx::query_scalar("SELECT state FROM rebalance_workflows WHERE id = ?1")
                .bind(workflow.id)
                .fetch_optional(&mut **sql_tx)
                .await?;

        let stored: RebalanceState = stored
            .ok_or(PersistenceError::WorkflowNotFound(workflow.id))?
            .parse()?;

        return Err(PersistenceError::StaleWorkflow {
            id: workflow.id,
            expected,
            stored,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::setup_test_db;

    #[test]
    fn state_tags_roundtrip() {
        for state in [
            RebalanceState::Init,
            RebalanceState::ClaimLp,
            RebalanceState::MarginBalanceTransferOut,
            RebalanceState::Success,
            RebalanceState::Failed,
        ] {
            assert_eq!(state.as_str().parse::<RebalanceState>().unwrap(), state);
        }

        assert!("claimed".parse::<RebalanceState>().is_err());
    }

    #[test]
    fn workflows_only_move_forward() {
        use RebalanceState::*;

        assert!(Init.can_transition_to(ClaimLp));
        assert!(ClaimLp.can_transition_to(MarginBalanceTransferOut));
        assert!(MarginBalanceTransferOut.can_transition_to(Success));
        assert!(ClaimLp.can_transition_to(ClaimLp));

        assert!(!ClaimLp.can_transition_to(Init));
        assert!(!MarginBalanceTransferOut.can_transition_to(ClaimLp));
    }

    #[test]
    fn failed_is_reachable_and_absorbing() {
        use RebalanceState::*;

        assert!(Init.can_transition_to(Failed));
        assert!(ClaimLp.can_transition_to(Failed));

        assert!(!Failed.can_transition_to(Init));
        assert!(!Failed.can_transition_to(Success));
        assert!(!Success.can_transition_to(Failed));
    }

    #[test]
    fn params_are_versioned() {
        let params = WorkflowParams::V1 {
            initiated_by: "cron".to_string(),
            note: Some("weekly".to_string()),
        };

        let json = serde_json::to_value(&params).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"version": "v1", "initiated_by": "cron", "note": "weekly"})
        );

        let unversioned = r#"{"initiated_by": "cron"}"#;
        assert!(serde_json::from_str::<WorkflowParams>(unversioned).is_err());
    }

    #[tokio::test]
    async fn open_workflow_starts_in_init() {
        let pool = setup_test_db().await;

        let workflow = open_workflow(&pool, &WorkflowParams::v1("test")).await.unwrap();

        assert_eq!(workflow.state, RebalanceState::Init);
        assert_eq!(workflow.params, WorkflowParams::v1("test"));
        assert!(workflow.message.is_empty());
        assert!(workflow.progress.is_empty());
    }

    #[tokio::test]
    async fn second_open_workflow_is_refused() {
        let pool = setup_test_db().await;
        let first = open_workflow(&pool, &WorkflowParams::v1("test")).await.unwrap();

        let error = open_workflow(&pool, &WorkflowParams::v1("test"))
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            PersistenceError::WorkflowAlreadyOpen { open_id } if open_id == first.id
        ));
    }

    #[tokio::test]
    async fn new_workflow_can_open_after_previous_terminates() {
        let pool = setup_test_db().await;
        let mut first = open_workflow(&pool, &WorkflowParams::v1("test")).await.unwrap();

        first.state = RebalanceState::Failed;
        let mut sql_tx = pool.begin().await.unwrap();
        update_workflow(&mut sql_tx, RebalanceState::Init, &first)
            .await
            .unwrap();
        sql_tx.commit().await.unwrap();

        let second = open_workflow(&pool, &WorkflowParams::v1("test")).await.unwrap();

        let open = find_open_workflows(&pool).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, second.id);
    }

    #[tokio::test]
    async fn update_workflow_persists_state_message_and_progress() {
        let pool = setup_test_db().await;
        let mut workflow = open_workflow(&pool, &WorkflowParams::v1("test")).await.unwrap();

        workflow.state = RebalanceState::ClaimLp;
        workflow.message = "claim transactions created".to_string();
        workflow.progress = "0/2 failed:0".to_string();

        let mut sql_tx = pool.begin().await.unwrap();
        update_workflow(&mut sql_tx, RebalanceState::Init, &workflow)
            .await
            .unwrap();
        sql_tx.commit().await.unwrap();

        let stored = find_workflow(&pool, workflow.id).await.unwrap();
        assert_eq!(stored.state, RebalanceState::ClaimLp);
        assert_eq!(stored.message, "claim transactions created");
        assert_eq!(stored.progress, "0/2 failed:0");
    }

    #[tokio::test]
    async fn update_workflow_rejects_regression() {
        let pool = setup_test_db().await;
        let mut workflow = open_workflow(&pool, &WorkflowParams::v1("test")).await.unwrap();

        workflow.state = RebalanceState::MarginBalanceTransferOut;
        let mut sql_tx = pool.begin().await.unwrap();
        update_workflow(&mut sql_tx, RebalanceState::Init, &workflow)
            .await
            .unwrap();
        sql_tx.commit().await.unwrap();

        workflow.state = RebalanceState::ClaimLp;
        let mut sql_tx = pool.begin().await.unwrap();
        let error = update_workflow(
            &mut sql_tx,
            RebalanceState::MarginBalanceTransferOut,
            &workflow,
        )
        .await
        .unwrap_err();

        assert!(matches!(
            error,
            PersistenceError::InvalidTransition {
                from: RebalanceState::MarginBalanceTransferOut,
                to: RebalanceState::ClaimLp,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn update_from_stale_copy_is_rejected() {
        let pool = setup_test_db().await;
        let loaded = open_workflow(&pool, &WorkflowParams::v1("test")).await.unwrap();

        let mut first = loaded.clone();
        first.state = RebalanceState::ClaimLp;
        let mut sql_tx = pool.begin().await.unwrap();
        update_workflow(&mut sql_tx, RebalanceState::Init, &first)
            .await
            .unwrap();
        sql_tx.commit().await.unwrap();

        let mut second = loaded.clone();
        second.state = RebalanceState::ClaimLp;
        second.message = "second".to_string();
        let mut sql_tx = pool.begin().await.unwrap();
        let error = update_workflow(&mut sql_tx, RebalanceState::Init, &second)
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            PersistenceError::StaleWorkflow {
                expected: RebalanceState::Init,
                stored: RebalanceState::ClaimLp,
                ..
            }
        ));
        drop(sql_tx);

        let stored = find_workflow(&pool, loaded.id).await.unwrap();
        assert!(stored.message.is_empty());
    }

    #[tokio::test]
    async fn malformed_params_surface_on_load() {
        let pool = setup_test_db().await;

        let id = sqlx::query("INSERT INTO rebalance_workflows (state, params) VALUES ('init', ?1)")
            .bind(r#"{"version": "v9"}"#)
            .execute(&pool)
            .await
            .unwrap()
            .last_insert_rowid();

        let error = find_workflow(&pool, id).await.unwrap_err();
        assert!(matches!(
            error,
            PersistenceError::MalformedParams { id: found, .. } if found == id
        ));
    }

    #[tokio::test]
    async fn missing_workflow_is_reported() {
        let pool = setup_test_db().await;

        let error = find_workflow(&pool, 42).await.unwrap_err();
        assert!(matches!(error, PersistenceError::WorkflowNotFound(42)));
    }
}
