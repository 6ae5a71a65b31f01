use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::{ExecuteOutcome, StageCheck, StageError, StageHandler};
use crate::alert::{
    AlertPublisher, CLAIM_CHANNEL, ReportedTransaction, Severity, StageAlert, StageReport,
};
use crate::claim::{ClaimParam, aggregate_claims, build_claim_call};
use crate::config::Chains;
use crate::gas::GasNonceAssigner;
use crate::liquidity::LiquidityDataSource;
use crate::tokens::TokenRegistry;
use crate::transaction_task::{
    Progress, TaskOwner, TransactionDraft, TransactionState, TransactionType,
    find_transaction_tasks, save_transaction_tasks,
};
use crate::workflow::{RebalanceState, RebalanceWorkflow, update_workflow};

const TX_CREATED: &str = "claimlp_tx_created";
const SUCCEEDED: &str = "claimlp_suc";
const FAILED: &str = "claimlp_failed";

/// Claims liquidity-provider funds from every strategy back into the
/// treasury vaults.
pub(crate) struct ClaimStage {
    pool: SqlitePool,
    liquidity: Arc<dyn LiquidityDataSource>,
    tokens: Arc<dyn TokenRegistry>,
    chains: Chains,
    gas: Arc<dyn GasNonceAssigner>,
    alerts: AlertPublisher,
}

impl ClaimStage {
    pub(crate) fn new(
        pool: SqlitePool,
        liquidity: Arc<dyn LiquidityDataSource>,
        tokens: Arc<dyn TokenRegistry>,
        chains: Chains,
        gas: Arc<dyn GasNonceAssigner>,
        alerts: AlertPublisher,
    ) -> Self {
        Self {
            pool,
            liquidity,
            tokens,
            chains,
            gas,
            alerts,
        }
    }

    fn draft(&self, workflow_id: i64, param: &ClaimParam) -> Result<TransactionDraft, StageError> {
        let input_data = build_claim_call(param, self.tokens.as_ref()).inspect_err(|error| {
            error!(
                workflow_id,
                ?error,
                param = %as_json(param),
                "Failed to build claim call"
            );
        })?;

        let chain =
            self.chains
                .get(&param.chain_name)
                .ok_or_else(|| StageError::MissingChainConfig {
                    chain: param.chain_name.clone(),
                })?;

        Ok(TransactionDraft {
            owner: TaskOwner::Workflow(workflow_id),
            transaction_type: TransactionType::ClaimFromVault,
            chain_id: param.chain_id,
            chain_name: param.chain_name.clone(),
            from: chain.bridge_address,
            to: param.vault_address,
            input_data,
            params: serde_json::to_value(param)?,
        })
    }
}

fn as_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|error| format!("<unserializable: {error}>"))
}

impl StageHandler for ClaimStage {
    fn name(&self) -> &'static str {
        "claim_lp"
    }

    #[tracing::instrument(
        skip_all,
        fields(workflow_id = workflow.id),
        level = tracing::Level::INFO
    )]
    async fn execute(&self, workflow: &RebalanceWorkflow) -> Result<ExecuteOutcome, StageError> {
        let snapshot = self.liquidity.fetch().await?;

        let providers = &snapshot.liquidity_provider_list;
        if providers.is_empty() {
            info!("No liquidity providers reported, nothing to claim");
            return Ok(ExecuteOutcome::NothingToDo);
        }

        let vaults = &snapshot.vault_info_list;
        if vaults.is_empty() {
            return Err(StageError::EmptyVaultList);
        }

        let params =
            aggregate_claims(providers, vaults, self.tokens.as_ref()).inspect_err(|error| {
                error!(
                    ?error,
                    providers = %as_json(providers),
                    vaults = %as_json(vaults),
                    "Failed to aggregate claims"
                );
            })?;

        let drafts = params
            .iter()
            .map(|param| self.draft(workflow.id, param))
            .collect::<Result<Vec<_>, _>>()?;

        let mut advanced = workflow.clone();
        advanced.state = RebalanceState::ClaimLp;

        if drafts.is_empty() {
            info!("Liquidity providers hold no positions, skipping claim");
            advanced.message = "nothing to claim".to_string();

            let mut sql_tx = self.pool.begin().await?;
            update_workflow(&mut sql_tx, workflow.state, &advanced).await?;
            sql_tx.commit().await?;

            return Ok(ExecuteOutcome::Advanced { transactions: 0 });
        }

        let prepared = self.gas.assign(drafts).await?;

        advanced.message = "claim transactions created".to_string();
        advanced.progress = Progress {
            all: prepared.len(),
            ..Progress::default()
        }
        .to_string();

        let mut sql_tx = self.pool.begin().await?;
        let ids = save_transaction_tasks(&mut sql_tx, &prepared).await?;
        update_workflow(&mut sql_tx, workflow.state, &advanced).await?;
        sql_tx.commit().await?;

        info!(transaction_task_ids = ?ids, "Created claim transactions");

        self.alerts
            .publish(&StageAlert {
                severity: Severity::Notify,
                channel: CLAIM_CHANNEL,
                report: StageReport::new(
                    TX_CREATED,
                    &advanced,
                    prepared.iter().map(ReportedTransaction::from),
                ),
            })
            .await;

        Ok(ExecuteOutcome::Advanced {
            transactions: prepared.len(),
        })
    }

    #[tracing::instrument(
        skip_all,
        fields(workflow_id = workflow.id),
        level = tracing::Level::DEBUG
    )]
    async fn check_finished(
        &self,
        workflow: &RebalanceWorkflow,
    ) -> Result<StageCheck, StageError> {
        let tasks = find_transaction_tasks(
            &self.pool,
            TaskOwner::Workflow(workflow.id),
            TransactionType::ClaimFromVault,
        )
        .await?;
        let progress = Progress::from_tasks(&tasks);

        if tasks.is_empty() {
            info!("No claim transactions, claim stage finished");
            return Ok(StageCheck {
                finished: true,
                next_state: RebalanceState::MarginBalanceTransferOut,
                progress,
                message: Some("nothing claimed".to_string()),
                alert: None,
            });
        }

        if progress.all_succeeded() {
            info!(%progress, "All claim transactions succeeded");

            let report = StageReport::new(
                SUCCEEDED,
                workflow,
                tasks.iter().map(ReportedTransaction::from),
            );

            return Ok(StageCheck {
                finished: true,
                next_state: RebalanceState::MarginBalanceTransferOut,
                progress,
                message: Some("claim succeeded".to_string()),
                alert: Some(StageAlert {
                    severity: Severity::Notify,
                    channel: CLAIM_CHANNEL,
                    report,
                }),
            });
        }

        if progress.has_failures() {
            warn!(%progress, "Claim transactions failed, failing workflow");

            let report = StageReport::new(
                FAILED,
                workflow,
                tasks
                    .iter()
                    .filter(|task| task.state == TransactionState::Failed)
                    .map(ReportedTransaction::from),
            );

            return Ok(StageCheck {
                finished: false,
                next_state: RebalanceState::Failed,
                progress,
                message: Some(format!("claim failed: {progress}")),
                alert: Some(StageAlert {
                    severity: Severity::Alert,
                    channel: CLAIM_CHANNEL,
                    report,
                }),
            });
        }

        info!(%progress, pending = progress.pending(), "Claim transactions pending");

        Ok(StageCheck {
            finished: false,
            next_state: workflow.state,
            progress,
            message: None,
            alert: None,
        })
    }
}
