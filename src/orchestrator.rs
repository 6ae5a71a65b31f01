//! One pass over the open rebalance workflow.
//!
//! Each [`Orchestrator::tick`] is a short-lived unit of work triggered by an
//! external scheduler. It holds the orchestrator lease for its duration,
//! loads the open workflow, dispatches on its state and persists the
//! outcome. No state survives between ticks; everything is re-derived from
//! the database.

use sqlx::SqlitePool;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::alert::AlertPublisher;
use crate::error::PersistenceError;
use crate::lock::{Lease, ORCHESTRATOR_LEASE, release_lease, try_acquire_lease};
use crate::stage::{ClaimStage, Dispatch, ExecuteOutcome, Stage, StageError, StageHandler};
use crate::transaction_task::Progress;
use crate::workflow::{RebalanceState, RebalanceWorkflow, find_open_workflows, update_workflow};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("Stage {stage} failed for workflow {workflow_id}")]
    Stage {
        workflow_id: i64,
        stage: &'static str,
        #[source]
        source: StageError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Another invocation holds the lease.
    LeaseHeld,
    /// No open workflow.
    Idle,
    Executed {
        workflow_id: i64,
        outcome: ExecuteOutcome,
    },
    Polled {
        workflow_id: i64,
        from: RebalanceState,
        to: RebalanceState,
        progress: Progress,
    },
    /// The workflow's state has no handler in this service.
    Unhandled {
        workflow_id: i64,
        state: RebalanceState,
    },
}

pub struct Orchestrator {
    pool: SqlitePool,
    claim: ClaimStage,
    alerts: AlertPublisher,
}

impl Orchestrator {
    pub(crate) fn new(pool: SqlitePool, claim: ClaimStage, alerts: AlertPublisher) -> Self {
        Self {
            pool,
            claim,
            alerts,
        }
    }

    pub async fn tick(&self) -> Result<TickOutcome, OrchestratorError> {
        let mut sql_tx = self.pool.begin().await?;
        let lease = try_acquire_lease(&mut sql_tx, ORCHESTRATOR_LEASE).await?;
        sql_tx.commit().await?;

        let Some(lease) = lease else {
            return Ok(TickOutcome::LeaseHeld);
        };

        let result = self.run().await;

        let released = self.release(&lease).await;
        if let (Err(release_error), Err(_)) = (&released, &result) {
            error!(?release_error, "Failed to release orchestrator lease");
        }

        let outcome = result?;
        released?;
        Ok(outcome)
    }

    async fn release(&self, lease: &Lease) -> Result<(), OrchestratorError> {
        let mut sql_tx = self.pool.begin().await?;
        release_lease(&mut sql_tx, lease).await?;
        sql_tx.commit().await?;
        Ok(())
    }

    async fn run(&self) -> Result<TickOutcome, OrchestratorError> {
        let open = find_open_workflows(&self.pool).await?;

        let Some(workflow) = open.first() else {
            info!("No open rebalance workflow");
            return Ok(TickOutcome::Idle);
        };

        if open.len() > 1 {
            error!(
                open_workflow_ids = ?open.iter().map(|workflow| workflow.id).collect::<Vec<_>>(),
                "More than one rebalance workflow open, continuing with the oldest"
            );
        }

        match Stage::for_state(workflow.state) {
            Dispatch::Execute(stage) => self.execute(self.handler(stage), workflow).await,
            Dispatch::CheckFinished(stage) => {
                self.check_finished(self.handler(stage), workflow).await
            }
            Dispatch::Unhandled => {
                warn!(
                    workflow_id = workflow.id,
                    state = %workflow.state,
                    "No stage handler for workflow state"
                );
                Ok(TickOutcome::Unhandled {
                    workflow_id: workflow.id,
                    state: workflow.state,
                })
            }
        }
    }

    fn handler(&self, stage: Stage) -> &ClaimStage {
        match stage {
            Stage::ClaimLp => &self.claim,
        }
    }

    async fn execute<H: StageHandler>(
        &self,
        handler: &H,
        workflow: &RebalanceWorkflow,
    ) -> Result<TickOutcome, OrchestratorError> {
        info!(workflow_id = workflow.id, stage = handler.name(), "Entering stage");

        let outcome = handler
            .execute(workflow)
            .await
            .map_err(|source| OrchestratorError::Stage {
                workflow_id: workflow.id,
                stage: handler.name(),
                source,
            })?;

        Ok(TickOutcome::Executed {
            workflow_id: workflow.id,
            outcome,
        })
    }

    async fn check_finished<H: StageHandler>(
        &self,
        handler: &H,
        workflow: &RebalanceWorkflow,
    ) -> Result<TickOutcome, OrchestratorError> {
        let check = handler
            .check_finished(workflow)
            .await
            .map_err(|source| OrchestratorError::Stage {
                workflow_id: workflow.id,
                stage: handler.name(),
                source,
            })?;

        let mut updated = workflow.clone();
        updated.state = check.next_state;
        updated.progress = check.progress.to_string();
        if let Some(message) = check.message {
            updated.message = message;
        }

        let mut sql_tx = self.pool.begin().await?;
        update_workflow(&mut sql_tx, workflow.state, &updated).await?;
        sql_tx.commit().await?;

        if updated.state != workflow.state {
            info!(
                workflow_id = workflow.id,
                stage = handler.name(),
                from = %workflow.state,
                to = %updated.state,
                progress = %check.progress,
                stage_finished = check.finished,
                "Workflow transitioned"
            );
        }

        if let Some(alert) = &check.alert {
            self.alerts.publish(alert).await;
        }

        Ok(TickOutcome::Polled {
            workflow_id: workflow.id,
            from: workflow.state,
            to: updated.state,
            progress: check.progress,
        })
    }
}
