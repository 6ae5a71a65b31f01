use clap::{Parser, Subcommand};
use sqlx::SqlitePool;
use std::io::Write;
use std::path::PathBuf;
use tracing::{error, info};

use crate::asset_transfer::{TransferTickOutcome, find_open_asset_transfer_tasks};
use crate::config::Ctx;
use crate::error::PersistenceError;
use crate::orchestrator::TickOutcome;
use crate::transaction_task::{Progress, TaskOwner, TransactionType, find_transaction_tasks};
use crate::workflow::{WorkflowParams, find_open_workflows, open_workflow};
use crate::{ExecuteOutcome, build_asset_transfer_service, build_orchestrator};

#[derive(Debug, Parser)]
#[command(name = "treasury")]
#[command(about = "Drives treasury rebalance workflows one stage at a time")]
#[command(version)]
pub struct Cli {
    /// Path to the TOML config file
    #[arg(long, env = "TREASURY_CONFIG", default_value = "treasury.toml")]
    pub config: PathBuf,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Advance the open rebalance workflow and asset transfer task by one step
    Tick,
    /// Open a new rebalance workflow in the init state
    Open {
        /// Who or what requested the rebalance
        #[arg(long = "initiated-by", default_value = "cli")]
        initiated_by: String,
        #[arg(long)]
        note: Option<String>,
    },
    /// Show open workflows with their claim progress
    Status,
}

pub async fn run(ctx: Ctx, command: Commands) -> anyhow::Result<()> {
    let pool = ctx.get_sqlite_pool().await?;
    sqlx::migrate!().run(&pool).await?;
    run_command_with_writers(&ctx, command, &pool, &mut std::io::stdout()).await
}

async fn run_command_with_writers<W: Write>(
    ctx: &Ctx,
    command: Commands,
    pool: &SqlitePool,
    stdout: &mut W,
) -> anyhow::Result<()> {
    match command {
        Commands::Tick => tick(ctx, pool, stdout).await,
        Commands::Open { initiated_by, note } => {
            let params = WorkflowParams::V1 { initiated_by, note };

            match open_workflow(pool, &params).await {
                Ok(workflow) => {
                    writeln!(stdout, "✅ Opened rebalance workflow {}", workflow.id)?;
                    Ok(())
                }
                Err(PersistenceError::WorkflowAlreadyOpen { open_id }) => {
                    writeln!(
                        stdout,
                        "❌ Workflow {open_id} is still open, refusing to open another"
                    )?;
                    Err(PersistenceError::WorkflowAlreadyOpen { open_id }.into())
                }
                Err(error) => Err(error.into()),
            }
        }
        Commands::Status => status(pool, stdout).await,
    }
}

async fn tick<W: Write>(ctx: &Ctx, pool: &SqlitePool, stdout: &mut W) -> anyhow::Result<()> {
    let orchestrator = build_orchestrator(ctx, pool.clone())?;
    let transfers = build_asset_transfer_service(ctx, pool.clone());

    let workflow_result = orchestrator.tick().await;
    match &workflow_result {
        Ok(outcome) => writeln!(stdout, "🔄 Workflow: {}", describe_tick(outcome))?,
        Err(error) => {
            error!(?error, "Orchestrator tick failed");
            writeln!(stdout, "❌ Workflow tick failed: {error}")?;
        }
    }

    // Transfers are independent of the workflow stages and still run when
    // the orchestrator failed.
    let transfer_result = transfers.tick().await;
    match &transfer_result {
        Ok(outcome) => writeln!(stdout, "🔄 Asset transfer: {}", describe_transfer(outcome))?,
        Err(error) => {
            error!(?error, "Asset transfer tick failed");
            writeln!(stdout, "❌ Asset transfer tick failed: {error}")?;
        }
    }

    info!("Tick complete");
    workflow_result?;
    transfer_result?;
    Ok(())
}

fn describe_tick(outcome: &TickOutcome) -> String {
    match outcome {
        TickOutcome::LeaseHeld => "another tick is in progress".to_string(),
        TickOutcome::Idle => "no open workflow".to_string(),
        TickOutcome::Executed {
            workflow_id,
            outcome: ExecuteOutcome::NothingToDo,
        } => format!("workflow {workflow_id} has nothing to claim yet"),
        TickOutcome::Executed {
            workflow_id,
            outcome: ExecuteOutcome::Advanced { transactions },
        } => format!("workflow {workflow_id} created {transactions} claim transactions"),
        TickOutcome::Polled {
            workflow_id,
            from,
            to,
            progress,
        } if from == to => format!("workflow {workflow_id} still {from} ({progress})"),
        TickOutcome::Polled {
            workflow_id,
            from,
            to,
            progress,
        } => format!("workflow {workflow_id} moved {from} -> {to} ({progress})"),
        TickOutcome::Unhandled { workflow_id, state } => {
            format!("workflow {workflow_id} waits in {state} for another runner")
        }
    }
}

fn describe_transfer(outcome: &TransferTickOutcome) -> String {
    match outcome {
        TransferTickOutcome::LeaseHeld => "another tick is in progress".to_string(),
        TransferTickOutcome::Idle => "no open task".to_string(),
        TransferTickOutcome::Submitted {
            task_id,
            transactions,
        } => format!("task {task_id} submitted {transactions} transfers"),
        TransferTickOutcome::Polled {
            task_id,
            state,
            progress,
        } => format!("task {task_id} {state} ({progress})"),
    }
}

async fn status<W: Write>(pool: &SqlitePool, stdout: &mut W) -> anyhow::Result<()> {
    let workflows = find_open_workflows(pool).await?;

    if workflows.is_empty() {
        writeln!(stdout, "No open rebalance workflow")?;
    }

    for workflow in &workflows {
        let claims = find_transaction_tasks(
            pool,
            TaskOwner::Workflow(workflow.id),
            TransactionType::ClaimFromVault,
        )
        .await?;

        writeln!(stdout, "Workflow {}", workflow.id)?;
        writeln!(stdout, "   State: {}", workflow.state)?;
        writeln!(stdout, "   Params: {}", workflow.params_json())?;
        writeln!(stdout, "   Claims: {}", Progress::from_tasks(&claims))?;
        if !workflow.message.is_empty() {
            writeln!(stdout, "   Message: {}", workflow.message)?;
        }
    }

    for task in find_open_asset_transfer_tasks(pool).await? {
        writeln!(
            stdout,
            "Asset transfer {} ({}) for rebalance {}: {} {}",
            task.id,
            task.transfer_type.as_str(),
            task.rebalance_id,
            task.state,
            task.progress
        )?;
    }

    Ok(())
}
