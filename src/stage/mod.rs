//! Stage handlers: the unit of work for one workflow stage.
//!
//! A stage is entered with [`StageHandler::execute`], which derives and
//! persists the stage's sub-transactions together with the state change,
//! and then polled with [`StageHandler::check_finished`] until its
//! sub-transactions settle. `check_finished` never writes; the orchestrator
//! persists its verdict and only then publishes the attached alert.

use thiserror::Error;

use crate::alert::StageAlert;
use crate::claim::{AggregationError, ClaimCallError};
use crate::error::PersistenceError;
use crate::gas::GasAssignmentError;
use crate::liquidity::LiquidityDataError;
use crate::transaction_task::Progress;
use crate::workflow::{RebalanceState, RebalanceWorkflow};

mod claim;

pub(crate) use claim::ClaimStage;

#[derive(Debug, Error)]
pub enum StageError {
    #[error("Failed to fetch liquidity data")]
    Liquidity(#[from] LiquidityDataError),
    #[error("Liquidity data lists providers but no vaults")]
    EmptyVaultList,
    #[error(transparent)]
    Aggregation(#[from] AggregationError),
    #[error(transparent)]
    ClaimCall(#[from] ClaimCallError),
    #[error("No chain configured named {chain}")]
    MissingChainConfig { chain: String },
    #[error(transparent)]
    GasAssignment(#[from] GasAssignmentError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("Failed to serialize claim params")]
    Serialization(#[from] serde_json::Error),
}

/// Result of entering a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecuteOutcome {
    /// Nothing to act on this cycle; the workflow was left untouched.
    NothingToDo,
    /// The workflow moved into the stage with this many sub-transactions.
    Advanced { transactions: usize },
}

/// Verdict of polling a stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageCheck {
    pub finished: bool,
    /// State to persist; equal to the current state while pending.
    pub next_state: RebalanceState,
    pub progress: Progress,
    pub message: Option<String>,
    pub alert: Option<StageAlert>,
}

pub(crate) trait StageHandler {
    fn name(&self) -> &'static str;

    async fn execute(&self, workflow: &RebalanceWorkflow) -> Result<ExecuteOutcome, StageError>;

    async fn check_finished(&self, workflow: &RebalanceWorkflow)
    -> Result<StageCheck, StageError>;
}

/// Closed set of stages implemented by this service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    ClaimLp,
}

/// What the orchestrator does with a workflow in a given state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Execute(Stage),
    CheckFinished(Stage),
    /// Owned by a downstream stage runner, or terminal.
    Unhandled,
}

impl Stage {
    pub const fn for_state(state: RebalanceState) -> Dispatch {
        match state {
            RebalanceState::Init => Dispatch::Execute(Self::ClaimLp),
            RebalanceState::ClaimLp => Dispatch::CheckFinished(Self::ClaimLp),
            RebalanceState::MarginBalanceTransferOut
            | RebalanceState::Success
            | RebalanceState::Failed => Dispatch::Unhandled,
        }
    }
}
