//! Persistence errors shared by the workflow, transaction task and asset
//! transfer tables.

use crate::asset_transfer::AssetTransferState;
use crate::workflow::RebalanceState;

/// A stored text tag (state, transaction type, ...) that no variant maps to.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown {kind}: {value}")]
pub struct UnknownTagError {
    pub(crate) kind: &'static str,
    pub(crate) value: String,
}

impl UnknownTagError {
    pub(crate) fn new(kind: &'static str, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Failed to serialize params: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Malformed params on {entity} {id}: {source}")]
    MalformedParams {
        entity: &'static str,
        id: i64,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    UnknownTag(#[from] UnknownTagError),
    #[error("Invalid {field} stored in database: {value}")]
    InvalidColumn { field: &'static str, value: String },
    #[error("Rebalance workflow {0} not found")]
    WorkflowNotFound(i64),
    #[error("Rebalance workflow {open_id} is still open")]
    WorkflowAlreadyOpen { open_id: i64 },
    #[error("Rebalance workflow {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: i64,
        from: RebalanceState,
        to: RebalanceState,
    },
    #[error("Rebalance workflow {id} was expected in {expected} but is {stored}")]
    StaleWorkflow {
        id: i64,
        expected: RebalanceState,
        stored: RebalanceState,
    },
    #[error("Asset transfer task {0} not found")]
    AssetTransferNotFound(i64),
    #[error("Asset transfer task {id} cannot move from {from} to {to}")]
    InvalidTransferTransition {
        id: i64,
        from: AssetTransferState,
        to: AssetTransferState,
    },
    #[error("Asset transfer task {id} was expected in {expected} but is {stored}")]
    StaleAssetTransfer {
        id: i64,
        expected: AssetTransferState,
        stored: AssetTransferState,
    },
    #[error("Value {value} for {field} does not fit an SQLite integer")]
    IntegerOverflow { field: &'static str, value: u64 },
}
