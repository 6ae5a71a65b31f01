use sqlx::SqlitePool;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

pub mod alert;
pub mod asset_transfer;
pub mod claim;
pub mod cli;
pub mod config;
mod error;
pub mod gas;
pub mod liquidity;
mod lock;
pub mod orchestrator;
mod stage;
pub mod tokens;
pub mod transaction_task;
pub mod workflow;

pub use error::PersistenceError;
pub use stage::{ExecuteOutcome, StageError};

#[cfg(test)]
pub(crate) mod test_utils;

use crate::alert::{AlertPublisher, LogNotifier, Notifier, NotifierError, WebhookNotifier};
use crate::asset_transfer::AssetTransferService;
use crate::config::Ctx;
use crate::gas::{GasNonceAssigner, SequentialNonceAssigner};
use crate::liquidity::{HttpLiquiditySource, LiquidityDataError};
use crate::orchestrator::Orchestrator;
use crate::stage::ClaimStage;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Failed to build liquidity client")]
    Liquidity(#[from] LiquidityDataError),
    #[error("Failed to build alert webhook client")]
    Notifier(#[from] NotifierError),
}

/// Wires the orchestrator with the HTTP liquidity source, the configured
/// token registry and the sequential nonce assigner.
pub fn build_orchestrator(ctx: &Ctx, pool: SqlitePool) -> Result<Orchestrator, BuildError> {
    let alerts = alert_publisher(ctx)?;

    let claim = ClaimStage::new(
        pool.clone(),
        Arc::new(HttpLiquiditySource::new(ctx.liquidity_url.clone())?),
        Arc::new(ctx.tokens.clone()),
        ctx.chains.clone(),
        nonce_assigner(ctx, &pool),
        alerts.clone(),
    );

    Ok(Orchestrator::new(pool, claim, alerts))
}

pub fn build_asset_transfer_service(ctx: &Ctx, pool: SqlitePool) -> AssetTransferService {
    let gas = nonce_assigner(ctx, &pool);
    AssetTransferService::new(pool, gas)
}

fn nonce_assigner(ctx: &Ctx, pool: &SqlitePool) -> Arc<dyn GasNonceAssigner> {
    Arc::new(SequentialNonceAssigner::new(pool.clone(), ctx.chains.clone()))
}

fn alert_publisher(ctx: &Ctx) -> Result<AlertPublisher, BuildError> {
    let (notifier, recipients): (Arc<dyn Notifier>, _) = match &ctx.alerts {
        Some(alerts) => (
            Arc::new(WebhookNotifier::new(alerts.webhook_url.clone())?),
            alerts.recipients.clone(),
        ),
        None => {
            info!("No alert webhook configured, stage reports go to the log only");
            (Arc::new(LogNotifier), Vec::new())
        }
    };

    Ok(AlertPublisher::new(notifier, recipients))
}
