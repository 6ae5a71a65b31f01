//! Named leases serializing cron-triggered ticks.
//!
//! A lease is a row in `orchestrator_leases` stamped with a random holder
//! token. Acquiring inserts it, releasing deletes it only while the token
//! still matches, and a row older than [`LEASE_TIMEOUT_MINUTES`] belongs to
//! a tick that died without releasing and is reclaimed.

use tracing::{info, warn};
use uuid::Uuid;

use crate::error::PersistenceError;

pub(crate) const ORCHESTRATOR_LEASE: &str = "rebalance_orchestrator";
pub(crate) const ASSET_TRANSFER_LEASE: &str = "asset_transfer";

const LEASE_TIMEOUT_MINUTES: i32 = 5;

/// A held lease. Only the tick that acquired it can release it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Lease {
    name: &'static str,
    holder: String,
}

/// Returns `None` when another tick holds `name`.
pub(crate) async fn try_acquire_lease(
    sql_tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    name: &'static str,
) -> Result<Option<Lease>, PersistenceError> {
    let reclaimed = sqlx::query(
        "DELETE FROM orchestrator_leases WHERE name = ?1 AND locked_at < datetime('now', ?2)",
    )
    .bind(name)
    .bind(format!("-{LEASE_TIMEOUT_MINUTES} minutes"))
    .execute(sql_tx.as_mut())
    .await?
    .rows_affected();

    if reclaimed > 0 {
        warn!(lease = name, "Reclaimed lease abandoned by an earlier tick");
    }

    let holder = Uuid::new_v4().to_string();
    let inserted =
        sqlx::query("INSERT OR IGNORE INTO orchestrator_leases (name, holder) VALUES (?1, ?2)")
            .bind(name)
            .bind(&holder)
            .execute(sql_tx.as_mut())
            .await?
            .rows_affected();

    if inserted == 0 {
        info!(lease = name, "Lease held by another tick");
        return Ok(None);
    }

    info!(lease = name, %holder, "Acquired lease");
    Ok(Some(Lease { name, holder }))
}

/// Deletes the lease row if `lease` still owns it. A lease reclaimed by a
/// later tick is left to its new holder.
pub(crate) async fn release_lease(
    sql_tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    lease: &Lease,
) -> Result<(), PersistenceError> {
    let released = sqlx::query("DELETE FROM orchestrator_leases WHERE name = ?1 AND holder = ?2")
        .bind(lease.name)
        .bind(&lease.holder)
        .execute(sql_tx.as_mut())
        .await?
        .rows_affected();

    if released > 0 {
        info!(lease = lease.name, "Released lease");
    } else {
        warn!(
            lease = lease.name,
            holder = %lease.holder,
            "Lease was reclaimed by another tick before release"
        );
    }

    Ok(())
}
