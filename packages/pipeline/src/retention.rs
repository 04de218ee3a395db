//! Periodic ledger purge.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ingest_core::{LedgerError, ProcessedLedger};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Remove ledger entries older than `retention`.
pub async fn purge_expired(
    ledger: &dyn ProcessedLedger,
    retention: Duration,
) -> Result<usize, LedgerError> {
    let age = chrono::Duration::from_std(retention)
        .map_err(|e| LedgerError(format!("retention {:?} out of range: {}", retention, e)))?;
    ledger.purge_before(Utc::now() - age).await
}

/// How often to purge for a given retention: a quarter of it, between 1s and 1h.
pub fn purge_interval(retention: Duration) -> Duration {
    (retention / 4).clamp(Duration::from_secs(1), Duration::from_secs(60 * 60))
}

/// Purge once now and then every [`purge_interval`] until `shutdown` fires.
pub fn spawn_ledger_purge(
    ledger: Arc<dyn ProcessedLedger>,
    retention: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticks = tokio::time::interval(purge_interval(retention));
        ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticks.tick() => {}
            }
            match purge_expired(ledger.as_ref(), retention).await {
                Ok(0) => {}
                Ok(removed) => tracing::info!(removed, ?retention, "Purged expired ledger entries"),
                Err(e) => tracing::warn!(error = %e, "Ledger purge failed, retrying next interval"),
            }
        }
    })
}
