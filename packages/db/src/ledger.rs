use chrono::{DateTime, Utc};
use ingest_core::ledger::LedgerFuture;
use ingest_core::{Disposition, LedgerEntry, LedgerError, MessageId, ProcessedLedger};

use crate::DbError;
use crate::repositories::LedgerRepository;

/// [`ProcessedLedger`] backed by the `ingest_ledger` table.
///
/// Requires [`crate::init`] to have run.
#[derive(Debug, Clone, Copy, Default)]
pub struct SurrealLedger;

/// What the ledger currently holds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerSummary {
    pub applied: u64,
    pub dead_lettered: u64,
    /// Oldest dead-lettered entries first.
    pub dead_letters: Vec<LedgerEntry>,
}

impl SurrealLedger {
    pub fn new() -> Self {
        Self
    }

    /// Counts per disposition and up to `dead_letter_limit` dead-lettered entries.
    pub async fn summary(&self, dead_letter_limit: usize) -> Result<LedgerSummary, DbError> {
        Ok(LedgerSummary {
            applied: LedgerRepository::count_by_disposition(Disposition::Applied).await?,
            dead_lettered: LedgerRepository::count_by_disposition(Disposition::DeadLettered).await?,
            dead_letters: LedgerRepository::list_by_disposition(
                Disposition::DeadLettered,
                dead_letter_limit,
            )
            .await?,
        })
    }
}

impl From<DbError> for LedgerError {
    fn from(e: DbError) -> Self {
        LedgerError(e.to_string())
    }
}

impl ProcessedLedger for SurrealLedger {
    fn lookup<'a>(&'a self, message_id: &'a MessageId) -> LedgerFuture<'a, Option<LedgerEntry>> {
        Box::pin(async move { Ok(LedgerRepository::get(message_id).await?) })
    }

    fn record(&self, entry: LedgerEntry) -> LedgerFuture<'_, ()> {
        Box::pin(async move {
            LedgerRepository::record(&entry).await?;
            Ok(())
        })
    }

    fn purge_before(&self, cutoff: DateTime<Utc>) -> LedgerFuture<'_, usize> {
        Box::pin(async move { Ok(LedgerRepository::purge_before(cutoff).await?) })
    }
}
