//! Record of messages whose content has been applied or dead-lettered.
//!
//! Delivery is at-least-once, so the same message can come back after its
//! content was applied (a lease lapsed before the delete landed). The ledger
//! lets a consumer recognise such redeliveries and acknowledge them without
//! running the processor again.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{BlobReference, MessageId};

/// Future type returned by ledger operations.
pub type LedgerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, LedgerError>> + Send + 'a>>;

#[derive(Debug, thiserror::Error)]
#[error("ledger error: {0}")]
pub struct LedgerError(pub String);

/// Final handling of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Content was applied by the processor.
    Applied,
    /// Message was handed to the dead-letter target.
    DeadLettered,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Applied => "applied",
            Disposition::DeadLettered => "dead_lettered",
        }
    }
}

/// One ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub message_id: MessageId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blob: Option<BlobReference>,
    pub disposition: Disposition,
    pub recorded_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn applied(message_id: MessageId, blob: BlobReference) -> Self {
        Self {
            message_id,
            blob: Some(blob),
            disposition: Disposition::Applied,
            recorded_at: Utc::now(),
        }
    }

    pub fn dead_lettered(message_id: MessageId, blob: Option<BlobReference>) -> Self {
        Self {
            message_id,
            blob,
            disposition: Disposition::DeadLettered,
            recorded_at: Utc::now(),
        }
    }
}

/// Storage for [`LedgerEntry`] rows keyed by message id.
pub trait ProcessedLedger: Send + Sync + 'static {
    /// The recorded disposition of a message, if any.
    fn lookup<'a>(&'a self, message_id: &'a MessageId) -> LedgerFuture<'a, Option<LedgerEntry>>;

    /// Insert or replace the entry for `entry.message_id`.
    fn record(&self, entry: LedgerEntry) -> LedgerFuture<'_, ()>;

    /// Remove entries recorded before `cutoff`, returning how many went.
    fn purge_before(&self, cutoff: DateTime<Utc>) -> LedgerFuture<'_, usize>;
}

/// Process-local ledger.
///
/// Entries stay until purged; the pipeline purges on its retention schedule.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    entries: Mutex<HashMap<MessageId, LedgerEntry>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ProcessedLedger for MemoryLedger {
    fn lookup<'a>(&'a self, message_id: &'a MessageId) -> LedgerFuture<'a, Option<LedgerEntry>> {
        let entry = self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(message_id)
            .cloned();
        Box::pin(async move { Ok(entry) })
    }

    fn record(&self, entry: LedgerEntry) -> LedgerFuture<'_, ()> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(entry.message_id.clone(), entry);
        Box::pin(async { Ok(()) })
    }

    fn purge_before(&self, cutoff: DateTime<Utc>) -> LedgerFuture<'_, usize> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|_, entry| entry.recorded_at >= cutoff);
        let removed = before - entries.len();
        Box::pin(async move { Ok(removed) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_replace_earlier_entries() -> Result<(), LedgerError> {
        let ledger = MemoryLedger::new();
        let id = MessageId::new("m-1");
        let blob = BlobReference::new("b", "k");

        assert!(ledger.lookup(&id).await?.is_none());
        ledger.record(LedgerEntry::applied(id.clone(), blob.clone())).await?;
        ledger.record(LedgerEntry::dead_lettered(id.clone(), Some(blob))).await?;

        let entry = ledger.lookup(&id).await?;
        assert_eq!(entry.map(|e| e.disposition), Some(Disposition::DeadLettered));
        assert_eq!(ledger.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn purge_removes_only_entries_older_than_the_cutoff() -> Result<(), LedgerError> {
        let ledger = MemoryLedger::new();
        let now = Utc::now();
        for (id, age_hours) in [("old-1", 48), ("old-2", 25), ("fresh", 1)] {
            let mut entry = LedgerEntry::applied(MessageId::new(id), BlobReference::new("b", id));
            entry.recorded_at = now - chrono::Duration::hours(age_hours);
            ledger.record(entry).await?;
        }

        let removed = ledger.purge_before(now - chrono::Duration::hours(24)).await?;
        assert_eq!(removed, 2);
        assert_eq!(ledger.len(), 1);
        assert!(ledger.lookup(&MessageId::new("fresh")).await?.is_some());
        Ok(())
    }
}
