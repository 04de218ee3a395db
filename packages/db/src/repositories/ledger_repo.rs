//! Ledger repository for processed-message bookkeeping.

use chrono::{DateTime, SecondsFormat, Utc};
use ingest_core::{BlobReference, Disposition, LedgerEntry, MessageId};
use serde::{Deserialize, Serialize};
use surrealdb::sql::Thing;

use crate::{DbError, get_db};

const TABLE: &str = "ingest_ledger";

/// Repository for ledger persistence operations.
pub struct LedgerRepository;

/// Internal record type for SurrealDB.
#[derive(Debug, Serialize, Deserialize)]
struct LedgerRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<Thing>,
    message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bucket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    key: Option<String>,
    disposition: Disposition,
    recorded_at: String,
}

#[derive(Debug, Deserialize)]
struct CountRow {
    total: u64,
}

impl From<&LedgerEntry> for LedgerRecord {
    fn from(entry: &LedgerEntry) -> Self {
        Self {
            id: None,
            message_id: entry.message_id.as_str().to_string(),
            bucket: entry.blob.as_ref().map(|b| b.bucket.clone()),
            key: entry.blob.as_ref().map(|b| b.key.clone()),
            disposition: entry.disposition,
            recorded_at: timestamp(entry.recorded_at),
        }
    }
}

impl TryFrom<LedgerRecord> for LedgerEntry {
    type Error = DbError;

    fn try_from(record: LedgerRecord) -> Result<Self, Self::Error> {
        let recorded_at = DateTime::parse_from_rfc3339(&record.recorded_at)
            .map_err(|e| DbError::Serialization(format!("recorded_at: {}", e)))?
            .with_timezone(&Utc);

        Ok(LedgerEntry {
            message_id: MessageId::new(record.message_id),
            blob: record
                .bucket
                .zip(record.key)
                .map(|(bucket, key)| BlobReference::new(bucket, key)),
            disposition: record.disposition,
            recorded_at,
        })
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl LedgerRepository {
    /// Insert or replace the entry for its message id.
    pub async fn record(entry: &LedgerEntry) -> Result<LedgerEntry, DbError> {
        let db = get_db()?;

        let record: Option<LedgerRecord> = db
            .upsert((TABLE, entry.message_id.as_str()))
            .content(LedgerRecord::from(entry))
            .await?;

        record
            .ok_or_else(|| DbError::Query(format!("Failed to record {}", entry.message_id)))?
            .try_into()
    }

    /// Get the entry for a message, if one was recorded.
    pub async fn get(message_id: &MessageId) -> Result<Option<LedgerEntry>, DbError> {
        let db = get_db()?;

        let record: Option<LedgerRecord> = db.select((TABLE, message_id.as_str())).await?;
        record.map(LedgerEntry::try_from).transpose()
    }

    /// Entries with the given disposition, oldest first.
    pub async fn list_by_disposition(
        disposition: Disposition,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>, DbError> {
        let db = get_db()?;

        let mut response = db
            .query(
                "SELECT * FROM ingest_ledger WHERE disposition = $disposition \
                 ORDER BY recorded_at ASC LIMIT $limit",
            )
            .bind(("disposition", disposition.as_str()))
            .bind(("limit", limit as i64))
            .await?;
        let records: Vec<LedgerRecord> = response.take(0)?;

        records.into_iter().map(LedgerEntry::try_from).collect()
    }

    pub async fn count_by_disposition(disposition: Disposition) -> Result<u64, DbError> {
        let db = get_db()?;

        let mut response = db
            .query(
                "SELECT count() AS total FROM ingest_ledger \
                 WHERE disposition = $disposition GROUP ALL",
            )
            .bind(("disposition", disposition.as_str()))
            .await?;
        let row: Option<CountRow> = response.take(0)?;

        Ok(row.map(|r| r.total).unwrap_or(0))
    }

    /// Delete entries recorded before `cutoff`. Returns how many were removed.
    ///
    /// Entries only need to outlive the queue's retention period; anything
    /// older can no longer be redelivered.
    pub async fn purge_before(cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let db = get_db()?;

        let mut response = db
            .query("DELETE ingest_ledger WHERE recorded_at < $cutoff RETURN BEFORE")
            .bind(("cutoff", timestamp(cutoff)))
            .await?;
        let removed: Vec<LedgerRecord> = response.take(0)?;

        if !removed.is_empty() {
            tracing::info!(removed = removed.len(), cutoff = %cutoff, "Purged ledger entries");
        }
        Ok(removed.len())
    }
}
