#![allow(clippy::disallowed_methods)]

mod common;

use std::error::Error;

use chrono::{Duration, Utc};
use ingest_core::{BlobReference, Disposition, LedgerEntry, MessageId, ProcessedLedger};

use db::SurrealLedger;
use db::repositories::LedgerRepository;

#[test]
fn test_ledger_repository() -> Result<(), Box<dyn Error>> {
    common::block_on(async {
        let _guard = common::setup_db().await?;

        let id = MessageId::new("3f2a9c1e-0b7d-4c55-9e1a-7d0c2b6f8a41");
        let blob = BlobReference::new("results", "runs/2024/07/run-17.csv");

        assert!(LedgerRepository::get(&id).await?.is_none());

        let stored = LedgerRepository::record(&LedgerEntry::applied(id.clone(), blob.clone())).await?;
        assert_eq!(stored.disposition, Disposition::Applied);
        assert_eq!(stored.blob.as_ref(), Some(&blob));

        let loaded = LedgerRepository::get(&id).await?.ok_or("entry missing")?;
        assert_eq!(loaded.message_id, id);
        assert_eq!(loaded.blob, Some(blob.clone()));

        // Recording again replaces rather than failing.
        LedgerRepository::record(&LedgerEntry::dead_lettered(id.clone(), None)).await?;
        let replaced = LedgerRepository::get(&id).await?.ok_or("entry missing")?;
        assert_eq!(replaced.disposition, Disposition::DeadLettered);
        assert!(replaced.blob.is_none());

        assert_eq!(LedgerRepository::count_by_disposition(Disposition::Applied).await?, 0);
        assert_eq!(LedgerRepository::count_by_disposition(Disposition::DeadLettered).await?, 1);

        Ok(())
    })
}

#[test]
fn test_list_and_purge() -> Result<(), Box<dyn Error>> {
    common::block_on(async {
        let _guard = common::setup_db().await?;

        let now = Utc::now();
        for (n, age_hours) in [(1, 72), (2, 48), (3, 1)] {
            let mut entry = LedgerEntry::applied(
                MessageId::new(format!("msg-{n}")),
                BlobReference::new("results", format!("run-{n}.csv")),
            );
            entry.recorded_at = now - Duration::hours(age_hours);
            LedgerRepository::record(&entry).await?;
        }
        LedgerRepository::record(&LedgerEntry::dead_lettered(MessageId::new("msg-poison"), None)).await?;

        let applied = LedgerRepository::list_by_disposition(Disposition::Applied, 10).await?;
        let ids: Vec<_> = applied.iter().map(|e| e.message_id.as_str()).collect();
        assert_eq!(ids, vec!["msg-1", "msg-2", "msg-3"]);

        let limited = LedgerRepository::list_by_disposition(Disposition::Applied, 2).await?;
        assert_eq!(limited.len(), 2);

        let removed = LedgerRepository::purge_before(now - Duration::hours(24)).await?;
        assert_eq!(removed, 2);
        assert_eq!(LedgerRepository::count_by_disposition(Disposition::Applied).await?, 1);
        assert_eq!(LedgerRepository::count_by_disposition(Disposition::DeadLettered).await?, 1);

        Ok(())
    })
}

#[test]
fn test_surreal_ledger_trait() -> Result<(), Box<dyn Error>> {
    common::block_on(async {
        let _guard = common::setup_db().await?;

        let ledger = SurrealLedger::new();
        let id = MessageId::new("msg-trait");

        assert!(ledger.lookup(&id).await?.is_none());
        ledger
            .record(LedgerEntry::applied(id.clone(), BlobReference::new("b", "k")))
            .await?;

        let entry = ledger.lookup(&id).await?.ok_or("entry missing")?;
        assert_eq!(entry.disposition, Disposition::Applied);

        Ok(())
    })
}

#[test]
fn test_surreal_ledger_purge_and_summary() -> Result<(), Box<dyn Error>> {
    common::block_on(async {
        let _guard = common::setup_db().await?;

        let ledger = SurrealLedger::new();
        let now = Utc::now();
        for (id, age_hours) in [("stale-poison", 30), ("poison", 2)] {
            let mut entry = LedgerEntry::dead_lettered(MessageId::new(id), None);
            entry.recorded_at = now - Duration::hours(age_hours);
            ledger.record(entry).await?;
        }
        let mut stale = LedgerEntry::applied(MessageId::new("stale"), BlobReference::new("b", "old.csv"));
        stale.recorded_at = now - Duration::hours(40);
        ledger.record(stale).await?;
        ledger
            .record(LedgerEntry::applied(MessageId::new("fresh"), BlobReference::new("b", "new.csv")))
            .await?;

        let summary = ledger.summary(10).await?;
        assert_eq!((summary.applied, summary.dead_lettered), (2, 2));
        let oldest: Vec<_> = summary.dead_letters.iter().map(|e| e.message_id.as_str()).collect();
        assert_eq!(oldest, vec!["stale-poison", "poison"]);

        assert_eq!(ledger.purge_before(now - Duration::hours(24)).await?, 2);
        let summary = ledger.summary(1).await?;
        assert_eq!((summary.applied, summary.dead_lettered), (1, 1));
        assert_eq!(summary.dead_letters.len(), 1);
        assert!(ledger.lookup(&MessageId::new("stale")).await?.is_none());

        Ok(())
    })
}
