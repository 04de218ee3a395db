//! Result ingestion daemon.
//!
//! Reads its configuration from the environment, starts the pipeline and runs
//! until SIGINT or SIGTERM, then shuts down gracefully.

mod logging;
mod processor;

use std::error::Error;
use std::sync::Arc;

use db::{DbConfig, SurrealLedger};
use ingest_core::config::Env;
use ingest_core::{MemoryLedger, PipelineConfig, ProcessedLedger};
use message_queue::QueueConfig;
use pipeline::Pipeline;
use storage::{BlobFetcher, Storage};

const DEAD_LETTER_REPORT_LIMIT: usize = 20;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let env = Env::process();
    logging::init(logging::LogFormat::from_env(&env));

    let handle = start(&env).await?;
    tracing::info!("Result ingestion running");

    wait_for_signal().await?;
    tracing::info!("Shutdown requested");

    handle.shutdown().await?;
    tracing::info!("Result ingestion stopped");
    Ok(())
}

async fn start(env: &Env) -> Result<pipeline::PipelineHandle, Box<dyn Error>> {
    let config = PipelineConfig::from_env(env)?;

    let storage = Storage::from_env(env).await?;
    tracing::info!(backend = storage.kind_str(), "Blob storage ready");

    let queue_config = QueueConfig::from_env(env)?;
    let connection = message_queue::connect(&queue_config).await?;
    tracing::info!(
        backend = ?queue_config.backend,
        dead_letter = connection.dead_letter.describe(),
        "Queue connected"
    );

    let ledger = open_ledger(env).await?;

    let handle = Pipeline::new(config, processor::line_counter())
        .with_queue(connection, BlobFetcher::new(storage))
        .with_ledger(ledger)
        .start()
        .await?;
    Ok(handle)
}

async fn open_ledger(env: &Env) -> Result<Arc<dyn ProcessedLedger>, Box<dyn Error>> {
    match env.string("INGEST_LEDGER").as_deref() {
        None | Some("memory") => {
            tracing::warn!("Using in-memory ledger; duplicate suppression does not survive restarts");
            Ok(Arc::new(MemoryLedger::new()))
        }
        Some("surreal") => {
            db::init(DbConfig::from_env(env)).await?;
            let ledger = SurrealLedger::new();
            report_ledger(&ledger).await?;
            Ok(Arc::new(ledger))
        }
        Some(other) => Err(format!("unsupported INGEST_LEDGER={other} (expected memory|surreal)").into()),
    }
}

/// Log what a persistent ledger already holds.
async fn report_ledger(ledger: &SurrealLedger) -> Result<(), db::DbError> {
    let summary = ledger.summary(DEAD_LETTER_REPORT_LIMIT).await?;
    tracing::info!(
        applied = summary.applied,
        dead_lettered = summary.dead_lettered,
        "Ledger opened"
    );
    for entry in &summary.dead_letters {
        tracing::info!(
            message_id = %entry.message_id,
            blob = ?entry.blob,
            recorded_at = %entry.recorded_at,
            "Dead-lettered message on record"
        );
    }
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
