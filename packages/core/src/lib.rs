//! Core domain types for the result ingestion pipeline.
//!
//! This crate contains shared types used across all packages:
//! - PendingFile for uploads waiting on the local channel
//! - QueueMessage and BlobReference for the durable queue path
//! - ProcessingOutcome, events and stats for reporting
//! - Retry policy and environment configuration helpers

mod blob;
pub mod config;
mod events;
mod file;
pub mod ledger;
mod message;
mod outcome;
mod retry;
mod stats;

pub use blob::{BlobReference, BodyError};
pub use config::{ConfigError, PipelineConfig};
pub use events::IngestEvent;
pub use file::{FileId, PendingFile};
pub use ledger::{Disposition, LedgerEntry, LedgerError, MemoryLedger, ProcessedLedger};
pub use message::{MessageId, MessageState, QueueMessage, ReceiptToken};
pub use outcome::ProcessingOutcome;
pub use retry::RetryPolicy;
pub use stats::PipelineStats;
