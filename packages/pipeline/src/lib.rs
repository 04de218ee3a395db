//! Actor system for result ingestion.
//!
//! Two paths feed the same [`ResultProcessor`]:
//!
//! - uploads: [`UploadGateway`] spools a file and hands it to the bounded
//!   [`FileChannel`]; a single [`WorkerActor`] drains it in order
//! - durable queue: one or more [`ConsumerActor`]s lease messages, fetch the
//!   referenced blob, process it and delete the message only on success
//!
//! The [`Supervisor`] owns both, relays [`ingest_core::IngestEvent`]s,
//! purges expired ledger entries and shuts the pipeline down gracefully.
//!
//! # Usage
//!
//! ```ignore
//! use pipeline::{Pipeline, result_processor, ProcessingSummary};
//!
//! let processor = Arc::new(result_processor!(|source| {
//!     Ok(ProcessingSummary::records(apply(source)?))
//! }));
//! let handle = Pipeline::new(config, processor)
//!     .with_queue(connection, fetcher)
//!     .start()
//!     .await?;
//!
//! handle.gateway().accept(bytes, Duration::from_secs(5)).await?;
//! handle.shutdown().await?;
//! ```

pub mod channel;
mod consumer_actor;
mod events;
mod messages;
mod processor;
mod retention;
mod spool;
mod supervisor;
mod worker_actor;

pub use channel::{ChannelError, FileChannel, FileDrain};
pub use consumer_actor::{ConsumerActor, ConsumerArgs, ConsumerSettings};
pub use events::EventSink;
pub use messages::{ConsumerMessage, SupervisorMessage, WorkerMessage};
pub use processor::{
    FnProcessor, ProcessError, ProcessFuture, ProcessResult, ProcessingSummary, ResultOrigin,
    ResultProcessor, ResultSource,
};
pub use retention::{purge_expired, purge_interval, spawn_ledger_purge};
pub use spool::{GatewayError, UploadGateway};
pub use supervisor::{Pipeline, PipelineError, PipelineHandle, Supervisor, SupervisorArgs};
pub use worker_actor::{WorkerActor, WorkerArgs};

/// Re-export ractor types for convenience.
pub use ractor::{Actor, ActorRef};
