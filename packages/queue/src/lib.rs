//! Durable message queue access.
//!
//! The pipeline talks to its queue only through [`MessageQueue`]:
//! `receive`, `delete`, `change_visibility` and `send`. Coordination between
//! consumers is entirely the queue's visibility leasing.
//!
//! # Backends
//!
//! - [`MemoryQueue`]: in-process queue with leases and receipt tokens, for tests and local runs
//! - `SqsQueue` (feature `sqs`): Amazon SQS, or local-stack in development

mod ack;
mod dead_letter;
mod memory;
#[cfg(feature = "sqs")]
mod sqs;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use ingest_core::config::{ConfigError, Env};
use ingest_core::{MessageId, QueueMessage, ReceiptToken};

pub use ack::{AckError, AckOutcome, MessageAcknowledger};
pub use dead_letter::DeadLetterTarget;
pub use memory::MemoryQueue;
#[cfg(feature = "sqs")]
pub use sqs::SqsQueue;

/// Endpoint substituted for the queue service in local-stack mode.
pub const LOCALSTACK_ENDPOINT: &str = "http://localhost:4566";

/// Future type returned by queue operations.
pub type QueueFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, QueueError>> + Send + 'a>>;

/// Queue operation errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The receipt belongs to a lapsed lease; the message is eligible for redelivery.
    #[error("receipt token expired")]
    ReceiptExpired,

    #[error("message not found")]
    MessageNotFound,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("queue transport error: {message}")]
    Transport { message: String, retryable: bool },

    #[error("invalid queue config: {0}")]
    Config(String),
}

impl QueueError {
    pub fn transport(message: impl Into<String>, retryable: bool) -> Self {
        QueueError::Transport {
            message: message.into(),
            retryable,
        }
    }

    /// Whether repeating the call could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::Transport { retryable: true, .. })
    }
}

impl From<ConfigError> for QueueError {
    fn from(e: ConfigError) -> Self {
        QueueError::Config(e.to_string())
    }
}

/// Parameters for one receive call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveRequest {
    /// Upper bound on messages returned.
    pub max_messages: u32,
    /// Lease applied to every returned message.
    pub visibility_timeout: Duration,
    /// How long to wait for a message when none is visible.
    pub wait_time: Duration,
}

/// A durable, at-least-once message queue with visibility leasing.
pub trait MessageQueue: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Lease up to `max_messages` visible messages.
    fn receive(&self, request: ReceiveRequest) -> QueueFuture<'_, Vec<QueueMessage>>;

    /// Delete the message leased under `receipt`.
    fn delete<'a>(&'a self, receipt: &'a ReceiptToken) -> QueueFuture<'a, ()>;

    /// Reset the remaining lease of the message leased under `receipt`.
    fn change_visibility<'a>(
        &'a self,
        receipt: &'a ReceiptToken,
        timeout: Duration,
    ) -> QueueFuture<'a, ()>;

    /// Publish a new message.
    fn send(&self, body: String) -> QueueFuture<'_, MessageId>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueBackend {
    Memory,
    Sqs,
}

/// Where the primary and dead-letter queues live.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub backend: QueueBackend,
    /// Primary queue URL (SQS).
    pub queue_url: Option<String>,
    /// Dead-letter queue URL; without one, poison messages are logged and dropped.
    pub dead_letter_queue_url: Option<String>,
    /// Endpoint override, e.g. local-stack.
    pub endpoint: Option<String>,
    pub region: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: QueueBackend::Memory,
            queue_url: None,
            dead_letter_queue_url: None,
            endpoint: None,
            region: "eu-west-2".to_string(),
        }
    }
}

impl QueueConfig {
    /// Build a config from environment variables.
    ///
    /// - `INGEST_QUEUE_BACKEND` (`sqs` or `memory`, default: `memory`)
    /// - `INGEST_QUEUE_URL` (required for `sqs`)
    /// - `INGEST_DEAD_LETTER_QUEUE_URL` (optional)
    /// - `INGEST_QUEUE_ENDPOINT` (optional endpoint override)
    /// - `AWS_REGION` (default: `eu-west-2`)
    /// - `INGEST_USE_LOCALSTACK` (substitutes `http://localhost:4566`)
    pub fn from_env(env: &Env) -> Result<Self, QueueError> {
        let backend = match env.string("INGEST_QUEUE_BACKEND").as_deref() {
            None | Some("memory") | Some("mem") => QueueBackend::Memory,
            Some("sqs") => QueueBackend::Sqs,
            Some(other) => {
                return Err(QueueError::Config(format!(
                    "unsupported INGEST_QUEUE_BACKEND={other} (expected sqs|memory)"
                )));
            }
        };

        let localstack = env.bool("INGEST_USE_LOCALSTACK")?.unwrap_or(false);
        let endpoint = if localstack {
            Some(LOCALSTACK_ENDPOINT.to_string())
        } else {
            env.string("INGEST_QUEUE_ENDPOINT")
        };

        let queue_url = env.string("INGEST_QUEUE_URL");
        if backend == QueueBackend::Sqs && queue_url.is_none() {
            return Err(ConfigError::Missing("INGEST_QUEUE_URL").into());
        }

        Ok(Self {
            backend,
            queue_url,
            dead_letter_queue_url: env.string("INGEST_DEAD_LETTER_QUEUE_URL"),
            endpoint,
            region: env
                .string("AWS_REGION")
                .unwrap_or_else(|| "eu-west-2".to_string()),
        })
    }
}

/// Connected primary queue and dead-letter target.
pub struct QueueConnection {
    pub queue: Arc<dyn MessageQueue>,
    pub dead_letter: DeadLetterTarget,
}

/// Open the queues named by `cfg`.
pub async fn connect(cfg: &QueueConfig) -> Result<QueueConnection, QueueError> {
    match cfg.backend {
        QueueBackend::Memory => {
            let dead_letter = match &cfg.dead_letter_queue_url {
                Some(name) => DeadLetterTarget::queue(Arc::new(MemoryQueue::new(name.clone()))),
                None => DeadLetterTarget::LogOnly,
            };
            Ok(QueueConnection {
                queue: Arc::new(MemoryQueue::new("primary")),
                dead_letter,
            })
        }
        QueueBackend::Sqs => connect_sqs(cfg).await,
    }
}

#[cfg(feature = "sqs")]
async fn connect_sqs(cfg: &QueueConfig) -> Result<QueueConnection, QueueError> {
    let queue_url = cfg
        .queue_url
        .clone()
        .ok_or(QueueError::Config("INGEST_QUEUE_URL is required for sqs".into()))?;
    let client = sqs::client(cfg).await;

    let dead_letter = match &cfg.dead_letter_queue_url {
        Some(url) => DeadLetterTarget::queue(Arc::new(SqsQueue::new(client.clone(), url.clone()))),
        None => DeadLetterTarget::LogOnly,
    };

    Ok(QueueConnection {
        queue: Arc::new(SqsQueue::new(client, queue_url)),
        dead_letter,
    })
}

#[cfg(not(feature = "sqs"))]
async fn connect_sqs(_cfg: &QueueConfig) -> Result<QueueConnection, QueueError> {
    Err(QueueError::Config(
        "sqs backend requested but the `sqs` feature is not enabled".into(),
    ))
}
