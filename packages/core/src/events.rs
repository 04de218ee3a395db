//! Event types for pipeline observation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{BlobReference, FileId, MessageId, ProcessingOutcome};

/// Events emitted by the ingestion pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum IngestEvent {
    // Local channel events
    /// A file was accepted by the local channel.
    FileEnqueued {
        file_id: FileId,
        path: String,
        timestamp: DateTime<Utc>,
    },
    /// A file could not be enqueued and was removed by its producer.
    FileRejected {
        file_id: FileId,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    /// The background worker applied a file.
    FileProcessed {
        file_id: FileId,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    /// The background worker failed to apply a file (error or timeout).
    FileFailed {
        file_id: FileId,
        error: String,
        timed_out: bool,
        timestamp: DateTime<Utc>,
    },

    // Durable queue events
    /// A message was leased by a consumer.
    MessageReceived {
        message_id: MessageId,
        consumer_id: String,
        receive_count: u32,
        timestamp: DateTime<Utc>,
    },
    /// A message was applied and deleted.
    MessageAcknowledged {
        message_id: MessageId,
        consumer_id: String,
        blob: BlobReference,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    /// A message failed and was left to expire for redelivery.
    MessageFailed {
        message_id: MessageId,
        consumer_id: String,
        outcome: ProcessingOutcome,
        receive_count: u32,
        timestamp: DateTime<Utc>,
    },
    /// Deletion came after the lease lapsed; the message belongs to another delivery now.
    AcknowledgementRaced {
        message_id: MessageId,
        consumer_id: String,
        timestamp: DateTime<Utc>,
    },
    /// A message exceeded the receive ceiling and was moved to the dead-letter target.
    MessageDeadLettered {
        message_id: MessageId,
        receive_count: u32,
        timestamp: DateTime<Utc>,
    },
    /// A redelivery of already-applied content was acknowledged without reprocessing.
    DuplicateSuppressed {
        message_id: MessageId,
        timestamp: DateTime<Utc>,
    },

    // Consumer lifecycle
    /// A consumer loop started polling.
    ConsumerStarted {
        consumer_id: String,
        timestamp: DateTime<Utc>,
    },
    /// A consumer loop stopped polling.
    ConsumerStopped {
        consumer_id: String,
        timestamp: DateTime<Utc>,
    },
}

impl IngestEvent {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            IngestEvent::FileEnqueued { timestamp, .. }
            | IngestEvent::FileRejected { timestamp, .. }
            | IngestEvent::FileProcessed { timestamp, .. }
            | IngestEvent::FileFailed { timestamp, .. }
            | IngestEvent::MessageReceived { timestamp, .. }
            | IngestEvent::MessageAcknowledged { timestamp, .. }
            | IngestEvent::MessageFailed { timestamp, .. }
            | IngestEvent::AcknowledgementRaced { timestamp, .. }
            | IngestEvent::MessageDeadLettered { timestamp, .. }
            | IngestEvent::DuplicateSuppressed { timestamp, .. }
            | IngestEvent::ConsumerStarted { timestamp, .. }
            | IngestEvent::ConsumerStopped { timestamp, .. } => *timestamp,
        }
    }

    /// Get the file ID associated with this event, if any.
    pub fn file_id(&self) -> Option<FileId> {
        match self {
            IngestEvent::FileEnqueued { file_id, .. }
            | IngestEvent::FileRejected { file_id, .. }
            | IngestEvent::FileProcessed { file_id, .. }
            | IngestEvent::FileFailed { file_id, .. } => Some(*file_id),
            _ => None,
        }
    }

    /// Get the message ID associated with this event, if any.
    pub fn message_id(&self) -> Option<&MessageId> {
        match self {
            IngestEvent::MessageReceived { message_id, .. }
            | IngestEvent::MessageAcknowledged { message_id, .. }
            | IngestEvent::MessageFailed { message_id, .. }
            | IngestEvent::AcknowledgementRaced { message_id, .. }
            | IngestEvent::MessageDeadLettered { message_id, .. }
            | IngestEvent::DuplicateSuppressed { message_id, .. } => Some(message_id),
            _ => None,
        }
    }

    /// Get a short description of this event for logging.
    pub fn description(&self) -> String {
        match self {
            IngestEvent::FileEnqueued { file_id, path, .. } => {
                format!("File {} enqueued from {}", file_id, path)
            }
            IngestEvent::FileRejected {
                file_id, reason, ..
            } => format!("File {} rejected: {}", file_id, reason),
            IngestEvent::FileProcessed {
                file_id,
                duration_ms,
                ..
            } => format!("File {} processed in {}ms", file_id, duration_ms),
            IngestEvent::FileFailed {
                file_id,
                error,
                timed_out,
                ..
            } => {
                let timeout = if *timed_out { " (timed out)" } else { "" };
                format!("File {} failed: {}{}", file_id, error, timeout)
            }
            IngestEvent::MessageReceived {
                message_id,
                consumer_id,
                receive_count,
                ..
            } => format!(
                "Message {} received by {} (delivery {})",
                message_id, consumer_id, receive_count
            ),
            IngestEvent::MessageAcknowledged {
                message_id,
                blob,
                duration_ms,
                ..
            } => format!(
                "Message {} applied {} and acknowledged in {}ms",
                message_id, blob, duration_ms
            ),
            IngestEvent::MessageFailed {
                message_id,
                outcome,
                ..
            } => format!("Message {} failed: {}", message_id, outcome),
            IngestEvent::AcknowledgementRaced { message_id, .. } => {
                format!("Message {} lease lapsed before acknowledgement", message_id)
            }
            IngestEvent::MessageDeadLettered {
                message_id,
                receive_count,
                ..
            } => format!(
                "Message {} dead-lettered after {} deliveries",
                message_id, receive_count
            ),
            IngestEvent::DuplicateSuppressed { message_id, .. } => {
                format!("Message {} already applied, acknowledged as duplicate", message_id)
            }
            IngestEvent::ConsumerStarted { consumer_id, .. } => {
                format!("Consumer {} started", consumer_id)
            }
            IngestEvent::ConsumerStopped { consumer_id, .. } => {
                format!("Consumer {} stopped", consumer_id)
            }
        }
    }
}
