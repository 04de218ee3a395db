//! Message acknowledgement.
//!
//! Deleting a message is the pipeline's only externally visible commit
//! point: nothing before it is durable from the queue's perspective.

use std::sync::Arc;

use ingest_core::QueueMessage;
use tokio_util::sync::CancellationToken;

use crate::{MessageQueue, QueueError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// This delivery's receipt deleted the message.
    Deleted,
    /// Another delivery already deleted it.
    AlreadyDeleted,
}

#[derive(Debug, thiserror::Error)]
pub enum AckError {
    /// The lease lapsed before deletion; the message may be redelivered
    /// elsewhere. Do not retry the delete.
    #[error("receipt expired before acknowledgement")]
    ReceiptExpired,

    #[error("acknowledgement cancelled")]
    Cancelled,

    #[error("acknowledgement failed: {0}")]
    Queue(#[source] QueueError),
}

/// Deletes messages using the receipt captured at receive time.
#[derive(Clone)]
pub struct MessageAcknowledger {
    queue: Arc<dyn MessageQueue>,
}

impl MessageAcknowledger {
    pub fn new(queue: Arc<dyn MessageQueue>) -> Self {
        Self { queue }
    }

    /// Delete `message` from the queue.
    ///
    /// Must only be called once its content has been durably applied.
    pub async fn acknowledge(
        &self,
        message: &QueueMessage,
        cancel: &CancellationToken,
    ) -> Result<AckOutcome, AckError> {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AckError::Cancelled),
            result = self.queue.delete(&message.receipt) => result,
        };

        match result {
            Ok(()) => {
                tracing::debug!(queue = self.queue.name(), message_id = %message.id, "Message acknowledged");
                Ok(AckOutcome::Deleted)
            }
            Err(QueueError::MessageNotFound) => Ok(AckOutcome::AlreadyDeleted),
            Err(QueueError::ReceiptExpired) => Err(AckError::ReceiptExpired),
            Err(e) => Err(AckError::Queue(e)),
        }
    }
}
