//! Dead-letter routing for poison messages.

use std::sync::Arc;

use ingest_core::QueueMessage;

use crate::{MessageQueue, QueueError};

/// Where messages go once they exceed the receive ceiling.
#[derive(Clone)]
pub enum DeadLetterTarget {
    /// Forward the unchanged body to a dead-letter queue so it can be redriven later.
    Queue(Arc<dyn MessageQueue>),
    /// No target configured: log the message and drop it.
    LogOnly,
}

impl DeadLetterTarget {
    pub fn queue(queue: Arc<dyn MessageQueue>) -> Self {
        DeadLetterTarget::Queue(queue)
    }

    pub fn describe(&self) -> &str {
        match self {
            DeadLetterTarget::Queue(queue) => queue.name(),
            DeadLetterTarget::LogOnly => "log-only",
        }
    }

    /// Hand `message` to the dead-letter target.
    ///
    /// The caller deletes it from the primary queue only after this succeeds.
    pub async fn route(&self, message: &QueueMessage) -> Result<(), QueueError> {
        match self {
            DeadLetterTarget::Queue(queue) => {
                let dead_id = queue.send(message.body.clone()).await?;
                tracing::warn!(
                    message_id = %message.id,
                    dead_letter_id = %dead_id,
                    receive_count = message.receive_count,
                    target = queue.name(),
                    "Message moved to dead-letter queue"
                );
            }
            DeadLetterTarget::LogOnly => {
                tracing::error!(
                    message_id = %message.id,
                    receive_count = message.receive_count,
                    body = %message.body,
                    "Dropping poison message (no dead-letter queue configured)"
                );
            }
        }
        Ok(())
    }
}
