//! Durable queue message types.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::blob::{BlobReference, BodyError};

/// Identifier assigned to a message by the queue service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Delivery token handed out with each receive.
///
/// Required to delete the message or change its visibility. A new token is
/// issued on every delivery, so a token from an earlier delivery stops working
/// once the message has been received again.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReceiptToken(pub String);

impl ReceiptToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// Receipt handles are long opaque strings; keep logs readable.
impl std::fmt::Debug for ReceiptToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shown: String = self.0.chars().take(12).collect();
        write!(f, "ReceiptToken({shown}..)")
    }
}

/// Lifecycle of a message as seen by a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    /// Leased to exactly one consumer for the visibility window.
    Received,
    /// The consumer is fetching and applying the referenced content.
    Processing,
    /// Deleted from the queue. Terminal.
    Acknowledged,
    /// Visibility window lapsed; eligible for redelivery.
    Expired,
}

impl MessageState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageState::Acknowledged)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageState::Received => "received",
            MessageState::Processing => "processing",
            MessageState::Acknowledged => "acknowledged",
            MessageState::Expired => "expired",
        }
    }
}

impl std::fmt::Display for MessageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message received from the durable queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    /// Queue-assigned message identifier.
    pub id: MessageId,
    /// Token for this delivery, needed to delete or extend the lease.
    pub receipt: ReceiptToken,
    /// Raw JSON body referencing a blob.
    pub body: String,
    /// Approximate number of times this message has been delivered,
    /// including the current delivery.
    pub receive_count: u32,
    /// When this delivery was received.
    pub received_at: DateTime<Utc>,
    /// Lease duration requested at receive time.
    pub visibility_timeout: Duration,
}

impl QueueMessage {
    /// Extract the blob reference from the body.
    pub fn blob_reference(&self) -> Result<BlobReference, BodyError> {
        BlobReference::from_message_body(&self.body)
    }

    /// Whether this delivery is past the allowed number of attempts.
    pub fn exceeds_receive_limit(&self, max_receive_count: u32) -> bool {
        self.receive_count > max_receive_count
    }

    /// When the current lease lapses, assuming it was not extended.
    pub fn lease_expires_at(&self) -> DateTime<Utc> {
        let window = chrono::Duration::from_std(self.visibility_timeout)
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.received_at + window
    }
}
