//! In-process queue with visibility leasing.
//!
//! Behaves like a hosted queue for the properties the pipeline relies on:
//! a received message is hidden for its visibility window, every delivery
//! gets a fresh receipt token, tokens from lapsed leases are rejected, and
//! receive counts grow with each delivery. Time comes from the tokio clock,
//! so tests can pause and advance it.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::Utc;
use ingest_core::{MessageId, MessageState, QueueMessage, ReceiptToken};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use ulid::Ulid;

use crate::{MessageQueue, QueueError, QueueFuture, ReceiveRequest};

/// Longest single sleep while long-polling an empty queue.
const POLL_STEP: Duration = Duration::from_millis(100);

/// Deleted messages remembered so late deletes report `MessageNotFound`.
const DELETED_HISTORY: usize = 1024;

#[derive(Debug)]
struct Lease {
    receipt: ReceiptToken,
    expires_at: Instant,
}

#[derive(Debug)]
struct StoredMessage {
    id: MessageId,
    body: String,
    receive_count: u32,
    lease: Option<Lease>,
}

impl StoredMessage {
    fn is_visible(&self, now: Instant) -> bool {
        self.lease.as_ref().is_none_or(|l| l.expires_at <= now)
    }

    fn holds(&self, receipt: &ReceiptToken, now: Instant) -> bool {
        self.lease
            .as_ref()
            .is_some_and(|l| &l.receipt == receipt && l.expires_at > now)
    }
}

#[derive(Debug)]
struct Tombstone {
    id: MessageId,
    receipts: Vec<ReceiptToken>,
}

#[derive(Debug, Default)]
struct MemoryState {
    messages: VecDeque<StoredMessage>,
    /// Receipts issued for messages still on the queue.
    receipts: HashMap<ReceiptToken, MessageId>,
    /// Most recently deleted messages, oldest first.
    deleted: VecDeque<Tombstone>,
}

impl MemoryState {
    fn position(&self, id: &MessageId) -> Option<usize> {
        self.messages.iter().position(|m| &m.id == id)
    }

    /// Resolve a receipt to the message it currently leases.
    fn leased_index(&self, receipt: &ReceiptToken, now: Instant) -> Result<usize, QueueError> {
        let Some(id) = self.receipts.get(receipt) else {
            if self.deleted.iter().any(|t| t.receipts.contains(receipt)) {
                return Err(QueueError::MessageNotFound);
            }
            return Err(QueueError::InvalidRequest("unknown receipt token".into()));
        };

        let index = self.position(id).ok_or(QueueError::MessageNotFound)?;
        if self.messages[index].holds(receipt, now) {
            Ok(index)
        } else {
            Err(QueueError::ReceiptExpired)
        }
    }

    /// Forget the receipts of a deleted message, keeping a bounded tombstone.
    fn bury(&mut self, id: MessageId) {
        let receipts: Vec<ReceiptToken> = self
            .receipts
            .iter()
            .filter(|(_, owner)| **owner == id)
            .map(|(receipt, _)| receipt.clone())
            .collect();
        for receipt in &receipts {
            self.receipts.remove(receipt);
        }

        self.deleted.push_back(Tombstone { id, receipts });
        while self.deleted.len() > DELETED_HISTORY {
            self.deleted.pop_front();
        }
    }
}

/// In-memory [`MessageQueue`].
#[derive(Debug)]
pub struct MemoryQueue {
    name: String,
    state: Mutex<MemoryState>,
    arrivals: Notify,
}

impl MemoryQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(MemoryState::default()),
            arrivals: Notify::new(),
        }
    }

    /// Messages not yet deleted, visible or leased.
    pub async fn len(&self) -> usize {
        self.state.lock().await.messages.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Bodies of all messages not yet deleted, oldest first.
    pub async fn bodies(&self) -> Vec<String> {
        self.state
            .lock()
            .await
            .messages
            .iter()
            .map(|m| m.body.clone())
            .collect()
    }

    /// Number of deliveries made for a message so far.
    pub async fn receive_count(&self, id: &MessageId) -> Option<u32> {
        let state = self.state.lock().await;
        state
            .position(id)
            .map(|i| state.messages[i].receive_count)
    }

    /// Lifecycle state of a message from the queue's point of view.
    ///
    /// Returns `None` for a message that was never sent, or that has been sent
    /// but not yet received.
    pub async fn state_of(&self, id: &MessageId) -> Option<MessageState> {
        let state = self.state.lock().await;
        if state.deleted.iter().any(|t| &t.id == id) {
            return Some(MessageState::Acknowledged);
        }
        let message = &state.messages[state.position(id)?];
        match &message.lease {
            None => None,
            Some(lease) if lease.expires_at > Instant::now() => Some(MessageState::Received),
            Some(_) => Some(MessageState::Expired),
        }
    }

    fn lease_visible(&self, state: &mut MemoryState, request: &ReceiveRequest) -> Vec<QueueMessage> {
        let now = Instant::now();
        let mut leased = Vec::new();

        for message in state.messages.iter_mut() {
            if leased.len() >= request.max_messages as usize {
                break;
            }
            if !message.is_visible(now) {
                continue;
            }

            message.receive_count += 1;
            let receipt = ReceiptToken::new(format!("{}:{}", message.id, Ulid::new()));
            message.lease = Some(Lease {
                receipt: receipt.clone(),
                expires_at: now + request.visibility_timeout,
            });

            leased.push(QueueMessage {
                id: message.id.clone(),
                receipt,
                body: message.body.clone(),
                receive_count: message.receive_count,
                received_at: Utc::now(),
                visibility_timeout: request.visibility_timeout,
            });
        }

        for message in &leased {
            state
                .receipts
                .insert(message.receipt.clone(), message.id.clone());
        }
        leased
    }

    async fn receive_inner(&self, request: ReceiveRequest) -> Result<Vec<QueueMessage>, QueueError> {
        if request.max_messages == 0 {
            return Err(QueueError::InvalidRequest(
                "max_messages must be at least 1".into(),
            ));
        }

        let deadline = Instant::now() + request.wait_time;
        loop {
            let leased = {
                let mut state = self.state.lock().await;
                self.lease_visible(&mut state, &request)
            };

            let now = Instant::now();
            if !leased.is_empty() || now >= deadline {
                return Ok(leased);
            }

            let step = (deadline - now).min(POLL_STEP);
            tokio::select! {
                _ = self.arrivals.notified() => {}
                _ = tokio::time::sleep(step) => {}
            }
        }
    }

    async fn delete_inner(&self, receipt: &ReceiptToken) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let index = state.leased_index(receipt, Instant::now())?;
        if let Some(message) = state.messages.remove(index) {
            tracing::debug!(queue = %self.name, message_id = %message.id, "Deleted message");
            state.bury(message.id);
        }
        Ok(())
    }

    async fn change_visibility_inner(
        &self,
        receipt: &ReceiptToken,
        timeout: Duration,
    ) -> Result<(), QueueError> {
        let now = Instant::now();
        {
            let mut state = self.state.lock().await;
            let index = state.leased_index(receipt, now)?;
            if let Some(lease) = state.messages[index].lease.as_mut() {
                lease.expires_at = now + timeout;
            }
        }
        if timeout.is_zero() {
            self.arrivals.notify_waiters();
        }
        Ok(())
    }

    async fn send_inner(&self, body: String) -> Result<MessageId, QueueError> {
        let id = MessageId::new(Ulid::new().to_string());
        self.state.lock().await.messages.push_back(StoredMessage {
            id: id.clone(),
            body,
            receive_count: 0,
            lease: None,
        });
        self.arrivals.notify_waiters();
        Ok(id)
    }
}

impl MessageQueue for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn receive(&self, request: ReceiveRequest) -> QueueFuture<'_, Vec<QueueMessage>> {
        Box::pin(self.receive_inner(request))
    }

    fn delete<'a>(&'a self, receipt: &'a ReceiptToken) -> QueueFuture<'a, ()> {
        Box::pin(self.delete_inner(receipt))
    }

    fn change_visibility<'a>(
        &'a self,
        receipt: &'a ReceiptToken,
        timeout: Duration,
    ) -> QueueFuture<'a, ()> {
        Box::pin(self.change_visibility_inner(receipt, timeout))
    }

    fn send(&self, body: String) -> QueueFuture<'_, MessageId> {
        Box::pin(self.send_inner(body))
    }
}
