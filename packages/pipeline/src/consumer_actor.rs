//! Queue consumer for the durable path.
//!
//! Each cycle leases a batch sized to the free in-flight permits, then handles
//! the batch concurrently: fetch the referenced blob, run the processor, and
//! delete the message only after the processor succeeded. Failed messages are
//! left alone so their lease lapses and the queue redelivers them; once the
//! receive count passes the ceiling they go to the dead-letter target instead.

use std::convert::Infallible;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use ingest_core::{
    BlobReference, Disposition, IngestEvent, LedgerEntry, MessageId, PipelineConfig,
    ProcessedLedger, ProcessingOutcome, QueueMessage, RetryPolicy,
};
use message_queue::{
    AckError, AckOutcome, DeadLetterTarget, MessageAcknowledger, MessageQueue, QueueError,
    ReceiveRequest,
};
use ractor::{Actor, ActorProcessingErr, ActorRef};
use storage::BlobFetcher;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::events::EventSink;
use crate::messages::ConsumerMessage;
use crate::processor::{ResultOrigin, ResultProcessor, ResultSource};

/// Pause between polls when the queue does not long-poll and came back empty.
const IDLE_POLL: Duration = Duration::from_millis(250);

/// Queue-facing settings taken from [`PipelineConfig`].
#[derive(Debug, Clone, Copy)]
pub struct ConsumerSettings {
    pub batch_size: u32,
    pub visibility_timeout: Duration,
    pub wait_time: Duration,
    pub processing_timeout: Duration,
    pub max_receive_count: u32,
    pub extend_visibility: bool,
}

impl From<&PipelineConfig> for ConsumerSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            visibility_timeout: config.visibility_timeout,
            wait_time: config.wait_time,
            processing_timeout: config.processing_timeout,
            max_receive_count: config.max_receive_count,
            extend_visibility: config.extend_visibility,
        }
    }
}

/// Consumer actor arguments.
#[derive(Clone)]
pub struct ConsumerArgs {
    pub consumer_id: String,
    pub queue: Arc<dyn MessageQueue>,
    pub dead_letter: DeadLetterTarget,
    pub fetcher: BlobFetcher,
    pub processor: Arc<dyn ResultProcessor>,
    pub ledger: Arc<dyn ProcessedLedger>,
    pub settings: ConsumerSettings,
    /// Shared by all consumers; one permit per message in flight.
    pub in_flight: Arc<Semaphore>,
    /// Stop receiving once cancelled. Messages already leased are still handled.
    pub shutdown: CancellationToken,
    /// Abandon fetches and acknowledgements in progress.
    pub abort: CancellationToken,
    pub events: EventSink,
}

/// State for the consumer actor.
pub struct ConsumerState {
    args: ConsumerArgs,
    acknowledger: MessageAcknowledger,
    backoff: RetryPolicy,
    receive_failures: u32,
}

impl ConsumerState {
    fn new(args: ConsumerArgs) -> Self {
        Self {
            acknowledger: MessageAcknowledger::new(args.queue.clone()),
            backoff: RetryPolicy::default()
                .with_initial_delay(Duration::from_secs(1))
                .with_max_delay(Duration::from_secs(30)),
            receive_failures: 0,
            args,
        }
    }

    fn consumer_id(&self) -> String {
        self.args.consumer_id.clone()
    }

    /// One receive cycle. `Break` means shutdown was requested.
    async fn poll_once(&mut self) -> ControlFlow<()> {
        let Some(mut permits) = self.acquire_permits().await else {
            return ControlFlow::Break(());
        };

        let request = ReceiveRequest {
            max_messages: permits.num_permits() as u32,
            visibility_timeout: self.args.settings.visibility_timeout,
            wait_time: self.args.settings.wait_time,
        };
        let shutdown = self.args.shutdown.clone();
        let received = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return ControlFlow::Break(()),
            received = self.args.queue.receive(request) => received,
        };

        let messages = match received {
            Ok(messages) => {
                self.receive_failures = 0;
                messages
            }
            Err(e) => {
                drop(permits);
                self.receive_failures += 1;
                let delay = self.backoff.delay_for(self.receive_failures);
                if e.is_transient() {
                    tracing::warn!(consumer_id = %self.args.consumer_id, error = %e, ?delay, "Receive failed, backing off");
                } else {
                    tracing::error!(consumer_id = %self.args.consumer_id, error = %e, ?delay, "Receive failed, backing off");
                }
                return self.pause(delay).await;
            }
        };

        if messages.is_empty() {
            drop(permits);
            if self.args.settings.wait_time.is_zero() {
                return self.pause(IDLE_POLL).await;
            }
            return ControlFlow::Continue(());
        }

        tracing::debug!(consumer_id = %self.args.consumer_id, count = messages.len(), "Received batch");

        // One permit per message, released as each finishes; the rest go back now.
        let leases: Vec<Option<OwnedSemaphorePermit>> =
            messages.iter().map(|_| permits.split(1)).collect();
        drop(permits);

        let this = &*self;
        join_all(
            messages
                .into_iter()
                .zip(leases)
                .map(|(message, permit)| async move {
                    this.handle_message(message).await;
                    drop(permit);
                }),
        )
        .await;

        ControlFlow::Continue(())
    }

    /// Wait for at least one in-flight permit, then take up to a batch.
    async fn acquire_permits(&self) -> Option<OwnedSemaphorePermit> {
        let semaphore = &self.args.in_flight;
        let mut permits = tokio::select! {
            biased;
            _ = self.args.shutdown.cancelled() => return None,
            permit = semaphore.clone().acquire_owned() => permit.ok()?,
        };

        while permits.num_permits() < self.args.settings.batch_size as usize {
            match semaphore.clone().try_acquire_owned() {
                Ok(more) => permits.merge(more),
                Err(_) => break,
            }
        }
        Some(permits)
    }

    async fn pause(&self, delay: Duration) -> ControlFlow<()> {
        tokio::select! {
            biased;
            _ = self.args.shutdown.cancelled() => ControlFlow::Break(()),
            _ = tokio::time::sleep(delay) => ControlFlow::Continue(()),
        }
    }

    async fn handle_message(&self, message: QueueMessage) {
        let started = Instant::now();
        self.args.events.emit(IngestEvent::MessageReceived {
            message_id: message.id.clone(),
            consumer_id: self.consumer_id(),
            receive_count: message.receive_count,
            timestamp: Utc::now(),
        });

        match self.recorded(&message.id).await {
            Some(Disposition::Applied) => {
                tracing::info!(message_id = %message.id, "Content already applied, acknowledging duplicate");
                self.args.events.emit(IngestEvent::DuplicateSuppressed {
                    message_id: message.id.clone(),
                    timestamp: Utc::now(),
                });
                self.acknowledge(&message).await;
                return;
            }
            Some(Disposition::DeadLettered) => {
                tracing::info!(message_id = %message.id, "Already dead-lettered, removing from queue");
                self.acknowledge(&message).await;
                return;
            }
            None => {}
        }

        if message.exceeds_receive_limit(self.args.settings.max_receive_count) {
            self.dead_letter(&message).await;
            return;
        }

        let blob = match message.blob_reference() {
            Ok(blob) => blob,
            Err(e) => {
                self.fail(&message, ProcessingOutcome::permanent(e.to_string()));
                return;
            }
        };

        let outcome = if self.args.settings.extend_visibility {
            tokio::select! {
                outcome = self.apply(&message, &blob) => outcome,
                never = self.keep_leased(&message) => match never {},
            }
        } else {
            self.apply(&message, &blob).await
        };

        if !outcome.is_success() {
            self.fail(&message, outcome);
            return;
        }

        // Recorded before deleting so a redelivery after a lost delete is recognised.
        if let Err(e) = self
            .args
            .ledger
            .record(LedgerEntry::applied(message.id.clone(), blob.clone()))
            .await
        {
            tracing::warn!(message_id = %message.id, error = %e, "Failed to record applied message");
        }

        if self.acknowledge(&message).await == Some(AckOutcome::Deleted) {
            self.args.events.emit(IngestEvent::MessageAcknowledged {
                message_id: message.id.clone(),
                consumer_id: self.consumer_id(),
                blob,
                duration_ms: started.elapsed().as_millis() as u64,
                timestamp: Utc::now(),
            });
        }
    }

    /// Fetch the blob and run the processor on it.
    async fn apply(&self, message: &QueueMessage, blob: &BlobReference) -> ProcessingOutcome {
        let content = match self.args.fetcher.fetch(blob, &self.args.abort).await {
            Ok(content) => content,
            Err(e) if e.is_permanent() => return ProcessingOutcome::permanent(e.to_string()),
            Err(e) => return ProcessingOutcome::transient(e.to_string()),
        };

        let source = ResultSource {
            origin: ResultOrigin::Blob {
                message_id: message.id.clone(),
                blob: blob.clone(),
            },
            content,
        };

        let timeout = self.args.settings.processing_timeout;
        match tokio::time::timeout(timeout, self.args.processor.process(source)).await {
            Ok(Ok(summary)) => {
                tracing::debug!(message_id = %message.id, blob = %blob, records = summary.records, "Blob applied");
                ProcessingOutcome::Success
            }
            Ok(Err(e)) => e.outcome(),
            Err(_) => ProcessingOutcome::transient(format!("processing timed out after {:?}", timeout)),
        }
    }

    /// Extend the lease at half-window intervals until it is lost.
    async fn keep_leased(&self, message: &QueueMessage) -> Infallible {
        let window = self.args.settings.visibility_timeout;
        let period = (window / 2).max(Duration::from_secs(1));
        let mut ticks = tokio::time::interval_at(Instant::now() + period, period);

        loop {
            ticks.tick().await;
            match self.args.queue.change_visibility(&message.receipt, window).await {
                Ok(()) => {
                    tracing::debug!(message_id = %message.id, ?window, "Visibility extended");
                }
                Err(e @ (QueueError::ReceiptExpired | QueueError::MessageNotFound)) => {
                    tracing::warn!(message_id = %message.id, error = %e, "Lease lost, no longer extending");
                    break;
                }
                Err(e) => {
                    tracing::warn!(message_id = %message.id, error = %e, "Failed to extend visibility");
                }
            }
        }
        std::future::pending().await
    }

    /// Route a poison message to the dead-letter target, once, then delete it.
    async fn dead_letter(&self, message: &QueueMessage) {
        if let Err(e) = self.args.dead_letter.route(message).await {
            // Still on the primary queue; the next delivery tries again.
            tracing::error!(
                message_id = %message.id,
                target = self.args.dead_letter.describe(),
                error = %e,
                "Dead-letter routing failed"
            );
            return;
        }

        if let Err(e) = self
            .args
            .ledger
            .record(LedgerEntry::dead_lettered(message.id.clone(), message.blob_reference().ok()))
            .await
        {
            tracing::warn!(message_id = %message.id, error = %e, "Failed to record dead-lettered message");
        }
        self.args.events.emit(IngestEvent::MessageDeadLettered {
            message_id: message.id.clone(),
            receive_count: message.receive_count,
            timestamp: Utc::now(),
        });

        self.acknowledge(message).await;
    }

    fn fail(&self, message: &QueueMessage, outcome: ProcessingOutcome) {
        tracing::warn!(
            consumer_id = %self.args.consumer_id,
            message_id = %message.id,
            receive_count = message.receive_count,
            outcome = %outcome,
            redelivery_after = %message.lease_expires_at(),
            "Message failed, leaving it for redelivery"
        );
        self.args.events.emit(IngestEvent::MessageFailed {
            message_id: message.id.clone(),
            consumer_id: self.consumer_id(),
            outcome,
            receive_count: message.receive_count,
            timestamp: Utc::now(),
        });
    }

    async fn recorded(&self, message_id: &MessageId) -> Option<Disposition> {
        match self.args.ledger.lookup(message_id).await {
            Ok(entry) => entry.map(|e| e.disposition),
            Err(e) => {
                tracing::warn!(message_id = %message_id, error = %e, "Ledger lookup failed");
                None
            }
        }
    }

    /// Delete a message. Races with other deliveries are reported, not retried.
    async fn acknowledge(&self, message: &QueueMessage) -> Option<AckOutcome> {
        let raced = || {
            self.args.events.emit(IngestEvent::AcknowledgementRaced {
                message_id: message.id.clone(),
                consumer_id: self.consumer_id(),
                timestamp: Utc::now(),
            })
        };

        match self.acknowledger.acknowledge(message, &self.args.abort).await {
            Ok(AckOutcome::Deleted) => Some(AckOutcome::Deleted),
            Ok(AckOutcome::AlreadyDeleted) => {
                tracing::info!(message_id = %message.id, "Message already deleted by another delivery");
                raced();
                Some(AckOutcome::AlreadyDeleted)
            }
            Err(AckError::ReceiptExpired) => {
                tracing::warn!(message_id = %message.id, "Lease lapsed before acknowledgement, message will be redelivered");
                raced();
                None
            }
            Err(AckError::Cancelled) => {
                tracing::warn!(message_id = %message.id, "Acknowledgement abandoned, message will be redelivered");
                None
            }
            Err(e) => {
                tracing::error!(message_id = %message.id, error = %e, "Acknowledgement failed");
                None
            }
        }
    }
}

/// Consumer actor that polls the durable queue.
pub struct ConsumerActor;

impl Actor for ConsumerActor {
    type Msg = ConsumerMessage;
    type State = ConsumerState;
    type Arguments = ConsumerArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(
            consumer_id = %args.consumer_id,
            queue = args.queue.name(),
            dead_letter = args.dead_letter.describe(),
            "Starting queue consumer"
        );
        args.events.emit(IngestEvent::ConsumerStarted {
            consumer_id: args.consumer_id.clone(),
            timestamp: Utc::now(),
        });
        myself.send_message(ConsumerMessage::Poll)?;

        Ok(ConsumerState::new(args))
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            ConsumerMessage::Poll => {
                if state.args.shutdown.is_cancelled() {
                    myself.stop(Some("shutdown".into()));
                    return Ok(());
                }
                match state.poll_once().await {
                    ControlFlow::Continue(()) => myself.send_message(ConsumerMessage::Poll)?,
                    ControlFlow::Break(()) => myself.stop(Some("shutdown".into())),
                }
            }
        }

        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        tracing::info!(consumer_id = %state.args.consumer_id, "Queue consumer stopped");
        state.args.events.emit(IngestEvent::ConsumerStopped {
            consumer_id: state.consumer_id(),
            timestamp: Utc::now(),
        });
        Ok(())
    }
}
