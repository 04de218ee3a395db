//! Supervisor actor that owns the worker and consumers of one pipeline.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ingest_core::{
    ConfigError, IngestEvent, MemoryLedger, PipelineConfig, PipelineStats, ProcessedLedger,
};
use message_queue::QueueConnection;
use ractor::rpc::CallResult;
use ractor::{Actor, ActorId, ActorProcessingErr, ActorRef, RpcReplyPort, SupervisionEvent};
use storage::BlobFetcher;
use tokio::sync::{Semaphore, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::channel::FileChannel;
use crate::consumer_actor::{ConsumerActor, ConsumerArgs, ConsumerSettings};
use crate::events::EventSink;
use crate::messages::SupervisorMessage;
use crate::processor::ResultProcessor;
use crate::retention::spawn_ledger_purge;
use crate::spool::UploadGateway;
use crate::worker_actor::{WorkerActor, WorkerArgs};

const RPC_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to start pipeline: {0}")]
    Spawn(#[from] ractor::SpawnErr),

    #[error("pipeline supervisor unavailable: {0}")]
    Unavailable(String),

    #[error("pipeline supervisor did not answer in time")]
    Timeout,
}

#[derive(Debug, Clone)]
enum Child {
    Worker,
    Consumer(String),
}

/// Supervisor actor arguments.
pub struct SupervisorArgs {
    pub config: PipelineConfig,
    pub channel: FileChannel,
    pub processor: Arc<dyn ResultProcessor>,
    pub queue: Option<(QueueConnection, BlobFetcher)>,
    pub ledger: Arc<dyn ProcessedLedger>,
    pub shutdown: CancellationToken,
    pub abort: CancellationToken,
}

/// State for the supervisor actor.
pub struct SupervisorState {
    event_tx: broadcast::Sender<IngestEvent>,
    stats: PipelineStats,
    children: HashMap<ActorId, Child>,
    /// Template for (re)spawning consumers; `None` without a queue.
    consumer_args: Option<ConsumerArgs>,
    consumer_counter: u32,
    channel: FileChannel,
    shutdown: CancellationToken,
    draining: bool,
    drain_replies: Vec<RpcReplyPort<()>>,
    ledger_purge: JoinHandle<()>,
}

impl SupervisorState {
    async fn spawn_consumer(
        &mut self,
        myself: &ActorRef<SupervisorMessage>,
    ) -> Result<(), ActorProcessingErr> {
        let Some(template) = &self.consumer_args else {
            return Ok(());
        };
        self.consumer_counter += 1;
        let mut args = template.clone();
        args.consumer_id = format!("consumer-{}", self.consumer_counter);
        let consumer_id = args.consumer_id.clone();

        let (actor, _handle) = Actor::spawn_linked(None, ConsumerActor, args, myself.get_cell())
            .await
            .map_err(|e| ActorProcessingErr::from(format!("Failed to spawn {}: {}", consumer_id, e)))?;

        self.children.insert(actor.get_id(), Child::Consumer(consumer_id));
        Ok(())
    }

    /// Once draining and every child has stopped, answer waiters and stop.
    fn finish_if_drained(&mut self, myself: &ActorRef<SupervisorMessage>) {
        if !self.draining || !self.children.is_empty() {
            return;
        }
        for reply in self.drain_replies.drain(..) {
            let _ = reply.send(());
        }
        // Process events the children sent before stopping, then stop.
        if myself.drain().is_err() {
            myself.stop(Some("drained".into()));
        }
    }
}

/// Supervisor actor for the upload worker and queue consumers.
pub struct Supervisor;

impl Actor for Supervisor {
    type Msg = SupervisorMessage;
    type State = SupervisorState;
    type Arguments = SupervisorArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(
            channel_capacity = args.config.channel_capacity,
            consumers = args.config.consumers,
            in_flight_limit = args.config.in_flight_limit,
            "Starting ingestion pipeline supervisor"
        );

        let (event_tx, _) = broadcast::channel(1024);
        let events = EventSink::Supervisor(myself.clone());

        let consumer_args = args.queue.map(|(connection, fetcher)| ConsumerArgs {
            consumer_id: String::new(),
            queue: connection.queue,
            dead_letter: connection.dead_letter,
            fetcher,
            processor: args.processor.clone(),
            ledger: args.ledger.clone(),
            settings: ConsumerSettings::from(&args.config),
            in_flight: Arc::new(Semaphore::new(args.config.in_flight_limit)),
            shutdown: args.shutdown.clone(),
            abort: args.abort.clone(),
            events: events.clone(),
        });

        let mut state = SupervisorState {
            event_tx,
            stats: PipelineStats::default(),
            children: HashMap::new(),
            consumer_args,
            consumer_counter: 0,
            channel: args.channel,
            shutdown: args.shutdown.clone(),
            draining: false,
            drain_replies: Vec::new(),
            ledger_purge: spawn_ledger_purge(
                args.ledger.clone(),
                args.config.ledger_retention,
                args.shutdown.clone(),
            ),
        };

        let drain = state
            .channel
            .drain()
            .ok_or_else(|| ActorProcessingErr::from("local channel reader already taken"))?;
        let (worker, _handle) = Actor::spawn_linked(
            None,
            WorkerActor,
            WorkerArgs {
                drain,
                processor: args.processor,
                processing_timeout: args.config.processing_timeout,
                abort: args.abort,
                events,
            },
            myself.get_cell(),
        )
        .await
        .map_err(|e| ActorProcessingErr::from(format!("Failed to spawn upload worker: {}", e)))?;
        state.children.insert(worker.get_id(), Child::Worker);

        if state.consumer_args.is_some() {
            for _ in 0..args.config.consumers {
                state.spawn_consumer(&myself).await?;
            }
        } else {
            tracing::info!("No queue configured, running the upload path only");
        }

        Ok(state)
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SupervisorMessage::Event(event) => {
                tracing::trace!(event = %event.description(), "Pipeline event");
                state.stats.record(&event);
                let _ = state.event_tx.send(event);
            }

            SupervisorMessage::Subscribe { reply } => {
                let _ = reply.send(state.event_tx.subscribe());
            }

            SupervisorMessage::GetStats { reply } => {
                let _ = reply.send(state.stats.clone());
            }

            SupervisorMessage::Drain { reply } => {
                if !state.draining {
                    tracing::info!(children = state.children.len(), "Draining pipeline");
                    state.draining = true;
                    state.shutdown.cancel();
                    state.channel.close("pipeline shutting down");
                }
                state.drain_replies.push(reply);
                state.finish_if_drained(&myself);
            }
        }

        Ok(())
    }

    async fn handle_supervisor_evt(
        &self,
        myself: ActorRef<Self::Msg>,
        message: SupervisionEvent,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SupervisionEvent::ActorTerminated(cell, _, reason) => {
                if let Some(child) = state.children.remove(&cell.get_id()) {
                    if state.draining {
                        tracing::info!(?child, ?reason, "Child stopped");
                    } else {
                        tracing::warn!(?child, ?reason, "Child stopped before shutdown");
                    }
                }
            }
            SupervisionEvent::ActorFailed(cell, error) => match state.children.remove(&cell.get_id()) {
                Some(Child::Consumer(consumer_id)) if !state.draining => {
                    tracing::error!(%consumer_id, %error, "Consumer failed, restarting");
                    state.spawn_consumer(&myself).await?;
                }
                Some(Child::Worker) => {
                    tracing::error!(%error, "Upload worker failed, uploads will not be processed");
                }
                Some(child) => {
                    tracing::warn!(?child, %error, "Child failed during shutdown");
                }
                None => {}
            },
            _ => {}
        }

        state.finish_if_drained(&myself);
        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        state.shutdown.cancel();
        state.channel.close("supervisor stopped");
        state.ledger_purge.abort();
        tracing::info!(
            files_processed = state.stats.files_processed,
            messages_acknowledged = state.stats.messages_acknowledged,
            dead_lettered = state.stats.dead_lettered,
            "Pipeline supervisor stopped"
        );
        Ok(())
    }
}

/// Builder for a pipeline.
pub struct Pipeline {
    config: PipelineConfig,
    processor: Arc<dyn ResultProcessor>,
    queue: Option<(QueueConnection, BlobFetcher)>,
    ledger: Arc<dyn ProcessedLedger>,
}

impl Pipeline {
    /// A pipeline with only the upload path and an in-memory ledger.
    pub fn new(config: PipelineConfig, processor: Arc<dyn ResultProcessor>) -> Self {
        Self {
            config,
            processor,
            queue: None,
            ledger: Arc::new(MemoryLedger::new()),
        }
    }

    /// Also consume `queue`, fetching referenced blobs with `fetcher`.
    pub fn with_queue(mut self, queue: QueueConnection, fetcher: BlobFetcher) -> Self {
        self.queue = Some((queue, fetcher));
        self
    }

    pub fn with_ledger(mut self, ledger: Arc<dyn ProcessedLedger>) -> Self {
        self.ledger = ledger;
        self
    }

    /// Validate the config and start the supervisor.
    pub async fn start(self) -> Result<PipelineHandle, PipelineError> {
        self.config.validate()?;
        if self.queue.is_some() && self.config.lease_may_lapse() {
            tracing::warn!(
                processing_timeout = ?self.config.processing_timeout,
                visibility_timeout = ?self.config.visibility_timeout,
                "Processing may outlast the visibility window; expect duplicate deliveries"
            );
        }

        let channel = FileChannel::new(self.config.channel_capacity);
        let shutdown = CancellationToken::new();
        let abort = CancellationToken::new();
        let spool_dir = self.config.spool_dir.clone();
        let grace = self.config.shutdown_grace;

        let (supervisor, join) = Actor::spawn(
            None,
            Supervisor,
            SupervisorArgs {
                config: self.config,
                channel: channel.clone(),
                processor: self.processor,
                queue: self.queue,
                ledger: self.ledger,
                shutdown: shutdown.clone(),
                abort: abort.clone(),
            },
        )
        .await?;

        Ok(PipelineHandle {
            supervisor,
            join,
            channel,
            shutdown,
            abort,
            spool_dir,
            grace,
        })
    }
}

/// Handle to a running pipeline.
pub struct PipelineHandle {
    supervisor: ActorRef<SupervisorMessage>,
    join: JoinHandle<()>,
    channel: FileChannel,
    shutdown: CancellationToken,
    abort: CancellationToken,
    spool_dir: PathBuf,
    grace: Duration,
}

impl PipelineHandle {
    pub fn channel(&self) -> &FileChannel {
        &self.channel
    }

    /// Gateway for uploads, reporting to this pipeline.
    pub fn gateway(&self) -> UploadGateway {
        UploadGateway::new(self.channel.clone(), self.spool_dir.clone())
            .with_shutdown(self.shutdown.clone())
            .with_events(EventSink::Supervisor(self.supervisor.clone()))
    }

    pub fn is_running(&self) -> bool {
        !self.join.is_finished()
    }

    pub async fn subscribe(&self) -> Result<broadcast::Receiver<IngestEvent>, PipelineError> {
        self.call(|reply| SupervisorMessage::Subscribe { reply }).await
    }

    pub async fn stats(&self) -> Result<PipelineStats, PipelineError> {
        self.call(|reply| SupervisorMessage::GetStats { reply }).await
    }

    /// Stop taking work, let in-flight work finish within the grace period,
    /// then abandon whatever is left.
    ///
    /// Abandoned messages are not acknowledged and will be redelivered.
    pub async fn shutdown(self) -> Result<(), PipelineError> {
        tracing::info!(grace = ?self.grace, "Shutting down pipeline");

        let (tx, rx) = ractor::concurrency::oneshot();
        let drained = match self
            .supervisor
            .send_message(SupervisorMessage::Drain { reply: tx.into() })
        {
            Ok(()) => tokio::time::timeout(self.grace, rx).await.is_ok(),
            Err(_) => true,
        };
        if !drained {
            tracing::warn!("Grace period elapsed, abandoning in-flight work");
        }
        self.abort.cancel();

        self.join
            .await
            .map_err(|e| PipelineError::Unavailable(e.to_string()))?;
        tracing::info!("Pipeline stopped");
        Ok(())
    }

    async fn call<T, F>(&self, build: F) -> Result<T, PipelineError>
    where
        T: Send + 'static,
        F: FnOnce(RpcReplyPort<T>) -> SupervisorMessage,
    {
        match ractor::rpc::call(&self.supervisor, build, Some(RPC_TIMEOUT)).await {
            Ok(CallResult::Success(value)) => Ok(value),
            Ok(CallResult::Timeout) => Err(PipelineError::Timeout),
            Ok(CallResult::SenderError) => Err(PipelineError::Unavailable("reply dropped".into())),
            Err(e) => Err(PipelineError::Unavailable(e.to_string())),
        }
    }
}
