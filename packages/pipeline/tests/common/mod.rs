#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use ingest_core::{BlobReference, IngestEvent, MemoryLedger, ProcessedLedger, RetryPolicy};
use message_queue::{DeadLetterTarget, MemoryQueue, MessageQueue};
use pipeline::{
    ConsumerArgs, ConsumerSettings, EventSink, FnProcessor, ProcessError, ProcessFuture,
    ProcessingSummary, ResultProcessor, ResultSource,
};
use storage::{BlobFetcher, Storage, StorageConfig};
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

pub const BUCKET: &str = "results";

/// Processor whose behaviour is driven by the file content.
///
/// - `fail-transient` / `fail-permanent`: the matching error
/// - `sleep:<secs>`: sleeps on the tokio clock, then succeeds
/// - anything else: succeeds with one record per line
#[derive(Clone, Default)]
pub struct ScriptedProcessor {
    pub seen: Arc<Mutex<Vec<String>>>,
}

impl ScriptedProcessor {
    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }

    pub fn arc(&self) -> Arc<dyn ResultProcessor> {
        let seen = self.seen.clone();
        Arc::new(FnProcessor::new(move |source: ResultSource| -> ProcessFuture {
            let seen = seen.clone();
            Box::pin(async move {
                let text = String::from_utf8_lossy(source.content.get_ref()).into_owned();
                seen.lock().unwrap().push(text.clone());
                if text == "fail-transient" {
                    return Err(ProcessError::Transient("database unavailable".into()));
                }
                if text == "fail-permanent" {
                    return Err(ProcessError::Permanent("unrecognised format".into()));
                }
                if let Some(secs) = text.strip_prefix("sleep:") {
                    let secs: u64 = secs.trim().parse().unwrap_or(1);
                    tokio::time::sleep(Duration::from_secs(secs)).await;
                }
                Ok(ProcessingSummary::records(text.lines().count()))
            })
        }))
    }
}

pub async fn memory_storage() -> Storage {
    Storage::new(StorageConfig::memory()).await.unwrap()
}

pub fn fast_fetcher(storage: Storage) -> BlobFetcher {
    BlobFetcher::new(storage).with_retry(
        RetryPolicy::default()
            .with_max_attempts(2)
            .with_initial_delay(Duration::from_millis(10)),
    )
}

/// Store `content` under `key` and publish a message pointing at it.
pub async fn publish(storage: &Storage, queue: &MemoryQueue, key: &str, content: &str) -> BlobReference {
    let blob = BlobReference::new(BUCKET, key);
    storage
        .put_bytes(&blob, Bytes::from(content.to_string()))
        .await
        .unwrap();
    queue.send(blob.to_message_body()).await.unwrap();
    blob
}

pub fn settings() -> ConsumerSettings {
    ConsumerSettings {
        batch_size: 10,
        visibility_timeout: Duration::from_secs(30),
        wait_time: Duration::ZERO,
        processing_timeout: Duration::from_secs(3),
        max_receive_count: 5,
        extend_visibility: false,
    }
}

pub struct Harness {
    pub queue: Arc<MemoryQueue>,
    pub dead_letters: Arc<MemoryQueue>,
    pub storage: Storage,
    pub processor: ScriptedProcessor,
    pub ledger: Arc<MemoryLedger>,
    pub shutdown: CancellationToken,
    pub events: mpsc::UnboundedReceiver<IngestEvent>,
    sink: EventSink,
}

impl Harness {
    pub async fn new() -> Self {
        let (sink, events) = EventSink::channel();
        Self {
            queue: Arc::new(MemoryQueue::new("primary")),
            dead_letters: Arc::new(MemoryQueue::new("dead-letter")),
            storage: memory_storage().await,
            processor: ScriptedProcessor::default(),
            ledger: Arc::new(MemoryLedger::new()),
            shutdown: CancellationToken::new(),
            events,
            sink,
        }
    }

    pub fn consumer(&self, consumer_id: &str, settings: ConsumerSettings, in_flight: &Arc<Semaphore>) -> ConsumerArgs {
        let queue: Arc<dyn MessageQueue> = self.queue.clone();
        let ledger: Arc<dyn ProcessedLedger> = self.ledger.clone();
        ConsumerArgs {
            consumer_id: consumer_id.to_string(),
            queue,
            dead_letter: DeadLetterTarget::queue(self.dead_letters.clone()),
            fetcher: fast_fetcher(self.storage.clone()),
            processor: self.processor.arc(),
            ledger,
            settings,
            in_flight: in_flight.clone(),
            shutdown: self.shutdown.clone(),
            abort: CancellationToken::new(),
            events: self.sink.clone(),
        }
    }

    /// Wait for the first event matching `pred`, collecting everything seen on the way.
    pub async fn wait_for(&mut self, pred: impl Fn(&IngestEvent) -> bool) -> Vec<IngestEvent> {
        let mut seen = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(600), self.events.recv())
                .await
                .expect("timed out waiting for event")
                .expect("event channel closed");
            let done = pred(&event);
            seen.push(event);
            if done {
                return seen;
            }
        }
    }

    /// Everything emitted so far without waiting.
    pub fn drain_events(&mut self) -> Vec<IngestEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            seen.push(event);
        }
        seen
    }
}

pub fn count(events: &[IngestEvent], pred: impl Fn(&IngestEvent) -> bool) -> usize {
    events.iter().filter(|e| pred(e)).count()
}
