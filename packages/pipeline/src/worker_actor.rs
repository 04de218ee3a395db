//! Background worker for the local upload path.
//!
//! Exactly one worker owns the [`FileDrain`], so a file is never read by two
//! workers. Files are handled one at a time; each is removed from disk once,
//! whatever the outcome.
//!
//! Closing the channel lets the worker finish every accepted upload before it
//! stops. Only the abort token makes it give up on files still waiting.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use ingest_core::{IngestEvent, PendingFile};
use ractor::{Actor, ActorProcessingErr, ActorRef};
use tokio_util::sync::CancellationToken;

use crate::channel::FileDrain;
use crate::events::EventSink;
use crate::messages::WorkerMessage;
use crate::processor::{ResultOrigin, ResultProcessor, ResultSource};
use crate::spool::discard;

/// Worker actor arguments.
pub struct WorkerArgs {
    pub drain: FileDrain,
    pub processor: Arc<dyn ResultProcessor>,
    pub processing_timeout: Duration,
    /// Give up on waiting files once cancelled. The current file is finished first.
    pub abort: CancellationToken,
    pub events: EventSink,
}

/// State for the worker actor.
pub struct WorkerActorState {
    drain: FileDrain,
    processor: Arc<dyn ResultProcessor>,
    processing_timeout: Duration,
    abort: CancellationToken,
    events: EventSink,
    processed: u64,
}

impl WorkerActorState {
    async fn handle_file(&mut self, file: PendingFile) {
        let started = Instant::now();
        let file_id = file.id;
        tracing::debug!(file_id = %file_id, waited_ms = file.age_ms(), "Processing upload");

        let failure = match tokio::fs::read(&file.path).await {
            Err(e) => Some((format!("failed to read upload: {}", e), false)),
            Ok(content) => {
                let source = ResultSource::new(
                    ResultOrigin::Upload {
                        file_id,
                        path: file.path.clone(),
                    },
                    Bytes::from(content),
                );
                match tokio::time::timeout(self.processing_timeout, self.processor.process(source))
                    .await
                {
                    Ok(Ok(summary)) => {
                        tracing::info!(file_id = %file_id, records = summary.records, "Upload applied");
                        None
                    }
                    Ok(Err(e)) => Some((e.to_string(), false)),
                    Err(_) => Some((
                        format!("timed out after {:?}", self.processing_timeout),
                        true,
                    )),
                }
            }
        };

        discard(file).await;
        self.processed += 1;

        let event = match failure {
            None => IngestEvent::FileProcessed {
                file_id,
                duration_ms: started.elapsed().as_millis() as u64,
                timestamp: Utc::now(),
            },
            Some((error, timed_out)) => {
                tracing::warn!(file_id = %file_id, error = %error, timed_out, "Upload failed");
                IngestEvent::FileFailed {
                    file_id,
                    error,
                    timed_out,
                    timestamp: Utc::now(),
                }
            }
        };
        self.events.emit(event);
    }
}

/// Worker actor that drains the local channel.
pub struct WorkerActor;

impl Actor for WorkerActor {
    type Msg = WorkerMessage;
    type State = WorkerActorState;
    type Arguments = WorkerArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(timeout = ?args.processing_timeout, "Starting upload worker");
        myself.send_message(WorkerMessage::Next)?;

        Ok(WorkerActorState {
            drain: args.drain,
            processor: args.processor,
            processing_timeout: args.processing_timeout,
            abort: args.abort,
            events: args.events,
            processed: 0,
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            WorkerMessage::Next => {
                let abort = state.abort.clone();
                let next = tokio::select! {
                    biased;
                    _ = abort.cancelled() => None,
                    file = state.drain.next() => file,
                };

                match next {
                    Some(file) => {
                        state.handle_file(file).await;
                        myself.send_message(WorkerMessage::Next)?;
                    }
                    None => myself.stop(Some("local channel finished".into())),
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
        let leftover = state.drain.take_remaining().await;
        if !leftover.is_empty() {
            tracing::warn!(count = leftover.len(), "Discarding uploads abandoned at abort");
        }
        for file in leftover {
            let file_id = file.id;
            discard(file).await;
            state.events.emit(IngestEvent::FileFailed {
                file_id,
                error: "abandoned at shutdown before processing".into(),
                timed_out: false,
                timestamp: Utc::now(),
            });
        }

        tracing::info!(processed = state.processed, "Upload worker stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::disallowed_methods)]

    use std::path::Path;
    use std::sync::Mutex;

    use super::*;
    use crate::channel::FileChannel;
    use crate::processor::{FnProcessor, ProcessError, ProcessFuture, ProcessingSummary};

    async fn spool(dir: &Path, name: &str, content: &str) -> PendingFile {
        let path = dir.join(name);
        tokio::fs::write(&path, content).await.unwrap();
        PendingFile::new(path)
    }

    /// Processor that records content and behaves according to it.
    fn scripted(seen: Arc<Mutex<Vec<String>>>) -> Arc<dyn ResultProcessor> {
        Arc::new(FnProcessor::new(move |source: ResultSource| -> ProcessFuture {
            let seen = seen.clone();
            Box::pin(async move {
                let text = String::from_utf8_lossy(source.content.get_ref()).into_owned();
                seen.lock().unwrap().push(text.clone());
                match text.as_str() {
                    "bad" => Err(ProcessError::Permanent("unparseable".into())),
                    "slow" => {
                        tokio::time::sleep(Duration::from_secs(10)).await;
                        Ok(ProcessingSummary::records(1))
                    }
                    _ => Ok(ProcessingSummary::records(1)),
                }
            })
        }))
    }

    #[tokio::test]
    async fn every_file_is_removed_once_whatever_the_outcome() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let channel = FileChannel::new(4);
        let cancel = CancellationToken::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (events, mut rx) = EventSink::channel();

        for (name, content) in [("1", "good"), ("2", "bad"), ("3", "slow"), ("4", "good")] {
            channel.enqueue(spool(dir.path(), name, content).await, &cancel).await?;
        }
        channel.close("test");

        let (_worker, handle) = Actor::spawn(
            None,
            WorkerActor,
            WorkerArgs {
                drain: channel.drain().unwrap(),
                processor: scripted(seen.clone()),
                processing_timeout: Duration::from_millis(100),
                abort: CancellationToken::new(),
                events,
            },
        )
        .await?;
        handle.await?;

        assert_eq!(*seen.lock().unwrap(), vec!["good", "bad", "slow", "good"]);
        assert_eq!(std::fs::read_dir(dir.path())?.count(), 0);

        let mut outcomes = Vec::new();
        while let Ok(event) = rx.try_recv() {
            outcomes.push(match event {
                IngestEvent::FileProcessed { .. } => "ok",
                IngestEvent::FileFailed { timed_out: true, .. } => "timeout",
                IngestEvent::FileFailed { .. } => "failed",
                _ => "other",
            });
        }
        assert_eq!(outcomes, vec!["ok", "failed", "timeout", "ok"]);
        Ok(())
    }

    #[tokio::test]
    async fn missing_file_is_a_failure_not_a_crash() -> Result<(), Box<dyn std::error::Error>> {
        let channel = FileChannel::new(2);
        let cancel = CancellationToken::new();
        channel.enqueue(PendingFile::new("/nonexistent/upload.csv"), &cancel).await?;
        channel.close("test");
        let (events, mut rx) = EventSink::channel();

        let (_worker, handle) = Actor::spawn(
            None,
            WorkerActor,
            WorkerArgs {
                drain: channel.drain().unwrap(),
                processor: scripted(Arc::new(Mutex::new(Vec::new()))),
                processing_timeout: Duration::from_secs(1),
                abort: CancellationToken::new(),
                events,
            },
        )
        .await?;
        handle.await?;

        assert!(matches!(rx.try_recv(), Ok(IngestEvent::FileFailed { timed_out: false, .. })));
        Ok(())
    }

    #[tokio::test]
    async fn abort_discards_waiting_files() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let channel = FileChannel::new(4);
        let cancel = CancellationToken::new();
        for name in ["1", "2"] {
            channel.enqueue(spool(dir.path(), name, "good").await, &cancel).await?;
        }
        let seen = Arc::new(Mutex::new(Vec::new()));
        let abort = CancellationToken::new();
        abort.cancel();

        let (_worker, handle) = Actor::spawn(
            None,
            WorkerActor,
            WorkerArgs {
                drain: channel.drain().unwrap(),
                processor: scripted(seen.clone()),
                processing_timeout: Duration::from_secs(1),
                abort,
                events: EventSink::Discard,
            },
        )
        .await?;
        handle.await?;

        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(std::fs::read_dir(dir.path())?.count(), 0);
        assert!(matches!(
            channel.enqueue(PendingFile::new("late"), &cancel).await,
            Err(crate::channel::ChannelError::Closed(_))
        ));
        Ok(())
    }
}
