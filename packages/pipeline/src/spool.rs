//! Upload spool: writes uploaded bytes to disk and hands them to the channel.

use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use ingest_core::{FileId, IngestEvent, PendingFile};
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use crate::channel::{ChannelError, FileChannel};
use crate::events::EventSink;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("failed to spool upload to {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The deadline passed (or the pipeline began shutting down) while the channel was full.
    #[error("upload not accepted before its deadline")]
    Cancelled,

    #[error("pipeline is shutting down")]
    Closed,
}

impl GatewayError {
    /// The caller may try again later.
    pub fn is_capacity(&self) -> bool {
        matches!(self, GatewayError::Cancelled)
    }
}

/// Remove a file's spool copy. Consumes it so removal happens once.
pub(crate) async fn discard(file: PendingFile) {
    match tokio::fs::remove_file(&file.path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(file_id = %file.id, path = %file.path.display(), "Spool file already gone");
        }
        Err(e) => {
            tracing::warn!(file_id = %file.id, path = %file.path.display(), error = %e, "Failed to remove spool file");
        }
    }
}

/// Entry point for the synchronous upload path.
#[derive(Clone)]
pub struct UploadGateway {
    channel: FileChannel,
    spool_dir: PathBuf,
    shutdown: CancellationToken,
    events: EventSink,
}

impl UploadGateway {
    pub fn new(channel: FileChannel, spool_dir: impl Into<PathBuf>) -> Self {
        Self {
            channel,
            spool_dir: spool_dir.into(),
            shutdown: CancellationToken::new(),
            events: EventSink::Discard,
        }
    }

    /// Abandon waiting uploads when `shutdown` fires.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn spool_dir(&self) -> &Path {
        &self.spool_dir
    }

    /// Write `content` to the spool directory and enqueue it.
    ///
    /// Waits at most `deadline` for channel capacity. Whatever the failure,
    /// the spool file is removed before returning.
    pub async fn accept(&self, content: Bytes, deadline: Duration) -> Result<FileId, GatewayError> {
        tokio::fs::create_dir_all(&self.spool_dir)
            .await
            .map_err(|source| GatewayError::Write {
                path: self.spool_dir.clone(),
                source,
            })?;

        let path = self.spool_dir.join(format!("{}.upload", Ulid::new()));
        if let Err(source) = tokio::fs::write(&path, &content).await {
            // A partial write may have left something behind.
            let _ = tokio::fs::remove_file(&path).await;
            return Err(GatewayError::Write { path, source });
        }

        let file = PendingFile::new(path);
        let file_id = file.id;
        let display_path = file.path.display().to_string();

        let cancel = self.shutdown.child_token();
        let timer = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                cancel.cancel();
            })
        };
        let result = self.channel.enqueue(file, &cancel).await;
        timer.abort();

        match result {
            Ok(()) => {
                self.events.emit(IngestEvent::FileEnqueued {
                    file_id,
                    path: display_path,
                    timestamp: Utc::now(),
                });
                Ok(file_id)
            }
            Err(e) => {
                let error = match &e {
                    ChannelError::Cancelled(_) => GatewayError::Cancelled,
                    ChannelError::Closed(_) => GatewayError::Closed,
                };
                tracing::warn!(file_id = %file_id, error = %error, "Upload rejected");
                discard(e.into_file()).await;
                self.events.emit(IngestEvent::FileRejected {
                    file_id,
                    reason: error.to_string(),
                    timestamp: Utc::now(),
                });
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::disallowed_methods)]

    use super::*;

    fn spooled(dir: &Path) -> usize {
        std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
    }

    #[tokio::test]
    async fn accepted_upload_is_on_disk_and_queued() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let channel = FileChannel::new(2);
        let (events, mut rx) = EventSink::channel();
        let gateway = UploadGateway::new(channel.clone(), dir.path()).with_events(events);

        let id = gateway
            .accept(Bytes::from_static(b"round,score\n1,21-15\n"), Duration::from_secs(1))
            .await?;

        let file = channel.drain().unwrap().next().await.unwrap();
        assert_eq!(file.id, id);
        assert_eq!(tokio::fs::read(&file.path).await?, b"round,score\n1,21-15\n");
        assert!(matches!(rx.recv().await, Some(IngestEvent::FileEnqueued { .. })));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_on_full_channel_removes_spool_file() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let channel = FileChannel::new(1);
        let (events, mut rx) = EventSink::channel();
        let gateway = UploadGateway::new(channel.clone(), dir.path()).with_events(events);

        gateway.accept(Bytes::from_static(b"a"), Duration::from_secs(1)).await?;
        let err = gateway
            .accept(Bytes::from_static(b"b"), Duration::from_millis(200))
            .await
            .unwrap_err();

        assert!(err.is_capacity());
        assert_eq!(spooled(dir.path()), 1);
        assert!(matches!(rx.recv().await, Some(IngestEvent::FileEnqueued { .. })));
        assert!(matches!(rx.recv().await, Some(IngestEvent::FileRejected { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn closed_channel_removes_spool_file() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let channel = FileChannel::new(4);
        let gateway = UploadGateway::new(channel.clone(), dir.path());
        channel.close("shutdown");

        let err = gateway
            .accept(Bytes::from_static(b"late"), Duration::from_secs(1))
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::Closed));
        assert_eq!(spooled(dir.path()), 0);
        Ok(())
    }

    #[tokio::test]
    async fn shutdown_abandons_waiting_upload() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let channel = FileChannel::new(1);
        let shutdown = CancellationToken::new();
        let gateway = UploadGateway::new(channel.clone(), dir.path()).with_shutdown(shutdown.clone());
        gateway.accept(Bytes::from_static(b"a"), Duration::from_secs(60)).await?;

        let waiting = {
            let gateway = gateway.clone();
            tokio::spawn(async move {
                gateway
                    .accept(Bytes::from_static(b"b"), Duration::from_secs(60))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();

        assert!(matches!(waiting.await?, Err(GatewayError::Cancelled)));
        assert_eq!(spooled(dir.path()), 1);
        Ok(())
    }
}
