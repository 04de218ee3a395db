//! Bounded local channel between upload producers and the background worker.
//!
//! Many producers, one reader. Producers wait for capacity; a full channel
//! pushes latency back onto the upload path instead of growing without bound.

use std::sync::{Arc, Mutex};

use futures_util::Stream;
use ingest_core::PendingFile;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Default bound used by [`ingest_core::PipelineConfig`].
pub const DEFAULT_CAPACITY: usize = 100;

/// Enqueue failures. The file is handed back so its owner can remove it.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("enqueue cancelled for {0}")]
    Cancelled(PendingFile),

    #[error("channel closed, rejected {0}")]
    Closed(PendingFile),
}

impl ChannelError {
    /// Take back ownership of the rejected file.
    pub fn into_file(self) -> PendingFile {
        match self {
            ChannelError::Cancelled(file) | ChannelError::Closed(file) => file,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ChannelError::Cancelled(_))
    }
}

struct Shared {
    capacity: usize,
    closed: CancellationToken,
    receiver: Mutex<Option<mpsc::Receiver<PendingFile>>>,
}

/// Producer handle. Cheap to clone.
#[derive(Clone)]
pub struct FileChannel {
    sender: mpsc::Sender<PendingFile>,
    shared: Arc<Shared>,
}

impl FileChannel {
    /// # Panics
    ///
    /// Panics if `capacity` is zero; configuration validation rejects that first.
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity);
        Self {
            sender,
            shared: Arc::new(Shared {
                capacity,
                closed: CancellationToken::new(),
                receiver: Mutex::new(Some(receiver)),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Files buffered or about to be (reserved slots included).
    pub fn len(&self) -> usize {
        self.shared.capacity - self.sender.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Hand `file` to the worker, waiting for space if the channel is full.
    ///
    /// Returns as soon as either space frees up, `cancel` fires or the channel
    /// closes. On error the caller still owns the file.
    pub async fn enqueue(
        &self,
        file: PendingFile,
        cancel: &CancellationToken,
    ) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed(file));
        }

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ChannelError::Cancelled(file)),
            _ = self.shared.closed.cancelled() => return Err(ChannelError::Closed(file)),
            permit = self.sender.reserve() => match permit {
                Ok(permit) => permit,
                Err(_) => return Err(ChannelError::Closed(file)),
            },
        };

        tracing::debug!(file_id = %file.id, path = %file.path.display(), "File enqueued");
        permit.send(file);
        Ok(())
    }

    /// Stop accepting files. Already buffered files are still drained.
    pub fn close(&self, reason: &str) {
        if !self.shared.closed.is_cancelled() {
            tracing::info!(reason, buffered = self.len(), "Closing local channel");
            self.shared.closed.cancel();
        }
    }

    /// Take the single reader side. Returns `None` once it has been taken.
    pub fn drain(&self) -> Option<FileDrain> {
        let receiver = self
            .shared
            .receiver
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()?;

        Some(FileDrain {
            receiver,
            closed: self.shared.closed.clone(),
            sealed: false,
        })
    }
}

/// The reader side of a [`FileChannel`]: files in enqueue order.
pub struct FileDrain {
    receiver: mpsc::Receiver<PendingFile>,
    closed: CancellationToken,
    sealed: bool,
}

impl FileDrain {
    /// Next file, or `None` once the channel is closed and empty.
    pub async fn next(&mut self) -> Option<PendingFile> {
        if !self.sealed {
            tokio::select! {
                biased;
                file = self.receiver.recv() => return file,
                _ = self.closed.cancelled() => self.seal(),
            }
        }
        // Sealed: buffered files and in-progress sends still arrive, then None.
        self.receiver.recv().await
    }

    /// Seal the channel and take every file still in it.
    ///
    /// Waits for producers that already reserved a slot, so nothing can land
    /// after the last file is returned.
    pub async fn take_remaining(&mut self) -> Vec<PendingFile> {
        self.seal();
        let mut files = Vec::new();
        while let Some(file) = self.receiver.recv().await {
            files.push(file);
        }
        files
    }

    pub fn into_stream(self) -> impl Stream<Item = PendingFile> + Send {
        futures_util::stream::unfold(self, |mut drain| async move {
            drain.next().await.map(|file| (file, drain))
        })
    }

    fn seal(&mut self) {
        if !self.sealed {
            self.receiver.close();
            self.sealed = true;
        }
    }
}
