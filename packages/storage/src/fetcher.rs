//! Blob fetcher with bounded retry.

use std::future::Future;
use std::io::Cursor;

use bytes::Bytes;
use ingest_core::{BlobReference, RetryPolicy};
use tokio_util::sync::CancellationToken;

use crate::{Storage, StorageError};

/// Fetched object content, readable and seekable in memory.
pub type BlobStream = Cursor<Bytes>;

/// Fetch failures, classified for the queue consumer.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("blob not found: {0}")]
    NotFound(BlobReference),

    #[error("blob {blob} unavailable after {attempts} attempts: {source}")]
    Transient {
        blob: BlobReference,
        attempts: u32,
        #[source]
        source: StorageError,
    },

    #[error("blob {blob} rejected: {source}")]
    Rejected {
        blob: BlobReference,
        #[source]
        source: StorageError,
    },

    #[error("fetch cancelled")]
    Cancelled,
}

impl FetchError {
    /// Retrying the message will not help.
    pub fn is_permanent(&self) -> bool {
        matches!(self, FetchError::NotFound(_) | FetchError::Rejected { .. })
    }
}

/// Retrieves referenced result files into memory.
#[derive(Clone)]
pub struct BlobFetcher {
    storage: Storage,
    retry: RetryPolicy,
}

impl BlobFetcher {
    pub fn new(storage: Storage) -> Self {
        Self {
            storage,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Fetch a blob, retrying transient storage errors with backoff.
    ///
    /// `NotFound` and malformed references fail immediately.
    pub async fn fetch(
        &self,
        blob: &BlobReference,
        cancel: &CancellationToken,
    ) -> Result<BlobStream, FetchError> {
        let bytes = with_retry(&self.retry, cancel, || self.storage.get_bytes(blob))
            .await
            .map_err(|failure| match failure {
                RetryFailure::Cancelled => FetchError::Cancelled,
                RetryFailure::Exhausted { error, .. } if error.is_not_found() => {
                    FetchError::NotFound(blob.clone())
                }
                RetryFailure::Exhausted { attempts, error } if error.is_transient() => {
                    FetchError::Transient {
                        blob: blob.clone(),
                        attempts,
                        source: error,
                    }
                }
                RetryFailure::Exhausted { error, .. } => FetchError::Rejected {
                    blob: blob.clone(),
                    source: error,
                },
            })?;

        tracing::debug!(blob = %blob, bytes = bytes.len(), "Fetched blob");
        Ok(Cursor::new(bytes))
    }
}

enum RetryFailure {
    Cancelled,
    Exhausted { attempts: u32, error: StorageError },
}

/// Run `op` until it succeeds, fails permanently, or the policy runs out.
async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, RetryFailure>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryFailure::Cancelled),
            result = op() => result,
        };

        let error = match result {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        if !error.is_transient() || !policy.should_retry(attempt) {
            return Err(RetryFailure::Exhausted { attempts: attempt, error });
        }

        let delay = policy.delay_for(attempt);
        tracing::warn!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Transient storage error, retrying"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryFailure::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
