//! Result processor contract shared by the upload and queue paths.

use std::future::Future;
use std::io::Cursor;
use std::path::PathBuf;
use std::pin::Pin;

use bytes::Bytes;
use ingest_core::{BlobReference, FileId, MessageId, ProcessingOutcome};

/// Where a result file came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultOrigin {
    Upload { file_id: FileId, path: PathBuf },
    Blob { message_id: MessageId, blob: BlobReference },
}

impl std::fmt::Display for ResultOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResultOrigin::Upload { file_id, .. } => write!(f, "upload {}", file_id),
            ResultOrigin::Blob { blob, .. } => write!(f, "blob {}", blob),
        }
    }
}

/// A result file ready to be parsed.
#[derive(Debug)]
pub struct ResultSource {
    pub origin: ResultOrigin,
    /// Entire file content, seekable.
    pub content: Cursor<Bytes>,
}

impl ResultSource {
    pub fn new(origin: ResultOrigin, content: Bytes) -> Self {
        Self {
            origin,
            content: Cursor::new(content),
        }
    }

    pub fn len(&self) -> usize {
        self.content.get_ref().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What the processor applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessingSummary {
    /// Number of result records applied.
    pub records: usize,
}

impl ProcessingSummary {
    pub fn records(records: usize) -> Self {
        Self { records }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessError {
    /// Worth retrying later (database briefly unavailable and the like).
    #[error("transient processing failure: {0}")]
    Transient(String),

    /// The content itself is unusable.
    #[error("permanent processing failure: {0}")]
    Permanent(String),
}

impl ProcessError {
    pub fn outcome(&self) -> ProcessingOutcome {
        match self {
            ProcessError::Transient(reason) => ProcessingOutcome::transient(reason.clone()),
            ProcessError::Permanent(reason) => ProcessingOutcome::permanent(reason.clone()),
        }
    }
}

pub type ProcessResult = Result<ProcessingSummary, ProcessError>;

/// Future type for async processors.
pub type ProcessFuture = Pin<Box<dyn Future<Output = ProcessResult> + Send>>;

/// Parses a result file and durably applies its records.
///
/// Must be safe to call again for content it has already applied: the queue
/// path delivers at least once.
pub trait ResultProcessor: Send + Sync + 'static {
    fn process(&self, source: ResultSource) -> ProcessFuture;
}

/// A function-based processor.
pub struct FnProcessor<F>
where
    F: Fn(ResultSource) -> ProcessFuture + Send + Sync + 'static,
{
    processor: F,
}

impl<F> FnProcessor<F>
where
    F: Fn(ResultSource) -> ProcessFuture + Send + Sync + 'static,
{
    pub fn new(processor: F) -> Self {
        Self { processor }
    }
}

impl<F> ResultProcessor for FnProcessor<F>
where
    F: Fn(ResultSource) -> ProcessFuture + Send + Sync + 'static,
{
    fn process(&self, source: ResultSource) -> ProcessFuture {
        (self.processor)(source)
    }
}

/// Build a [`FnProcessor`] from an async block over the source.
#[macro_export]
macro_rules! result_processor {
    (|$source:ident| $body:expr) => {
        $crate::FnProcessor::new(|$source: $crate::ResultSource| {
            Box::pin(async move {
                let result: $crate::ProcessResult = $body;
                result
            })
        })
    };
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::*;

    #[tokio::test]
    async fn fn_processor_reads_content() -> Result<(), ProcessError> {
        let processor = result_processor!(|source| {
            let mut source = source;
            let mut text = String::new();
            source
                .content
                .read_to_string(&mut text)
                .map_err(|e| ProcessError::Permanent(e.to_string()))?;
            Ok(ProcessingSummary::records(text.lines().count()))
        });

        let source = ResultSource::new(
            ResultOrigin::Blob {
                message_id: MessageId::new("m"),
                blob: BlobReference::new("b", "k"),
            },
            Bytes::from_static(b"court,home,away\n1,6-4,4-6\n2,7-5,6-3\n"),
        );
        assert_eq!(processor.process(source).await?, ProcessingSummary::records(3));
        Ok(())
    }

    #[test]
    fn errors_map_to_outcomes() {
        assert!(ProcessError::Transient("db".into()).outcome().is_retryable());
        assert!(!ProcessError::Permanent("bad csv".into()).outcome().is_retryable());
    }
}
