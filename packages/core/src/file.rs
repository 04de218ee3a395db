//! Pending file types for the local upload path.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unique identifier for a pending file, using ULID for chronological sorting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(pub Ulid);

impl FileId {
    /// Create a new unique file ID.
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for FileId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A result file written to local disk and waiting to be processed.
///
/// A `PendingFile` is deliberately not `Clone`: exactly one party owns it at
/// any time (the producer until the channel accepts it, the worker after),
/// and removing it from disk consumes it.
#[derive(Debug, PartialEq, Eq)]
pub struct PendingFile {
    /// Unique identifier for this file.
    pub id: FileId,
    /// Location of the file on local disk.
    pub path: PathBuf,
    /// When the file was created for enqueueing.
    pub enqueued_at: DateTime<Utc>,
}

impl PendingFile {
    /// Create a pending file for the given path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            id: FileId::new(),
            path: path.into(),
            enqueued_at: Utc::now(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Milliseconds this file has spent waiting since it was created.
    pub fn age_ms(&self) -> u64 {
        (Utc::now() - self.enqueued_at).num_milliseconds().max(0) as u64
    }
}

impl std::fmt::Display for PendingFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.id, self.path.display())
    }
}
