//! Processing outcome classification.

use serde::{Deserialize, Serialize};

/// Result of attempting to apply one file or message.
///
/// Drives whether the message is deleted (success) or left to expire for
/// redelivery (either failure kind). Permanent failures still reach the
/// dead-letter path through the receive-count ceiling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProcessingOutcome {
    /// Content was durably applied.
    Success,
    /// Failed for a reason that may clear up on a later attempt.
    TransientFailure { reason: String },
    /// Failed for a reason no retry will fix (malformed content, missing blob).
    PermanentFailure { reason: String },
}

impl ProcessingOutcome {
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::TransientFailure {
            reason: reason.into(),
        }
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::PermanentFailure {
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ProcessingOutcome::Success)
    }

    /// Check if another delivery could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProcessingOutcome::TransientFailure { .. })
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            ProcessingOutcome::Success => None,
            ProcessingOutcome::TransientFailure { reason }
            | ProcessingOutcome::PermanentFailure { reason } => Some(reason),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingOutcome::Success => "success",
            ProcessingOutcome::TransientFailure { .. } => "transient_failure",
            ProcessingOutcome::PermanentFailure { .. } => "permanent_failure",
        }
    }
}

impl std::fmt::Display for ProcessingOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.reason() {
            Some(reason) => write!(f, "{}: {}", self.as_str(), reason),
            None => f.write_str(self.as_str()),
        }
    }
}
