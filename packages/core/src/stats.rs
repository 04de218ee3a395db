//! Running counters for the pipeline.

use serde::{Deserialize, Serialize};

use crate::IngestEvent;

/// Statistics accumulated from pipeline events since startup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineStats {
    /// Files accepted by the local channel.
    pub files_enqueued: u64,
    /// Files that could not be enqueued.
    pub files_rejected: u64,
    /// Files applied by the background worker.
    pub files_processed: u64,
    /// Files that failed or timed out.
    pub files_failed: u64,
    /// Message deliveries received.
    pub messages_received: u64,
    /// Messages applied and deleted.
    pub messages_acknowledged: u64,
    /// Deliveries that failed and were left to expire.
    pub messages_failed: u64,
    /// Messages moved to the dead-letter target.
    pub dead_lettered: u64,
    /// Deletions attempted after the lease lapsed.
    pub acknowledgement_races: u64,
    /// Redeliveries acknowledged without reprocessing.
    pub duplicates_suppressed: u64,
}

impl PipelineStats {
    /// Fold one event into the counters.
    pub fn record(&mut self, event: &IngestEvent) {
        match event {
            IngestEvent::FileEnqueued { .. } => self.files_enqueued += 1,
            IngestEvent::FileRejected { .. } => self.files_rejected += 1,
            IngestEvent::FileProcessed { .. } => self.files_processed += 1,
            IngestEvent::FileFailed { .. } => self.files_failed += 1,
            IngestEvent::MessageReceived { .. } => self.messages_received += 1,
            IngestEvent::MessageAcknowledged { .. } => self.messages_acknowledged += 1,
            IngestEvent::MessageFailed { .. } => self.messages_failed += 1,
            IngestEvent::AcknowledgementRaced { .. } => self.acknowledgement_races += 1,
            IngestEvent::MessageDeadLettered { .. } => self.dead_lettered += 1,
            IngestEvent::DuplicateSuppressed { .. } => self.duplicates_suppressed += 1,
            IngestEvent::ConsumerStarted { .. } | IngestEvent::ConsumerStopped { .. } => {}
        }
    }

    /// Files waiting in the channel or being processed.
    pub fn files_outstanding(&self) -> u64 {
        self.files_enqueued
            .saturating_sub(self.files_processed + self.files_failed)
    }

    /// Message success rate as a percentage of finished deliveries.
    pub fn message_success_rate(&self) -> Option<f64> {
        let total = self.messages_acknowledged + self.messages_failed;
        if total == 0 {
            None
        } else {
            Some((self.messages_acknowledged as f64 / total as f64) * 100.0)
        }
    }
}
