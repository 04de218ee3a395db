//! Message types for actor communication.

use ingest_core::{IngestEvent, PipelineStats};
use ractor::RpcReplyPort;
use tokio::sync::broadcast;

/// Messages for the file worker.
#[derive(Debug)]
pub enum WorkerMessage {
    /// Take the next file from the channel.
    Next,
}

/// Messages for a queue consumer.
#[derive(Debug)]
pub enum ConsumerMessage {
    /// Run one receive cycle.
    Poll,
}

/// Messages for the Supervisor.
#[derive(Debug)]
pub enum SupervisorMessage {
    /// Record an event and fan it out to subscribers.
    Event(IngestEvent),

    Subscribe {
        reply: RpcReplyPort<broadcast::Receiver<IngestEvent>>,
    },

    GetStats { reply: RpcReplyPort<PipelineStats> },

    /// Stop taking new work; reply once every child has stopped.
    Drain { reply: RpcReplyPort<()> },
}
