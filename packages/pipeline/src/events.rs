//! Where pipeline components report [`IngestEvent`]s.

use ingest_core::IngestEvent;
use ractor::ActorRef;
use tokio::sync::mpsc;

use crate::messages::SupervisorMessage;

#[derive(Clone, Default)]
pub enum EventSink {
    /// Relay through the supervisor, which keeps stats and fans out to subscribers.
    Supervisor(ActorRef<SupervisorMessage>),
    /// Deliver straight to a channel.
    Channel(mpsc::UnboundedSender<IngestEvent>),
    #[default]
    Discard,
}

impl EventSink {
    /// A sink plus the receiver that observes it.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<IngestEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventSink::Channel(tx), rx)
    }

    pub fn emit(&self, event: IngestEvent) {
        // A stopped supervisor or dropped receiver just means nobody is listening.
        match self {
            EventSink::Supervisor(supervisor) => {
                let _ = supervisor.send_message(SupervisorMessage::Event(event));
            }
            EventSink::Channel(tx) => {
                let _ = tx.send(event);
            }
            EventSink::Discard => {}
        }
    }
}
