//! Entry events handed to the listener-dispatch collaborator.

use tokio::sync::mpsc;

use crate::types::Key;
use crate::value::StoredValue;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntryEventType {
    Added,
    Removed,
    Updated,
    Merged,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EntryEvent {
    pub event_type: EntryEventType,
    pub structure: String,
    pub key: Key,
    pub value: Option<StoredValue>,
}

/// Fire-and-forget event sink. Implementations must not block the caller,
/// which is a partition executor.
pub trait EventPublisher: Send + Sync + 'static {
    fn publish_event(&self, event: EntryEvent);
}

pub struct NoopEventPublisher;

impl EventPublisher for NoopEventPublisher {
    fn publish_event(&self, _event: EntryEvent) {}
}

/// Forwards events into an unbounded channel drained by the dispatcher.
pub struct ChannelEventPublisher {
    tx: mpsc::UnboundedSender<EntryEvent>,
}

impl ChannelEventPublisher {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EntryEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventPublisher for ChannelEventPublisher {
    fn publish_event(&self, event: EntryEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("event receiver dropped; discarding entry event");
        }
    }
}
