//! Worker events, fanned out to any number of subscribers.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::model::Ticket;

/// Default broadcast channel capacity.
const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEvent {
    Started,
    Stopped,
    /// A ticket was created from a department mailbox.
    TicketCreated { department_id: String, ticket: Ticket },
    /// A department could not be synced this tick.
    DepartmentError { department_id: String, error: String },
    /// A whole sync pass failed.
    Error { error: String },
}

/// Broadcast sender for [`WorkerEvent`]s. Sending never blocks and never
/// fails when nobody listens.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<WorkerEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(DEFAULT_EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: WorkerEvent) {
        // ok if no receivers are listening
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
