//! Ingestion worker.
//!
//! - `helpdesk_worker`: lifecycle (`start`, `stop`, `run_once`, `status`)
//! - `sync`: one pass over every department mailbox
//! - `events`: broadcast of `WorkerEvent`s
//! - `status`: serializable status snapshot

pub mod events;
pub mod helpdesk_worker;
pub mod status;
pub mod sync;

pub use events::{EventBus, WorkerEvent};
pub use helpdesk_worker::HelpdeskWorker;
pub use status::WorkerStatus;
pub use sync::{DepartmentSync, TickReport};
