//! Helpdesk ingestion: turns department mailboxes into helpdesk tickets.

pub mod config;
pub mod error;
pub mod mailbox;
pub mod model;
pub mod parser;
pub mod pool;
pub mod retry;
pub mod store;
pub mod ticket;
pub mod worker;
