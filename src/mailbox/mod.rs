//! Mailbox access: the session trait the sync loop drives, the connector the
//! pool uses to open sessions, and the IMAP implementation of both.

pub mod imap;
pub mod message;

use async_trait::async_trait;

use crate::error::MailboxError;
use crate::model::Department;

pub use imap::{ImapConnector, ImapMailbox};
pub use message::{AutoReplyHeaders, EmailMessage};

/// An authenticated mailbox session.
#[async_trait]
pub trait MailboxClient: Send {
    /// Open a mailbox for reading and flag changes.
    async fn select(&mut self, mailbox: &str) -> Result<(), MailboxError>;

    /// UIDs of unseen messages in the selected mailbox, in server order.
    async fn search_unseen(&mut self) -> Result<Vec<u32>, MailboxError>;

    /// Full RFC 822 source of a message, or `None` if the UID no longer exists.
    async fn fetch(&mut self, uid: u32) -> Result<Option<Vec<u8>>, MailboxError>;

    /// Add the `\Seen` flag.
    async fn mark_seen(&mut self, uid: u32) -> Result<(), MailboxError>;

    /// Liveness ping.
    async fn noop(&mut self) -> Result<(), MailboxError>;

    async fn logout(&mut self) -> Result<(), MailboxError>;
}

/// Opens sessions for departments.
#[async_trait]
pub trait MailboxConnector: Send + Sync {
    async fn connect(&self, department: &Department)
    -> Result<Box<dyn MailboxClient>, MailboxError>;
}
