//! Email content parsing: turns an [`EmailMessage`] into ticket fields and
//! decides whether the message deserves a ticket at all.

pub mod keyword;
pub mod text;

use serde::Serialize;

use crate::mailbox::EmailMessage;
use crate::model::Priority;

pub use keyword::KeywordParser;

/// Ticket fields extracted from an email.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParsedEmail {
    pub subject: String,
    pub description: String,
    pub priority: Priority,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub is_auto_reply: bool,
    pub is_spam: bool,
}

/// Why a message was not turned into a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AutoReply,
    Spam,
    GenericSubject,
    TooShort,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::AutoReply => "auto-reply",
            Self::Spam => "spam",
            Self::GenericSubject => "generic subject",
            Self::TooShort => "description too short",
        };
        write!(f, "{s}")
    }
}

/// Content parser used by the ticket materializer.
pub trait EmailParser: Send + Sync {
    fn parse(&self, email: &EmailMessage) -> ParsedEmail;

    /// `Err` carries the reason the message should be skipped.
    fn should_create_ticket(&self, parsed: &ParsedEmail) -> Result<(), SkipReason>;
}
