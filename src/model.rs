//! Helpdesk data model: departments, customers, tickets and their messages.

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

/// A helpdesk department with its own IMAP mailbox.
#[derive(Debug, Clone)]
pub struct Department {
    pub id: String,
    pub name: String,
    pub imap_host: Option<String>,
    pub imap_port: u16,
    /// Implicit TLS when true, plain TCP otherwise.
    pub imap_secure: bool,
    pub imap_user: Option<String>,
    pub imap_password: Option<SecretString>,
    /// Per-department poll interval as stored; the worker ticks globally.
    pub sync_interval_secs: u64,
    pub active: bool,
    pub last_sync: Option<DateTime<Utc>>,
}

impl Department {
    /// Whether host, user and password are all present and non-empty.
    pub fn is_configured(&self) -> bool {
        let filled = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
        filled(&self.imap_host)
            && filled(&self.imap_user)
            && self
                .imap_password
                .as_ref()
                .is_some_and(|p| !p.expose_secret().is_empty())
    }
}

/// Ticket priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "urgent" => Some(Self::Urgent),
            _ => None,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ticket lifecycle status. Ingestion only ever creates `Open` tickets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    #[default]
    Open,
    InProgress,
    Waiting,
    Resolved,
    Closed,
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Waiting => "waiting",
            Self::Resolved => "resolved",
            Self::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(Self::Open),
            "in_progress" => Some(Self::InProgress),
            "waiting" => Some(Self::Waiting),
            "resolved" => Some(Self::Resolved),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }
}

/// A known customer, looked up by exact email.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Customer {
    pub id: String,
    pub name: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

/// A persisted helpdesk ticket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    pub id: String,
    /// Global sequential number, starting at 1.
    pub number: i64,
    pub subject: String,
    pub description: String,
    pub priority: Priority,
    pub status: TicketStatus,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub requester_name: String,
    pub requester_email: String,
    pub department_id: String,
    pub customer_id: Option<String>,
    /// Originating `Message-ID`; unique across tickets.
    pub email_message_id: String,
    pub email_uid: u32,
    pub created_at: DateTime<Utc>,
}

/// A message on a ticket's thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketMessage {
    pub id: String,
    pub ticket_id: String,
    pub content: String,
    pub sender_name: String,
    pub sender_email: String,
    pub email_message_id: Option<String>,
    pub email_uid: Option<u32>,
    pub is_internal: bool,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn department() -> Department {
        Department {
            id: "support".into(),
            name: "Support".into(),
            imap_host: Some("imap.example.com".into()),
            imap_port: 993,
            imap_secure: true,
            imap_user: Some("support@example.com".into()),
            imap_password: Some(SecretString::from("hunter2")),
            sync_interval_secs: 60,
            active: true,
            last_sync: None,
        }
    }

    #[test]
    fn configured_requires_credentials() {
        assert!(department().is_configured());

        let mut dept = department();
        dept.imap_password = Some(SecretString::from(""));
        assert!(!dept.is_configured());

        let mut dept = department();
        dept.imap_host = Some("  ".into());
        assert!(!dept.is_configured());
    }

    #[test]
    fn priority_round_trips_through_text() {
        for p in [Priority::Low, Priority::Medium, Priority::High, Priority::Urgent] {
            assert_eq!(Priority::parse(p.as_str()), Some(p));
        }
        assert_eq!(Priority::default(), Priority::Medium);
    }
}
