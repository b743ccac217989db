//! Ticket materializer: turns a fetched email into a persisted ticket.
//!
//! Dedup is by message-id. Numbers come from `max(number) + 1`, which races
//! under concurrent writers; the UNIQUE index on `tickets.number` turns a
//! collision into a `Constraint` error instead of a silent duplicate.

use std::sync::{Arc, LazyLock};

use chrono::Utc;
use regex::Regex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::Error;
use crate::mailbox::EmailMessage;
use crate::model::{Customer, Department, Ticket, TicketMessage, TicketStatus};
use crate::parser::{EmailParser, SkipReason};
use crate::store::HelpdeskStore;

static SENDER_NAME: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(.+?)\s*<").unwrap());
static SENDER_EMAIL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<(.+?)>").unwrap());

/// Requester extracted from a `From` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sender {
    pub name: String,
    pub email: String,
}

/// Parse `"Name" <email>`, `Name <email>` or a bare address.
///
/// Without a display name the local part of the address is used.
pub fn parse_sender(from: &str) -> Option<Sender> {
    let from = from.trim();
    if from.is_empty() {
        return None;
    }

    let email = SENDER_EMAIL
        .captures(from)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_else(|| from.to_string());
    if email.is_empty() || !email.contains('@') {
        return None;
    }

    let name = SENDER_NAME
        .captures(from)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().trim_matches(|c| c == '"' || c == '\'').trim().to_string())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| local_part(&email).to_string());

    Some(Sender { name, email })
}

fn local_part(email: &str) -> &str {
    email.split('@').next().unwrap_or(email)
}

/// Outcome of materializing one email.
#[derive(Debug, Clone)]
pub enum Materialized {
    Created(Ticket),
    /// A ticket already exists for this message-id.
    Duplicate(Ticket),
    Skipped(SkipReason),
}

impl Materialized {
    pub fn ticket(&self) -> Option<&Ticket> {
        match self {
            Self::Created(t) | Self::Duplicate(t) => Some(t),
            Self::Skipped(_) => None,
        }
    }
}

pub struct TicketMaterializer {
    store: Arc<dyn HelpdeskStore>,
    parser: Arc<dyn EmailParser>,
}

impl TicketMaterializer {
    pub fn new(store: Arc<dyn HelpdeskStore>, parser: Arc<dyn EmailParser>) -> Self {
        Self { store, parser }
    }

    pub fn store(&self) -> &Arc<dyn HelpdeskStore> {
        &self.store
    }

    /// Create a ticket (and its first message) for `email` in `department`.
    ///
    /// The caller marks the email seen only after this returns `Ok`.
    pub async fn create_ticket(
        &self,
        email: &EmailMessage,
        department: &Department,
    ) -> Result<Materialized, Error> {
        if let Some(existing) = self.store.find_ticket_by_message_id(&email.message_id).await? {
            debug!(
                message_id = %email.message_id,
                ticket_number = existing.number,
                "Ticket already exists for message"
            );
            self.ensure_first_message(&existing).await?;
            return Ok(Materialized::Duplicate(existing));
        }

        let parsed = self.parser.parse(email);
        if let Err(reason) = self.parser.should_create_ticket(&parsed) {
            info!(
                department_id = %department.id,
                uid = email.uid,
                reason = %reason,
                "Skipping email"
            );
            return Ok(Materialized::Skipped(reason));
        }

        let sender = parse_sender(&email.from).unwrap_or_else(|| Sender {
            name: "Unknown".into(),
            email: email.from.trim().to_string(),
        });

        let customer_id = self.customer_for(&sender.email).await.map(|c| c.id);
        let number = self.store.max_ticket_number().await? + 1;
        let now = Utc::now();

        let ticket = Ticket {
            id: Uuid::new_v4().to_string(),
            number,
            subject: parsed.subject,
            description: parsed.description,
            priority: parsed.priority,
            status: TicketStatus::Open,
            category: parsed.category,
            tags: parsed.tags,
            requester_name: sender.name,
            requester_email: sender.email,
            department_id: department.id.clone(),
            customer_id,
            email_message_id: email.message_id.clone(),
            email_uid: email.uid,
            created_at: now,
        };
        self.store
            .insert_ticket_with_message(&ticket, &first_message(&ticket))
            .await?;

        info!(
            department_id = %department.id,
            ticket_number = ticket.number,
            priority = %ticket.priority,
            requester = %ticket.requester_email,
            "Ticket created from email"
        );
        Ok(Materialized::Created(ticket))
    }

    /// Backfill the first message of a ticket stored without one.
    async fn ensure_first_message(&self, ticket: &Ticket) -> Result<(), Error> {
        if !self.store.list_ticket_messages(&ticket.id).await?.is_empty() {
            return Ok(());
        }
        warn!(
            ticket_number = ticket.number,
            "Ticket has no messages, restoring the first one"
        );
        self.store
            .insert_ticket_message(&first_message(ticket))
            .await?;
        Ok(())
    }

    /// Best-effort lookup; a failing store only loses the association.
    async fn customer_for(&self, email: &str) -> Option<Customer> {
        match self.store.find_customer_by_email(email).await {
            Ok(customer) => customer,
            Err(e) => {
                warn!(email, error = %e, "Customer lookup failed");
                None
            }
        }
    }
}

/// The email body as the opening message of `ticket`'s thread.
fn first_message(ticket: &Ticket) -> TicketMessage {
    TicketMessage {
        id: Uuid::new_v4().to_string(),
        ticket_id: ticket.id.clone(),
        content: ticket.description.clone(),
        sender_name: ticket.requester_name.clone(),
        sender_email: ticket.requester_email.clone(),
        email_message_id: Some(ticket.email_message_id.clone()),
        email_uid: Some(ticket.email_uid),
        is_internal: false,
        created_at: ticket.created_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DatabaseError;
    use crate::parser::KeywordParser;
    use crate::store::LibSqlBackend;
    use secrecy::SecretString;

    fn department() -> Department {
        Department {
            id: "support".into(),
            name: "Support".into(),
            imap_host: Some("imap.example.com".into()),
            imap_port: 993,
            imap_secure: true,
            imap_user: Some("support@example.com".into()),
            imap_password: Some(SecretString::from("pw")),
            sync_interval_secs: 60,
            active: true,
            last_sync: None,
        }
    }

    fn email(uid: u32, message_id: &str, from: &str, subject: &str) -> EmailMessage {
        EmailMessage {
            uid,
            message_id: message_id.into(),
            subject: subject.into(),
            from: from.into(),
            to: vec!["support@example.com".into()],
            date: None,
            text_body: Some("My laptop will not connect to the office network.".into()),
            html_body: None,
            headers: Default::default(),
        }
    }

    /// Delegates to libsql but fails the next `n` atomic ticket writes.
    struct FlakyStore {
        inner: LibSqlBackend,
        failures: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl HelpdeskStore for FlakyStore {
        async fn run_migrations(&self) -> Result<(), DatabaseError> {
            self.inner.run_migrations().await
        }
        async fn active_departments(&self) -> Result<Vec<Department>, DatabaseError> {
            self.inner.active_departments().await
        }
        async fn upsert_department(&self, department: &Department) -> Result<(), DatabaseError> {
            self.inner.upsert_department(department).await
        }
        async fn touch_department_sync(
            &self,
            department_id: &str,
            at: chrono::DateTime<Utc>,
        ) -> Result<(), DatabaseError> {
            self.inner.touch_department_sync(department_id, at).await
        }
        async fn find_ticket_by_message_id(
            &self,
            message_id: &str,
        ) -> Result<Option<Ticket>, DatabaseError> {
            self.inner.find_ticket_by_message_id(message_id).await
        }
        async fn max_ticket_number(&self) -> Result<i64, DatabaseError> {
            self.inner.max_ticket_number().await
        }
        async fn insert_ticket(&self, ticket: &Ticket) -> Result<(), DatabaseError> {
            self.inner.insert_ticket(ticket).await
        }
        async fn insert_ticket_message(&self, message: &TicketMessage) -> Result<(), DatabaseError> {
            self.inner.insert_ticket_message(message).await
        }
        async fn insert_ticket_with_message(
            &self,
            ticket: &Ticket,
            message: &TicketMessage,
        ) -> Result<(), DatabaseError> {
            use std::sync::atomic::Ordering;
            let failing = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(DatabaseError::Query("disk I/O error".into()));
            }
            self.inner.insert_ticket_with_message(ticket, message).await
        }
        async fn list_tickets(
            &self,
            department_id: Option<&str>,
            limit: usize,
        ) -> Result<Vec<Ticket>, DatabaseError> {
            self.inner.list_tickets(department_id, limit).await
        }
        async fn count_tickets(&self) -> Result<i64, DatabaseError> {
            self.inner.count_tickets().await
        }
        async fn list_ticket_messages(
            &self,
            ticket_id: &str,
        ) -> Result<Vec<TicketMessage>, DatabaseError> {
            self.inner.list_ticket_messages(ticket_id).await
        }
        async fn find_customer_by_email(
            &self,
            email: &str,
        ) -> Result<Option<Customer>, DatabaseError> {
            self.inner.find_customer_by_email(email).await
        }
        async fn insert_customer(&self, customer: &Customer) -> Result<(), DatabaseError> {
            self.inner.insert_customer(customer).await
        }
    }

    async fn materializer() -> (TicketMaterializer, Arc<LibSqlBackend>) {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        store.upsert_department(&department()).await.unwrap();
        let m = TicketMaterializer::new(store.clone(), Arc::new(KeywordParser::new()));
        (m, store)
    }

    #[test]
    fn sender_with_quoted_name() {
        let s = parse_sender("\"Jane Doe\" <jane@x.com>").unwrap();
        assert_eq!(s.name, "Jane Doe");
        assert_eq!(s.email, "jane@x.com");
    }

    #[test]
    fn sender_with_bare_name() {
        let s = parse_sender("Jane Doe <jane@x.com>").unwrap();
        assert_eq!(s.name, "Jane Doe");
        assert_eq!(s.email, "jane@x.com");
    }

    #[test]
    fn sender_bare_address_uses_local_part() {
        let s = parse_sender("bob@y.com").unwrap();
        assert_eq!(s.name, "bob");
        assert_eq!(s.email, "bob@y.com");

        let s = parse_sender("<carol@z.com>").unwrap();
        assert_eq!(s.name, "carol");
        assert_eq!(s.email, "carol@z.com");
    }

    #[test]
    fn sender_rejects_garbage() {
        assert!(parse_sender("").is_none());
        assert!(parse_sender("not an address").is_none());
    }

    #[tokio::test]
    async fn numbers_tickets_sequentially() {
        let (m, store) = materializer().await;
        let dept = department();

        let mut numbers = Vec::new();
        for i in 1..=3 {
            let mail = email(i, &format!("m{i}@example.com"), "bob@y.com", "Network problem");
            match m.create_ticket(&mail, &dept).await.unwrap() {
                Materialized::Created(t) => numbers.push(t.number),
                other => panic!("expected a new ticket, got {other:?}"),
            }
        }
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(store.count_tickets().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn duplicate_message_returns_existing_ticket() {
        let (m, store) = materializer().await;
        let dept = department();
        let mail = email(7, "same@example.com", "\"Jane Doe\" <jane@x.com>", "Network problem");

        let first = m.create_ticket(&mail, &dept).await.unwrap();
        let second = m.create_ticket(&mail, &dept).await.unwrap();

        let (Materialized::Created(a), Materialized::Duplicate(b)) = (first, second) else {
            panic!("expected created then duplicate");
        };
        assert_eq!(a.id, b.id);
        assert_eq!(b.requester_name, "Jane Doe");
        assert_eq!(store.count_tickets().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn persists_first_message() {
        let (m, store) = materializer().await;
        let mail = email(9, "first@example.com", "Jane Doe <jane@x.com>", "Network problem");

        let Materialized::Created(ticket) = m.create_ticket(&mail, &department()).await.unwrap()
        else {
            panic!("expected a new ticket");
        };
        let messages = store.list_ticket_messages(&ticket.id).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, ticket.description);
        assert_eq!(messages[0].sender_email, "jane@x.com");
        assert_eq!(messages[0].email_uid, Some(9));
        assert!(!messages[0].is_internal);
    }

    #[tokio::test]
    async fn associates_known_customer() {
        let (m, store) = materializer().await;
        store
            .insert_customer(&Customer {
                id: "cust-1".into(),
                name: "Jane".into(),
                email: "JANE@x.com".into(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let mail = email(1, "c@example.com", "Jane <jane@x.com>", "Network problem");
        let created = m.create_ticket(&mail, &department()).await.unwrap();
        assert_eq!(
            created.ticket().and_then(|t| t.customer_id.clone()),
            Some("cust-1".to_string())
        );
    }

    #[tokio::test]
    async fn skips_auto_replies() {
        let (m, store) = materializer().await;
        let mut mail = email(1, "ooo@example.com", "jane@x.com", "Out of office");
        mail.headers.auto_submitted = Some("auto-replied".into());

        let outcome = m.create_ticket(&mail, &department()).await.unwrap();
        assert!(matches!(outcome, Materialized::Skipped(SkipReason::AutoReply)));
        assert_eq!(store.count_tickets().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_write_leaves_nothing_and_retry_creates_full_ticket() {
        let inner = LibSqlBackend::new_memory().await.unwrap();
        inner.upsert_department(&department()).await.unwrap();
        let store = Arc::new(FlakyStore {
            inner,
            failures: 1.into(),
        });
        let m = TicketMaterializer::new(store.clone(), Arc::new(KeywordParser::new()));
        let mail = email(3, "flaky@example.com", "Jane <jane@x.com>", "Network problem");

        assert!(m.create_ticket(&mail, &department()).await.is_err());
        assert_eq!(store.count_tickets().await.unwrap(), 0);

        let Materialized::Created(ticket) = m.create_ticket(&mail, &department()).await.unwrap()
        else {
            panic!("expected the retried email to create a ticket");
        };
        assert_eq!(ticket.number, 1);
        assert_eq!(store.list_ticket_messages(&ticket.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_restores_missing_first_message() {
        let (m, store) = materializer().await;
        let dept = department();
        let mail = email(5, "orphan@example.com", "Jane <jane@x.com>", "Network problem");

        let Materialized::Created(ticket) = m.create_ticket(&mail, &dept).await.unwrap() else {
            panic!("expected a new ticket");
        };
        // A ticket row without its thread, as left by an older interrupted write.
        let orphan = Ticket {
            id: "orphan".into(),
            number: 2,
            email_message_id: "orphan-2@example.com".into(),
            ..ticket
        };
        store.insert_ticket(&orphan).await.unwrap();

        let mail = email(6, "orphan-2@example.com", "Jane <jane@x.com>", "Network problem");
        let outcome = m.create_ticket(&mail, &dept).await.unwrap();
        assert!(matches!(outcome, Materialized::Duplicate(ref t) if t.id == "orphan"));

        let messages = store.list_ticket_messages("orphan").await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].sender_email, "jane@x.com");

        m.create_ticket(&mail, &dept).await.unwrap();
        assert_eq!(store.list_ticket_messages("orphan").await.unwrap().len(), 1);
    }
}
