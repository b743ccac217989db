//! libSQL backend: async `HelpdeskStore` implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};

use crate::error::DatabaseError;
use crate::model::{Customer, Department, Priority, Ticket, TicketMessage, TicketStatus};
use crate::store::migrations;
use crate::store::traits::HelpdeskStore;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_int(n: Option<i64>) -> libsql::Value {
    match n {
        Some(n) => libsql::Value::Integer(n),
        None => libsql::Value::Null,
    }
}

/// Map an insert failure, separating unique-constraint violations.
fn insert_error(op: &str, e: libsql::Error) -> DatabaseError {
    let message = e.to_string();
    if message.contains("UNIQUE constraint failed") {
        DatabaseError::Constraint(format!("{op}: {message}"))
    } else {
        DatabaseError::Query(format!("{op}: {message}"))
    }
}

async fn insert_ticket_row(conn: &Connection, ticket: &Ticket) -> Result<(), DatabaseError> {
    let tags = serde_json::to_string(&ticket.tags)
        .map_err(|e| DatabaseError::Query(format!("insert_ticket: tags: {e}")))?;
    conn.execute(
        &format!(
            "INSERT INTO tickets ({TICKET_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
        ),
        params![
            ticket.id.as_str(),
            ticket.number,
            ticket.subject.as_str(),
            ticket.description.as_str(),
            ticket.priority.as_str(),
            ticket.status.as_str(),
            opt_text(ticket.category.as_deref()),
            tags,
            ticket.requester_name.as_str(),
            ticket.requester_email.as_str(),
            ticket.department_id.as_str(),
            opt_text(ticket.customer_id.as_deref()),
            ticket.email_message_id.as_str(),
            i64::from(ticket.email_uid),
            ticket.created_at.to_rfc3339(),
        ],
    )
    .await
    .map_err(|e| insert_error("insert_ticket", e))?;
    Ok(())
}

async fn insert_message_row(conn: &Connection, message: &TicketMessage) -> Result<(), DatabaseError> {
    conn.execute(
        &format!(
            "INSERT INTO ticket_messages ({TICKET_MESSAGE_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
        ),
        params![
            message.id.as_str(),
            message.ticket_id.as_str(),
            message.content.as_str(),
            message.sender_name.as_str(),
            message.sender_email.as_str(),
            opt_text(message.email_message_id.as_deref()),
            opt_int(message.email_uid.map(i64::from)),
            i64::from(message.is_internal),
            message.created_at.to_rfc3339(),
        ],
    )
    .await
    .map_err(|e| insert_error("insert_ticket_message", e))?;
    Ok(())
}

fn row_to_department(row: &libsql::Row) -> Result<Department, libsql::Error> {
    let port: i64 = row.get(3)?;
    let secure: i64 = row.get(4)?;
    let password: Option<String> = row.get(6).ok();
    let interval: i64 = row.get(7)?;
    let active: i64 = row.get(8)?;
    let last_sync: Option<String> = row.get(9).ok();

    Ok(Department {
        id: row.get(0)?,
        name: row.get(1)?,
        imap_host: row.get(2).ok(),
        imap_port: u16::try_from(port).unwrap_or(993),
        imap_secure: secure != 0,
        imap_user: row.get(5).ok(),
        imap_password: password.map(SecretString::from),
        sync_interval_secs: u64::try_from(interval).unwrap_or(60),
        active: active != 0,
        last_sync: parse_optional_datetime(&last_sync),
    })
}

fn row_to_ticket(row: &libsql::Row) -> Result<Ticket, libsql::Error> {
    let priority: String = row.get(4)?;
    let status: String = row.get(5)?;
    let tags: String = row.get(7)?;
    let uid: i64 = row.get(13)?;
    let created: String = row.get(14)?;

    Ok(Ticket {
        id: row.get(0)?,
        number: row.get(1)?,
        subject: row.get(2)?,
        description: row.get(3)?,
        priority: Priority::parse(&priority).unwrap_or_default(),
        status: TicketStatus::parse(&status).unwrap_or_default(),
        category: row.get(6).ok(),
        tags: serde_json::from_str(&tags).unwrap_or_default(),
        requester_name: row.get(8)?,
        requester_email: row.get(9)?,
        department_id: row.get(10)?,
        customer_id: row.get(11).ok(),
        email_message_id: row.get(12)?,
        email_uid: u32::try_from(uid).unwrap_or_default(),
        created_at: parse_datetime(&created),
    })
}

fn row_to_ticket_message(row: &libsql::Row) -> Result<TicketMessage, libsql::Error> {
    let uid: Option<i64> = row.get(6).ok();
    let internal: i64 = row.get(7)?;
    let created: String = row.get(8)?;

    Ok(TicketMessage {
        id: row.get(0)?,
        ticket_id: row.get(1)?,
        content: row.get(2)?,
        sender_name: row.get(3)?,
        sender_email: row.get(4)?,
        email_message_id: row.get(5).ok(),
        email_uid: uid.and_then(|u| u32::try_from(u).ok()),
        is_internal: internal != 0,
        created_at: parse_datetime(&created),
    })
}

fn row_to_customer(row: &libsql::Row) -> Result<Customer, libsql::Error> {
    let created: String = row.get(3)?;
    Ok(Customer {
        id: row.get(0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        created_at: parse_datetime(&created),
    })
}

// ── Trait implementation ────────────────────────────────────────────

const DEPARTMENT_COLUMNS: &str = "id, name, imap_host, imap_port, imap_secure, imap_user, imap_password, sync_interval_secs, active, last_sync";

const TICKET_COLUMNS: &str = "id, number, subject, description, priority, status, category, tags, requester_name, requester_email, department_id, customer_id, email_message_id, email_uid, created_at";

const TICKET_MESSAGE_COLUMNS: &str = "id, ticket_id, content, sender_name, sender_email, email_message_id, email_uid, is_internal, created_at";

#[async_trait]
impl HelpdeskStore for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Departments ─────────────────────────────────────────────────

    async fn active_departments(&self) -> Result<Vec<Department>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {DEPARTMENT_COLUMNS} FROM departments
                     WHERE active = 1
                       AND TRIM(COALESCE(imap_host, '')) != ''
                       AND TRIM(COALESCE(imap_user, '')) != ''
                       AND COALESCE(imap_password, '') != ''
                     ORDER BY name ASC"
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("active_departments: {e}")))?;

        let mut departments = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("active_departments: {e}")))?
        {
            match row_to_department(&row) {
                Ok(dept) => departments.push(dept),
                Err(e) => warn!("Skipping department row: {e}"),
            }
        }
        Ok(departments)
    }

    async fn upsert_department(&self, department: &Department) -> Result<(), DatabaseError> {
        let conn = self.conn();
        let password = department
            .imap_password
            .as_ref()
            .map(|p| p.expose_secret().to_string());
        conn.execute(
            "INSERT INTO departments (id, name, imap_host, imap_port, imap_secure, imap_user,
                imap_password, sync_interval_secs, active, last_sync)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                imap_host = excluded.imap_host,
                imap_port = excluded.imap_port,
                imap_secure = excluded.imap_secure,
                imap_user = excluded.imap_user,
                imap_password = excluded.imap_password,
                sync_interval_secs = excluded.sync_interval_secs,
                active = excluded.active,
                updated_at = datetime('now')",
            params![
                department.id.as_str(),
                department.name.as_str(),
                opt_text(department.imap_host.as_deref()),
                i64::from(department.imap_port),
                i64::from(department.imap_secure),
                opt_text(department.imap_user.as_deref()),
                opt_text(password.as_deref()),
                i64::try_from(department.sync_interval_secs).unwrap_or(i64::MAX),
                i64::from(department.active),
                opt_text(department.last_sync.map(|t| t.to_rfc3339()).as_deref()),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("upsert_department: {e}")))?;

        debug!(department_id = %department.id, "Department upserted");
        Ok(())
    }

    async fn touch_department_sync(
        &self,
        department_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn();
        let updated = conn
            .execute(
                "UPDATE departments SET last_sync = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![at.to_rfc3339(), department_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("touch_department_sync: {e}")))?;

        if updated == 0 {
            return Err(DatabaseError::NotFound {
                entity: "department".into(),
                id: department_id.to_string(),
            });
        }
        Ok(())
    }

    // ── Tickets ─────────────────────────────────────────────────────

    async fn find_ticket_by_message_id(
        &self,
        message_id: &str,
    ) -> Result<Option<Ticket>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!("SELECT {TICKET_COLUMNS} FROM tickets WHERE email_message_id = ?1"),
                params![message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_ticket_by_message_id: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let ticket = row_to_ticket(&row)
                    .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
                Ok(Some(ticket))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!(
                "find_ticket_by_message_id: {e}"
            ))),
        }
    }

    async fn max_ticket_number(&self) -> Result<i64, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query("SELECT COALESCE(MAX(number), 0) FROM tickets", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("max_ticket_number: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("max_ticket_number: {e}"))),
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("max_ticket_number: {e}"))),
        }
    }

    async fn insert_ticket(&self, ticket: &Ticket) -> Result<(), DatabaseError> {
        insert_ticket_row(self.conn(), ticket).await?;
        debug!(ticket_id = %ticket.id, number = ticket.number, "Ticket inserted");
        Ok(())
    }

    async fn insert_ticket_message(&self, message: &TicketMessage) -> Result<(), DatabaseError> {
        insert_message_row(self.conn(), message).await
    }

    async fn insert_ticket_with_message(
        &self,
        ticket: &Ticket,
        message: &TicketMessage,
    ) -> Result<(), DatabaseError> {
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_ticket_with_message: begin: {e}")))?;

        let written = match insert_ticket_row(&tx, ticket).await {
            Ok(()) => insert_message_row(&tx, message).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            if let Err(rollback) = tx.rollback().await {
                warn!(ticket_id = %ticket.id, error = %rollback, "Rollback failed");
            }
            return Err(e);
        }

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_ticket_with_message: commit: {e}")))?;
        debug!(ticket_id = %ticket.id, number = ticket.number, "Ticket inserted with first message");
        Ok(())
    }

    async fn list_tickets(
        &self,
        department_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Ticket>, DatabaseError> {
        let conn = self.conn();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut rows = match department_id {
            Some(dept) => {
                conn.query(
                    &format!(
                        "SELECT {TICKET_COLUMNS} FROM tickets WHERE department_id = ?1
                         ORDER BY number DESC LIMIT ?2"
                    ),
                    params![dept, limit],
                )
                .await
            }
            None => {
                conn.query(
                    &format!("SELECT {TICKET_COLUMNS} FROM tickets ORDER BY number DESC LIMIT ?1"),
                    params![limit],
                )
                .await
            }
        }
        .map_err(|e| DatabaseError::Query(format!("list_tickets: {e}")))?;

        let mut tickets = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_tickets: {e}")))?
        {
            match row_to_ticket(&row) {
                Ok(ticket) => tickets.push(ticket),
                Err(e) => warn!("Skipping ticket row: {e}"),
            }
        }
        Ok(tickets)
    }

    async fn count_tickets(&self) -> Result<i64, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query("SELECT COUNT(*) FROM tickets", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("count_tickets: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("count_tickets: {e}"))),
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("count_tickets: {e}"))),
        }
    }

    async fn list_ticket_messages(
        &self,
        ticket_id: &str,
    ) -> Result<Vec<TicketMessage>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {TICKET_MESSAGE_COLUMNS} FROM ticket_messages
                     WHERE ticket_id = ?1 ORDER BY created_at ASC"
                ),
                params![ticket_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_ticket_messages: {e}")))?;

        let mut messages = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_ticket_messages: {e}")))?
        {
            match row_to_ticket_message(&row) {
                Ok(msg) => messages.push(msg),
                Err(e) => warn!("Skipping ticket message row: {e}"),
            }
        }
        Ok(messages)
    }

    // ── Customers ───────────────────────────────────────────────────

    async fn find_customer_by_email(
        &self,
        email: &str,
    ) -> Result<Option<Customer>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                "SELECT id, name, email, created_at FROM customers
                 WHERE email = ?1 COLLATE NOCASE LIMIT 1",
                params![email.trim()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_customer_by_email: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let customer = row_to_customer(&row)
                    .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
                Ok(Some(customer))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("find_customer_by_email: {e}"))),
        }
    }

    async fn insert_customer(&self, customer: &Customer) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO customers (id, name, email, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                customer.id.as_str(),
                customer.name.as_str(),
                customer.email.as_str(),
                customer.created_at.to_rfc3339(),
            ],
        )
        .await
        .map_err(|e| insert_error("insert_customer", e))?;
        Ok(())
    }
}
