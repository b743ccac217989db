//! `HelpdeskStore` trait: the async persistence interface the worker uses.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::model::{Customer, Department, Ticket, TicketMessage};

/// Backend-agnostic persistence for departments, tickets and customers.
#[async_trait]
pub trait HelpdeskStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Departments ─────────────────────────────────────────────────

    /// Active departments with host, user and password all set.
    async fn active_departments(&self) -> Result<Vec<Department>, DatabaseError>;

    /// Insert or replace a department by id.
    async fn upsert_department(&self, department: &Department) -> Result<(), DatabaseError>;

    /// Record a completed mailbox scan.
    async fn touch_department_sync(
        &self,
        department_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    // ── Tickets ─────────────────────────────────────────────────────

    async fn find_ticket_by_message_id(
        &self,
        message_id: &str,
    ) -> Result<Option<Ticket>, DatabaseError>;

    /// Highest ticket number in use, or 0 when there are no tickets.
    async fn max_ticket_number(&self) -> Result<i64, DatabaseError>;

    /// Insert a ticket. A duplicate number or message-id is a `Constraint` error.
    async fn insert_ticket(&self, ticket: &Ticket) -> Result<(), DatabaseError>;

    async fn insert_ticket_message(&self, message: &TicketMessage) -> Result<(), DatabaseError>;

    /// Insert a ticket and its first message atomically. On error neither row exists.
    async fn insert_ticket_with_message(
        &self,
        ticket: &Ticket,
        message: &TicketMessage,
    ) -> Result<(), DatabaseError>;

    /// Newest tickets first, optionally filtered by department.
    async fn list_tickets(
        &self,
        department_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Ticket>, DatabaseError>;

    async fn count_tickets(&self) -> Result<i64, DatabaseError>;

    /// Thread messages of a ticket, oldest first.
    async fn list_ticket_messages(
        &self,
        ticket_id: &str,
    ) -> Result<Vec<TicketMessage>, DatabaseError>;

    // ── Customers ───────────────────────────────────────────────────

    /// Case-insensitive exact match on the email address.
    async fn find_customer_by_email(
        &self,
        email: &str,
    ) -> Result<Option<Customer>, DatabaseError>;

    async fn insert_customer(&self, customer: &Customer) -> Result<(), DatabaseError>;
}
