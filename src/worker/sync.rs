//! Department sync loop: one pass over every active department mailbox.
//!
//! Departments are processed sequentially. A department's failure never
//! aborts the pass; it is logged, reported as a `DepartmentError` event and
//! the pass moves on.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::events::{EventBus, WorkerEvent};
use crate::error::{Error, PoolError};
use crate::mailbox::{EmailMessage, MailboxClient};
use crate::model::Department;
use crate::pool::ConnectionPool;
use crate::store::HelpdeskStore;
use crate::ticket::{Materialized, TicketMaterializer};

/// Counters for one sync pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub departments: usize,
    /// Departments whose mailbox was scanned to the end.
    pub synced: usize,
    /// Departments skipped because their breaker is open.
    pub breaker_open: usize,
    pub failed: usize,
    pub tickets_created: usize,
    pub duplicates: usize,
    /// Messages refused by the parser (auto-replies, spam, ...).
    pub skipped: usize,
    /// Messages left unseen after an error, retried on the next pass.
    pub message_errors: usize,
}

enum MessageOutcome {
    Created,
    Duplicate,
    Skipped,
    /// UID vanished between search and fetch.
    Gone,
}

enum DepartmentOutcome {
    Synced,
    BreakerOpen,
    Failed,
    Interrupted,
}

pub struct DepartmentSync {
    store: Arc<dyn HelpdeskStore>,
    pool: Arc<ConnectionPool>,
    materializer: TicketMaterializer,
    events: EventBus,
    mailbox: String,
    stopping: watch::Receiver<bool>,
}

impl DepartmentSync {
    pub fn new(
        materializer: TicketMaterializer,
        pool: Arc<ConnectionPool>,
        events: EventBus,
        mailbox: impl Into<String>,
        stopping: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store: Arc::clone(materializer.store()),
            pool,
            materializer,
            events,
            mailbox: mailbox.into(),
            stopping,
        }
    }

    fn is_stopping(&self) -> bool {
        *self.stopping.borrow()
    }

    /// Run a pass, turning a pass-level failure into an `Error` event.
    pub async fn run_pass(&self) -> TickReport {
        match self.run_tick().await {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "Sync pass failed");
                self.events.emit(WorkerEvent::Error {
                    error: e.to_string(),
                });
                TickReport::default()
            }
        }
    }

    /// Sync every active, configured department once.
    pub async fn run_tick(&self) -> Result<TickReport, Error> {
        let departments = self.store.active_departments().await?;
        let mut report = TickReport {
            departments: departments.len(),
            ..TickReport::default()
        };
        debug!(departments = departments.len(), "Starting sync pass");

        for department in &departments {
            if self.is_stopping() {
                info!("Worker stopping, ending sync pass early");
                break;
            }
            match self.sync_department(department, &mut report).await {
                DepartmentOutcome::Synced => report.synced += 1,
                DepartmentOutcome::BreakerOpen => report.breaker_open += 1,
                DepartmentOutcome::Failed => report.failed += 1,
                DepartmentOutcome::Interrupted => {}
            }
        }

        if report.tickets_created > 0 || report.failed > 0 {
            info!(
                synced = report.synced,
                failed = report.failed,
                tickets_created = report.tickets_created,
                "Sync pass complete"
            );
        }
        Ok(report)
    }

    async fn sync_department(
        &self,
        department: &Department,
        report: &mut TickReport,
    ) -> DepartmentOutcome {
        let id = department.id.as_str();
        let session = match self.pool.get_connection(department).await {
            Ok(session) => session,
            Err(PoolError::CircuitOpen { .. }) => {
                debug!(department_id = %id, "Skipping department, circuit breaker open");
                return DepartmentOutcome::BreakerOpen;
            }
            Err(e) => {
                self.department_error(id, &e.to_string());
                return DepartmentOutcome::Failed;
            }
        };

        let mut client = session.lock().await;

        let uids = match client.select(&self.mailbox).await {
            Ok(()) => client.search_unseen().await,
            Err(e) => Err(e),
        };
        let uids = match uids {
            Ok(uids) => uids,
            Err(e) => {
                drop(client);
                self.pool.remove_from_pool(id).await;
                self.department_error(id, &e.to_string());
                return DepartmentOutcome::Failed;
            }
        };

        if !uids.is_empty() {
            debug!(department_id = %id, unseen = uids.len(), "Found unseen messages");
        }

        let mut lost = None;
        let mut interrupted = false;
        for uid in uids {
            if self.is_stopping() {
                interrupted = true;
                break;
            }
            match self.process_message(&mut **client, uid, department).await {
                Ok(MessageOutcome::Created) => report.tickets_created += 1,
                Ok(MessageOutcome::Duplicate) => report.duplicates += 1,
                Ok(MessageOutcome::Skipped) => report.skipped += 1,
                Ok(MessageOutcome::Gone) => {}
                Err(Error::Mailbox(e)) if e.is_connection_lost() => {
                    report.message_errors += 1;
                    lost = Some(e);
                    break;
                }
                Err(e) => {
                    report.message_errors += 1;
                    warn!(department_id = %id, uid, error = %e, "Failed to process message");
                }
            }
        }
        drop(client);

        if let Some(e) = lost {
            self.pool.remove_from_pool(id).await;
            self.department_error(id, &e.to_string());
            return DepartmentOutcome::Failed;
        }
        if interrupted {
            return DepartmentOutcome::Interrupted;
        }

        if let Err(e) = self.store.touch_department_sync(id, Utc::now()).await {
            warn!(department_id = %id, error = %e, "Failed to record last sync");
        }
        DepartmentOutcome::Synced
    }

    /// Fetch, dedup, materialize and flag one message. A message is only
    /// marked seen once it is accounted for.
    async fn process_message(
        &self,
        client: &mut dyn MailboxClient,
        uid: u32,
        department: &Department,
    ) -> Result<MessageOutcome, Error> {
        let Some(raw) = client.fetch(uid).await? else {
            debug!(department_id = %department.id, uid, "Message vanished before fetch");
            return Ok(MessageOutcome::Gone);
        };

        let Some(email) = EmailMessage::from_raw(uid, &raw) else {
            warn!(department_id = %department.id, uid, "Unparseable message, marking seen");
            client.mark_seen(uid).await?;
            return Ok(MessageOutcome::Skipped);
        };

        if self
            .store
            .find_ticket_by_message_id(&email.message_id)
            .await?
            .is_some()
        {
            debug!(department_id = %department.id, uid, message_id = %email.message_id, "Already ingested");
            client.mark_seen(uid).await?;
            return Ok(MessageOutcome::Duplicate);
        }

        let outcome = match self.materializer.create_ticket(&email, department).await? {
            Materialized::Created(ticket) => {
                self.events.emit(WorkerEvent::TicketCreated {
                    department_id: department.id.clone(),
                    ticket,
                });
                MessageOutcome::Created
            }
            Materialized::Duplicate(_) => MessageOutcome::Duplicate,
            Materialized::Skipped(_) => MessageOutcome::Skipped,
        };

        client.mark_seen(uid).await?;
        Ok(outcome)
    }

    fn department_error(&self, department_id: &str, error: &str) {
        error!(department_id = %department_id, error = %error, "Department sync failed");
        self.events.emit(WorkerEvent::DepartmentError {
            department_id: department_id.to_string(),
            error: error.to_string(),
        });
    }
}
