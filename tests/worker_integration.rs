//! End-to-end worker tests against a scripted mailbox and an in-memory store.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use tokio::sync::broadcast;

use helpdesk_ingest::config::WorkerConfig;
use helpdesk_ingest::error::MailboxError;
use helpdesk_ingest::mailbox::{MailboxClient, MailboxConnector};
use helpdesk_ingest::model::Department;
use helpdesk_ingest::parser::KeywordParser;
use helpdesk_ingest::pool::{BreakerState, ConnectionPool};
use helpdesk_ingest::retry::RetryManager;
use helpdesk_ingest::store::{HelpdeskStore, LibSqlBackend};
use helpdesk_ingest::ticket::TicketMaterializer;
use helpdesk_ingest::worker::{DepartmentSync, EventBus, HelpdeskWorker, WorkerEvent};

// ── Scripted mailbox ────────────────────────────────────────────────

#[derive(Default)]
struct Mailbox {
    messages: BTreeMap<u32, Vec<u8>>,
    seen: HashSet<u32>,
    next_uid: u32,
}

#[derive(Default)]
struct Fault {
    /// Departments whose connect fails with a configuration error.
    misconfigured: HashSet<String>,
    /// Departments whose connect fails with a retryable network error.
    unreachable: HashSet<String>,
    /// Fail the next `mark_seen` per department with a protocol error.
    fail_mark_seen: HashSet<String>,
    /// Fail the next `select` per department with a protocol error.
    fail_select: HashSet<String>,
    /// Fail the next `search_unseen` per department with a protocol error.
    fail_search: HashSet<String>,
    /// UIDs whose next fetch is rejected by the server.
    fail_fetch: HashSet<(String, u32)>,
    /// UIDs whose fetch drops the connection.
    drop_on_fetch: HashSet<(String, u32)>,
}

#[derive(Default)]
struct FakeServer {
    mailboxes: Mutex<HashMap<String, Mailbox>>,
    faults: Mutex<Fault>,
    connects: Mutex<HashMap<String, usize>>,
}

impl FakeServer {
    fn deliver(&self, department_id: &str, raw: Vec<u8>) -> u32 {
        let mut mailboxes = self.mailboxes.lock().unwrap();
        let mailbox = mailboxes.entry(department_id.to_string()).or_default();
        mailbox.next_uid += 1;
        let uid = mailbox.next_uid;
        mailbox.messages.insert(uid, raw);
        uid
    }

    fn is_seen(&self, department_id: &str, uid: u32) -> bool {
        self.mailboxes
            .lock()
            .unwrap()
            .get(department_id)
            .is_some_and(|m| m.seen.contains(&uid))
    }

    fn connects(&self, department_id: &str) -> usize {
        self.connects
            .lock()
            .unwrap()
            .get(department_id)
            .copied()
            .unwrap_or(0)
    }
}

struct FakeClient {
    department_id: String,
    server: Arc<FakeServer>,
}

#[async_trait]
impl MailboxClient for FakeClient {
    async fn select(&mut self, mailbox: &str) -> Result<(), MailboxError> {
        assert_eq!(mailbox, "INBOX");
        if self.server.faults.lock().unwrap().fail_select.remove(&self.department_id) {
            return Err(MailboxError::Protocol("SELECT rejected: mailbox locked".into()));
        }
        Ok(())
    }

    async fn search_unseen(&mut self) -> Result<Vec<u32>, MailboxError> {
        if self.server.faults.lock().unwrap().fail_search.remove(&self.department_id) {
            return Err(MailboxError::Protocol("SEARCH rejected: server busy".into()));
        }
        let mailboxes = self.server.mailboxes.lock().unwrap();
        Ok(mailboxes
            .get(&self.department_id)
            .map(|m| {
                m.messages
                    .keys()
                    .filter(|uid| !m.seen.contains(uid))
                    .copied()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn fetch(&mut self, uid: u32) -> Result<Option<Vec<u8>>, MailboxError> {
        if self
            .server
            .faults
            .lock()
            .unwrap()
            .drop_on_fetch
            .remove(&(self.department_id.clone(), uid))
        {
            return Err(MailboxError::ConnectionLost("server hung up".into()));
        }
        if self
            .server
            .faults
            .lock()
            .unwrap()
            .fail_fetch
            .remove(&(self.department_id.clone(), uid))
        {
            return Err(MailboxError::Protocol("FETCH rejected: message too large".into()));
        }
        let mailboxes = self.server.mailboxes.lock().unwrap();
        Ok(mailboxes
            .get(&self.department_id)
            .and_then(|m| m.messages.get(&uid).cloned()))
    }

    async fn mark_seen(&mut self, uid: u32) -> Result<(), MailboxError> {
        if self
            .server
            .faults
            .lock()
            .unwrap()
            .fail_mark_seen
            .remove(&self.department_id)
        {
            return Err(MailboxError::Protocol("STORE rejected".into()));
        }
        let mut mailboxes = self.server.mailboxes.lock().unwrap();
        if let Some(m) = mailboxes.get_mut(&self.department_id) {
            m.seen.insert(uid);
        }
        Ok(())
    }

    async fn noop(&mut self) -> Result<(), MailboxError> {
        Ok(())
    }

    async fn logout(&mut self) -> Result<(), MailboxError> {
        Ok(())
    }
}

struct FakeConnector {
    server: Arc<FakeServer>,
}

#[async_trait]
impl MailboxConnector for FakeConnector {
    async fn connect(&self, department: &Department) -> Result<Box<dyn MailboxClient>, MailboxError> {
        *self
            .server
            .connects
            .lock()
            .unwrap()
            .entry(department.id.clone())
            .or_default() += 1;

        let faults = self.server.faults.lock().unwrap();
        if faults.misconfigured.contains(&department.id) {
            return Err(MailboxError::Config("host does not speak IMAP".into()));
        }
        if faults.unreachable.contains(&department.id) {
            return Err(MailboxError::Network {
                code: "ECONNREFUSED",
                message: "connection refused".into(),
            });
        }
        Ok(Box::new(FakeClient {
            department_id: department.id.clone(),
            server: Arc::clone(&self.server),
        }))
    }
}

// ── Fixtures ────────────────────────────────────────────────────────

fn department(id: &str, name: &str) -> Department {
    Department {
        id: id.into(),
        name: name.into(),
        imap_host: Some(format!("imap.{id}.example.com")),
        imap_port: 993,
        imap_secure: true,
        imap_user: Some(format!("{id}@example.com")),
        imap_password: Some(SecretString::from("secret")),
        sync_interval_secs: 60,
        active: true,
        last_sync: None,
    }
}

fn raw_email(message_id: &str, from: &str, subject: &str, body: &str) -> Vec<u8> {
    format!(
        "Message-ID: <{message_id}>\r\n\
         From: {from}\r\n\
         To: support@example.com\r\n\
         Subject: {subject}\r\n\
         Date: Tue, 13 Oct 2026 10:00:00 +0000\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         \r\n\
         {body}\r\n"
    )
    .into_bytes()
}

fn printer_email(n: u32) -> Vec<u8> {
    raw_email(
        &format!("printer-{n}@mail.example.com"),
        "\"Jane Doe\" <jane@customer.com>",
        &format!("Printer on floor {n} is jammed"),
        "The printer keeps jamming every time we print more than two pages.",
    )
}

fn fast_config() -> WorkerConfig {
    let mut config = WorkerConfig::default();
    config.retry.base_delay = Duration::from_millis(1);
    config.retry.max_delay = Duration::from_millis(5);
    config
}

struct Harness {
    server: Arc<FakeServer>,
    store: Arc<LibSqlBackend>,
    worker: HelpdeskWorker,
}

async fn harness(config: WorkerConfig, departments: &[(&str, &str)]) -> Harness {
    let server = Arc::new(FakeServer::default());
    let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    for (id, name) in departments {
        store.upsert_department(&department(id, name)).await.unwrap();
    }
    let worker = HelpdeskWorker::new(
        config,
        store.clone(),
        Arc::new(FakeConnector {
            server: Arc::clone(&server),
        }),
        Arc::new(KeywordParser::new()),
    );
    Harness {
        server,
        store,
        worker,
    }
}

fn drain(rx: &mut broadcast::Receiver<WorkerEvent>) -> Vec<WorkerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn failing_department_does_not_block_others() {
    let h = harness(
        fast_config(),
        &[("alpha", "Alpha"), ("bravo", "Bravo"), ("charlie", "Charlie")],
    )
    .await;
    h.server.faults.lock().unwrap().misconfigured.insert("alpha".into());
    h.server.deliver("alpha", printer_email(1));
    h.server.deliver("bravo", printer_email(2));
    h.server.deliver("charlie", printer_email(3));

    let mut events = h.worker.subscribe();
    let report = h.worker.run_once().await.unwrap();

    assert_eq!(report.departments, 3);
    assert_eq!(report.synced, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.tickets_created, 2);

    let events = drain(&mut events);
    let errors: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            WorkerEvent::DepartmentError { department_id, .. } => Some(department_id.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(errors, vec!["alpha"]);
    let created = events
        .iter()
        .filter(|e| matches!(e, WorkerEvent::TicketCreated { .. }))
        .count();
    assert_eq!(created, 2);

    // Non-retryable: a single attempt.
    assert_eq!(h.server.connects("alpha"), 1);
    assert!(!h.server.is_seen("alpha", 1));
}

#[tokio::test]
async fn ingestion_is_idempotent() {
    let h = harness(fast_config(), &[("support", "Support")]).await;
    let uid = h.server.deliver("support", printer_email(1));

    // First pass creates the ticket but cannot flag the message.
    h.server
        .faults
        .lock()
        .unwrap()
        .fail_mark_seen
        .insert("support".into());
    let first = h.worker.run_once().await.unwrap();
    assert_eq!(first.message_errors, 1);
    assert_eq!(h.store.count_tickets().await.unwrap(), 1);
    assert!(!h.server.is_seen("support", uid));

    // Second pass sees the same message again and only flags it.
    let second = h.worker.run_once().await.unwrap();
    assert_eq!(second.tickets_created, 0);
    assert_eq!(second.duplicates, 1);
    assert!(h.server.is_seen("support", uid));

    let third = h.worker.run_once().await.unwrap();
    assert_eq!(third, helpdesk_ingest::worker::TickReport {
        departments: 1,
        synced: 1,
        ..Default::default()
    });
    assert_eq!(h.store.count_tickets().await.unwrap(), 1);
}

/// A sync loop whose pool outlives the pass, so entries can be inspected.
struct SyncHarness {
    server: Arc<FakeServer>,
    store: Arc<LibSqlBackend>,
    pool: Arc<ConnectionPool>,
    events: EventBus,
    sync: DepartmentSync,
    _stop: tokio::sync::watch::Sender<bool>,
}

async fn sync_harness(departments: &[(&str, &str)]) -> SyncHarness {
    let config = fast_config();
    let server = Arc::new(FakeServer::default());
    let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    for (id, name) in departments {
        store.upsert_department(&department(id, name)).await.unwrap();
    }
    let pool = Arc::new(ConnectionPool::new(
        config.pool.clone(),
        Arc::new(FakeConnector {
            server: Arc::clone(&server),
        }),
        Arc::new(RetryManager::new(config.retry.clone())),
    ));
    let events = EventBus::new();
    let (stop, stopping) = tokio::sync::watch::channel(false);
    let sync = DepartmentSync::new(
        TicketMaterializer::new(store.clone(), Arc::new(KeywordParser::new())),
        Arc::clone(&pool),
        events.clone(),
        config.mailbox.clone(),
        stopping,
    );
    SyncHarness {
        server,
        store,
        pool,
        events,
        sync,
        _stop: stop,
    }
}

#[tokio::test]
async fn mailbox_failure_tears_down_only_that_department() {
    let h = sync_harness(&[("alpha", "Alpha"), ("bravo", "Bravo"), ("charlie", "Charlie")]).await;
    for (n, id) in ["alpha", "bravo", "charlie"].into_iter().enumerate() {
        h.server.deliver(id, printer_email(n as u32 + 1));
    }
    {
        let mut faults = h.server.faults.lock().unwrap();
        faults.fail_select.insert("alpha".into());
        faults.fail_search.insert("bravo".into());
    }

    let mut events = h.events.subscribe();
    let report = h.sync.run_tick().await.unwrap();
    assert_eq!(report.departments, 3);
    assert_eq!(report.failed, 2);
    assert_eq!(report.synced, 1);
    assert_eq!(report.tickets_created, 1);

    assert!(!h.pool.contains("alpha"));
    assert!(!h.pool.contains("bravo"));
    assert!(h.pool.contains("charlie"));

    let mut errors: Vec<String> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            WorkerEvent::DepartmentError { department_id, .. } => Some(department_id),
            _ => None,
        })
        .collect();
    errors.sort();
    assert_eq!(errors, vec!["alpha", "bravo"]);

    // Next pass reconnects the torn-down departments and picks up their mail.
    let report = h.sync.run_tick().await.unwrap();
    assert_eq!(report.synced, 3);
    assert_eq!(report.tickets_created, 2);
    assert_eq!(h.server.connects("alpha"), 2);
    assert_eq!(h.server.connects("bravo"), 2);
    assert_eq!(h.server.connects("charlie"), 1);
    assert_eq!(h.store.count_tickets().await.unwrap(), 3);
}

#[tokio::test]
async fn one_bad_message_does_not_stop_the_rest() {
    let h = sync_harness(&[("support", "Support")]).await;
    let first = h.server.deliver("support", printer_email(1));
    let second = h.server.deliver("support", printer_email(2));
    h.server
        .faults
        .lock()
        .unwrap()
        .fail_fetch
        .insert(("support".into(), first));

    let report = h.sync.run_tick().await.unwrap();
    assert_eq!(report.message_errors, 1);
    assert_eq!(report.tickets_created, 1);
    assert_eq!(report.synced, 1);
    assert!(!h.server.is_seen("support", first));
    assert!(h.server.is_seen("support", second));
    assert!(h.pool.contains("support"));

    let report = h.sync.run_tick().await.unwrap();
    assert_eq!(report.tickets_created, 1);
    assert!(h.server.is_seen("support", first));
    assert_eq!(h.server.connects("support"), 1);
    assert_eq!(h.store.count_tickets().await.unwrap(), 2);
}

#[tokio::test]
async fn tickets_are_numbered_from_one() {
    let h = harness(fast_config(), &[("support", "Support")]).await;
    for n in 1..=3 {
        h.server.deliver("support", printer_email(n));
    }

    let report = h.worker.run_once().await.unwrap();
    assert_eq!(report.tickets_created, 3);

    let mut tickets = h.store.list_tickets(Some("support"), 10).await.unwrap();
    tickets.sort_by_key(|t| t.number);
    assert_eq!(tickets.iter().map(|t| t.number).collect::<Vec<_>>(), vec![1, 2, 3]);
    assert!(tickets.iter().all(|t| t.requester_name == "Jane Doe"));
    assert!(tickets.iter().all(|t| t.requester_email == "jane@customer.com"));
    assert!(tickets.iter().all(|t| t.tags.contains(&"printer".to_string())));

    let dept = h.store.active_departments().await.unwrap().remove(0);
    assert!(dept.last_sync.is_some());
}

#[tokio::test]
async fn auto_replies_are_flagged_without_a_ticket() {
    let h = harness(fast_config(), &[("support", "Support")]).await;
    let raw = format!(
        "Message-ID: <ooo@mail.example.com>\r\n\
         From: bob@customer.com\r\n\
         Subject: Out of office\r\n\
         Auto-Submitted: auto-replied\r\n\
         \r\n\
         I am away until Monday and will reply when I am back.\r\n"
    );
    let uid = h.server.deliver("support", raw.into_bytes());

    let report = h.worker.run_once().await.unwrap();
    assert_eq!(report.skipped, 1);
    assert_eq!(report.tickets_created, 0);
    assert!(h.server.is_seen("support", uid));
    assert_eq!(h.store.count_tickets().await.unwrap(), 0);
}

#[tokio::test]
async fn lost_connection_stops_department_for_this_pass() {
    let h = harness(fast_config(), &[("support", "Support")]).await;
    let first = h.server.deliver("support", printer_email(1));
    let second = h.server.deliver("support", printer_email(2));
    h.server
        .faults
        .lock()
        .unwrap()
        .drop_on_fetch
        .insert(("support".into(), first));

    let report = h.worker.run_once().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.tickets_created, 0);
    assert!(!h.server.is_seen("support", second));

    let report = h.worker.run_once().await.unwrap();
    assert_eq!(report.tickets_created, 2);
    assert_eq!(h.server.connects("support"), 2);
}

#[tokio::test]
async fn open_breaker_skips_department_quietly() {
    let h = harness(fast_config(), &[("support", "Support")]).await;
    h.server.faults.lock().unwrap().unreachable.insert("support".into());

    let report = h.worker.run_once().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(h.server.connects("support"), 3);
    assert_eq!(h.worker.pool().breaker_state("support"), BreakerState::Open);

    let mut events = h.worker.subscribe();
    let report = h.worker.run_once().await.unwrap();
    assert_eq!(report.breaker_open, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(h.server.connects("support"), 3);
    assert!(drain(&mut events).is_empty());

    let status = h.worker.status();
    assert_eq!(status.pool_stats.circuit_breakers_open, 1);
    assert_eq!(status.circuit_breakers["support"].state, BreakerState::Open);
    assert!(status.retry_stats.contains_key("imap-connection-support"));
}

#[tokio::test]
async fn no_work_happens_after_stop() {
    let mut config = fast_config();
    config.sync_interval = Duration::from_millis(20);
    config.pool_cleanup_interval = Duration::from_millis(20);
    config.health_check_interval = Duration::from_millis(20);
    let h = harness(config, &[("support", "Support")]).await;
    h.server.deliver("support", printer_email(1));

    let mut events = h.worker.subscribe();
    h.worker.start().await.unwrap();
    // The initial pass runs inside start.
    assert_eq!(h.store.count_tickets().await.unwrap(), 1);

    h.server.deliver("support", printer_email(2));
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(h.store.count_tickets().await.unwrap(), 2);

    h.worker.stop().await;
    let status = h.worker.status();
    assert!(!status.is_running);
    assert!(status.connection_pool.is_empty());

    h.server.deliver("support", printer_email(3));
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(h.store.count_tickets().await.unwrap(), 2);

    let events = drain(&mut events);
    assert!(matches!(events.first(), Some(WorkerEvent::Started)));
    assert!(matches!(events.last(), Some(WorkerEvent::Stopped)));
}
