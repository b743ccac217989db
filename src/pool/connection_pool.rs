//! Connection pool: at most one live session per department, gated by that
//! department's circuit breaker.
//!
//! Entries and breakers live in separate maps so that tearing down a session
//! never resets the failure history of its department. Both sit behind
//! `std::sync::Mutex` and no guard is held across an `.await`.

use std::collections::{BTreeMap, HashMap};
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::breaker::{Admission, BreakerSnapshot, BreakerState, CircuitBreaker};
use super::{PoolConfig, SharedMailbox};
use crate::error::{MailboxError, PoolError};
use crate::mailbox::{MailboxClient, MailboxConnector};
use crate::model::Department;
use crate::retry::RetryManager;

struct PoolEntry {
    session: SharedMailbox,
    last_used: Instant,
    last_used_at: DateTime<Utc>,
    is_active: bool,
    health_check_count: u64,
    retry_count: u32,
}

#[derive(Debug, Default)]
struct Counters {
    total_connections: u64,
    failed_connections: u64,
    average_response_ms: f64,
}

impl Counters {
    fn fold_latency(&mut self, sample: Duration) {
        let ms = sample.as_secs_f64() * 1000.0;
        self.average_response_ms = (self.average_response_ms + ms) / 2.0;
    }
}

/// Aggregate pool statistics since process start.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub total_connections: u64,
    pub active_connections: usize,
    pub failed_connections: u64,
    pub circuit_breakers_open: usize,
    pub average_response_time_ms: f64,
}

/// Per-department view of a pool entry and its breaker.
#[derive(Debug, Clone, Serialize)]
pub struct PoolEntrySummary {
    pub is_active: bool,
    pub last_used: DateTime<Utc>,
    pub retry_count: u32,
    pub health_check_count: u64,
    pub circuit_breaker_state: BreakerState,
    pub consecutive_failures: u32,
    pub last_failure: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthMetrics {
    pub total_health_checks: u64,
    pub average_response_time_ms: f64,
    pub circuit_breakers_open: usize,
}

/// Releases a half-open probe slot if the probe future is dropped early.
struct ProbeSlot<'a> {
    pool: &'a ConnectionPool,
    department_id: &'a str,
    armed: bool,
}

impl ProbeSlot<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ProbeSlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pool
                .with_breaker(self.department_id, CircuitBreaker::release_probe);
        }
    }
}

pub struct ConnectionPool {
    config: PoolConfig,
    connector: Arc<dyn MailboxConnector>,
    retry: Arc<RetryManager>,
    entries: Mutex<HashMap<String, PoolEntry>>,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
    counters: Mutex<Counters>,
}

impl ConnectionPool {
    pub fn new(
        config: PoolConfig,
        connector: Arc<dyn MailboxConnector>,
        retry: Arc<RetryManager>,
    ) -> Self {
        Self {
            config,
            connector,
            retry,
            entries: Mutex::new(HashMap::new()),
            breakers: Mutex::new(HashMap::new()),
            counters: Mutex::new(Counters::default()),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Get a live session for `department`, reusing the pooled one when it
    /// answers a ping.
    pub async fn get_connection(&self, department: &Department) -> Result<SharedMailbox, PoolError> {
        let id = department.id.as_str();
        let admission = self.with_breaker(id, |b| b.admit(Instant::now()));

        match admission {
            Admission::Reject => {
                debug!(department_id = %id, "Circuit breaker open, skipping connection");
                return Err(PoolError::CircuitOpen {
                    department_id: id.to_string(),
                });
            }
            Admission::Probe => return self.probe(department).await,
            Admission::Allow => {}
        }

        if let Some(session) = self.pooled_session(id) {
            match self.ping(&session).await {
                Ok(latency) => {
                    self.mark_used(id, latency);
                    self.with_breaker(id, CircuitBreaker::record_success);
                    debug!(department_id = %id, "Reusing pooled connection");
                    return Ok(session);
                }
                Err(e) => {
                    warn!(department_id = %id, error = %e, "Pooled connection failed ping");
                    self.remove_if_current(id, &session).await;
                    if self.with_breaker(id, |b| b.record_failure(Instant::now())) {
                        warn!(department_id = %id, "Circuit breaker opened");
                        return Err(PoolError::CircuitOpen {
                            department_id: id.to_string(),
                        });
                    }
                }
            }
        }

        self.connect_with_retry(department).await
    }

    /// Single half-open probe: one connect attempt, no retries.
    async fn probe(&self, department: &Department) -> Result<SharedMailbox, PoolError> {
        let id = department.id.as_str();
        let slot = ProbeSlot {
            pool: self,
            department_id: id,
            armed: true,
        };
        info!(department_id = %id, "Circuit breaker half-open, probing");

        let started = Instant::now();
        let result = self.connector.connect(department).await;
        slot.disarm();

        match result {
            Ok(client) => {
                let session = self.install(id, client, started.elapsed(), 0).await;
                info!(department_id = %id, "Circuit breaker closed after successful probe");
                Ok(session)
            }
            Err(e) => {
                self.with_breaker(id, |b| b.record_failure(Instant::now()));
                self.lock_counters().failed_connections += 1;
                warn!(department_id = %id, error = %e, "Probe failed, circuit breaker reopened");
                Err(PoolError::Unavailable {
                    department_id: id.to_string(),
                    source: e,
                })
            }
        }
    }

    async fn connect_with_retry(&self, department: &Department) -> Result<SharedMailbox, PoolError> {
        let id = department.id.as_str();
        let key = format!("imap-connection-{id}");
        let connector = Arc::clone(&self.connector);
        let mut tripped = false;
        let mut retries: u32 = 0;

        let result = self
            .retry
            .execute_with_retry(
                &key,
                || {
                    let connector = Arc::clone(&connector);
                    async move {
                        let started = Instant::now();
                        connector
                            .connect(department)
                            .await
                            .map(|client| (client, started.elapsed()))
                    }
                },
                |attempt, err: &MailboxError, delay| {
                    retries = attempt;
                    debug!(
                        department_id = %id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Connection attempt failed"
                    );
                    if self.with_breaker(id, |b| b.record_failure(Instant::now())) {
                        tripped = true;
                        ControlFlow::Break(())
                    } else {
                        ControlFlow::Continue(())
                    }
                },
            )
            .await;

        match result {
            Ok((client, latency)) => {
                let session = self.install(id, client, latency, retries).await;
                info!(department_id = %id, retries, "IMAP connection established");
                Ok(session)
            }
            Err(e) => {
                if !tripped {
                    tripped = self.with_breaker(id, |b| b.record_failure(Instant::now()));
                }
                if tripped {
                    warn!(department_id = %id, "Circuit breaker opened");
                }
                self.lock_counters().failed_connections += 1;
                Err(PoolError::Unavailable {
                    department_id: id.to_string(),
                    source: e,
                })
            }
        }
    }

    /// Put a fresh session in the pool, logging out any entry it replaces.
    async fn install(
        &self,
        department_id: &str,
        client: Box<dyn MailboxClient>,
        latency: Duration,
        retry_count: u32,
    ) -> SharedMailbox {
        let session: SharedMailbox = Arc::new(tokio::sync::Mutex::new(client));
        let entry = PoolEntry {
            session: Arc::clone(&session),
            last_used: Instant::now(),
            last_used_at: Utc::now(),
            is_active: true,
            health_check_count: 1,
            retry_count,
        };

        let stale = self.lock_entries().insert(department_id.to_string(), entry);
        self.with_breaker(department_id, CircuitBreaker::record_success);
        {
            let mut counters = self.lock_counters();
            counters.total_connections += 1;
            counters.fold_latency(latency);
        }

        if let Some(stale) = stale
            && let Ok(guard) = stale.session.try_lock_owned()
        {
            self.logout(department_id, guard).await;
        }
        session
    }

    /// Tear down a department's pooled session. Does nothing if there is none.
    ///
    /// Logout is best-effort and skipped if the session is locked elsewhere.
    pub async fn remove_from_pool(&self, department_id: &str) {
        let Some(entry) = self.lock_entries().remove(department_id) else {
            return;
        };
        debug!(department_id = %department_id, "Removed connection from pool");
        if let Ok(guard) = entry.session.try_lock_owned() {
            self.logout(department_id, guard).await;
        }
    }

    /// Tear down `session` only if it is still the one pooled for the
    /// department. Returns whether it was removed.
    async fn remove_if_current(&self, department_id: &str, session: &SharedMailbox) -> bool {
        let removed = {
            let mut entries = self.lock_entries();
            let current = entries
                .get(department_id)
                .is_some_and(|e| Arc::ptr_eq(&e.session, session));
            if current { entries.remove(department_id) } else { None }
        };
        let Some(entry) = removed else {
            debug!(department_id = %department_id, "Pooled connection already replaced");
            return false;
        };
        debug!(department_id = %department_id, "Removed dead connection from pool");
        if let Ok(guard) = entry.session.try_lock_owned() {
            self.logout(department_id, guard).await;
        }
        true
    }

    /// Evict entries idle for longer than the idle timeout. Sessions in use are kept.
    pub async fn cleanup_idle(&self) -> usize {
        let now = Instant::now();
        let idle_timeout = self.config.idle_timeout;

        let evicted: Vec<(String, OwnedMutexGuard<Box<dyn MailboxClient>>)> = {
            let mut entries = self.lock_entries();
            let idle: Vec<String> = entries
                .iter()
                .filter(|(_, e)| now.saturating_duration_since(e.last_used) > idle_timeout)
                .map(|(id, _)| id.clone())
                .collect();

            idle.into_iter()
                .filter_map(|id| {
                    let guard = entries.get(&id)?.session.clone().try_lock_owned().ok()?;
                    entries.remove(&id);
                    Some((id, guard))
                })
                .collect()
        };

        let count = evicted.len();
        join_all(
            evicted
                .into_iter()
                .map(|(id, guard)| async move { self.logout(&id, guard).await }),
        )
        .await;

        if count > 0 {
            info!(evicted = count, "Evicted idle connections");
        }
        count
    }

    /// Ping every idle pooled session concurrently. Returns the number of
    /// sessions that failed and were torn down.
    ///
    /// A successful check counts as a health check but does not refresh the
    /// last-used time, so idle entries still age out.
    pub async fn health_check(&self) -> usize {
        let sessions: Vec<(String, SharedMailbox)> = self
            .lock_entries()
            .iter()
            .map(|(id, e)| (id.clone(), Arc::clone(&e.session)))
            .collect();

        let results = join_all(sessions.into_iter().map(|(id, session)| async move {
            let Ok(mut guard) = Arc::clone(&session).try_lock_owned() else {
                return (id, session, None);
            };
            let started = Instant::now();
            let outcome = match tokio::time::timeout(self.config.ping_timeout, guard.noop()).await {
                Ok(Ok(())) => Ok(started.elapsed()),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(MailboxError::Timeout("NOOP".into())),
            };
            (id, session, Some(outcome))
        }))
        .await;

        let mut failed = 0;
        for (id, session, outcome) in results {
            match outcome {
                None => debug!(department_id = %id, "Connection in use, skipping health check"),
                Some(Ok(latency)) => {
                    if let Some(entry) = self.lock_entries().get_mut(&id)
                        && Arc::ptr_eq(&entry.session, &session)
                    {
                        entry.health_check_count += 1;
                    }
                    self.lock_counters().fold_latency(latency);
                    self.with_breaker(&id, CircuitBreaker::record_success);
                }
                Some(Err(e)) => {
                    failed += 1;
                    warn!(department_id = %id, error = %e, "Health check failed");
                    if self.remove_if_current(&id, &session).await
                        && self.with_breaker(&id, |b| b.record_failure(Instant::now()))
                    {
                        warn!(department_id = %id, "Circuit breaker opened");
                    }
                }
            }
        }
        failed
    }

    /// Log out every pooled session concurrently and empty the pool.
    pub async fn close_all(&self) {
        let drained: Vec<(String, PoolEntry)> = self.lock_entries().drain().collect();
        if drained.is_empty() {
            return;
        }
        let count = drained.len();

        join_all(drained.into_iter().map(|(id, entry)| async move {
            match tokio::time::timeout(self.config.ping_timeout, entry.session.lock_owned()).await {
                Ok(guard) => self.logout(&id, guard).await,
                Err(_) => warn!(department_id = %id, "Connection still busy, dropping without logout"),
            }
        }))
        .await;

        info!(closed = count, "All pooled connections closed");
    }

    // ── Snapshots ───────────────────────────────────────────────────

    pub fn stats(&self) -> PoolStats {
        let active_connections = self.lock_entries().values().filter(|e| e.is_active).count();
        let circuit_breakers_open = self.open_breakers();
        let counters = self.lock_counters();
        PoolStats {
            total_connections: counters.total_connections,
            active_connections,
            failed_connections: counters.failed_connections,
            circuit_breakers_open,
            average_response_time_ms: counters.average_response_ms,
        }
    }

    /// Pool entries keyed by department id.
    pub fn entries(&self) -> BTreeMap<String, PoolEntrySummary> {
        let breakers = self.breakers();
        self.lock_entries()
            .iter()
            .map(|(id, e)| {
                let breaker = breakers.get(id);
                (
                    id.clone(),
                    PoolEntrySummary {
                        is_active: e.is_active,
                        last_used: e.last_used_at,
                        retry_count: e.retry_count,
                        health_check_count: e.health_check_count,
                        circuit_breaker_state: breaker
                            .map_or(BreakerState::Closed, |b| b.state),
                        consecutive_failures: breaker.map_or(0, |b| b.consecutive_failures),
                        last_failure: breaker.and_then(|b| b.last_failure),
                    },
                )
            })
            .collect()
    }

    /// Breaker state for every department that has ever been seen.
    pub fn breakers(&self) -> BTreeMap<String, BreakerSnapshot> {
        self.lock_breakers()
            .iter()
            .map(|(id, b)| (id.clone(), b.snapshot()))
            .collect()
    }

    pub fn breaker_state(&self, department_id: &str) -> BreakerState {
        self.lock_breakers()
            .get(department_id)
            .map_or(BreakerState::Closed, CircuitBreaker::state)
    }

    pub fn health_metrics(&self) -> HealthMetrics {
        let total_health_checks = self
            .lock_entries()
            .values()
            .map(|e| e.health_check_count)
            .sum();
        HealthMetrics {
            total_health_checks,
            average_response_time_ms: self.lock_counters().average_response_ms,
            circuit_breakers_open: self.open_breakers(),
        }
    }

    pub fn contains(&self, department_id: &str) -> bool {
        self.lock_entries().contains_key(department_id)
    }

    // ── Internals ───────────────────────────────────────────────────

    fn pooled_session(&self, department_id: &str) -> Option<SharedMailbox> {
        self.lock_entries()
            .get(department_id)
            .map(|e| Arc::clone(&e.session))
    }

    async fn ping(&self, session: &SharedMailbox) -> Result<Duration, MailboxError> {
        let started = Instant::now();
        let ping = async {
            let mut client = session.lock().await;
            client.noop().await
        };
        match tokio::time::timeout(self.config.ping_timeout, ping).await {
            Ok(Ok(())) => Ok(started.elapsed()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(MailboxError::Timeout("NOOP".into())),
        }
    }

    fn mark_used(&self, department_id: &str, latency: Duration) {
        if let Some(entry) = self.lock_entries().get_mut(department_id) {
            entry.last_used = Instant::now();
            entry.last_used_at = Utc::now();
            entry.health_check_count += 1;
        }
        self.lock_counters().fold_latency(latency);
    }

    async fn logout(&self, department_id: &str, mut guard: OwnedMutexGuard<Box<dyn MailboxClient>>) {
        match tokio::time::timeout(self.config.ping_timeout, guard.logout()).await {
            Ok(Ok(())) => debug!(department_id = %department_id, "Logged out"),
            Ok(Err(e)) => debug!(department_id = %department_id, error = %e, "Logout failed"),
            Err(_) => debug!(department_id = %department_id, "Logout timed out"),
        }
    }

    /// Run `f` against the department's breaker, creating it on first use.
    fn with_breaker<T>(&self, department_id: &str, f: impl FnOnce(&mut CircuitBreaker) -> T) -> T {
        let mut breakers = self.lock_breakers();
        let breaker = breakers
            .entry(department_id.to_string())
            .or_insert_with(|| {
                CircuitBreaker::new(self.config.breaker_threshold, self.config.breaker_cooldown)
            });
        f(breaker)
    }

    fn open_breakers(&self) -> usize {
        self.lock_breakers().values().filter(|b| b.is_open()).count()
    }

    fn lock_entries(&self) -> MutexGuard<'_, HashMap<String, PoolEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_breakers(&self) -> MutexGuard<'_, HashMap<String, CircuitBreaker>> {
        self.breakers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_counters(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
