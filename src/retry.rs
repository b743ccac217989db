//! Keyed retry executor with exponential backoff and jitter.
//!
//! State is kept per operation key (e.g. `imap-connection-<dept>`) so that
//! status snapshots can show which operations are currently struggling.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::ops::ControlFlow;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::MailboxError;

/// An error the retry manager can classify.
pub trait RetryableError: std::fmt::Display {
    /// Machine-readable code, matched before the message text.
    fn code(&self) -> Option<&str> {
        None
    }
}

impl RetryableError for MailboxError {
    fn code(&self) -> Option<&str> {
        MailboxError::code(self)
    }
}

/// Backoff policy.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts per run, including the first one.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Fraction of the delay added or removed at random.
    pub jitter_factor: f64,
    /// Substrings that mark an error as transient.
    pub retryable_errors: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let retryable_errors = [
            "ECONNRESET",
            "ECONNREFUSED",
            "ETIMEDOUT",
            "ENOTFOUND",
            "EHOSTUNREACH",
            "ENETUNREACH",
            "EAI_AGAIN",
            "IMAP_TIMEOUT",
            "IMAP_CONNECTION_LOST",
            "Connection timeout",
            "Authentication failed",
        ]
        .into_iter()
        .map(String::from)
        .collect();

        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
            retryable_errors,
        }
    }
}

#[derive(Debug)]
struct RetryState {
    attempts: u32,
    last_error: Option<String>,
    next_retry_at: Option<DateTime<Utc>>,
    last_activity: Instant,
    in_flight: u32,
    delays: u32,
    total_delay: Duration,
}

impl RetryState {
    fn new() -> Self {
        Self {
            attempts: 0,
            last_error: None,
            next_retry_at: None,
            last_activity: Instant::now(),
            in_flight: 0,
            delays: 0,
            total_delay: Duration::ZERO,
        }
    }
}

/// Snapshot of one key's retry state.
#[derive(Debug, Clone, Serialize)]
pub struct RetryKeyStats {
    /// Failed attempts in the current (or most recent) run.
    pub attempts: u32,
    pub in_flight: bool,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub average_delay_ms: u64,
}

/// Retry statistics keyed by operation.
pub type RetryStats = BTreeMap<String, RetryKeyStats>;

/// Executes fallible async operations with keyed backoff state.
#[derive(Debug)]
pub struct RetryManager {
    config: RetryConfig,
    states: Mutex<HashMap<String, RetryState>>,
}

impl RetryManager {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Whether the error's code or message matches a configured signature.
    pub fn is_retryable<E: RetryableError>(&self, err: &E) -> bool {
        let message = err.to_string();
        self.config.retryable_errors.iter().any(|signature| {
            err.code().is_some_and(|code| code.contains(signature.as_str()))
                || message.contains(signature.as_str())
        })
    }

    /// Delay before retry `attempt` (0-indexed), without jitter.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.config.base_delay.as_secs_f64();
        let max = self.config.max_delay.as_secs_f64();
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay = (base * self.config.backoff_multiplier.powi(exp)).min(max);
        Duration::from_secs_f64(delay.max(0.0))
    }

    /// Delay before retry `attempt` with uniform ±jitter applied.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let delay = self.backoff_delay(attempt);
        let jitter = self.config.jitter_factor;
        if jitter <= 0.0 {
            return delay;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
        Duration::from_secs_f64((delay.as_secs_f64() * factor).max(0.0))
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// exhausts the attempt budget, or `on_retry` breaks.
    ///
    /// `on_retry(attempt, error, delay)` is called before each sleep with the
    /// 1-based number of the attempt that just failed.
    pub async fn execute_with_retry<T, E, F, Fut, R>(
        &self,
        key: &str,
        mut operation: F,
        mut on_retry: R,
    ) -> Result<T, E>
    where
        E: RetryableError,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: FnMut(u32, &E, Duration) -> ControlFlow<()>,
    {
        let _guard = self.begin_run(key);
        let mut attempt: u32 = 0;

        loop {
            let err = match operation().await {
                Ok(value) => {
                    self.record_success(key);
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !self.is_retryable(&err) {
                debug!(key = %key, error = %err, "Non-retryable error");
                self.record_error(key, &err);
                return Err(err);
            }

            attempt += 1;
            if attempt >= self.config.max_retries {
                self.record_failure(key, &err, None);
                warn!(key = %key, attempts = attempt, error = %err, "Retries exhausted");
                return Err(err);
            }

            let delay = self.jittered_delay(attempt - 1);
            self.record_failure(key, &err, Some(delay));

            if on_retry(attempt, &err, delay).is_break() {
                debug!(key = %key, attempt, "Retry aborted by caller");
                return Err(err);
            }

            debug!(
                key = %key,
                attempt,
                max = self.config.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Drop state untouched for longer than `max_age`. In-flight keys are kept.
    pub fn cleanup(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let mut states = self.lock();
        let before = states.len();
        states.retain(|_, state| {
            state.in_flight > 0 || now.saturating_duration_since(state.last_activity) <= max_age
        });
        before - states.len()
    }

    /// Forget a key entirely.
    pub fn reset(&self, key: &str) {
        self.lock().remove(key);
    }

    pub fn stats(&self) -> RetryStats {
        self.lock()
            .iter()
            .map(|(key, state)| {
                let average_delay_ms = if state.delays == 0 {
                    0
                } else {
                    (state.total_delay / state.delays).as_millis() as u64
                };
                (
                    key.clone(),
                    RetryKeyStats {
                        attempts: state.attempts,
                        in_flight: state.in_flight > 0,
                        last_error: state.last_error.clone(),
                        next_retry_at: state.next_retry_at,
                        average_delay_ms,
                    },
                )
            })
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, RetryState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin_run(&self, key: &str) -> InFlightGuard<'_> {
        let mut states = self.lock();
        let state = states.entry(key.to_string()).or_insert_with(RetryState::new);
        // A new call always starts a fresh run, even after an exhausted one.
        state.attempts = 0;
        state.next_retry_at = None;
        state.delays = 0;
        state.total_delay = Duration::ZERO;
        state.in_flight += 1;
        state.last_activity = Instant::now();
        InFlightGuard {
            manager: self,
            key: key.to_string(),
        }
    }

    fn record_success(&self, key: &str) {
        if let Some(state) = self.lock().get_mut(key) {
            state.attempts = 0;
            state.last_error = None;
            state.next_retry_at = None;
            state.last_activity = Instant::now();
        }
    }

    fn record_error<E: RetryableError>(&self, key: &str, err: &E) {
        if let Some(state) = self.lock().get_mut(key) {
            state.last_error = Some(err.to_string());
            state.next_retry_at = None;
            state.last_activity = Instant::now();
        }
    }

    fn record_failure<E: RetryableError>(&self, key: &str, err: &E, delay: Option<Duration>) {
        if let Some(state) = self.lock().get_mut(key) {
            state.attempts += 1;
            state.last_error = Some(err.to_string());
            state.last_activity = Instant::now();
            state.next_retry_at = delay.and_then(|d| {
                chrono::Duration::from_std(d).ok().map(|d| Utc::now() + d)
            });
            if let Some(d) = delay {
                state.delays += 1;
                state.total_delay += d;
            }
        }
    }
}

/// Clears the in-flight mark when a run ends, including on cancellation.
struct InFlightGuard<'a> {
    manager: &'a RetryManager,
    key: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if let Some(state) = self.manager.lock().get_mut(&self.key) {
            state.in_flight = state.in_flight.saturating_sub(1);
            state.last_activity = Instant::now();
        }
    }
}
