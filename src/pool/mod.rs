//! Per-department IMAP connection pool guarded by circuit breakers.

pub mod breaker;
pub mod connection_pool;

use std::sync::Arc;
use std::time::Duration;

use crate::mailbox::MailboxClient;

pub use breaker::{Admission, BreakerSnapshot, BreakerState, CircuitBreaker};
pub use connection_pool::{ConnectionPool, HealthMetrics, PoolEntrySummary, PoolStats};

/// A pooled mailbox session. Held locked for the duration of a mailbox scan.
pub type SharedMailbox = Arc<tokio::sync::Mutex<Box<dyn MailboxClient>>>;

/// Pool and breaker tuning.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Entries unused for longer than this are evicted by the cleanup sweep.
    pub idle_timeout: Duration,
    /// Consecutive failures before a breaker opens.
    pub breaker_threshold: u32,
    /// Time an open breaker rejects requests before admitting a probe.
    pub breaker_cooldown: Duration,
    /// Upper bound for a NOOP ping or a best-effort logout.
    pub ping_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            breaker_threshold: 3,
            breaker_cooldown: Duration::from_secs(60),
            ping_timeout: Duration::from_secs(10),
        }
    }
}
