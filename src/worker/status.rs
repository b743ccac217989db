//! Read-only worker status snapshot.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::pool::{BreakerSnapshot, HealthMetrics, PoolEntrySummary, PoolStats};
use crate::retry::RetryStats;

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub is_running: bool,
    pub pool_stats: PoolStats,
    /// Live pool entries keyed by department id.
    pub connection_pool: BTreeMap<String, PoolEntrySummary>,
    /// Breakers of every department seen since start, pooled or not.
    pub circuit_breakers: BTreeMap<String, BreakerSnapshot>,
    pub health_metrics: HealthMetrics,
    pub retry_stats: RetryStats,
}
