//! Composition root: owns the pool, retry state and background tasks.

use std::future::Future;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::events::{EventBus, WorkerEvent};
use super::status::WorkerStatus;
use super::sync::{DepartmentSync, TickReport};
use crate::config::WorkerConfig;
use crate::error::{Error, WorkerError};
use crate::mailbox::MailboxConnector;
use crate::parser::EmailParser;
use crate::pool::ConnectionPool;
use crate::retry::RetryManager;
use crate::store::HelpdeskStore;
use crate::ticket::TicketMaterializer;

/// Email-to-ticket ingestion worker.
///
/// `start` runs one pass immediately and then three periodic tasks: sync,
/// pool cleanup and health check. `stop` waits for all of them to exit.
pub struct HelpdeskWorker {
    config: WorkerConfig,
    pool: Arc<ConnectionPool>,
    retry: Arc<RetryManager>,
    sync: Arc<DepartmentSync>,
    events: EventBus,
    /// Running flag. The shutdown signal is only written while this is held.
    running: std::sync::Mutex<bool>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl HelpdeskWorker {
    pub fn new(
        config: WorkerConfig,
        store: Arc<dyn HelpdeskStore>,
        connector: Arc<dyn MailboxConnector>,
        parser: Arc<dyn EmailParser>,
    ) -> Self {
        let retry = Arc::new(RetryManager::new(config.retry.clone()));
        let pool = Arc::new(ConnectionPool::new(
            config.pool.clone(),
            connector,
            Arc::clone(&retry),
        ));
        let events = EventBus::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sync = Arc::new(DepartmentSync::new(
            TicketMaterializer::new(store, parser),
            Arc::clone(&pool),
            events.clone(),
            config.mailbox.clone(),
            shutdown_rx,
        ));

        Self {
            config,
            pool,
            retry,
            sync,
            events,
            running: std::sync::Mutex::new(false),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Start the worker. Fails if it is already running.
    pub async fn start(&self) -> Result<(), WorkerError> {
        // Held until the tasks are spawned so a concurrent `stop` waits for them.
        let mut tasks = self.tasks.lock().await;
        {
            let mut running = self.lock_running();
            if *running {
                return Err(WorkerError::AlreadyRunning);
            }
            *running = true;
            self.shutdown_tx.send_replace(false);
        }

        info!(
            sync_interval_secs = self.config.sync_interval.as_secs(),
            "Helpdesk worker started"
        );
        self.events.emit(WorkerEvent::Started);

        self.sync.run_pass().await;

        if *self.shutdown_tx.borrow() {
            debug!("Stopped during the initial pass, not spawning tasks");
            return Ok(());
        }

        let sync = Arc::clone(&self.sync);
        tasks.push(self.spawn_periodic("sync", self.config.sync_interval, move || {
            let sync = Arc::clone(&sync);
            async move {
                sync.run_pass().await;
            }
        }));

        let pool = Arc::clone(&self.pool);
        let retry = Arc::clone(&self.retry);
        let retention = self.config.retry_retention;
        tasks.push(self.spawn_periodic(
            "pool-cleanup",
            self.config.pool_cleanup_interval,
            move || {
                let pool = Arc::clone(&pool);
                let retry = Arc::clone(&retry);
                async move {
                    pool.cleanup_idle().await;
                    let reaped = retry.cleanup(retention);
                    if reaped > 0 {
                        debug!(reaped, "Reaped stale retry state");
                    }
                }
            },
        ));

        let pool = Arc::clone(&self.pool);
        tasks.push(self.spawn_periodic(
            "health-check",
            self.config.health_check_interval,
            move || {
                let pool = Arc::clone(&pool);
                async move {
                    let failed = pool.health_check().await;
                    if failed > 0 {
                        warn!(failed, "Health check found dead connections");
                    }
                }
            },
        ));

        Ok(())
    }

    /// Stop the worker and wait for every task to finish. Idempotent.
    pub async fn stop(&self) {
        {
            let mut running = self.lock_running();
            if !*running {
                return;
            }
            *running = false;
            self.shutdown_tx.send_replace(true);
        }

        let mut tasks = self.tasks.lock().await;
        if self.is_running() {
            // Restarted while we waited; the tasks belong to the new run.
            drop(tasks);
            self.events.emit(WorkerEvent::Stopped);
            info!("Helpdesk worker stopped");
            return;
        }
        for handle in tasks.drain(..) {
            if let Err(e) = handle.await {
                warn!(error = %e, "Worker task ended abnormally");
            }
        }
        drop(tasks);

        self.pool.close_all().await;
        self.events.emit(WorkerEvent::Stopped);
        info!("Helpdesk worker stopped");
    }

    /// One sync pass without the periodic tasks. Pooled connections are
    /// closed afterwards.
    pub async fn run_once(&self) -> Result<TickReport, Error> {
        {
            let running = self.lock_running();
            if *running {
                return Err(WorkerError::AlreadyRunning.into());
            }
            self.shutdown_tx.send_replace(false);
        }
        let report = self.sync.run_tick().await;
        self.pool.close_all().await;
        report
    }

    pub fn is_running(&self) -> bool {
        *self.lock_running()
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, bool> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> WorkerStatus {
        WorkerStatus {
            is_running: self.is_running(),
            pool_stats: self.pool.stats(),
            connection_pool: self.pool.entries(),
            circuit_breakers: self.pool.breakers(),
            health_metrics: self.pool.health_metrics(),
            retry_stats: self.retry.stats(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Spawn a task that runs `job` every `period` until shutdown. The first
    /// run happens one period from now. A running job is never interrupted.
    fn spawn_periodic<F, Fut>(&self, name: &'static str, period: Duration, mut job: F) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            debug!(task = name, period_secs = period.as_secs(), "Worker task started");

            // Any change after spawning is this run's stop, even if a restart
            // has already flipped the flag back.
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        if shutdown.has_changed().unwrap_or(true) || *shutdown.borrow() {
                            break;
                        }
                        job().await;
                    }
                }
            }
            debug!(task = name, "Worker task stopped");
        })
    }
}
