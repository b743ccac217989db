use std::sync::Arc;

use anyhow::Context;
use tokio::sync::broadcast;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use helpdesk_ingest::config::{AppConfig, WorkerConfig};
use helpdesk_ingest::mailbox::ImapConnector;
use helpdesk_ingest::parser::KeywordParser;
use helpdesk_ingest::store::{HelpdeskStore, LibSqlBackend};
use helpdesk_ingest::worker::{HelpdeskWorker, WorkerEvent};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    let app = AppConfig::from_env().context("Invalid process configuration")?;
    let worker_config = WorkerConfig::from_env().context("Invalid worker configuration")?;
    let once = std::env::args().skip(1).any(|arg| arg == "--once");

    // ── Logging ─────────────────────────────────────────────────────────
    let (file_layer, _log_guard) = match &app.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "helpdesk-ingest.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(file_layer)
        .init();

    eprintln!("📬 Helpdesk ingest v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", app.db_path.display());
    eprintln!("   Sync every {}s", worker_config.sync_interval.as_secs());

    // ── Database ─────────────────────────────────────────────────────────
    let store = LibSqlBackend::new_local(&app.db_path)
        .await
        .with_context(|| format!("Failed to open database at {}", app.db_path.display()))?;
    let store: Arc<dyn HelpdeskStore> = Arc::new(store);

    // ── Worker ───────────────────────────────────────────────────────────
    let connector = Arc::new(ImapConnector::new(app.connect_timeout, app.io_timeout));
    let worker = Arc::new(HelpdeskWorker::new(
        worker_config,
        store,
        connector,
        Arc::new(KeywordParser::new()),
    ));

    if once {
        let report = worker.run_once().await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let mut events = worker.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(WorkerEvent::TicketCreated { department_id, ticket }) => info!(
                    department_id = %department_id,
                    ticket_number = ticket.number,
                    subject = %ticket.subject,
                    "New ticket"
                ),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Event listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    worker.start().await?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");
    worker.stop().await;

    match serde_json::to_string(&worker.status()) {
        Ok(status) => info!(status = %status, "Final worker status"),
        Err(e) => error!(error = %e, "Failed to serialize final worker status"),
    }
    Ok(())
}
