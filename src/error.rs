//! Error types for the helpdesk ingestion worker.

use std::io;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Mailbox error: {0}")]
    Mailbox(#[from] MailboxError),

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Errors raised by a mailbox session.
///
/// The `Display` output always carries the error code so that code and
/// message substring matching agree.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MailboxError {
    #[error("{code}: {message}")]
    Network { code: &'static str, message: String },

    #[error("IMAP_TIMEOUT: Connection timeout during {0}")]
    Timeout(String),

    #[error("IMAP_CONNECTION_LOST: {0}")]
    ConnectionLost(String),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("IMAP protocol error: {0}")]
    Protocol(String),

    #[error("Invalid mailbox configuration: {0}")]
    Config(String),
}

impl MailboxError {
    /// Machine-readable error code, if the error has one.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Network { code, .. } => Some(*code),
            Self::Timeout(_) => Some("IMAP_TIMEOUT"),
            Self::ConnectionLost(_) => Some("IMAP_CONNECTION_LOST"),
            Self::AuthFailed(_) => Some("AUTH_FAILED"),
            Self::Tls(_) | Self::Protocol(_) | Self::Config(_) => None,
        }
    }

    /// Whether the underlying session can no longer be used.
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            Self::Network { .. } | Self::Timeout(_) | Self::ConnectionLost(_)
        )
    }
}

impl From<io::Error> for MailboxError {
    fn from(err: io::Error) -> Self {
        let message = err.to_string();
        let code = match err.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => "ECONNRESET",
            io::ErrorKind::ConnectionRefused => "ECONNREFUSED",
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => "ETIMEDOUT",
            io::ErrorKind::HostUnreachable => "EHOSTUNREACH",
            io::ErrorKind::NetworkUnreachable => "ENETUNREACH",
            io::ErrorKind::UnexpectedEof => return Self::ConnectionLost(message),
            _ => dns_code(&message).unwrap_or("EIO"),
        };
        Self::Network { code, message }
    }
}

/// Resolver failures surface as uncategorized io errors; recognise them by text.
fn dns_code(message: &str) -> Option<&'static str> {
    let lower = message.to_lowercase();
    if lower.contains("temporary failure in name resolution") {
        Some("EAI_AGAIN")
    } else if lower.contains("failed to lookup address")
        || lower.contains("name or service not known")
        || lower.contains("no such host")
    {
        Some("ENOTFOUND")
    } else {
        None
    }
}

/// Connection pool errors.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Circuit breaker open for department {department_id}")]
    CircuitOpen { department_id: String },

    #[error("No IMAP connection for department {department_id}: {source}")]
    Unavailable {
        department_id: String,
        #[source]
        source: MailboxError,
    },
}

/// Worker lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Worker is already running")]
    AlreadyRunning,
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
