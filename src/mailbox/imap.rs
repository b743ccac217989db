//! Raw IMAP4rev1 client over rustls (or plain TCP).
//!
//! `ImapSession` is a blocking, persistent session. `ImapMailbox` adapts it to
//! the async [`MailboxClient`] trait by moving it onto the blocking pool for
//! each command.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use tracing::debug;

use super::{MailboxClient, MailboxConnector};
use crate::error::MailboxError;
use crate::model::Department;

// ── Transport ───────────────────────────────────────────────────────

enum Transport {
    Tls(Box<rustls::StreamOwned<rustls::ClientConnection, TcpStream>>),
    Plain(TcpStream),
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tls(s) => s.read(buf),
            Self::Plain(s) => s.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Tls(s) => s.write(buf),
            Self::Plain(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Tls(s) => s.flush(),
            Self::Plain(s) => s.flush(),
        }
    }
}

fn tls_config() -> Result<Arc<rustls::ClientConfig>, MailboxError> {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| MailboxError::Tls(e.to_string()))?
        .with_root_certificates(root_store)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

// ── Responses ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Ok,
    No,
    Bad,
}

#[derive(Debug)]
struct Response {
    untagged: Vec<String>,
    literals: Vec<Vec<u8>>,
    status: Status,
    text: String,
}

/// Length of a trailing `{N}` literal marker, if the line ends with one.
fn literal_len(line: &str) -> Option<usize> {
    let line = line.trim_end();
    let body = line.strip_suffix('}')?;
    let open = body.rfind('{')?;
    body[open + 1..].trim_end_matches('+').parse().ok()
}

/// Parse the tagged completion line `<tag> OK|NO|BAD text`.
fn parse_tagged(line: &str, tag: &str) -> Option<(Status, String)> {
    let rest = line.strip_prefix(tag)?.strip_prefix(' ')?;
    let (word, text) = rest.split_once(' ').unwrap_or((rest, ""));
    let status = match word.to_ascii_uppercase().as_str() {
        "OK" => Status::Ok,
        "NO" => Status::No,
        "BAD" => Status::Bad,
        _ => return None,
    };
    Some((status, text.trim().to_string()))
}

fn parse_search(lines: &[String]) -> Vec<u32> {
    lines
        .iter()
        .filter_map(|line| line.strip_prefix("* SEARCH"))
        .flat_map(|rest| rest.split_whitespace().filter_map(|n| n.parse().ok()))
        .collect()
}

/// Quote a string for use as an IMAP quoted-string.
fn quote(value: &str) -> Result<String, MailboxError> {
    if value.contains(['\r', '\n']) {
        return Err(MailboxError::Config(
            "IMAP strings may not contain line breaks".into(),
        ));
    }
    Ok(format!(
        "\"{}\"",
        value.replace('\\', "\\\\").replace('"', "\\\"")
    ))
}

// ── Session ─────────────────────────────────────────────────────────

/// Largest `{N}` literal accepted from the server.
pub const MAX_LITERAL_BYTES: usize = 50 * 1024 * 1024;

/// A blocking IMAP session. Run every method inside `spawn_blocking`.
pub struct ImapSession {
    reader: BufReader<Transport>,
    next_tag: u32,
    max_literal: usize,
    /// Set once the stream is out of step with the server.
    desynced: bool,
}

impl ImapSession {
    /// Open a TCP (optionally TLS) connection and read the server greeting.
    pub fn connect(
        host: &str,
        port: u16,
        secure: bool,
        connect_timeout: Duration,
        io_timeout: Duration,
    ) -> Result<Self, MailboxError> {
        let addrs: Vec<_> = (host, port).to_socket_addrs()?.collect();
        let mut last_err = None;
        let mut tcp = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, connect_timeout) {
                Ok(stream) => {
                    tcp = Some(stream);
                    break;
                }
                Err(e) => last_err = Some(e),
            }
        }
        let tcp = match (tcp, last_err) {
            (Some(tcp), _) => tcp,
            (None, Some(e)) if e.kind() == io::ErrorKind::TimedOut => {
                return Err(MailboxError::Timeout("connect".into()));
            }
            (None, Some(e)) => return Err(e.into()),
            (None, None) => {
                return Err(MailboxError::Network {
                    code: "ENOTFOUND",
                    message: format!("no addresses for {host}"),
                });
            }
        };
        tcp.set_read_timeout(Some(io_timeout))?;
        tcp.set_write_timeout(Some(io_timeout))?;

        let transport = if secure {
            let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
                .map_err(|e| MailboxError::Config(format!("invalid IMAP host {host:?}: {e}")))?;
            let conn = rustls::ClientConnection::new(tls_config()?, server_name)
                .map_err(|e| MailboxError::Tls(e.to_string()))?;
            Transport::Tls(Box::new(rustls::StreamOwned::new(conn, tcp)))
        } else {
            Transport::Plain(tcp)
        };

        let mut session = Self {
            reader: BufReader::new(transport),
            next_tag: 1,
            max_literal: MAX_LITERAL_BYTES,
            desynced: false,
        };

        let greeting = session.read_line("greeting")?;
        let greeting = String::from_utf8_lossy(&greeting);
        if !greeting.starts_with("* OK") && !greeting.starts_with("* PREAUTH") {
            return Err(MailboxError::Protocol(format!(
                "unexpected greeting: {}",
                greeting.trim_end()
            )));
        }
        Ok(session)
    }

    pub fn login(&mut self, user: &str, password: &str) -> Result<(), MailboxError> {
        let command = format!("LOGIN {} {}", quote(user)?, quote(password)?);
        let response = self.command("LOGIN", &command)?;
        match response.status {
            Status::Ok => Ok(()),
            _ => Err(MailboxError::AuthFailed(response.text)),
        }
    }

    pub fn select(&mut self, mailbox: &str) -> Result<(), MailboxError> {
        let command = format!("SELECT {}", quote(mailbox)?);
        self.command("SELECT", &command)?.ok("SELECT").map(|_| ())
    }

    pub fn uid_search_unseen(&mut self) -> Result<Vec<u32>, MailboxError> {
        let response = self.command("SEARCH", "UID SEARCH UNSEEN")?.ok("SEARCH")?;
        Ok(parse_search(&response.untagged))
    }

    pub fn uid_fetch_rfc822(&mut self, uid: u32) -> Result<Option<Vec<u8>>, MailboxError> {
        let command = format!("UID FETCH {uid} (RFC822)");
        let mut response = self.command("FETCH", &command)?.ok("FETCH")?;
        Ok(response.literals.pop())
    }

    pub fn uid_store_seen(&mut self, uid: u32) -> Result<(), MailboxError> {
        let command = format!("UID STORE {uid} +FLAGS (\\Seen)");
        self.command("STORE", &command)?.ok("STORE").map(|_| ())
    }

    pub fn noop(&mut self) -> Result<(), MailboxError> {
        self.command("NOOP", "NOOP")?.ok("NOOP").map(|_| ())
    }

    pub fn logout(&mut self) -> Result<(), MailboxError> {
        self.command("LOGOUT", "LOGOUT").map(|_| ())
    }

    fn command(&mut self, verb: &str, command: &str) -> Result<Response, MailboxError> {
        if self.desynced {
            return Err(MailboxError::ConnectionLost(format!(
                "session unusable after an oversized literal, cannot {verb}"
            )));
        }
        let tag = format!("A{:04}", self.next_tag);
        self.next_tag += 1;

        let line = format!("{tag} {command}\r\n");
        let writer = self.reader.get_mut();
        writer
            .write_all(line.as_bytes())
            .and_then(|()| writer.flush())
            .map_err(|e| map_io(e, verb))?;

        let mut untagged = Vec::new();
        let mut literals = Vec::new();
        loop {
            let raw = self.read_line(verb)?;
            let line = String::from_utf8_lossy(&raw).trim_end().to_string();

            if let Some(n) = literal_len(&line) {
                if n > self.max_literal {
                    // The unread literal leaves the stream mid-response.
                    self.desynced = true;
                    return Err(MailboxError::Protocol(format!(
                        "{verb} literal of {n} bytes exceeds the {} byte limit",
                        self.max_literal
                    )));
                }
                let mut literal = vec![0u8; n];
                self.reader
                    .read_exact(&mut literal)
                    .map_err(|e| map_io(e, verb))?;
                literals.push(literal);
                untagged.push(line);
                continue;
            }

            if let Some((status, text)) = parse_tagged(&line, &tag) {
                return Ok(Response {
                    untagged,
                    literals,
                    status,
                    text,
                });
            }
            untagged.push(line);
        }
    }

    fn read_line(&mut self, verb: &str) -> Result<Vec<u8>, MailboxError> {
        let mut buf = Vec::new();
        let n = self
            .reader
            .read_until(b'\n', &mut buf)
            .map_err(|e| map_io(e, verb))?;
        if n == 0 {
            return Err(MailboxError::ConnectionLost(format!(
                "server closed the connection during {verb}"
            )));
        }
        Ok(buf)
    }
}

impl Response {
    fn ok(self, verb: &str) -> Result<Self, MailboxError> {
        match self.status {
            Status::Ok => Ok(self),
            Status::No | Status::Bad => Err(MailboxError::Protocol(format!(
                "{verb} rejected: {}",
                self.text
            ))),
        }
    }
}

fn map_io(err: io::Error, verb: &str) -> MailboxError {
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
            MailboxError::Timeout(verb.to_string())
        }
        _ => err.into(),
    }
}

// ── Async adapter ───────────────────────────────────────────────────

/// Async [`MailboxClient`] backed by a blocking [`ImapSession`].
pub struct ImapMailbox {
    session: Option<ImapSession>,
}

impl ImapMailbox {
    pub fn new(session: ImapSession) -> Self {
        Self {
            session: Some(session),
        }
    }

    /// Run `op` on the blocking pool. A lost connection discards the session.
    async fn run<T, F>(&mut self, op: F) -> Result<T, MailboxError>
    where
        T: Send + 'static,
        F: FnOnce(&mut ImapSession) -> Result<T, MailboxError> + Send + 'static,
    {
        let mut session = self
            .session
            .take()
            .ok_or_else(|| MailboxError::ConnectionLost("session already closed".into()))?;

        let (session, result) = tokio::task::spawn_blocking(move || {
            let result = op(&mut session);
            (session, result)
        })
        .await
        .map_err(|e| MailboxError::ConnectionLost(format!("IMAP task failed: {e}")))?;

        if !result.as_ref().is_err_and(|e| e.is_connection_lost()) {
            self.session = Some(session);
        }
        result
    }
}

#[async_trait]
impl MailboxClient for ImapMailbox {
    async fn select(&mut self, mailbox: &str) -> Result<(), MailboxError> {
        let mailbox = mailbox.to_string();
        self.run(move |s| s.select(&mailbox)).await
    }

    async fn search_unseen(&mut self) -> Result<Vec<u32>, MailboxError> {
        self.run(ImapSession::uid_search_unseen).await
    }

    async fn fetch(&mut self, uid: u32) -> Result<Option<Vec<u8>>, MailboxError> {
        self.run(move |s| s.uid_fetch_rfc822(uid)).await
    }

    async fn mark_seen(&mut self, uid: u32) -> Result<(), MailboxError> {
        self.run(move |s| s.uid_store_seen(uid)).await
    }

    async fn noop(&mut self) -> Result<(), MailboxError> {
        self.run(ImapSession::noop).await
    }

    async fn logout(&mut self) -> Result<(), MailboxError> {
        let result = self.run(ImapSession::logout).await;
        self.session = None;
        result
    }
}

/// Opens authenticated IMAP sessions from department settings.
#[derive(Debug, Clone)]
pub struct ImapConnector {
    connect_timeout: Duration,
    io_timeout: Duration,
}

impl ImapConnector {
    pub fn new(connect_timeout: Duration, io_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            io_timeout,
        }
    }
}

#[async_trait]
impl MailboxConnector for ImapConnector {
    async fn connect(
        &self,
        department: &Department,
    ) -> Result<Box<dyn MailboxClient>, MailboxError> {
        let missing = |field: &str| {
            MailboxError::Config(format!("department {} has no IMAP {field}", department.id))
        };
        let host = department.imap_host.clone().ok_or_else(|| missing("host"))?;
        let user = department.imap_user.clone().ok_or_else(|| missing("user"))?;
        let password = department
            .imap_password
            .as_ref()
            .map(|p| p.expose_secret().to_string())
            .ok_or_else(|| missing("password"))?;
        let port = department.imap_port;
        let secure = department.imap_secure;
        let (connect_timeout, io_timeout) = (self.connect_timeout, self.io_timeout);

        debug!(department_id = %department.id, host = %host, port, secure, "Opening IMAP session");

        let session = tokio::task::spawn_blocking(move || {
            let mut session = ImapSession::connect(&host, port, secure, connect_timeout, io_timeout)?;
            session.login(&user, &password)?;
            Ok::<_, MailboxError>(session)
        })
        .await
        .map_err(|e| MailboxError::ConnectionLost(format!("IMAP connect task failed: {e}")))??;

        Ok(Box::new(ImapMailbox::new(session)))
    }
}
