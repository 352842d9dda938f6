//! IMAP mail source: fetches unseen RFC 822 messages over TLS.
//!
//! Messages are fetched with `BODY.PEEK[]` so the server does not flag them
//! as seen; `\Seen` is only set in `acknowledge`, after the cycle that used
//! them completed.

use std::io::{Read, Write as IoWrite};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info};

use crate::config::{env_parse, env_required};
use crate::error::{ConfigError, MailError};
use crate::mail::{MailSource, RawMessage};

/// IMAP connection settings.
#[derive(Debug, Clone)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub mailbox: String,
    /// IMAP SEARCH criteria selecting candidate messages.
    pub search: String,
    pub max_messages: usize,
}

impl ImapConfig {
    /// Build from `JOB_TRACKER_IMAP_*` variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            host: env_required("JOB_TRACKER_IMAP_HOST")?,
            port: env_parse("JOB_TRACKER_IMAP_PORT", 993)?,
            username: env_required("JOB_TRACKER_IMAP_USERNAME")?,
            password: SecretString::from(env_required("JOB_TRACKER_IMAP_PASSWORD")?),
            mailbox: std::env::var("JOB_TRACKER_IMAP_MAILBOX").unwrap_or_else(|_| "INBOX".into()),
            search: std::env::var("JOB_TRACKER_IMAP_SEARCH").unwrap_or_else(|_| "UNSEEN".into()),
            max_messages: env_parse("JOB_TRACKER_MAX_MESSAGES_PER_CYCLE", 200)?,
        })
    }
}

/// IMAP-backed `MailSource`.
pub struct ImapMailSource {
    config: ImapConfig,
}

impl ImapMailSource {
    pub fn new(config: ImapConfig) -> Self {
        Self { config }
    }

    fn fetch_error(reason: impl std::fmt::Display) -> MailError {
        MailError::FetchFailed {
            source_name: "imap".into(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl MailSource for ImapMailSource {
    fn name(&self) -> &str {
        "imap"
    }

    async fn fetch_batch(&self) -> Result<Vec<RawMessage>, MailError> {
        let cfg = self.config.clone();
        let messages = tokio::task::spawn_blocking(move || fetch_unseen(&cfg))
            .await
            .map_err(|e| MailError::TaskPanicked(e.to_string()))?
            .map_err(Self::fetch_error)?;
        info!(count = messages.len(), host = %self.config.host, "Fetched raw messages");
        Ok(messages)
    }

    async fn acknowledge(&self, provider_message_ids: &[String]) -> Result<(), MailError> {
        if provider_message_ids.is_empty() {
            return Ok(());
        }
        let cfg = self.config.clone();
        let uids = provider_message_ids.to_vec();
        tokio::task::spawn_blocking(move || mark_seen(&cfg, &uids))
            .await
            .map_err(|e| MailError::TaskPanicked(e.to_string()))?
            .map_err(|e| MailError::AcknowledgeFailed {
                source_name: "imap".into(),
                reason: e.to_string(),
            })
    }
}

/// Error type for blocking IMAP operations.
type ImapError = Box<dyn std::error::Error + Send + Sync>;

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

/// Minimal blocking IMAP session over rustls.
struct ImapSession {
    tls: TlsStream,
    tag_counter: u32,
}

impl ImapSession {
    fn connect(config: &ImapConfig) -> Result<Self, ImapError> {
        let tcp = TcpStream::connect((&*config.host, config.port))?;
        tcp.set_read_timeout(Some(Duration::from_secs(30)))?;

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        let server_name = rustls_pki_types::ServerName::try_from(config.host.clone())?;
        let conn = rustls::ClientConnection::new(tls_config, server_name)?;

        let mut session = Self {
            tls: rustls::StreamOwned::new(conn, tcp),
            tag_counter: 0,
        };
        let _greeting = session.read_line()?;

        session.command_ok(&format!(
            "LOGIN {} {}",
            quote(&config.username),
            quote(config.password.expose_secret())
        ))?;
        session.command_ok(&format!("SELECT {}", quote(&config.mailbox)))?;
        Ok(session)
    }

    fn read_line(&mut self) -> Result<Vec<u8>, ImapError> {
        let mut buf = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            match self.tls.read(&mut byte) {
                Ok(0) => return Err("IMAP connection closed".into()),
                Ok(_) => {
                    buf.push(byte[0]);
                    if buf.ends_with(b"\r\n") {
                        return Ok(buf);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn next_tag(&mut self) -> String {
        self.tag_counter += 1;
        format!("A{}", self.tag_counter)
    }

    /// Send a command and require a tagged `OK` completion.
    fn command_ok(&mut self, cmd: &str) -> Result<Vec<String>, ImapError> {
        let tag = self.next_tag();
        let lines: Vec<String> = self
            .exchange(&tag, cmd)?
            .into_iter()
            .map(|l| String::from_utf8_lossy(&l).to_string())
            .collect();
        if is_tagged_ok(&lines, &tag) {
            return Ok(lines);
        }
        // Only the verb: LOGIN arguments carry the password.
        let verb = cmd.split_whitespace().next().unwrap_or_default();
        Err(format!(
            "IMAP {verb} failed: {}",
            lines.last().map(|l| l.trim()).unwrap_or("no completion")
        )
        .into())
    }

    fn command_raw(&mut self, cmd: &str) -> Result<Vec<Vec<u8>>, ImapError> {
        let tag = self.next_tag();
        self.exchange(&tag, cmd)
    }

    /// Send a tagged command and collect response lines up to its completion.
    fn exchange(&mut self, tag: &str, cmd: &str) -> Result<Vec<Vec<u8>>, ImapError> {
        let full = format!("{tag} {cmd}\r\n");
        self.tls.write_all(full.as_bytes())?;
        self.tls.flush()?;
        let completion = format!("{tag} ");
        let mut lines = Vec::new();
        loop {
            let line = self.read_line()?;
            let done = line.starts_with(completion.as_bytes());
            lines.push(line);
            if done {
                break;
            }
        }
        Ok(lines)
    }

    fn logout(mut self) {
        let _ = self.command_raw("LOGOUT");
    }
}

/// Quote an IMAP string argument.
fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Fetch candidate messages without flagging them (blocking).
fn fetch_unseen(config: &ImapConfig) -> Result<Vec<RawMessage>, ImapError> {
    let mut session = ImapSession::connect(config)?;

    let search = session.command_ok(&format!("UID SEARCH {}", config.search))?;
    let uids = parse_search_response(&search);
    debug!(found = uids.len(), "IMAP search complete");

    let mut results = Vec::new();
    for uid in uids.iter().take(config.max_messages) {
        let lines = session.command_raw(&format!("UID FETCH {uid} (INTERNALDATE BODY.PEEK[])"))?;
        if let Some((payload, internal_date)) = parse_fetch_response(&lines) {
            let mut raw = RawMessage::new(uid.clone(), payload);
            raw.received_hint = internal_date;
            results.push(raw);
        }
    }

    session.logout();
    Ok(results)
}

/// Flag processed messages as seen (blocking).
fn mark_seen(config: &ImapConfig, uids: &[String]) -> Result<(), ImapError> {
    let mut session = ImapSession::connect(config)?;
    let set = uids.join(",");
    let stored = session.command_ok(&format!("UID STORE {set} +FLAGS (\\Seen)"));
    session.logout();
    stored.map(|_| ())
}

/// Whether the completion line is `<tag> OK`.
fn is_tagged_ok(lines: &[String], tag: &str) -> bool {
    lines.last().is_some_and(|line| {
        let mut parts = line.split_whitespace();
        parts.next() == Some(tag) && parts.next().is_some_and(|s| s.eq_ignore_ascii_case("OK"))
    })
}

/// Collect UIDs from `* SEARCH ...` lines.
fn parse_search_response(lines: &[String]) -> Vec<String> {
    lines
        .iter()
        .filter(|l| l.starts_with("* SEARCH"))
        .flat_map(|l| l.split_whitespace().skip(2).map(str::to_string))
        .collect()
}

/// Extract the message literal and INTERNALDATE from a FETCH response.
///
/// The first line announces the literal size as `{N}`; the literal is the
/// next N bytes regardless of line structure.
fn parse_fetch_response(lines: &[Vec<u8>]) -> Option<(Vec<u8>, Option<DateTime<Utc>>)> {
    let header_idx = lines
        .iter()
        .position(|l| l.starts_with(b"* ") && l.windows(7).any(|w| w == b" FETCH "))?;
    let header = String::from_utf8_lossy(&lines[header_idx]).to_string();

    let open = header.rfind('{')?;
    let close = header[open..].find('}')? + open;
    let size: usize = header[open + 1..close].parse().ok()?;

    let mut payload = Vec::with_capacity(size);
    for line in &lines[header_idx + 1..] {
        if payload.len() >= size {
            break;
        }
        payload.extend_from_slice(line);
    }
    payload.truncate(size);

    Some((payload, parse_internal_date(&header)))
}

fn parse_internal_date(header: &str) -> Option<DateTime<Utc>> {
    let start = header.find("INTERNALDATE \"")? + "INTERNALDATE \"".len();
    let end = header[start..].find('"')? + start;
    DateTime::parse_from_str(header[start..end].trim(), "%d-%b-%Y %H:%M:%S %z")
        .ok()
        .map(|d| d.with_timezone(&Utc))
}
