//! Raw IMAP4-over-TLS client (blocking — run under `spawn_blocking`).
//!
//! Implements the small command set the ingestion engine needs: LOGIN,
//! SELECT INBOX, UID SEARCH, UID FETCH (RFC822, without marking seen),
//! UID STORE +FLAGS (\Seen), LOGOUT. UID variants keep message references
//! stable across connections, which matters because marking seen happens on
//! a separate session after processing.

use std::io::Write as IoWrite;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::ImapConfig;
use crate::error::IngestError;
use crate::ingest::filters::SearchCriteria;

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

/// An authenticated IMAP session with INBOX selected lazily.
pub struct ImapSession {
    tls: TlsStream,
    host: String,
    tag_counter: u32,
}

impl ImapSession {
    /// Connect, perform the TLS handshake, read the greeting, and log in.
    /// The connect and read timeouts are both bounded by `auth_timeout`.
    pub fn connect(config: &ImapConfig) -> Result<Self, IngestError> {
        let addr = (config.host.as_str(), config.port)
            .to_socket_addrs()
            .map_err(|e| connection_err(&config.host, format!("address resolution: {e}")))?
            .next()
            .ok_or_else(|| connection_err(&config.host, "no address resolved".to_string()))?;

        let tcp = TcpStream::connect_timeout(&addr, config.auth_timeout)
            .map_err(|e| connection_err(&config.host, e.to_string()))?;
        tcp.set_read_timeout(Some(config.auth_timeout))
            .map_err(|e| connection_err(&config.host, e.to_string()))?;
        let _ = tcp.set_nodelay(true);

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        let server_name: rustls::pki_types::ServerName<'_> =
            rustls::pki_types::ServerName::try_from(config.host.clone())
                .map_err(|e| connection_err(&config.host, format!("invalid server name: {e}")))?;
        let conn = rustls::ClientConnection::new(tls_config, server_name)
            .map_err(|e| connection_err(&config.host, e.to_string()))?;
        let tls = rustls::StreamOwned::new(conn, tcp);

        let mut session = Self {
            tls,
            host: config.host.clone(),
            tag_counter: 0,
        };

        let _greeting = session.read_line()?;

        let login_resp = session.send_cmd(&format!(
            "LOGIN \"{}\" \"{}\"",
            escape_quoted(&config.username),
            escape_quoted(&config.password)
        ))?;
        if !tagged_ok(&login_resp) {
            return Err(IngestError::Auth {
                username: config.username.clone(),
            });
        }

        Ok(session)
    }

    /// Open INBOX.
    pub fn select_inbox(&mut self) -> Result<(), IngestError> {
        let resp = self.send_cmd("SELECT \"INBOX\"")?;
        if !tagged_ok(&resp) {
            return Err(IngestError::Protocol("SELECT INBOX refused".to_string()));
        }
        Ok(())
    }

    /// UID SEARCH with the derived criteria. Returns matching UIDs in
    /// server order.
    pub fn uid_search(&mut self, criteria: &SearchCriteria) -> Result<Vec<String>, IngestError> {
        let resp = self.send_cmd(&format!("UID SEARCH {}", criteria.to_imap_query()))?;
        if !tagged_ok(&resp) {
            return Err(IngestError::Protocol("UID SEARCH refused".to_string()));
        }
        Ok(parse_search_response(&resp))
    }

    /// Fetch one raw RFC822 message by UID without setting `\Seen`.
    pub fn uid_fetch_raw(&mut self, uid: &str) -> Result<Vec<u8>, IngestError> {
        // BODY.PEEK keeps the message unseen; plain RFC822 would flag it.
        let resp = self.send_cmd(&format!("UID FETCH {uid} BODY.PEEK[]"))?;
        if !tagged_ok(&resp) {
            return Err(IngestError::Protocol(format!("UID FETCH {uid} refused")));
        }
        Ok(extract_fetch_body(&resp))
    }

    /// Mark messages seen. Best-effort per UID; the first protocol error
    /// aborts the rest.
    pub fn uid_mark_seen(&mut self, uids: &[String]) -> Result<(), IngestError> {
        for uid in uids {
            let resp = self.send_cmd(&format!("UID STORE {uid} +FLAGS (\\Seen)"))?;
            if !tagged_ok(&resp) {
                return Err(IngestError::Protocol(format!("UID STORE {uid} refused")));
            }
        }
        Ok(())
    }

    /// Log out and drop the connection. Errors are ignored — the socket is
    /// closed either way.
    pub fn logout(mut self) {
        let _ = self.send_cmd("LOGOUT");
    }

    // ── Wire helpers ────────────────────────────────────────────────

    fn read_line(&mut self) -> Result<String, IngestError> {
        let mut buf = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            match std::io::Read::read(&mut self.tls, &mut byte) {
                Ok(0) => {
                    return Err(connection_err(&self.host, "connection closed".to_string()));
                }
                Ok(_) => {
                    buf.push(byte[0]);
                    if buf.ends_with(b"\r\n") {
                        return Ok(String::from_utf8_lossy(&buf).to_string());
                    }
                }
                Err(e) => return Err(connection_err(&self.host, e.to_string())),
            }
        }
    }

    /// Send a tagged command and collect response lines through the tagged
    /// completion line.
    fn send_cmd(&mut self, cmd: &str) -> Result<Vec<String>, IngestError> {
        self.tag_counter += 1;
        let tag = format!("A{}", self.tag_counter);
        let full = format!("{tag} {cmd}\r\n");
        IoWrite::write_all(&mut self.tls, full.as_bytes())
            .map_err(|e| connection_err(&self.host, e.to_string()))?;
        IoWrite::flush(&mut self.tls).map_err(|e| connection_err(&self.host, e.to_string()))?;

        let mut lines = Vec::new();
        loop {
            let line = self.read_line()?;
            let done = line.starts_with(&tag);
            lines.push(line);
            if done {
                break;
            }
        }
        Ok(lines)
    }
}

/// Connect + open INBOX + logout, timed. The health monitor's probe body.
pub fn probe(config: &ImapConfig) -> Result<Duration, IngestError> {
    let start = Instant::now();
    let mut session = ImapSession::connect(config)?;
    session.select_inbox()?;
    let elapsed = start.elapsed();
    session.logout();
    Ok(elapsed)
}

/// Full fetch pass: connect, search, pull every matching raw message, log
/// out. Returns `(uid, raw_bytes)` pairs in server order.
pub fn fetch_matching(
    config: &ImapConfig,
    criteria: &SearchCriteria,
) -> Result<Vec<(String, Vec<u8>)>, IngestError> {
    let mut session = ImapSession::connect(config)?;

    let result = (|| {
        session.select_inbox()?;
        let uids = session.uid_search(criteria)?;
        let mut messages = Vec::with_capacity(uids.len());
        for uid in uids {
            let raw = session.uid_fetch_raw(&uid)?;
            messages.push((uid, raw));
        }
        Ok(messages)
    })();

    // Close the connection on success and on every error path.
    session.logout();
    result
}

/// Mark UIDs seen on a short dedicated session.
pub fn mark_seen(config: &ImapConfig, uids: &[String]) -> Result<(), IngestError> {
    if uids.is_empty() {
        return Ok(());
    }
    let mut session = ImapSession::connect(config)?;
    let result = session
        .select_inbox()
        .and_then(|()| session.uid_mark_seen(uids));
    session.logout();
    result
}

/// Whether the tagged completion line reports OK.
fn tagged_ok(lines: &[String]) -> bool {
    lines
        .last()
        .is_some_and(|l| l.split_whitespace().nth(1) == Some("OK"))
}

/// Pull UIDs out of `* SEARCH ...` lines.
pub(crate) fn parse_search_response(lines: &[String]) -> Vec<String> {
    let mut uids = Vec::new();
    for line in lines {
        if line.starts_with("* SEARCH") {
            uids.extend(
                line.split_whitespace()
                    .skip(2)
                    .map(|s| s.trim().to_string()),
            );
        }
    }
    uids
}

/// Reassemble the message body from a FETCH response: drop the untagged
/// FETCH header line, the closing paren line, and the tagged completion.
pub(crate) fn extract_fetch_body(lines: &[String]) -> Vec<u8> {
    let mut body = Vec::new();
    let end = lines.len().saturating_sub(1);
    for line in lines.iter().take(end).skip(1) {
        if line.trim_end() == ")" {
            continue;
        }
        body.extend_from_slice(line.as_bytes());
    }
    body
}

fn escape_quoted(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

fn connection_err(host: &str, reason: String) -> IngestError {
    IngestError::Connection {
        host: host.to_string(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_response_parsing() {
        let lines = vec![
            "* SEARCH 4 7 19\r\n".to_string(),
            "A3 OK SEARCH completed\r\n".to_string(),
        ];
        assert_eq!(parse_search_response(&lines), vec!["4", "7", "19"]);
    }

    #[test]
    fn search_response_empty() {
        let lines = vec![
            "* SEARCH\r\n".to_string(),
            "A3 OK SEARCH completed\r\n".to_string(),
        ];
        assert!(parse_search_response(&lines).is_empty());
    }

    #[test]
    fn fetch_body_extraction() {
        let lines = vec![
            "* 1 FETCH (BODY[] {42}\r\n".to_string(),
            "From: reports@vinsolutions.com\r\n".to_string(),
            "Subject: Daily Report\r\n".to_string(),
            "\r\n".to_string(),
            "body text\r\n".to_string(),
            ")\r\n".to_string(),
            "A4 OK FETCH completed\r\n".to_string(),
        ];
        let body = String::from_utf8(extract_fetch_body(&lines)).unwrap();
        assert!(body.starts_with("From: reports@vinsolutions.com"));
        assert!(body.contains("body text"));
        assert!(!body.contains("FETCH completed"));
        assert!(!body.contains("{42}"));
    }

    #[test]
    fn tagged_ok_detection() {
        assert!(tagged_ok(&["A1 OK LOGIN completed\r\n".to_string()]));
        assert!(!tagged_ok(&["A1 NO LOGIN failed\r\n".to_string()]));
        assert!(!tagged_ok(&["A1 BAD invalid command\r\n".to_string()]));
    }

    #[test]
    fn quoted_escaping() {
        assert_eq!(escape_quoted(r#"pass"word"#), r#"pass\"word"#);
        assert_eq!(escape_quoted(r"back\slash"), r"back\\slash");
    }
}
