//! Raw IMAP client over tokio
//!
//! Speaks the tagged wire protocol directly so the engine controls exactly
//! when the session enters and leaves IDLE, which library session types make
//! awkward. Supports TLS and plain TCP connections.

use std::time::Duration;

use async_native_tls::TlsConnector;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::idle::{parse_untagged, IdleEvent};
use crate::types::{EmailAddress, Envelope, Folder, MessageSummary};
use crate::{ImapError, ImapResult};

trait AsyncReadWrite: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send {}
impl<T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send> AsyncReadWrite for T {}

type IoStream = BufReader<Box<dyn AsyncReadWrite>>;

/// Raw IMAP client holding one authenticated session
pub struct ImapClient {
    stream: Option<IoStream>,
    tag_counter: u32,
    /// EXISTS count reported by the last SELECT
    exists: u32,
    /// Tag of the in-flight IDLE command, if any
    idle_tag: Option<String>,
    /// Partial-line buffer for cancellation-safe IDLE reads
    idle_buf: Vec<u8>,
}

impl ImapClient {
    pub fn new() -> Self {
        Self {
            stream: None,
            tag_counter: 0,
            exists: 0,
            idle_tag: None,
            idle_buf: Vec::new(),
        }
    }

    fn next_tag(&mut self) -> String {
        self.tag_counter += 1;
        format!("A{:04}", self.tag_counter)
    }

    fn stream_mut(&mut self) -> ImapResult<&mut IoStream> {
        self.stream.as_mut().ok_or(ImapError::NotConnected)
    }

    /// Connect over TCP, optionally wrapped in TLS, and read the greeting
    pub async fn connect(&mut self, host: &str, port: u16, use_tls: bool) -> ImapResult<()> {
        info!("Connecting to {}:{} (tls={})", host, port, use_tls);

        let tcp_stream = TcpStream::connect(format!("{}:{}", host, port))
            .await
            .map_err(|e| ImapError::ConnectionFailed(e.to_string()))?;

        let boxed: Box<dyn AsyncReadWrite> = if use_tls {
            let tls_stream = TlsConnector::new()
                .connect(host, tcp_stream)
                .await
                .map_err(|e| ImapError::TlsError(e.to_string()))?;
            debug!("TLS connection established");
            Box::new(tls_stream)
        } else {
            Box::new(tcp_stream)
        };

        let mut stream = BufReader::new(boxed);

        let mut greeting = String::new();
        stream
            .read_line(&mut greeting)
            .await
            .map_err(|e| ImapError::ServerError(e.to_string()))?;
        debug!("Greeting: {}", greeting.trim());

        if !greeting.starts_with("* OK") {
            return Err(ImapError::ServerError(format!(
                "Unexpected greeting: {}",
                greeting
            )));
        }

        self.stream = Some(stream);
        self.exists = 0;
        self.idle_tag = None;
        self.idle_buf.clear();
        Ok(())
    }

    /// Authenticate with LOGIN (username/password)
    pub async fn login(&mut self, username: &str, password: &str) -> ImapResult<()> {
        info!("Authenticating with LOGIN for {}", username);
        let cmd = format!("LOGIN {} {}", quote(username), quote(password));
        self.command(&cmd)
            .await
            .map_err(|e| ImapError::AuthenticationFailed(e.to_string()))?;
        info!("LOGIN authentication successful");
        Ok(())
    }

    /// Select a folder read-write; returns the EXISTS count
    pub async fn select(&mut self, folder: &str) -> ImapResult<u32> {
        let lines = self
            .command(&format!("SELECT {}", quote(folder)))
            .await
            .map_err(|_| ImapError::FolderNotFound(folder.to_string()))?;

        let mut exists = 0u32;
        for line in &lines {
            if line.contains(" EXISTS") {
                if let Some(n) = line.split_whitespace().nth(1).and_then(|s| s.parse().ok()) {
                    exists = n;
                }
            }
        }
        debug!("Selected {} with {} messages", folder, exists);
        self.exists = exists;
        Ok(exists)
    }

    /// EXISTS count from the last SELECT
    pub fn exists(&self) -> u32 {
        self.exists
    }

    /// Close the selected folder (implicit expunge on some servers)
    pub async fn close(&mut self) -> ImapResult<()> {
        self.command("CLOSE").await?;
        Ok(())
    }

    /// List all selectable folders; the wildcard walks the whole hierarchy
    pub async fn list_folders(&mut self) -> ImapResult<Vec<Folder>> {
        let lines = self.command("LIST \"\" \"*\"").await?;
        let mut folders = Vec::new();
        for line in &lines {
            if line.starts_with("* LIST ") {
                if let Some(folder) = parse_list_response(line) {
                    folders.push(folder);
                }
            }
        }
        debug!("Found {} folders", folders.len());
        Ok(folders)
    }

    /// Fetch envelope summaries for the newest `count` messages, in server
    /// order. Empty when the folder is empty.
    pub async fn fetch_newest(&mut self, count: u32) -> ImapResult<Vec<MessageSummary>> {
        if self.exists == 0 || count == 0 {
            return Ok(Vec::new());
        }
        let start = self.exists.saturating_sub(count - 1).max(1);
        self.fetch_summaries(&format!("{}:*", start)).await
    }

    /// Fetch envelope summaries for a sequence range
    pub async fn fetch_summaries(&mut self, range: &str) -> ImapResult<Vec<MessageSummary>> {
        let lines = self
            .command(&format!("FETCH {} (UID ENVELOPE)", range))
            .await?;

        let mut summaries = Vec::new();
        for line in &lines {
            if line.starts_with("* ") && line.contains("FETCH") {
                if let Some(summary) = parse_fetch_response(line) {
                    summaries.push(summary);
                }
            }
        }
        debug!("Fetched {} summaries for {}", summaries.len(), range);
        Ok(summaries)
    }

    /// Fetch the raw body of one message by UID without setting \Seen
    pub async fn fetch_body(&mut self, uid: u32) -> ImapResult<Vec<u8>> {
        let tag = self.next_tag();
        let cmd = format!("{} UID FETCH {} BODY.PEEK[]\r\n", tag, uid);

        let stream = self.stream_mut()?;
        stream
            .get_mut()
            .write_all(cmd.as_bytes())
            .await
            .map_err(|e| ImapError::ServerError(e.to_string()))?;

        let mut body: Option<Vec<u8>> = None;

        loop {
            let mut line = String::new();
            stream
                .read_line(&mut line)
                .await
                .map_err(|e| ImapError::ServerError(e.to_string()))?;

            if line.starts_with(&tag) {
                if !line.contains("OK") {
                    return Err(ImapError::ServerError(format!(
                        "FETCH failed: {}",
                        line.trim()
                    )));
                }
                break;
            }

            // Literal marker: * N FETCH (UID x BODY[] {SIZE}
            if let (Some(open), Some(close)) = (line.find('{'), line.find('}')) {
                if let Ok(size) = line[open + 1..close].parse::<usize>() {
                    debug!("Reading literal of {} bytes", size);
                    let mut literal = vec![0u8; size];
                    stream
                        .read_exact(&mut literal)
                        .await
                        .map_err(|e| {
                            ImapError::ServerError(format!("Failed to read literal: {}", e))
                        })?;
                    body = Some(literal);

                    // Closing line of the FETCH response
                    let mut closing = String::new();
                    stream
                        .read_line(&mut closing)
                        .await
                        .map_err(|e| ImapError::ServerError(e.to_string()))?;
                }
            }
        }

        body.ok_or(ImapError::MessageNotFound(uid))
    }

    /// Copy a message to another folder by UID
    pub async fn uid_copy(&mut self, uid: u32, dest_folder: &str) -> ImapResult<()> {
        self.command(&format!("UID COPY {} {}", uid, quote(dest_folder)))
            .await?;
        Ok(())
    }

    /// Mark a message \Deleted by UID
    pub async fn uid_mark_deleted(&mut self, uid: u32) -> ImapResult<()> {
        self.command(&format!("UID STORE {} +FLAGS (\\Deleted)", uid))
            .await?;
        Ok(())
    }

    /// Expunge messages marked \Deleted
    pub async fn expunge(&mut self) -> ImapResult<()> {
        self.command("EXPUNGE").await?;
        Ok(())
    }

    /// Probe the connection
    pub async fn noop(&mut self) -> ImapResult<()> {
        self.command("NOOP").await?;
        Ok(())
    }

    /// Enter IDLE; the server holds the connection and pushes events
    pub async fn idle_start(&mut self) -> ImapResult<()> {
        let tag = self.next_tag();
        let cmd = format!("{} IDLE\r\n", tag);

        let stream = self.stream_mut()?;
        stream
            .get_mut()
            .write_all(cmd.as_bytes())
            .await
            .map_err(|e| ImapError::ServerError(e.to_string()))?;

        loop {
            let mut line = String::new();
            stream
                .read_line(&mut line)
                .await
                .map_err(|e| ImapError::ServerError(e.to_string()))?;

            if line.starts_with('+') {
                debug!("IDLE accepted");
                self.idle_tag = Some(tag);
                self.idle_buf.clear();
                return Ok(());
            }
            if line.starts_with(&tag) {
                return Err(ImapError::ServerError(format!(
                    "IDLE rejected: {}",
                    line.trim()
                )));
            }
        }
    }

    /// Wait up to `quantum` for one pushed event while idling.
    ///
    /// Returns `Ok(None)` when the quantum elapsed or the line was not an
    /// event of interest. Cancellation-safe: a partially-read line survives
    /// in the internal buffer across calls.
    pub async fn idle_wait(&mut self, quantum: Duration) -> ImapResult<Option<IdleEvent>> {
        if self.idle_tag.is_none() {
            return Err(ImapError::IdleFault("not idling".to_string()));
        }
        let buf = &mut self.idle_buf;
        let stream = self.stream.as_mut().ok_or(ImapError::NotConnected)?;

        match tokio::time::timeout(quantum, stream.read_until(b'\n', buf)).await {
            Err(_) => Ok(None),
            Ok(Err(e)) => Err(ImapError::IdleFault(e.to_string())),
            Ok(Ok(0)) => Err(ImapError::IdleFault("connection closed".to_string())),
            Ok(Ok(_)) => {
                if buf.last() != Some(&b'\n') {
                    // Mid-line; keep accumulating on the next call
                    return Ok(None);
                }
                let line = String::from_utf8_lossy(buf).into_owned();
                buf.clear();
                debug!("IDLE push: {}", line.trim());
                Ok(parse_untagged(&line))
            }
        }
    }

    /// Leave IDLE with DONE. Events that raced the DONE are returned so the
    /// caller can still deliver them.
    pub async fn idle_done(&mut self) -> ImapResult<Vec<IdleEvent>> {
        let tag = match self.idle_tag.take() {
            Some(t) => t,
            None => return Ok(Vec::new()),
        };

        let stream = self.stream.as_mut().ok_or(ImapError::NotConnected)?;
        stream
            .get_mut()
            .write_all(b"DONE\r\n")
            .await
            .map_err(|e| ImapError::ServerError(e.to_string()))?;

        let mut trailing = Vec::new();

        // Finish any partial line left by a cancelled idle_wait
        if !self.idle_buf.is_empty() {
            if self.idle_buf.last() != Some(&b'\n') {
                stream
                    .read_until(b'\n', &mut self.idle_buf)
                    .await
                    .map_err(|e| ImapError::ServerError(e.to_string()))?;
            }
            let line = String::from_utf8_lossy(&self.idle_buf).into_owned();
            self.idle_buf.clear();
            if let Some(ev) = parse_untagged(&line) {
                trailing.push(ev);
            }
        }

        loop {
            let mut line = String::new();
            stream
                .read_line(&mut line)
                .await
                .map_err(|e| ImapError::ServerError(e.to_string()))?;

            if line.starts_with(&tag) {
                if line.contains("OK") {
                    return Ok(trailing);
                }
                return Err(ImapError::ServerError(format!(
                    "DONE failed: {}",
                    line.trim()
                )));
            }
            if let Some(ev) = parse_untagged(&line) {
                trailing.push(ev);
            }
        }
    }

    /// Whether an IDLE command is currently open
    pub fn is_idling(&self) -> bool {
        self.idle_tag.is_some()
    }

    /// Whether the client has a connection
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Logout and drop the connection
    pub async fn logout(&mut self) -> ImapResult<()> {
        let tag = self.next_tag();
        let cmd = format!("{} LOGOUT\r\n", tag);
        if let Some(stream) = self.stream.as_mut() {
            let _ = stream.get_mut().write_all(cmd.as_bytes()).await;
        }
        self.stream = None;
        self.idle_tag = None;
        Ok(())
    }

    /// Send one tagged command and collect untagged lines until completion
    async fn command(&mut self, cmd: &str) -> ImapResult<Vec<String>> {
        let tag = self.next_tag();
        let wire = format!("{} {}\r\n", tag, cmd);

        let stream = self.stream_mut()?;
        stream
            .get_mut()
            .write_all(wire.as_bytes())
            .await
            .map_err(|e| ImapError::ServerError(e.to_string()))?;

        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            stream
                .read_line(&mut line)
                .await
                .map_err(|e| ImapError::ServerError(e.to_string()))?;

            if line.starts_with(&tag) {
                if line.contains("OK") {
                    return Ok(lines);
                }
                return Err(ImapError::ServerError(line.trim().to_string()));
            }
            lines.push(line);
        }
    }
}

impl Default for ImapClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Quote a string per the IMAP grammar
fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Parse one `* LIST (\attrs) "/" "name"` response line
fn parse_list_response(line: &str) -> Option<Folder> {
    let rest = line.strip_prefix("* LIST ")?;

    let attr_start = rest.find('(')?;
    let attr_end = rest.find(')')?;
    let attributes: Vec<String> = rest[attr_start + 1..attr_end]
        .split_whitespace()
        .map(|s| s.to_string())
        .collect();

    let after_attrs = rest[attr_end + 1..].trim();

    let delimiter = if after_attrs.starts_with("NIL") {
        None
    } else if after_attrs.starts_with('"') {
        after_attrs.chars().nth(1)
    } else {
        None
    };

    // Folder name is the last quoted string
    let name_end = after_attrs.rfind('"')?;
    let name_start = after_attrs[..name_end].rfind('"')?;
    let name = &after_attrs[name_start + 1..name_end];

    Some(Folder::new(name.to_string(), delimiter, attributes))
}

/// Parse one `* N FETCH (UID x ENVELOPE (...))` line into a summary
fn parse_fetch_response(line: &str) -> Option<MessageSummary> {
    let uid = extract_uid(line)?;
    let seq = line
        .strip_prefix("* ")
        .and_then(|r| r.split_whitespace().next())
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    let envelope = extract_envelope(line);
    Some(MessageSummary { uid, seq, envelope })
}

fn extract_uid(line: &str) -> Option<u32> {
    let idx = line.find("UID ")?;
    let rest = &line[idx + 4..];
    let end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    rest[..end].parse().ok()
}

/// ENVELOPE order per the grammar:
/// (date subject from sender reply-to to cc bcc in-reply-to message-id)
fn extract_envelope(line: &str) -> Envelope {
    let mut envelope = Envelope::default();

    let Some(start) = line.find("ENVELOPE (") else {
        return envelope;
    };
    let parts = parse_envelope_parts(&line[start + 10..]);

    let get = |idx: usize| -> Option<&String> {
        parts.get(idx).filter(|p| p.as_str() != "NIL")
    };

    envelope.date = get(0).cloned();
    envelope.subject = get(1).cloned();
    if let Some(from) = get(2).and_then(|p| parse_address_list(p)) {
        envelope.from = from;
    }
    if let Some(to) = get(5).and_then(|p| parse_address_list(p)) {
        envelope.to = to;
    }
    if let Some(cc) = get(6).and_then(|p| parse_address_list(p)) {
        envelope.cc = cc;
    }
    envelope.message_id = get(9).cloned();

    envelope
}

/// Byte cursor over one response line
struct Scanner<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn new(s: &'a str) -> Self {
        Self {
            buf: s.as_bytes(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    fn bump(&mut self) {
        self.pos += 1;
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b) if b.is_ascii_whitespace()) {
            self.bump();
        }
    }

    /// Consume a quoted string, returning its contents (escapes kept raw)
    fn quoted(&mut self) -> Option<String> {
        if self.peek() != Some(b'"') {
            return None;
        }
        self.bump();
        let start = self.pos;
        while let Some(b) = self.peek() {
            match b {
                b'\\' => {
                    self.bump();
                    self.bump();
                }
                b'"' => {
                    let raw = &self.buf[start..self.pos];
                    self.bump();
                    return Some(String::from_utf8_lossy(raw).into_owned());
                }
                _ => self.bump(),
            }
        }
        None
    }

    /// Consume a balanced parenthesized group, parens included
    fn group(&mut self) -> Option<String> {
        if self.peek() != Some(b'(') {
            return None;
        }
        let start = self.pos;
        let mut depth = 0usize;
        while let Some(b) = self.peek() {
            match b {
                b'(' => {
                    depth += 1;
                    self.bump();
                }
                b')' => {
                    depth -= 1;
                    self.bump();
                    if depth == 0 {
                        let raw = &self.buf[start..self.pos];
                        return Some(String::from_utf8_lossy(raw).into_owned());
                    }
                }
                b'"' => {
                    self.quoted()?;
                }
                _ => self.bump(),
            }
        }
        None
    }

    /// Consume a literal NIL if it is next
    fn nil(&mut self) -> bool {
        if self.buf[self.pos..].starts_with(b"NIL") {
            self.pos += 3;
            true
        } else {
            false
        }
    }

    /// Skip an unquoted atom
    fn skip_atom(&mut self) {
        while let Some(b) = self.peek() {
            if b.is_ascii_whitespace() || b == b')' {
                break;
            }
            self.bump();
        }
    }
}

/// Split envelope fields: quoted strings, NIL, and nested paren groups
fn parse_envelope_parts(s: &str) -> Vec<String> {
    let mut scanner = Scanner::new(s);
    let mut parts = Vec::new();

    loop {
        scanner.skip_ws();
        match scanner.peek() {
            None | Some(b')') => break,
            Some(b'"') => match scanner.quoted() {
                Some(q) => parts.push(q),
                None => break,
            },
            Some(b'(') => match scanner.group() {
                Some(g) => parts.push(g),
                None => break,
            },
            Some(b'N') if scanner.nil() => parts.push("NIL".to_string()),
            Some(_) => scanner.bump(),
        }
    }

    parts
}

/// Parse `((name route mailbox host) ...)` into addresses
fn parse_address_list(s: &str) -> Option<Vec<EmailAddress>> {
    if s == "NIL" || s.is_empty() {
        return None;
    }
    let mut scanner = Scanner::new(s);
    scanner.skip_ws();
    if scanner.peek() != Some(b'(') {
        return None;
    }
    scanner.bump();

    let mut addresses = Vec::new();
    loop {
        scanner.skip_ws();
        match scanner.peek() {
            Some(b'(') => {
                if let Some(addr) = scan_address(&mut scanner) {
                    addresses.push(addr);
                }
            }
            None | Some(b')') => break,
            Some(_) => scanner.bump(),
        }
    }

    if addresses.is_empty() {
        None
    } else {
        Some(addresses)
    }
}

/// One `(name route mailbox host)` group; the cursor sits on its `(`
fn scan_address(scanner: &mut Scanner<'_>) -> Option<EmailAddress> {
    scanner.bump();
    let mut fields: Vec<Option<String>> = Vec::with_capacity(4);

    while fields.len() < 4 {
        scanner.skip_ws();
        match scanner.peek()? {
            b'"' => fields.push(scanner.quoted()),
            b')' => break,
            _ => {
                if !scanner.nil() {
                    scanner.skip_atom();
                }
                fields.push(None);
            }
        }
    }
    while let Some(b) = scanner.peek() {
        scanner.bump();
        if b == b')' {
            break;
        }
    }

    if fields.len() < 4 {
        return None;
    }
    let name = fields[0].clone().filter(|n| !n.is_empty());
    let mailbox = fields[2].clone().unwrap_or_default();
    let host = fields[3].clone().unwrap_or_default();
    if mailbox.is_empty() {
        return None;
    }
    // Some servers put the full address in the mailbox slot
    let address = if host.is_empty() {
        mailbox
    } else {
        format!("{}@{}", mailbox, host)
    };
    Some(EmailAddress { name, address })
}
