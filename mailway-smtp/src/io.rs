//! Line-buffered, TLS-upgradable byte framing for SMTP sessions.
//!
//! Writes accumulate in a send buffer until [`flush_send`] pushes them to
//! the wire in one write; reads accumulate in a receive buffer that the
//! reply, line and command parsers consume from.
//!
//! [`flush_send`]: SmtpIo::flush_send

use std::io;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    connection::{Connection, TlsClientContext, TlsServerContext},
    error::{SmtpError, SmtpResult},
    reply::Reply,
};

fn map_io_error(err: io::Error) -> SmtpError {
    match err.kind() {
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof => SmtpError::ConnectionLost,
        _ => SmtpError::Io(err),
    }
}

pub struct SmtpIo<S: AsyncRead + AsyncWrite + Unpin + Send> {
    conn: Option<Connection<S>>,
    send_buffer: Vec<u8>,
    recv_buffer: Vec<u8>,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> SmtpIo<S> {
    pub fn new(stream: S) -> Self {
        Self::from_connection(Connection::Plain(stream))
    }

    pub fn from_connection(conn: Connection<S>) -> Self {
        Self {
            conn: Some(conn),
            send_buffer: Vec::new(),
            recv_buffer: Vec::new(),
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.conn.as_ref().is_some_and(Connection::is_encrypted)
    }

    fn conn(&mut self) -> SmtpResult<&mut Connection<S>> {
        self.conn.as_mut().ok_or(SmtpError::ConnectionLost)
    }

    /// Append bytes to the send buffer without touching the wire.
    pub fn buffered_send(&mut self, data: &[u8]) {
        self.send_buffer.extend_from_slice(data);
    }

    /// Append a command line, CRLF-terminated, to the send buffer.
    pub fn send_command(&mut self, command: &str) {
        self.buffered_send(command.as_bytes());
        self.buffered_send(b"\r\n");
    }

    /// Push the accumulated send buffer to the wire in a single write. An
    /// empty buffer is a no-op.
    pub async fn flush_send(&mut self) -> SmtpResult<()> {
        if self.send_buffer.is_empty() {
            return Ok(());
        }
        let data = std::mem::take(&mut self.send_buffer);
        mailway_common::outgoing!("{}", String::from_utf8_lossy(&data).trim_end());
        self.conn()?.write_all(&data).await.map_err(map_io_error)
    }

    /// Read one chunk from the wire into the receive buffer. A zero-byte
    /// read means the peer is done and raises `ConnectionLost`.
    async fn buffered_recv(&mut self) -> SmtpResult<()> {
        let mut chunk = [0u8; 4096];
        let n = self
            .conn()?
            .read(&mut chunk)
            .await
            .map_err(map_io_error)?;
        if n == 0 {
            return Err(SmtpError::ConnectionLost);
        }
        self.recv_buffer.extend_from_slice(&chunk[..n]);
        Ok(())
    }

    /// Drain whatever is buffered, reading from the wire only when the
    /// buffer is empty. Used by the DATA reader, which does its own line
    /// accounting.
    pub(crate) async fn recv_raw(&mut self) -> SmtpResult<Vec<u8>> {
        if self.recv_buffer.is_empty() {
            self.buffered_recv().await?;
        }
        Ok(std::mem::take(&mut self.recv_buffer))
    }

    /// Push unconsumed bytes back to the front of the receive buffer.
    pub(crate) fn unrecv(&mut self, data: Vec<u8>) {
        if data.is_empty() {
            return;
        }
        let mut combined = data;
        combined.extend_from_slice(&self.recv_buffer);
        self.recv_buffer = combined;
    }

    /// Whether bytes are already buffered from the peer, e.g. an
    /// asynchronous reply sent while this side was idle.
    pub fn has_buffered_recv(&self) -> bool {
        !self.recv_buffer.is_empty()
    }

    /// Read one SMTP reply, possibly multi-line. Every line must match
    /// `code<sep>text` where `<sep>` is a space, tab, or `-`; all lines
    /// must carry the same code; the combined message joins the line
    /// texts with CRLF.
    pub async fn recv_reply(&mut self) -> SmtpResult<(String, String)> {
        let mut code: Option<String> = None;
        let mut message_lines: Vec<String> = Vec::new();

        loop {
            let Some(line_end) = self.recv_buffer.iter().position(|&b| b == b'\n') else {
                self.buffered_recv().await?;
                continue;
            };

            let raw: Vec<u8> = self.recv_buffer.drain(..=line_end).collect();
            let line = strip_line_ending(&raw);
            let line = std::str::from_utf8(line)
                .map_err(|_| SmtpError::BadReply(String::from_utf8_lossy(line).into_owned()))?;

            let (line_code, sep, text) = match parse_reply_line(line) {
                Some(parts) => parts,
                None => {
                    message_lines.push(line.to_owned());
                    return Err(SmtpError::BadReply(message_lines.join("\r\n")));
                }
            };

            if let Some(expected) = &code {
                if expected != line_code {
                    return Err(SmtpError::BadReply(line.to_owned()));
                }
            } else {
                code = Some(line_code.to_owned());
            }
            message_lines.push(text.to_owned());

            if sep != '-' {
                let code = code.unwrap_or_default();
                let message = message_lines.join("\r\n");
                mailway_common::incoming!("{code} {message}");
                return Ok((code, message));
            }
        }
    }

    /// Read one line, stripped of its CRLF (or bare LF) terminator.
    /// Residual bytes stay buffered.
    pub async fn recv_line(&mut self) -> SmtpResult<String> {
        loop {
            if let Some(line_end) = self.recv_buffer.iter().position(|&b| b == b'\n') {
                let raw: Vec<u8> = self.recv_buffer.drain(..=line_end).collect();
                let line = strip_line_ending(&raw);
                return Ok(String::from_utf8_lossy(line).into_owned());
            }
            self.buffered_recv().await?;
        }
    }

    /// Read one line parsed as `CMD` or `CMD arg`. The verb is ASCII
    /// uppercased; a line that fits neither form yields `(None, None)`.
    pub async fn recv_command(&mut self) -> SmtpResult<(Option<String>, Option<String>)> {
        let line = self.recv_line().await?;
        let trimmed = line.trim_end();

        let verb_end = trimmed
            .char_indices()
            .find(|(_, c)| !c.is_ascii_alphabetic())
            .map_or(trimmed.len(), |(i, _)| i);
        if verb_end == 0 {
            return Ok((None, None));
        }

        let verb = trimmed[..verb_end].to_ascii_uppercase();
        let rest = trimmed[verb_end..].trim();
        if trimmed[verb_end..].is_empty() {
            Ok((Some(verb), None))
        } else if trimmed.as_bytes()[verb_end].is_ascii_whitespace() && !rest.is_empty() {
            Ok((Some(verb), Some(rest.to_owned())))
        } else {
            Ok((None, None))
        }
    }

    /// Render a reply into the send buffer, using `code-text` for every
    /// line but the last and `code text` for the last.
    pub fn send_reply(&mut self, reply: &Reply) {
        let Some(code) = reply.code() else {
            debug_assert!(false, "attempted to send an unpopulated reply");
            return;
        };
        let code = code.to_owned();
        let message = reply.message().unwrap_or_default();
        let lines: Vec<&str> = message.split("\r\n").collect();

        for line in &lines[..lines.len() - 1] {
            self.buffered_send(code.as_bytes());
            self.buffered_send(b"-");
            self.buffered_send(line.as_bytes());
            self.buffered_send(b"\r\n");
        }
        self.buffered_send(code.as_bytes());
        self.buffered_send(b" ");
        self.buffered_send(lines[lines.len() - 1].as_bytes());
        self.buffered_send(b"\r\n");
    }

    /// Perform a server-side TLS handshake in place, returning whether
    /// the upgrade succeeded. The session remembers its encrypted state.
    pub async fn encrypt_server(&mut self, context: &TlsServerContext) -> SmtpResult<bool> {
        let conn = self.conn.take().ok_or(SmtpError::ConnectionLost)?;
        match conn.accept_tls(context).await {
            Ok(conn) => {
                self.conn = Some(conn);
                Ok(true)
            }
            Err(err) => {
                mailway_common::internal!(level = WARN, "TLS accept failed: {err}");
                Ok(false)
            }
        }
    }

    /// Perform a client-side TLS handshake in place, returning whether
    /// the upgrade succeeded.
    pub async fn encrypt_client(
        &mut self,
        context: &TlsClientContext,
        host: &str,
    ) -> SmtpResult<bool> {
        let conn = self.conn.take().ok_or(SmtpError::ConnectionLost)?;
        match conn.connect_tls(context, host).await {
            Ok(conn) => {
                self.conn = Some(conn);
                Ok(true)
            }
            Err(err) => {
                mailway_common::internal!(level = WARN, "TLS connect failed: {err}");
                Ok(false)
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn take_send_buffer(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.send_buffer)
    }

    /// Close the underlying stream, ignoring errors from a peer that is
    /// already gone.
    pub async fn close(&mut self) {
        if let Some(conn) = self.conn.as_mut() {
            conn.close().await;
        }
        self.conn = None;
    }
}

fn strip_line_ending(raw: &[u8]) -> &[u8] {
    let mut line = raw;
    if line.last() == Some(&b'\n') {
        line = &line[..line.len() - 1];
    }
    if line.last() == Some(&b'\r') {
        line = &line[..line.len() - 1];
    }
    line
}

/// Split `250-text` / `250 text` into (code, separator, text).
fn parse_reply_line(line: &str) -> Option<(&str, char, &str)> {
    let bytes = line.as_bytes();
    if bytes.len() < 4 {
        return None;
    }
    if !bytes[..3].iter().all(u8::is_ascii_digit) {
        return None;
    }
    let sep = bytes[3] as char;
    if !matches!(sep, ' ' | '\t' | '-') {
        return None;
    }
    Some((&line[..3], sep, &line[4..]))
}
