//! Server-side SMTP state machine.
//!
//! The server drives a connected stream through the SMTP session:
//! banner, EHLO, optional STARTTLS and AUTH, then MAIL/RCPT/DATA
//! transactions. For every command it computes the default reply, hands
//! it to the session's [`SmtpHandlers`] implementation for inspection or
//! rewriting, sends the (possibly modified) reply, and advances its state
//! only when the reply still indicates success.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use ahash::AHashMap;
use async_trait::async_trait;
use mailway_common::{incoming, internal};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    auth::{AuthAttemptError, AuthSession, Authenticator},
    connection::TlsServerContext,
    data::DataReader,
    error::{SmtpError, SmtpResult},
    extensions::Extensions,
    io::SmtpIo,
    reply::{self, Reply},
};

/// ESMTP parameters attached to a MAIL or RCPT command, keyed by
/// upper-cased keyword. A parameter without `=value` maps to `None`.
pub type EsmtpParams = AHashMap<String, Option<String>>;

/// Result type for session handler hooks. An error terminates the
/// session with `421 4.3.0 Unhandled system error`.
pub type HandlerResult = anyhow::Result<()>;

/// Per-command hooks invoked after the server computes the default reply
/// and before it is sent. Handlers may mutate the reply to override the
/// outcome; the server advances its state only on success codes.
#[async_trait]
pub trait SmtpHandlers: Send {
    async fn handle_banner(&mut self, _reply: &mut Reply, _peer: &SocketAddr) -> HandlerResult {
        Ok(())
    }

    async fn handle_ehlo(&mut self, _reply: &mut Reply, _ehlo_as: &str) -> HandlerResult {
        Ok(())
    }

    async fn handle_helo(&mut self, _reply: &mut Reply, _helo_as: &str) -> HandlerResult {
        Ok(())
    }

    async fn handle_starttls(&mut self, _reply: &mut Reply) -> HandlerResult {
        Ok(())
    }

    /// Called after a successful TLS handshake, immediate or via
    /// STARTTLS.
    async fn handle_tls_handshake(&mut self) -> HandlerResult {
        Ok(())
    }

    async fn handle_auth(&mut self, _reply: &mut Reply, _identity: &str) -> HandlerResult {
        Ok(())
    }

    async fn handle_mail(
        &mut self,
        _reply: &mut Reply,
        _address: &str,
        _params: &EsmtpParams,
    ) -> HandlerResult {
        Ok(())
    }

    async fn handle_rcpt(
        &mut self,
        _reply: &mut Reply,
        _address: &str,
        _params: &EsmtpParams,
    ) -> HandlerResult {
        Ok(())
    }

    async fn handle_data(&mut self, _reply: &mut Reply) -> HandlerResult {
        Ok(())
    }

    /// Called once message data has been read (or reading failed).
    /// `err` is [`SmtpError::TooBig`] when the size cap was hit.
    async fn handle_have_data(
        &mut self,
        _reply: &mut Reply,
        _data: Option<&[u8]>,
        _err: Option<&SmtpError>,
    ) -> HandlerResult {
        Ok(())
    }

    async fn handle_rset(&mut self, _reply: &mut Reply) -> HandlerResult {
        Ok(())
    }

    async fn handle_noop(&mut self, _reply: &mut Reply) -> HandlerResult {
        Ok(())
    }

    async fn handle_quit(&mut self, _reply: &mut Reply) -> HandlerResult {
        Ok(())
    }

    /// Called when the session ends, cleanly or otherwise.
    async fn handle_close(&mut self) {}

    /// Catch-all for verbs outside the built-in dispatch table. The
    /// default reply is `500 5.5.2 Syntax error, command unrecognized`.
    async fn handle_unknown(
        &mut self,
        _reply: &mut Reply,
        _verb: &str,
        _arg: Option<&str>,
    ) -> HandlerResult {
        Ok(())
    }
}

/// Handlers that accept every default reply unchanged.
pub struct NoHandlers;

#[async_trait]
impl SmtpHandlers for NoHandlers {}

/// Authentication configuration for a server session.
#[derive(Clone)]
pub struct ServerAuth {
    pub session: AuthSession,
    pub backend: Arc<dyn Authenticator>,
}

impl ServerAuth {
    pub fn new(backend: Arc<dyn Authenticator>) -> Self {
        Self {
            session: AuthSession::default(),
            backend,
        }
    }

    pub fn with_session(mut self, session: AuthSession) -> Self {
        self.session = session;
        self
    }
}

/// Server session configuration.
#[derive(Clone, Default)]
pub struct ServerOptions {
    /// Enable AUTH with the given mechanism set and credential backend.
    pub auth: Option<ServerAuth>,
    /// TLS settings; advertises STARTTLS unless `tls_immediately`.
    pub tls: Option<TlsServerContext>,
    /// Encrypt the stream before the banner instead of via STARTTLS.
    pub tls_immediately: bool,
    /// Refuse MAIL commands until the session is encrypted.
    pub tls_required: bool,
    /// Timeout waiting for each command from the client.
    pub command_timeout: Option<Duration>,
    /// Timeout while reading message data.
    pub data_timeout: Option<Duration>,
    /// Advertised SIZE limit; message data beyond it is rejected.
    pub max_size: Option<usize>,
}

impl ServerOptions {
    pub fn with_auth(mut self, auth: ServerAuth) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn with_tls(mut self, tls: TlsServerContext) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_tls_immediately(mut self, immediately: bool) -> Self {
        self.tls_immediately = immediately;
        self
    }

    pub fn with_tls_required(mut self, required: bool) -> Self {
        self.tls_required = required;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = Some(timeout);
        self
    }

    pub fn with_data_timeout(mut self, timeout: Duration) -> Self {
        self.data_timeout = Some(timeout);
        self
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = Some(max_size);
        self
    }
}

enum Flow {
    Continue,
    Stop,
}

enum CommandError {
    Smtp(SmtpError),
    Handler(anyhow::Error),
}

impl From<SmtpError> for CommandError {
    fn from(err: SmtpError) -> Self {
        Self::Smtp(err)
    }
}

type CommandResult = Result<Flow, CommandError>;

pub struct Server<S: AsyncRead + AsyncWrite + Unpin + Send, H: SmtpHandlers> {
    io: SmtpIo<S>,
    handlers: H,
    pub extensions: Extensions,
    peer: SocketAddr,
    options: ServerOptions,
    ehlo_as: Option<String>,
    authed: Option<String>,
    have_mailfrom: bool,
    have_rcptto: bool,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send, H: SmtpHandlers> Server<S, H> {
    pub fn new(stream: S, peer: SocketAddr, handlers: H, options: ServerOptions) -> Self {
        let mut extensions = Extensions::new();
        extensions.add("8BITMIME");
        extensions.add("PIPELINING");
        extensions.add("ENHANCEDSTATUSCODES");
        if options.tls.is_some() && !options.tls_immediately {
            extensions.add("STARTTLS");
        }
        if let Some(max_size) = options.max_size {
            extensions.add_with_param("SIZE", max_size.to_string());
        }
        if options.auth.is_some() {
            extensions.add("AUTH");
        }

        Self {
            io: SmtpIo::new(stream),
            handlers,
            extensions,
            peer,
            options,
            ehlo_as: None,
            authed: None,
            have_mailfrom: false,
            have_rcptto: false,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.io.is_encrypted()
    }

    /// The identity of the authenticated peer, when it authenticated.
    pub fn authed(&self) -> Option<&str> {
        self.authed.as_deref()
    }

    /// Run the session to completion: receive commands, call handlers,
    /// send responses.
    pub async fn handle(mut self) -> SmtpResult<()> {
        internal!("Session from {} started", self.peer);
        let result = self.run().await;
        // Push out anything still buffered on an error path, e.g. the
        // 421 written by a failing handler.
        let _ = self.io.flush_send().await;
        self.handlers.handle_close().await;
        self.io.close().await;
        internal!("Session from {} closed", self.peer);

        match result {
            Ok(()) => Ok(()),
            Err(CommandError::Smtp(err)) => Err(err),
            Err(CommandError::Handler(err)) => {
                internal!(level = ERROR, "Unhandled error in session handler: {err}");
                Err(SmtpError::Handler(err.to_string()))
            }
        }
    }

    async fn run(&mut self) -> Result<(), CommandError> {
        if self.options.tls_immediately {
            if let Some(tls) = self.options.tls.clone() {
                if !self.io.encrypt_server(&tls).await? {
                    reply::tls_failure().send(&mut self.io, true).await?;
                    return Ok(());
                }
                self.handlers
                    .handle_tls_handshake()
                    .await
                    .map_err(|e| self.handler_failure(e))?;
            }
        }

        let flow = self.command_banner().await;
        self.io.flush_send().await?;
        if matches!(flow?, Flow::Stop) {
            return Ok(());
        }

        loop {
            let (verb, arg) = self.recv_command_with_timeout().await?;
            let flow = self.dispatch(verb, arg).await;
            self.io.flush_send().await?;
            if matches!(flow?, Flow::Stop) {
                return Ok(());
            }
        }
    }

    /// A handler error elicits `421 4.3.0` before the session dies.
    fn handler_failure(&mut self, err: anyhow::Error) -> CommandError {
        self.io.send_reply(&reply::unhandled_error());
        CommandError::Handler(err)
    }

    async fn recv_command_with_timeout(
        &mut self,
    ) -> Result<(Option<String>, Option<String>), CommandError> {
        match self.options.command_timeout {
            Some(timeout) => {
                match tokio::time::timeout(timeout, self.io.recv_command()).await {
                    Ok(result) => Ok(result?),
                    Err(_) => {
                        reply::timed_out().send(&mut self.io, true).await?;
                        Err(SmtpError::ConnectionLost.into())
                    }
                }
            }
            None => Ok(self.io.recv_command().await?),
        }
    }

    async fn dispatch(&mut self, verb: Option<String>, arg: Option<String>) -> CommandResult {
        let Some(verb) = verb else {
            reply::unknown_command().send(&mut self.io, false).await?;
            return Ok(Flow::Continue);
        };

        match arg.as_deref() {
            Some(arg) => incoming!("{verb} {arg}"),
            None => incoming!("{verb}"),
        }

        match verb.as_str() {
            "EHLO" => self.command_ehlo(arg).await,
            "HELO" => self.command_helo(arg).await,
            "STARTTLS" => self.command_starttls(arg).await,
            "AUTH" => self.command_auth(arg).await,
            "MAIL" => self.command_mail(arg).await,
            "RCPT" => self.command_rcpt(arg).await,
            "DATA" => self.command_data(arg).await,
            "RSET" => self.command_rset(arg).await,
            "NOOP" => self.command_noop().await,
            "QUIT" => self.command_quit(arg).await,
            _ => self.command_custom(&verb, arg.as_deref()).await,
        }
    }

    async fn send_static(&mut self, reply: Reply) -> CommandResult {
        reply.send(&mut self.io, false).await?;
        Ok(Flow::Continue)
    }

    async fn command_banner(&mut self) -> CommandResult {
        let mut reply = Reply::new("220", "ESMTP server");
        reply.clear_enhanced_status_code();
        self.handlers
            .handle_banner(&mut reply, &self.peer)
            .await
            .map_err(|e| self.handler_failure(e))?;

        reply.send(&mut self.io, false).await?;

        if reply.code() == Some("220") {
            Ok(Flow::Continue)
        } else {
            Ok(Flow::Stop)
        }
    }

    async fn command_ehlo(&mut self, arg: Option<String>) -> CommandResult {
        let Some(ehlo_as) = arg else {
            return self.send_static(reply::bad_arguments()).await;
        };

        let mut reply = Reply::new("250", &format!("Hello {ehlo_as}"));
        reply.clear_enhanced_status_code();
        self.handlers
            .handle_ehlo(&mut reply, &ehlo_as)
            .await
            .map_err(|e| self.handler_failure(e))?;

        if reply.code() == Some("250") {
            self.refresh_auth_advertisement();
            let greeting = reply.raw_message().unwrap_or_default().to_owned();
            reply.set_message(Some(&self.extensions.build_string(&greeting)));

            self.have_mailfrom = false;
            self.have_rcptto = false;
            self.ehlo_as = Some(ehlo_as);
        }

        reply.send(&mut self.io, false).await?;
        Ok(Flow::Continue)
    }

    async fn command_helo(&mut self, arg: Option<String>) -> CommandResult {
        let Some(helo_as) = arg else {
            return self.send_static(reply::bad_arguments()).await;
        };

        let mut reply = Reply::new("250", &format!("Hello {helo_as}"));
        reply.clear_enhanced_status_code();
        self.handlers
            .handle_helo(&mut reply, &helo_as)
            .await
            .map_err(|e| self.handler_failure(e))?;

        if reply.code() == Some("250") {
            self.have_mailfrom = false;
            self.have_rcptto = false;
            self.ehlo_as = Some(helo_as);
            // Plain HELO clients get no extensions at all.
            self.extensions.reset();
        }

        reply.send(&mut self.io, false).await?;
        Ok(Flow::Continue)
    }

    async fn command_starttls(&mut self, arg: Option<String>) -> CommandResult {
        if !self.extensions.contains("STARTTLS") {
            return self.send_static(reply::unknown_command()).await;
        }
        if arg.is_some() {
            return self.send_static(reply::bad_arguments()).await;
        }
        if self.ehlo_as.is_none() {
            return self.send_static(reply::bad_sequence()).await;
        }
        let Some(tls) = self.options.tls.clone() else {
            return self.send_static(reply::unknown_command()).await;
        };

        let mut reply = Reply::new("220", "2.7.0 Go ahead");
        self.handlers
            .handle_starttls(&mut reply)
            .await
            .map_err(|e| self.handler_failure(e))?;

        reply.send(&mut self.io, true).await?;

        if reply.code() == Some("220") {
            if !self.io.encrypt_server(&tls).await? {
                reply::tls_failure().send(&mut self.io, true).await?;
                return Ok(Flow::Stop);
            }
            self.handlers
                .handle_tls_handshake()
                .await
                .map_err(|e| self.handler_failure(e))?;
            self.ehlo_as = None;
            self.extensions.remove("STARTTLS");
        }

        Ok(Flow::Continue)
    }

    async fn command_auth(&mut self, arg: Option<String>) -> CommandResult {
        if !self.extensions.contains("AUTH") {
            return self.send_static(reply::unknown_command()).await;
        }
        if self.ehlo_as.is_none() || self.authed.is_some() || self.have_mailfrom {
            return self.send_static(reply::bad_sequence()).await;
        }
        let Some(arg) = arg else {
            return self.send_static(reply::bad_arguments()).await;
        };
        let Some(auth) = self.options.auth.clone() else {
            return self.send_static(reply::unknown_command()).await;
        };

        let encrypted = self.io.is_encrypted();
        match auth
            .session
            .server_attempt(&mut self.io, &arg, auth.backend.as_ref(), encrypted)
            .await
        {
            Ok(identity) => {
                let mut reply = Reply::new("235", "2.7.0 Authentication successful");
                self.handlers
                    .handle_auth(&mut reply, &identity)
                    .await
                    .map_err(|e| self.handler_failure(e))?;

                let accepted = reply.code() == Some("235");
                reply.send(&mut self.io, false).await?;
                if accepted {
                    self.authed = Some(identity);
                }
                Ok(Flow::Continue)
            }
            Err(AuthAttemptError::Auth(err)) => self.send_static(err.reply).await,
            Err(AuthAttemptError::Session(err)) => Err(err.into()),
        }
    }

    async fn command_mail(&mut self, arg: Option<String>) -> CommandResult {
        let Some(arg) = arg else {
            return self.send_static(reply::bad_arguments()).await;
        };
        let Some((address, rest)) = parse_path(&arg, "FROM:") else {
            return self.send_static(reply::bad_arguments()).await;
        };

        if self.ehlo_as.is_none() || self.have_mailfrom {
            return self.send_static(reply::bad_sequence()).await;
        }
        if self.options.tls_required && !self.io.is_encrypted() {
            return self
                .send_static(Reply::new("530", "5.7.0 Must issue a STARTTLS command first"))
                .await;
        }

        let params = gather_params(rest);
        if let Some(flow) = self.validate_mail_params(&params).await? {
            return Ok(flow);
        }

        let mut reply = Reply::new("250", &format!("2.1.0 Sender <{address}> Ok"));
        self.handlers
            .handle_mail(&mut reply, &address, &params)
            .await
            .map_err(|e| self.handler_failure(e))?;

        let accepted = reply.code() == Some("250");
        reply.send(&mut self.io, false).await?;
        self.have_mailfrom = self.have_mailfrom || accepted;
        Ok(Flow::Continue)
    }

    /// Validate ESMTP parameters on MAIL. Returns a flow when a
    /// rejection reply was already sent.
    async fn validate_mail_params(
        &mut self,
        params: &EsmtpParams,
    ) -> Result<Option<Flow>, CommandError> {
        for keyword in params.keys() {
            let known = matches!(keyword.as_str(), "SIZE" | "BODY")
                || (keyword == "AUTH" && self.options.auth.is_some());
            if !known {
                self.send_static(reply::unknown_parameter()).await?;
                return Ok(Some(Flow::Continue));
            }
        }

        if let Some(value) = params.get("SIZE") {
            let declared = value.as_deref().and_then(|v| v.parse::<usize>().ok());
            let Some(declared) = declared else {
                self.send_static(reply::bad_arguments()).await?;
                return Ok(Some(Flow::Continue));
            };
            match self.extensions.getparam_parsed::<usize>("SIZE") {
                Some(max_size) => {
                    if declared > max_size {
                        let reply = Reply::new(
                            "552",
                            &format!("5.3.4 Message size exceeds {max_size} limit"),
                        );
                        self.send_static(reply).await?;
                        return Ok(Some(Flow::Continue));
                    }
                }
                None => {
                    self.send_static(reply::unknown_parameter()).await?;
                    return Ok(Some(Flow::Continue));
                }
            }
        }

        Ok(None)
    }

    async fn command_rcpt(&mut self, arg: Option<String>) -> CommandResult {
        let Some(arg) = arg else {
            return self.send_static(reply::bad_arguments()).await;
        };
        let Some((address, rest)) = parse_path(&arg, "TO:") else {
            return self.send_static(reply::bad_arguments()).await;
        };

        if !self.have_mailfrom {
            return self.send_static(reply::bad_sequence()).await;
        }

        let params = gather_params(rest);
        if !params.is_empty() {
            return self.send_static(reply::unknown_parameter()).await;
        }

        let mut reply = Reply::new("250", &format!("2.1.5 Recipient <{address}> Ok"));
        self.handlers
            .handle_rcpt(&mut reply, &address, &params)
            .await
            .map_err(|e| self.handler_failure(e))?;

        let accepted = reply.code() == Some("250");
        reply.send(&mut self.io, false).await?;
        self.have_rcptto = self.have_rcptto || accepted;
        Ok(Flow::Continue)
    }

    async fn command_data(&mut self, arg: Option<String>) -> CommandResult {
        if arg.is_some() {
            return self.send_static(reply::bad_arguments()).await;
        }
        if !self.have_mailfrom || !self.have_rcptto {
            return self.send_static(reply::bad_sequence()).await;
        }

        let mut reply = Reply::new("354", "Start mail input; end with <CRLF>.<CRLF>");
        self.handlers
            .handle_data(&mut reply)
            .await
            .map_err(|e| self.handler_failure(e))?;

        reply.send(&mut self.io, true).await?;

        if reply.code() == Some("354") {
            self.receive_message_data().await?;
        }
        Ok(Flow::Continue)
    }

    async fn receive_message_data(&mut self) -> Result<(), CommandError> {
        let max_size = self.extensions.getparam_parsed::<usize>("SIZE");

        let result = match self.options.data_timeout {
            Some(timeout) => {
                match tokio::time::timeout(
                    timeout,
                    DataReader::new(&mut self.io, max_size).recv(),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => {
                        reply::timed_out().send(&mut self.io, true).await?;
                        return Err(SmtpError::ConnectionLost.into());
                    }
                }
            }
            None => DataReader::new(&mut self.io, max_size).recv().await,
        };

        let (data, err) = match result {
            Ok(data) => (Some(data), None),
            Err(SmtpError::TooBig) => (None, Some(SmtpError::TooBig)),
            Err(err) => return Err(err.into()),
        };

        let mut reply = Reply::new("250", "2.6.0 Message Accepted for Delivery");
        self.handlers
            .handle_have_data(&mut reply, data.as_deref(), err.as_ref())
            .await
            .map_err(|e| self.handler_failure(e))?;

        reply.send(&mut self.io, true).await?;

        // The transaction is over regardless of outcome.
        self.have_mailfrom = false;
        self.have_rcptto = false;
        Ok(())
    }

    async fn command_rset(&mut self, arg: Option<String>) -> CommandResult {
        if arg.is_some() {
            return self.send_static(reply::bad_arguments()).await;
        }

        let mut reply = Reply::new("250", "Ok");
        self.handlers
            .handle_rset(&mut reply)
            .await
            .map_err(|e| self.handler_failure(e))?;

        if reply.code() == Some("250") {
            self.have_mailfrom = false;
            self.have_rcptto = false;
        }

        reply.send(&mut self.io, false).await?;
        Ok(Flow::Continue)
    }

    async fn command_noop(&mut self) -> CommandResult {
        let mut reply = Reply::new("250", "Ok");
        self.handlers
            .handle_noop(&mut reply)
            .await
            .map_err(|e| self.handler_failure(e))?;

        reply.send(&mut self.io, false).await?;
        Ok(Flow::Continue)
    }

    async fn command_quit(&mut self, arg: Option<String>) -> CommandResult {
        if arg.is_some() {
            return self.send_static(reply::bad_arguments()).await;
        }

        let mut reply = Reply::new("221", "Bye");
        self.handlers
            .handle_quit(&mut reply)
            .await
            .map_err(|e| self.handler_failure(e))?;

        let closing = reply.code() == Some("221");
        reply.send(&mut self.io, false).await?;

        if closing {
            Ok(Flow::Stop)
        } else {
            Ok(Flow::Continue)
        }
    }

    async fn command_custom(&mut self, verb: &str, arg: Option<&str>) -> CommandResult {
        let mut reply = reply::unknown_command();
        self.handlers
            .handle_unknown(&mut reply, verb, arg)
            .await
            .map_err(|e| self.handler_failure(e))?;

        reply.send(&mut self.io, false).await?;
        Ok(Flow::Continue)
    }

    fn refresh_auth_advertisement(&mut self) {
        if let Some(auth) = &self.options.auth {
            let advertisement = auth.session.advertisement(self.io.is_encrypted());
            if self.extensions.contains("AUTH") {
                if advertisement.is_empty() {
                    self.extensions.add("AUTH");
                } else {
                    self.extensions.add_with_param("AUTH", advertisement);
                }
            }
        }
    }
}

/// Parse `FROM:<address>` / `TO:<address>`, returning the address and the
/// remaining parameter text. The closing `>` search honors double-quoted
/// substrings: a literal `>` inside `"…"` does not terminate the address.
fn parse_path<'a>(arg: &'a str, prefix: &str) -> Option<(String, &'a str)> {
    let bytes = arg.as_bytes();
    if bytes.len() < prefix.len()
        || !bytes[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
    {
        return None;
    }

    let mut open = prefix.len();
    while bytes.get(open).is_some_and(u8::is_ascii_whitespace) {
        open += 1;
    }
    if bytes.get(open) != Some(&b'<') {
        return None;
    }

    let start = open + 1;
    let end = find_outside_quotes(bytes, b'>', start)?;
    let address = String::from_utf8_lossy(&bytes[start..end]).into_owned();
    Some((address, &arg[end + 1..]))
}

/// Find `needle` in `haystack` starting at `start_i`, skipping any match
/// inside a double-quoted substring.
fn find_outside_quotes(haystack: &[u8], needle: u8, start_i: usize) -> Option<usize> {
    let mut quoted = false;
    for (i, &byte) in haystack.iter().enumerate().skip(start_i) {
        if quoted {
            if byte == b'"' {
                quoted = false;
            }
        } else if byte == needle {
            return Some(i);
        } else if byte == b'"' {
            quoted = true;
        }
    }
    None
}

/// Gather trailing `KEYWORD[=value]` ESMTP parameters.
fn gather_params(rest: &str) -> EsmtpParams {
    let mut params = EsmtpParams::default();
    for token in rest.split_whitespace() {
        let (keyword, value) = match token.split_once('=') {
            Some((keyword, value)) if !value.is_empty() => (keyword, Some(value.to_owned())),
            Some((keyword, _)) => (keyword, None),
            None => (token, None),
        };
        if is_param_keyword(keyword) {
            params.insert(keyword.to_ascii_uppercase(), value);
        }
    }
    params
}

fn is_param_keyword(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '-')
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_path_basic() {
        let (address, rest) = parse_path("FROM:<sender@example.com>", "FROM:").unwrap();
        assert_eq!(address, "sender@example.com");
        assert_eq!(rest, "");
    }

    #[test]
    fn parse_path_case_and_spacing() {
        let (address, rest) = parse_path("from: <sender@example.com> SIZE=100", "FROM:").unwrap();
        assert_eq!(address, "sender@example.com");
        assert_eq!(rest, " SIZE=100");
    }

    #[test]
    fn parse_path_null_sender() {
        let (address, _) = parse_path("FROM:<>", "FROM:").unwrap();
        assert_eq!(address, "");
    }

    #[test]
    fn parse_path_quoted_gt() {
        let (address, _) = parse_path("FROM:<\"weird>addr\"@example.com>", "FROM:").unwrap();
        assert_eq!(address, "\"weird>addr\"@example.com");
    }

    #[test]
    fn parse_path_rejects_malformed() {
        assert!(parse_path("FROM:sender@example.com", "FROM:").is_none());
        assert!(parse_path("FROM:<unterminated", "FROM:").is_none());
        assert!(parse_path("TO:<x>", "FROM:").is_none());
    }

    #[test]
    fn gather_params_keywords_and_values() {
        let params = gather_params(" SIZE=1000 BODY=8BITMIME FLAG");
        assert_eq!(params.get("SIZE"), Some(&Some("1000".to_owned())));
        assert_eq!(params.get("BODY"), Some(&Some("8BITMIME".to_owned())));
        assert_eq!(params.get("FLAG"), Some(&None));
    }
}
