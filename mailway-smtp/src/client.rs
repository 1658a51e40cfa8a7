//! Client-side SMTP state machine with PIPELINING support, plus the LMTP
//! variant whose DATA phase returns one reply per accepted recipient.
//!
//! Commands that may be pipelined return a [`PendingReply`] token; the
//! matching [`Reply`] becomes readable once [`flush_pipeline`] has run.
//! When the peer did not advertise `PIPELINING`, every command blocks for
//! its reply before returning, so the token is immediately redeemable.
//!
//! [`flush_pipeline`]: Client::flush_pipeline

use std::collections::VecDeque;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    auth::{
        Mechanism, b64_decode, b64_encode, cram_md5_response, plain_response, xoauth2_response,
    },
    connection::TlsClientContext,
    data::DataSender,
    error::{SmtpError, SmtpResult},
    extensions::Extensions,
    io::SmtpIo,
    reply::Reply,
};

/// Token for a reply that may not have been read from the wire yet.
/// Redeem it with [`Client::reply`] after the pipeline has flushed.
#[derive(Debug, Clone, Copy)]
pub struct PendingReply(usize);

/// Credentials for client-side authentication.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub authcid: String,
    pub secret: String,
    pub authzid: Option<String>,
    /// Force a specific mechanism instead of negotiating from the
    /// server's advertised set.
    pub mechanism: Option<Mechanism>,
}

impl Credentials {
    pub fn new(authcid: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            authcid: authcid.into(),
            secret: secret.into(),
            authzid: None,
            mechanism: None,
        }
    }

    pub fn with_authzid(mut self, authzid: impl Into<String>) -> Self {
        self.authzid = Some(authzid.into());
        self
    }

    pub fn with_mechanism(mut self, mechanism: Mechanism) -> Self {
        self.mechanism = Some(mechanism);
        self
    }
}

pub struct Client<S: AsyncRead + AsyncWrite + Unpin + Send> {
    io: SmtpIo<S>,
    /// Extensions offered by the peer, populated by `ehlo`.
    pub extensions: Extensions,
    replies: Vec<Reply>,
    unread: VecDeque<usize>,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> Client<S> {
    pub fn new(stream: S) -> Self {
        Self {
            io: SmtpIo::new(stream),
            extensions: Extensions::new(),
            replies: Vec::new(),
            unread: VecDeque::new(),
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.io.is_encrypted()
    }

    /// Whether the peer has sent bytes this side has not consumed, e.g.
    /// an asynchronous timeout reply while the connection sat idle.
    pub fn has_reply_waiting(&self) -> bool {
        self.io.has_buffered_recv()
    }

    fn pipelining(&self) -> bool {
        self.extensions.contains("PIPELINING")
    }

    fn queue_reply(&mut self, command: &str, clear_esc: bool) -> PendingReply {
        let mut reply = Reply::pending(command);
        if clear_esc {
            reply.clear_enhanced_status_code();
        }
        self.replies.push(reply);
        let index = self.replies.len() - 1;
        self.unread.push_back(index);
        PendingReply(index)
    }

    /// The reply for a previously issued command. Unpopulated until the
    /// pipeline has been flushed past it.
    pub fn reply(&self, pending: PendingReply) -> &Reply {
        &self.replies[pending.0]
    }

    /// Flush the send buffer and read replies in FIFO order until every
    /// outstanding command has one.
    pub async fn flush_pipeline(&mut self) -> SmtpResult<()> {
        self.io.flush_send().await?;
        while let Some(index) = self.unread.pop_front() {
            let mut reply = std::mem::take(&mut self.replies[index]);
            let result = reply.recv(&mut self.io).await;
            self.replies[index] = reply;
            result?;
        }
        Ok(())
    }

    async fn flush_and_take(&mut self, pending: PendingReply) -> SmtpResult<Reply> {
        self.flush_pipeline().await?;
        Ok(self.reply(pending).clone())
    }

    /// Wait for the banner at the beginning of the connection.
    pub async fn get_banner(&mut self) -> SmtpResult<Reply> {
        let pending = self.queue_reply("[BANNER]", true);
        self.flush_and_take(pending).await
    }

    /// Send an arbitrary command and wait for its reply.
    pub async fn custom_command(&mut self, verb: &str, arg: Option<&str>) -> SmtpResult<Reply> {
        let verb = verb.to_ascii_uppercase();
        let pending = self.queue_reply(&verb, false);
        match arg {
            Some(arg) => self.io.send_command(&format!("{verb} {arg}")),
            None => self.io.send_command(&verb),
        }
        self.flush_and_take(pending).await
    }

    pub(crate) async fn hello(&mut self, verb: &str, name: &str) -> SmtpResult<Reply> {
        let pending = self.queue_reply(verb, true);
        self.io.send_command(&format!("{verb} {name}"));
        self.flush_pipeline().await?;

        if self.replies[pending.0].code() == Some("250") {
            self.extensions.reset();
            let message = self.replies[pending.0]
                .raw_message()
                .unwrap_or_default()
                .to_owned();
            let greeting = self.extensions.parse_string(&message);
            self.replies[pending.0].set_message(Some(&greeting));
        }
        Ok(self.reply(pending).clone())
    }

    /// Send EHLO; on success the peer's extensions are (re)populated and
    /// the returned reply's message is the free-form greeting line.
    pub async fn ehlo(&mut self, ehlo_as: &str) -> SmtpResult<Reply> {
        self.hello("EHLO", ehlo_as).await
    }

    pub async fn helo(&mut self, helo_as: &str) -> SmtpResult<Reply> {
        self.hello("HELO", helo_as).await
    }

    /// Encrypt the connection immediately, without STARTTLS. Returns
    /// whether the handshake succeeded.
    pub async fn encrypt(
        &mut self,
        context: &TlsClientContext,
        host: &str,
    ) -> SmtpResult<bool> {
        self.io.encrypt_client(context, host).await
    }

    /// Send STARTTLS and, on a 220, perform the TLS handshake in place.
    /// This should be followed by another `ehlo`.
    pub async fn starttls(
        &mut self,
        context: &TlsClientContext,
        host: &str,
    ) -> SmtpResult<Reply> {
        let reply = self.custom_command("STARTTLS", None).await?;
        if reply.code() == Some("220") {
            self.io.encrypt_client(context, host).await?;
        }
        Ok(reply)
    }

    /// Authenticate with the given credentials, negotiating a mechanism
    /// from the peer's advertised `AUTH` parameter unless one was forced.
    pub async fn auth(&mut self, credentials: &Credentials) -> SmtpResult<Reply> {
        let mechanism = match credentials.mechanism {
            Some(mechanism) => mechanism,
            None => self
                .pick_mechanism()
                .ok_or_else(|| SmtpError::Auth("no supported mechanism offered".to_owned()))?,
        };

        match mechanism {
            Mechanism::Plain => {
                let response = plain_response(
                    credentials.authzid.as_deref(),
                    &credentials.authcid,
                    &credentials.secret,
                );
                self.custom_command("AUTH", Some(&format!("PLAIN {response}")))
                    .await
            }
            Mechanism::Login => self.auth_login(credentials).await,
            Mechanism::CramMd5 => self.auth_cram_md5(credentials).await,
            Mechanism::XOauth2 => self.auth_xoauth2(credentials).await,
        }
    }

    fn pick_mechanism(&self) -> Option<Mechanism> {
        let advertised = self.extensions.getparam("AUTH")?;
        let offered: Vec<Mechanism> = advertised
            .split_whitespace()
            .filter_map(Mechanism::from_name)
            .collect();
        [Mechanism::CramMd5, Mechanism::Plain, Mechanism::Login]
            .into_iter()
            .find(|preferred| offered.contains(preferred))
    }

    /// Send one line of an authentication exchange and read the next
    /// reply.
    async fn auth_response(&mut self, line: &str) -> SmtpResult<Reply> {
        self.io.send_command(line);
        self.io.flush_send().await?;
        let mut reply = Reply::pending("AUTH");
        reply.recv(&mut self.io).await?;
        Ok(reply)
    }

    async fn auth_login(&mut self, credentials: &Credentials) -> SmtpResult<Reply> {
        let reply = self.custom_command("AUTH", Some("LOGIN")).await?;
        if reply.code() != Some("334") {
            return Ok(reply);
        }
        let reply = self
            .auth_response(&b64_encode(credentials.authcid.as_bytes()))
            .await?;
        if reply.code() != Some("334") {
            return Ok(reply);
        }
        self.auth_response(&b64_encode(credentials.secret.as_bytes()))
            .await
    }

    async fn auth_cram_md5(&mut self, credentials: &Credentials) -> SmtpResult<Reply> {
        let reply = self.custom_command("AUTH", Some("CRAM-MD5")).await?;
        if reply.code() != Some("334") {
            return Ok(reply);
        }

        let challenge = reply
            .raw_message()
            .and_then(b64_decode)
            .ok_or_else(|| SmtpError::BadReply("unreadable CRAM-MD5 challenge".to_owned()))?;
        let response =
            cram_md5_response(&credentials.authcid, &credentials.secret, &challenge);
        self.auth_response(&response).await
    }

    async fn auth_xoauth2(&mut self, credentials: &Credentials) -> SmtpResult<Reply> {
        let response = xoauth2_response(&credentials.authcid, &credentials.secret);
        let reply = self
            .custom_command("AUTH", Some(&format!("XOAUTH2 {response}")))
            .await?;
        if reply.code() == Some("334") {
            // The interim reply carries a JSON error payload; an empty
            // line retrieves the final reply.
            return self.auth_response("").await;
        }
        Ok(reply)
    }

    /// Send MAIL, including `SIZE=` when the peer advertised SIZE and a
    /// size was supplied.
    pub async fn mailfrom(
        &mut self,
        address: &str,
        data_size: Option<usize>,
    ) -> SmtpResult<PendingReply> {
        let pending = self.queue_reply("MAIL", false);

        let mut command = format!("MAIL FROM:<{address}>");
        if let Some(size) = data_size {
            if self.extensions.contains("SIZE") {
                command.push_str(&format!(" SIZE={size}"));
            }
        }
        self.io.send_command(&command);

        if !self.pipelining() {
            self.flush_pipeline().await?;
        }
        Ok(pending)
    }

    pub async fn rcptto(&mut self, address: &str) -> SmtpResult<PendingReply> {
        let pending = self.queue_reply("RCPT", false);
        self.io.send_command(&format!("RCPT TO:<{address}>"));

        if !self.pipelining() {
            self.flush_pipeline().await?;
        }
        Ok(pending)
    }

    /// Queue the DATA command. With PIPELINING it rides along with MAIL
    /// and RCPT in one flush; without, it blocks for its reply.
    pub async fn data_queued(&mut self) -> SmtpResult<PendingReply> {
        let pending = self.queue_reply("DATA", false);
        self.io.send_command("DATA");

        if !self.pipelining() {
            self.flush_pipeline().await?;
        }
        Ok(pending)
    }

    /// Send DATA and wait for the reply (354 when the server wants the
    /// message content next).
    pub async fn data(&mut self) -> SmtpResult<Reply> {
        let pending = self.data_queued().await?;
        self.flush_and_take(pending).await
    }

    /// Send message content with dot-stuffing applied, terminated by
    /// `CRLF.CRLF`.
    pub async fn send_data(
        &mut self,
        header_data: &[u8],
        message_data: &[u8],
    ) -> SmtpResult<PendingReply> {
        let pending = self.queue_reply("[SEND_DATA]", false);

        let combined = [header_data, message_data].concat();
        DataSender::new(&combined).send(&mut self.io);

        if !self.pipelining() {
            self.flush_pipeline().await?;
        }
        Ok(pending)
    }

    /// Terminate an empty message: a line with a single `.`.
    pub async fn send_empty_data(&mut self) -> SmtpResult<PendingReply> {
        let pending = self.queue_reply("[SEND_DATA]", false);
        self.io.send_command(".");

        if !self.pipelining() {
            self.flush_pipeline().await?;
        }
        Ok(pending)
    }

    pub async fn rset(&mut self) -> SmtpResult<Reply> {
        self.custom_command("RSET", None).await
    }

    pub async fn quit(&mut self) -> SmtpResult<Reply> {
        self.custom_command("QUIT", None).await
    }

    /// Close the underlying stream.
    pub async fn close(&mut self) {
        self.io.close().await;
    }
}

/// LMTP client: substitutes LHLO for EHLO/HELO and reads one DATA reply
/// per accepted recipient, in RCPT order.
pub struct LmtpClient<S: AsyncRead + AsyncWrite + Unpin + Send> {
    inner: Client<S>,
    rcpttos: Vec<(String, PendingReply)>,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> LmtpClient<S> {
    pub fn new(stream: S) -> Self {
        Self {
            inner: Client::new(stream),
            rcpttos: Vec::new(),
        }
    }

    pub fn extensions(&self) -> &Extensions {
        &self.inner.extensions
    }

    pub fn is_encrypted(&self) -> bool {
        self.inner.is_encrypted()
    }

    pub fn has_reply_waiting(&self) -> bool {
        self.inner.has_reply_waiting()
    }

    pub fn reply(&self, pending: PendingReply) -> &Reply {
        self.inner.reply(pending)
    }

    pub async fn get_banner(&mut self) -> SmtpResult<Reply> {
        self.inner.get_banner().await
    }

    pub async fn lhlo(&mut self, name: &str) -> SmtpResult<Reply> {
        self.inner.hello("LHLO", name).await
    }

    pub async fn starttls(
        &mut self,
        context: &TlsClientContext,
        host: &str,
    ) -> SmtpResult<Reply> {
        self.inner.starttls(context, host).await
    }

    pub async fn auth(&mut self, credentials: &Credentials) -> SmtpResult<Reply> {
        self.inner.auth(credentials).await
    }

    pub async fn mailfrom(
        &mut self,
        address: &str,
        data_size: Option<usize>,
    ) -> SmtpResult<PendingReply> {
        self.rcpttos.clear();
        self.inner.mailfrom(address, data_size).await
    }

    pub async fn rcptto(&mut self, address: &str) -> SmtpResult<PendingReply> {
        let pending = self.inner.rcptto(address).await?;
        self.rcpttos.push((address.to_owned(), pending));
        Ok(pending)
    }

    pub async fn data_queued(&mut self) -> SmtpResult<PendingReply> {
        self.inner.data_queued().await
    }

    pub async fn data(&mut self) -> SmtpResult<Reply> {
        self.inner.data().await
    }

    pub async fn flush_pipeline(&mut self) -> SmtpResult<()> {
        self.inner.flush_pipeline().await
    }

    /// Send message content and collect one reply per recipient whose
    /// RCPT succeeded, as `(recipient, reply)` pairs in RCPT order.
    pub async fn send_data(
        &mut self,
        header_data: &[u8],
        message_data: &[u8],
    ) -> SmtpResult<Vec<(String, Reply)>> {
        // Resolve any pipelined RCPT replies before deciding who was
        // accepted.
        self.inner.flush_pipeline().await?;

        let accepted: Vec<String> = self
            .rcpttos
            .iter()
            .filter(|(_, pending)| self.inner.reply(*pending).code() == Some("250"))
            .map(|(address, _)| address.clone())
            .collect();

        if accepted.is_empty() {
            return Ok(Vec::new());
        }

        let combined = [header_data, message_data].concat();
        DataSender::new(&combined).send(&mut self.inner.io);
        self.inner.io.flush_send().await?;

        let mut results = Vec::with_capacity(accepted.len());
        for address in accepted {
            let mut reply = Reply::pending("[SEND_DATA]");
            reply.recv(&mut self.inner.io).await?;
            results.push((address, reply));
        }
        Ok(results)
    }

    pub async fn rset(&mut self) -> SmtpResult<Reply> {
        self.rcpttos.clear();
        self.inner.rset().await
    }

    pub async fn quit(&mut self) -> SmtpResult<Reply> {
        self.inner.quit().await
    }

    pub async fn close(&mut self) {
        self.inner.close().await;
    }
}
