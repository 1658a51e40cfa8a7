//! The SMTP edge: a listening socket whose accepted connections are
//! driven through the SMTP server state machine, with completed messages
//! handed to the queue before the client is told they were accepted.

use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use mailway_common::{ClientInfo, Envelope, Signal, internal};
use mailway_delivery::Queue;
use mailway_smtp::{
    EsmtpParams, HandlerResult, Reply, Server, ServerOptions, SmtpError, SmtpHandlers,
};
use tokio::{net::TcpListener, sync::broadcast};

/// Operator hooks that can gate or rewrite replies before they are
/// sent. Leaving the reply untouched keeps the command's default,
/// successful reply.
#[async_trait]
pub trait EdgeValidators: Send + Sync {
    async fn validate_banner(&self, _reply: &mut Reply, _peer: &SocketAddr) {}
    async fn validate_ehlo(&self, _reply: &mut Reply, _ehlo_as: &str) {}
    async fn validate_helo(&self, _reply: &mut Reply, _helo_as: &str) {}
    async fn validate_mail(&self, _reply: &mut Reply, _sender: &str) {}
    async fn validate_rcpt(&self, _reply: &mut Reply, _recipient: &str) {}
    async fn validate_data(&self, _reply: &mut Reply) {}
    async fn validate_auth(&self, _reply: &mut Reply, _identity: &str) {}
    /// Called after a successful TLS handshake.
    async fn validate_tls(&self) {}
}

/// Validators that accept everything.
pub struct NoValidators;

#[async_trait]
impl EdgeValidators for NoValidators {}

/// An edge service receiving messages over SMTP and queueing them.
pub struct SmtpEdge {
    address: SocketAddr,
    queue: Arc<Queue>,
    options: ServerOptions,
    validators: Arc<dyn EdgeValidators>,
    hostname: String,
}

impl SmtpEdge {
    pub fn new(address: SocketAddr, queue: Arc<Queue>) -> Self {
        Self {
            address,
            queue,
            options: ServerOptions::default(),
            validators: Arc::new(NoValidators),
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
        }
    }

    /// Session configuration passed to each accepted connection: TLS,
    /// AUTH, timeouts, maximum message size.
    pub fn with_options(mut self, options: ServerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_validators(mut self, validators: Arc<dyn EdgeValidators>) -> Self {
        self.validators = validators;
        self
    }

    /// Hostname recorded as the receiver on queued envelopes.
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Bind and run the accept loop until shutdown.
    pub async fn serve(
        self: Arc<Self>,
        shutdown: broadcast::Receiver<Signal>,
    ) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.address).await?;
        self.serve_listener(listener, shutdown).await
    }

    /// Run the accept loop on an already-bound listener.
    pub async fn serve_listener(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<Signal>,
    ) -> std::io::Result<()> {
        internal!("SMTP edge listening on {}", listener.local_addr()?);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    internal!("SMTP edge shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let edge = Arc::clone(&self);
                            tokio::spawn(async move {
                                let handlers = EdgeHandlers::new(Arc::clone(&edge), peer);
                                let server =
                                    Server::new(stream, peer, handlers, edge.options.clone());
                                if let Err(err) = server.handle().await {
                                    internal!(
                                        level = DEBUG,
                                        "Session from {peer} ended with error: {err}"
                                    );
                                }
                            });
                        }
                        Err(err) => {
                            internal!(level = WARN, "Failed to accept connection: {err}");
                        }
                    }
                }
            }
        }
    }
}

/// Per-connection session state: protocol-string bookkeeping and the
/// envelope being assembled across MAIL/RCPT/DATA.
struct EdgeHandlers {
    edge: Arc<SmtpEdge>,
    peer: SocketAddr,
    protocol: String,
    ehlo_as: Option<String>,
    authed: Option<String>,
    envelope: Option<Envelope>,
}

impl EdgeHandlers {
    fn new(edge: Arc<SmtpEdge>, peer: SocketAddr) -> Self {
        Self {
            edge,
            peer,
            protocol: "SMTP".to_owned(),
            ehlo_as: None,
            authed: None,
            envelope: None,
        }
    }

    /// Track the protocol variant recorded on envelopes, per the
    /// `ESMTP`/`ESMTPS`/`ESMTPA`/`ESMTPSA` naming convention.
    fn modify_protocol(&mut self, change: &str) {
        self.protocol = match (self.protocol.as_str(), change) {
            ("SMTP", "EHLO") => "ESMTP",
            ("SMTP", "STARTTLS") => "SMTPS",
            ("SMTPS", "EHLO") => "ESMTPS",
            ("ESMTP", "STARTTLS") => "ESMTPS",
            ("ESMTP", "AUTH") => "ESMTPA",
            ("ESMTPA", "STARTTLS") => "ESMTPSA",
            ("ESMTPS", "AUTH") => "ESMTPSA",
            (current, _) => current,
        }
        .to_owned();
    }
}

#[async_trait]
impl SmtpHandlers for EdgeHandlers {
    async fn handle_banner(&mut self, reply: &mut Reply, peer: &SocketAddr) -> HandlerResult {
        self.edge.validators.validate_banner(reply, peer).await;
        Ok(())
    }

    async fn handle_ehlo(&mut self, reply: &mut Reply, ehlo_as: &str) -> HandlerResult {
        self.edge.validators.validate_ehlo(reply, ehlo_as).await;
        self.modify_protocol("EHLO");
        if reply.code() == Some("250") {
            self.ehlo_as = Some(ehlo_as.to_owned());
            self.envelope = None;
        }
        Ok(())
    }

    async fn handle_helo(&mut self, reply: &mut Reply, helo_as: &str) -> HandlerResult {
        self.edge.validators.validate_helo(reply, helo_as).await;
        if reply.code() == Some("250") {
            self.ehlo_as = Some(helo_as.to_owned());
            self.envelope = None;
        }
        Ok(())
    }

    async fn handle_tls_handshake(&mut self) -> HandlerResult {
        self.edge.validators.validate_tls().await;
        self.modify_protocol("STARTTLS");
        Ok(())
    }

    async fn handle_auth(&mut self, reply: &mut Reply, identity: &str) -> HandlerResult {
        self.edge.validators.validate_auth(reply, identity).await;
        if reply.code() == Some("235") {
            self.authed = Some(identity.to_owned());
            self.modify_protocol("AUTH");
        }
        Ok(())
    }

    async fn handle_mail(
        &mut self,
        reply: &mut Reply,
        address: &str,
        _params: &EsmtpParams,
    ) -> HandlerResult {
        self.edge.validators.validate_mail(reply, address).await;
        if reply.code() == Some("250") {
            self.envelope = Some(Envelope::new(address));
        }
        Ok(())
    }

    async fn handle_rcpt(
        &mut self,
        reply: &mut Reply,
        address: &str,
        _params: &EsmtpParams,
    ) -> HandlerResult {
        self.edge.validators.validate_rcpt(reply, address).await;
        if reply.code() == Some("250") {
            if let Some(envelope) = self.envelope.as_mut() {
                envelope.recipients.push(address.to_owned());
            }
        }
        Ok(())
    }

    async fn handle_data(&mut self, reply: &mut Reply) -> HandlerResult {
        self.edge.validators.validate_data(reply).await;
        Ok(())
    }

    async fn handle_rset(&mut self, _reply: &mut Reply) -> HandlerResult {
        self.envelope = None;
        Ok(())
    }

    async fn handle_have_data(
        &mut self,
        reply: &mut Reply,
        data: Option<&[u8]>,
        err: Option<&SmtpError>,
    ) -> HandlerResult {
        if let Some(err) = err {
            self.envelope = None;
            if matches!(err, SmtpError::TooBig) {
                reply.set_code(Some("552")).ok();
                reply.set_message(Some("5.3.4 Message exceeded size limit"));
                return Ok(());
            }
            return Err(anyhow::anyhow!("message reception failed: {err}"));
        }

        let Some(mut envelope) = self.envelope.take() else {
            return Err(anyhow::anyhow!("message data without a transaction"));
        };
        let data = data.unwrap_or_default();

        if let Err(parse_err) = envelope.parse(data) {
            return Err(anyhow::anyhow!("unparseable message: {parse_err}"));
        }

        envelope.receiver = Some(self.edge.hostname.clone());
        envelope.timestamp = Some(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        );
        envelope.client = ClientInfo {
            ip: Some(self.peer.ip().to_string()),
            host: None,
            name: self.ehlo_as.clone(),
            protocol: Some(self.protocol.clone()),
            auth: self.authed.clone(),
        };

        let results = self.edge.queue.enqueue(envelope).await;
        match results.first() {
            Some((_, Ok(id))) => {
                internal!("Message accepted and queued as {id}");
            }
            _ => {
                reply.set_code(Some("550")).ok();
                reply.set_message(Some("5.6.0 Error queuing message"));
            }
        }
        Ok(())
    }
}
