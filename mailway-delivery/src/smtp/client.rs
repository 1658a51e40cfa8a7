//! The long-lived SMTP client worker behind a pooled relay.
//!
//! A worker connects, performs the banner/EHLO/STARTTLS/AUTH handshake
//! once, then polls the pool's work deque for envelopes until its idle
//! timeout lapses. Command batches ride a single flush when the peer
//! advertises PIPELINING.

use std::{future::Future, sync::Arc, time::Duration};

use mailway_common::{Envelope, internal};
use mailway_smtp::{Client, Reply, SmtpError, SmtpResult};
use tokio::net::TcpStream;

use crate::{
    deque::BlockingDeque,
    error::RelayError,
    pool::{DeliveryRequest, WorkerState},
    relay::{RelayOutcome, RelayResult},
    smtp::SmtpClientOptions,
};

pub(crate) struct SmtpRelayClient {
    host: String,
    port: u16,
    queue: Arc<BlockingDeque<DeliveryRequest>>,
    state: Arc<WorkerState>,
    options: SmtpClientOptions,
}

impl SmtpRelayClient {
    pub(crate) fn new(
        host: String,
        port: u16,
        queue: Arc<BlockingDeque<DeliveryRequest>>,
        state: Arc<WorkerState>,
        options: SmtpClientOptions,
    ) -> Self {
        Self {
            host,
            port,
            queue,
            state,
            options,
        }
    }

    pub(crate) async fn run(self) {
        let address = format!("{}:{}", self.host, self.port);

        let stream = match tokio::time::timeout(
            self.options.connect_timeout,
            TcpStream::connect(&address),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                self.fail_pending(RelayError::transient(format!(
                    "Connection to {address} failed: {err}"
                )));
                return;
            }
            Err(_) => {
                self.fail_pending(RelayError::transient(format!(
                    "Connection to {address} timed out"
                )));
                return;
            }
        };
        internal!("Relay connection to {address} established");

        let mut client = Client::new(stream);
        if let Err(err) = self.handshake(&mut client).await {
            internal!(level = WARN, "Relay handshake with {address} failed: {err}");
            self.fail_pending(err);
            let _ = with_timeout(self.options.command_timeout, client.quit()).await;
            client.close().await;
            return;
        }

        self.serve_requests(&mut client).await;

        let _ = with_timeout(self.options.command_timeout, client.quit()).await;
        client.close().await;
        internal!("Relay connection to {address} closed");
    }

    async fn serve_requests(&self, client: &mut Client<TcpStream>) {
        loop {
            self.state.set_idle(true);
            let request = match self.options.idle_timeout {
                Some(timeout) => match self.queue.pop_front_timeout(timeout).await {
                    Some(request) => request,
                    None => {
                        self.state.set_idle(false);
                        return;
                    }
                },
                None => self.queue.pop_front().await,
            };
            self.state.set_idle(false);

            // The peer spoke while this side idled, most likely a
            // timeout notice; let a fresh connection take the request.
            if client.has_reply_waiting() {
                self.queue.push_front(request);
                return;
            }

            let DeliveryRequest { result, envelope } = request;
            match self.deliver(client, envelope).await {
                Ok(outcome) => {
                    let _ = result.send(outcome);
                }
                Err(err) => {
                    let _ = result.send(Err(RelayError::transient(format!(
                        "Connection failed: {err}"
                    ))));
                    return;
                }
            }

            if self.options.idle_timeout.is_none() {
                return;
            }
        }
    }

    /// On a connect or handshake failure there may already be a request
    /// waiting that spawned this worker; fail it rather than leaving it
    /// for a connection that will never exist.
    fn fail_pending(&self, err: RelayError) {
        if let Some(request) = self.queue.try_pop_front() {
            let _ = request.result.send(Err(err));
        }
    }

    async fn handshake(&self, client: &mut Client<TcpStream>) -> Result<(), RelayError> {
        let options = &self.options;

        if options.tls_immediately {
            if let Some(tls) = &options.tls {
                let upgraded = self
                    .command(client.encrypt(tls, &self.host))
                    .await
                    .map_err(fatal_to_transient)?;
                if !upgraded && options.tls_required {
                    return Err(tls_unavailable());
                }
            }
        }

        let banner = self
            .command(client.get_banner())
            .await
            .map_err(fatal_to_transient)?;
        if banner.is_error() {
            return Err(RelayError::from_reply(banner));
        }

        self.ehlo(client).await?;

        if let Some(tls) = &options.tls {
            if !options.tls_immediately && client.extensions.contains("STARTTLS") {
                let reply = self
                    .command(client.starttls(tls, &self.host))
                    .await
                    .map_err(fatal_to_transient)?;
                if !reply.is_error() && client.is_encrypted() {
                    self.ehlo(client).await?;
                }
            }
        }

        if options.tls_required && !client.is_encrypted() {
            return Err(tls_unavailable());
        }

        if let Some(credentials) = &options.credentials {
            let reply = self
                .command(client.auth(credentials))
                .await
                .map_err(fatal_to_transient)?;
            if reply.is_error() {
                return Err(RelayError::from_reply(reply));
            }
        }

        Ok(())
    }

    async fn ehlo(&self, client: &mut Client<TcpStream>) -> Result<(), RelayError> {
        let reply = self
            .command(client.ehlo(&self.options.ehlo_as))
            .await
            .map_err(fatal_to_transient)?;
        if reply.is_error() {
            return Err(RelayError::from_reply(reply));
        }
        Ok(())
    }

    /// Execute MAIL, RCPT and DATA for one envelope. `Ok(Err(_))` is a
    /// delivery failure on a still-healthy session; `Err(_)` means the
    /// session itself is gone.
    async fn deliver(
        &self,
        client: &mut Client<TcpStream>,
        mut envelope: Envelope,
    ) -> Result<RelayResult, SmtpError> {
        if envelope.has_8bit() && !client.extensions.contains("8BITMIME") {
            if envelope
                .encode_7bit(self.options.binary_encoder.as_ref())
                .is_err()
            {
                return Ok(Err(RelayError::permanent(
                    "Message requires 8-bit transport",
                )));
            }
        }

        let (header_data, message_data) = envelope.flatten();
        let data_size = header_data.len() + message_data.len();

        // With PIPELINING advertised, everything up to and including
        // DATA goes out in one flush.
        let mail = self
            .command(client.mailfrom(&envelope.sender, Some(data_size)))
            .await?;
        let mut rcpts = Vec::with_capacity(envelope.recipients.len());
        for recipient in &envelope.recipients {
            rcpts.push(self.command(client.rcptto(recipient)).await?);
        }
        let data = self.command(client.data_queued()).await?;
        self.command(client.flush_pipeline()).await?;

        let mail_reply = client.reply(mail).clone();
        let data_reply = client.reply(data).clone();
        let rcpt_replies: Vec<Reply> = rcpts
            .iter()
            .map(|pending| client.reply(*pending).clone())
            .collect();

        let every_rcpt_failed =
            !rcpt_replies.is_empty() && rcpt_replies.iter().all(Reply::is_error);
        if mail_reply.is_error() || every_rcpt_failed || data_reply.is_error() {
            // A 354 means the server is waiting for message content even
            // though the delivery is lost; terminate it with an empty
            // message first.
            if !data_reply.is_error() {
                let empty = self.data_command(client.send_empty_data()).await?;
                self.data_command(client.flush_pipeline()).await?;
                let _ = client.reply(empty);
            }
            self.command(client.rset()).await?;

            let failing = if mail_reply.is_error() {
                mail_reply
            } else if every_rcpt_failed {
                rcpt_replies[0].clone()
            } else {
                data_reply
            };
            return Ok(Err(RelayError::from_reply(failing)));
        }

        let sent = self
            .data_command(client.send_data(&header_data, &message_data))
            .await?;
        self.data_command(client.flush_pipeline()).await?;
        let sent_reply = client.reply(sent).clone();
        if sent_reply.is_error() {
            self.command(client.rset()).await?;
            return Ok(Err(RelayError::from_reply(sent_reply)));
        }

        if rcpt_replies.iter().any(Reply::is_error) {
            let results = rcpt_replies
                .into_iter()
                .map(|reply| reply.is_error().then(|| RelayError::from_reply(reply)))
                .collect();
            return Ok(Ok(RelayOutcome::PerRecipient(results)));
        }
        Ok(Ok(RelayOutcome::Delivered))
    }

    async fn command<T>(
        &self,
        fut: impl Future<Output = SmtpResult<T>>,
    ) -> Result<T, SmtpError> {
        with_timeout(self.options.command_timeout, fut).await
    }

    async fn data_command<T>(
        &self,
        fut: impl Future<Output = SmtpResult<T>>,
    ) -> Result<T, SmtpError> {
        with_timeout(self.options.data_timeout, fut).await
    }
}

pub(crate) async fn with_timeout<T>(
    duration: Duration,
    fut: impl Future<Output = SmtpResult<T>>,
) -> Result<T, SmtpError> {
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(SmtpError::Timeout(duration.as_secs())),
    }
}

pub(crate) fn fatal_to_transient(err: SmtpError) -> RelayError {
    RelayError::transient(format!("Connection failed: {err}"))
}

pub(crate) fn tls_unavailable() -> RelayError {
    RelayError::permanent("TLS could not be negotiated with the destination")
}
