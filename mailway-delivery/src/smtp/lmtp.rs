//! The LMTP flavor of the pooled relay worker. LMTP (RFC 2033) swaps
//! EHLO for LHLO and answers the DATA content with one reply per
//! accepted recipient, which maps directly onto the queue's
//! per-recipient delivery accounting.

use std::sync::Arc;

use mailway_common::{Envelope, internal};
use mailway_smtp::{LmtpClient, Reply, SmtpError};
use tokio::net::TcpStream;

use crate::{
    deque::BlockingDeque,
    error::RelayError,
    pool::{DeliveryRequest, WorkerState},
    relay::{RelayOutcome, RelayResult},
    smtp::{
        SmtpClientOptions,
        client::{fatal_to_transient, tls_unavailable, with_timeout},
    },
};

pub(crate) struct LmtpRelayClient {
    host: String,
    port: u16,
    queue: Arc<BlockingDeque<DeliveryRequest>>,
    state: Arc<WorkerState>,
    options: SmtpClientOptions,
}

impl LmtpRelayClient {
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

        let mut client = LmtpClient::new(stream);
        if let Err(err) = self.handshake(&mut client).await {
            internal!(level = WARN, "LMTP handshake with {address} failed: {err}");
            self.fail_pending(err);
            let _ = with_timeout(self.options.command_timeout, client.quit()).await;
            client.close().await;
            return;
        }

        loop {
            self.state.set_idle(true);
            let request = match self.options.idle_timeout {
                Some(timeout) => match self.queue.pop_front_timeout(timeout).await {
                    Some(request) => request,
                    None => {
                        self.state.set_idle(false);
                        break;
                    }
                },
                None => self.queue.pop_front().await,
            };
            self.state.set_idle(false);

            if client.has_reply_waiting() {
                self.queue.push_front(request);
                break;
            }

            let DeliveryRequest { result, envelope } = request;
            match self.deliver(&mut client, envelope).await {
                Ok(outcome) => {
                    let _ = result.send(outcome);
                }
                Err(err) => {
                    let _ = result.send(Err(RelayError::transient(format!(
                        "Connection failed: {err}"
                    ))));
                    break;
                }
            }

            if self.options.idle_timeout.is_none() {
                break;
            }
        }

        let _ = with_timeout(self.options.command_timeout, client.quit()).await;
        client.close().await;
    }

    fn fail_pending(&self, err: RelayError) {
        if let Some(request) = self.queue.try_pop_front() {
            let _ = request.result.send(Err(err));
        }
    }

    async fn handshake(&self, client: &mut LmtpClient<TcpStream>) -> Result<(), RelayError> {
        let options = &self.options;

        let banner = self
            .command(client.get_banner())
            .await
            .map_err(fatal_to_transient)?;
        if banner.is_error() {
            return Err(RelayError::from_reply(banner));
        }

        self.lhlo(client).await?;

        if let Some(tls) = &options.tls {
            if client.extensions().contains("STARTTLS") {
                let reply = self
                    .command(client.starttls(tls, &self.host))
                    .await
                    .map_err(fatal_to_transient)?;
                if !reply.is_error() && client.is_encrypted() {
                    self.lhlo(client).await?;
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

    async fn lhlo(&self, client: &mut LmtpClient<TcpStream>) -> Result<(), RelayError> {
        let reply = self
            .command(client.lhlo(&self.options.ehlo_as))
            .await
            .map_err(fatal_to_transient)?;
        if reply.is_error() {
            return Err(RelayError::from_reply(reply));
        }
        Ok(())
    }

    /// LMTP delivery: the RCPT phase works as in SMTP, but the message
    /// content elicits one reply per accepted recipient, in RCPT order.
    async fn deliver(
        &self,
        client: &mut LmtpClient<TcpStream>,
        mut envelope: Envelope,
    ) -> Result<RelayResult, SmtpError> {
        if envelope.has_8bit() && !client.extensions().contains("8BITMIME") {
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

        let data_results = self
            .data_command(client.send_data(&header_data, &message_data))
            .await?;

        let mut results: Vec<Option<RelayError>> = rcpt_replies
            .iter()
            .map(|reply| {
                reply
                    .is_error()
                    .then(|| RelayError::from_reply(reply.clone()))
            })
            .collect();

        let mut had_errors = results.iter().any(Option::is_some);
        for (recipient, reply) in data_results {
            if !reply.is_error() {
                continue;
            }
            had_errors = true;
            if let Some(index) = envelope.recipients.iter().position(|r| *r == recipient) {
                results[index] = Some(RelayError::from_reply(reply));
            }
        }

        if had_errors {
            self.command(client.rset()).await?;
            Ok(Ok(RelayOutcome::PerRecipient(results)))
        } else {
            Ok(Ok(RelayOutcome::Delivered))
        }
    }

    async fn command<T>(
        &self,
        fut: impl std::future::Future<Output = mailway_smtp::SmtpResult<T>>,
    ) -> Result<T, SmtpError> {
        with_timeout(self.options.command_timeout, fut).await
    }

    async fn data_command<T>(
        &self,
        fut: impl std::future::Future<Output = mailway_smtp::SmtpResult<T>>,
    ) -> Result<T, SmtpError> {
        with_timeout(self.options.data_timeout, fut).await
    }
}
