//! A pooled relay to one fixed `host:port`. Connections are recycled
//! between deliveries where the idle timeout allows, and at most
//! `pool_size` are open at once.

use std::sync::Arc;

use async_trait::async_trait;
use mailway_common::Envelope;
use tokio::sync::oneshot;

use crate::{
    deque::BlockingDeque,
    error::RelayError,
    policy::RelayPolicy,
    pool::{DeliveryRequest, WorkerPool},
    relay::{Relay, RelayResult},
    smtp::{SmtpClientOptions, client::SmtpRelayClient, lmtp::LmtpRelayClient},
};

/// Which wire protocol the pooled workers speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayProtocol {
    Smtp,
    Lmtp,
}

pub struct StaticSmtpRelay {
    host: String,
    port: u16,
    protocol: RelayProtocol,
    options: SmtpClientOptions,
    pool: WorkerPool,
    queue: Arc<BlockingDeque<DeliveryRequest>>,
    policies: Vec<Box<dyn RelayPolicy>>,
}

impl StaticSmtpRelay {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        pool_size: Option<usize>,
        options: SmtpClientOptions,
    ) -> Self {
        Self::with_protocol(host, port, pool_size, options, RelayProtocol::Smtp)
    }

    /// A pool speaking LMTP to the destination, with per-recipient
    /// delivery results.
    pub fn lmtp(
        host: impl Into<String>,
        port: u16,
        pool_size: Option<usize>,
        options: SmtpClientOptions,
    ) -> Self {
        Self::with_protocol(host, port, pool_size, options, RelayProtocol::Lmtp)
    }

    pub fn with_protocol(
        host: impl Into<String>,
        port: u16,
        pool_size: Option<usize>,
        options: SmtpClientOptions,
        protocol: RelayProtocol,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            protocol,
            options,
            pool: WorkerPool::new(pool_size),
            queue: Arc::new(BlockingDeque::new()),
            policies: Vec::new(),
        }
    }

    /// Add a policy executed against each envelope before every
    /// delivery attempt. Changes are not persisted.
    pub fn add_policy(&mut self, policy: Box<dyn RelayPolicy>) {
        self.policies.push(policy);
    }

    /// Number of live workers, for diagnostics.
    pub fn worker_count(&self) -> usize {
        self.pool.worker_count()
    }

    fn spawn_worker_if_needed(&self) {
        self.pool.check_idle(|state| {
            let queue = Arc::clone(&self.queue);
            let options = self.options.clone();
            let host = self.host.clone();
            let port = self.port;
            match self.protocol {
                RelayProtocol::Smtp => {
                    tokio::spawn(SmtpRelayClient::new(host, port, queue, state, options).run())
                }
                RelayProtocol::Lmtp => {
                    tokio::spawn(LmtpRelayClient::new(host, port, queue, state, options).run())
                }
            }
        });
    }
}

#[async_trait]
impl Relay for StaticSmtpRelay {
    async fn attempt(&self, mut envelope: Envelope, _attempts: u32) -> RelayResult {
        for policy in &self.policies {
            policy.apply(&mut envelope);
        }

        self.spawn_worker_if_needed();

        let (tx, rx) = oneshot::channel();
        self.queue.push_back(DeliveryRequest {
            result: tx,
            envelope,
        });

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(RelayError::transient(
                "Relay worker terminated unexpectedly",
            )),
        }
    }

    async fn kill(&self) {
        self.pool.kill();
    }
}
