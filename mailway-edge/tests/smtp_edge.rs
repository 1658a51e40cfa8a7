//! End-to-end edge test: a real listener on an ephemeral port, a
//! client session delivering a message, and the queue observing exactly
//! one envelope with the right metadata.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use mailway_common::{Envelope, Signal};
use mailway_delivery::{Queue, Relay, RelayError, RelayOutcome, RelayResult};
use mailway_edge::{EdgeValidators, SmtpEdge};
use mailway_smtp::{Client, Reply, ServerOptions};
use mailway_spool::MemoryStorage;
use tokio::{net::TcpListener, sync::mpsc};

struct ScriptedRelay {
    outcomes: Mutex<VecDeque<RelayResult>>,
    seen: Mutex<Vec<Envelope>>,
    signal: mpsc::UnboundedSender<()>,
}

impl ScriptedRelay {
    fn new(outcomes: Vec<RelayResult>) -> (Arc<Self>, mpsc::UnboundedReceiver<()>) {
        let (signal, attempts) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                seen: Mutex::new(Vec::new()),
                signal,
            }),
            attempts,
        )
    }

    fn seen(&self) -> Vec<Envelope> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Relay for ScriptedRelay {
    async fn attempt(&self, envelope: Envelope, _attempts: u32) -> RelayResult {
        self.seen.lock().unwrap().push(envelope);
        let outcome = self
            .outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(RelayOutcome::Delivered));
        let _ = self.signal.send(());
        outcome
    }
}

async fn start_edge(
    relay_outcomes: Vec<RelayResult>,
    options: ServerOptions,
) -> (
    std::net::SocketAddr,
    Arc<ScriptedRelay>,
    mpsc::UnboundedReceiver<()>,
    tokio::sync::broadcast::Sender<Signal>,
) {
    let store = Arc::new(MemoryStorage::new());
    let (relay, attempts) = ScriptedRelay::new(relay_outcomes);
    let queue = Queue::builder(store, relay.clone()).build();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();

    let edge = Arc::new(
        SmtpEdge::new(address, queue)
            .with_options(options)
            .with_hostname("edge.test"),
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    tokio::spawn(edge.serve_listener(listener, shutdown_rx));

    (address, relay, attempts, shutdown_tx)
}

#[tokio::test]
async fn message_flows_from_edge_to_relay() {
    let (address, relay, mut attempts, shutdown) =
        start_edge(vec![Ok(RelayOutcome::Delivered)], ServerOptions::default()).await;

    let stream = tokio::net::TcpStream::connect(address).await.unwrap();
    let mut client = Client::new(stream);

    assert_eq!(client.get_banner().await.unwrap().code(), Some("220"));
    assert_eq!(
        client.ehlo("client.example.com").await.unwrap().code(),
        Some("250")
    );

    let mail = client.mailfrom("sender@example.com", None).await.unwrap();
    let rcpt = client.rcptto("rcpt@example.com").await.unwrap();
    let data = client.data_queued().await.unwrap();
    client.flush_pipeline().await.unwrap();
    assert_eq!(client.reply(mail).code(), Some("250"));
    assert_eq!(client.reply(rcpt).code(), Some("250"));
    assert_eq!(client.reply(data).code(), Some("354"));

    let sent = client
        .send_data(b"Subject: over the wire\r\n\r\n", b"hello edge\r\n")
        .await
        .unwrap();
    client.flush_pipeline().await.unwrap();
    assert_eq!(client.reply(sent).code(), Some("250"));
    assert_eq!(
        client.reply(sent).message().as_deref(),
        Some("2.6.0 Message Accepted for Delivery")
    );

    assert_eq!(client.quit().await.unwrap().code(), Some("221"));

    tokio::time::timeout(Duration::from_secs(5), attempts.recv())
        .await
        .unwrap()
        .unwrap();

    let seen = relay.seen();
    assert_eq!(seen.len(), 1);
    let envelope = &seen[0];
    assert_eq!(envelope.sender, "sender@example.com");
    assert_eq!(envelope.recipients, vec!["rcpt@example.com".to_string()]);
    assert_eq!(
        envelope.headers.get_first("Subject"),
        Some("over the wire")
    );
    assert_eq!(envelope.message, b"hello edge\r\n");
    assert_eq!(envelope.receiver.as_deref(), Some("edge.test"));
    assert_eq!(
        envelope.client.name.as_deref(),
        Some("client.example.com")
    );
    assert_eq!(envelope.client.protocol.as_deref(), Some("ESMTP"));
    assert!(envelope.client.ip.as_deref().unwrap().starts_with("127."));
    assert!(envelope.timestamp.is_some());

    let _ = shutdown.send(Signal::Shutdown);
}

#[tokio::test]
async fn validators_can_reject_recipients() {
    struct RejectUnknown;

    #[async_trait]
    impl EdgeValidators for RejectUnknown {
        async fn validate_rcpt(&self, reply: &mut Reply, recipient: &str) {
            if !recipient.ends_with("@accepted.test") {
                reply.set_code(Some("550")).unwrap();
                reply.set_message(Some("5.7.1 Relaying denied"));
            }
        }
    }

    let store = Arc::new(MemoryStorage::new());
    let (relay, _attempts) = ScriptedRelay::new(vec![]);
    let queue = Queue::builder(store, relay.clone()).build();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    let edge = Arc::new(
        SmtpEdge::new(address, queue).with_validators(Arc::new(RejectUnknown)),
    );
    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    tokio::spawn(edge.serve_listener(listener, shutdown_rx));

    let stream = tokio::net::TcpStream::connect(address).await.unwrap();
    let mut client = Client::new(stream);
    client.get_banner().await.unwrap();
    client.ehlo("client.example.com").await.unwrap();

    let mail = client.mailfrom("sender@example.com", None).await.unwrap();
    let denied = client.rcptto("nope@elsewhere.test").await.unwrap();
    let allowed = client.rcptto("ok@accepted.test").await.unwrap();
    client.flush_pipeline().await.unwrap();

    assert_eq!(client.reply(mail).code(), Some("250"));
    assert_eq!(client.reply(denied).code(), Some("550"));
    assert_eq!(client.reply(allowed).code(), Some("250"));

    client.quit().await.unwrap();
    let _ = shutdown_tx.send(Signal::Shutdown);
}

#[tokio::test]
async fn queue_errors_surface_as_550() {
    // A storage backend that always fails.
    #[derive(Debug)]
    struct BrokenStorage;

    #[async_trait]
    impl mailway_spool::QueueStorage for BrokenStorage {
        async fn write(
            &self,
            _envelope: &Envelope,
            _timestamp: std::time::SystemTime,
        ) -> mailway_spool::SpoolResult<String> {
            Err(mailway_spool::SpoolError::Backend("disk full".to_owned()))
        }

        async fn set_timestamp(
            &self,
            _id: &str,
            _timestamp: std::time::SystemTime,
        ) -> mailway_spool::SpoolResult<()> {
            unimplemented!()
        }

        async fn increment_attempts(&self, _id: &str) -> mailway_spool::SpoolResult<u32> {
            unimplemented!()
        }

        async fn set_recipients_delivered(
            &self,
            _id: &str,
            _indexes: &[usize],
        ) -> mailway_spool::SpoolResult<()> {
            unimplemented!()
        }

        async fn load(&self) -> mailway_spool::SpoolResult<Vec<(std::time::SystemTime, String)>> {
            Ok(Vec::new())
        }

        async fn get(&self, id: &str) -> mailway_spool::SpoolResult<(Envelope, u32)> {
            Err(mailway_spool::SpoolError::NotFound(id.to_owned()))
        }

        async fn remove(&self, _id: &str) -> mailway_spool::SpoolResult<()> {
            Ok(())
        }
    }

    let (relay, _attempts) = ScriptedRelay::new(vec![]);
    let queue = Queue::builder(Arc::new(BrokenStorage), relay.clone()).build();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    let edge = Arc::new(SmtpEdge::new(address, queue));
    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    tokio::spawn(edge.serve_listener(listener, shutdown_rx));

    let stream = tokio::net::TcpStream::connect(address).await.unwrap();
    let mut client = Client::new(stream);
    client.get_banner().await.unwrap();
    client.ehlo("client.example.com").await.unwrap();

    let mail = client.mailfrom("sender@example.com", None).await.unwrap();
    let rcpt = client.rcptto("rcpt@example.com").await.unwrap();
    let data = client.data_queued().await.unwrap();
    client.flush_pipeline().await.unwrap();
    assert_eq!(client.reply(mail).code(), Some("250"));
    assert_eq!(client.reply(rcpt).code(), Some("250"));
    assert_eq!(client.reply(data).code(), Some("354"));

    let sent = client.send_data(b"", b"body\r\n").await.unwrap();
    client.flush_pipeline().await.unwrap();
    assert_eq!(client.reply(sent).code(), Some("550"));
    assert_eq!(
        client.reply(sent).message().as_deref(),
        Some("5.6.0 Error queuing message")
    );

    // Nothing reached the relay.
    assert!(relay.seen().is_empty());

    client.quit().await.unwrap();
    let _ = shutdown_tx.send(Signal::Shutdown);
}
