//! Queue scheduler behavior against a scripted relay and the in-memory
//! storage backend: success, retry/backoff accounting, partial
//! per-recipient delivery, and bounce generation.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use mailway_common::{Envelope, Signal};
use mailway_delivery::{
    Queue, Relay, RelayError, RelayOutcome, RelayResult,
    policy::RecipientSplit,
};
use mailway_spool::{MemoryStorage, QueueStorage};
use tokio::sync::mpsc;

/// A relay that plays back scripted outcomes and records the envelopes
/// it saw, signalling each attempt on a channel so tests can wait
/// without sleeping.
struct ScriptedRelay {
    outcomes: Mutex<VecDeque<RelayResult>>,
    seen: Mutex<Vec<(Envelope, u32)>>,
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

    fn seen(&self) -> Vec<(Envelope, u32)> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Relay for ScriptedRelay {
    async fn attempt(&self, envelope: Envelope, attempts: u32) -> RelayResult {
        self.seen.lock().unwrap().push((envelope, attempts));
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

fn envelope(sender: &str, recipients: &[&str]) -> Envelope {
    let mut env = Envelope::new(sender);
    env.recipients = recipients.iter().map(|r| (*r).to_owned()).collect();
    env.parse(b"Subject: test\r\n\r\ntest body\r\n").unwrap();
    env
}

async fn next_attempt(attempts: &mut mpsc::UnboundedReceiver<()>) {
    tokio::time::timeout(Duration::from_secs(5), attempts.recv())
        .await
        .expect("timed out waiting for a relay attempt")
        .expect("relay signal channel closed");
}

/// Give the attempt task a moment to finish its storage work after the
/// relay outcome was produced.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn successful_delivery_removes_storage() {
    let store = Arc::new(MemoryStorage::new());
    let (relay, mut attempts) = ScriptedRelay::new(vec![Ok(RelayOutcome::Delivered)]);
    let queue = Queue::builder(store.clone(), relay.clone()).build();

    let results = queue
        .enqueue(envelope("sender@example.com", &["rcpt@example.com"]))
        .await;
    assert_eq!(results.len(), 1);
    assert!(results[0].1.is_ok());

    next_attempt(&mut attempts).await;
    settle().await;

    assert!(store.is_empty());
    let seen = relay.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0.sender, "sender@example.com");
    assert_eq!(seen[0].1, 0);
}

#[tokio::test]
async fn transient_failure_reschedules_with_backoff() {
    let store = Arc::new(MemoryStorage::new());
    let (relay, mut attempts) =
        ScriptedRelay::new(vec![Err(RelayError::transient("4.2.0 Try later"))]);
    let queue = Queue::builder(store.clone(), relay.clone())
        .with_backoff(Arc::new(|_env, _attempts| {
            Some(Duration::from_secs(3600))
        }))
        .build();

    let results = queue
        .enqueue(envelope("sender@example.com", &["rcpt@example.com"]))
        .await;
    let id = results[0].1.as_ref().unwrap().clone();

    next_attempt(&mut attempts).await;
    settle().await;

    // Not removed, one attempt recorded, rescheduled in memory.
    let (_, attempts_count) = store.get(&id).await.unwrap();
    assert_eq!(attempts_count, 1);
    assert_eq!(queue.scheduled_len(), 1);
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn transient_without_backoff_promotes_to_bounce() {
    let store = Arc::new(MemoryStorage::new());
    // First attempt: the original message fails transiently. Second
    // attempt: the bounce delivers.
    let (relay, mut attempts) = ScriptedRelay::new(vec![
        Err(RelayError::transient("4.2.0 Try later")),
        Ok(RelayOutcome::Delivered),
    ]);
    let queue = Queue::builder(store.clone(), relay.clone()).build();

    queue
        .enqueue(envelope("sender@example.com", &["rcpt@example.com"]))
        .await;

    next_attempt(&mut attempts).await; // original
    next_attempt(&mut attempts).await; // bounce
    settle().await;

    let seen = relay.seen();
    assert_eq!(seen.len(), 2);

    let bounce = &seen[1].0;
    assert_eq!(bounce.sender, "");
    assert_eq!(bounce.recipients, vec!["sender@example.com".to_string()]);
    let body = String::from_utf8_lossy(&bounce.message);
    assert!(body.contains("(Too many retries)"));

    // Original and bounce both removed after delivery.
    assert!(store.is_empty());
}

#[tokio::test]
async fn permanent_failure_bounces_with_reply() {
    let store = Arc::new(MemoryStorage::new());
    let (relay, mut attempts) = ScriptedRelay::new(vec![
        Err(RelayError::permanent("5.1.1 No such user")),
        Ok(RelayOutcome::Delivered),
    ]);
    let queue = Queue::builder(store.clone(), relay.clone()).build();

    queue
        .enqueue(envelope("sender@example.com", &["rcpt@example.com"]))
        .await;

    next_attempt(&mut attempts).await;
    next_attempt(&mut attempts).await;
    settle().await;

    let seen = relay.seen();
    let bounce = &seen[1].0;
    let body = String::from_utf8_lossy(&bounce.message);
    assert!(body.contains("550 5.0.0 5.1.1 No such user"));
    assert!(store.is_empty());
}

#[tokio::test]
async fn null_sender_failures_never_bounce() {
    let store = Arc::new(MemoryStorage::new());
    let (relay, mut attempts) =
        ScriptedRelay::new(vec![Err(RelayError::permanent("5.0.0 Rejected"))]);
    let queue = Queue::builder(store.clone(), relay.clone()).build();

    queue.enqueue(envelope("", &["rcpt@example.com"])).await;

    next_attempt(&mut attempts).await;
    settle().await;

    // No second attempt: nothing was bounced.
    assert_eq!(relay.seen().len(), 1);
    assert!(store.is_empty());
}

#[tokio::test]
async fn partial_recipient_results_are_accounted() {
    let store = Arc::new(MemoryStorage::new());
    // Recipient 0 and 2 delivered; recipient 1 failed permanently. The
    // follow-up attempt is the bounce for the failed recipient.
    let (relay, mut attempts) = ScriptedRelay::new(vec![
        Ok(RelayOutcome::PerRecipient(vec![
            None,
            Some(RelayError::permanent("5.1.1 No such user")),
            None,
        ])),
        Ok(RelayOutcome::Delivered),
    ]);
    let queue = Queue::builder(store.clone(), relay.clone()).build();

    queue
        .enqueue(envelope(
            "sender@example.com",
            &["a@example.com", "b@example.com", "c@example.com"],
        ))
        .await;

    next_attempt(&mut attempts).await;
    next_attempt(&mut attempts).await;
    settle().await;

    let seen = relay.seen();
    assert_eq!(seen.len(), 2);

    // The bounce targets the original sender and reports the failed
    // recipient's reply.
    let bounce = &seen[1].0;
    assert_eq!(bounce.sender, "");
    assert_eq!(bounce.recipients, vec!["sender@example.com".to_string()]);

    // All recipients resolved: storage is empty again.
    assert!(store.is_empty());
}

#[tokio::test]
async fn partial_transient_results_reschedule() {
    let store = Arc::new(MemoryStorage::new());
    let (relay, mut attempts) = ScriptedRelay::new(vec![Ok(RelayOutcome::PerRecipient(vec![
        None,
        Some(RelayError::transient("4.2.1 Mailbox busy")),
    ]))]);
    let queue = Queue::builder(store.clone(), relay.clone())
        .with_backoff(Arc::new(|_env, _attempts| {
            Some(Duration::from_secs(3600))
        }))
        .build();

    let results = queue
        .enqueue(envelope(
            "sender@example.com",
            &["done@example.com", "busy@example.com"],
        ))
        .await;
    let id = results[0].1.as_ref().unwrap().clone();

    next_attempt(&mut attempts).await;
    settle().await;

    // The delivered recipient is gone from storage; the transient one
    // remains, rescheduled.
    let (env, attempts_count) = store.get(&id).await.unwrap();
    assert_eq!(env.recipients, vec!["busy@example.com".to_string()]);
    assert_eq!(attempts_count, 1);
    assert_eq!(queue.scheduled_len(), 1);
}

#[tokio::test]
async fn policies_expand_before_storage() {
    let store = Arc::new(MemoryStorage::new());
    let (relay, mut attempts) = ScriptedRelay::new(vec![
        Ok(RelayOutcome::Delivered),
        Ok(RelayOutcome::Delivered),
    ]);
    let queue = Queue::builder(store.clone(), relay.clone())
        .add_policy(Box::new(RecipientSplit))
        .build();

    let results = queue
        .enqueue(envelope(
            "sender@example.com",
            &["a@example.com", "b@example.com"],
        ))
        .await;

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].0.recipients, vec!["a@example.com".to_string()]);
    assert_eq!(results[1].0.recipients, vec!["b@example.com".to_string()]);
    assert!(results.iter().all(|(_, id)| id.is_ok()));

    next_attempt(&mut attempts).await;
    next_attempt(&mut attempts).await;
    settle().await;
    assert!(store.is_empty());
}

#[tokio::test]
async fn scheduler_retries_after_backoff() {
    let store = Arc::new(MemoryStorage::new());
    let (relay, mut attempts) = ScriptedRelay::new(vec![
        Err(RelayError::transient("4.2.0 Try later")),
        Ok(RelayOutcome::Delivered),
    ]);
    let queue = Queue::builder(store.clone(), relay.clone())
        .with_backoff(Arc::new(|_env, _attempts| {
            Some(Duration::from_millis(50))
        }))
        .build();

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    let scheduler = tokio::spawn(queue.clone().run(shutdown_rx));

    queue
        .enqueue(envelope("sender@example.com", &["rcpt@example.com"]))
        .await;

    next_attempt(&mut attempts).await; // initial, fails transiently
    next_attempt(&mut attempts).await; // retried by the scheduler
    settle().await;

    assert!(store.is_empty());
    let seen = relay.seen();
    assert_eq!(seen.len(), 2);
    // The retry carries the incremented attempt count.
    assert_eq!(seen[1].1, 1);

    shutdown_tx.send(Signal::Shutdown).unwrap();
    scheduler.await.unwrap();
}

#[tokio::test]
async fn scheduler_ingests_preexisting_storage() {
    let store = Arc::new(MemoryStorage::new());

    // A message persisted before the queue started, due in the past.
    let env = envelope("sender@example.com", &["rcpt@example.com"]);
    store
        .write(&env, std::time::SystemTime::now() - Duration::from_secs(60))
        .await
        .unwrap();

    let (relay, mut attempts) = ScriptedRelay::new(vec![Ok(RelayOutcome::Delivered)]);
    let queue = Queue::builder(store.clone(), relay.clone()).build();

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    let scheduler = tokio::spawn(queue.clone().run(shutdown_rx));

    next_attempt(&mut attempts).await;
    settle().await;
    assert!(store.is_empty());

    shutdown_tx.send(Signal::Shutdown).unwrap();
    scheduler.await.unwrap();
}

#[tokio::test]
async fn flush_dispatches_waiting_entries() {
    let store = Arc::new(MemoryStorage::new());
    let (relay, mut attempts) = ScriptedRelay::new(vec![
        Err(RelayError::transient("4.2.0 Try later")),
        Ok(RelayOutcome::Delivered),
    ]);
    let queue = Queue::builder(store.clone(), relay.clone())
        .with_backoff(Arc::new(|_env, _attempts| {
            // Far enough out that only flush() can trigger the retry.
            Some(Duration::from_secs(3600))
        }))
        .build();

    queue
        .enqueue(envelope("sender@example.com", &["rcpt@example.com"]))
        .await;
    next_attempt(&mut attempts).await;
    settle().await;
    assert_eq!(queue.scheduled_len(), 1);

    queue.flush();
    next_attempt(&mut attempts).await;
    settle().await;

    assert_eq!(queue.scheduled_len(), 0);
    assert!(store.is_empty());
}
