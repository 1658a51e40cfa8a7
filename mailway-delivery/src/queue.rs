//! The queue scheduler.
//!
//! A message accepted at an edge must be durably stored before the
//! client is told it was accepted, then retried toward its next hop on a
//! schedule. The queue runs pre-storage policies, writes each resulting
//! envelope through a bounded store pool, fires an immediate first
//! delivery attempt, and afterwards owns the retry/backoff/bounce
//! lifecycle for every message it holds.

use std::{
    sync::{Arc, Weak},
    time::{Duration, SystemTime},
};

use futures_util::future::{BoxFuture, join_all};
use mailway_common::{Envelope, Signal, internal};
use mailway_smtp::Reply;
use mailway_spool::{QueueStorage, SpoolError};
use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore, broadcast};

use crate::{
    bounce::{Bounce, BounceFactory},
    backoff::Backoff,
    error::RelayError,
    policy::QueuePolicy,
    relay::{Relay, RelayOutcome},
};

async fn acquire(sem: &Semaphore) -> tokio::sync::SemaphorePermit<'_> {
    sem.acquire().await.expect("queue pool semaphore is never closed")
}

/// Builder for [`Queue`]. Policies and collaborators are fixed at build
/// time; the queue itself is shared behind an `Arc`.
pub struct QueueBuilder {
    store: Arc<dyn QueueStorage>,
    relay: Arc<dyn Relay>,
    backoff: Option<Backoff>,
    bounce_factory: BounceFactory,
    bounce_queue: Option<Arc<Queue>>,
    store_pool_size: usize,
    relay_pool_size: usize,
    policies: Vec<Box<dyn QueuePolicy>>,
}

impl QueueBuilder {
    /// Retry schedule for transient failures. Without one, messages are
    /// never retried: the first transient failure is promoted to a
    /// permanent one.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Factory for bounce envelopes; returning `None` suppresses the
    /// bounce.
    pub fn with_bounce_factory(mut self, factory: BounceFactory) -> Self {
        self.bounce_factory = factory;
        self
    }

    /// Queue bounces on a separate queue instead of this one. The handle
    /// is used for enqueueing only; this queue does not drive its
    /// lifecycle.
    pub fn with_bounce_queue(mut self, queue: Arc<Queue>) -> Self {
        self.bounce_queue = Some(queue);
        self
    }

    /// Bound on concurrent storage operations.
    pub fn with_store_pool_size(mut self, size: usize) -> Self {
        self.store_pool_size = size.max(1);
        self
    }

    /// Bound on concurrent relay attempts.
    pub fn with_relay_pool_size(mut self, size: usize) -> Self {
        self.relay_pool_size = size.max(1);
        self
    }

    /// Add a policy executed before messages are persisted.
    pub fn add_policy(mut self, policy: Box<dyn QueuePolicy>) -> Self {
        self.policies.push(policy);
        self
    }

    pub fn build(self) -> Arc<Queue> {
        Arc::new_cyclic(|me| Queue {
            store: self.store,
            relay: self.relay,
            backoff: self.backoff,
            bounce_factory: self.bounce_factory,
            bounce_queue: self.bounce_queue,
            queued: Mutex::new(Vec::new()),
            wake: Notify::new(),
            store_sem: Semaphore::new(self.store_pool_size),
            relay_sem: Semaphore::new(self.relay_pool_size),
            policies: self.policies,
            me: me.clone(),
        })
    }
}

/// Manages the envelopes waiting for delivery. This is not a FIFO: a
/// message's place depends entirely on the timestamp of its next
/// delivery attempt.
pub struct Queue {
    store: Arc<dyn QueueStorage>,
    relay: Arc<dyn Relay>,
    backoff: Option<Backoff>,
    bounce_factory: BounceFactory,
    bounce_queue: Option<Arc<Queue>>,
    /// `(due, id)` pairs in ascending due order. Only list mutations
    /// happen under this lock; storage and relay I/O never do.
    queued: Mutex<Vec<(SystemTime, String)>>,
    wake: Notify,
    store_sem: Semaphore,
    relay_sem: Semaphore,
    policies: Vec<Box<dyn QueuePolicy>>,
    me: Weak<Queue>,
}

impl Queue {
    pub fn builder(store: Arc<dyn QueueStorage>, relay: Arc<dyn Relay>) -> QueueBuilder {
        let default_pool = num_cpus::get().max(2) * 2;
        QueueBuilder {
            store,
            relay,
            backoff: None,
            bounce_factory: Bounce::factory(),
            bounce_queue: None,
            store_pool_size: default_pool,
            relay_pool_size: default_pool,
            policies: Vec::new(),
        }
    }

    /// How many entries are waiting on their retry timers.
    pub fn scheduled_len(&self) -> usize {
        self.queued.lock().len()
    }

    /// Run policies, persist each resulting envelope, and fire first
    /// delivery attempts for the successful writes. Returns one entry
    /// per produced envelope, pairing it with its storage id or the
    /// storage error.
    pub async fn enqueue(
        &self,
        envelope: Envelope,
    ) -> Vec<(Envelope, Result<String, SpoolError>)> {
        let now = SystemTime::now();
        let envelopes = self.run_policies(envelope);

        let writes = envelopes.iter().map(|env| async move {
            let _permit = acquire(&self.store_sem).await;
            self.store.write(env, now).await
        });
        let ids = join_all(writes).await;

        let results: Vec<(Envelope, Result<String, SpoolError>)> =
            envelopes.into_iter().zip(ids).collect();

        for (envelope, id) in &results {
            match id {
                Ok(id) => self.spawn_attempt(id.clone(), envelope.clone(), 0),
                Err(err) => {
                    internal!(level = ERROR, "Failed to queue message: {err}");
                }
            }
        }
        results
    }

    /// Expand the envelope through the policy chain. A policy returning
    /// replacements feeds them to the remaining policies in order.
    fn run_policies(&self, envelope: Envelope) -> Vec<Envelope> {
        fn expand(
            policies: &[Box<dyn QueuePolicy>],
            mut envelope: Envelope,
            index: usize,
        ) -> Vec<Envelope> {
            let Some(policy) = policies.get(index) else {
                return vec![envelope];
            };
            match policy.apply(&mut envelope) {
                Some(replacements) if !replacements.is_empty() => replacements
                    .into_iter()
                    .flat_map(|env| expand(policies, env, index + 1))
                    .collect(),
                _ => expand(policies, envelope, index + 1),
            }
        }

        expand(&self.policies, envelope, 0)
    }

    /// Run the scheduler: ingest persisted entries, then dispatch
    /// entries as their timers come due until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<Signal>) {
        internal!("Queue scheduler starting");
        self.load_all().await;

        loop {
            let (due, wait) = {
                let mut queued = self.queued.lock();
                let now = SystemTime::now();
                let split = queued
                    .iter()
                    .position(|(t, _)| *t > now)
                    .unwrap_or(queued.len());
                let due: Vec<(SystemTime, String)> = queued.drain(..split).collect();
                let wait = queued
                    .first()
                    .map(|(t, _)| t.duration_since(now).unwrap_or_default());
                (due, wait)
            };

            for (_, id) in due {
                self.spawn_dequeue(id);
            }

            tokio::select! {
                _ = self.wake.notified() => {}
                () = sleep_or_forever(wait) => {}
                sig = shutdown.recv() => {
                    match sig {
                        Ok(_) | Err(broadcast::error::RecvError::Closed) => {
                            internal!("Queue scheduler shutting down");
                            break;
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                    }
                }
            }
        }
    }

    /// Tear down relay workers. In-flight storage writes complete on
    /// their own tasks.
    pub async fn kill(&self) {
        self.relay.kill().await;
    }

    /// Dispatch every waiting entry immediately, ignoring retry timers.
    /// This can be very expensive on a large queue.
    pub fn flush(&self) {
        let entries: Vec<(SystemTime, String)> = self.queued.lock().drain(..).collect();
        for (_, id) in entries {
            self.spawn_dequeue(id);
        }
    }

    async fn load_all(&self) {
        let entries = {
            let _permit = acquire(&self.store_sem).await;
            self.store.load().await
        };
        match entries {
            Ok(entries) => {
                let count = entries.len();
                for (due, id) in entries {
                    self.add_queued(due, id);
                }
                if count > 0 {
                    internal!("Loaded {count} queued messages from storage");
                }
            }
            Err(err) => {
                internal!(level = ERROR, "Failed to load queued messages: {err}");
            }
        }
    }

    fn add_queued(&self, due: SystemTime, id: String) {
        {
            let mut queued = self.queued.lock();
            let pos = queued
                .iter()
                .position(|(t, _)| *t > due)
                .unwrap_or(queued.len());
            queued.insert(pos, (due, id));
        }
        self.wake.notify_one();
    }

    fn spawn_attempt(&self, id: String, envelope: Envelope, attempts: u32) {
        let Some(queue) = self.me.upgrade() else {
            return;
        };
        let fut: BoxFuture<'static, ()> = Box::pin(async move {
            let _permit = acquire(&queue.relay_sem).await;
            queue.attempt(&id, envelope, attempts).await;
        });
        tokio::spawn(fut);
    }

    fn spawn_dequeue(&self, id: String) {
        let Some(queue) = self.me.upgrade() else {
            return;
        };
        let fut: BoxFuture<'static, ()> = Box::pin(async move {
            let loaded = {
                let _permit = acquire(&queue.store_sem).await;
                queue.store.get(&id).await
            };
            match loaded {
                Ok((envelope, attempts)) => {
                    let _permit = acquire(&queue.relay_sem).await;
                    queue.attempt(&id, envelope, attempts).await;
                }
                Err(SpoolError::NotFound(_)) => {
                    internal!(level = WARN, "Queued message {id} vanished from storage");
                }
                Err(err) => {
                    internal!(level = ERROR, "Failed to load queued message {id}: {err}");
                    queue.add_queued(SystemTime::now() + Duration::from_secs(60), id.clone());
                }
            }
        });
        tokio::spawn(fut);
    }

    async fn attempt(&self, id: &str, envelope: Envelope, attempts: u32) {
        match self.relay.attempt(envelope.clone(), attempts).await {
            Ok(RelayOutcome::Delivered) => {
                internal!("Message {id} delivered");
                self.store_remove(id).await;
            }
            Ok(RelayOutcome::PerRecipient(results)) => {
                self.handle_partial(id, envelope, results).await;
            }
            Err(err) if err.is_transient() => {
                internal!("Message {id} deferred: {err}");
                self.retry_later(id, envelope, err.reply).await;
            }
            Err(err) => {
                internal!("Message {id} failed permanently: {err}");
                self.perm_fail(id, &envelope, err.reply).await;
            }
        }
    }

    /// Per-recipient results: record deliveries, reschedule when any
    /// recipient failed transiently, bounce when the rest failed
    /// permanently.
    async fn handle_partial(
        &self,
        id: &str,
        envelope: Envelope,
        results: Vec<Option<RelayError>>,
    ) {
        let mut delivered = Vec::new();
        let mut transient: Option<Reply> = None;
        let mut permanent: Vec<(usize, RelayError)> = Vec::new();

        for (index, entry) in results.iter().enumerate() {
            match entry {
                None => delivered.push(index),
                Some(err) if err.is_transient() => {
                    if transient.is_none() {
                        transient = Some(err.reply.clone());
                    }
                }
                Some(err) => permanent.push((index, err.clone())),
            }
        }

        if !delivered.is_empty() {
            let _permit = acquire(&self.store_sem).await;
            if let Err(err) = self.store.set_recipients_delivered(id, &delivered).await {
                internal!(level = ERROR, "Failed to record deliveries for {id}: {err}");
            }
        }

        if let Some(reply) = transient {
            self.retry_later(id, envelope, reply).await;
        } else if let Some((_, first)) = permanent.first() {
            let failed_rcpts: Vec<String> = permanent
                .iter()
                .filter_map(|(index, _)| envelope.recipients.get(*index).cloned())
                .collect();
            let reply = first.reply.clone();
            let failed_env = envelope.copy(failed_rcpts);
            self.perm_fail(id, &failed_env, reply).await;
        } else {
            internal!("Message {id} delivered");
            self.store_remove(id).await;
        }
    }

    async fn retry_later(&self, id: &str, envelope: Envelope, mut reply: Reply) {
        let attempts = {
            let _permit = acquire(&self.store_sem).await;
            match self.store.increment_attempts(id).await {
                Ok(attempts) => attempts,
                Err(err) => {
                    internal!(level = ERROR, "Failed to update attempts for {id}: {err}");
                    return;
                }
            }
        };

        match self.backoff.as_ref().and_then(|b| b(&envelope, attempts)) {
            None => {
                reply.append_message(" (Too many retries)");
                self.perm_fail(id, &envelope, reply).await;
            }
            Some(wait) => {
                let due = SystemTime::now() + wait;
                {
                    let _permit = acquire(&self.store_sem).await;
                    if let Err(err) = self.store.set_timestamp(id, due).await {
                        internal!(level = ERROR, "Failed to reschedule {id}: {err}");
                    }
                }
                self.add_queued(due, id.to_owned());
            }
        }
    }

    async fn perm_fail(&self, id: &str, envelope: &Envelope, reply: Reply) {
        self.store_remove(id).await;

        if envelope.sender.is_empty() {
            // A bounce cannot itself be bounced to the null sender.
            return;
        }
        match (self.bounce_factory)(envelope, &reply) {
            Some(bounce) => self.dispatch_bounce(bounce).await,
            None => {}
        }
    }

    /// Enqueue a bounce on the configured bounce queue, or on this queue
    /// when none is configured. Boxed to break the async type cycle
    /// between `enqueue` and the failure path.
    fn dispatch_bounce(&self, bounce: Envelope) -> BoxFuture<'static, ()> {
        let target = self
            .bounce_queue
            .clone()
            .or_else(|| self.me.upgrade());
        Box::pin(async move {
            let Some(target) = target else {
                return;
            };
            let results = target.enqueue(bounce).await;
            if let Some((_, Err(err))) = results.first() {
                internal!(
                    level = WARN,
                    "Bounce message could not be queued and was dropped: {err}"
                );
            }
        })
    }

    async fn store_remove(&self, id: &str) {
        let _permit = acquire(&self.store_sem).await;
        if let Err(err) = self.store.remove(id).await {
            internal!(level = ERROR, "Failed to remove {id} from storage: {err}");
        }
    }
}

async fn sleep_or_forever(wait: Option<Duration>) {
    match wait {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}
