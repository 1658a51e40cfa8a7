//! The storage contract the queue scheduler relies on.

use std::time::SystemTime;

use async_trait::async_trait;
use mailway_common::Envelope;

use crate::error::{SpoolError, SpoolResult};

/// Durable envelope and metadata operations backing a queue.
///
/// Backends store, per message id: the envelope, the timestamp of the
/// next delivery attempt, the number of attempts made, and which
/// recipients have already been delivered. Id generation is the
/// backend's responsibility; a `write` must never overwrite an existing
/// id (retry internally with a fresh one instead).
#[async_trait]
pub trait QueueStorage: Send + Sync + std::fmt::Debug {
    /// Write the envelope with the timestamp of its next delivery
    /// attempt, starting the attempt count at zero. Returns the unique
    /// id assigned to the message.
    async fn write(&self, envelope: &Envelope, timestamp: SystemTime) -> SpoolResult<String>;

    /// Set a new next-delivery-attempt timestamp.
    async fn set_timestamp(&self, id: &str, timestamp: SystemTime) -> SpoolResult<()>;

    /// Increment the message's attempt counter, returning the new count.
    async fn increment_attempts(&self, id: &str) -> SpoolResult<u32>;

    /// Record that the recipients at the given indexes (into the
    /// envelope's current recipient list) were delivered. Subsequent
    /// `get` calls return the envelope without them.
    async fn set_recipients_delivered(&self, id: &str, indexes: &[usize]) -> SpoolResult<()>;

    /// Every queued message as `(timestamp, id)`, for scheduler startup.
    async fn load(&self) -> SpoolResult<Vec<(SystemTime, String)>>;

    /// The envelope and attempt count for a message. Recipients already
    /// delivered are absent from the returned envelope.
    async fn get(&self, id: &str) -> SpoolResult<(Envelope, u32)>;

    /// Remove a message, typically after terminal success or failure.
    async fn remove(&self, id: &str) -> SpoolResult<()>;

    /// Block until new `(timestamp, id)` events arrive, for backends
    /// with a native event feed. Optional.
    async fn wait(&self) -> SpoolResult<Vec<(SystemTime, String)>> {
        Err(SpoolError::Unsupported("wait"))
    }
}
