//! The relaying capability: given an envelope, attempt delivery to a
//! next hop and report the outcome, whole-message or per-recipient.

use async_trait::async_trait;
use mailway_common::Envelope;

use crate::error::RelayError;

/// The result of one delivery attempt.
#[derive(Debug)]
pub enum RelayOutcome {
    /// Every recipient was delivered.
    Delivered,
    /// One entry per envelope recipient, in order; `None` means that
    /// recipient was delivered.
    PerRecipient(Vec<Option<RelayError>>),
}

pub type RelayResult = Result<RelayOutcome, RelayError>;

/// Implemented by anything that can move an envelope toward its next
/// hop: a pooled SMTP client, an MX-routed relay, a local delivery
/// agent.
#[async_trait]
pub trait Relay: Send + Sync {
    /// Attempt delivery. `attempts` counts prior tries for this message
    /// and may steer host selection.
    async fn attempt(&self, envelope: Envelope, attempts: u32) -> RelayResult;

    /// Tear down pooled connections and workers.
    async fn kill(&self) {}
}
