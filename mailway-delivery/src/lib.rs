//! The delivery side of the pipeline: the queue scheduler that owns
//! retry/backoff/bounce handling, the relay capability and its pooled
//! SMTP/LMTP implementations, MX routing, and the policy hooks that run
//! before queuing and before each relay attempt.

pub mod backoff;
pub mod bounce;
pub mod deque;
pub mod dns;
pub mod error;
pub mod policy;
mod pool;
pub mod queue;
pub mod relay;
pub mod smtp;

pub use backoff::Backoff;
pub use bounce::{Bounce, BounceFactory};
pub use deque::BlockingDeque;
pub use dns::{DnsError, MxResolver};
pub use error::{RelayError, RelayErrorKind};
pub use policy::{QueuePolicy, RelayPolicy};
pub use queue::{Queue, QueueBuilder};
pub use relay::{Relay, RelayOutcome, RelayResult};
pub use smtp::{MxSmtpRelay, RelayProtocol, SmtpClientOptions, StaticSmtpRelay};
