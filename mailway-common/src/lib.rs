pub mod envelope;
pub mod error;
pub mod logging;

pub use envelope::{BinaryEncoder, ClientInfo, Envelope, Header, Headers};
pub use error::EnvelopeError;
pub use tracing;

/// Control message broadcast to long-running tasks (listeners, queue
/// schedulers, relay workers) when the process is winding down.
#[derive(Debug, Clone, Copy)]
pub enum Signal {
    Shutdown,
    Finalised,
}
