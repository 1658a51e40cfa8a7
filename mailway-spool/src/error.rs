use thiserror::Error;

/// Failures from a queue storage backend.
#[derive(Debug, Error)]
pub enum SpoolError {
    /// No message exists under the given id.
    #[error("Message {0} not found in queue storage")]
    NotFound(String),

    /// The backend itself failed (I/O, serialization, connectivity).
    #[error("Queue storage failure: {0}")]
    Backend(String),

    /// The backend does not implement this optional operation.
    #[error("Operation not supported by this storage backend: {0}")]
    Unsupported(&'static str),
}

pub type SpoolResult<T> = std::result::Result<T, SpoolError>;
