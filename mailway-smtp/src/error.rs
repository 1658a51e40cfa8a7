//! Error types for SMTP sessions, both server- and client-side.

use std::io;

use thiserror::Error;

/// Errors raised by the SMTP engine.
#[derive(Debug, Error)]
pub enum SmtpError {
    /// The peer closed or reset the connection mid-operation.
    #[error("Connection lost unexpectedly")]
    ConnectionLost,

    /// A reply from the peer did not follow the SMTP reply grammar, mixed
    /// codes across continuation lines, or contained invalid UTF-8.
    #[error("Malformed SMTP reply: {0}")]
    BadReply(String),

    /// Message data exceeded the advertised SIZE limit.
    #[error("Message data exceeded the allowed size")]
    TooBig,

    /// The session timed out waiting for the peer.
    #[error("Timed out after {0} seconds")]
    Timeout(u64),

    /// I/O error on the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// TLS negotiation or configuration failure.
    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    /// A session handler returned an error; the session replied
    /// `421 4.3.0 Unhandled system error` and terminated.
    #[error("Handler error: {0}")]
    Handler(String),

    /// Client-side authentication could not proceed, e.g. no mutually
    /// supported mechanism.
    #[error("Authentication not possible: {0}")]
    Auth(String),
}

impl SmtpError {
    /// Whether the error ends the session rather than the current command.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::TooBig)
    }
}

/// Errors that can occur while loading TLS material or upgrading a stream.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to load TLS certificate from {path}: {reason}")]
    CertificateLoad { path: String, reason: String },

    #[error("Failed to load TLS private key from {path}: {reason}")]
    KeyLoad { path: String, reason: String },

    #[error("Invalid TLS server name: {0}")]
    ServerName(String),

    #[error("TLS error: {0}")]
    Rustls(String),
}

impl From<tokio_rustls::rustls::Error> for TlsError {
    fn from(err: tokio_rustls::rustls::Error) -> Self {
        Self::Rustls(err.to_string())
    }
}

/// Specialized `Result` for SMTP session operations.
pub type SmtpResult<T> = std::result::Result<T, SmtpError>;

/// Specialized `Result` for TLS operations.
pub type TlsResult<T> = std::result::Result<T, TlsError>;
