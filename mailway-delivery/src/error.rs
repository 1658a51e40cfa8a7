//! Relay failure classification: transient failures are retried with
//! backoff, permanent failures bounce.

use mailway_smtp::Reply;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayErrorKind {
    /// Delivery may succeed if tried again later.
    Transient,
    /// Delivery will never succeed no matter how often it is attempted.
    Permanent,
}

/// A failed delivery attempt, carrying the SMTP reply to report in
/// bounces and logs.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct RelayError {
    pub kind: RelayErrorKind,
    pub reply: Reply,
    message: String,
}

impl RelayError {
    /// A transient failure with the default `450 4.0.0` reply.
    pub fn transient(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind: RelayErrorKind::Transient,
            reply: Reply::new("450", &format!("4.0.0 {message}")),
            message,
        }
    }

    /// A permanent failure with the default `550 5.0.0` reply.
    pub fn permanent(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind: RelayErrorKind::Permanent,
            reply: Reply::new("550", &format!("5.0.0 {message}")),
            message,
        }
    }

    /// Classify a peer's reply: a 5xx code is permanent, anything else
    /// that reads as a failure is transient.
    pub fn from_reply(reply: Reply) -> Self {
        let kind = if reply.code_class() == Some('5') {
            RelayErrorKind::Permanent
        } else {
            RelayErrorKind::Transient
        };
        let variety = match kind {
            RelayErrorKind::Permanent => "Permanent",
            RelayErrorKind::Transient => "Transient",
        };
        let command = reply.command.clone().unwrap_or_else(|| "[UNKNOWN]".to_owned());
        let message = format!("{variety} failure on {command}: {reply}");
        Self {
            kind,
            reply,
            message,
        }
    }

    /// The MX relay was handed a recipient without a domain part.
    pub fn no_domain(recipient: &str) -> Self {
        Self::permanent(format!("Recipient address has no domain: {recipient}"))
    }

    pub fn is_permanent(&self) -> bool {
        self.kind == RelayErrorKind::Permanent
    }

    pub fn is_transient(&self) -> bool {
        self.kind == RelayErrorKind::Transient
    }
}
