//! Error types shared across the mailway crates.

use thiserror::Error;

/// Errors produced while parsing or transforming an [`Envelope`].
///
/// [`Envelope`]: crate::envelope::Envelope
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// The header block could not be parsed as RFC 5322 headers.
    #[error("Unable to parse message headers: {0}")]
    HeaderParse(String),

    /// The message body contains bytes above 0x7F but no
    /// content-transfer-encoder was supplied to re-encode it.
    #[error("Message body contains 8-bit data and no encoder was given")]
    EightBitData,
}
