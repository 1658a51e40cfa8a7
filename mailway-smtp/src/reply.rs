//! A standard SMTP reply: a three-digit code, an optional
//! ENHANCEDSTATUSCODES string, and a free-form message.

use core::fmt::{self, Display, Formatter};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{error::SmtpResult, io::SmtpIo};

/// Errors from populating a [`Reply`] with invalid data.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReplyError {
    #[error("Invalid SMTP reply code: {0}")]
    InvalidCode(String),

    #[error("Invalid enhanced status code: {0}")]
    InvalidEnhancedStatusCode(String),
}

/// Tracks the enhanced status code state. `Unset` renders the `X.0.0`
/// default for 2xx/4xx/5xx codes, `Cleared` suppresses the code entirely
/// (banners, EHLO responses), and `Explicit` carries a parsed triple whose
/// class digit is re-derived from the reply code on render.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
enum Esc {
    #[default]
    Unset,
    Explicit(String, String),
    Cleared,
}

/// An SMTP reply. The message setter recognizes a leading enhanced status
/// code (e.g. `2.1.0`) and stores it separately; rendering re-joins the
/// pieces as `code<sp>esc<sp>message`.
#[derive(Debug, Clone, Default)]
pub struct Reply {
    code: Option<String>,
    message: Option<String>,
    esc: Esc,
    /// The command this reply answers, for logging and error reporting.
    pub command: Option<String>,
    /// Whether a bare CRLF should precede the reply on the wire, used for
    /// asynchronous replies such as timeouts.
    pub newline_first: bool,
}

impl Reply {
    /// Construct a reply from a known-good code literal.
    ///
    /// # Panics
    ///
    /// Panics when `code` is not a valid three-digit SMTP code. Use
    /// [`set_code`](Self::set_code) for untrusted input.
    pub fn new(code: &str, message: &str) -> Self {
        let mut reply = Self::default();
        reply.set_code(Some(code)).expect("valid reply code literal");
        reply.set_message(Some(message));
        reply
    }

    /// An unpopulated reply tagged with the command awaiting it.
    pub fn pending(command: &str) -> Self {
        Self {
            command: Some(command.to_owned()),
            ..Self::default()
        }
    }

    /// Parse a rendered reply of the form `code<sp>message`.
    pub fn parse(line: &str) -> Result<Self, ReplyError> {
        let (code, message) = match line.split_once(' ') {
            Some((code, message)) => (code, message),
            None => (line, ""),
        };
        let mut reply = Self::default();
        reply.set_code(Some(code))?;
        reply.set_message(Some(message));
        Ok(reply)
    }

    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    /// Set or clear the reply code. A code must be three ASCII digits, the
    /// first between 1 and 5.
    pub fn set_code(&mut self, code: Option<&str>) -> Result<(), ReplyError> {
        match code {
            None => {
                self.code = None;
                Ok(())
            }
            Some(code) => {
                let bytes = code.as_bytes();
                let valid = bytes.len() == 3
                    && (b'1'..=b'5').contains(&bytes[0])
                    && bytes[1].is_ascii_digit()
                    && bytes[2].is_ascii_digit();
                if valid {
                    self.code = Some(code.to_owned());
                    Ok(())
                } else {
                    Err(ReplyError::InvalidCode(code.to_owned()))
                }
            }
        }
    }

    /// The message with the enhanced status code prefixed, when one
    /// applies.
    pub fn message(&self) -> Option<String> {
        match (self.enhanced_status_code(), self.message.as_deref()) {
            (Some(esc), Some(msg)) if !msg.is_empty() => Some(format!("{esc} {msg}")),
            (_, msg) => msg.map(str::to_owned),
        }
    }

    /// The message without any enhanced status code.
    pub fn raw_message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Set the message. A value prefixed with a valid enhanced status code
    /// has that prefix stripped and stored separately.
    pub fn set_message(&mut self, message: Option<&str>) {
        if let Some(message) = message {
            if let Some((esc, rest)) = split_esc_prefix(message) {
                self.esc = esc;
                self.message = Some(rest.to_owned());
                return;
            }
            self.message = Some(message.to_owned());
        } else {
            self.message = None;
        }
        if matches!(self.esc, Esc::Explicit(..)) {
            self.esc = Esc::Unset;
        }
    }

    /// The enhanced status code, defaulting to `X.0.0` for 2xx/4xx/5xx
    /// codes unless explicitly cleared.
    pub fn enhanced_status_code(&self) -> Option<String> {
        let class = self.code.as_deref().and_then(|c| c.chars().next())?;
        if !matches!(class, '2' | '4' | '5') {
            return None;
        }
        match &self.esc {
            Esc::Explicit(subject, detail) => Some(format!("{class}.{subject}.{detail}")),
            Esc::Cleared => None,
            Esc::Unset => Some(format!("{class}.0.0")),
        }
    }

    /// Set an explicit enhanced status code of the form `X.Y.Z`.
    pub fn set_enhanced_status_code(&mut self, esc: &str) -> Result<(), ReplyError> {
        match split_esc_prefix(&format!("{esc} ")) {
            Some((parsed, "")) => {
                self.esc = parsed;
                Ok(())
            }
            _ => Err(ReplyError::InvalidEnhancedStatusCode(esc.to_owned())),
        }
    }

    /// Suppress the enhanced status code entirely, as is done for banners
    /// and EHLO responses.
    pub fn clear_enhanced_status_code(&mut self) {
        self.esc = Esc::Cleared;
    }

    /// Overwrite this reply's code, message and enhanced status code with
    /// another's. The command tag and newline flag are left alone.
    pub fn copy(&mut self, other: &Reply) -> &mut Self {
        self.code = other.code.clone();
        self.message = other.message.clone();
        self.esc = other.esc.clone();
        self
    }

    /// True when the code begins with `4` or `5`.
    pub fn is_error(&self) -> bool {
        matches!(self.code_class(), Some('4' | '5'))
    }

    /// First digit of the code, when populated.
    pub fn code_class(&self) -> Option<char> {
        self.code.as_deref().and_then(|c| c.chars().next())
    }

    /// Whether the reply has been populated with a code.
    pub fn is_populated(&self) -> bool {
        self.code.is_some()
    }

    /// Append to the raw message, e.g. to annotate a failure reason.
    pub fn append_message(&mut self, suffix: &str) {
        match &mut self.message {
            Some(message) => message.push_str(suffix),
            None => self.message = Some(suffix.to_owned()),
        }
    }

    /// Write the rendered reply into the session's send buffer, optionally
    /// flushing it to the wire.
    pub async fn send<S>(&self, io: &mut SmtpIo<S>, flush: bool) -> SmtpResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        if self.newline_first {
            io.buffered_send(b"\r\n");
        }
        io.send_reply(self);
        if flush {
            io.flush_send().await?;
        }
        Ok(())
    }

    /// Populate the reply with the code and message received from the
    /// session.
    pub async fn recv<S>(&mut self, io: &mut SmtpIo<S>) -> SmtpResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (code, message) = io.recv_reply().await?;
        self.set_code(Some(&code))
            .map_err(|e| crate::error::SmtpError::BadReply(e.to_string()))?;
        self.set_message(Some(&message));
        Ok(())
    }
}

impl PartialEq for Reply {
    fn eq(&self, other: &Self) -> bool {
        self.code == other.code && self.message() == other.message()
    }
}

impl Display for Reply {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match (self.code.as_deref(), self.message()) {
            (Some(code), Some(message)) => write!(f, "{code} {message}"),
            (Some(code), None) => f.write_str(code),
            _ => f.write_str("(unpopulated)"),
        }
    }
}

/// Split a leading `X.Y.Z` enhanced status code (with trailing whitespace)
/// off a message, returning the parsed state and the remainder.
fn split_esc_prefix(message: &str) -> Option<(Esc, &str)> {
    let bytes = message.as_bytes();
    if !matches!(bytes.first(), Some(b'2' | b'4' | b'5')) {
        return None;
    }

    let digits = |s: &[u8]| -> Option<usize> {
        let n = s.iter().take_while(|b| b.is_ascii_digit()).count();
        (1..=3).contains(&n).then_some(n)
    };

    let mut i = 1;
    if bytes.get(i) != Some(&b'.') {
        return None;
    }
    i += 1;
    let subject_len = digits(&bytes[i..])?;
    let subject = &message[i..i + subject_len];
    i += subject_len;
    if bytes.get(i) != Some(&b'.') {
        return None;
    }
    i += 1;
    let detail_len = digits(&bytes[i..])?;
    let detail = &message[i..i + detail_len];
    i += detail_len;

    let rest = &message[i..];
    let trimmed = rest.trim_start();
    if trimmed.len() == rest.len() {
        // The code must be followed by whitespace to count as a prefix.
        return None;
    }
    Some((Esc::Explicit(subject.to_owned(), detail.to_owned()), trimmed))
}

/// Reply sent when an unknown SMTP command is received by a server.
pub fn unknown_command() -> Reply {
    Reply::new("500", "5.5.2 Syntax error, command unrecognized")
}

/// Reply sent when a parameter is sent that is not supported.
pub fn unknown_parameter() -> Reply {
    Reply::new("504", "5.5.4 Command parameter not implemented")
}

/// Reply sent when commands are sent out of standard SMTP sequence.
pub fn bad_sequence() -> Reply {
    Reply::new("503", "5.5.1 Bad sequence of commands")
}

/// Reply sent when an expected parameter is invalid.
pub fn bad_arguments() -> Reply {
    Reply::new("501", "5.5.4 Syntax error in parameters or arguments")
}

/// Reply sent when an unhandled error is raised in a command handler.
pub fn unhandled_error() -> Reply {
    Reply::new("421", "4.3.0 Unhandled system error")
}

/// Reply sent when a TLS negotiation error occurs.
pub fn tls_failure() -> Reply {
    Reply::new("421", "4.7.0 TLS negotiation failed")
}

/// Reply sent when a connection fails unexpectedly.
pub fn connection_failed() -> Reply {
    Reply::new("451", "4.3.0 Connection failed")
}

/// Reply sent when the server times out waiting for the client.
pub fn timed_out() -> Reply {
    let mut reply = Reply::new("421", "4.4.2 Connection timed out");
    reply.newline_first = true;
    reply
}

/// Reply sent when an authentication attempt presented invalid
/// credentials.
pub fn invalid_credentials() -> Reply {
    Reply::new("535", "5.7.8 Authentication credentials invalid")
}
