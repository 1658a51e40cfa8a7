//! The envelope value object that flows from an edge, through the queue,
//! and out of a relay: sender, recipients, parsed headers, body bytes, and
//! metadata about the client that submitted the message.

use std::{fmt::Debug, sync::Arc};

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::EnvelopeError;

/// A single message header. Repeats are allowed and ordering is preserved
/// by the surrounding [`Headers`] container.
#[derive(Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Header {
    name: String,
    value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// Case-insensitive name comparison.
    pub fn named(&self, v: &str) -> bool {
        self.name.len() == v.len() && self.name.eq_ignore_ascii_case(v)
    }
}

impl Debug for Header {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Header")
            .field("name", &self.name)
            .field("value", &self.value)
            .finish()
    }
}

/// Ordered header container allowing repeated names and case-insensitive
/// lookup.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Headers(Vec<Header>);

impl Headers {
    /// Parse an RFC 5322 header block, returning the container and the
    /// offset at which the message body begins. The boundary is the first
    /// blank line, CRLF or bare LF; header-only input yields an offset at
    /// the end of the data.
    ///
    /// Malformed header blocks do not fail: lines that cannot be read as
    /// headers are skipped, since a message must still be accepted and
    /// relayed even when a submitter mangles its headers.
    pub fn parse(data: &[u8]) -> Result<(Self, usize), EnvelopeError> {
        if let Ok((parsed, body_offset)) = mailparse::parse_headers(data) {
            let headers = parsed
                .iter()
                .map(|h| Header::new(h.get_key(), h.get_value()))
                .collect();
            return Ok((Self(headers), body_offset));
        }

        let (header_block, body_offset) = split_at_blank_line(data);
        Ok((Self::parse_lenient(header_block), body_offset))
    }

    /// Line-by-line fallback: `Name: value` pairs with whitespace-led
    /// continuation lines folded into the previous value; anything else
    /// is dropped.
    fn parse_lenient(block: &[u8]) -> Self {
        let mut headers: Vec<Header> = Vec::new();
        for raw_line in block.split(|&b| b == b'\n') {
            let line = String::from_utf8_lossy(raw_line);
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            if line.starts_with(' ') || line.starts_with('\t') {
                if let Some(last) = headers.last_mut() {
                    last.value.push(' ');
                    last.value.push_str(line.trim_start());
                }
            } else if let Some((name, value)) = line.split_once(':') {
                headers.push(Header::new(name.trim_end(), value.trim_start()));
            }
        }
        Self(headers)
    }

    /// Render the headers with canonical CRLF line endings, terminated by
    /// the blank separator line.
    pub fn flatten(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for header in &self.0 {
            out.extend_from_slice(header.name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(header.value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }

    /// First value for the given name, if any.
    pub fn get_first(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|h| h.named(name))
            .map(|h| h.value.as_str())
    }

    /// All values for the given name, in order of appearance.
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.0
            .iter()
            .filter(|h| h.named(name))
            .map(|h| h.value.as_str())
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|h| h.named(name))
    }

    /// Append a header after any existing ones.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push(Header::new(name, value));
    }

    /// Insert a header before any existing ones.
    pub fn prepend(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(0, Header::new(name, value));
    }

    /// Remove every header with the given name, returning how many were
    /// removed.
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.0.len();
        self.0.retain(|h| !h.named(name));
        before - self.0.len()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Header> {
        self.0.iter()
    }
}

/// Metadata about the client connection an envelope arrived on.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ClientInfo {
    /// Remote IP address of the client.
    pub ip: Option<String>,
    /// Reverse-DNS hostname of the client, when available.
    pub host: Option<String>,
    /// The identifier the client gave in its EHLO or HELO.
    pub name: Option<String>,
    /// Protocol variant used, e.g. `SMTP`, `ESMTP`, `ESMTPS`, `ESMTPA`.
    pub protocol: Option<String>,
    /// Identity the client authenticated as, when it did.
    pub auth: Option<String>,
}

/// Re-encodes a message body so that it is safe to transmit over a
/// 7-bit channel, e.g. to a peer that does not advertise `8BITMIME`.
#[derive(Clone)]
pub struct BinaryEncoder {
    name: &'static str,
    encode: Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>,
}

impl BinaryEncoder {
    pub fn new(
        name: &'static str,
        encode: impl Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name,
            encode: Arc::new(encode),
        }
    }

    /// Base64 content-transfer-encoding with 76-column CRLF wrapping.
    pub fn base64() -> Self {
        Self::new("base64", |data| {
            let encoded = base64::engine::general_purpose::STANDARD.encode(data);
            let mut out = Vec::with_capacity(encoded.len() + encoded.len() / 38);
            for chunk in encoded.as_bytes().chunks(76) {
                out.extend_from_slice(chunk);
                out.extend_from_slice(b"\r\n");
            }
            out
        })
    }

    /// The `Content-Transfer-Encoding` token this encoder produces.
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn encode(&self, data: &[u8]) -> Vec<u8> {
        (self.encode)(data)
    }
}

impl Debug for BinaryEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinaryEncoder")
            .field("name", &self.name)
            .finish()
    }
}

/// Message data plus delivery metadata. An envelope is created by an edge,
/// mutated only by pre-queue policies, and treated as immutable by the
/// queue and relay layers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Sending address; the empty string is the null sender.
    pub sender: String,
    /// Recipient addresses, in RCPT order.
    pub recipients: Vec<String>,
    /// Parsed message headers.
    pub headers: Headers,
    /// Message body, not including headers.
    #[serde(with = "serde_bytes_vec")]
    pub message: Vec<u8>,
    /// Information about the submitting client.
    pub client: ClientInfo,
    /// Hostname of the server that received the message.
    pub receiver: Option<String>,
    /// Seconds since the epoch at which the message was received.
    pub timestamp: Option<u64>,
    /// Optional identifier assigned at ingress.
    pub id: Option<String>,
}

impl Envelope {
    pub fn new(sender: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            ..Self::default()
        }
    }

    /// Populate [`headers`](Self::headers) and [`message`](Self::message)
    /// from a complete message. The boundary between the two is the first
    /// blank line.
    pub fn parse(&mut self, data: &[u8]) -> Result<(), EnvelopeError> {
        let (headers, body_offset) = Headers::parse(data)?;
        self.headers = headers;
        self.message = data[body_offset..].to_vec();
        Ok(())
    }

    /// Serialize to `(header_data, message_data)`, with headers rendered
    /// using canonical CRLF line endings.
    pub fn flatten(&self) -> (Vec<u8>, Vec<u8>) {
        (self.headers.flatten(), self.message.clone())
    }

    /// Shallow copy with the given recipient list. The header container is
    /// independently owned by the copy; sender, body and client metadata
    /// carry over.
    pub fn copy(&self, recipients: Vec<String>) -> Self {
        Self {
            recipients,
            ..self.clone()
        }
    }

    /// Split into one envelope per recipient, each with its own copy of
    /// the headers.
    pub fn split(&self) -> Vec<Self> {
        self.recipients
            .iter()
            .map(|rcpt| self.copy(vec![rcpt.clone()]))
            .collect()
    }

    /// Whether the body contains any byte above 0x7F.
    pub fn has_8bit(&self) -> bool {
        self.message.iter().any(|&b| b > 0x7F)
    }

    /// Re-encode an 8-bit body with the given content-transfer-encoder,
    /// recording the encoding in the headers. A 7-bit body is left
    /// untouched. Fails when the body is 8-bit and no encoder was given.
    pub fn encode_7bit(&mut self, encoder: Option<&BinaryEncoder>) -> Result<(), EnvelopeError> {
        if !self.has_8bit() {
            return Ok(());
        }

        let encoder = encoder.ok_or(EnvelopeError::EightBitData)?;
        self.message = encoder.encode(&self.message);
        self.headers.remove("Content-Transfer-Encoding");
        self.headers.add("Content-Transfer-Encoding", encoder.name());
        Ok(())
    }
}

/// Split message data at the first blank line (`\r?\n\r?\n`), returning
/// the header block and the offset at which the body begins.
/// Header-only input yields the whole data as headers and an empty body.
fn split_at_blank_line(data: &[u8]) -> (&[u8], usize) {
    let mut i = 0;
    while i < data.len() {
        if data[i] != b'\n' {
            i += 1;
            continue;
        }
        let mut j = i + 1;
        if data.get(j) == Some(&b'\r') {
            j += 1;
        }
        if data.get(j) == Some(&b'\n') {
            return (&data[..i + 1], j + 1);
        }
        i += 1;
    }
    (data, data.len())
}

/// Compact serde representation for the body bytes.
mod serde_bytes_vec {
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(data)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        struct Bytes;

        impl<'de> serde::de::Visitor<'de> for Bytes {
            type Value = Vec<u8>;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("bytes")
            }

            fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
                Ok(v.to_vec())
            }

            fn visit_seq<A: serde::de::SeqAccess<'de>>(
                self,
                mut seq: A,
            ) -> Result<Self::Value, A::Error> {
                let mut out = Vec::new();
                while let Some(byte) = seq.next_element()? {
                    out.push(byte);
                }
                Ok(out)
            }
        }

        deserializer.deserialize_bytes(Bytes)
    }
}
