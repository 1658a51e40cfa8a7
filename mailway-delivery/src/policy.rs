//! Envelope policies.
//!
//! Queue policies run once, before a message is persisted, and may
//! replace the envelope with one or more new envelopes; their changes are
//! stored. Relay policies run before every delivery attempt and their
//! changes are not persisted.

use mailway_common::Envelope;

/// Runs before a message is queued. Returning `None` (or an empty list)
/// keeps the envelope, with any in-place mutations; returning
/// replacements discards it.
pub trait QueuePolicy: Send + Sync {
    fn apply(&self, envelope: &mut Envelope) -> Option<Vec<Envelope>>;
}

/// Runs immediately before each relay attempt.
pub trait RelayPolicy: Send + Sync {
    fn apply(&self, envelope: &mut Envelope);
}

/// Splits multi-recipient envelopes into one envelope per recipient.
/// Useful ahead of relays that handle multi-recipient messages poorly,
/// such as MX-routed delivery.
pub struct RecipientSplit;

impl QueuePolicy for RecipientSplit {
    fn apply(&self, envelope: &mut Envelope) -> Option<Vec<Envelope>> {
        if envelope.recipients.len() <= 1 {
            return None;
        }
        Some(envelope.split())
    }
}

/// Splits an envelope so each copy holds recipients of a single domain
/// (case-insensitive). Recipients without a domain are invalid addresses
/// and each get an envelope of their own.
pub struct RecipientDomainSplit;

impl RecipientDomainSplit {
    fn domain_of(recipient: &str) -> Option<String> {
        let (_, domain) = recipient.rsplit_once('@')?;
        if domain.is_empty() {
            return None;
        }
        Some(domain.to_ascii_lowercase())
    }
}

impl QueuePolicy for RecipientDomainSplit {
    fn apply(&self, envelope: &mut Envelope) -> Option<Vec<Envelope>> {
        let mut groups: Vec<(String, Vec<String>)> = Vec::new();
        let mut bad_rcpts: Vec<String> = Vec::new();

        for rcpt in &envelope.recipients {
            match Self::domain_of(rcpt) {
                Some(domain) => match groups.iter_mut().find(|(d, _)| *d == domain) {
                    Some((_, rcpts)) => rcpts.push(rcpt.clone()),
                    None => groups.push((domain, vec![rcpt.clone()])),
                },
                None => bad_rcpts.push(rcpt.clone()),
            }
        }

        if groups.len() + bad_rcpts.len() <= 1 {
            return None;
        }

        let mut ret = Vec::new();
        for (_, rcpts) in groups {
            ret.push(envelope.copy(rcpts));
        }
        for bad_rcpt in bad_rcpts {
            ret.push(envelope.copy(vec![bad_rcpt]));
        }
        Some(ret)
    }
}

/// Ensures a `Date` header, derived from the envelope's ingress
/// timestamp when it has one.
pub struct AddDateHeader;

impl QueuePolicy for AddDateHeader {
    fn apply(&self, envelope: &mut Envelope) -> Option<Vec<Envelope>> {
        if !envelope.headers.contains("Date") {
            let date = envelope
                .timestamp
                .and_then(|secs| chrono::DateTime::from_timestamp(secs as i64, 0))
                .unwrap_or_else(chrono::Utc::now);
            envelope.headers.prepend("Date", date.to_rfc2822());
        }
        None
    }
}

/// Ensures a `Message-Id` header.
pub struct AddMessageIdHeader {
    hostname: String,
}

impl AddMessageIdHeader {
    pub fn new() -> Self {
        Self {
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
        }
    }
}

impl Default for AddMessageIdHeader {
    fn default() -> Self {
        Self::new()
    }
}

impl QueuePolicy for AddMessageIdHeader {
    fn apply(&self, envelope: &mut Envelope) -> Option<Vec<Envelope>> {
        if !envelope.headers.contains("Message-Id") {
            let id = format!("<{}@{}>", ulid::Ulid::new(), self.hostname);
            envelope.headers.prepend("Message-Id", id);
        }
        None
    }
}

/// Prepends the `Received` header describing this hop.
pub struct AddReceivedHeader;

impl QueuePolicy for AddReceivedHeader {
    fn apply(&self, envelope: &mut Envelope) -> Option<Vec<Envelope>> {
        let client_name = envelope.client.name.as_deref().unwrap_or("unknown");
        let client_host = envelope.client.host.as_deref().unwrap_or("unknown");
        let client_ip = envelope.client.ip.as_deref().unwrap_or("unknown");
        let protocol = envelope.client.protocol.as_deref().unwrap_or("SMTP");
        let receiver = envelope.receiver.as_deref().unwrap_or("localhost");
        let date = envelope
            .timestamp
            .and_then(|secs| chrono::DateTime::from_timestamp(secs as i64, 0))
            .unwrap_or_else(chrono::Utc::now)
            .to_rfc2822();

        let value = format!(
            "from {client_name} ({client_host} [{client_ip}]) by {receiver} with {protocol}; {date}"
        );
        envelope.headers.prepend("Received", value);
        None
    }
}

/// Rewrites recipient addresses through a substitution table. A pattern
/// beginning with `@` rewrites the domain part of matching addresses;
/// any other pattern replaces a whole address on exact match.
pub struct Forward {
    mapping: Vec<(String, String)>,
}

impl Forward {
    pub fn new(mapping: Vec<(String, String)>) -> Self {
        Self { mapping }
    }

    fn rewrite(&self, recipient: &str) -> Option<String> {
        for (pattern, replacement) in &self.mapping {
            if let Some(domain) = pattern.strip_prefix('@') {
                if let Some((local, rcpt_domain)) = recipient.rsplit_once('@') {
                    if rcpt_domain.eq_ignore_ascii_case(domain) {
                        return Some(format!("{local}@{replacement}"));
                    }
                }
            } else if recipient.eq_ignore_ascii_case(pattern) {
                return Some(replacement.clone());
            }
        }
        None
    }
}

impl RelayPolicy for Forward {
    fn apply(&self, envelope: &mut Envelope) {
        for rcpt in &mut envelope.recipients {
            if let Some(rewritten) = self.rewrite(rcpt) {
                *rcpt = rewritten;
            }
        }
    }
}
