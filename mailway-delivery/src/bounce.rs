//! Bounce message synthesis: when delivery permanently fails, a
//! delivery-status report is sent back to the original sender with the
//! original message attached.

use std::sync::Arc;

use mailway_common::Envelope;
use mailway_smtp::Reply;
use ulid::Ulid;

/// Produces a bounce envelope for a failed delivery, or `None` to
/// suppress the bounce.
pub type BounceFactory = Arc<dyn Fn(&Envelope, &Reply) -> Option<Envelope> + Send + Sync>;

const DEFAULT_HEADER_TEMPLATE: &str = "From: MAILER-DAEMON\r\n\
To: {sender}\r\n\
Subject: Undelivered Mail Returned to Sender\r\n\
Auto-Submitted: auto-replied\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/report; report-type=delivery-status; boundary=\"{boundary}\"\r\n\
Content-Transfer-Encoding: 7bit\r\n\
\r\n\
This is a multi-part message in MIME format.\r\n\
\r\n\
--{boundary}\r\n\
Content-Type: text/plain\r\n\
\r\n\
Delivery failed.\r\n\
\r\n\
Destination host responded:\r\n\
{code} {message}\r\n\
\r\n\
--{boundary}\r\n\
Content-Type: message/delivery-status\r\n\
\r\n\
Remote-MTA: dns; {client_name} [{client_ip}]\r\n\
Diagnostic-Code: {protocol}; {code} {message}\r\n\
\r\n\
--{boundary}\r\n\
Content-Type: message/rfc822\r\n\
\r\n";

const DEFAULT_FOOTER_TEMPLATE: &str = "\r\n--{boundary}--\r\n";

/// Template-driven bounce builder. The templates are processed with a
/// substitution table; the original message is inserted between them.
#[derive(Debug, Clone)]
pub struct Bounce {
    pub header_template: String,
    pub footer_template: String,
    /// Attach only the original headers, not the body.
    pub headers_only: bool,
}

impl Default for Bounce {
    fn default() -> Self {
        Self {
            header_template: DEFAULT_HEADER_TEMPLATE.to_owned(),
            footer_template: DEFAULT_FOOTER_TEMPLATE.to_owned(),
            headers_only: false,
        }
    }
}

impl Bounce {
    /// The default factory: a [`Bounce`] built in every case.
    pub fn factory() -> BounceFactory {
        let bounce = Self::default();
        Arc::new(move |envelope, reply| bounce.build(envelope, reply))
    }

    /// A factory that attaches only the original headers.
    pub fn headers_only_factory() -> BounceFactory {
        let bounce = Self {
            headers_only: true,
            ..Self::default()
        };
        Arc::new(move |envelope, reply| bounce.build(envelope, reply))
    }

    /// Build the bounce envelope: null sender, the original sender as
    /// the sole recipient, and a multipart/report body.
    pub fn build(&self, envelope: &Envelope, reply: &Reply) -> Option<Envelope> {
        if envelope.sender.is_empty() {
            // A bounce of a bounce would loop forever.
            return None;
        }

        let boundary = format!("boundary_{:032x}", u128::from(Ulid::new()));
        let substitutions = [
            ("{boundary}", boundary),
            ("{sender}", envelope.sender.clone()),
            (
                "{client_name}",
                envelope
                    .client
                    .name
                    .clone()
                    .unwrap_or_else(|| "unknown".to_owned()),
            ),
            (
                "{client_ip}",
                envelope
                    .client
                    .ip
                    .clone()
                    .unwrap_or_else(|| "unknown".to_owned()),
            ),
            (
                "{protocol}",
                envelope
                    .client
                    .protocol
                    .clone()
                    .unwrap_or_else(|| "SMTP".to_owned()),
            ),
            ("{code}", reply.code().unwrap_or("550").to_owned()),
            ("{message}", reply.message().unwrap_or_default()),
        ];

        let mut data = substitute(&self.header_template, &substitutions).into_bytes();
        data.extend_from_slice(&envelope.headers.flatten());
        if !self.headers_only {
            data.extend_from_slice(&envelope.message);
        }
        data.extend_from_slice(substitute(&self.footer_template, &substitutions).as_bytes());

        let mut bounce = Envelope::new("");
        bounce.recipients = vec![envelope.sender.clone()];
        bounce.parse(&data).ok()?;
        Some(bounce)
    }
}

fn substitute(template: &str, substitutions: &[(&str, String)]) -> String {
    let mut out = template.to_owned();
    for (placeholder, value) in substitutions {
        out = out.replace(placeholder, value);
    }
    out
}
