//! SMTP-based relays: pooled clients to a fixed destination, MX-routed
//! relaying, and the LMTP per-recipient variant.

pub mod client;
pub mod lmtp;
pub mod mx;
pub mod static_relay;

use std::time::Duration;

use mailway_common::BinaryEncoder;
use mailway_smtp::{Credentials, TlsClientContext};

pub use mx::MxSmtpRelay;
pub use static_relay::{RelayProtocol, StaticSmtpRelay};

/// Configuration shared by the pooled relay clients.
#[derive(Clone)]
pub struct SmtpClientOptions {
    /// Identifier sent in EHLO/LHLO; defaults to this host's name.
    pub ehlo_as: String,
    /// Client TLS settings; enables STARTTLS when the peer offers it.
    pub tls: Option<TlsClientContext>,
    /// Encrypt immediately on connect instead of via STARTTLS.
    pub tls_immediately: bool,
    /// Fail deliveries permanently when the channel cannot be
    /// encrypted.
    pub tls_required: bool,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub data_timeout: Duration,
    /// How long an idle worker waits for another delivery before
    /// QUITting. `None` sends QUIT after each delivery.
    pub idle_timeout: Option<Duration>,
    /// Authenticate after the handshake.
    pub credentials: Option<Credentials>,
    /// Re-encodes 8-bit bodies for peers without `8BITMIME`. Without
    /// one, such deliveries fail permanently.
    pub binary_encoder: Option<BinaryEncoder>,
}

impl Default for SmtpClientOptions {
    fn default() -> Self {
        Self {
            ehlo_as: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
            tls: None,
            tls_immediately: false,
            tls_required: false,
            connect_timeout: Duration::from_secs(30),
            command_timeout: Duration::from_secs(30),
            data_timeout: Duration::from_secs(120),
            idle_timeout: None,
            credentials: None,
            binary_encoder: None,
        }
    }
}

impl SmtpClientOptions {
    pub fn with_ehlo_as(mut self, ehlo_as: impl Into<String>) -> Self {
        self.ehlo_as = ehlo_as.into();
        self
    }

    pub fn with_tls(mut self, tls: TlsClientContext) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_tls_immediately(mut self, immediately: bool) -> Self {
        self.tls_immediately = immediately;
        self
    }

    pub fn with_tls_required(mut self, required: bool) -> Self {
        self.tls_required = required;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_data_timeout(mut self, timeout: Duration) -> Self {
        self.data_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_binary_encoder(mut self, encoder: BinaryEncoder) -> Self {
        self.binary_encoder = Some(encoder);
        self
    }
}
