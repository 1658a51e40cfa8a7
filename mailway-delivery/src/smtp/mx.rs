//! MX-routed relaying: the destination is derived from the first
//! recipient's domain, resolved through DNS, and served by a cached
//! per-destination [`StaticSmtpRelay`] so connection pools are reused.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use mailway_common::Envelope;

use crate::{
    dns::MxResolver,
    error::RelayError,
    relay::{Relay, RelayResult},
    smtp::{SmtpClientOptions, static_relay::StaticSmtpRelay},
};

pub struct MxSmtpRelay {
    resolver: MxResolver,
    force: DashMap<String, (String, u16)>,
    relayers: DashMap<(String, u16), Arc<StaticSmtpRelay>>,
    options: SmtpClientOptions,
    pool_size: Option<usize>,
}

impl MxSmtpRelay {
    pub fn new(options: SmtpClientOptions) -> Self {
        Self::with_resolver(options, MxResolver::new())
    }

    pub fn with_resolver(options: SmtpClientOptions, resolver: MxResolver) -> Self {
        Self {
            resolver,
            force: DashMap::new(),
            relayers: DashMap::new(),
            options,
            pool_size: None,
        }
    }

    /// Bound on connections per destination.
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = Some(pool_size);
        self
    }

    /// Skip MX lookups for `domain` and always deliver to
    /// `destination:port`.
    pub fn force_mx(&self, domain: &str, destination: impl Into<String>, port: u16) {
        self.force
            .insert(domain.to_ascii_lowercase(), (destination.into(), port));
    }

    /// The domain of the first recipient. An address without an
    /// unquoted `@` has no domain and cannot be routed.
    fn recipient_domain(envelope: &Envelope) -> Result<String, RelayError> {
        let recipient = envelope
            .recipients
            .first()
            .ok_or_else(|| RelayError::permanent("Envelope has no recipients"))?;
        match recipient.rsplit_once('@') {
            Some((_, domain)) if !domain.is_empty() => Ok(domain.to_ascii_lowercase()),
            _ => Err(RelayError::no_domain(recipient)),
        }
    }

    /// Cycle through the records with the attempt count, so successive
    /// retries try each exchange once. Records are sorted ascending by
    /// preference.
    fn choose_mx(records: &[(u16, String)], attempts: u32) -> Option<&str> {
        if records.is_empty() {
            return None;
        }
        let index = (attempts as usize) % records.len();
        Some(&records[index].1)
    }

    fn relayer_for(&self, destination: String, port: u16) -> Arc<StaticSmtpRelay> {
        let entry = self
            .relayers
            .entry((destination.clone(), port))
            .or_insert_with(|| {
                Arc::new(StaticSmtpRelay::new(
                    destination,
                    port,
                    self.pool_size,
                    self.options.clone(),
                ))
            });
        Arc::clone(entry.value())
    }
}

#[async_trait]
impl Relay for MxSmtpRelay {
    async fn attempt(&self, envelope: Envelope, attempts: u32) -> RelayResult {
        let domain = Self::recipient_domain(&envelope)?;

        // Copy the forced route out before any await; dashmap guards
        // must not be held across suspension points.
        let forced = self.force.get(&domain).map(|entry| entry.clone());
        let (destination, port) = match forced {
            Some(forced) => forced,
            None => {
                let records = self.resolver.resolve(&domain).await?;
                let destination = Self::choose_mx(&records, attempts)
                    .ok_or_else(|| RelayError::permanent(format!(
                        "No mail servers available for domain: {domain}"
                    )))?
                    .to_owned();
                (destination, 25)
            }
        };

        let relayer = self.relayer_for(destination, port);
        relayer.attempt(envelope, attempts).await
    }

    async fn kill(&self) {
        for entry in self.relayers.iter() {
            entry.value().kill().await;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn envelope(recipients: &[&str]) -> Envelope {
        let mut env = Envelope::new("sender@example.com");
        env.recipients = recipients.iter().map(|r| (*r).to_owned()).collect();
        env
    }

    #[test]
    fn recipient_domain_is_lowercased() {
        let env = envelope(&["User@EXAMPLE.Com"]);
        assert_eq!(
            MxSmtpRelay::recipient_domain(&env).unwrap(),
            "example.com"
        );
    }

    #[test]
    fn domainless_recipient_is_permanent() {
        let env = envelope(&["localonly"]);
        let err = MxSmtpRelay::recipient_domain(&env).unwrap_err();
        assert!(err.is_permanent());

        let env = envelope(&["trailing@"]);
        assert!(MxSmtpRelay::recipient_domain(&env).is_err());
    }

    #[test]
    fn choose_mx_cycles_with_attempts() {
        let records = vec![
            (10, "mx1.example.com".to_owned()),
            (20, "mx2.example.com".to_owned()),
            (30, "mx3.example.com".to_owned()),
        ];

        assert_eq!(MxSmtpRelay::choose_mx(&records, 0), Some("mx1.example.com"));
        assert_eq!(MxSmtpRelay::choose_mx(&records, 1), Some("mx2.example.com"));
        assert_eq!(MxSmtpRelay::choose_mx(&records, 2), Some("mx3.example.com"));
        assert_eq!(MxSmtpRelay::choose_mx(&records, 3), Some("mx1.example.com"));
        assert_eq!(MxSmtpRelay::choose_mx(&[], 0), None);
    }

    #[tokio::test]
    async fn relayers_are_reused_per_destination() {
        let relay = MxSmtpRelay::new(SmtpClientOptions::default());
        let one = relay.relayer_for("mx.example.com".to_owned(), 25);
        let two = relay.relayer_for("mx.example.com".to_owned(), 25);
        let other = relay.relayer_for("mx.other.net".to_owned(), 25);

        assert!(Arc::ptr_eq(&one, &two));
        assert!(!Arc::ptr_eq(&one, &other));
        assert_eq!(relay.relayers.len(), 2);
    }
}
