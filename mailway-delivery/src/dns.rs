//! MX resolution for outbound delivery, with A-record fallback per
//! RFC 5321 section 5.1 and a TTL-expiring cache safe for concurrent
//! reads.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use dashmap::DashMap;
use hickory_resolver::{
    TokioAsyncResolver,
    config::{ResolverConfig, ResolverOpts},
    error::ResolveErrorKind,
};
use thiserror::Error;

use crate::error::RelayError;

/// Errors that can occur while resolving a destination.
#[derive(Debug, Error)]
pub enum DnsError {
    /// No MX, A, or AAAA records exist for the domain.
    #[error("No mail servers found for domain: {0}")]
    NoMailServers(String),

    /// The domain does not exist.
    #[error("Domain does not exist: {0}")]
    DomainNotFound(String),

    /// The query failed or timed out; worth retrying.
    #[error("DNS lookup failed for {domain}: {reason}")]
    LookupFailed { domain: String, reason: String },
}

impl DnsError {
    pub fn is_temporary(&self) -> bool {
        matches!(self, Self::LookupFailed { .. })
    }
}

impl From<DnsError> for RelayError {
    fn from(err: DnsError) -> Self {
        if err.is_temporary() {
            Self::transient(err.to_string())
        } else {
            Self::permanent(err.to_string())
        }
    }
}

/// An MX record: `(preference, exchange host)`.
pub type MxRecords = Arc<Vec<(u16, String)>>;

struct CachedRecords {
    records: MxRecords,
    expires_at: Instant,
}

/// Resolves and caches the MX records for recipient domains. Absent MX
/// records, address records stand in with an implicit preference of 0.
pub struct MxResolver {
    resolver: TokioAsyncResolver,
    cache: DashMap<String, CachedRecords>,
    cache_ttl: Duration,
}

impl MxResolver {
    pub fn new() -> Self {
        Self::with_ttl(Duration::from_secs(300))
    }

    pub fn with_ttl(cache_ttl: Duration) -> Self {
        let resolver =
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());
        Self {
            resolver,
            cache: DashMap::new(),
            cache_ttl,
        }
    }

    /// The MX records for a domain, ascending by preference, from cache
    /// when the cached answer has not expired.
    pub async fn resolve(&self, domain: &str) -> Result<MxRecords, DnsError> {
        if let Some(cached) = self.cache.get(domain) {
            if cached.expires_at > Instant::now() {
                return Ok(Arc::clone(&cached.records));
            }
        }

        let records = Arc::new(self.resolve_uncached(domain).await?);
        self.cache.insert(
            domain.to_owned(),
            CachedRecords {
                records: Arc::clone(&records),
                expires_at: Instant::now() + self.cache_ttl,
            },
        );
        Ok(records)
    }

    async fn resolve_uncached(&self, domain: &str) -> Result<Vec<(u16, String)>, DnsError> {
        match self.resolver.mx_lookup(domain).await {
            Ok(lookup) => {
                let mut records: Vec<(u16, String)> = lookup
                    .iter()
                    .map(|mx| {
                        let host = mx.exchange().to_utf8();
                        (mx.preference(), host.trim_end_matches('.').to_owned())
                    })
                    .collect();

                if records.is_empty() {
                    return self.fallback_to_address(domain).await;
                }

                records.sort_by_key(|(preference, _)| *preference);
                Ok(records)
            }
            Err(err) => match err.kind() {
                ResolveErrorKind::NoRecordsFound { .. } => {
                    self.fallback_to_address(domain).await
                }
                _ => Err(DnsError::LookupFailed {
                    domain: domain.to_owned(),
                    reason: err.to_string(),
                }),
            },
        }
    }

    /// RFC 5321: a domain without MX records but with address records is
    /// treated as having one implicit MX at preference 0.
    async fn fallback_to_address(&self, domain: &str) -> Result<Vec<(u16, String)>, DnsError> {
        match self.resolver.lookup_ip(domain).await {
            Ok(lookup) => {
                let records: Vec<(u16, String)> =
                    lookup.iter().map(|ip| (0, ip.to_string())).collect();
                if records.is_empty() {
                    Err(DnsError::NoMailServers(domain.to_owned()))
                } else {
                    Ok(records)
                }
            }
            Err(err) => match err.kind() {
                ResolveErrorKind::NoRecordsFound { .. } => {
                    Err(DnsError::DomainNotFound(domain.to_owned()))
                }
                _ => Err(DnsError::LookupFailed {
                    domain: domain.to_owned(),
                    reason: err.to_string(),
                }),
            },
        }
    }

    /// Seed the cache directly, bypassing DNS. Used by tests and by
    /// operators who want fixed routing without `force_mx`.
    pub fn prime(&self, domain: &str, records: Vec<(u16, String)>) {
        self.cache.insert(
            domain.to_owned(),
            CachedRecords {
                records: Arc::new(records),
                expires_at: Instant::now() + self.cache_ttl,
            },
        );
    }
}

impl Default for MxResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn dns_errors_map_to_relay_errors() {
        let err: RelayError = DnsError::NoMailServers("example.com".to_owned()).into();
        assert!(err.is_permanent());

        let err: RelayError = DnsError::DomainNotFound("example.com".to_owned()).into();
        assert!(err.is_permanent());

        let err: RelayError = DnsError::LookupFailed {
            domain: "example.com".to_owned(),
            reason: "timed out".to_owned(),
        }
        .into();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn primed_records_are_served_from_cache() {
        let resolver = MxResolver::new();
        resolver.prime(
            "example.com",
            vec![(10, "mx1.example.com".to_owned()), (20, "mx2.example.com".to_owned())],
        );

        let records = resolver.resolve("example.com").await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], (10, "mx1.example.com".to_owned()));
    }

    #[tokio::test]
    #[ignore = "requires network access"]
    async fn live_mx_lookup_is_sorted() {
        let resolver = MxResolver::new();
        let records = resolver.resolve("gmail.com").await.unwrap();
        assert!(!records.is_empty());
        assert!(records.windows(2).all(|w| w[0].0 <= w[1].0));
    }
}
