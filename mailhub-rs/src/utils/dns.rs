//! MX resolution for outbound delivery

use crate::error::{MailError, Result};
use tracing::{debug, info, warn};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::error::ResolveErrorKind;
use trust_dns_resolver::TokioAsyncResolver;

/// Resolves the mail exchangers of recipient domains
#[derive(Clone)]
pub struct MxResolver {
    resolver: TokioAsyncResolver,
}

impl MxResolver {
    pub fn new() -> Self {
        Self {
            resolver: TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default()),
        }
    }

    /// Mail servers for `domain` as `host:port`, most preferred first
    ///
    /// A domain without MX records is its own exchanger. Lookup failures
    /// other than "no records" are reported, so the caller can retry later.
    pub async fn lookup_mx(&self, domain: &str, port: u16) -> Result<Vec<String>> {
        info!("Looking up MX records for {}", domain);

        let records = match self.resolver.mx_lookup(domain).await {
            Ok(lookup) => lookup
                .iter()
                .map(|mx| (mx.preference(), mx.exchange().to_string()))
                .collect(),
            Err(e) => match e.kind() {
                ResolveErrorKind::NoRecordsFound { .. } => {
                    debug!("No MX records for {}, using the domain itself", domain);
                    Vec::new()
                }
                _ => {
                    warn!("MX lookup failed for {}: {}", domain, e);
                    return Err(MailError::DnsLookup(format!("{}: {}", domain, e)));
                }
            },
        };

        Ok(order_exchangers(records, domain, port))
    }
}

impl Default for MxResolver {
    fn default() -> Self {
        Self::new()
    }
}

/// Sort by preference (lowest first) and render as `host:port`
fn order_exchangers(mut records: Vec<(u16, String)>, domain: &str, port: u16) -> Vec<String> {
    records.sort_by_key(|(preference, _)| *preference);
    let servers: Vec<String> = records
        .into_iter()
        .map(|(_, host)| format!("{}:{}", host.trim_end_matches('.'), port))
        .collect();

    if servers.is_empty() {
        vec![format!("{}:{}", domain, port)]
    } else {
        servers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchangers_sorted_by_preference() {
        let records = vec![
            (20, "backup.example.com.".to_string()),
            (10, "mx.example.com.".to_string()),
        ];
        assert_eq!(
            order_exchangers(records, "example.com", 25),
            vec!["mx.example.com:25", "backup.example.com:25"]
        );
    }

    #[test]
    fn test_implicit_mx() {
        assert_eq!(
            order_exchangers(Vec::new(), "example.com", 2525),
            vec!["example.com:2525"]
        );
    }
}
