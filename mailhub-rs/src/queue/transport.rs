//! How a queued message leaves the server

use crate::error::DeliveryError;
use crate::smtp::SmtpClient;
use crate::utils::dns::MxResolver;
use crate::utils::domain_of;
use async_trait::async_trait;
use tracing::{info, warn};

#[cfg(test)]
use mockall::automock;

/// Delivers one message to one remote recipient
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    /// `from` is empty for the null sender
    async fn deliver(&self, from: &str, to: &str, message: &[u8]) -> Result<(), DeliveryError>;
}

/// Direct delivery to the recipient domain's exchangers, or via a relay
pub struct MxTransport {
    resolver: MxResolver,
    relay_host: Option<String>,
    port: u16,
    helo_name: String,
}

impl MxTransport {
    pub fn new(relay_host: Option<String>, port: u16, helo_name: impl Into<String>) -> Self {
        Self {
            resolver: MxResolver::new(),
            relay_host,
            port,
            helo_name: helo_name.into(),
        }
    }

    async fn servers_for(&self, domain: &str) -> Result<Vec<String>, DeliveryError> {
        if let Some(relay) = &self.relay_host {
            let relay = if relay.contains(':') {
                relay.clone()
            } else {
                format!("{}:{}", relay, self.port)
            };
            return Ok(vec![relay]);
        }
        self.resolver
            .lookup_mx(domain, self.port)
            .await
            .map_err(|e| DeliveryError::Transient(e.to_string()))
    }
}

#[async_trait]
impl DeliveryTransport for MxTransport {
    async fn deliver(&self, from: &str, to: &str, message: &[u8]) -> Result<(), DeliveryError> {
        let domain = domain_of(to)
            .ok_or_else(|| DeliveryError::Permanent(format!("invalid recipient address {}", to)))?;

        let mut last_error =
            DeliveryError::Transient(format!("no mail servers found for {}", domain));
        for server in self.servers_for(&domain).await? {
            info!("Trying {} for <{}>", server, to);
            match SmtpClient::new(server.clone(), self.helo_name.clone())
                .send_mail(from, to, message)
                .await
            {
                Ok(()) => return Ok(()),
                // A 5xx from any exchanger is authoritative
                Err(e @ DeliveryError::Permanent(_)) => return Err(e),
                Err(e) => {
                    warn!("Delivery via {} failed: {}", server, e);
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }
}
