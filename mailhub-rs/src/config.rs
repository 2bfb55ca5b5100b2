use crate::error::{MailError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub smtp: SmtpConfig,
    pub imap: ImapConfig,
    pub queue: QueueConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Primary mail domain, also used to qualify bare IMAP login names
    pub domain: String,
    pub hostname: String,
    /// Additional domains whose recipients are delivered locally
    pub local_domains: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SmtpConfig {
    pub listen_addr: String,
    pub enable_tls: bool,
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,
    pub max_message_size: usize,
    pub max_recipients: usize,
    pub idle_timeout_secs: u64,
    /// Reject non-local recipients unless the client authenticated
    pub require_auth_for_relay: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ImapConfig {
    pub listen_addr: String,
    pub enable_tls: bool,
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueConfig {
    pub enabled: bool,
    pub batch_size: usize,
    pub poll_interval_secs: u64,
    pub max_attempts: u32,
    pub retry_base_delay_secs: u64,
    pub max_retry_delay_secs: u64,
    pub delivery_timeout_secs: u64,
    pub max_concurrent_deliveries: usize,
    /// Send everything through this host instead of looking up MX records
    pub relay_host: Option<String>,
    pub smtp_port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    /// `memory://` or a sqlx SQLite URL such as `sqlite://mail.db`
    pub database_url: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// `pretty`, `compact` or `json`
    pub format: String,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| MailError::Config(e.to_string()))?;

        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| MailError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make a server unusable
    pub fn validate(&self) -> Result<()> {
        if self.server.domain.trim().is_empty() {
            return Err(MailError::Config("server.domain must not be empty".to_string()));
        }
        if self.smtp.max_message_size == 0 {
            return Err(MailError::Config("smtp.max_message_size must be positive".to_string()));
        }
        if self.queue.max_attempts == 0 {
            return Err(MailError::Config("queue.max_attempts must be at least 1".to_string()));
        }
        if self.queue.batch_size == 0 || self.queue.max_concurrent_deliveries == 0 {
            return Err(MailError::Config(
                "queue.batch_size and queue.max_concurrent_deliveries must be positive".to_string(),
            ));
        }
        for (name, enabled, cert, key) in [
            ("smtp", self.smtp.enable_tls, &self.smtp.tls_cert_path, &self.smtp.tls_key_path),
            ("imap", self.imap.enable_tls, &self.imap.tls_cert_path, &self.imap.tls_key_path),
        ] {
            if enabled && (cert.is_none() || key.is_none()) {
                return Err(MailError::Config(format!(
                    "{}.enable_tls requires tls_cert_path and tls_key_path",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Every domain this server accepts mail for, lowercased
    pub fn local_domains(&self) -> Vec<String> {
        let mut domains = vec![self.server.domain.to_lowercase()];
        for domain in &self.server.local_domains {
            let domain = domain.to_lowercase();
            if !domains.contains(&domain) {
                domains.push(domain);
            }
        }
        domains
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            domain: "localhost".to_string(),
            hostname: "mail.localhost".to_string(),
            local_domains: Vec::new(),
        }
    }
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:2525".to_string(),
            enable_tls: false,
            tls_cert_path: None,
            tls_key_path: None,
            max_message_size: 10 * 1024 * 1024, // 10MB
            max_recipients: 100,
            idle_timeout_secs: 300,
            require_auth_for_relay: false,
        }
    }
}

impl SmtpConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl Default for ImapConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:1993".to_string(),
            enable_tls: false,
            tls_cert_path: None,
            tls_key_path: None,
            idle_timeout_secs: 30 * 60,
        }
    }
}

impl ImapConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: 10,
            poll_interval_secs: 30,
            max_attempts: 5,
            retry_base_delay_secs: 120,
            max_retry_delay_secs: 24 * 60 * 60,
            delivery_timeout_secs: 300,
            max_concurrent_deliveries: 4,
            relay_host: None,
            smtp_port: 25,
        }
    }
}

impl QueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_secs(self.retry_base_delay_secs)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_secs(self.max_retry_delay_secs)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_secs(self.delivery_timeout_secs)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://mail.db".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.queue.max_attempts, 5);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = Config::from_toml(
            r#"
            [server]
            domain = "example.org"
            local_domains = ["Example.NET"]

            [queue]
            max_attempts = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.server.domain, "example.org");
        assert_eq!(config.server.hostname, "mail.localhost");
        assert_eq!(config.queue.max_attempts, 3);
        assert_eq!(config.queue.batch_size, 10);
        assert_eq!(config.local_domains(), vec!["example.org", "example.net"]);
    }

    #[test]
    fn test_tls_requires_cert_paths() {
        let result = Config::from_toml(
            r#"
            [imap]
            enable_tls = true
            "#,
        );
        assert!(matches!(result, Err(MailError::Config(_))));
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let mut config = Config::default();
        config.queue.max_attempts = 0;
        assert!(config.validate().is_err());
    }
}
