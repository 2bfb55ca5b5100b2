//! Implicit TLS for the SMTP and IMAP listeners
//!
//! The handshake happens as soon as the TCP connection is accepted; there
//! is no in-band upgrade.

use crate::error::{MailError, Result};
use rustls::ServerConfig;
use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};
use std::fs::File;
use std::io::{BufReader, Seek};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Server-side TLS configuration shared by all connections of a listener
#[derive(Clone)]
pub struct TlsConfig {
    server_config: Arc<ServerConfig>,
}

impl TlsConfig {
    /// Build the listener configuration from a PEM chain and key
    ///
    /// ```no_run
    /// use mailhub_rs::security::TlsConfig;
    ///
    /// # fn example() -> mailhub_rs::Result<()> {
    /// let tls = TlsConfig::from_pem_files("/etc/mailhub/fullchain.pem", "/etc/mailhub/privkey.pem")?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn from_pem_files<P: AsRef<Path>>(cert_path: P, key_path: P) -> Result<Self> {
        let chain = load_chain(cert_path.as_ref())?;
        let key = load_key(key_path.as_ref())?;

        let config = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .map_err(|e| MailError::Tls(format!("{}: {}", cert_path.as_ref().display(), e)))?;

        Ok(Self {
            server_config: Arc::new(config),
        })
    }

    pub fn acceptor(&self) -> tokio_rustls::TlsAcceptor {
        tokio_rustls::TlsAcceptor::from(self.server_config.clone())
    }
}

fn open_pem(path: &Path) -> Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| MailError::Tls(format!("cannot open {}: {}", path.display(), e)))
}

fn load_chain(path: &Path) -> Result<Vec<rustls::Certificate>> {
    let chain = certs(&mut open_pem(path)?)
        .map_err(|e| MailError::Tls(format!("bad certificate PEM in {}: {}", path.display(), e)))?;
    if chain.is_empty() {
        return Err(MailError::Tls(format!("no certificate in {}", path.display())));
    }
    debug!("{} certificate(s) in chain from {}", chain.len(), path.display());
    Ok(chain.into_iter().map(rustls::Certificate).collect())
}

/// First PKCS#8 key, else first PKCS#1 RSA key
fn load_key(path: &Path) -> Result<rustls::PrivateKey> {
    let bad_key = |e: std::io::Error| MailError::Tls(format!("bad key PEM in {}: {}", path.display(), e));

    let mut reader = open_pem(path)?;
    let mut keys = pkcs8_private_keys(&mut reader).map_err(bad_key)?;
    if keys.is_empty() {
        reader.rewind()?;
        keys = rsa_private_keys(&mut reader).map_err(bad_key)?;
    }
    keys.into_iter()
        .next()
        .map(rustls::PrivateKey)
        .ok_or_else(|| MailError::Tls(format!("no private key in {}", path.display())))
}

/// Write a self-signed certificate and key for `domain`
///
/// Development use only.
pub fn generate_self_signed_cert(domain: &str, cert_output: &Path, key_output: &Path) -> Result<()> {
    use rcgen::{CertificateParams, DistinguishedName, DnType, SanType};

    info!("Generating self-signed certificate for {}", domain);

    let mut params = CertificateParams::default();
    let mut name = DistinguishedName::new();
    name.push(DnType::CommonName, domain);
    params.distinguished_name = name;
    params.subject_alt_names = vec![
        SanType::DnsName(domain.to_string()),
        SanType::DnsName(format!("*.{}", domain)),
    ];

    let cert = rcgen::Certificate::from_params(params)
        .map_err(|e| MailError::Tls(format!("Failed to generate certificate: {}", e)))?;
    let pem = cert
        .serialize_pem()
        .map_err(|e| MailError::Tls(format!("Failed to serialize certificate: {}", e)))?;

    std::fs::write(cert_output, pem)?;
    std::fs::write(key_output, cert.serialize_private_key_pem())?;

    info!(
        "Self-signed certificate written to {} and {}",
        cert_output.display(),
        key_output.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_cert_loads() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");

        generate_self_signed_cert("test.local", &cert_path, &key_path).unwrap();

        let cert_content = std::fs::read_to_string(&cert_path).unwrap();
        let key_content = std::fs::read_to_string(&key_path).unwrap();
        assert!(cert_content.contains("BEGIN CERTIFICATE"));
        assert!(key_content.contains("BEGIN PRIVATE KEY"));

        assert!(TlsConfig::from_pem_files(&cert_path, &key_path).is_ok());
    }

    #[test]
    fn test_missing_files_are_tls_errors() {
        let result = TlsConfig::from_pem_files("/nonexistent/cert.pem", "/nonexistent/key.pem");
        assert!(matches!(result, Err(MailError::Tls(_))));
    }

    #[test]
    fn test_key_file_without_key() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        generate_self_signed_cert("test.local", &cert_path, &key_path).unwrap();
        std::fs::write(&key_path, "not a key").unwrap();

        let result = TlsConfig::from_pem_files(&cert_path, &key_path);
        assert!(matches!(result, Err(MailError::Tls(_))));
    }
}
