//! Password authentication
//!
//! Credentials are checked against the Argon2 hashes kept in the mail
//! store. Used by SMTP `AUTH PLAIN` and IMAP `LOGIN`.

use crate::error::{MailError, Result};
use crate::store::MailStore;
use crate::utils::email::validate_email;
use crate::model::User;
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// SASL mechanisms offered over SMTP
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMechanism {
    /// RFC 4616
    Plain,
}

impl AuthMechanism {
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PLAIN" => Some(Self::Plain),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
        }
    }
}

/// Hash a password with Argon2 and a random salt
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let password_hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| MailError::Config(format!("Failed to hash password: {}", e)))?;
    Ok(password_hash.to_string())
}

/// Decode a PLAIN response: base64 of `authzid\0authcid\0password`
pub fn decode_plain_auth(auth_data: &str) -> Result<(String, String)> {
    let decoded = BASE64
        .decode(auth_data.trim())
        .map_err(|e| MailError::SmtpProtocol(format!("Invalid base64: {}", e)))?;

    let parts: Vec<&str> = std::str::from_utf8(&decoded)
        .map_err(|e| MailError::SmtpProtocol(format!("Invalid UTF-8: {}", e)))?
        .split('\0')
        .collect();

    match parts.as_slice() {
        [_authzid, username, password] if !username.is_empty() => {
            Ok((username.to_string(), password.to_string()))
        }
        _ => Err(MailError::SmtpProtocol(
            "Invalid PLAIN auth format".to_string(),
        )),
    }
}

/// Verifies credentials against the store
#[derive(Clone)]
pub struct Authenticator {
    store: Arc<dyn MailStore>,
    domain: String,
}

impl Authenticator {
    /// `domain` qualifies bare user names such as `bob`
    pub fn new(store: Arc<dyn MailStore>, domain: impl Into<String>) -> Self {
        Self {
            store,
            domain: domain.into(),
        }
    }

    /// Full address for a login name
    pub fn qualify(&self, username: &str) -> String {
        if username.contains('@') {
            username.to_ascii_lowercase()
        } else {
            format!("{}@{}", username, self.domain).to_ascii_lowercase()
        }
    }

    /// Create an account and its INBOX
    pub async fn add_user(&self, address: &str, password: &str) -> Result<User> {
        validate_email(address)?;
        let address = address.to_ascii_lowercase();
        let password_hash = hash_password(password)?;
        let user = self.store.create_user(&address, &password_hash).await?;
        info!("User added: {}", address);
        Ok(user)
    }

    /// Check a username and password
    ///
    /// Returns the canonical address on success. Unknown users and wrong
    /// passwords are indistinguishable to the caller.
    pub async fn authenticate(&self, username: &str, password: &str) -> Result<Option<String>> {
        let address = self.qualify(username);
        debug!("Authentication attempt for {}", address);

        let Some(user) = self.store.find_user(&address).await? else {
            warn!("Authentication failed: user not found: {}", address);
            return Ok(None);
        };

        let verified = PasswordHash::new(&user.password_hash)
            .map(|parsed| {
                Argon2::default()
                    .verify_password(password.as_bytes(), &parsed)
                    .is_ok()
            })
            .unwrap_or(false);

        if verified {
            info!("Authentication successful for {}", address);
            Ok(Some(user.address))
        } else {
            warn!("Authentication failed: invalid password for {}", address);
            Ok(None)
        }
    }
}
