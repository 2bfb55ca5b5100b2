//! Security module
//!
//! - [`auth`]: password hashing and credential checks (SMTP PLAIN, IMAP LOGIN)
//! - [`tls`]: implicit TLS configuration

pub mod auth;
pub mod tls;

pub use auth::{AuthMechanism, Authenticator};
pub use tls::TlsConfig;
