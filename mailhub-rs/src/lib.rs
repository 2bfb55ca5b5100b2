//! mailhub-rs: SMTP receiver, outbound queue and IMAP server
//!
//! One binary accepts mail over SMTP, delivers it into per-user mailboxes
//! or queues it for remote delivery, and serves those mailboxes over IMAP.
//!
//! # Example
//!
//! ```no_run
//! use mailhub_rs::config::Config;
//! use mailhub_rs::server::Acceptor;
//! use mailhub_rs::smtp::SmtpServer;
//! use mailhub_rs::store::open_store;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Arc::new(Config::default());
//!     let store = open_store(&config.storage.database_url).await?;
//!
//!     let acceptor = Acceptor::bind(&config.smtp.listen_addr, None, config.smtp.idle_timeout()).await?;
//!     let server = Arc::new(SmtpServer::new(config.clone(), store));
//!     acceptor.run(server, CancellationToken::new()).await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`config`]: TOML configuration
//! - [`error`]: error types
//! - [`model`]: flags, mailboxes, messages, queue entries, sessions
//! - [`store`]: storage trait with SQLite and in-memory backends
//! - [`server`]: shared accept loop and line I/O
//! - [`smtp`]: SMTP receiver and client
//! - [`imap`]: IMAP server
//! - [`queue`]: outbound delivery with retry and bounces
//! - [`security`]: authentication and TLS
//! - [`utils`]: address validation and MX lookup

pub mod config;
pub mod error;
pub mod imap;
pub mod model;
pub mod queue;
pub mod security;
pub mod server;
pub mod smtp;
pub mod store;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use error::{MailError, Result};
