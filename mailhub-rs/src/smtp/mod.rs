//! SMTP server and client implementation (RFC 5321)
//!
//! - [`server`]: connection handler plugged into the acceptor
//! - [`session`]: SMTP session state machine
//! - [`commands`]: command parsing
//! - [`delivery`]: local recipient routing
//! - [`client`]: outbound SMTP client

pub mod client;
pub mod commands;
pub mod delivery;
pub mod server;
pub mod session;

pub use client::SmtpClient;
pub use commands::SmtpCommand;
pub use delivery::LocalDelivery;
pub use server::SmtpServer;
pub use session::{SmtpSession, SmtpState};
