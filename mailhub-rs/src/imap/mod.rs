//! IMAP4rev1 server (RFC 3501 subset)
//!
//! - [`lexer`]: command tokenizer (atoms, quoted strings, literals, lists)
//! - [`commands`]: command parsing and per-state permissions
//! - [`sequence`]: sequence sets such as `1:4,7,9:*`
//! - [`view`]: the selected mailbox and its sequence numbering
//! - [`fetch`]: FETCH items and response rendering
//! - [`search`]: SEARCH keys and matching
//! - [`session`]: per-connection state machine
//! - [`server`]: connection handler plugged into the acceptor

pub mod commands;
pub mod fetch;
pub mod lexer;
pub mod search;
pub mod sequence;
pub mod server;
pub mod session;
pub mod view;

pub use commands::{ImapCommand, SessionState};
pub use server::ImapServer;
pub use session::ImapSession;
