//! Domain types shared by the protocol engines and the store
//!
//! - [`flags`]: message flag vocabulary
//! - [`mailbox`]: mailbox metadata and naming rules
//! - [`message`]: message metadata and flag updates
//! - [`queue`]: outbound queue entries
//! - [`session`]: per-connection session bookkeeping

pub mod flags;
pub mod mailbox;
pub mod message;
pub mod queue;
pub mod session;

pub use flags::Flags;
pub use mailbox::{Mailbox, HIERARCHY_DELIMITER, INBOX};
pub use message::{FlagUpdate, MessageMeta, Uid};
pub use queue::{NewQueueEntry, QueueEntry, QueueStatus};
pub use session::SessionInfo;

use chrono::{DateTime, Utc};

/// A mail account; the address doubles as the login name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub address: String,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}
