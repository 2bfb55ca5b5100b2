//! Mail storage
//!
//! Every persistent read and write of the protocol engines and the queue
//! processor goes through [`MailStore`]. Implementations are responsible for
//! serializing mutations of a single mailbox (UID allocation, flag updates,
//! expunge) and for making queue claims atomic.
//!
//! - [`memory`]: in-process store, used by tests and `memory://` URLs
//! - [`sqlite`]: SQLite store built on sqlx

#[cfg(test)]
pub(crate) mod flaky;
pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::Result;
use crate::model::{
    FlagUpdate, Flags, Mailbox, MessageMeta, NewQueueEntry, QueueEntry, QueueStatus, Uid, User,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Storage contract consumed by the SMTP and IMAP engines and the queue
#[async_trait]
pub trait MailStore: Send + Sync {
    // Users

    /// Create a user together with its INBOX
    async fn create_user(&self, address: &str, password_hash: &str) -> Result<User>;

    async fn find_user(&self, address: &str) -> Result<Option<User>>;

    // Mailboxes

    /// Mailboxes of `owner`, sorted by name
    async fn list_mailboxes(&self, owner: &str) -> Result<Vec<Mailbox>>;

    async fn get_mailbox(&self, owner: &str, name: &str) -> Result<Option<Mailbox>>;

    /// Create `name`, plus any missing superior mailboxes
    async fn create_mailbox(&self, owner: &str, name: &str) -> Result<Mailbox>;

    /// Fails if the mailbox holds messages or has children
    async fn delete_mailbox(&self, owner: &str, name: &str) -> Result<()>;

    /// Rename `from` and all of its children; fails if `to` exists
    async fn rename_mailbox(&self, owner: &str, from: &str, to: &str) -> Result<()>;

    // Messages

    /// Append a message, atomically allocating its UID
    async fn append_message(
        &self,
        owner: &str,
        mailbox: &str,
        raw: &[u8],
        flags: Flags,
        internal_date: DateTime<Utc>,
    ) -> Result<MessageMeta>;

    /// Message metadata ordered by ascending UID
    async fn list_messages(&self, owner: &str, mailbox: &str) -> Result<Vec<MessageMeta>>;

    async fn message_body(&self, owner: &str, mailbox: &str, uid: Uid) -> Result<Option<Vec<u8>>>;

    /// Update the flags of `uids` as one serialized mailbox operation
    ///
    /// Returns the new flags of every UID that still exists, ascending.
    async fn store_flags(
        &self,
        owner: &str,
        mailbox: &str,
        uids: &[Uid],
        update: FlagUpdate,
        flags: Flags,
    ) -> Result<Vec<(Uid, Flags)>>;

    /// Remove every `\Deleted` message; returns the removed UIDs ascending
    async fn expunge(&self, owner: &str, mailbox: &str) -> Result<Vec<Uid>>;

    /// Drop `\Recent` from every message of the mailbox
    async fn clear_recent(&self, owner: &str, mailbox: &str) -> Result<()>;

    // Outbound messages and queue

    async fn store_outbound_message(&self, raw: &[u8]) -> Result<Uuid>;

    async fn outbound_message(&self, id: Uuid) -> Result<Option<Vec<u8>>>;

    async fn enqueue(&self, entry: NewQueueEntry) -> Result<QueueEntry>;

    async fn get_queue_entry(&self, id: Uuid) -> Result<Option<QueueEntry>>;

    /// Entries with the given status (all entries when `None`), oldest first
    async fn list_queue(&self, status: Option<QueueStatus>) -> Result<Vec<QueueEntry>>;

    /// Claim up to `limit` due entries
    ///
    /// Selection and the transition to `processing` (with `attempts`
    /// incremented and `last_attempt` set) happen as one atomic step, so an
    /// entry is never handed out twice.
    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<QueueEntry>>;

    /// Claim one specific entry regardless of its schedule, if claimable
    async fn claim_entry(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<QueueEntry>>;

    async fn mark_sent(&self, id: Uuid, at: DateTime<Utc>) -> Result<()>;

    async fn mark_deferred(&self, id: Uuid, error: &str, next_attempt: DateTime<Utc>)
        -> Result<()>;

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<()>;

    async fn mark_bounced(&self, id: Uuid, error: &str) -> Result<()>;

    /// Move a deferred entry to `queued`, due now; returns whether it moved
    async fn requeue(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool>;

    /// Return entries left in `processing` by a previous run to `deferred`
    async fn release_stale_claims(&self, now: DateTime<Utc>) -> Result<usize>;
}

/// Open the store named by `database_url`
///
/// `memory://` yields a [`MemoryStore`]; anything else is handed to sqlx.
pub async fn open_store(database_url: &str) -> Result<Arc<dyn MailStore>> {
    if database_url.starts_with("memory:") {
        info!("Using in-memory mail store");
        Ok(Arc::new(MemoryStore::new()))
    } else {
        info!("Using SQLite mail store at {}", database_url);
        Ok(Arc::new(SqliteStore::connect(database_url).await?))
    }
}

/// Next UID-validity value: strictly greater than `last`, seeded from the clock
pub(crate) fn next_uid_validity(last: u32, now: DateTime<Utc>) -> u32 {
    let clock = u32::try_from(now.timestamp()).unwrap_or(u32::MAX);
    clock.max(last.saturating_add(1))
}
