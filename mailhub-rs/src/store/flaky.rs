//! Memory store with injectable write failures, for tests

use crate::error::{MailError, Result};
use crate::model::{
    FlagUpdate, Flags, Mailbox, MessageMeta, NewQueueEntry, QueueEntry, QueueStatus, Uid, User,
};
use crate::store::{MailStore, MemoryStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use uuid::Uuid;

/// Operations that can be made to fail
#[derive(Default)]
pub struct Failures {
    pub append: AtomicUsize,
    pub outbound: AtomicUsize,
    pub enqueue: AtomicUsize,
    pub mark_sent: AtomicUsize,
}

/// Delegates to a [`MemoryStore`]; each counter in [`Failures`] makes that
/// many calls of its operation fail with a storage error first
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    pub fail: Failures,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn trip(counter: &AtomicUsize) -> Result<()> {
        let tripped = counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if tripped {
            return Err(MailError::Storage("database is locked".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl MailStore for FlakyStore {
    async fn create_user(&self, address: &str, password_hash: &str) -> Result<User> {
        self.inner.create_user(address, password_hash).await
    }

    async fn find_user(&self, address: &str) -> Result<Option<User>> {
        self.inner.find_user(address).await
    }

    async fn list_mailboxes(&self, owner: &str) -> Result<Vec<Mailbox>> {
        self.inner.list_mailboxes(owner).await
    }

    async fn get_mailbox(&self, owner: &str, name: &str) -> Result<Option<Mailbox>> {
        self.inner.get_mailbox(owner, name).await
    }

    async fn create_mailbox(&self, owner: &str, name: &str) -> Result<Mailbox> {
        self.inner.create_mailbox(owner, name).await
    }

    async fn delete_mailbox(&self, owner: &str, name: &str) -> Result<()> {
        self.inner.delete_mailbox(owner, name).await
    }

    async fn rename_mailbox(&self, owner: &str, from: &str, to: &str) -> Result<()> {
        self.inner.rename_mailbox(owner, from, to).await
    }

    async fn append_message(
        &self,
        owner: &str,
        mailbox: &str,
        raw: &[u8],
        flags: Flags,
        internal_date: DateTime<Utc>,
    ) -> Result<MessageMeta> {
        Self::trip(&self.fail.append)?;
        self.inner
            .append_message(owner, mailbox, raw, flags, internal_date)
            .await
    }

    async fn list_messages(&self, owner: &str, mailbox: &str) -> Result<Vec<MessageMeta>> {
        self.inner.list_messages(owner, mailbox).await
    }

    async fn message_body(&self, owner: &str, mailbox: &str, uid: Uid) -> Result<Option<Vec<u8>>> {
        self.inner.message_body(owner, mailbox, uid).await
    }

    async fn store_flags(
        &self,
        owner: &str,
        mailbox: &str,
        uids: &[Uid],
        update: FlagUpdate,
        flags: Flags,
    ) -> Result<Vec<(Uid, Flags)>> {
        self.inner.store_flags(owner, mailbox, uids, update, flags).await
    }

    async fn expunge(&self, owner: &str, mailbox: &str) -> Result<Vec<Uid>> {
        self.inner.expunge(owner, mailbox).await
    }

    async fn clear_recent(&self, owner: &str, mailbox: &str) -> Result<()> {
        self.inner.clear_recent(owner, mailbox).await
    }

    async fn store_outbound_message(&self, raw: &[u8]) -> Result<Uuid> {
        self.inner.store_outbound_message(raw).await
    }

    async fn outbound_message(&self, id: Uuid) -> Result<Option<Vec<u8>>> {
        Self::trip(&self.fail.outbound)?;
        self.inner.outbound_message(id).await
    }

    async fn enqueue(&self, entry: NewQueueEntry) -> Result<QueueEntry> {
        Self::trip(&self.fail.enqueue)?;
        self.inner.enqueue(entry).await
    }

    async fn get_queue_entry(&self, id: Uuid) -> Result<Option<QueueEntry>> {
        self.inner.get_queue_entry(id).await
    }

    async fn list_queue(&self, status: Option<QueueStatus>) -> Result<Vec<QueueEntry>> {
        self.inner.list_queue(status).await
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<QueueEntry>> {
        self.inner.claim_due(now, limit).await
    }

    async fn claim_entry(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<QueueEntry>> {
        self.inner.claim_entry(id, now).await
    }

    async fn mark_sent(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        Self::trip(&self.fail.mark_sent)?;
        self.inner.mark_sent(id, at).await
    }

    async fn mark_deferred(
        &self,
        id: Uuid,
        error: &str,
        next_attempt: DateTime<Utc>,
    ) -> Result<()> {
        self.inner.mark_deferred(id, error, next_attempt).await
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<()> {
        self.inner.mark_failed(id, error).await
    }

    async fn mark_bounced(&self, id: Uuid, error: &str) -> Result<()> {
        self.inner.mark_bounced(id, error).await
    }

    async fn requeue(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        self.inner.requeue(id, now).await
    }

    async fn release_stale_claims(&self, now: DateTime<Utc>) -> Result<usize> {
        self.inner.release_stale_claims(now).await
    }
}
