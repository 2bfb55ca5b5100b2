//! In-process mail store
//!
//! All state lives behind one mutex; no method holds the lock across an
//! `.await`, so every operation is atomic with respect to the others.

use crate::error::{MailError, Result};
use crate::model::mailbox::{is_descendant, parent_names, validate_mailbox_name};
use crate::model::{
    FlagUpdate, Flags, Mailbox, MessageMeta, NewQueueEntry, QueueEntry, QueueStatus, Uid, User,
    INBOX,
};
use crate::store::{next_uid_validity, MailStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

struct StoredMessage {
    meta: MessageMeta,
    raw: Vec<u8>,
}

struct MailboxState {
    uid_validity: u32,
    uid_next: Uid,
    highest_modseq: u64,
    messages: BTreeMap<Uid, StoredMessage>,
}

impl MailboxState {
    fn new(uid_validity: u32) -> Self {
        Self {
            uid_validity,
            uid_next: 1,
            highest_modseq: 0,
            messages: BTreeMap::new(),
        }
    }

    fn snapshot(&self, owner: &str, name: &str) -> Mailbox {
        let mut recent = 0;
        let mut unseen = 0;
        for message in self.messages.values() {
            if message.meta.has_flag(Flags::RECENT) {
                recent += 1;
            }
            if !message.meta.has_flag(Flags::SEEN) {
                unseen += 1;
            }
        }
        Mailbox {
            owner: owner.to_string(),
            name: name.to_string(),
            selectable: true,
            uid_validity: self.uid_validity,
            uid_next: self.uid_next,
            highest_modseq: self.highest_modseq,
            message_count: self.messages.len() as u32,
            recent_count: recent,
            unseen_count: unseen,
        }
    }
}

#[derive(Default)]
struct Inner {
    users: HashMap<String, User>,
    /// Keyed by (owner, name)
    mailboxes: BTreeMap<(String, String), MailboxState>,
    outbound: HashMap<Uuid, Vec<u8>>,
    /// Insertion order doubles as creation order
    queue: Vec<QueueEntry>,
    last_uid_validity: u32,
}

impl Inner {
    fn mailbox_mut(&mut self, owner: &str, name: &str) -> Result<&mut MailboxState> {
        self.mailboxes
            .get_mut(&(owner.to_string(), name.to_string()))
            .ok_or_else(|| MailError::NotFound(format!("mailbox {}", name)))
    }

    fn insert_mailbox(&mut self, owner: &str, name: &str) {
        self.last_uid_validity = next_uid_validity(self.last_uid_validity, Utc::now());
        self.mailboxes.insert(
            (owner.to_string(), name.to_string()),
            MailboxState::new(self.last_uid_validity),
        );
    }

    fn queue_entry_mut(&mut self, id: Uuid) -> Result<&mut QueueEntry> {
        self.queue
            .iter_mut()
            .find(|entry| entry.id == id)
            .ok_or_else(|| MailError::NotFound(format!("queue entry {}", id)))
    }
}

fn claim(entry: &mut QueueEntry, now: DateTime<Utc>) -> QueueEntry {
    entry.status = QueueStatus::Processing;
    entry.attempts += 1;
    entry.last_attempt = Some(now);
    entry.clone()
}

/// Store keeping everything in process memory
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| MailError::Storage("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl MailStore for MemoryStore {
    async fn create_user(&self, address: &str, password_hash: &str) -> Result<User> {
        let mut inner = self.lock()?;
        if inner.users.contains_key(address) {
            return Err(MailError::AlreadyExists(format!("user {}", address)));
        }
        let user = User {
            address: address.to_string(),
            password_hash: password_hash.to_string(),
            created_at: Utc::now(),
        };
        inner.users.insert(address.to_string(), user.clone());
        inner.insert_mailbox(address, INBOX);
        Ok(user)
    }

    async fn find_user(&self, address: &str) -> Result<Option<User>> {
        Ok(self.lock()?.users.get(address).cloned())
    }

    async fn list_mailboxes(&self, owner: &str) -> Result<Vec<Mailbox>> {
        let inner = self.lock()?;
        Ok(inner
            .mailboxes
            .iter()
            .filter(|((o, _), _)| o == owner)
            .map(|((o, name), state)| state.snapshot(o, name))
            .collect())
    }

    async fn get_mailbox(&self, owner: &str, name: &str) -> Result<Option<Mailbox>> {
        let inner = self.lock()?;
        Ok(inner
            .mailboxes
            .get(&(owner.to_string(), name.to_string()))
            .map(|state| state.snapshot(owner, name)))
    }

    async fn create_mailbox(&self, owner: &str, name: &str) -> Result<Mailbox> {
        validate_mailbox_name(name)?;
        let mut inner = self.lock()?;
        if inner
            .mailboxes
            .contains_key(&(owner.to_string(), name.to_string()))
        {
            return Err(MailError::AlreadyExists(format!("mailbox {}", name)));
        }
        for parent in parent_names(name) {
            if !inner.mailboxes.contains_key(&(owner.to_string(), parent.clone())) {
                inner.insert_mailbox(owner, &parent);
            }
        }
        inner.insert_mailbox(owner, name);
        let state = inner.mailbox_mut(owner, name)?;
        Ok(state.snapshot(owner, name))
    }

    async fn delete_mailbox(&self, owner: &str, name: &str) -> Result<()> {
        if name == INBOX {
            return Err(MailError::Storage("INBOX cannot be deleted".to_string()));
        }
        let mut inner = self.lock()?;
        let has_children = inner
            .mailboxes
            .keys()
            .any(|(o, n)| o == owner && is_descendant(n, name));
        let state = inner.mailbox_mut(owner, name)?;
        if !state.messages.is_empty() {
            return Err(MailError::MailboxNotEmpty(name.to_string()));
        }
        if has_children {
            return Err(MailError::Storage(format!(
                "mailbox {} has inferior mailboxes",
                name
            )));
        }
        inner
            .mailboxes
            .remove(&(owner.to_string(), name.to_string()));
        Ok(())
    }

    async fn rename_mailbox(&self, owner: &str, from: &str, to: &str) -> Result<()> {
        if from == INBOX {
            return Err(MailError::Storage("INBOX cannot be renamed".to_string()));
        }
        validate_mailbox_name(to)?;
        let mut inner = self.lock()?;
        if !inner
            .mailboxes
            .contains_key(&(owner.to_string(), from.to_string()))
        {
            return Err(MailError::NotFound(format!("mailbox {}", from)));
        }
        if inner
            .mailboxes
            .contains_key(&(owner.to_string(), to.to_string()))
        {
            return Err(MailError::AlreadyExists(format!("mailbox {}", to)));
        }

        let moving: Vec<String> = inner
            .mailboxes
            .keys()
            .filter(|(o, n)| o == owner && (n == from || is_descendant(n, from)))
            .map(|(_, n)| n.clone())
            .collect();
        for old_name in moving {
            if let Some(state) = inner
                .mailboxes
                .remove(&(owner.to_string(), old_name.clone()))
            {
                let new_name = format!("{}{}", to, &old_name[from.len()..]);
                inner.mailboxes.insert((owner.to_string(), new_name), state);
            }
        }
        for parent in parent_names(to) {
            if !inner.mailboxes.contains_key(&(owner.to_string(), parent.clone())) {
                inner.insert_mailbox(owner, &parent);
            }
        }
        Ok(())
    }

    async fn append_message(
        &self,
        owner: &str,
        mailbox: &str,
        raw: &[u8],
        flags: Flags,
        internal_date: DateTime<Utc>,
    ) -> Result<MessageMeta> {
        let mut inner = self.lock()?;
        let state = inner.mailbox_mut(owner, mailbox)?;
        let uid = state.uid_next;
        state.uid_next += 1;
        state.highest_modseq += 1;
        let meta = MessageMeta {
            id: Uuid::new_v4(),
            uid,
            flags,
            size: raw.len() as u64,
            internal_date,
            modseq: state.highest_modseq,
        };
        state.messages.insert(
            uid,
            StoredMessage {
                meta: meta.clone(),
                raw: raw.to_vec(),
            },
        );
        Ok(meta)
    }

    async fn list_messages(&self, owner: &str, mailbox: &str) -> Result<Vec<MessageMeta>> {
        let mut inner = self.lock()?;
        let state = inner.mailbox_mut(owner, mailbox)?;
        Ok(state.messages.values().map(|m| m.meta.clone()).collect())
    }

    async fn message_body(&self, owner: &str, mailbox: &str, uid: Uid) -> Result<Option<Vec<u8>>> {
        let mut inner = self.lock()?;
        let state = inner.mailbox_mut(owner, mailbox)?;
        Ok(state.messages.get(&uid).map(|m| m.raw.clone()))
    }

    async fn store_flags(
        &self,
        owner: &str,
        mailbox: &str,
        uids: &[Uid],
        update: FlagUpdate,
        flags: Flags,
    ) -> Result<Vec<(Uid, Flags)>> {
        let mut inner = self.lock()?;
        let state = inner.mailbox_mut(owner, mailbox)?;
        let mut sorted = uids.to_vec();
        sorted.sort_unstable();
        sorted.dedup();

        let mut updated = Vec::new();
        for uid in sorted {
            let Some(message) = state.messages.get_mut(&uid) else {
                continue;
            };
            let new_flags = update.apply(message.meta.flags, flags);
            if new_flags != message.meta.flags {
                state.highest_modseq += 1;
                message.meta.flags = new_flags;
                message.meta.modseq = state.highest_modseq;
            }
            updated.push((uid, new_flags));
        }
        Ok(updated)
    }

    async fn expunge(&self, owner: &str, mailbox: &str) -> Result<Vec<Uid>> {
        let mut inner = self.lock()?;
        let state = inner.mailbox_mut(owner, mailbox)?;
        let removed: Vec<Uid> = state
            .messages
            .values()
            .filter(|m| m.meta.has_flag(Flags::DELETED))
            .map(|m| m.meta.uid)
            .collect();
        for uid in &removed {
            state.messages.remove(uid);
        }
        if !removed.is_empty() {
            state.highest_modseq += 1;
        }
        Ok(removed)
    }

    async fn clear_recent(&self, owner: &str, mailbox: &str) -> Result<()> {
        let mut inner = self.lock()?;
        let state = inner.mailbox_mut(owner, mailbox)?;
        for message in state.messages.values_mut() {
            message.meta.flags.remove(Flags::RECENT);
        }
        Ok(())
    }

    async fn store_outbound_message(&self, raw: &[u8]) -> Result<Uuid> {
        let id = Uuid::new_v4();
        self.lock()?.outbound.insert(id, raw.to_vec());
        Ok(id)
    }

    async fn outbound_message(&self, id: Uuid) -> Result<Option<Vec<u8>>> {
        Ok(self.lock()?.outbound.get(&id).cloned())
    }

    async fn enqueue(&self, entry: NewQueueEntry) -> Result<QueueEntry> {
        let entry = QueueEntry::new(entry, Utc::now());
        self.lock()?.queue.push(entry.clone());
        Ok(entry)
    }

    async fn get_queue_entry(&self, id: Uuid) -> Result<Option<QueueEntry>> {
        Ok(self.lock()?.queue.iter().find(|e| e.id == id).cloned())
    }

    async fn list_queue(&self, status: Option<QueueStatus>) -> Result<Vec<QueueEntry>> {
        Ok(self
            .lock()?
            .queue
            .iter()
            .filter(|e| status.map_or(true, |s| e.status == s))
            .cloned()
            .collect())
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<QueueEntry>> {
        let mut inner = self.lock()?;
        let mut due: Vec<usize> = inner
            .queue
            .iter()
            .enumerate()
            .filter(|(_, e)| e.status.is_claimable() && e.next_attempt <= now)
            .map(|(idx, _)| idx)
            .collect();
        due.sort_by(|a, b| {
            let (a, b) = (&inner.queue[*a], &inner.queue[*b]);
            b.priority
                .cmp(&a.priority)
                .then(a.next_attempt.cmp(&b.next_attempt))
        });
        due.truncate(limit);

        Ok(due
            .into_iter()
            .map(|idx| claim(&mut inner.queue[idx], now))
            .collect())
    }

    async fn claim_entry(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<QueueEntry>> {
        let mut inner = self.lock()?;
        Ok(inner
            .queue
            .iter_mut()
            .find(|e| e.id == id && e.status.is_claimable())
            .map(|entry| claim(entry, now)))
    }

    async fn mark_sent(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.lock()?;
        let entry = inner.queue_entry_mut(id)?;
        entry.status = QueueStatus::Sent;
        entry.sent_at = Some(at);
        Ok(())
    }

    async fn mark_deferred(
        &self,
        id: Uuid,
        error: &str,
        next_attempt: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.lock()?;
        let entry = inner.queue_entry_mut(id)?;
        entry.status = QueueStatus::Deferred;
        entry.last_error = Some(error.to_string());
        entry.next_attempt = next_attempt;
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<()> {
        let mut inner = self.lock()?;
        let entry = inner.queue_entry_mut(id)?;
        entry.status = QueueStatus::Failed;
        entry.last_error = Some(error.to_string());
        Ok(())
    }

    async fn mark_bounced(&self, id: Uuid, error: &str) -> Result<()> {
        let mut inner = self.lock()?;
        let entry = inner.queue_entry_mut(id)?;
        entry.status = QueueStatus::Bounced;
        entry.last_error = Some(error.to_string());
        Ok(())
    }

    async fn requeue(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let mut inner = self.lock()?;
        let entry = inner.queue_entry_mut(id)?;
        if entry.status != QueueStatus::Deferred {
            return Ok(false);
        }
        entry.status = QueueStatus::Queued;
        entry.next_attempt = now;
        Ok(true)
    }

    async fn release_stale_claims(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut inner = self.lock()?;
        let mut released = 0;
        for entry in inner
            .queue
            .iter_mut()
            .filter(|e| e.status == QueueStatus::Processing)
        {
            entry.status = QueueStatus::Deferred;
            entry.next_attempt = now;
            released += 1;
        }
        Ok(released)
    }
}
