//! The selected mailbox as one session sees it
//!
//! Sequence numbers are never stored: a message's sequence number is its
//! 1-based position in the UID-ordered `messages` list.

use crate::imap::sequence::SequenceSet;
use crate::model::{Flags, Mailbox, MessageMeta, Uid};

#[derive(Debug, Clone)]
pub struct MailboxView {
    pub name: String,
    pub read_only: bool,
    pub uid_validity: u32,
    pub uid_next: u32,
    messages: Vec<MessageMeta>,
}

/// What changed when the view caught up with the store
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SyncChanges {
    /// Adjusted sequence numbers, in emission order
    pub expunged: Vec<u32>,
    pub exists_changed: bool,
}

impl MailboxView {
    /// `messages` must be ordered by ascending UID
    pub fn new(mailbox: &Mailbox, messages: Vec<MessageMeta>, read_only: bool) -> Self {
        Self {
            name: mailbox.name.clone(),
            read_only,
            uid_validity: mailbox.uid_validity,
            uid_next: mailbox.uid_next,
            messages,
        }
    }

    pub fn exists(&self) -> u32 {
        self.messages.len() as u32
    }

    pub fn recent(&self) -> u32 {
        self.messages
            .iter()
            .filter(|m| m.has_flag(Flags::RECENT))
            .count() as u32
    }

    /// Sequence number of the first message without `\Seen`
    pub fn first_unseen(&self) -> Option<u32> {
        self.messages
            .iter()
            .position(|m| !m.has_flag(Flags::SEEN))
            .map(|idx| idx as u32 + 1)
    }

    pub fn messages(&self) -> &[MessageMeta] {
        &self.messages
    }

    pub fn get(&self, seq: u32) -> Option<&MessageMeta> {
        self.messages.get((seq as usize).checked_sub(1)?)
    }

    pub fn max_uid(&self) -> Uid {
        self.messages.last().map(|m| m.uid).unwrap_or(0)
    }

    /// Sequence numbers named by `set`, ascending
    pub fn resolve(&self, set: &SequenceSet) -> Vec<u32> {
        set.resolve(self.exists())
    }

    pub fn uids_of(&self, seqs: &[u32]) -> Vec<Uid> {
        seqs.iter()
            .filter_map(|seq| self.get(*seq).map(|m| m.uid))
            .collect()
    }

    /// Record flags returned by the store; `\Recent` stays session-scoped
    pub fn set_flags(&mut self, uid: Uid, flags: Flags) {
        if let Ok(idx) = self.messages.binary_search_by_key(&uid, |m| m.uid) {
            let message = &mut self.messages[idx];
            let recent = message.flags & Flags::RECENT;
            message.flags = (flags - Flags::RECENT) | recent;
        }
    }

    /// Remove `removed` (ascending UIDs) and report the sequence numbers
    ///
    /// Each number is the message's position at the moment it is removed,
    /// so later numbers already account for earlier removals.
    pub fn apply_expunge(&mut self, removed: &[Uid]) -> Vec<u32> {
        let mut reported = Vec::with_capacity(removed.len());
        for uid in removed {
            if let Ok(idx) = self.messages.binary_search_by_key(uid, |m| m.uid) {
                self.messages.remove(idx);
                reported.push(idx as u32 + 1);
            }
        }
        reported
    }

    /// Catch up with the store's current message list
    ///
    /// Messages gone from the store are expunged from the view, new ones are
    /// appended and flags of the rest are refreshed.
    pub fn sync(&mut self, latest: Vec<MessageMeta>, uid_next: u32) -> SyncChanges {
        let before = self.exists();

        let gone: Vec<Uid> = self
            .messages
            .iter()
            .map(|m| m.uid)
            .filter(|uid| latest.binary_search_by_key(uid, |m| m.uid).is_err())
            .collect();
        let expunged = self.apply_expunge(&gone);

        let known_max = self.max_uid();
        for message in latest {
            if message.uid > known_max {
                self.messages.push(message);
            } else {
                self.set_flags(message.uid, message.flags);
            }
        }
        self.uid_next = self.uid_next.max(uid_next);

        SyncChanges {
            exists_changed: !expunged.is_empty() || self.exists() != before,
            expunged,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn meta(uid: Uid, flags: Flags) -> MessageMeta {
        MessageMeta {
            id: Uuid::new_v4(),
            uid,
            flags,
            size: 10,
            internal_date: Utc::now(),
            modseq: uid as u64,
        }
    }

    fn mailbox() -> Mailbox {
        Mailbox {
            owner: "b@local.test".to_string(),
            name: "INBOX".to_string(),
            selectable: true,
            uid_validity: 7,
            uid_next: 9,
            highest_modseq: 8,
            message_count: 4,
            recent_count: 0,
            unseen_count: 0,
        }
    }

    fn view(uids: &[Uid]) -> MailboxView {
        let messages = uids.iter().map(|uid| meta(*uid, Flags::empty())).collect();
        MailboxView::new(&mailbox(), messages, false)
    }

    #[test]
    fn test_sequence_numbers_follow_uid_order() {
        let view = view(&[3, 5, 8]);
        assert_eq!(view.get(2).unwrap().uid, 5);
        assert_eq!(view.get(3).unwrap().uid, 8);
        assert!(view.get(0).is_none());
        assert_eq!(view.max_uid(), 8);
    }

    #[test]
    fn test_expunge_numbers_shift_down() {
        // Messages 2 and 4 deleted: report 2, then 3
        let mut view = view(&[10, 11, 12, 13]);
        assert_eq!(view.apply_expunge(&[11, 13]), vec![2, 3]);
        assert_eq!(view.exists(), 2);
        assert_eq!(view.get(2).unwrap().uid, 12);
    }

    #[test]
    fn test_expunge_ignores_unknown_uids() {
        let mut view = view(&[1, 2]);
        assert_eq!(view.apply_expunge(&[5]), Vec::<u32>::new());
        assert_eq!(view.exists(), 2);
    }

    #[test]
    fn test_set_flags_keeps_session_recent() {
        let mut view = MailboxView::new(&mailbox(), vec![meta(1, Flags::RECENT)], false);
        view.set_flags(1, Flags::SEEN);
        assert_eq!(view.get(1).unwrap().flags, Flags::SEEN | Flags::RECENT);
        assert_eq!(view.first_unseen(), None);
        assert_eq!(view.recent(), 1);
    }

    #[test]
    fn test_sync_reports_external_changes() {
        let mut view = view(&[1, 2, 3]);
        let latest = vec![meta(1, Flags::SEEN), meta(3, Flags::empty()), meta(4, Flags::RECENT)];
        let changes = view.sync(latest, 5);
        assert_eq!(changes.expunged, vec![2]);
        assert!(changes.exists_changed);
        assert_eq!(view.exists(), 3);
        assert_eq!(view.get(1).unwrap().flags, Flags::SEEN);
        assert_eq!(view.get(3).unwrap().uid, 4);
        assert_eq!(view.uid_next, 9);

        let current = view.messages().to_vec();
        assert_eq!(view.sync(current, 5), SyncChanges::default());
    }
}
