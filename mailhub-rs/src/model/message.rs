use crate::model::Flags;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Per-mailbox message identifier, never reused within a UID-validity epoch
pub type Uid = u32;

/// Message metadata as seen in a mailbox listing
///
/// The sequence number is deliberately absent: it is derived from the
/// position of `uid` in the current mailbox view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageMeta {
    /// Stable identifier, independent of mailbox and UID
    pub id: Uuid,
    pub uid: Uid,
    pub flags: Flags,
    pub size: u64,
    pub internal_date: DateTime<Utc>,
    pub modseq: u64,
}

impl MessageMeta {
    pub fn has_flag(&self, flag: Flags) -> bool {
        self.flags.contains(flag)
    }
}

/// How STORE combines the requested flags with the existing ones
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagUpdate {
    /// +FLAGS
    Add,
    /// -FLAGS
    Remove,
    /// FLAGS
    Replace,
}

impl FlagUpdate {
    /// Apply to `current`; `\Recent` is server-managed and always preserved
    pub fn apply(&self, current: Flags, requested: Flags) -> Flags {
        let requested = requested & Flags::PERMANENT;
        match self {
            FlagUpdate::Add => current | requested,
            FlagUpdate::Remove => current - requested,
            FlagUpdate::Replace => requested | (current & Flags::RECENT),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_update_apply() {
        let current = Flags::SEEN | Flags::RECENT;
        assert_eq!(
            FlagUpdate::Add.apply(current, Flags::DELETED),
            Flags::SEEN | Flags::RECENT | Flags::DELETED
        );
        assert_eq!(FlagUpdate::Remove.apply(current, Flags::SEEN), Flags::RECENT);
        assert_eq!(
            FlagUpdate::Replace.apply(current, Flags::FLAGGED),
            Flags::FLAGGED | Flags::RECENT
        );
    }

    #[test]
    fn test_clients_cannot_set_recent() {
        assert_eq!(FlagUpdate::Add.apply(Flags::empty(), Flags::RECENT), Flags::empty());
    }
}
