//! Message flags
//!
//! The controlled vocabulary shared by IMAP and local delivery. Stored as a
//! bit set so a whole flag list fits in one integer column.

use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Flags: u8 {
        const SEEN = 1 << 0;
        const ANSWERED = 1 << 1;
        const FLAGGED = 1 << 2;
        const DELETED = 1 << 3;
        const DRAFT = 1 << 4;
        /// Session-scoped, set on delivery and cleared by SELECT
        const RECENT = 1 << 5;
    }
}

/// IMAP names, in the order they are rendered
const NAMES: [(Flags, &str); 6] = [
    (Flags::SEEN, "\\Seen"),
    (Flags::ANSWERED, "\\Answered"),
    (Flags::FLAGGED, "\\Flagged"),
    (Flags::DELETED, "\\Deleted"),
    (Flags::DRAFT, "\\Draft"),
    (Flags::RECENT, "\\Recent"),
];

impl Flags {
    /// Flags a client may change with STORE
    pub const PERMANENT: Flags = Flags::SEEN
        .union(Flags::ANSWERED)
        .union(Flags::FLAGGED)
        .union(Flags::DELETED)
        .union(Flags::DRAFT);

    /// Parse a single IMAP flag name such as `\Seen` (case-insensitive)
    pub fn from_imap_name(name: &str) -> Option<Flags> {
        NAMES
            .iter()
            .find(|(_, n)| n.eq_ignore_ascii_case(name))
            .map(|(flag, _)| *flag)
    }

    pub fn imap_names(&self) -> Vec<&'static str> {
        NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }

    /// Render as a parenthesized IMAP list, e.g. `(\Seen \Deleted)`
    pub fn to_imap_list(&self) -> String {
        format!("({})", self.imap_names().join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_imap_name_is_case_insensitive() {
        assert_eq!(Flags::from_imap_name("\\seen"), Some(Flags::SEEN));
        assert_eq!(Flags::from_imap_name("\\DELETED"), Some(Flags::DELETED));
        assert_eq!(Flags::from_imap_name("$Junk"), None);
    }

    #[test]
    fn test_imap_list_rendering_order() {
        let flags = Flags::DELETED | Flags::SEEN;
        assert_eq!(flags.to_imap_list(), "(\\Seen \\Deleted)");
        assert_eq!(Flags::empty().to_imap_list(), "()");
    }

    #[test]
    fn test_permanent_excludes_recent() {
        assert!(!Flags::PERMANENT.contains(Flags::RECENT));
        assert!(Flags::PERMANENT.contains(Flags::DRAFT));
    }
}
