use crate::error::{MailError, Result};

pub const INBOX: &str = "INBOX";
pub const HIERARCHY_DELIMITER: char = '/';

/// Mailbox metadata together with its current counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mailbox {
    pub owner: String,
    pub name: String,
    pub selectable: bool,
    pub uid_validity: u32,
    pub uid_next: u32,
    pub highest_modseq: u64,
    pub message_count: u32,
    pub recent_count: u32,
    pub unseen_count: u32,
}

impl Mailbox {
    pub fn parent(&self) -> Option<&str> {
        self.name
            .rfind(HIERARCHY_DELIMITER)
            .map(|idx| &self.name[..idx])
    }

    pub fn is_inbox(&self) -> bool {
        self.name == INBOX
    }
}

/// Canonical form of a client-supplied mailbox name
///
/// `INBOX` is case-insensitive, every other name is kept as given. A
/// trailing delimiter is dropped.
pub fn normalize_mailbox_name(name: &str) -> String {
    let name = name.trim().trim_end_matches(HIERARCHY_DELIMITER);
    if name.eq_ignore_ascii_case(INBOX) {
        INBOX.to_string()
    } else {
        name.to_string()
    }
}

pub fn validate_mailbox_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(MailError::ImapProtocol("Mailbox name is empty".to_string()));
    }
    if name.contains(['*', '%', '\r', '\n', '"']) {
        return Err(MailError::ImapProtocol(format!(
            "Invalid character in mailbox name: {}",
            name
        )));
    }
    if name.split(HIERARCHY_DELIMITER).any(|segment| segment.is_empty()) {
        return Err(MailError::ImapProtocol(format!(
            "Empty hierarchy level in mailbox name: {}",
            name
        )));
    }
    Ok(())
}

/// All superior names of `name`, outermost first: `a/b/c` -> `[a, a/b]`
pub fn parent_names(name: &str) -> Vec<String> {
    name.match_indices(HIERARCHY_DELIMITER)
        .map(|(idx, _)| name[..idx].to_string())
        .collect()
}

/// Whether `candidate` is a direct or indirect child of `parent`
pub fn is_descendant(candidate: &str, parent: &str) -> bool {
    candidate.len() > parent.len() + 1
        && candidate.starts_with(parent)
        && candidate[parent.len()..].starts_with(HIERARCHY_DELIMITER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_inbox() {
        assert_eq!(normalize_mailbox_name("inbox"), "INBOX");
        assert_eq!(normalize_mailbox_name("Archive/"), "Archive");
        assert_eq!(normalize_mailbox_name("Sent"), "Sent");
    }

    #[test]
    fn test_validate_mailbox_name() {
        assert!(validate_mailbox_name("Work/2024").is_ok());
        assert!(validate_mailbox_name("").is_err());
        assert!(validate_mailbox_name("a//b").is_err());
        assert!(validate_mailbox_name("wild*").is_err());
    }

    #[test]
    fn test_parent_names() {
        assert_eq!(parent_names("a/b/c"), vec!["a", "a/b"]);
        assert!(parent_names("INBOX").is_empty());
    }

    #[test]
    fn test_is_descendant() {
        assert!(is_descendant("Work/2024", "Work"));
        assert!(is_descendant("Work/2024/Q1", "Work"));
        assert!(!is_descendant("Workshop", "Work"));
        assert!(!is_descendant("Work", "Work"));
    }
}
