use crate::error::{MailError, Result};

/// Basic mailbox address validation
///
/// Dotless domains such as `localhost` are accepted.
pub fn validate_email(email: &str) -> Result<()> {
    if email.is_empty() {
        return Err(MailError::InvalidEmail("Email is empty".to_string()));
    }

    let Some((local, domain)) = email.split_once('@') else {
        return Err(MailError::InvalidEmail(format!("Email must contain @: {}", email)));
    };

    if local.is_empty() || domain.is_empty() {
        return Err(MailError::InvalidEmail(format!(
            "Email parts cannot be empty: {}",
            email
        )));
    }

    if domain.contains('@') {
        return Err(MailError::InvalidEmail(format!("Invalid email format: {}", email)));
    }

    if email
        .chars()
        .any(|c| c.is_whitespace() || c.is_control() || matches!(c, '<' | '>' | ',' | ';'))
    {
        return Err(MailError::InvalidEmail(format!(
            "Invalid character in address: {}",
            email
        )));
    }

    if domain.starts_with('.') || domain.ends_with('.') || domain.contains("..") {
        return Err(MailError::InvalidEmail(format!("Invalid domain: {}", domain)));
    }

    Ok(())
}

/// Domain part of an address, lowercased
pub fn domain_of(address: &str) -> Option<String> {
    address
        .rsplit_once('@')
        .map(|(_, domain)| domain.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_email() {
        assert!(validate_email("test@example.com").is_ok());
        assert!(validate_email("user.name@example.co.uk").is_ok());
        assert!(validate_email("bob@localhost").is_ok());
    }

    #[test]
    fn test_invalid_email() {
        assert!(validate_email("").is_err());
        assert!(validate_email("test").is_err());
        assert!(validate_email("test@").is_err());
        assert!(validate_email("@example.com").is_err());
        assert!(validate_email("a@b@example.com").is_err());
        assert!(validate_email("a b@example.com").is_err());
        assert!(validate_email("a@example..com").is_err());
    }

    #[test]
    fn test_domain_of() {
        assert_eq!(domain_of("a@Example.COM"), Some("example.com".to_string()));
        assert_eq!(domain_of("nobody"), None);
    }
}
