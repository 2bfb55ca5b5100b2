use thiserror::Error;

#[derive(Error, Debug)]
pub enum MailError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SMTP protocol error: {0}")]
    SmtpProtocol(String),

    #[error("IMAP protocol error: {0}")]
    ImapProtocol(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid email address: {0}")]
    InvalidEmail(String),

    #[error("DNS lookup failed: {0}")]
    DnsLookup(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Mailbox is not empty: {0}")]
    MailboxNotEmpty(String),

    #[error("Delivery failed: {0}")]
    Delivery(#[from] DeliveryError),
}

/// Outcome of a failed outbound delivery attempt
///
/// Transient failures are retried by the queue processor, permanent ones
/// bounce immediately.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("temporary failure: {0}")]
    Transient(String),

    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl DeliveryError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, DeliveryError::Permanent(_))
    }
}

pub type Result<T> = std::result::Result<T, MailError>;
