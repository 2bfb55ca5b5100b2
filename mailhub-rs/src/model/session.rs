use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use uuid::Uuid;

/// Bookkeeping common to SMTP and IMAP sessions
///
/// Owned by the connection task; never shared.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: Uuid,
    pub client_addr: Option<SocketAddr>,
    /// HELO/EHLO argument (SMTP only)
    pub hostname: Option<String>,
    pub user: Option<String>,
    /// Selected mailbox (IMAP only)
    pub mailbox: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl SessionInfo {
    pub fn new(client_addr: Option<SocketAddr>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            client_addr,
            hostname: None,
            user: None,
            mailbox: None,
            started_at: now,
            last_activity: now,
            ended_at: None,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    pub fn end(&mut self) {
        self.ended_at.get_or_insert_with(Utc::now);
    }

    pub fn peer(&self) -> String {
        self.client_addr
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }
}
