//! Recipient routing shared by the SMTP session and bounce generation

use crate::error::Result;
use crate::model::{Flags, MessageMeta, INBOX};
use crate::store::MailStore;
use crate::utils::domain_of;
use chrono::Utc;
use std::sync::Arc;
use tracing::info;

/// Decides whether an address is hosted here and delivers to its INBOX
pub struct LocalDelivery {
    store: Arc<dyn MailStore>,
    local_domains: Vec<String>,
}

impl LocalDelivery {
    /// `local_domains` must already be lowercased
    pub fn new(store: Arc<dyn MailStore>, local_domains: Vec<String>) -> Self {
        Self {
            store,
            local_domains,
        }
    }

    pub fn store(&self) -> &Arc<dyn MailStore> {
        &self.store
    }

    pub fn is_local(&self, address: &str) -> bool {
        domain_of(address).is_some_and(|domain| self.local_domains.contains(&domain))
    }

    pub async fn user_exists(&self, address: &str) -> Result<bool> {
        Ok(self
            .store
            .find_user(&address.to_ascii_lowercase())
            .await?
            .is_some())
    }

    /// Append to the recipient's INBOX, flagged `\Recent`
    pub async fn deliver_local(&self, recipient: &str, raw: &[u8]) -> Result<MessageMeta> {
        let owner = recipient.to_ascii_lowercase();
        let meta = self
            .store
            .append_message(&owner, INBOX, raw, Flags::RECENT, Utc::now())
            .await?;
        info!("Delivered message to {} (UID {})", owner, meta.uid);
        Ok(meta)
    }
}

/// Queue priority derived from the `X-Priority` header
///
/// 1-2 are high (1), 4-5 low (-1), anything else normal (0).
pub fn priority_from_headers(raw: &[u8]) -> i32 {
    let text = String::from_utf8_lossy(raw);
    for line in text.lines() {
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if !name.trim().eq_ignore_ascii_case("X-Priority") {
            continue;
        }
        return match value.trim().chars().next() {
            Some('1') | Some('2') => 1,
            Some('4') | Some('5') => -1,
            _ => 0,
        };
    }
    0
}
