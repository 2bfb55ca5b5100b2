//! Non-delivery reports

use crate::error::Result;
use crate::model::{NewQueueEntry, QueueEntry};
use crate::smtp::LocalDelivery;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Plain-text "Undelivered Mail Returned to Sender" message
pub fn build_bounce(hostname: &str, entry: &QueueEntry, reason: &str, original: Option<&[u8]>) -> Vec<u8> {
    let mut message = format!(
        "From: Mail Delivery System <MAILER-DAEMON@{host}>\r\n\
         To: <{to}>\r\n\
         Subject: Undelivered Mail Returned to Sender\r\n\
         Date: {date}\r\n\
         Message-ID: <{id}@{host}>\r\n\
         Auto-Submitted: auto-replied\r\n\
         MIME-Version: 1.0\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         \r\n\
         This is the mail system at host {host}.\r\n\
         \r\n\
         Your message could not be delivered to one or more recipients.\r\n\
         \r\n\
         <{rcpt}>: {reason}\r\n\
         Attempts: {attempts}\r\n",
        host = hostname,
        to = entry.from_addr,
        date = Utc::now().to_rfc2822(),
        id = Uuid::new_v4().simple(),
        rcpt = entry.to_addr,
        reason = reason,
        attempts = entry.attempts,
    );

    if let Some(original) = original {
        message.push_str("\r\n--- Original message headers ---\r\n\r\n");
        let text = String::from_utf8_lossy(original);
        for line in text.lines() {
            if line.is_empty() {
                break;
            }
            message.push_str(line);
            message.push_str("\r\n");
        }
    }
    message.into_bytes()
}

/// Returns failed messages to their senders
pub struct BounceSender {
    delivery: Arc<LocalDelivery>,
    hostname: String,
    max_attempts: u32,
}

impl BounceSender {
    pub fn new(delivery: Arc<LocalDelivery>, hostname: impl Into<String>, max_attempts: u32) -> Self {
        Self {
            delivery,
            hostname: hostname.into(),
            max_attempts,
        }
    }

    /// Notify the sender of `entry`; bounces themselves are never bounced
    pub async fn send(&self, entry: &QueueEntry, reason: &str) -> Result<()> {
        if entry.from_addr.is_empty() {
            debug!("Not bouncing {}: null sender", entry.id);
            return Ok(());
        }

        let store = self.delivery.store();
        let original = store.outbound_message(entry.message_id).await?;
        let bounce = build_bounce(&self.hostname, entry, reason, original.as_deref());

        if self.delivery.is_local(&entry.from_addr) {
            if !self.delivery.user_exists(&entry.from_addr).await? {
                warn!("Dropping bounce for unknown local sender {}", entry.from_addr);
                return Ok(());
            }
            self.delivery.deliver_local(&entry.from_addr, &bounce).await?;
        } else {
            let message_id = store.store_outbound_message(&bounce).await?;
            store
                .enqueue(NewQueueEntry {
                    message_id,
                    from_addr: String::new(),
                    to_addr: entry.from_addr.clone(),
                    priority: 0,
                    max_attempts: self.max_attempts,
                })
                .await?;
        }

        info!("Bounce for {} sent to {}", entry.id, entry.from_addr);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::INBOX;
    use crate::store::{MailStore, MemoryStore};

    fn entry(from: &str, message_id: Uuid) -> QueueEntry {
        QueueEntry::new(
            NewQueueEntry {
                message_id,
                from_addr: from.to_string(),
                to_addr: "carol@external.test".to_string(),
                priority: 0,
                max_attempts: 3,
            },
            Utc::now(),
        )
    }

    async fn setup() -> (Arc<dyn MailStore>, BounceSender, Uuid) {
        let store: Arc<dyn MailStore> = Arc::new(MemoryStore::new());
        store.create_user("bob@local.test", "h").await.unwrap();
        let message_id = store
            .store_outbound_message(b"Subject: party\r\nFrom: bob@local.test\r\n\r\nsecret body")
            .await
            .unwrap();
        let delivery = Arc::new(LocalDelivery::new(store.clone(), vec!["local.test".to_string()]));
        (store, BounceSender::new(delivery, "mx.local.test", 3), message_id)
    }

    #[test]
    fn test_bounce_contains_reason_and_headers_only() {
        let entry = entry("bob@local.test", Uuid::new_v4());
        let bounce = build_bounce(
            "mx.local.test",
            &entry,
            "550 no such user",
            Some(b"Subject: party\r\n\r\nsecret body"),
        );
        let text = String::from_utf8(bounce).unwrap();
        assert!(text.starts_with("From: Mail Delivery System <MAILER-DAEMON@mx.local.test>\r\n"));
        assert!(text.contains("<carol@external.test>: 550 no such user"));
        assert!(text.contains("Subject: party"));
        assert!(!text.contains("secret body"));
    }

    #[tokio::test]
    async fn test_local_sender_gets_bounce_in_inbox() {
        let (store, bounces, message_id) = setup().await;
        bounces
            .send(&entry("bob@local.test", message_id), "timeout")
            .await
            .unwrap();
        assert_eq!(store.list_messages("bob@local.test", INBOX).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_remote_sender_gets_queued_bounce() {
        let (store, bounces, message_id) = setup().await;
        bounces
            .send(&entry("alice@remote.test", message_id), "timeout")
            .await
            .unwrap();
        let queued = store.list_queue(None).await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].from_addr, "");
        assert_eq!(queued[0].to_addr, "alice@remote.test");
    }

    #[tokio::test]
    async fn test_null_sender_is_not_bounced() {
        let (store, bounces, message_id) = setup().await;
        bounces.send(&entry("", message_id), "timeout").await.unwrap();
        assert!(store.list_queue(None).await.unwrap().is_empty());
    }
}
