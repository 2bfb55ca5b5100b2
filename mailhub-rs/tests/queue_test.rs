//! Outbound queue retries, terminal failure and bounce delivery

mod common;

use async_trait::async_trait;
use common::{send_mail, start_servers, test_config};
use mailhub_rs::error::DeliveryError;
use mailhub_rs::model::{QueueStatus, INBOX};
use mailhub_rs::queue::{DeliveryTransport, QueueProcessor};
use mailhub_rs::smtp::LocalDelivery;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Remote server that always answers with a temporary failure
struct Unreachable {
    calls: AtomicUsize,
}

#[async_trait]
impl DeliveryTransport for Unreachable {
    async fn deliver(&self, _from: &str, _to: &str, _message: &[u8]) -> Result<(), DeliveryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(DeliveryError::Transient("421 4.4.0 try again later".to_string()))
    }
}

async fn run_cycle(processor: &Arc<QueueProcessor>) {
    for handle in processor.run_cycle().await.unwrap() {
        handle.await.unwrap();
    }
}

#[tokio::test]
async fn test_retries_back_off_then_fail_with_bounce() {
    let mut config = test_config();
    config.queue.max_attempts = 3;
    config.queue.retry_base_delay_secs = 60;
    let servers = start_servers(config.clone()).await;

    let message = "From: bob@local.test\r\nTo: carol@remote.test\r\nSubject: Quarterly numbers\r\n\r\nAttached.";
    let reply = send_mail(servers.smtp, "bob@local.test", &["carol@remote.test"], message).await;
    assert!(reply.starts_with("250"), "{}", reply);

    let store = servers.store.clone();
    let transport = Arc::new(Unreachable {
        calls: AtomicUsize::new(0),
    });
    let delivery = Arc::new(LocalDelivery::new(store.clone(), config.local_domains()));
    let processor = Arc::new(QueueProcessor::new(&config, delivery, transport.clone()));

    let id = store.list_queue(None).await.unwrap()[0].id;
    let mut previous_delay = chrono::Duration::zero();
    for attempt in 1..=2u32 {
        run_cycle(&processor).await;
        let entry = store.get_queue_entry(id).await.unwrap().unwrap();
        assert_eq!(entry.status, QueueStatus::Deferred);
        assert_eq!(entry.attempts, attempt);
        assert!(entry.last_error.as_deref().unwrap_or_default().contains("try again"));

        let delay = entry.next_attempt - entry.last_attempt.unwrap();
        assert!(delay > previous_delay, "attempt {}: {:?}", attempt, delay);
        previous_delay = delay;

        // Not due yet: nothing is claimed
        run_cycle(&processor).await;
        assert_eq!(transport.calls.load(Ordering::SeqCst), attempt as usize);

        assert!(processor.requeue(id).await.unwrap());
    }

    run_cycle(&processor).await;
    let entry = store.get_queue_entry(id).await.unwrap().unwrap();
    assert_eq!(entry.status, QueueStatus::Failed);
    assert_eq!(entry.attempts, 3);
    assert_eq!(transport.calls.load(Ordering::SeqCst), 3);

    // Terminal entries are never retried
    run_cycle(&processor).await;
    assert_eq!(transport.calls.load(Ordering::SeqCst), 3);

    let inbox = store.list_messages("bob@local.test", INBOX).await.unwrap();
    assert_eq!(inbox.len(), 1);
    let bounce = store
        .message_body("bob@local.test", INBOX, inbox[0].uid)
        .await
        .unwrap()
        .unwrap();
    let bounce = String::from_utf8_lossy(&bounce);
    assert!(bounce.contains("Undelivered Mail Returned to Sender"));
    assert!(bounce.contains("carol@remote.test"));
    assert!(bounce.contains("Subject: Quarterly numbers"));
}
