//! SMTP and IMAP driven over real sockets against one shared store

mod common;

use common::{imap_login, send_mail, start_servers, start_servers_with_store, test_config, Client};
use mailhub_rs::model::{Flags, QueueStatus, INBOX};
use mailhub_rs::store::{MailStore, SqliteStore};
use std::sync::Arc;

const MESSAGE: &str = "From: alice@remote.test\r\nTo: bob@local.test\r\nSubject: Hello\r\n\r\nSee you at noon.";

#[tokio::test]
async fn test_smtp_delivery_is_visible_over_imap() {
    let servers = start_servers(test_config()).await;

    let reply = send_mail(servers.smtp, "alice@remote.test", &["bob@local.test"], MESSAGE).await;
    assert!(reply.starts_with("250 2.0.0 OK: queued as "), "{}", reply);

    let mut imap = imap_login(servers.imap).await;
    let response = imap.imap("a1", "SELECT INBOX").await;
    assert!(response.contains("* 1 EXISTS\r\n"), "{}", response);
    assert!(response.contains("* 1 RECENT\r\n"));
    assert!(response.contains("* OK [UNSEEN 1]"));

    let response = imap.imap("a2", "FETCH 1 (FLAGS BODY.PEEK[TEXT])").await;
    assert!(response.contains("FLAGS (\\Recent)"), "{}", response);
    assert!(response.contains("See you at noon."));

    let response = imap.imap("a3", "FETCH 1 ENVELOPE").await;
    assert!(response.contains("\"Hello\""), "{}", response);

    assert!(imap.imap("a4", "LOGOUT").await.contains("* BYE"));
}

#[tokio::test]
async fn test_external_recipient_is_queued() {
    let servers = start_servers(test_config()).await;

    let reply = send_mail(
        servers.smtp,
        "bob@local.test",
        &["carol@remote.test", "bob@local.test"],
        MESSAGE,
    )
    .await;
    assert!(reply.starts_with("250"), "{}", reply);

    let queue = servers.store.list_queue(None).await.unwrap();
    assert_eq!(queue.len(), 1);
    let entry = &queue[0];
    assert_eq!(entry.to_addr, "carol@remote.test");
    assert_eq!(entry.from_addr, "bob@local.test");
    assert_eq!(entry.status, QueueStatus::Pending);
    assert_eq!(entry.attempts, 0);
    assert!(servers
        .store
        .outbound_message(entry.message_id)
        .await
        .unwrap()
        .is_some());

    let inbox = servers.store.list_messages("bob@local.test", INBOX).await.unwrap();
    assert_eq!(inbox.len(), 1);
}

#[tokio::test]
async fn test_rcpt_before_mail_is_rejected() {
    let servers = start_servers(test_config()).await;
    let mut client = Client::connect(servers.smtp).await;
    client.smtp_reply().await;
    client.smtp("EHLO client.test").await;

    assert!(client.smtp("RCPT TO:<bob@local.test>").await.starts_with("503"));
    assert!(client.smtp("DATA").await.starts_with("503"));
    assert!(client.smtp("MAIL FROM:<alice@remote.test>").await.starts_with("250"));
    assert!(client.smtp("RCPT TO:<nobody@local.test>").await.starts_with("550"));
    assert!(client.smtp("RCPT TO:<bob@local.test>").await.starts_with("250"));
    assert!(client.smtp("QUIT").await.starts_with("221"));
}

#[tokio::test]
async fn test_oversized_message_is_rejected() {
    let servers = start_servers(test_config()).await;
    let body = format!("Subject: big\r\n\r\n{}", vec!["x".repeat(78); 30].join("\r\n"));

    let reply = send_mail(servers.smtp, "alice@remote.test", &["bob@local.test"], &body).await;
    assert!(reply.starts_with("550"), "{}", reply);

    let inbox = servers.store.list_messages("bob@local.test", INBOX).await.unwrap();
    assert!(inbox.is_empty());
}

#[tokio::test]
async fn test_imap_message_commands_need_selected_mailbox() {
    let servers = start_servers(test_config()).await;
    send_mail(servers.smtp, "alice@remote.test", &["bob@local.test"], MESSAGE).await;

    let mut imap = imap_login(servers.imap).await;
    for (tag, command) in [("a1", "FETCH 1 FLAGS"), ("a2", "STORE 1 +FLAGS (\\Deleted)"), ("a3", "EXPUNGE")] {
        let response = imap.imap(tag, command).await;
        assert_eq!(response, format!("{} BAD Command not allowed in current state\r\n", tag));
    }

    let messages = servers.store.list_messages("bob@local.test", INBOX).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert!(!messages[0].has_flag(Flags::DELETED));
}

#[tokio::test]
async fn test_expunge_reports_shifting_sequence_numbers() {
    let servers = start_servers(test_config()).await;
    for n in 1..=4 {
        let body = format!("Subject: message {}\r\n\r\nbody {}", n, n);
        send_mail(servers.smtp, "alice@remote.test", &["bob@local.test"], &body).await;
    }

    let mut imap = imap_login(servers.imap).await;
    assert!(imap.imap("a1", "SELECT INBOX").await.contains("* 4 EXISTS\r\n"));
    imap.imap("a2", "STORE 2,4 +FLAGS.SILENT (\\Deleted)").await;

    let response = imap.imap("a3", "EXPUNGE").await;
    assert_eq!(response, "* 2 EXPUNGE\r\n* 3 EXPUNGE\r\na3 OK EXPUNGE completed\r\n");

    let response = imap.imap("a4", "FETCH 1:* UID").await;
    assert_eq!(response, "* 1 FETCH (UID 1)\r\n* 2 FETCH (UID 3)\r\na4 OK FETCH completed\r\n");
}

#[tokio::test]
async fn test_concurrent_deliveries_get_increasing_uids() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("mail.db").display());
    let store: Arc<dyn MailStore> = Arc::new(SqliteStore::connect(&url).await.unwrap());
    let servers = start_servers_with_store(test_config(), store).await;

    let mut tasks = Vec::new();
    for n in 0..8 {
        let addr = servers.smtp;
        tasks.push(tokio::spawn(async move {
            let body = format!("Subject: burst {}\r\n\r\nhello", n);
            send_mail(addr, "alice@remote.test", &["bob@local.test"], &body).await
        }));
    }
    for task in tasks {
        assert!(task.await.unwrap().starts_with("250"));
    }

    let messages = servers.store.list_messages("bob@local.test", INBOX).await.unwrap();
    let uids: Vec<u32> = messages.iter().map(|m| m.uid).collect();
    assert_eq!(uids, (1..=8).collect::<Vec<u32>>());

    let mailbox = servers
        .store
        .get_mailbox("bob@local.test", INBOX)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(mailbox.uid_next, 9);
}
