//! Shared harness: both servers on ephemeral ports over one store

#![allow(dead_code)]

use mailhub_rs::config::Config;
use mailhub_rs::imap::ImapServer;
use mailhub_rs::security::auth::hash_password;
use mailhub_rs::server::Acceptor;
use mailhub_rs::smtp::SmtpServer;
use mailhub_rs::store::{MailStore, MemoryStore};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

pub struct TestServers {
    pub smtp: SocketAddr,
    pub imap: SocketAddr,
    pub store: Arc<dyn MailStore>,
    pub shutdown: CancellationToken,
}

impl Drop for TestServers {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.server.domain = "local.test".to_string();
    config.server.hostname = "mx.local.test".to_string();
    config.smtp.max_message_size = 1024;
    config.smtp.require_auth_for_relay = false;
    config
}

pub async fn start_servers(config: Config) -> TestServers {
    start_servers_with_store(config, Arc::new(MemoryStore::new())).await
}

pub async fn start_servers_with_store(config: Config, store: Arc<dyn MailStore>) -> TestServers {
    store
        .create_user("bob@local.test", &hash_password("secret").unwrap())
        .await
        .unwrap();

    let config = Arc::new(config);
    let shutdown = CancellationToken::new();

    let smtp = Acceptor::bind("127.0.0.1:0", None, Duration::from_secs(5))
        .await
        .unwrap();
    let smtp_addr = smtp.local_addr().unwrap();
    let smtp_server = Arc::new(SmtpServer::new(config.clone(), store.clone()));
    tokio::spawn(smtp.run(smtp_server, shutdown.clone()));

    let imap = Acceptor::bind("127.0.0.1:0", None, Duration::from_secs(5))
        .await
        .unwrap();
    let imap_addr = imap.local_addr().unwrap();
    let imap_server = Arc::new(ImapServer::new(config, store.clone()));
    tokio::spawn(imap.run(imap_server, shutdown.clone()));

    TestServers {
        smtp: smtp_addr,
        imap: imap_addr,
        store,
        shutdown,
    }
}

/// Line-oriented client for either protocol
pub struct Client {
    reader: BufReader<TcpStream>,
}

impl Client {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        Self {
            reader: BufReader::new(stream),
        }
    }

    pub async fn send(&mut self, line: &str) {
        self.reader
            .get_mut()
            .write_all(format!("{}\r\n", line).as_bytes())
            .await
            .unwrap();
    }

    pub async fn line(&mut self) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).await.unwrap();
        line
    }

    /// Full SMTP reply, continuation lines included
    pub async fn smtp_reply(&mut self) -> String {
        let mut reply = String::new();
        loop {
            let line = self.line().await;
            assert!(!line.is_empty(), "connection closed");
            reply.push_str(&line);
            if line.len() < 4 || line.as_bytes()[3] != b'-' {
                return reply;
            }
        }
    }

    pub async fn smtp(&mut self, line: &str) -> String {
        self.send(line).await;
        self.smtp_reply().await
    }

    /// IMAP responses up to and including the tagged completion
    pub async fn imap(&mut self, tag: &str, command: &str) -> String {
        self.send(&format!("{} {}", tag, command)).await;
        let mut response = String::new();
        loop {
            let line = self.line().await;
            assert!(!line.is_empty(), "connection closed");
            response.push_str(&line);
            if line.starts_with(&format!("{} ", tag)) {
                return response;
            }
        }
    }
}

/// Send one message over SMTP and return the final DATA reply
pub async fn send_mail(addr: SocketAddr, from: &str, to: &[&str], body: &str) -> String {
    let mut client = Client::connect(addr).await;
    assert!(client.smtp_reply().await.starts_with("220 "));
    assert!(client.smtp("EHLO client.test").await.starts_with("250"));
    assert!(client.smtp(&format!("MAIL FROM:<{}>", from)).await.starts_with("250"));
    for rcpt in to {
        let reply = client.smtp(&format!("RCPT TO:<{}>", rcpt)).await;
        assert!(reply.starts_with("250"), "{}", reply);
    }
    assert!(client.smtp("DATA").await.starts_with("354"));
    for line in body.lines() {
        client.send(line).await;
    }
    let reply = client.smtp(".").await;
    client.smtp("QUIT").await;
    reply
}

pub async fn imap_login(addr: SocketAddr) -> Client {
    let mut client = Client::connect(addr).await;
    assert!(client.line().await.starts_with("* OK"));
    let reply = client.imap("l", "LOGIN bob secret").await;
    assert!(reply.ends_with("l OK LOGIN completed\r\n"), "{}", reply);
    client
}
