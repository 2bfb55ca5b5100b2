use crate::config::Config;
use crate::error::{MailError, Result};
use crate::model::{NewQueueEntry, SessionInfo};
use crate::security::auth::decode_plain_auth;
use crate::security::{AuthMechanism, Authenticator};
use crate::server::{Connection, ReadOutcome};
use crate::smtp::commands::SmtpCommand;
use crate::smtp::delivery::{priority_from_headers, LocalDelivery};
use crate::utils::validate_email;
use chrono::Utc;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Maximum number of protocol errors before disconnecting
const MAX_ERRORS: usize = 10;

const REPLY_OK: &str = "250 2.0.0 OK";
const REPLY_BAD_SEQUENCE: &str = "503 5.5.1 Bad sequence of commands";
const REPLY_UNRECOGNIZED: &str = "500 5.5.2 Syntax error, command unrecognized";
const REPLY_BAD_ARGUMENTS: &str = "501 5.5.4 Syntax error in parameters or arguments";
const REPLY_LOCAL_ERROR: &str = "451 4.3.0 Requested action aborted: local error in processing";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmtpState {
    Connected,
    Greeted,
    HasSender,
    HasRecipients,
}

/// Sender and recipients of the transaction in progress
#[derive(Debug, Default)]
struct Envelope {
    /// Empty for the null sender
    from: String,
    recipients: Vec<String>,
}

enum Flow {
    Continue,
    Quit,
}

/// One SMTP connection
///
/// Owned by its connection task; every command is dispatched from
/// [`SmtpSession::run`] against the current [`SmtpState`].
pub struct SmtpSession {
    config: Arc<Config>,
    delivery: Arc<LocalDelivery>,
    authenticator: Authenticator,
    state: SmtpState,
    envelope: Envelope,
    info: SessionInfo,
    error_count: usize,
}

impl SmtpSession {
    pub fn new(
        config: Arc<Config>,
        delivery: Arc<LocalDelivery>,
        authenticator: Authenticator,
        peer: Option<SocketAddr>,
    ) -> Self {
        Self {
            config,
            delivery,
            authenticator,
            state: SmtpState::Connected,
            envelope: Envelope::default(),
            info: SessionInfo::new(peer),
            error_count: 0,
        }
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    /// Serve the connection until QUIT, disconnect, timeout or too many errors
    pub async fn run<S>(mut self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut conn = Connection::new(stream, self.config.smtp.idle_timeout());
        conn.write_line(&format!(
            "220 {} ESMTP Service Ready",
            self.config.server.hostname
        ))
        .await?;

        loop {
            if self.error_count >= MAX_ERRORS {
                warn!("Too many errors, disconnecting");
                conn.write_line("421 4.7.0 Too many errors, closing connection")
                    .await?;
                break;
            }

            let line = match conn.read_line().await? {
                ReadOutcome::Line(line) => line,
                ReadOutcome::TooLong => {
                    self.error_count += 1;
                    conn.write_line("500 5.5.2 Line too long").await?;
                    continue;
                }
                ReadOutcome::Closed => {
                    debug!("Client disconnected");
                    break;
                }
                ReadOutcome::TimedOut => {
                    warn!("Idle timeout, disconnecting");
                    conn.write_line(&format!(
                        "421 4.4.2 {} Error: timeout exceeded",
                        self.config.server.hostname
                    ))
                    .await?;
                    break;
                }
            };
            self.info.touch();

            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\r', '\n']);
            if line.get(..4).is_some_and(|verb| verb.eq_ignore_ascii_case("AUTH")) {
                debug!("C: AUTH ...");
            } else {
                debug!("C: {}", line);
            }

            let command = match SmtpCommand::parse(line) {
                Ok(command) => command,
                Err(e) => {
                    debug!("Rejected command: {}", e);
                    self.error_count += 1;
                    conn.write_line(REPLY_BAD_ARGUMENTS).await?;
                    continue;
                }
            };

            if let Flow::Quit = self.dispatch(command, &mut conn).await? {
                break;
            }
        }

        self.info.end();
        info!(
            "SMTP session {} with {} ended",
            self.info.id,
            self.info.peer()
        );
        Ok(())
    }

    async fn dispatch<S>(&mut self, command: SmtpCommand, conn: &mut Connection<S>) -> Result<Flow>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let reply = match command {
            SmtpCommand::Helo(domain) => self.greet(domain, false),
            SmtpCommand::Ehlo(domain) => self.greet(domain, true),
            SmtpCommand::MailFrom { address, size } => self.mail_from(address, size),
            SmtpCommand::RcptTo(address) => self.rcpt_to(address).await,
            SmtpCommand::Data => return self.data(conn).await,
            SmtpCommand::Auth {
                mechanism,
                initial_response,
            } => self.auth(&mechanism, initial_response, conn).await?,
            SmtpCommand::Rset => {
                self.envelope = Envelope::default();
                if self.state != SmtpState::Connected {
                    self.state = SmtpState::Greeted;
                }
                REPLY_OK.to_string()
            }
            SmtpCommand::Noop => REPLY_OK.to_string(),
            SmtpCommand::Help => {
                "214 2.0.0 Commands: HELO EHLO MAIL RCPT DATA RSET NOOP QUIT AUTH HELP".to_string()
            }
            SmtpCommand::Quit => {
                conn.write_line(&format!(
                    "221 2.0.0 {} closing connection",
                    self.config.server.hostname
                ))
                .await?;
                return Ok(Flow::Quit);
            }
            SmtpCommand::Unknown(verb) => {
                debug!("Unknown command: {}", verb);
                self.error_count += 1;
                REPLY_UNRECOGNIZED.to_string()
            }
        };

        conn.write_line(&reply).await?;
        Ok(Flow::Continue)
    }

    fn bad_sequence(&mut self) -> String {
        self.error_count += 1;
        REPLY_BAD_SEQUENCE.to_string()
    }

    fn greet(&mut self, domain: String, extended: bool) -> String {
        info!("{} from {}", if extended { "EHLO" } else { "HELO" }, domain);
        let hostname = &self.config.server.hostname;
        let reply = if extended {
            [
                format!("250-{} Hello {}", hostname, domain),
                format!("250-SIZE {}", self.config.smtp.max_message_size),
                "250-8BITMIME".to_string(),
                format!("250-AUTH {}", AuthMechanism::Plain.as_str()),
                "250 HELP".to_string(),
            ]
            .join("\r\n")
        } else {
            format!("250 {} Hello {}", hostname, domain)
        };

        self.info.hostname = Some(domain);
        self.envelope = Envelope::default();
        self.state = SmtpState::Greeted;
        reply
    }

    fn mail_from(&mut self, address: String, size: Option<usize>) -> String {
        if self.state == SmtpState::Connected {
            return self.bad_sequence();
        }
        if !address.is_empty() && validate_email(&address).is_err() {
            self.error_count += 1;
            return format!("501 5.1.7 Invalid sender address <{}>", address);
        }
        if size.is_some_and(|size| size > self.config.smtp.max_message_size) {
            return "552 5.3.4 Message size exceeds fixed maximum message size".to_string();
        }

        info!("MAIL FROM: <{}>", address);
        self.envelope = Envelope {
            from: address,
            recipients: Vec::new(),
        };
        self.state = SmtpState::HasSender;
        "250 2.1.0 OK".to_string()
    }

    async fn rcpt_to(&mut self, address: String) -> String {
        if !matches!(self.state, SmtpState::HasSender | SmtpState::HasRecipients) {
            return self.bad_sequence();
        }
        if validate_email(&address).is_err() {
            self.error_count += 1;
            return format!("501 5.1.3 Invalid recipient address <{}>", address);
        }
        if self.envelope.recipients.len() >= self.config.smtp.max_recipients {
            warn!("Too many recipients: {}", self.envelope.recipients.len());
            return "452 4.5.3 Too many recipients".to_string();
        }

        if self.delivery.is_local(&address) {
            match self.delivery.user_exists(&address).await {
                Ok(true) => {}
                Ok(false) => {
                    info!("Rejected unknown local recipient {}", address);
                    return format!(
                        "550 5.1.1 <{}>: Recipient address rejected: User unknown",
                        address
                    );
                }
                Err(e) => {
                    error!("User lookup for {} failed: {}", address, e);
                    return REPLY_LOCAL_ERROR.to_string();
                }
            }
        } else if self.config.smtp.require_auth_for_relay && self.info.user.is_none() {
            warn!("Relay to {} denied for unauthenticated session", address);
            return "550 5.7.1 Relay access denied".to_string();
        }

        info!("RCPT TO: <{}>", address);
        self.envelope.recipients.push(address);
        self.state = SmtpState::HasRecipients;
        "250 2.1.5 OK".to_string()
    }

    async fn data<S>(&mut self, conn: &mut Connection<S>) -> Result<Flow>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        if self.state != SmtpState::HasRecipients {
            let reply = self.bad_sequence();
            conn.write_line(&reply).await?;
            return Ok(Flow::Continue);
        }
        conn.write_line("354 Start mail input; end with <CRLF>.<CRLF>")
            .await?;

        let max_size = self.config.smtp.max_message_size;
        let mut body = Vec::new();
        let mut oversized = false;
        loop {
            let line = match conn.read_line_limited(max_size + 2).await? {
                ReadOutcome::Line(line) => line,
                ReadOutcome::TooLong => {
                    oversized = true;
                    continue;
                }
                ReadOutcome::Closed => {
                    warn!("Connection closed during DATA");
                    return Ok(Flow::Quit);
                }
                ReadOutcome::TimedOut => {
                    warn!("Timeout during DATA");
                    conn.write_line(&format!(
                        "421 4.4.2 {} Error: timeout exceeded",
                        self.config.server.hostname
                    ))
                    .await?;
                    return Ok(Flow::Quit);
                }
            };

            if line == b".\r\n" || line == b".\n" {
                break;
            }
            if oversized {
                continue;
            }

            // Transparency: a leading dot was doubled by the client
            let content = if line.starts_with(b".") { &line[1..] } else { &line[..] };
            if body.len() + content.len() > max_size {
                warn!("Message exceeds {} bytes, discarding", max_size);
                oversized = true;
                body = Vec::new();
                continue;
            }
            body.extend_from_slice(content);
        }

        let envelope = std::mem::take(&mut self.envelope);
        self.state = SmtpState::Greeted;

        let reply = if oversized {
            "550 5.3.4 Message too big for system".to_string()
        } else {
            match self.deliver(&envelope, body).await {
                Ok(id) => format!("250 2.0.0 OK: queued as {}", id),
                Err(e) => {
                    error!("Failed to accept message: {}", e);
                    REPLY_LOCAL_ERROR.to_string()
                }
            }
        };
        conn.write_line(&reply).await?;
        Ok(Flow::Continue)
    }

    /// Route the accepted message; returns the transaction id
    ///
    /// Every recipient is attempted. A local recipient whose INBOX append
    /// fails is queued, and the queue retries the append. The call fails
    /// only when some recipient could be neither delivered nor queued, in
    /// which case the client's retry may duplicate the message for the rest.
    async fn deliver(&self, envelope: &Envelope, body: Vec<u8>) -> Result<String> {
        let transaction_id = Uuid::new_v4().simple().to_string();
        let received = format!(
            "Received: from {} ({})\r\n\tby {} with {} id {};\r\n\t{}\r\n",
            self.info.hostname.as_deref().unwrap_or("unknown"),
            self.info.peer(),
            self.config.server.hostname,
            if self.info.user.is_some() { "ESMTPA" } else { "ESMTP" },
            transaction_id,
            Utc::now().to_rfc2822()
        );
        let mut message = received.into_bytes();
        message.extend_from_slice(&body);

        let mut to_queue = Vec::new();
        for recipient in &envelope.recipients {
            if self.delivery.is_local(recipient) {
                match self.delivery.deliver_local(recipient, &message).await {
                    Ok(_) => continue,
                    Err(e) => warn!("Local delivery to {} failed, queueing it: {}", recipient, e),
                }
            }
            to_queue.push(recipient);
        }

        let lost = self.enqueue_all(envelope, &message, &body, to_queue).await;
        if !lost.is_empty() {
            return Err(MailError::Storage(format!(
                "message {} could not be queued for {}",
                transaction_id,
                lost.join(", ")
            )));
        }

        info!(
            "Accepted message {} from <{}> for {} recipient(s), {} bytes",
            transaction_id,
            envelope.from,
            envelope.recipients.len(),
            message.len()
        );
        Ok(transaction_id)
    }

    /// Queue `message` for each recipient; returns those that failed
    async fn enqueue_all<'a>(
        &self,
        envelope: &Envelope,
        message: &[u8],
        body: &[u8],
        recipients: Vec<&'a String>,
    ) -> Vec<&'a str> {
        if recipients.is_empty() {
            return Vec::new();
        }
        let store = self.delivery.store();
        let message_id = match store.store_outbound_message(message).await {
            Ok(id) => id,
            Err(e) => {
                error!("Failed to store outbound message: {}", e);
                return recipients.into_iter().map(String::as_str).collect();
            }
        };

        let priority = priority_from_headers(body);
        let mut lost = Vec::new();
        for recipient in recipients {
            let queued = store
                .enqueue(NewQueueEntry {
                    message_id,
                    from_addr: envelope.from.clone(),
                    to_addr: recipient.clone(),
                    priority,
                    max_attempts: self.config.queue.max_attempts,
                })
                .await;
            match queued {
                Ok(entry) => info!("Queued message for {} as {}", recipient, entry.id),
                Err(e) => {
                    error!("Failed to queue message for {}: {}", recipient, e);
                    lost.push(recipient.as_str());
                }
            }
        }
        lost
    }

    async fn auth<S>(
        &mut self,
        mechanism: &str,
        initial_response: Option<String>,
        conn: &mut Connection<S>,
    ) -> Result<String>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        if self.state != SmtpState::Greeted || self.info.user.is_some() {
            return Ok(self.bad_sequence());
        }
        if AuthMechanism::from_name(mechanism).is_none() {
            return Ok("504 5.5.4 Unrecognized authentication type".to_string());
        }

        let response = match initial_response {
            Some(response) => response,
            None => {
                conn.write_line("334 ").await?;
                match conn.read_line().await? {
                    ReadOutcome::Line(line) => String::from_utf8_lossy(&line).trim().to_string(),
                    ReadOutcome::TooLong => {
                        self.error_count += 1;
                        return Ok("500 5.5.2 Line too long".to_string());
                    }
                    ReadOutcome::Closed | ReadOutcome::TimedOut => {
                        return Err(MailError::SmtpProtocol(
                            "Connection lost during AUTH".to_string(),
                        ));
                    }
                }
            }
        };

        if response == "*" {
            return Ok("501 5.0.0 Authentication cancelled".to_string());
        }
        let (username, password) = match decode_plain_auth(&response) {
            Ok(credentials) => credentials,
            Err(e) => {
                debug!("Bad AUTH PLAIN response: {}", e);
                self.error_count += 1;
                return Ok("501 5.5.2 Cannot decode response".to_string());
            }
        };

        match self.authenticator.authenticate(&username, &password).await? {
            Some(address) => {
                self.info.user = Some(address);
                Ok("235 2.7.0 Authentication successful".to_string())
            }
            None => {
                self.error_count += 1;
                Ok("535 5.7.8 Authentication credentials invalid".to_string())
            }
        }
    }
}
