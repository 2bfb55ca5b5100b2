//! IMAP session management
//!
//! Handles the IMAP protocol state machine and command execution. Every
//! command is checked against the current [`SessionState`] and then
//! dispatched from a single match in [`ImapSession::dispatch`].

use crate::config::Config;
use crate::error::{MailError, Result};
use crate::imap::commands::{leading_tag, CommandError, ImapCommand, SessionState};
use crate::imap::fetch::{self, nstring, FetchItem};
use crate::imap::search::{SearchContext, SearchKey};
use crate::imap::sequence::SequenceSet;
use crate::imap::view::MailboxView;
use crate::model::mailbox::{is_descendant, normalize_mailbox_name, validate_mailbox_name};
use crate::model::{FlagUpdate, Flags, Mailbox, SessionInfo, HIERARCHY_DELIMITER, INBOX};
use crate::security::Authenticator;
use crate::server::{Connection, ReadOutcome};
use crate::store::MailStore;
use mail_parser::MessageParser;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, info, warn};

const CAPABILITIES: &str = "IMAP4rev1";

/// Longest command line, literals excluded
const MAX_COMMAND_LENGTH: usize = 8 * 1024;

/// Largest synchronizing literal accepted in a command
const MAX_LITERAL_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Ok,
    No,
    Bad,
}

/// Tagged completion of one command
#[derive(Debug)]
struct Completion {
    status: Status,
    text: String,
}

impl Completion {
    fn ok(text: impl Into<String>) -> Self {
        Self {
            status: Status::Ok,
            text: text.into(),
        }
    }

    fn no(text: impl Into<String>) -> Self {
        Self {
            status: Status::No,
            text: text.into(),
        }
    }

    fn bad(text: impl Into<String>) -> Self {
        Self {
            status: Status::Bad,
            text: text.into(),
        }
    }

    fn render(&self, tag: &str) -> String {
        let status = match self.status {
            Status::Ok => "OK",
            Status::No => "NO",
            Status::Bad => "BAD",
        };
        format!("{} {} {}\r\n", tag, status, self.text)
    }
}

enum CommandInput {
    Line(Vec<u8>),
    /// Rejected before parsing; the reply line to send
    Rejected(String),
    Closed,
    TimedOut,
}

/// IMAP session
/// LIST name filter
enum NameMatch {
    Prefix(String),
    Exact(String),
}

impl NameMatch {
    fn matches(&self, name: &str) -> bool {
        match self {
            NameMatch::Prefix(prefix) => name.starts_with(prefix.as_str()),
            NameMatch::Exact(exact) => name == exact,
        }
    }
}

pub struct ImapSession {
    config: Arc<Config>,
    store: Arc<dyn MailStore>,
    authenticator: Authenticator,
    state: SessionState,
    info: SessionInfo,
    /// Mailbox set of the logged-in user
    mailboxes: Vec<Mailbox>,
    view: Option<MailboxView>,
    /// Untagged responses of the command in progress
    out: Vec<u8>,
}

impl ImapSession {
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn MailStore>,
        authenticator: Authenticator,
        peer: Option<SocketAddr>,
    ) -> Self {
        Self {
            config,
            store,
            authenticator,
            state: SessionState::NotAuthenticated,
            info: SessionInfo::new(peer),
            mailboxes: Vec::new(),
            view: None,
            out: Vec::new(),
        }
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Serve the connection until LOGOUT, disconnect or idle timeout
    pub async fn run<S>(mut self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut conn = Connection::new(stream, self.config.imap.idle_timeout());
        conn.write_line(&format!(
            "* OK [CAPABILITY {}] IMAP4rev1 Service Ready",
            CAPABILITIES
        ))
        .await?;

        while self.state != SessionState::Logout {
            let line = match read_command(&mut conn).await? {
                CommandInput::Line(line) => line,
                CommandInput::Rejected(reply) => {
                    conn.write_line(&reply).await?;
                    continue;
                }
                CommandInput::Closed => {
                    debug!("Client disconnected");
                    break;
                }
                CommandInput::TimedOut => {
                    warn!("Idle timeout, disconnecting");
                    conn.write_line("* BYE Autologout; idle for too long").await?;
                    break;
                }
            };
            self.info.touch();

            let response = self.execute(&line).await;
            conn.write_all(&response).await?;
        }

        self.info.end();
        info!(user = ?self.info.user, "IMAP session ended");
        Ok(())
    }

    /// Parse and run one complete command, returning everything to send
    async fn execute(&mut self, line: &[u8]) -> Vec<u8> {
        let (tag, command) = match ImapCommand::parse(line) {
            Ok(parsed) => parsed,
            Err(CommandError { tag, message }) => {
                debug!("Rejected command: {}", message);
                return format!("{} BAD {}\r\n", tag.as_deref().unwrap_or("*"), message)
                    .into_bytes();
            }
        };
        debug!("C: {} {}", tag, command.name());

        if !command.allowed_in(self.state) {
            return Completion::bad("Command not allowed in current state")
                .render(&tag)
                .into_bytes();
        }

        let name = command.name();
        self.out.clear();
        let completion = match self.dispatch(command).await {
            Ok(completion) => completion,
            Err(e) => {
                error!("{} failed: {}", name, e);
                Completion::no(format!("{} failed: internal server error", name))
            }
        };

        let mut response = std::mem::take(&mut self.out);
        response.extend_from_slice(completion.render(&tag).as_bytes());
        response
    }

    async fn dispatch(&mut self, command: ImapCommand) -> Result<Completion> {
        match command {
            ImapCommand::Capability => {
                self.untagged(&format!("CAPABILITY {}", CAPABILITIES));
                Ok(Completion::ok("CAPABILITY completed"))
            }
            ImapCommand::Noop => self.handle_noop().await,
            ImapCommand::Logout => {
                self.untagged("BYE IMAP4rev1 Server logging out");
                self.view = None;
                self.state = SessionState::Logout;
                Ok(Completion::ok("LOGOUT completed"))
            }
            ImapCommand::Login { username, password } => {
                self.handle_login(&username, &password).await
            }
            ImapCommand::Select { mailbox } => self.handle_select(&mailbox, false).await,
            ImapCommand::Examine { mailbox } => self.handle_select(&mailbox, true).await,
            ImapCommand::Create { mailbox } => self.handle_create(&mailbox).await,
            ImapCommand::Delete { mailbox } => self.handle_delete(&mailbox).await,
            ImapCommand::Rename { from, to } => self.handle_rename(&from, &to).await,
            ImapCommand::List { reference, pattern } => {
                self.handle_list(&reference, &pattern).await
            }
            ImapCommand::Fetch { set, items } => self.handle_fetch(&set, &items).await,
            ImapCommand::Search { charset, key } => {
                self.handle_search(charset.as_deref(), &key).await
            }
            ImapCommand::Store {
                set,
                update,
                silent,
                flags,
            } => self.handle_store(&set, update, silent, flags).await,
            ImapCommand::Expunge => self.handle_expunge().await,
            ImapCommand::Close => self.handle_close().await,
        }
    }

    fn untagged(&mut self, line: &str) {
        self.out.extend_from_slice(b"* ");
        self.out.extend_from_slice(line.as_bytes());
        self.out.extend_from_slice(b"\r\n");
    }

    fn user(&self) -> Result<String> {
        self.info
            .user
            .clone()
            .ok_or_else(|| MailError::ImapProtocol("Not authenticated".to_string()))
    }

    /// Leave the selected state, if in it
    fn deselect(&mut self) {
        self.view = None;
        self.info.mailbox = None;
        if self.state == SessionState::Selected {
            self.state = SessionState::Authenticated;
        }
    }

    async fn handle_login(&mut self, username: &str, password: &str) -> Result<Completion> {
        let Some(address) = self.authenticator.authenticate(username, password).await? else {
            return Ok(Completion::no("[AUTHENTICATIONFAILED] Invalid credentials"));
        };

        self.mailboxes = self.store.list_mailboxes(&address).await?;
        info!("IMAP login for {}", address);
        self.info.user = Some(address);
        self.state = SessionState::Authenticated;
        Ok(Completion::ok("LOGIN completed"))
    }

    async fn handle_select(&mut self, name: &str, read_only: bool) -> Result<Completion> {
        let user = self.user()?;
        let name = normalize_mailbox_name(name);

        // Even a failed SELECT leaves no mailbox selected
        self.deselect();
        self.mailboxes = self.store.list_mailboxes(&user).await?;
        let Some(mailbox) = self
            .mailboxes
            .iter()
            .find(|m| m.name == name && m.selectable)
            .cloned()
        else {
            return Ok(Completion::no("Mailbox does not exist"));
        };

        let messages = self.store.list_messages(&user, &name).await?;
        let view = MailboxView::new(&mailbox, messages, read_only);

        self.untagged(&format!("FLAGS {}", Flags::PERMANENT.to_imap_list()));
        self.untagged(&format!(
            "OK [PERMANENTFLAGS {}] Limited",
            Flags::PERMANENT.to_imap_list()
        ));
        self.untagged(&format!("{} EXISTS", view.exists()));
        self.untagged(&format!("{} RECENT", view.recent()));
        if let Some(seq) = view.first_unseen() {
            self.untagged(&format!("OK [UNSEEN {}] First unseen", seq));
        }
        self.untagged(&format!("OK [UIDVALIDITY {}] UIDs valid", view.uid_validity));
        self.untagged(&format!("OK [UIDNEXT {}] Predicted next UID", view.uid_next));

        if !read_only {
            self.store.clear_recent(&user, &name).await?;
        }

        info!("{} {}", if read_only { "EXAMINE" } else { "SELECT" }, name);
        self.info.mailbox = Some(name);
        self.view = Some(view);
        self.state = SessionState::Selected;

        Ok(if read_only {
            Completion::ok("[READ-ONLY] EXAMINE completed")
        } else {
            Completion::ok("[READ-WRITE] SELECT completed")
        })
    }

    async fn handle_list(&mut self, reference: &str, pattern: &str) -> Result<Completion> {
        if pattern.is_empty() {
            self.untagged(&format!("LIST (\\Noselect) \"{}\" \"\"", HIERARCHY_DELIMITER));
            return Ok(Completion::ok("LIST completed"));
        }

        let user = self.user()?;
        self.mailboxes = self.store.list_mailboxes(&user).await?;

        // The reference prefixes the pattern; `*` and exact names are matched
        let wanted = if pattern == "*" {
            NameMatch::Prefix(reference.to_string())
        } else {
            NameMatch::Exact(normalize_mailbox_name(&format!("{}{}", reference, pattern)))
        };

        for mailbox in &self.mailboxes {
            if !wanted.matches(&mailbox.name) {
                continue;
            }
            let mut attributes = Vec::new();
            if !mailbox.selectable {
                attributes.push("\\Noselect");
            }
            let has_children = self
                .mailboxes
                .iter()
                .any(|other| is_descendant(&other.name, &mailbox.name));
            attributes.push(if has_children {
                "\\HasChildren"
            } else {
                "\\HasNoChildren"
            });

            let line = format!(
                "* LIST ({}) \"{}\" {}\r\n",
                attributes.join(" "),
                HIERARCHY_DELIMITER,
                nstring(Some(&mailbox.name))
            );
            self.out.extend_from_slice(line.as_bytes());
        }
        Ok(Completion::ok("LIST completed"))
    }

    async fn handle_fetch(&mut self, set: &SequenceSet, items: &[FetchItem]) -> Result<Completion> {
        let user = self.user()?;
        let Some(view) = self.view.as_mut() else {
            return Ok(Completion::bad("No mailbox selected"));
        };
        let seqs = view.resolve(set);

        // Body items without PEEK mark the message \Seen
        let mut flags_changed = HashSet::new();
        if fetch::sets_seen(items) && !view.read_only {
            let unseen: Vec<_> = seqs
                .iter()
                .filter_map(|seq| view.get(*seq))
                .filter(|m| !m.has_flag(Flags::SEEN))
                .map(|m| m.uid)
                .collect();
            if !unseen.is_empty() {
                let updated = self
                    .store
                    .store_flags(&user, &view.name, &unseen, FlagUpdate::Add, Flags::SEEN)
                    .await?;
                for (uid, flags) in updated {
                    view.set_flags(uid, flags);
                    flags_changed.insert(uid);
                }
            }
        }

        let with_body = fetch::needs_body(items);
        for seq in seqs {
            let Some(meta) = view.get(seq) else {
                continue;
            };
            let raw = if with_body {
                match self.store.message_body(&user, &view.name, meta.uid).await? {
                    Some(raw) => Some(raw),
                    None => continue,
                }
            } else {
                None
            };
            let response = fetch::render_fetch(
                seq,
                meta,
                raw.as_deref(),
                items,
                flags_changed.contains(&meta.uid),
            );
            self.out.extend_from_slice(&response);
        }
        Ok(Completion::ok("FETCH completed"))
    }

    async fn handle_search(&mut self, charset: Option<&str>, key: &SearchKey) -> Result<Completion> {
        if let Some(charset) = charset {
            if !charset.eq_ignore_ascii_case("UTF-8") && !charset.eq_ignore_ascii_case("US-ASCII") {
                return Ok(Completion::no("[BADCHARSET (UTF-8 US-ASCII)] Unsupported charset"));
            }
        }

        let user = self.user()?;
        let Some(view) = self.view.as_ref() else {
            return Ok(Completion::bad("No mailbox selected"));
        };
        debug!("Searching with criteria: {:?}", key);

        let exists = view.exists();
        let max_uid = view.max_uid();
        let needs_content = key.needs_content();
        let mut hits = Vec::new();
        for (idx, meta) in view.messages().iter().enumerate() {
            let raw = if needs_content {
                self.store.message_body(&user, &view.name, meta.uid).await?
            } else {
                None
            };
            let parsed = raw.as_deref().and_then(|raw| MessageParser::default().parse(raw));
            let seq = idx as u32 + 1;
            let ctx = SearchContext {
                seq,
                meta,
                exists,
                max_uid,
                raw: raw.as_deref(),
                message: parsed.as_ref(),
            };
            if key.matches(&ctx) {
                hits.push(seq);
            }
        }

        let mut line = String::from("SEARCH");
        for seq in hits {
            line.push(' ');
            line.push_str(&seq.to_string());
        }
        self.untagged(&line);
        Ok(Completion::ok("SEARCH completed"))
    }

    async fn handle_store(
        &mut self,
        set: &SequenceSet,
        update: FlagUpdate,
        silent: bool,
        flags: Flags,
    ) -> Result<Completion> {
        let user = self.user()?;
        let Some(view) = self.view.as_mut() else {
            return Ok(Completion::bad("No mailbox selected"));
        };
        let seqs = view.resolve(set);
        let uids = view.uids_of(&seqs);
        debug!("Storing {:?} ({:?}) on {} messages", flags, update, uids.len());

        if !uids.is_empty() {
            let updated = self
                .store
                .store_flags(&user, &view.name, &uids, update, flags)
                .await?;
            for (uid, flags) in updated {
                view.set_flags(uid, flags);
            }
        }

        if !silent {
            for seq in seqs {
                if let Some(meta) = view.get(seq) {
                    let line = format!("* {} FETCH (FLAGS {})\r\n", seq, meta.flags.to_imap_list());
                    self.out.extend_from_slice(line.as_bytes());
                }
            }
        }
        Ok(Completion::ok("STORE completed"))
    }

    async fn handle_expunge(&mut self) -> Result<Completion> {
        let user = self.user()?;
        let Some(view) = self.view.as_mut() else {
            return Ok(Completion::bad("No mailbox selected"));
        };
        if view.read_only {
            return Ok(Completion::no("[READ-ONLY] Mailbox is read-only"));
        }

        let removed = self.store.expunge(&user, &view.name).await?;
        for seq in view.apply_expunge(&removed) {
            let line = format!("* {} EXPUNGE\r\n", seq);
            self.out.extend_from_slice(line.as_bytes());
        }
        info!("Expunged {} messages from {}", removed.len(), view.name);
        Ok(Completion::ok("EXPUNGE completed"))
    }

    async fn handle_close(&mut self) -> Result<Completion> {
        let user = self.user()?;
        if let Some(view) = &self.view {
            if !view.read_only {
                self.store.expunge(&user, &view.name).await?;
            }
        }
        self.deselect();
        Ok(Completion::ok("CLOSE completed"))
    }

    /// Report changes made by other sessions to the selected mailbox
    async fn handle_noop(&mut self) -> Result<Completion> {
        if self.view.is_some() {
            let user = self.user()?;
            if let Some(view) = self.view.as_mut() {
                let latest = self.store.list_messages(&user, &view.name).await?;
                let uid_next = latest.last().map(|m| m.uid + 1).unwrap_or(view.uid_next);
                let changes = view.sync(latest, uid_next);

                let mut lines = String::new();
                for seq in &changes.expunged {
                    lines.push_str(&format!("* {} EXPUNGE\r\n", seq));
                }
                if changes.exists_changed {
                    lines.push_str(&format!("* {} EXISTS\r\n", view.exists()));
                    lines.push_str(&format!("* {} RECENT\r\n", view.recent()));
                }
                self.out.extend_from_slice(lines.as_bytes());
            }
        }
        Ok(Completion::ok("NOOP completed"))
    }

    async fn handle_create(&mut self, name: &str) -> Result<Completion> {
        let user = self.user()?;
        let name = normalize_mailbox_name(name);
        if let Err(e) = validate_mailbox_name(&name) {
            return Ok(Completion::no(e.to_string()));
        }
        if name == INBOX {
            return Ok(Completion::no("Mailbox already exists"));
        }

        match self.store.create_mailbox(&user, &name).await {
            Ok(_) => {
                info!("Created mailbox {}", name);
                self.mailboxes = self.store.list_mailboxes(&user).await?;
                Ok(Completion::ok("CREATE completed"))
            }
            Err(e) => mailbox_failure(e),
        }
    }

    async fn handle_delete(&mut self, name: &str) -> Result<Completion> {
        let user = self.user()?;
        let name = normalize_mailbox_name(name);
        if name == INBOX {
            return Ok(Completion::no("Cannot delete INBOX"));
        }

        match self.store.delete_mailbox(&user, &name).await {
            Ok(()) => {
                info!("Deleted mailbox {}", name);
                if self.view.as_ref().is_some_and(|v| v.name == name) {
                    self.deselect();
                }
                self.mailboxes = self.store.list_mailboxes(&user).await?;
                Ok(Completion::ok("DELETE completed"))
            }
            Err(e) => mailbox_failure(e),
        }
    }

    async fn handle_rename(&mut self, from: &str, to: &str) -> Result<Completion> {
        let user = self.user()?;
        let from = normalize_mailbox_name(from);
        let to = normalize_mailbox_name(to);
        if from == INBOX {
            return Ok(Completion::no("Cannot rename INBOX"));
        }
        if let Err(e) = validate_mailbox_name(&to) {
            return Ok(Completion::no(e.to_string()));
        }

        match self.store.rename_mailbox(&user, &from, &to).await {
            Ok(()) => {
                info!("Renamed mailbox {} to {}", from, to);
                if self
                    .view
                    .as_ref()
                    .is_some_and(|v| v.name == from || is_descendant(&v.name, &from))
                {
                    self.deselect();
                }
                self.mailboxes = self.store.list_mailboxes(&user).await?;
                Ok(Completion::ok("RENAME completed"))
            }
            Err(e) => mailbox_failure(e),
        }
    }
}

/// Store refusals become `NO`; anything else is an internal failure
fn mailbox_failure(e: MailError) -> Result<Completion> {
    match e {
        MailError::NotFound(_) => Ok(Completion::no("Mailbox does not exist")),
        MailError::AlreadyExists(_) => Ok(Completion::no("Mailbox already exists")),
        MailError::MailboxNotEmpty(_) => Ok(Completion::no("Mailbox is not empty")),
        MailError::Storage(message) | MailError::ImapProtocol(message) => {
            Ok(Completion::no(message))
        }
        other => Err(other),
    }
}

/// Read one command, answering synchronizing literals with a continuation
async fn read_command<S>(conn: &mut Connection<S>) -> Result<CommandInput>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut command = Vec::new();
    loop {
        let mut line = match conn.read_line_limited(MAX_COMMAND_LENGTH).await? {
            ReadOutcome::Line(line) => line,
            ReadOutcome::TooLong => {
                return Ok(CommandInput::Rejected("* BAD Command line too long".to_string()))
            }
            ReadOutcome::Closed => return Ok(CommandInput::Closed),
            ReadOutcome::TimedOut => return Ok(CommandInput::TimedOut),
        };
        while matches!(line.last(), Some(b'\r') | Some(b'\n')) {
            line.pop();
        }

        let Some(len) = literal_length(&line) else {
            command.extend_from_slice(&line);
            return Ok(CommandInput::Line(command));
        };

        command.extend_from_slice(&line);
        if len > MAX_LITERAL_SIZE || command.len() + len > MAX_LITERAL_SIZE + MAX_COMMAND_LENGTH {
            let tag = leading_tag(&command).unwrap_or_else(|| "*".to_string());
            return Ok(CommandInput::Rejected(format!("{} BAD Literal too large", tag)));
        }
        command.extend_from_slice(b"\r\n");
        conn.write_line("+ Ready for literal data").await?;
        let data = conn.read_exact(len).await?;
        command.extend_from_slice(&data);
    }
}

/// `n` when the line ends with a synchronizing literal announcement `{n}`
fn literal_length(line: &[u8]) -> Option<usize> {
    let body = line.strip_suffix(b"}")?;
    let open = body.iter().rposition(|c| *c == b'{')?;
    let digits = &body[open + 1..];
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(digits).ok()?.parse().ok()
}
