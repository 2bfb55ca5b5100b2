//! IMAP command parsing
//!
//! IMAP commands have the format: `tag COMMAND arguments`
//! Example: A001 LOGIN john password

use crate::imap::fetch::{parse_fetch_items, FetchItem};
use crate::imap::lexer::{tokenize, Token};
use crate::imap::search::{parse_search, SearchKey};
use crate::imap::sequence::SequenceSet;
use crate::model::{FlagUpdate, Flags};
use std::fmt;

/// Connection state a command may run in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NotAuthenticated,
    Authenticated,
    Selected,
    Logout,
}

/// IMAP command parsed from client
#[derive(Debug, Clone, PartialEq)]
pub enum ImapCommand {
    /// CAPABILITY - List server capabilities
    Capability,

    /// NOOP - No operation; reports mailbox changes when selected
    Noop,

    /// LOGOUT - Close connection
    Logout,

    /// LOGIN username password - Authenticate
    Login { username: String, password: String },

    /// SELECT mailbox - Select a mailbox
    Select { mailbox: String },

    /// EXAMINE mailbox - Select mailbox in read-only mode
    Examine { mailbox: String },

    Create { mailbox: String },

    Delete { mailbox: String },

    Rename { from: String, to: String },

    /// LIST reference pattern - List mailboxes
    List { reference: String, pattern: String },

    /// FETCH sequence items - Retrieve message data
    Fetch {
        set: SequenceSet,
        items: Vec<FetchItem>,
    },

    /// SEARCH [CHARSET x] criteria - Search for messages
    Search {
        charset: Option<String>,
        key: SearchKey,
    },

    /// STORE sequence (+|-)FLAGS[.SILENT] flags - Modify message flags
    Store {
        set: SequenceSet,
        update: FlagUpdate,
        silent: bool,
        flags: Flags,
    },

    /// EXPUNGE - Permanently remove messages marked \Deleted
    Expunge,

    /// CLOSE - Expunge silently and leave the selected state
    Close,
}

/// A line that could not be parsed; `tag` is known if the line had one
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandError {
    pub tag: Option<String>,
    pub message: String,
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl ImapCommand {
    /// Parse a complete command, literals inlined, without the final CRLF
    pub fn parse(line: &[u8]) -> Result<(String, Self), CommandError> {
        let tokens = tokenize(line).map_err(|message| CommandError {
            tag: leading_tag(line),
            message,
        })?;

        let tag = match tokens.first() {
            Some(Token::Atom(tag)) if tag != "*" && tag != "+" => tag.clone(),
            _ => {
                return Err(CommandError {
                    tag: None,
                    message: "Missing command tag".to_string(),
                })
            }
        };
        let fail = |message: String| CommandError {
            tag: Some(tag.clone()),
            message,
        };

        let name = tokens
            .get(1)
            .and_then(Token::as_atom)
            .ok_or_else(|| fail("Missing command".to_string()))?
            .to_ascii_uppercase();
        let args = &tokens[2..];

        let command = Self::parse_args(&name, args).map_err(fail)?;
        Ok((tag, command))
    }

    fn parse_args(name: &str, args: &[Token]) -> Result<Self, String> {
        let arity = |n: usize| {
            if args.len() == n {
                Ok(())
            } else {
                Err(format!("{} expects {} argument(s)", name, n))
            }
        };
        let string = |idx: usize| -> Result<String, String> {
            args.get(idx)
                .and_then(Token::as_astring)
                .map(str::to_string)
                .ok_or_else(|| format!("{} argument {} must be a string", name, idx + 1))
        };
        let set = |idx: usize| -> Result<SequenceSet, String> {
            args.get(idx)
                .and_then(Token::as_atom)
                .ok_or_else(|| "Missing sequence set".to_string())?
                .parse()
        };

        let command = match name {
            "CAPABILITY" => {
                arity(0)?;
                ImapCommand::Capability
            }
            "NOOP" => {
                arity(0)?;
                ImapCommand::Noop
            }
            "LOGOUT" => {
                arity(0)?;
                ImapCommand::Logout
            }
            "EXPUNGE" => {
                arity(0)?;
                ImapCommand::Expunge
            }
            "CLOSE" => {
                arity(0)?;
                ImapCommand::Close
            }
            "LOGIN" => {
                arity(2)?;
                ImapCommand::Login {
                    username: string(0)?,
                    password: string(1)?,
                }
            }
            "SELECT" => {
                arity(1)?;
                ImapCommand::Select { mailbox: string(0)? }
            }
            "EXAMINE" => {
                arity(1)?;
                ImapCommand::Examine { mailbox: string(0)? }
            }
            "CREATE" => {
                arity(1)?;
                ImapCommand::Create { mailbox: string(0)? }
            }
            "DELETE" => {
                arity(1)?;
                ImapCommand::Delete { mailbox: string(0)? }
            }
            "RENAME" => {
                arity(2)?;
                ImapCommand::Rename {
                    from: string(0)?,
                    to: string(1)?,
                }
            }
            "LIST" => {
                arity(2)?;
                ImapCommand::List {
                    reference: string(0)?,
                    pattern: string(1)?,
                }
            }
            "FETCH" => {
                arity(2)?;
                ImapCommand::Fetch {
                    set: set(0)?,
                    items: parse_fetch_items(&args[1])?,
                }
            }
            "SEARCH" => {
                let (charset, key) = parse_search(args)?;
                ImapCommand::Search { charset, key }
            }
            "STORE" => {
                if args.len() < 3 {
                    return Err("STORE requires sequence, operation, and flags".to_string());
                }
                let (update, silent) = parse_store_operation(
                    args[1]
                        .as_atom()
                        .ok_or_else(|| "Invalid STORE operation".to_string())?,
                )?;
                ImapCommand::Store {
                    set: set(0)?,
                    update,
                    silent,
                    flags: parse_flags(&args[2..])?,
                }
            }
            other => return Err(format!("Unknown IMAP command: {}", other)),
        };
        Ok(command)
    }

    /// Whether the command may run in `state`
    pub fn allowed_in(&self, state: SessionState) -> bool {
        use SessionState::*;
        match self {
            ImapCommand::Capability | ImapCommand::Logout => true,
            ImapCommand::Noop => state != Logout,
            ImapCommand::Login { .. } => state == NotAuthenticated,
            ImapCommand::Select { .. }
            | ImapCommand::Examine { .. }
            | ImapCommand::Create { .. }
            | ImapCommand::Delete { .. }
            | ImapCommand::Rename { .. }
            | ImapCommand::List { .. } => matches!(state, Authenticated | Selected),
            ImapCommand::Fetch { .. }
            | ImapCommand::Search { .. }
            | ImapCommand::Store { .. }
            | ImapCommand::Expunge
            | ImapCommand::Close => state == Selected,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ImapCommand::Capability => "CAPABILITY",
            ImapCommand::Noop => "NOOP",
            ImapCommand::Logout => "LOGOUT",
            ImapCommand::Login { .. } => "LOGIN",
            ImapCommand::Select { .. } => "SELECT",
            ImapCommand::Examine { .. } => "EXAMINE",
            ImapCommand::Create { .. } => "CREATE",
            ImapCommand::Delete { .. } => "DELETE",
            ImapCommand::Rename { .. } => "RENAME",
            ImapCommand::List { .. } => "LIST",
            ImapCommand::Fetch { .. } => "FETCH",
            ImapCommand::Search { .. } => "SEARCH",
            ImapCommand::Store { .. } => "STORE",
            ImapCommand::Expunge => "EXPUNGE",
            ImapCommand::Close => "CLOSE",
        }
    }
}

/// First word of a line that failed to tokenize, if it looks like a tag
pub(crate) fn leading_tag(line: &[u8]) -> Option<String> {
    let end = line.iter().position(|c| *c == b' ')?;
    let tag = std::str::from_utf8(&line[..end]).ok()?;
    (!tag.is_empty() && tag != "*" && tag != "+").then(|| tag.to_string())
}

fn parse_store_operation(op: &str) -> Result<(FlagUpdate, bool), String> {
    let upper = op.to_ascii_uppercase();
    let (base, silent) = match upper.strip_suffix(".SILENT") {
        Some(base) => (base, true),
        None => (upper.as_str(), false),
    };
    let update = match base {
        "+FLAGS" => FlagUpdate::Add,
        "-FLAGS" => FlagUpdate::Remove,
        "FLAGS" => FlagUpdate::Replace,
        _ => return Err(format!("Unknown STORE operation: {}", op)),
    };
    Ok((update, silent))
}

/// Flags given either as one parenthesized list or as bare atoms
fn parse_flags(tokens: &[Token]) -> Result<Flags, String> {
    let names: Vec<&Token> = match tokens {
        [Token::List(inner)] => inner.iter().collect(),
        _ => tokens.iter().collect(),
    };
    let mut flags = Flags::empty();
    for token in names {
        let name = token
            .as_atom()
            .ok_or_else(|| "Invalid flag".to_string())?;
        flags |= Flags::from_imap_name(name).ok_or_else(|| format!("Unknown flag: {}", name))?;
    }
    // \Recent is server-managed
    Ok(flags & Flags::PERMANENT)
}
