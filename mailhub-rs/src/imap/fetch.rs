//! FETCH data items and their rendering

use crate::imap::lexer::Token;
use crate::model::MessageMeta;
use mail_parser::{Address, MessageParser};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    /// `BODY[]`
    Full,
    /// `BODY[HEADER]`
    Header,
    /// `BODY[TEXT]`
    Text,
}

impl Section {
    fn name(&self) -> &'static str {
        match self {
            Section::Full => "",
            Section::Header => "HEADER",
            Section::Text => "TEXT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchItem {
    Uid,
    Flags,
    InternalDate,
    Rfc822Size,
    Envelope,
    Rfc822,
    Rfc822Header,
    Rfc822Text,
    Body {
        section: Section,
        peek: bool,
        /// `<start.length>`
        partial: Option<(usize, usize)>,
    },
}

impl FetchItem {
    /// Whether rendering requires the message content
    pub fn needs_body(&self) -> bool {
        matches!(
            self,
            FetchItem::Envelope
                | FetchItem::Rfc822
                | FetchItem::Rfc822Header
                | FetchItem::Rfc822Text
                | FetchItem::Body { .. }
        )
    }

    /// Whether fetching implicitly sets `\Seen`
    pub fn sets_seen(&self) -> bool {
        matches!(
            self,
            FetchItem::Rfc822 | FetchItem::Rfc822Text | FetchItem::Body { peek: false, .. }
        )
    }
}

/// Parse the item argument of FETCH: one item, a macro, or a list
pub fn parse_fetch_items(token: &Token) -> Result<Vec<FetchItem>, String> {
    match token {
        Token::List(tokens) if !tokens.is_empty() => {
            let mut items = Vec::new();
            for token in tokens {
                let atom = token
                    .as_atom()
                    .ok_or_else(|| "Invalid FETCH item".to_string())?;
                items.push(parse_item(atom)?);
            }
            Ok(items)
        }
        Token::Atom(atom) => match atom.to_ascii_uppercase().as_str() {
            "ALL" => Ok(vec![
                FetchItem::Flags,
                FetchItem::InternalDate,
                FetchItem::Rfc822Size,
                FetchItem::Envelope,
            ]),
            "FAST" => Ok(vec![
                FetchItem::Flags,
                FetchItem::InternalDate,
                FetchItem::Rfc822Size,
            ]),
            // No BODYSTRUCTURE support, so FULL carries the ALL items
            "FULL" => Ok(vec![
                FetchItem::Flags,
                FetchItem::InternalDate,
                FetchItem::Rfc822Size,
                FetchItem::Envelope,
            ]),
            _ => Ok(vec![parse_item(atom)?]),
        },
        _ => Err("Invalid FETCH items".to_string()),
    }
}

fn parse_item(atom: &str) -> Result<FetchItem, String> {
    let upper = atom.to_ascii_uppercase();
    let item = match upper.as_str() {
        "UID" => FetchItem::Uid,
        "FLAGS" => FetchItem::Flags,
        "INTERNALDATE" => FetchItem::InternalDate,
        "RFC822.SIZE" => FetchItem::Rfc822Size,
        "ENVELOPE" => FetchItem::Envelope,
        "RFC822" => FetchItem::Rfc822,
        "RFC822.HEADER" => FetchItem::Rfc822Header,
        "RFC822.TEXT" => FetchItem::Rfc822Text,
        _ => {
            let (peek, rest) = if let Some(rest) = upper.strip_prefix("BODY.PEEK[") {
                (true, rest)
            } else if let Some(rest) = upper.strip_prefix("BODY[") {
                (false, rest)
            } else {
                return Err(format!("Unsupported FETCH item: {}", atom));
            };
            let (section, tail) = rest
                .split_once(']')
                .ok_or_else(|| format!("Invalid section: {}", atom))?;
            let section = match section {
                "" => Section::Full,
                "HEADER" => Section::Header,
                "TEXT" => Section::Text,
                other => return Err(format!("Unsupported section: {}", other)),
            };
            FetchItem::Body {
                section,
                peek,
                partial: parse_partial(tail)?,
            }
        }
    };
    Ok(item)
}

fn parse_partial(tail: &str) -> Result<Option<(usize, usize)>, String> {
    if tail.is_empty() {
        return Ok(None);
    }
    tail.strip_prefix('<')
        .and_then(|t| t.strip_suffix('>'))
        .and_then(|t| t.split_once('.'))
        .and_then(|(start, len)| Some((start.parse().ok()?, len.parse().ok()?)))
        .map(Some)
        .ok_or_else(|| format!("Invalid partial range: {}", tail))
}

/// Split a raw message at the blank line that ends its header
pub fn split_message(raw: &[u8]) -> (&[u8], &[u8]) {
    let end = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|idx| idx + 4)
        .or_else(|| raw.windows(2).position(|w| w == b"\n\n").map(|idx| idx + 2))
        .unwrap_or(raw.len());
    raw.split_at(end)
}

/// One `* n FETCH (...)` response line, literals included
///
/// `raw` is `None` when no requested item needs the message content.
/// `extra_flags` appends FLAGS when an implicit `\Seen` changed them.
pub fn render_fetch(
    seq: u32,
    meta: &MessageMeta,
    raw: Option<&[u8]>,
    items: &[FetchItem],
    extra_flags: bool,
) -> Vec<u8> {
    let mut parts: Vec<Vec<u8>> = Vec::with_capacity(items.len() + 1);
    for item in items {
        let part = match item {
            FetchItem::Uid => format!("UID {}", meta.uid).into_bytes(),
            FetchItem::Flags => format!("FLAGS {}", meta.flags.to_imap_list()).into_bytes(),
            FetchItem::InternalDate => format!(
                "INTERNALDATE \"{}\"",
                meta.internal_date.format("%d-%b-%Y %H:%M:%S %z")
            )
            .into_bytes(),
            FetchItem::Rfc822Size => format!("RFC822.SIZE {}", meta.size).into_bytes(),
            FetchItem::Envelope => {
                let mut part = b"ENVELOPE ".to_vec();
                part.extend_from_slice(envelope(raw.unwrap_or_default()).as_bytes());
                part
            }
            FetchItem::Rfc822 => literal_item("RFC822", raw.unwrap_or_default()),
            FetchItem::Rfc822Header => {
                literal_item("RFC822.HEADER", split_message(raw.unwrap_or_default()).0)
            }
            FetchItem::Rfc822Text => {
                literal_item("RFC822.TEXT", split_message(raw.unwrap_or_default()).1)
            }
            FetchItem::Body {
                section, partial, ..
            } => {
                let raw = raw.unwrap_or_default();
                let data = match section {
                    Section::Full => raw,
                    Section::Header => split_message(raw).0,
                    Section::Text => split_message(raw).1,
                };
                match partial {
                    Some((start, len)) => {
                        let start = (*start).min(data.len());
                        let end = start.saturating_add(*len).min(data.len());
                        literal_item(
                            &format!("BODY[{}]<{}>", section.name(), start),
                            &data[start..end],
                        )
                    }
                    None => literal_item(&format!("BODY[{}]", section.name()), data),
                }
            }
        };
        parts.push(part);
    }
    if extra_flags && !items.contains(&FetchItem::Flags) {
        parts.push(format!("FLAGS {}", meta.flags.to_imap_list()).into_bytes());
    }

    let mut out = format!("* {} FETCH (", seq).into_bytes();
    for (idx, part) in parts.iter().enumerate() {
        if idx > 0 {
            out.push(b' ');
        }
        out.extend_from_slice(part);
    }
    out.extend_from_slice(b")\r\n");
    out
}

fn literal_item(name: &str, data: &[u8]) -> Vec<u8> {
    let mut out = format!("{} {{{}}}\r\n", name, data.len()).into_bytes();
    out.extend_from_slice(data);
    out
}

/// `NIL`, a quoted string, or a literal when quoting is not possible
pub fn nstring(value: Option<&str>) -> String {
    match value {
        None => "NIL".to_string(),
        Some(s) if s.bytes().any(|b| b == b'\r' || b == b'\n' || !b.is_ascii()) => {
            format!("{{{}}}\r\n{}", s.len(), s)
        }
        Some(s) => format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\"")),
    }
}

/// RFC 3501 ENVELOPE structure
pub fn envelope(raw: &[u8]) -> String {
    let Some(message) = MessageParser::default().parse(raw) else {
        return "(NIL NIL NIL NIL NIL NIL NIL NIL NIL NIL)".to_string();
    };
    let header = |name: &str| raw_header(raw, name);

    let from = address_list(message.from());
    let sender = message.sender().map(|a| address_list(Some(a))).unwrap_or_else(|| from.clone());
    let reply_to = message
        .reply_to()
        .map(|a| address_list(Some(a)))
        .unwrap_or_else(|| from.clone());

    format!(
        "({} {} {} {} {} {} {} {} {} {})",
        nstring(header("Date").as_deref()),
        nstring(message.subject()),
        from,
        sender,
        reply_to,
        address_list(message.to()),
        address_list(message.cc()),
        address_list(message.bcc()),
        nstring(header("In-Reply-To").as_deref()),
        nstring(header("Message-ID").as_deref()),
    )
}

/// Unfolded value of the first header called `name`
pub fn raw_header(raw: &[u8], name: &str) -> Option<String> {
    let header = String::from_utf8_lossy(split_message(raw).0);
    let mut lines = header.lines();
    while let Some(line) = lines.next() {
        let Some((field, value)) = line.split_once(':') else {
            continue;
        };
        if line.starts_with([' ', '\t']) || !field.trim().eq_ignore_ascii_case(name) {
            continue;
        }
        let mut value = value.trim().to_string();
        for continuation in lines.by_ref() {
            if !continuation.starts_with([' ', '\t']) {
                break;
            }
            value.push(' ');
            value.push_str(continuation.trim());
        }
        return Some(value);
    }
    None
}

fn address_list(address: Option<&Address>) -> String {
    let Some(address) = address else {
        return "NIL".to_string();
    };
    let entries: Vec<String> = address
        .iter()
        .map(|addr| {
            let (mailbox, host) = match addr.address().and_then(|a| a.rsplit_once('@')) {
                Some((mailbox, host)) => (Some(mailbox), Some(host)),
                None => (addr.address(), None),
            };
            format!(
                "({} NIL {} {})",
                nstring(addr.name()),
                nstring(mailbox),
                nstring(host)
            )
        })
        .collect();
    if entries.is_empty() {
        "NIL".to_string()
    } else {
        format!("({})", entries.concat())
    }
}

/// Whether any item requires the content or may set `\Seen`
pub fn needs_body(items: &[FetchItem]) -> bool {
    items.iter().any(FetchItem::needs_body)
}

pub fn sets_seen(items: &[FetchItem]) -> bool {
    items.iter().any(FetchItem::sets_seen)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imap::lexer::tokenize;
    use crate::model::Flags;
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    const RAW: &[u8] = b"From: Alice <alice@local.test>\r\n\
        To: bob@local.test\r\n\
        Subject: hi\r\n\
        Message-ID: <1@local.test>\r\n\
        \r\n\
        hello\r\n";

    fn meta() -> MessageMeta {
        MessageMeta {
            id: Uuid::new_v4(),
            uid: 42,
            flags: Flags::SEEN,
            size: RAW.len() as u64,
            internal_date: Utc.with_ymd_and_hms(2024, 3, 5, 14, 7, 9).unwrap(),
            modseq: 1,
        }
    }

    fn items(s: &str) -> Vec<FetchItem> {
        parse_fetch_items(&tokenize(s.as_bytes()).unwrap()[0]).unwrap()
    }

    #[test]
    fn test_parse_items_and_macros() {
        assert_eq!(items("(UID FLAGS)"), vec![FetchItem::Uid, FetchItem::Flags]);
        assert_eq!(items("FAST").len(), 3);
        assert_eq!(items("ALL").len(), 4);
        assert_eq!(
            items("BODY.PEEK[HEADER]<0.10>"),
            vec![FetchItem::Body {
                section: Section::Header,
                peek: true,
                partial: Some((0, 10))
            }]
        );
        assert!(parse_fetch_items(&Token::Atom("BODYSTRUCTURE".into())).is_err());
        assert!(parse_fetch_items(&Token::Atom("BODY[1.MIME]".into())).is_err());
    }

    #[test]
    fn test_seen_semantics() {
        assert!(sets_seen(&items("BODY[]")));
        assert!(sets_seen(&items("RFC822")));
        assert!(!sets_seen(&items("BODY.PEEK[]")));
        assert!(!sets_seen(&items("RFC822.HEADER")));
        assert!(!needs_body(&items("(UID FLAGS RFC822.SIZE)")));
    }

    #[test]
    fn test_render_in_requested_order() {
        let out = render_fetch(3, &meta(), None, &items("(RFC822.SIZE UID FLAGS INTERNALDATE)"), false);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            format!(
                "* 3 FETCH (RFC822.SIZE {} UID 42 FLAGS (\\Seen) INTERNALDATE \"05-Mar-2024 14:07:09 +0000\")\r\n",
                RAW.len()
            )
        );
    }

    #[test]
    fn test_render_body_sections() {
        let out = render_fetch(1, &meta(), Some(RAW), &items("BODY[TEXT]"), true);
        assert_eq!(out, b"* 1 FETCH (BODY[TEXT] {7}\r\nhello\r\n FLAGS (\\Seen))\r\n".to_vec());

        let out = render_fetch(1, &meta(), Some(RAW), &items("BODY.PEEK[]<0.4>"), false);
        assert_eq!(out, b"* 1 FETCH (BODY[]<0> {4}\r\nFrom)\r\n".to_vec());
    }

    #[test]
    fn test_envelope() {
        let env = envelope(RAW);
        assert!(env.starts_with("(NIL \"hi\" ((\"Alice\" NIL \"alice\" \"local.test\"))"));
        assert!(env.contains("((NIL NIL \"bob\" \"local.test\"))"));
        assert!(env.ends_with("NIL \"<1@local.test>\")"));
    }

    #[test]
    fn test_raw_header_unfolds() {
        let raw = b"Subject: a\r\n  long one\r\nX: y\r\n\r\nSubject: body";
        assert_eq!(raw_header(raw, "subject").as_deref(), Some("a long one"));
        assert_eq!(raw_header(raw, "x").as_deref(), Some("y"));
        assert_eq!(raw_header(raw, "Date"), None);
    }

    #[test]
    fn test_nstring() {
        assert_eq!(nstring(None), "NIL");
        assert_eq!(nstring(Some("a \"b\"")), "\"a \\\"b\\\"\"");
        assert_eq!(nstring(Some("é")), "{2}\r\né");
    }
}
