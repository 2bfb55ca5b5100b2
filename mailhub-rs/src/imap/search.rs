//! SEARCH criteria
//!
//! A subset of the RFC 3501 grammar: flag keys, header and text matches,
//! size and internal-date comparisons, sequence and UID sets, `NOT`, `OR`
//! and parenthesized groups. Adjacent keys are ANDed.

use crate::imap::fetch::split_message;
use crate::imap::lexer::Token;
use crate::imap::sequence::SequenceSet;
use crate::model::{Flags, MessageMeta};
use chrono::NaiveDate;
use mail_parser::{Address, Message};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderField {
    Subject,
    From,
    To,
    Cc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchKey {
    All,
    /// `present == false` for the `UN*` keys and `OLD`
    Flag { flag: Flags, present: bool },
    Header { field: HeaderField, value: String },
    Body(String),
    Text(String),
    Larger(u64),
    Smaller(u64),
    Since(NaiveDate),
    Before(NaiveDate),
    On(NaiveDate),
    Uid(SequenceSet),
    Sequence(SequenceSet),
    Not(Box<SearchKey>),
    Or(Box<SearchKey>, Box<SearchKey>),
    And(Vec<SearchKey>),
}

/// Everything a key may look at for one message
pub struct SearchContext<'a> {
    pub seq: u32,
    pub meta: &'a MessageMeta,
    pub exists: u32,
    pub max_uid: u32,
    /// Present only when [`SearchKey::needs_content`] is true
    pub raw: Option<&'a [u8]>,
    pub message: Option<&'a Message<'a>>,
}

/// Parse SEARCH arguments into the optional charset and the criteria
pub fn parse_search(args: &[Token]) -> Result<(Option<String>, SearchKey), String> {
    let mut args = args;
    let mut charset = None;
    if args
        .first()
        .and_then(Token::as_atom)
        .is_some_and(|atom| atom.eq_ignore_ascii_case("CHARSET"))
    {
        let name = args
            .get(1)
            .and_then(Token::as_astring)
            .ok_or_else(|| "CHARSET requires a name".to_string())?;
        charset = Some(name.to_string());
        args = &args[2..];
    }

    let keys = parse_keys(args)?;
    if keys.is_empty() {
        return Err("SEARCH requires criteria".to_string());
    }
    Ok((charset, SearchKey::conjunction(keys)))
}

fn parse_keys(tokens: &[Token]) -> Result<Vec<SearchKey>, String> {
    let mut iter = tokens.iter();
    let mut keys = Vec::new();
    while let Some(token) = iter.next() {
        keys.push(parse_key(token, &mut iter)?);
    }
    Ok(keys)
}

fn parse_key<'a>(token: &'a Token, rest: &mut impl Iterator<Item = &'a Token>) -> Result<SearchKey, String> {
    let atom = match token {
        Token::List(inner) => {
            let keys = parse_keys(inner)?;
            if keys.is_empty() {
                return Err("Empty search group".to_string());
            }
            return Ok(SearchKey::conjunction(keys));
        }
        Token::Atom(atom) => atom,
        Token::Str(_) => return Err("Unexpected string in search criteria".to_string()),
    };

    let mut string_arg = |key: &str| -> Result<String, String> {
        rest.next()
            .and_then(Token::as_astring)
            .map(str::to_string)
            .ok_or_else(|| format!("{} requires an argument", key))
    };

    let flag = |flag: Flags, present: bool| SearchKey::Flag { flag, present };
    let key = match atom.to_ascii_uppercase().as_str() {
        "ALL" => SearchKey::All,
        "SEEN" => flag(Flags::SEEN, true),
        "UNSEEN" => flag(Flags::SEEN, false),
        "ANSWERED" => flag(Flags::ANSWERED, true),
        "UNANSWERED" => flag(Flags::ANSWERED, false),
        "FLAGGED" => flag(Flags::FLAGGED, true),
        "UNFLAGGED" => flag(Flags::FLAGGED, false),
        "DELETED" => flag(Flags::DELETED, true),
        "UNDELETED" => flag(Flags::DELETED, false),
        "DRAFT" => flag(Flags::DRAFT, true),
        "UNDRAFT" => flag(Flags::DRAFT, false),
        "RECENT" => flag(Flags::RECENT, true),
        "OLD" => flag(Flags::RECENT, false),
        "NEW" => SearchKey::And(vec![flag(Flags::RECENT, true), flag(Flags::SEEN, false)]),
        "SUBJECT" => header(HeaderField::Subject, string_arg("SUBJECT")?),
        "FROM" => header(HeaderField::From, string_arg("FROM")?),
        "TO" => header(HeaderField::To, string_arg("TO")?),
        "CC" => header(HeaderField::Cc, string_arg("CC")?),
        "BODY" => SearchKey::Body(string_arg("BODY")?),
        "TEXT" => SearchKey::Text(string_arg("TEXT")?),
        "LARGER" => SearchKey::Larger(number(&string_arg("LARGER")?)?),
        "SMALLER" => SearchKey::Smaller(number(&string_arg("SMALLER")?)?),
        "SINCE" => SearchKey::Since(date(&string_arg("SINCE")?)?),
        "BEFORE" => SearchKey::Before(date(&string_arg("BEFORE")?)?),
        "ON" => SearchKey::On(date(&string_arg("ON")?)?),
        "UID" => SearchKey::Uid(string_arg("UID")?.parse()?),
        "NOT" => {
            let next = rest.next().ok_or_else(|| "NOT requires a key".to_string())?;
            SearchKey::Not(Box::new(parse_key(next, rest)?))
        }
        "OR" => {
            let first = rest.next().ok_or_else(|| "OR requires two keys".to_string())?;
            let first = parse_key(first, rest)?;
            let second = rest.next().ok_or_else(|| "OR requires two keys".to_string())?;
            let second = parse_key(second, rest)?;
            SearchKey::Or(Box::new(first), Box::new(second))
        }
        _ if atom.starts_with(|c: char| c.is_ascii_digit() || c == '*') => {
            SearchKey::Sequence(atom.parse()?)
        }
        other => return Err(format!("Unsupported search key: {}", other)),
    };
    Ok(key)
}

fn header(field: HeaderField, value: String) -> SearchKey {
    SearchKey::Header { field, value }
}

fn number(s: &str) -> Result<u64, String> {
    s.parse().map_err(|_| format!("Invalid number: {}", s))
}

/// `d-Mon-yyyy`
fn date(s: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(s, "%d-%b-%Y").map_err(|_| format!("Invalid date: {}", s))
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

fn addresses(address: Option<&Address>) -> String {
    address
        .map(|list| {
            list.iter()
                .map(|addr| {
                    format!(
                        "{} <{}>",
                        addr.name().unwrap_or_default(),
                        addr.address().unwrap_or_default()
                    )
                })
                .collect::<Vec<_>>()
                .join(", ")
        })
        .unwrap_or_default()
}

impl SearchKey {
    fn conjunction(mut keys: Vec<SearchKey>) -> SearchKey {
        if keys.len() == 1 {
            keys.remove(0)
        } else {
            SearchKey::And(keys)
        }
    }

    /// Whether evaluation looks at headers or body
    pub fn needs_content(&self) -> bool {
        match self {
            SearchKey::Header { .. } | SearchKey::Body(_) | SearchKey::Text(_) => true,
            SearchKey::Not(key) => key.needs_content(),
            SearchKey::Or(a, b) => a.needs_content() || b.needs_content(),
            SearchKey::And(keys) => keys.iter().any(SearchKey::needs_content),
            _ => false,
        }
    }

    pub fn matches(&self, ctx: &SearchContext<'_>) -> bool {
        let meta = ctx.meta;
        match self {
            SearchKey::All => true,
            SearchKey::Flag { flag, present } => meta.has_flag(*flag) == *present,
            SearchKey::Header { field, value } => {
                let Some(message) = ctx.message else {
                    return false;
                };
                let text = match field {
                    HeaderField::Subject => message.subject().unwrap_or_default().to_string(),
                    HeaderField::From => addresses(message.from()),
                    HeaderField::To => addresses(message.to()),
                    HeaderField::Cc => addresses(message.cc()),
                };
                contains_ci(&text, value)
            }
            SearchKey::Body(value) => {
                let body = match ctx.message.and_then(|m| m.body_text(0)) {
                    Some(text) => text.into_owned(),
                    None => String::from_utf8_lossy(split_message(ctx.raw.unwrap_or_default()).1)
                        .into_owned(),
                };
                contains_ci(&body, value)
            }
            SearchKey::Text(value) => {
                let raw = String::from_utf8_lossy(ctx.raw.unwrap_or_default());
                let decoded = ctx
                    .message
                    .and_then(|m| m.body_text(0))
                    .unwrap_or_default();
                contains_ci(&raw, value) || contains_ci(&decoded, value)
            }
            SearchKey::Larger(size) => meta.size > *size,
            SearchKey::Smaller(size) => meta.size < *size,
            SearchKey::Since(date) => meta.internal_date.date_naive() >= *date,
            SearchKey::Before(date) => meta.internal_date.date_naive() < *date,
            SearchKey::On(date) => meta.internal_date.date_naive() == *date,
            SearchKey::Uid(set) => set.contains(meta.uid, ctx.max_uid),
            SearchKey::Sequence(set) => set.contains(ctx.seq, ctx.exists),
            SearchKey::Not(key) => !key.matches(ctx),
            SearchKey::Or(a, b) => a.matches(ctx) || b.matches(ctx),
            SearchKey::And(keys) => keys.iter().all(|key| key.matches(ctx)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imap::lexer::tokenize;
    use chrono::{TimeZone, Utc};
    use mail_parser::MessageParser;
    use uuid::Uuid;

    const RAW: &[u8] = b"From: Alice <alice@local.test>\r\n\
        To: bob@local.test\r\n\
        Subject: Quarterly report\r\n\
        \r\n\
        Numbers attached.\r\n";

    fn parse(s: &str) -> SearchKey {
        parse_search(&tokenize(s.as_bytes()).unwrap()).unwrap().1
    }

    fn meta(uid: u32, flags: Flags) -> MessageMeta {
        MessageMeta {
            id: Uuid::new_v4(),
            uid,
            flags,
            size: RAW.len() as u64,
            internal_date: Utc.with_ymd_and_hms(2024, 3, 5, 12, 0, 0).unwrap(),
            modseq: 1,
        }
    }

    fn matches(query: &str, meta: &MessageMeta, seq: u32) -> bool {
        let key = parse(query);
        let message = MessageParser::default().parse(RAW);
        let ctx = SearchContext {
            seq,
            meta,
            exists: 3,
            max_uid: 30,
            raw: Some(RAW),
            message: message.as_ref(),
        };
        key.matches(&ctx)
    }

    #[test]
    fn test_parse_structure() {
        assert_eq!(parse("ALL"), SearchKey::All);
        assert_eq!(
            parse("UNSEEN LARGER 10"),
            SearchKey::And(vec![
                SearchKey::Flag { flag: Flags::SEEN, present: false },
                SearchKey::Larger(10),
            ])
        );
        assert!(matches!(parse("OR SEEN (FLAGGED DRAFT)"), SearchKey::Or(_, _)));
        assert!(matches!(parse("NOT 1:2"), SearchKey::Not(_)));

        let (charset, _) = parse_search(&tokenize(b"CHARSET UTF-8 ALL").unwrap()).unwrap();
        assert_eq!(charset.as_deref(), Some("UTF-8"));
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_search(&tokenize(b"").unwrap()).is_err());
        assert!(parse_search(&tokenize(b"SUBJECT").unwrap()).is_err());
        assert!(parse_search(&tokenize(b"SINCE 2024-01-01").unwrap()).is_err());
        assert!(parse_search(&tokenize(b"KEYWORD x").unwrap()).is_err());
        assert!(parse_search(&tokenize(b"OR SEEN").unwrap()).is_err());
    }

    #[test]
    fn test_flag_keys() {
        let seen = meta(10, Flags::SEEN);
        let fresh = meta(11, Flags::RECENT);
        assert!(matches("SEEN", &seen, 1));
        assert!(!matches("UNSEEN", &seen, 1));
        assert!(matches("NEW", &fresh, 2));
        assert!(!matches("NEW", &seen, 1));
        assert!(matches("OLD", &seen, 1));
        assert!(matches("NOT DELETED", &seen, 1));
    }

    #[test]
    fn test_content_keys() {
        let m = meta(10, Flags::empty());
        assert!(matches("SUBJECT quarterly", &m, 1));
        assert!(matches("FROM alice", &m, 1));
        assert!(matches("TO \"bob@local\"", &m, 1));
        assert!(!matches("CC bob", &m, 1));
        assert!(matches("BODY numbers", &m, 1));
        assert!(matches("TEXT report", &m, 1));
        assert!(!matches("BODY report", &m, 1));
    }

    #[test]
    fn test_size_date_and_sets() {
        let m = meta(20, Flags::empty());
        assert!(matches("LARGER 10 SMALLER 100000", &m, 2));
        assert!(matches("ON 5-Mar-2024", &m, 2));
        assert!(matches("SINCE 05-mar-2024", &m, 2));
        assert!(!matches("BEFORE 5-Mar-2024", &m, 2));
        assert!(matches("UID 15:*", &m, 2));
        assert!(!matches("UID 1:5", &m, 2));
        assert!(matches("2", &m, 2));
        assert!(matches("OR 1 3:*", &m, 3));
    }

    #[test]
    fn test_needs_content() {
        assert!(!parse("SEEN 1:3").needs_content());
        assert!(parse("OR SEEN SUBJECT x").needs_content());
    }
}
