use crate::error::{MailError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum SmtpCommand {
    Helo(String),
    Ehlo(String),
    /// Empty address is the null reverse-path `<>`
    MailFrom {
        address: String,
        size: Option<usize>,
    },
    RcptTo(String),
    Data,
    Rset,
    Quit,
    Noop,
    Help,
    Auth {
        mechanism: String,
        initial_response: Option<String>,
    },
    Unknown(String),
}

impl SmtpCommand {
    /// Parse one command line
    ///
    /// Unrecognized verbs yield [`SmtpCommand::Unknown`]; known verbs with
    /// malformed arguments are errors.
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        let (verb, args) = match line.split_once(' ') {
            Some((verb, args)) => (verb, args.trim()),
            None => (line, ""),
        };
        let command = verb.to_ascii_uppercase();

        match command.as_str() {
            "HELO" => Ok(SmtpCommand::Helo(Self::require_arg(args, "HELO requires domain")?)),
            "EHLO" => Ok(SmtpCommand::Ehlo(Self::require_arg(args, "EHLO requires domain")?)),
            "MAIL" => Self::parse_mail_from(args),
            "RCPT" => Self::parse_rcpt_to(args),
            "DATA" => Self::no_args(args, SmtpCommand::Data),
            "RSET" => Self::no_args(args, SmtpCommand::Rset),
            "QUIT" => Self::no_args(args, SmtpCommand::Quit),
            "NOOP" => Ok(SmtpCommand::Noop),
            "HELP" => Ok(SmtpCommand::Help),
            "AUTH" => {
                let mut parts = args.split_whitespace();
                let mechanism = parts
                    .next()
                    .ok_or_else(|| MailError::SmtpProtocol("AUTH requires mechanism".to_string()))?
                    .to_ascii_uppercase();
                let initial_response = parts.next().map(str::to_string);
                if parts.next().is_some() {
                    return Err(MailError::SmtpProtocol("Too many AUTH arguments".to_string()));
                }
                Ok(SmtpCommand::Auth {
                    mechanism,
                    initial_response,
                })
            }
            _ => Ok(SmtpCommand::Unknown(command)),
        }
    }

    fn require_arg(args: &str, message: &str) -> Result<String> {
        if args.is_empty() {
            return Err(MailError::SmtpProtocol(message.to_string()));
        }
        Ok(args.to_string())
    }

    fn no_args(args: &str, command: SmtpCommand) -> Result<Self> {
        if !args.is_empty() {
            return Err(MailError::SmtpProtocol(format!(
                "Unexpected arguments: {}",
                args
            )));
        }
        Ok(command)
    }

    fn parse_mail_from(args: &str) -> Result<Self> {
        let rest = Self::strip_keyword(args, "FROM:")
            .ok_or_else(|| MailError::SmtpProtocol("Invalid MAIL FROM syntax".to_string()))?;
        let (address, params) = Self::parse_path(rest)?;

        let mut size = None;
        for param in params.split_whitespace() {
            let (key, value) = param.split_once('=').unwrap_or((param, ""));
            if key.eq_ignore_ascii_case("SIZE") {
                size = Some(value.parse::<usize>().map_err(|_| {
                    MailError::SmtpProtocol(format!("Invalid SIZE parameter: {}", value))
                })?);
            }
        }

        Ok(SmtpCommand::MailFrom { address, size })
    }

    fn parse_rcpt_to(args: &str) -> Result<Self> {
        let rest = Self::strip_keyword(args, "TO:")
            .ok_or_else(|| MailError::SmtpProtocol("Invalid RCPT TO syntax".to_string()))?;
        let (address, _params) = Self::parse_path(rest)?;
        if address.is_empty() {
            return Err(MailError::SmtpProtocol("Empty recipient".to_string()));
        }
        Ok(SmtpCommand::RcptTo(address))
    }

    fn strip_keyword<'a>(args: &'a str, keyword: &str) -> Option<&'a str> {
        let head = args.get(..keyword.len())?;
        if head.eq_ignore_ascii_case(keyword) {
            Some(args[keyword.len()..].trim_start())
        } else {
            None
        }
    }

    /// Split `<addr> params` (brackets optional) into address and parameters
    fn parse_path(rest: &str) -> Result<(String, &str)> {
        if let Some(inner) = rest.strip_prefix('<') {
            let end = inner
                .find('>')
                .ok_or_else(|| MailError::SmtpProtocol("Unterminated path".to_string()))?;
            Ok((inner[..end].trim().to_string(), inner[end + 1..].trim()))
        } else {
            let (address, params) = rest.split_once(' ').unwrap_or((rest, ""));
            if address.is_empty() {
                return Err(MailError::SmtpProtocol("Missing address".to_string()));
            }
            Ok((address.to_string(), params.trim()))
        }
    }
}
