//! SMTP client for outbound delivery
//!
//! Speaks the RFC 5321 client dialogue to one exchanger and classifies the
//! outcome: 4xx replies and transport problems are transient, 5xx replies
//! are permanent.

use crate::error::DeliveryError;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info};

type DeliveryResult<T> = std::result::Result<T, DeliveryError>;

/// A complete (possibly multi-line) server reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub text: String,
}

impl Reply {
    /// Parse the reply lines; the code is taken from the last line
    pub fn parse(lines: &[String]) -> Option<Self> {
        let last = lines.last()?;
        let code = last.get(..3)?.parse().ok()?;
        let text = lines
            .iter()
            .map(|line| line.get(4..).unwrap_or("").trim_end())
            .collect::<Vec<_>>()
            .join(" ");
        Some(Self { code, text })
    }

    pub fn is_positive(&self) -> bool {
        (200..400).contains(&self.code)
    }

    /// Failure classification of a non-positive reply
    pub fn to_error(&self, stage: &str) -> DeliveryError {
        let message = format!("{} rejected: {} {}", stage, self.code, self.text);
        if (500..600).contains(&self.code) {
            DeliveryError::Permanent(message)
        } else {
            DeliveryError::Transient(message)
        }
    }
}

/// SMTP client for one remote server
///
/// # Examples
/// ```no_run
/// use mailhub_rs::smtp::SmtpClient;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = SmtpClient::new("mail.example.com:25", "mx.local.test");
/// client.send_mail(
///     "sender@example.com",
///     "recipient@other.com",
///     b"Subject: Test\r\n\r\nHello!"
/// ).await?;
/// # Ok(())
/// # }
/// ```
pub struct SmtpClient {
    server_addr: String,
    helo_name: String,
}

impl SmtpClient {
    pub fn new(server_addr: impl Into<String>, helo_name: impl Into<String>) -> Self {
        Self {
            server_addr: server_addr.into(),
            helo_name: helo_name.into(),
        }
    }

    pub fn server_addr(&self) -> &str {
        &self.server_addr
    }

    /// Deliver `data` from `from` (empty for the null sender) to `to`
    pub async fn send_mail(&self, from: &str, to: &str, data: &[u8]) -> DeliveryResult<()> {
        info!("Sending mail from <{}> to <{}> via {}", from, to, self.server_addr);

        let stream = TcpStream::connect(&self.server_addr).await.map_err(|e| {
            DeliveryError::Transient(format!("connect to {} failed: {}", self.server_addr, e))
        })?;
        self.send_over(stream, from, to, data).await
    }

    /// Run the client dialogue over an established stream
    pub async fn send_over<S>(&self, stream: S, from: &str, to: &str, data: &[u8]) -> DeliveryResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut stream = BufReader::new(stream);

        expect(&mut stream, "greeting").await?;
        command(&mut stream, &format!("EHLO {}", self.helo_name), "EHLO").await?;
        command(&mut stream, &format!("MAIL FROM:<{}>", from), "MAIL FROM").await?;
        command(&mut stream, &format!("RCPT TO:<{}>", to), "RCPT TO").await?;
        command(&mut stream, "DATA", "DATA").await?;

        write(&mut stream, &dot_stuff(data)).await?;
        expect(&mut stream, "message").await?;

        // The message is accepted; a failing QUIT does not change that
        if write(&mut stream, b"QUIT\r\n").await.is_ok() {
            let _ = read_reply(&mut stream).await;
        }

        info!("Mail to <{}> accepted by {}", to, self.server_addr);
        Ok(())
    }
}

/// Apply transparency and terminate with `<CRLF>.<CRLF>`
pub fn dot_stuff(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 5);
    let mut at_line_start = true;
    for &byte in data {
        if at_line_start && byte == b'.' {
            out.push(b'.');
        }
        out.push(byte);
        at_line_start = byte == b'\n';
    }
    if !out.ends_with(b"\r\n") {
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b".\r\n");
    out
}

async fn write<S>(stream: &mut BufReader<S>, bytes: &[u8]) -> DeliveryResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let inner = stream.get_mut();
    inner.write_all(bytes).await.map_err(transport_error)?;
    inner.flush().await.map_err(transport_error)
}

async fn command<S>(stream: &mut BufReader<S>, line: &str, stage: &str) -> DeliveryResult<Reply>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    debug!("> {}", line);
    write(stream, format!("{}\r\n", line).as_bytes()).await?;
    expect(stream, stage).await
}

async fn expect<S>(stream: &mut BufReader<S>, stage: &str) -> DeliveryResult<Reply>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let reply = read_reply(stream).await?;
    if reply.is_positive() {
        Ok(reply)
    } else {
        Err(reply.to_error(stage))
    }
}

async fn read_reply<S>(stream: &mut BufReader<S>) -> DeliveryResult<Reply>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut lines = Vec::new();
    loop {
        let mut line = String::new();
        let n = stream.read_line(&mut line).await.map_err(transport_error)?;
        if n == 0 {
            return Err(DeliveryError::Transient(
                "connection closed by remote server".to_string(),
            ));
        }
        debug!("< {}", line.trim_end());
        let last = line.as_bytes().get(3) != Some(&b'-');
        lines.push(line);
        if last {
            break;
        }
    }
    Reply::parse(&lines)
        .ok_or_else(|| DeliveryError::Transient(format!("malformed reply: {:?}", lines)))
}

fn transport_error(e: std::io::Error) -> DeliveryError {
    DeliveryError::Transient(format!("I/O error: {}", e))
}
