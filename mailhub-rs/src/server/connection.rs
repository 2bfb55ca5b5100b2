//! Line-oriented connection wrapper shared by SMTP and IMAP
//!
//! Every read is bounded by the idle timeout. Lines longer than the limit
//! are drained up to their terminator and reported, never buffered whole.

use crate::error::{MailError, Result};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::timeout;

/// Maximum command line length (RFC 5321 section 4.5.3.1.4)
pub const MAX_LINE_LENGTH: usize = 1000;

#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// A complete line, terminator included
    Line(Vec<u8>),
    /// Line exceeded the limit and was discarded
    TooLong,
    /// Peer closed the connection
    Closed,
    /// Idle timeout elapsed
    TimedOut,
}

pub struct Connection<S> {
    reader: BufReader<S>,
    idle_timeout: Duration,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, idle_timeout: Duration) -> Self {
        Self {
            reader: BufReader::new(stream),
            idle_timeout,
        }
    }

    /// Read one command line of at most [`MAX_LINE_LENGTH`] bytes
    pub async fn read_line(&mut self) -> Result<ReadOutcome> {
        self.read_line_limited(MAX_LINE_LENGTH).await
    }

    /// Read one line of at most `limit` bytes, terminator included
    pub async fn read_line_limited(&mut self, limit: usize) -> Result<ReadOutcome> {
        let mut line = Vec::new();
        let mut bounded = (&mut self.reader).take(limit as u64 + 1);
        let read = bounded.read_until(b'\n', &mut line);

        let n = match timeout(self.idle_timeout, read).await {
            Ok(result) => result?,
            Err(_) => return Ok(ReadOutcome::TimedOut),
        };
        if n == 0 {
            return Ok(ReadOutcome::Closed);
        }
        if line.ends_with(b"\n") {
            return Ok(ReadOutcome::Line(line));
        }
        if line.len() <= limit {
            // EOF in the middle of a line
            return Ok(ReadOutcome::Closed);
        }

        match self.discard_rest_of_line().await? {
            ReadOutcome::Line(_) => Ok(ReadOutcome::TooLong),
            other => Ok(other),
        }
    }

    async fn discard_rest_of_line(&mut self) -> Result<ReadOutcome> {
        loop {
            let mut chunk = Vec::new();
            let mut bounded = (&mut self.reader).take(MAX_LINE_LENGTH as u64);
            let read = bounded.read_until(b'\n', &mut chunk);
            match timeout(self.idle_timeout, read).await {
                Ok(Ok(0)) => return Ok(ReadOutcome::Closed),
                Ok(Ok(_)) if chunk.ends_with(b"\n") => return Ok(ReadOutcome::Line(Vec::new())),
                Ok(Ok(_)) => continue,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Ok(ReadOutcome::TimedOut),
            }
        }
    }

    /// Read exactly `len` bytes, e.g. an IMAP literal
    pub async fn read_exact(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        match timeout(self.idle_timeout, self.reader.read_exact(&mut buf)).await {
            Ok(result) => {
                result?;
                Ok(buf)
            }
            Err(_) => Err(MailError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "timed out reading literal",
            ))),
        }
    }

    pub async fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        let stream = self.reader.get_mut();
        stream.write_all(bytes).await?;
        stream.flush().await?;
        Ok(())
    }

    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        let mut bytes = Vec::with_capacity(line.len() + 2);
        bytes.extend_from_slice(line.as_bytes());
        bytes.extend_from_slice(b"\r\n");
        self.write_all(&bytes).await
    }
}
