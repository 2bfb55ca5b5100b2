//! Listener plumbing shared by the SMTP and IMAP servers
//!
//! - [`connection`]: idle-timeout aware line reader/writer
//! - [`stream`]: plain or TLS stream

pub mod connection;
pub mod stream;

pub use connection::{Connection, ReadOutcome, MAX_LINE_LENGTH};
pub use stream::MailStream;

use crate::error::Result;
use crate::security::TlsConfig;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Protocol side of a listener: drives one accepted connection to completion
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Name used in log lines
    fn protocol(&self) -> &'static str;

    async fn handle(&self, stream: MailStream, peer: SocketAddr) -> Result<()>;
}

/// Accept loop with optional implicit TLS
pub struct Acceptor {
    listener: TcpListener,
    tls: Option<TlsConfig>,
    handshake_timeout: Duration,
}

impl Acceptor {
    pub async fn bind(
        addr: &str,
        tls: Option<TlsConfig>,
        handshake_timeout: Duration,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            tls,
            handshake_timeout,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` is cancelled
    ///
    /// Each connection runs in its own task. Accept and handshake failures
    /// are logged and do not stop the loop.
    pub async fn run<H: ConnectionHandler>(
        self,
        handler: Arc<H>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let protocol = handler.protocol();
        info!(
            "{} server listening on {}{}",
            protocol,
            self.local_addr()?,
            if self.tls.is_some() { " (TLS)" } else { "" }
        );

        loop {
            let (socket, peer) = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("{} server shutting down", protocol);
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Failed to accept {} connection: {}", protocol, e);
                        continue;
                    }
                },
            };

            info!("New {} connection from {}", protocol, peer);
            let handler = Arc::clone(&handler);
            let tls = self.tls.clone();
            let handshake_timeout = self.handshake_timeout;

            tokio::spawn(async move {
                let stream = match establish(socket, tls, handshake_timeout).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!("TLS handshake with {} failed: {}", peer, e);
                        return;
                    }
                };
                if let Err(e) = handler.handle(stream, peer).await {
                    error!("{} session error for {}: {}", protocol, peer, e);
                }
                debug!("{} connection from {} closed", protocol, peer);
            });
        }
    }
}

async fn establish(
    socket: TcpStream,
    tls: Option<TlsConfig>,
    handshake_timeout: Duration,
) -> std::io::Result<MailStream> {
    let Some(tls) = tls else {
        return Ok(MailStream::Plain(socket));
    };
    match timeout(handshake_timeout, tls.acceptor().accept(socket)).await {
        Ok(stream) => Ok(MailStream::Tls(Box::new(stream?))),
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "TLS handshake timed out",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    struct Echo;

    #[async_trait]
    impl ConnectionHandler for Echo {
        fn protocol(&self) -> &'static str {
            "ECHO"
        }

        async fn handle(&self, mut stream: MailStream, _peer: SocketAddr) -> Result<()> {
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await?;
            stream.write_all(&buf).await?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_acceptor_serves_and_stops() {
        let acceptor = Acceptor::bind("127.0.0.1:0", None, Duration::from_secs(1))
            .await
            .unwrap();
        let addr = acceptor.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(acceptor.run(Arc::new(Echo), shutdown.clone()));

        for _ in 0..2 {
            let mut client = TcpStream::connect(addr).await.unwrap();
            client.write_all(b"ping").await.unwrap();
            let mut reply = [0u8; 4];
            client.read_exact(&mut reply).await.unwrap();
            assert_eq!(&reply, b"ping");
        }

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }
}
