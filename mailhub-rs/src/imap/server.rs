use crate::config::Config;
use crate::error::Result;
use crate::imap::session::ImapSession;
use crate::security::Authenticator;
use crate::server::{ConnectionHandler, MailStream};
use crate::store::MailStore;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info_span, Instrument};

/// IMAP side of an [`Acceptor`](crate::server::Acceptor)
pub struct ImapServer {
    config: Arc<Config>,
    store: Arc<dyn MailStore>,
    authenticator: Authenticator,
}

impl ImapServer {
    pub fn new(config: Arc<Config>, store: Arc<dyn MailStore>) -> Self {
        let authenticator = Authenticator::new(store.clone(), config.server.domain.clone());
        Self {
            config,
            store,
            authenticator,
        }
    }
}

#[async_trait]
impl ConnectionHandler for ImapServer {
    fn protocol(&self) -> &'static str {
        "IMAP"
    }

    async fn handle(&self, stream: MailStream, peer: SocketAddr) -> Result<()> {
        let session = ImapSession::new(
            self.config.clone(),
            self.store.clone(),
            self.authenticator.clone(),
            Some(peer),
        );
        let span = info_span!(
            "imap",
            session = %session.info().id,
            peer = %peer,
            tls = stream.is_encrypted()
        );
        session.run(stream).instrument(span).await
    }
}
