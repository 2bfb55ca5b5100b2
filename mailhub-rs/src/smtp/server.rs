use crate::config::Config;
use crate::error::Result;
use crate::security::Authenticator;
use crate::server::{ConnectionHandler, MailStream};
use crate::smtp::delivery::LocalDelivery;
use crate::smtp::session::SmtpSession;
use crate::store::MailStore;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info_span, Instrument};

/// SMTP side of an [`Acceptor`](crate::server::Acceptor)
pub struct SmtpServer {
    config: Arc<Config>,
    delivery: Arc<LocalDelivery>,
    authenticator: Authenticator,
}

impl SmtpServer {
    pub fn new(config: Arc<Config>, store: Arc<dyn MailStore>) -> Self {
        let delivery = Arc::new(LocalDelivery::new(store.clone(), config.local_domains()));
        let authenticator = Authenticator::new(store, config.server.domain.clone());
        Self {
            config,
            delivery,
            authenticator,
        }
    }
}

#[async_trait]
impl ConnectionHandler for SmtpServer {
    fn protocol(&self) -> &'static str {
        "SMTP"
    }

    async fn handle(&self, stream: MailStream, peer: SocketAddr) -> Result<()> {
        let session = SmtpSession::new(
            self.config.clone(),
            self.delivery.clone(),
            self.authenticator.clone(),
            Some(peer),
        );
        let span = info_span!(
            "smtp",
            session = %session.info().id,
            peer = %peer,
            tls = stream.is_encrypted()
        );
        session.run(stream).instrument(span).await
    }
}
