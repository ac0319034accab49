//! SMTP ingestion listener.

pub mod session;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{info, info_span, Instrument};

use crate::config::SmtpConfig;
use crate::server::SessionHandler;
use crate::store::DataStore;

use session::SmtpSession;

/// Per-session SMTP settings.
#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub domain: String,
    pub domain_no_store: Option<String>,
    pub max_recipients: usize,
    pub idle_timeout: Duration,
    pub max_message_bytes: u64,
    pub store_messages: bool,
}

impl From<&SmtpConfig> for SmtpSettings {
    fn from(config: &SmtpConfig) -> Self {
        Self {
            domain: config.domain.clone(),
            domain_no_store: config.domain_no_store.clone(),
            max_recipients: config.max_recipients,
            idle_timeout: config.idle_timeout(),
            max_message_bytes: config.max_message_bytes,
            store_messages: config.store_messages,
        }
    }
}

/// Starts an [`SmtpSession`] for every accepted connection.
pub struct SmtpHandler {
    store: Arc<dyn DataStore>,
    settings: SmtpSettings,
}

impl SmtpHandler {
    pub fn new(store: Arc<dyn DataStore>, settings: SmtpSettings) -> Self {
        Self { store, settings }
    }
}

impl SessionHandler for SmtpHandler {
    const PROTOCOL: &'static str = "SMTP";

    async fn handle(&self, session_id: u64, stream: TcpStream, peer: SocketAddr) {
        let span = info_span!("smtp", session = session_id, peer = %peer);
        let (reader, writer) = stream.into_split();
        let session = SmtpSession::new(
            session_id,
            peer,
            reader,
            writer,
            Arc::clone(&self.store),
            self.settings.clone(),
        );
        async move {
            info!("Starting session");
            session.run().await;
        }
        .instrument(span)
        .await;
    }
}
