//! POP3 retrieval listener.

pub mod session;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{info, info_span, Instrument};

use crate::config::Pop3Config;
use crate::server::SessionHandler;
use crate::store::DataStore;

use session::Pop3Session;

/// Per-session POP3 settings.
#[derive(Debug, Clone)]
pub struct Pop3Settings {
    /// Domain announced in the greeting.
    pub domain: String,
    pub idle_timeout: Duration,
}

impl From<&Pop3Config> for Pop3Settings {
    fn from(config: &Pop3Config) -> Self {
        Self {
            domain: config.domain.clone(),
            idle_timeout: config.idle_timeout(),
        }
    }
}

/// Starts a [`Pop3Session`] for every accepted connection.
pub struct Pop3Handler {
    store: Arc<dyn DataStore>,
    settings: Pop3Settings,
}

impl Pop3Handler {
    pub fn new(store: Arc<dyn DataStore>, settings: Pop3Settings) -> Self {
        Self { store, settings }
    }
}

impl SessionHandler for Pop3Handler {
    const PROTOCOL: &'static str = "POP3";

    async fn handle(&self, session_id: u64, stream: TcpStream, peer: SocketAddr) {
        let span = info_span!("pop3", session = session_id, peer = %peer);
        let (reader, writer) = stream.into_split();
        let session = Pop3Session::new(
            session_id,
            reader,
            writer,
            Arc::clone(&self.store),
            &self.settings,
        );
        async move {
            info!("Starting session");
            session.run().await;
        }
        .instrument(span)
        .await;
    }
}
