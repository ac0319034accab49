//! TCP accept loop shared by the SMTP and POP3 listeners.
//!
//! A [`ConnectionServer`] owns its listener, spawns one task per accepted
//! connection and tracks those tasks so shutdown can wait for them. Stopping
//! is cooperative: [`ServerHandle::stop`] cancels the accept loop, and
//! [`ServerHandle::drain`] waits for in-flight sessions to finish.

pub mod connection;

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::error::{MailError, Result};

/// Runs one protocol dialogue over an accepted connection.
pub trait SessionHandler: Send + Sync + 'static {
    /// Protocol name used in log lines.
    const PROTOCOL: &'static str;

    fn handle(
        &self,
        session_id: u64,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> impl Future<Output = ()> + Send;
}

/// Source of incoming connections.
trait Acceptor: Sync {
    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send;
}

impl Acceptor for TcpListener {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }
}

const BACKOFF_START: Duration = Duration::from_millis(5);
const BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Delay between retries after transient accept errors.
#[derive(Debug, Default)]
struct AcceptBackoff {
    current: Option<Duration>,
}

impl AcceptBackoff {
    fn next_delay(&mut self) -> Duration {
        let next = match self.current {
            None => BACKOFF_START,
            Some(d) => (d * 2).min(BACKOFF_MAX),
        };
        self.current = Some(next);
        next
    }

    fn reset(&mut self) {
        self.current = None;
    }
}

#[cfg(unix)]
fn is_fd_exhaustion(e: &io::Error) -> bool {
    const ENFILE: i32 = 23;
    const EMFILE: i32 = 24;
    matches!(e.raw_os_error(), Some(ENFILE | EMFILE))
}

#[cfg(not(unix))]
fn is_fd_exhaustion(_e: &io::Error) -> bool {
    false
}

/// Accept errors worth retrying after a pause.
fn is_transient(e: &io::Error) -> bool {
    use io::ErrorKind::*;
    matches!(
        e.kind(),
        ConnectionAborted | ConnectionReset | ConnectionRefused | Interrupted | TimedOut | WouldBlock
    ) || is_fd_exhaustion(e)
}

/// Cloneable control surface of a running server.
#[derive(Clone)]
pub struct ServerHandle {
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl ServerHandle {
    /// Ask the accept loop to exit. Running sessions are not interrupted.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Wait until every session spawned by the server has finished.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Number of sessions still running.
    pub fn active_sessions(&self) -> usize {
        self.tracker.len()
    }
}

/// A bound listener plus the handler for its connections.
pub struct ConnectionServer<H> {
    listener: TcpListener,
    local_addr: SocketAddr,
    handler: Arc<H>,
    handle: ServerHandle,
    next_session_id: AtomicU64,
}

impl<H: SessionHandler> ConnectionServer<H> {
    /// Bind `addr`. Each server gets its own shutdown token.
    pub async fn bind(addr: &str, handler: H) -> Result<Self> {
        Self::bind_with_shutdown(addr, handler, CancellationToken::new()).await
    }

    /// Bind `addr`, stopping when `shutdown` (or any parent token) is cancelled.
    pub async fn bind_with_shutdown(
        addr: &str,
        handler: H,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(MailError::Transport)?;
        let local_addr = listener.local_addr().map_err(MailError::Transport)?;
        Ok(Self {
            listener,
            local_addr,
            handler: Arc::new(handler),
            handle: ServerHandle {
                shutdown,
                tracker: TaskTracker::new(),
            },
            next_session_id: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    /// Stop accepting. Equivalent to `self.handle().stop()`.
    pub fn stop(&self) {
        self.handle.stop();
    }

    /// Accept connections until stopped.
    ///
    /// Returns `Ok` once a requested stop is observed; the listener is
    /// closed when this returns. A non-transient accept failure without a
    /// pending stop is returned as [`MailError::Transport`].
    pub async fn serve(self) -> Result<()> {
        info!(protocol = H::PROTOCOL, addr = %self.local_addr, "Listening");
        self.accept_loop(&self.listener).await?;
        info!(protocol = H::PROTOCOL, addr = %self.local_addr, "Listener stopped");
        Ok(())
    }

    async fn accept_loop<A: Acceptor>(&self, acceptor: &A) -> Result<()> {
        let protocol = H::PROTOCOL;
        let shutdown = self.handle.shutdown.clone();
        let mut backoff = AcceptBackoff::default();

        loop {
            let accepted = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                accepted = acceptor.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    backoff.reset();
                    let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
                    debug!(protocol, session = session_id, peer = %peer, "Accepted connection");
                    let handler = Arc::clone(&self.handler);
                    self.handle.tracker.spawn(async move {
                        handler.handle(session_id, stream, peer).await;
                    });
                }
                Err(e) if is_transient(&e) => {
                    let delay = backoff.next_delay();
                    warn!(protocol, error = %e, delay_ms = delay.as_millis() as u64, "Accept failed, retrying");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    if shutdown.is_cancelled() {
                        break;
                    }
                    error!(protocol, error = %e, "Listener failed");
                    return Err(MailError::Transport(e));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = AcceptBackoff::default();
        assert_eq!(backoff.next_delay(), Duration::from_millis(5));
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
        assert_eq!(backoff.next_delay(), Duration::from_millis(20));
        for _ in 0..20 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), BACKOFF_MAX);
        backoff.reset();
        assert_eq!(backoff.next_delay(), BACKOFF_START);
    }

    #[test]
    fn test_transient_classification() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(is_transient(&io::Error::from(io::ErrorKind::Interrupted)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::PermissionDenied)));
        #[cfg(unix)]
        assert!(is_transient(&io::Error::from_raw_os_error(24)));
    }

    struct Silent;

    impl SessionHandler for Silent {
        const PROTOCOL: &'static str = "TEST";

        async fn handle(&self, _session_id: u64, _stream: TcpStream, _peer: SocketAddr) {}
    }

    /// Fails every accept, transiently for the first `transient` calls.
    struct FailingAcceptor {
        transient: usize,
        calls: std::sync::atomic::AtomicUsize,
    }

    impl Acceptor for FailingAcceptor {
        async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.transient {
                Err(io::Error::from(io::ErrorKind::ConnectionAborted))
            } else {
                Err(io::Error::from(io::ErrorKind::PermissionDenied))
            }
        }
    }

    #[tokio::test]
    async fn test_fatal_accept_error_is_returned() {
        let server = ConnectionServer::bind("127.0.0.1:0", Silent).await.unwrap();
        let acceptor = FailingAcceptor {
            transient: 3,
            calls: Default::default(),
        };
        let result = server.accept_loop(&acceptor).await;
        match result {
            Err(MailError::Transport(e)) => assert_eq!(e.kind(), io::ErrorKind::PermissionDenied),
            other => panic!("expected Transport error, got {other:?}"),
        }
        assert_eq!(acceptor.calls.load(Ordering::SeqCst), 4);
        assert!(!server.handle().is_stopped());
    }

    #[tokio::test]
    async fn test_stopped_loop_returns_ok() {
        let server = ConnectionServer::bind("127.0.0.1:0", Silent).await.unwrap();
        server.stop();
        let acceptor = FailingAcceptor {
            transient: 0,
            calls: Default::default(),
        };
        assert!(server.accept_loop(&acceptor).await.is_ok());
    }

    #[tokio::test]
    async fn test_stop_ends_serve() {
        let server = ConnectionServer::bind("127.0.0.1:0", Silent).await.unwrap();
        let handle = server.handle();
        let task = tokio::spawn(server.serve());
        handle.stop();
        assert!(task.await.unwrap().is_ok());
        handle.drain().await;
        assert_eq!(handle.active_sessions(), 0);
    }
}
