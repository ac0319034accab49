//! End-to-end tests: real listeners on loopback, driven by a line client.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use mailcatch::pop3::{Pop3Handler, Pop3Settings};
use mailcatch::server::{ConnectionServer, ServerHandle};
use mailcatch::smtp::{SmtpHandler, SmtpSettings};
use mailcatch::store::file::FileDataStore;
use mailcatch::store::memory::MemoryDataStore;
use mailcatch::store::DataStore;

const DOMAIN: &str = "test.local";

struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (r, w) = stream.into_split();
        Self {
            reader: BufReader::new(r),
            writer: w,
        }
    }

    /// Next reply line without its line ending, or `None` at EOF.
    async fn line(&mut self) -> Option<String> {
        let mut buf = String::new();
        let n = tokio::time::timeout(Duration::from_secs(5), self.reader.read_line(&mut buf))
            .await
            .expect("server went quiet")
            .unwrap();
        (n > 0).then(|| buf.trim_end_matches(['\r', '\n']).to_string())
    }

    async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .unwrap();
    }

    async fn cmd(&mut self, line: &str) -> String {
        self.send(line).await;
        self.line().await.unwrap()
    }

    /// Read a multi-line POP3 body up to the terminating dot.
    async fn body(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        loop {
            let line = self.line().await.unwrap();
            if line == "." {
                return lines;
            }
            lines.push(line);
        }
    }
}

fn smtp_settings() -> SmtpSettings {
    SmtpSettings {
        domain: DOMAIN.to_string(),
        domain_no_store: None,
        max_recipients: 10,
        idle_timeout: Duration::from_secs(5),
        max_message_bytes: 64 * 1024,
        store_messages: true,
    }
}

fn pop3_settings(idle_timeout: Duration) -> Pop3Settings {
    Pop3Settings {
        domain: DOMAIN.to_string(),
        idle_timeout,
    }
}

async fn start_smtp(store: Arc<dyn DataStore>) -> (SocketAddr, ServerHandle) {
    let server = ConnectionServer::bind("127.0.0.1:0", SmtpHandler::new(store, smtp_settings()))
        .await
        .unwrap();
    let addr = server.local_addr();
    let handle = server.handle();
    tokio::spawn(server.serve());
    (addr, handle)
}

async fn start_pop3(store: Arc<dyn DataStore>, idle: Duration) -> (SocketAddr, ServerHandle) {
    let server = ConnectionServer::bind(
        "127.0.0.1:0",
        Pop3Handler::new(store, pop3_settings(idle)),
    )
    .await
    .unwrap();
    let addr = server.local_addr();
    let handle = server.handle();
    tokio::spawn(server.serve());
    (addr, handle)
}

async fn smtp_deliver(addr: SocketAddr, rcpt: &str, body: &[&str]) {
    let mut c = Client::connect(addr).await;
    assert!(c.line().await.unwrap().starts_with("220 "));
    assert!(c.cmd("HELO client.example").await.starts_with("250 "));
    assert!(c.cmd("MAIL FROM:<sender@example.com>").await.starts_with("250 "));
    assert!(c.cmd(&format!("RCPT TO:<{rcpt}>")).await.starts_with("250 "));
    assert!(c.cmd("DATA").await.starts_with("354"));
    for line in body {
        c.send(line).await;
    }
    assert!(c.cmd(".").await.starts_with("250 "));
    assert!(c.cmd("QUIT").await.starts_with("221 "));
    assert_eq!(c.line().await, None);
}

// ─── SMTP to POP3 ───────────────────────────────────────────────────

#[tokio::test]
async fn test_smtp_delivery_is_readable_over_pop3() {
    let store: Arc<dyn DataStore> = Arc::new(MemoryDataStore::default());
    let (smtp_addr, _smtp) = start_smtp(Arc::clone(&store)).await;
    let (pop3_addr, _pop3) = start_pop3(Arc::clone(&store), Duration::from_secs(5)).await;

    smtp_deliver(
        smtp_addr,
        "James@example.com",
        &[
            "From: sender@example.com",
            "Subject: hello over the wire",
            "",
            "first line",
            "..starts with a dot",
        ],
    )
    .await;

    let mut c = Client::connect(pop3_addr).await;
    assert_eq!(
        c.line().await.unwrap(),
        format!("+OK {DOMAIN} POP3 server ready")
    );
    assert!(c.cmd("USER james").await.starts_with("+OK"));
    assert_eq!(c.cmd("PASS anything").await, "+OK Found 1 messages for james");
    assert!(c.cmd("RETR 1").await.ends_with("octets"));

    let lines = c.body().await;
    assert!(lines[0].starts_with("Received: from client.example ([127.0.0.1])"));
    assert!(lines.contains(&"Subject: hello over the wire".to_string()));
    assert!(lines.contains(&"first line".to_string()));
    // Unstuffed by SMTP, stuffed again by POP3.
    assert!(lines.contains(&"..starts with a dot".to_string()));

    assert_eq!(c.cmd("QUIT").await, "+OK Goodnight and good luck");
    assert_eq!(c.line().await, None);
}

#[tokio::test]
async fn test_pop3_dele_is_committed_on_quit() {
    let store: Arc<dyn DataStore> = Arc::new(MemoryDataStore::default());
    let (smtp_addr, _smtp) = start_smtp(Arc::clone(&store)).await;
    let (pop3_addr, _pop3) = start_pop3(Arc::clone(&store), Duration::from_secs(5)).await;
    smtp_deliver(smtp_addr, "james@example.com", &["Subject: a", "", "x"]).await;
    smtp_deliver(smtp_addr, "james@example.com", &["Subject: b", "", "y"]).await;

    let mut c = Client::connect(pop3_addr).await;
    c.line().await;
    c.cmd("USER james").await;
    c.cmd("PASS x").await;
    assert_eq!(c.cmd("DELE 1").await, "+OK Deleted message 1");
    assert!(c.cmd("RETR 1").await.starts_with("-ERR"));
    c.cmd("QUIT").await;

    let left = store.mailbox_for("james").unwrap().list().unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].subject, "b");
}

#[tokio::test]
async fn test_file_store_round_trip_over_the_wire() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn DataStore> = Arc::new(FileDataStore::open(dir.path(), 0).unwrap());
    let (smtp_addr, _smtp) = start_smtp(Arc::clone(&store)).await;
    let (pop3_addr, _pop3) = start_pop3(Arc::clone(&store), Duration::from_secs(5)).await;

    smtp_deliver(smtp_addr, "james+lists@example.com", &["Subject: keep", "", "kept"]).await;
    smtp_deliver(smtp_addr, "james@example.com", &["Subject: drop", "", "dropped"]).await;

    let mut c = Client::connect(pop3_addr).await;
    c.line().await;
    c.cmd("USER james").await;
    assert_eq!(c.cmd("PASS x").await, "+OK Found 2 messages for james");
    assert!(c.cmd("TOP 2 0").await.starts_with("+OK"));
    assert!(c.body().await.contains(&"Subject: drop".to_string()));
    assert_eq!(c.cmd("DELE 2").await, "+OK Deleted message 2");
    assert_eq!(c.cmd("QUIT").await, "+OK Goodnight and good luck");
    assert_eq!(c.line().await, None);

    let reopened = FileDataStore::open(dir.path(), 0).unwrap();
    let left = reopened.mailbox_for("james").unwrap().list().unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].subject, "keep");
}

// ─── POP3 protocol errors ───────────────────────────────────────────

#[tokio::test]
async fn test_pop3_errors_keep_session_alive() {
    let store: Arc<dyn DataStore> = Arc::new(MemoryDataStore::default());
    let (addr, _pop3) = start_pop3(store, Duration::from_secs(5)).await;

    let mut c = Client::connect(addr).await;
    c.line().await;
    assert_eq!(c.cmd("STAT").await, "-ERR Command STAT is out of sequence");
    assert_eq!(c.cmd("PASS x").await, "-ERR Command PASS is out of sequence");
    assert_eq!(
        c.cmd("XYZZY").await,
        "-ERR Syntax error, XYZZY command unrecognized"
    );
    assert_eq!(c.cmd("NOOP").await, "+OK I have successfully done nothing");

    c.cmd("USER nobody").await;
    assert_eq!(c.cmd("PASS x").await, "+OK Found 0 messages for nobody");
    assert_eq!(c.cmd("STAT").await, "+OK 0 0");
    assert_eq!(c.cmd("QUIT").await, "+OK Goodnight and good luck");
    assert_eq!(c.line().await, None);
}

#[tokio::test]
async fn test_pop3_idle_client_is_disconnected() {
    let store: Arc<dyn DataStore> = Arc::new(MemoryDataStore::default());
    let (addr, _pop3) = start_pop3(store, Duration::from_millis(100)).await;

    let mut c = Client::connect(addr).await;
    c.line().await;
    assert_eq!(c.line().await.unwrap(), "-ERR Idle timeout, bye bye");
    assert_eq!(c.line().await, None);
}

// ─── Lifecycle ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_stop_refuses_new_work_and_drain_waits_for_sessions() {
    let store: Arc<dyn DataStore> = Arc::new(MemoryDataStore::default());
    let server = ConnectionServer::bind(
        "127.0.0.1:0",
        Pop3Handler::new(store, pop3_settings(Duration::from_secs(5))),
    )
    .await
    .unwrap();
    let addr = server.local_addr();
    let handle = server.handle();
    let serving = tokio::spawn(server.serve());

    let mut c = Client::connect(addr).await;
    c.line().await;
    assert_eq!(handle.active_sessions(), 1);

    handle.stop();
    serving.await.unwrap().unwrap();
    assert!(handle.is_stopped());
    assert!(TcpStream::connect(addr).await.is_err());

    // The open session still works until the client leaves.
    let drain = tokio::spawn({
        let handle = handle.clone();
        async move { handle.drain().await }
    });
    assert!(c.cmd("NOOP").await.starts_with("+OK"));
    assert!(!drain.is_finished());
    c.cmd("QUIT").await;

    tokio::time::timeout(Duration::from_secs(5), drain)
        .await
        .expect("drain did not finish")
        .unwrap();
    assert_eq!(handle.active_sessions(), 0);
}
