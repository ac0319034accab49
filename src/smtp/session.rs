//! One SMTP dialogue (RFC 5321) as a state machine.
//!
//! Recipients are mapped to mailboxes as `RCPT` commands arrive; the `DATA`
//! block is streamed into one [`MessageWriter`] per stored recipient.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Utc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, info, trace, warn};

use crate::error::{MailError, Result};
use crate::model::address::parse_mailbox_name;
use crate::server::connection::{LineConnection, MAX_COMMAND_LINE};
use crate::smtp::SmtpSettings;
use crate::store::{DataStore, MessageWriter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Waiting for `HELO`/`EHLO`.
    Greet,
    /// Waiting for `MAIL`.
    Ready,
    /// Accepting `RCPT` until `DATA`.
    Mail,
    /// Reading the message block.
    Data,
    Quit,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Greet => "GREET",
            State::Ready => "READY",
            State::Mail => "MAIL",
            State::Data => "DATA",
            State::Quit => "QUIT",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verb {
    Helo,
    Ehlo,
    Mail,
    Rcpt,
    Data,
    Rset,
    Send,
    Soml,
    Saml,
    Vrfy,
    Expn,
    Help,
    Noop,
    Quit,
    Turn,
}

impl Verb {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "HELO" => Verb::Helo,
            "EHLO" => Verb::Ehlo,
            "MAIL" => Verb::Mail,
            "RCPT" => Verb::Rcpt,
            "DATA" => Verb::Data,
            "RSET" => Verb::Rset,
            "SEND" => Verb::Send,
            "SOML" => Verb::Soml,
            "SAML" => Verb::Saml,
            "VRFY" => Verb::Vrfy,
            "EXPN" => Verb::Expn,
            "HELP" => Verb::Help,
            "NOOP" => Verb::Noop,
            "QUIT" => Verb::Quit,
            "TURN" => Verb::Turn,
            _ => return None,
        })
    }

    fn as_str(self) -> &'static str {
        match self {
            Verb::Helo => "HELO",
            Verb::Ehlo => "EHLO",
            Verb::Mail => "MAIL",
            Verb::Rcpt => "RCPT",
            Verb::Data => "DATA",
            Verb::Rset => "RSET",
            Verb::Send => "SEND",
            Verb::Soml => "SOML",
            Verb::Saml => "SAML",
            Verb::Vrfy => "VRFY",
            Verb::Expn => "EXPN",
            Verb::Help => "HELP",
            Verb::Noop => "NOOP",
            Verb::Quit => "QUIT",
            Verb::Turn => "TURN",
        }
    }
}

/// Split a line into an upper-cased verb and the trimmed remainder.
fn parse_command(line: &str) -> (String, &str) {
    let line = line.trim_end_matches(['\r', '\n']);
    match line.split_once(' ') {
        Some((verb, arg)) => (verb.to_ascii_uppercase(), arg.trim()),
        None => (line.to_ascii_uppercase(), ""),
    }
}

/// Parse `FROM:<addr>` / `TO:<addr>` and any trailing ESMTP parameters.
fn parse_path<'a>(arg: &'a str, prefix: &str) -> Result<(&'a str, &'a str)> {
    let syntax = || {
        MailError::ProtocolSyntax(format!("Was expecting arg syntax of {prefix}<address>"))
    };
    let head = arg.get(..prefix.len()).ok_or_else(syntax)?;
    if !head.eq_ignore_ascii_case(prefix) {
        return Err(syntax());
    }
    let rest = arg[prefix.len()..].trim_start();
    let rest = rest.strip_prefix('<').ok_or_else(syntax)?;
    let (address, params) = rest.split_once('>').ok_or_else(syntax)?;
    Ok((address.trim(), params.trim()))
}

/// Extract the `SIZE=` ESMTP parameter, if present.
fn size_param(params: &str) -> Result<Option<u64>> {
    for param in params.split_whitespace() {
        let Some((key, value)) = param.split_once('=') else {
            return Err(MailError::ProtocolSyntax(
                "Unable to parse MAIL ESMTP parameters".into(),
            ));
        };
        if key.eq_ignore_ascii_case("SIZE") {
            let size = value.parse().map_err(|_| {
                MailError::ProtocolSyntax("Unable to parse SIZE as an integer".into())
            })?;
            return Ok(Some(size));
        }
    }
    Ok(None)
}

/// The domain part of an address, lower-cased.
fn domain_of(address: &str) -> Option<String> {
    address
        .rsplit_once('@')
        .map(|(_, domain)| domain.to_ascii_lowercase())
}

/// An accepted recipient.
#[derive(Debug, Clone)]
struct Recipient {
    address: String,
    store: bool,
}

/// How a `DATA` block ended.
enum DataOutcome {
    Complete,
    TooLarge,
    StoreFailed,
}

/// State of one SMTP connection.
pub struct SmtpSession<R, W> {
    id: u64,
    peer: SocketAddr,
    conn: LineConnection<R, W>,
    store: Arc<dyn DataStore>,
    settings: SmtpSettings,
    state: State,
    client_domain: String,
    from: Option<String>,
    recipients: Vec<Recipient>,
}

impl<R, W> SmtpSession<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(
        id: u64,
        peer: SocketAddr,
        reader: R,
        writer: W,
        store: Arc<dyn DataStore>,
        settings: SmtpSettings,
    ) -> Self {
        Self {
            id,
            peer,
            conn: LineConnection::new(reader, writer, settings.idle_timeout),
            store,
            settings,
            state: State::Greet,
            client_domain: String::new(),
            from: None,
            recipients: Vec::new(),
        }
    }

    pub async fn run(mut self) {
        let greeting = format!("220 {} mailcatch SMTP ready", self.settings.domain);
        self.conn.send(greeting).await;

        while self.state != State::Quit && self.conn.send_error().is_none() {
            if self.state == State::Data {
                self.data().await;
                continue;
            }
            match self.conn.read_line().await {
                Ok(Some(line)) => {
                    let line = String::from_utf8_lossy(&line).into_owned();
                    self.dispatch(&line).await;
                }
                Ok(None) => {
                    info!(state = %self.state, "Client closed connection");
                    break;
                }
                Err(e @ MailError::ProtocolSyntax(_)) => self.reject(500, e).await,
                Err(e) => {
                    self.connection_failed(e).await;
                    break;
                }
            }
        }

        if let Some(e) = self.conn.send_error() {
            warn!(error = %e, "Network send error");
        }
        info!(session = self.id, "Closing connection");
    }

    async fn connection_failed(&mut self, err: MailError) {
        match err {
            MailError::IdleTimeout(_) => {
                warn!(error = %err, "Closing idle connection");
                self.conn.send("421 Idle timeout, bye bye").await;
            }
            other => {
                warn!(error = %other, "Connection error");
                self.conn.send("421 Connection error, sorry").await;
            }
        }
        self.enter_state(State::Quit);
    }

    async fn dispatch(&mut self, line: &str) {
        let (command, arg) = parse_command(line);
        if command.is_empty() {
            self.conn.send("500 Speak up").await;
            return;
        }
        let Some(verb) = Verb::parse(&command) else {
            warn!(command = %command, "Unrecognized command");
            self.conn
                .send(format!("500 Syntax error, {command} command unrecognized"))
                .await;
            return;
        };

        match verb {
            Verb::Send | Verb::Soml | Verb::Saml | Verb::Expn | Verb::Help | Verb::Turn => {
                warn!(command = verb.as_str(), "Command not implemented");
                self.conn
                    .send(format!("502 {} command not implemented", verb.as_str()))
                    .await;
            }
            Verb::Vrfy => {
                self.conn
                    .send("252 Cannot VRFY user, but will accept message")
                    .await;
            }
            Verb::Noop => self.conn.send("250 I have successfully done nothing").await,
            Verb::Rset => {
                trace!("Resetting session state on RSET request");
                self.reset();
                self.conn.send("250 Session reset").await;
            }
            Verb::Quit => {
                self.conn.send("221 Goodnight and good luck").await;
                self.enter_state(State::Quit);
            }
            _ => match self.state {
                State::Greet => self.greet(verb, arg).await,
                State::Ready => self.ready(verb, arg).await,
                State::Mail => self.mail(verb, arg).await,
                State::Data | State::Quit => {
                    error!(state = %self.state, "Session entered unexpected state");
                    self.enter_state(State::Quit);
                }
            },
        }
    }

    fn enter_state(&mut self, state: State) {
        trace!(from = %self.state, to = %state, "Entering state");
        self.state = state;
    }

    /// Drop the current transaction, keeping the greeting.
    fn reset(&mut self) {
        if self.state != State::Greet {
            self.enter_state(State::Ready);
        }
        self.from = None;
        self.recipients.clear();
    }

    async fn out_of_sequence(&mut self, verb: Verb) {
        let err = MailError::OutOfSequence(verb.as_str().to_string());
        warn!(state = %self.state, error = %err, "Unexpected command");
        self.conn.send(format!("503 {err}")).await;
    }

    async fn reject(&mut self, code: u16, err: MailError) {
        let reason = match err {
            MailError::ProtocolSyntax(reason) => reason,
            other => other.to_string(),
        };
        warn!(code, reason = %reason, "Rejected command");
        self.conn.send(format!("{code} {reason}")).await;
    }

    async fn greet(&mut self, verb: Verb, arg: &str) {
        match verb {
            Verb::Helo => {
                self.client_domain = arg.to_string();
                self.conn
                    .send(format!("250 {} Hello {arg}", self.settings.domain))
                    .await;
                self.enter_state(State::Ready);
            }
            Verb::Ehlo => {
                self.client_domain = arg.to_string();
                let lines = [
                    format!("250-{} Hello {arg}", self.settings.domain),
                    "250-8BITMIME".to_string(),
                    format!("250 SIZE {}", self.settings.max_message_bytes),
                ];
                self.conn.send_lines(lines).await;
                self.enter_state(State::Ready);
            }
            _ => self.out_of_sequence(verb).await,
        }
    }

    async fn ready(&mut self, verb: Verb, arg: &str) {
        if verb != Verb::Mail {
            return self.out_of_sequence(verb).await;
        }
        let (from, params) = match parse_path(arg, "FROM:") {
            Ok(parsed) => parsed,
            Err(e) => return self.reject(501, e).await,
        };
        match size_param(params) {
            Ok(Some(size)) if size > self.settings.max_message_bytes => {
                warn!(size, "Client wanted to send oversized message");
                return self.conn.send("552 Max message size exceeded").await;
            }
            Ok(_) => {}
            Err(e) => return self.reject(501, e).await,
        }

        info!(from = %from, "Mail from");
        self.conn
            .send(format!("250 Roger, accepting mail from <{from}>"))
            .await;
        self.from = Some(from.to_string());
        self.recipients.clear();
        self.enter_state(State::Mail);
    }

    async fn mail(&mut self, verb: Verb, arg: &str) {
        match verb {
            Verb::Rcpt => {
                let address = match parse_path(arg, "TO:") {
                    Ok((address, _)) => address,
                    Err(e) => return self.reject(501, e).await,
                };
                if self.recipients.len() >= self.settings.max_recipients {
                    let limit = self.settings.max_recipients;
                    warn!(limit, "Maximum recipients reached");
                    return self
                        .conn
                        .send(format!("552 Maximum limit of {limit} recipients reached"))
                        .await;
                }
                if let Err(e) = parse_mailbox_name(address) {
                    warn!(address = %address, error = %e, "Bad recipient address");
                    return self
                        .conn
                        .send(format!("501 Bad recipient address syntax <{address}>"))
                        .await;
                }

                let store = self.settings.store_messages
                    && match (&self.settings.domain_no_store, domain_of(address)) {
                        (Some(no_store), Some(domain)) => !no_store.eq_ignore_ascii_case(&domain),
                        _ => true,
                    };
                info!(recipient = %address, store, "Recipient");
                self.conn
                    .send(format!("250 I'll make sure <{address}> gets this"))
                    .await;
                self.recipients.push(Recipient {
                    address: address.to_string(),
                    store,
                });
            }
            Verb::Data => {
                if !arg.is_empty() {
                    warn!(arg = %arg, "Unexpected arguments on DATA");
                    return self
                        .conn
                        .send("501 DATA command should not have any arguments")
                        .await;
                }
                if self.recipients.is_empty() {
                    return self.out_of_sequence(verb).await;
                }
                self.enter_state(State::Data);
            }
            _ => self.out_of_sequence(verb).await,
        }
    }

    /// Trace header prepended to each stored copy.
    fn received_header(&self, recipient: &str) -> String {
        format!(
            "Received: from {} ([{}]) by {}\r\n  for <{recipient}>; {}\r\n",
            self.client_domain,
            self.peer.ip(),
            self.settings.domain,
            Utc::now().to_rfc2822()
        )
    }

    /// Open one writer per stored recipient.
    fn open_writers(&self) -> Result<Vec<Box<dyn MessageWriter>>> {
        let mut writers = Vec::new();
        for recipient in self.recipients.iter().filter(|r| r.store) {
            let mailbox = self.store.mailbox_for(&recipient.address)?;
            let mut writer = mailbox.new_message()?;
            writer.append(self.received_header(&recipient.address).as_bytes())?;
            writers.push(writer);
        }
        Ok(writers)
    }

    async fn data(&mut self) {
        let mut writers = match self.open_writers() {
            Ok(writers) => writers,
            Err(e) => {
                error!(error = %e, "Failed to open mailbox");
                self.conn.send("451 Failed to open mailbox").await;
                self.reset();
                return;
            }
        };

        self.conn
            .send("354 Start mail input; end with <CRLF>.<CRLF>")
            .await;

        let mut size: u64 = 0;
        let mut outcome = DataOutcome::Complete;
        loop {
            // Room for what is left of the size budget plus a stuffed dot and CRLF.
            let limit = match outcome {
                DataOutcome::TooLarge => MAX_COMMAND_LINE,
                _ => {
                    let remaining = self.settings.max_message_bytes.saturating_sub(size);
                    usize::try_from(remaining).unwrap_or(usize::MAX).saturating_add(3)
                }
            };
            let line = match self.conn.read_line_max(limit).await {
                Ok(Some(line)) => line,
                Err(MailError::ProtocolSyntax(_)) => {
                    if matches!(outcome, DataOutcome::Complete) {
                        warn!(limit = self.settings.max_message_bytes, "Max message size exceeded");
                    }
                    writers.clear();
                    outcome = DataOutcome::TooLarge;
                    continue;
                }
                Ok(None) => {
                    warn!("Got EOF while reading DATA");
                    self.enter_state(State::Quit);
                    return;
                }
                Err(e) => {
                    self.connection_failed(e).await;
                    return;
                }
            };
            if line == b".\r\n" || line == b".\n" {
                break;
            }
            let line = line.strip_prefix(b".").unwrap_or(&line);

            size += line.len() as u64;
            if size > self.settings.max_message_bytes {
                if matches!(outcome, DataOutcome::Complete) {
                    warn!(limit = self.settings.max_message_bytes, "Max message size exceeded");
                    writers.clear();
                }
                outcome = DataOutcome::TooLarge;
                continue;
            }
            for writer in writers.iter_mut() {
                if let Err(e) = writer.append(line) {
                    error!(id = writer.id(), error = %e, "Failed to append");
                    outcome = DataOutcome::StoreFailed;
                }
            }
            if matches!(outcome, DataOutcome::StoreFailed) {
                writers.clear();
            }
        }

        if matches!(outcome, DataOutcome::Complete) {
            for writer in writers.iter_mut() {
                match writer.close() {
                    Ok(meta) => debug!(id = %meta.id, size = meta.size, "Stored message"),
                    Err(e) => {
                        error!(id = writer.id(), error = %e, "Failed to store message");
                        outcome = DataOutcome::StoreFailed;
                    }
                }
            }
        }

        match outcome {
            DataOutcome::Complete => {
                info!(size, recipients = self.recipients.len(), "Message accepted");
                self.conn.send("250 Mail accepted for delivery").await;
            }
            DataOutcome::TooLarge => self.conn.send("552 Maximum message size exceeded").await,
            DataOutcome::StoreFailed => self.conn.send("451 Failed to store message").await,
        }
        self.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryDataStore;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};

    struct Client {
        reader: BufReader<ReadHalf<DuplexStream>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl Client {
        async fn line(&mut self) -> String {
            let mut line = String::new();
            self.reader.read_line(&mut line).await.unwrap();
            line.trim_end().to_string()
        }

        async fn write(&mut self, text: &str) {
            self.writer.write_all(text.as_bytes()).await.unwrap();
        }

        async fn cmd(&mut self, command: &str) -> String {
            self.write(&format!("{command}\r\n")).await;
            self.line().await
        }
    }

    fn settings() -> SmtpSettings {
        SmtpSettings {
            domain: "test.local".to_string(),
            domain_no_store: Some("bitbucket.local".to_string()),
            max_recipients: 2,
            idle_timeout: Duration::from_secs(5),
            max_message_bytes: 1024,
            store_messages: true,
        }
    }

    fn start(store: Arc<dyn DataStore>, settings: SmtpSettings) -> Client {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (r, w) = tokio::io::split(server);
        let peer = "192.0.2.7:40000".parse().unwrap();
        let session = SmtpSession::new(1, peer, r, w, store, settings);
        tokio::spawn(session.run());
        let (r, w) = tokio::io::split(client);
        Client {
            reader: BufReader::new(r),
            writer: w,
        }
    }

    #[test]
    fn test_parse_path_and_size() {
        assert_eq!(
            parse_path("from:<a@b.com> SIZE=10", "FROM:").unwrap(),
            ("a@b.com", "SIZE=10")
        );
        assert_eq!(parse_path("TO: <x@y>", "TO:").unwrap(), ("x@y", ""));
        assert!(parse_path("a@b.com", "FROM:").is_err());
        assert_eq!(size_param("BODY=8BITMIME SIZE=42").unwrap(), Some(42));
        assert!(size_param("SIZE=lots").is_err());
        assert_eq!(parse_command("mail FROM:<a@b>\r\n"), ("MAIL".to_string(), "FROM:<a@b>"));
    }

    #[tokio::test]
    async fn test_delivery_to_each_recipient() {
        let store: Arc<dyn DataStore> = Arc::new(MemoryDataStore::new(0));
        let mut client = start(Arc::clone(&store), settings());
        assert!(client.line().await.starts_with("220"));

        assert!(client.cmd("HELO client.example").await.starts_with("250"));
        assert!(client.cmd("MAIL FROM:<sender@example.com>").await.starts_with("250"));
        assert!(client.cmd("RCPT TO:<James@example.com>").await.starts_with("250"));
        assert!(client.cmd("RCPT TO:<drop@bitbucket.local>").await.starts_with("250"));
        assert!(client.cmd("DATA").await.starts_with("354"));
        client
            .write("Subject: hello\r\nTo: james@example.com\r\n\r\n..leading dot\r\n.\r\n")
            .await;
        assert_eq!(client.line().await, "250 Mail accepted for delivery");
        assert!(client.cmd("QUIT").await.starts_with("221"));

        let mailbox = store.mailbox_for("james").unwrap();
        let list = mailbox.list().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].subject, "hello");
        let raw = String::from_utf8(mailbox.read_raw(&list[0].id).unwrap()).unwrap();
        assert!(raw.starts_with("Received: from client.example ([192.0.2.7]) by test.local"));
        assert!(raw.ends_with("\r\n.leading dot\r\n"));
        assert!(store.mailbox_for("drop").unwrap().list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sequence_and_limits() {
        let store: Arc<dyn DataStore> = Arc::new(MemoryDataStore::new(0));
        let mut client = start(store, settings());
        client.line().await;

        assert_eq!(client.cmd("MAIL FROM:<a@b.com>").await, "503 Command MAIL is out of sequence");
        assert!(client.cmd("XYZZY").await.starts_with("500"));
        assert!(client.cmd("EXPN list").await.starts_with("502"));
        client.write("EHLO client\r\n").await;
        assert_eq!(client.line().await, "250-test.local Hello client");
        assert_eq!(client.line().await, "250-8BITMIME");
        assert_eq!(client.line().await, "250 SIZE 1024");

        assert!(client.cmd("MAIL FROM:<a@b.com> SIZE=4096").await.starts_with("552"));
        assert!(client.cmd("MAIL FROM:<a@b.com>").await.starts_with("250"));
        assert_eq!(client.cmd("DATA").await, "503 Command DATA is out of sequence");
        assert!(client.cmd("RCPT TO:<bad..dots@x.com>").await.starts_with("501"));
        assert!(client.cmd("RCPT TO:<a@x.com>").await.starts_with("250"));
        assert!(client.cmd("RCPT TO:<b@x.com>").await.starts_with("250"));
        assert!(client.cmd("RCPT TO:<c@x.com>").await.starts_with("552"));
        assert_eq!(client.cmd("RSET").await, "250 Session reset");
        assert_eq!(client.cmd("RCPT TO:<a@x.com>").await, "503 Command RCPT is out of sequence");
    }

    #[tokio::test]
    async fn test_oversized_data_is_rejected() {
        let store: Arc<dyn DataStore> = Arc::new(MemoryDataStore::new(0));
        let mut client = start(Arc::clone(&store), settings());
        client.line().await;
        client.cmd("HELO c").await;
        client.cmd("MAIL FROM:<a@b.com>").await;
        client.cmd("RCPT TO:<big@x.com>").await;
        assert!(client.cmd("DATA").await.starts_with("354"));
        let filler = "x".repeat(100);
        for _ in 0..20 {
            client.write(&format!("{filler}\r\n")).await;
        }
        client.write(".\r\n").await;
        assert_eq!(client.line().await, "552 Maximum message size exceeded");
        assert!(client.cmd("NOOP").await.starts_with("250"));
        assert!(store.mailbox_for("big").unwrap().list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_idle_timeout_sends_421() {
        let store: Arc<dyn DataStore> = Arc::new(MemoryDataStore::new(0));
        let mut settings = settings();
        settings.idle_timeout = Duration::from_millis(100);
        let mut client = start(store, settings);
        client.line().await;
        assert_eq!(client.line().await, "421 Idle timeout, bye bye");
    }

    #[tokio::test]
    async fn test_overlong_lines_are_bounded() {
        let store: Arc<dyn DataStore> = Arc::new(MemoryDataStore::new(0));
        let mut client = start(Arc::clone(&store), settings());
        client.line().await;

        let long = format!("HELO {}", "c".repeat(2000));
        assert_eq!(client.cmd(&long).await, "500 Line too long");
        assert!(client.cmd("HELO c").await.starts_with("250"));
        client.cmd("MAIL FROM:<a@b.com>").await;
        client.cmd("RCPT TO:<big@x.com>").await;
        assert!(client.cmd("DATA").await.starts_with("354"));

        // A single line past max_message_bytes, never held in full.
        client.write("Subject: big\r\n\r\n").await;
        client.write(&format!("{}\r\n", "y".repeat(32 * 1024))).await;
        client.write(".\r\n").await;
        assert_eq!(client.line().await, "552 Maximum message size exceeded");
        assert!(client.cmd("NOOP").await.starts_with("250"));
        assert!(store.mailbox_for("big").unwrap().list().unwrap().is_empty());
    }
}
