//! One POP3 dialogue (RFC 1939) as a state machine.

use std::fmt;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, info, trace, warn};

use crate::error::{MailError, Result};
use crate::model::message::MessageMeta;
use crate::pop3::Pop3Settings;
use crate::server::connection::LineConnection;
use crate::store::{DataStore, Mailbox};

/// Session states. `Update` is transient: it is entered on `QUIT` from
/// `Transaction` while pending deletions are committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Authorization,
    Transaction,
    Update,
    Quit,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Authorization => "AUTHORIZATION",
            State::Transaction => "TRANSACTION",
            State::Update => "UPDATE",
            State::Quit => "QUIT",
        };
        f.write_str(name)
    }
}

/// Every command the session understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verb {
    Quit,
    Stat,
    List,
    Retr,
    Dele,
    Noop,
    Rset,
    Top,
    Uidl,
    User,
    Pass,
    Apop,
    Capa,
}

impl Verb {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "QUIT" => Verb::Quit,
            "STAT" => Verb::Stat,
            "LIST" => Verb::List,
            "RETR" => Verb::Retr,
            "DELE" => Verb::Dele,
            "NOOP" => Verb::Noop,
            "RSET" => Verb::Rset,
            "TOP" => Verb::Top,
            "UIDL" => Verb::Uidl,
            "USER" => Verb::User,
            "PASS" => Verb::Pass,
            "APOP" => Verb::Apop,
            "CAPA" => Verb::Capa,
            _ => return None,
        })
    }

    fn as_str(self) -> &'static str {
        match self {
            Verb::Quit => "QUIT",
            Verb::Stat => "STAT",
            Verb::List => "LIST",
            Verb::Retr => "RETR",
            Verb::Dele => "DELE",
            Verb::Noop => "NOOP",
            Verb::Rset => "RSET",
            Verb::Top => "TOP",
            Verb::Uidl => "UIDL",
            Verb::User => "USER",
            Verb::Pass => "PASS",
            Verb::Apop => "APOP",
            Verb::Capa => "CAPA",
        }
    }
}

/// Split a line into an upper-cased command and its arguments.
fn tokenize(line: &str) -> (String, Vec<&str>) {
    let mut words = line.split_whitespace();
    let command = words.next().unwrap_or_default().to_ascii_uppercase();
    (command, words.collect())
}

/// Validate a 1-based message number argument.
fn message_number(verb: Verb, arg: &str, count: usize) -> Result<usize> {
    let verb = verb.as_str();
    let n: i64 = arg
        .parse()
        .map_err(|_| MailError::ProtocolSyntax(format!("{verb} command requires an integer argument")))?;
    if n < 1 {
        return Err(MailError::ProtocolSyntax(format!(
            "{verb} argument must be greater than 0"
        )));
    }
    if n as u64 > count as u64 {
        return Err(MailError::ProtocolSyntax(format!(
            "{verb} argument must not exceed the number of messages"
        )));
    }
    Ok(n as usize)
}

/// Split raw message bytes into lines without their terminators.
fn raw_lines(raw: &[u8]) -> Vec<&[u8]> {
    if raw.is_empty() {
        return Vec::new();
    }
    let body = raw.strip_suffix(b"\n").unwrap_or(raw);
    body.split(|&b| b == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
        .collect()
}

/// Prefix lines starting with `.` with another `.`.
fn dot_stuff(line: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(line.len() + 1);
    if line.first() == Some(&b'.') {
        out.push(b'.');
    }
    out.extend_from_slice(line);
    out
}

/// Headers, the blank separator and the first `body_lines` body lines.
fn top_lines(raw: &[u8], body_lines: usize) -> Vec<&[u8]> {
    let mut out = Vec::new();
    let mut in_body = false;
    let mut remaining = body_lines;
    for line in raw_lines(raw) {
        if in_body {
            if remaining == 0 {
                break;
            }
            remaining -= 1;
        } else if line.is_empty() {
            in_body = true;
        }
        out.push(line);
    }
    out
}

/// State of one POP3 connection.
pub struct Pop3Session<R, W> {
    id: u64,
    conn: LineConnection<R, W>,
    store: Arc<dyn DataStore>,
    domain: String,
    state: State,
    user: Option<String>,
    mailbox: Option<Arc<dyn Mailbox>>,
    /// Snapshot taken at `PASS`; message numbers index into it.
    messages: Vec<MessageMeta>,
    /// `false` once a message is marked with `DELE`.
    retain: Vec<bool>,
}

impl<R, W> Pop3Session<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(
        id: u64,
        reader: R,
        writer: W,
        store: Arc<dyn DataStore>,
        settings: &Pop3Settings,
    ) -> Self {
        Self {
            id,
            conn: LineConnection::new(reader, writer, settings.idle_timeout),
            store,
            domain: settings.domain.clone(),
            state: State::Authorization,
            user: None,
            mailbox: None,
            messages: Vec::new(),
            retain: Vec::new(),
        }
    }

    /// Greet the client and process commands until the session ends.
    pub async fn run(mut self) {
        self.conn
            .send(format!("+OK {} POP3 server ready", self.domain))
            .await;

        while self.state != State::Quit && self.conn.send_error().is_none() {
            match self.conn.read_line().await {
                Ok(Some(line)) => {
                    let line = String::from_utf8_lossy(&line).into_owned();
                    if !self.dispatch(&line).await {
                        break;
                    }
                }
                Ok(None) => {
                    if self.state == State::Authorization {
                        info!(state = %self.state, "Client closed connection");
                    } else {
                        warn!(state = %self.state, "Got EOF");
                    }
                    break;
                }
                Err(e @ MailError::ProtocolSyntax(_)) => self.reject(e).await,
                Err(e @ MailError::IdleTimeout(_)) => {
                    warn!(error = %e, "Closing idle connection");
                    self.conn.send("-ERR Idle timeout, bye bye").await;
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Connection error");
                    self.conn.send("-ERR Connection error, sorry").await;
                    break;
                }
            }
        }

        if let Some(e) = self.conn.send_error() {
            warn!(error = %e, "Network send error");
        }
        info!(session = self.id, "Closing connection");
    }

    /// Handle one command line. Returns `false` when the loop must end.
    async fn dispatch(&mut self, line: &str) -> bool {
        let (command, args) = tokenize(line);
        if command.is_empty() {
            self.conn.send("-ERR Speak up").await;
            return true;
        }
        let Some(verb) = Verb::parse(&command) else {
            warn!(command = %command, "Unrecognized command");
            self.conn
                .send(format!("-ERR Syntax error, {command} command unrecognized"))
                .await;
            return true;
        };

        match verb {
            Verb::Quit => {
                self.quit().await;
                return true;
            }
            Verb::Noop => {
                self.conn.send("+OK I have successfully done nothing").await;
                return true;
            }
            Verb::Rset => {
                trace!("Resetting session state on RSET request");
                self.retain_all();
                self.conn.send("+OK Session reset").await;
                return true;
            }
            Verb::Capa => {
                self.conn
                    .send_lines(["+OK Capability list follows", "TOP", "USER", "UIDL", "."])
                    .await;
                return true;
            }
            Verb::Apop => {
                warn!("APOP not implemented");
                self.conn.send("-ERR APOP command not implemented").await;
                return true;
            }
            _ => {}
        }

        match self.state {
            State::Authorization => self.authorization(verb, &args).await,
            State::Transaction => self.transaction(verb, &args).await,
            State::Update | State::Quit => {
                error!(state = %self.state, "Session entered unexpected state");
                return false;
            }
        }
        true
    }

    fn enter_state(&mut self, state: State) {
        trace!(from = %self.state, to = %state, "Entering state");
        self.state = state;
    }

    async fn out_of_sequence(&mut self, verb: Verb) {
        let err = MailError::OutOfSequence(verb.as_str().to_string());
        warn!(state = %self.state, error = %err, "Unexpected command");
        self.conn.send(format!("-ERR {err}")).await;
    }

    async fn reject(&mut self, err: MailError) {
        let reason = match err {
            MailError::ProtocolSyntax(reason) => reason,
            other => other.to_string(),
        };
        warn!(reason = %reason, "Rejected command");
        self.conn.send(format!("-ERR {reason}")).await;
    }

    fn retain_all(&mut self) {
        self.retain = vec![true; self.messages.len()];
    }

    fn retained(&self) -> impl Iterator<Item = (usize, &MessageMeta)> {
        self.messages
            .iter()
            .enumerate()
            .filter(|(i, _)| self.retain[*i])
            .map(|(i, m)| (i + 1, m))
    }

    async fn quit(&mut self) {
        if self.state == State::Transaction {
            self.enter_state(State::Update);
            let failed = self.process_deletes();
            if failed > 0 {
                self.conn
                    .send(format!("-ERR {failed} deleted messages were not removed"))
                    .await;
                self.enter_state(State::Quit);
                return;
            }
        }
        self.conn.send("+OK Goodnight and good luck").await;
        self.enter_state(State::Quit);
    }

    /// Commit `DELE` marks. Returns how many deletions failed.
    fn process_deletes(&self) -> usize {
        let Some(mailbox) = self.mailbox.as_ref() else {
            return 0;
        };
        let mut failed = 0;
        for (meta, _) in self
            .messages
            .iter()
            .zip(self.retain.iter())
            .filter(|(_, keep)| !**keep)
        {
            match mailbox.delete(&meta.id) {
                Ok(()) => debug!(id = %meta.id, "Deleted message"),
                Err(MailError::NotFound(_)) => trace!(id = %meta.id, "Message already gone"),
                Err(e) => {
                    error!(id = %meta.id, error = %e, "Failed to delete message");
                    failed += 1;
                }
            }
        }
        failed
    }

    async fn authorization(&mut self, verb: Verb, args: &[&str]) {
        match verb {
            Verb::User => match args.first() {
                Some(user) => {
                    self.user = Some(user.to_string());
                    self.conn
                        .send(format!("+OK Hello {user}, welcome to mailcatch"))
                        .await;
                }
                None => self.conn.send("-ERR Missing username argument").await,
            },
            Verb::Pass => {
                let Some(user) = self.user.clone() else {
                    self.out_of_sequence(verb).await;
                    return;
                };
                let opened = self
                    .store
                    .mailbox_for(&user)
                    .and_then(|mb| mb.list().map(|messages| (mb, messages)));
                match opened {
                    Ok((mailbox, messages)) => {
                        self.mailbox = Some(mailbox);
                        self.messages = messages;
                        self.retain_all();
                        info!(user = %user, count = self.messages.len(), "Mailbox opened");
                        self.conn
                            .send(format!(
                                "+OK Found {} messages for {user}",
                                self.messages.len()
                            ))
                            .await;
                        self.enter_state(State::Transaction);
                    }
                    Err(e) => {
                        error!(user = %user, error = %e, "Failed to open mailbox");
                        self.user = None;
                        self.conn
                            .send(format!("-ERR Failed to open mailbox for {user}"))
                            .await;
                    }
                }
            }
            _ => self.out_of_sequence(verb).await,
        }
    }

    async fn transaction(&mut self, verb: Verb, args: &[&str]) {
        match verb {
            Verb::Stat => {
                let (count, size) = self
                    .retained()
                    .fold((0usize, 0u64), |(c, s), (_, m)| (c + 1, s + m.size));
                self.conn.send(format!("+OK {count} {size}")).await;
            }
            Verb::List | Verb::Uidl => self.listing(verb, args).await,
            Verb::Dele => {
                let n = match self.single_retained_arg(verb, args) {
                    Ok(n) => n,
                    Err(e) => return self.reject(e).await,
                };
                self.retain[n - 1] = false;
                self.conn.send(format!("+OK Deleted message {n}")).await;
            }
            Verb::Retr => {
                let n = match self.single_retained_arg(verb, args) {
                    Ok(n) => n,
                    Err(e) => return self.reject(e).await,
                };
                self.send_message(n, None).await;
            }
            Verb::Top => {
                if args.len() != 2 {
                    return self
                        .reject(MailError::ProtocolSyntax(
                            "TOP command requires two arguments".into(),
                        ))
                        .await;
                }
                let n = match self.retained_number(verb, args[0]) {
                    Ok(n) => n,
                    Err(e) => return self.reject(e).await,
                };
                let Ok(lines) = args[1].parse::<usize>() else {
                    return self
                        .reject(MailError::ProtocolSyntax(
                            "TOP second argument must be a non-negative integer".into(),
                        ))
                        .await;
                };
                self.send_message(n, Some(lines)).await;
            }
            _ => self.out_of_sequence(verb).await,
        }
    }

    fn retained_number(&self, verb: Verb, arg: &str) -> Result<usize> {
        let n = message_number(verb, arg, self.messages.len())?;
        if !self.retain[n - 1] {
            return Err(MailError::ProtocolSyntax(format!("You deleted message {n}")));
        }
        Ok(n)
    }

    fn single_retained_arg(&self, verb: Verb, args: &[&str]) -> Result<usize> {
        match args {
            [arg] => self.retained_number(verb, arg),
            _ => Err(MailError::ProtocolSyntax(format!(
                "{} command requires a single argument",
                verb.as_str()
            ))),
        }
    }

    /// `LIST` and `UIDL`, with or without a message number.
    async fn listing(&mut self, verb: Verb, args: &[&str]) {
        let column = |m: &MessageMeta| match verb {
            Verb::Uidl => m.id.clone(),
            _ => m.size.to_string(),
        };
        match args {
            [] => {
                let mut lines = vec![format!("+OK Listing {} messages", self.retained().count())];
                lines.extend(self.retained().map(|(n, m)| format!("{n} {}", column(m))));
                lines.push(".".to_string());
                self.conn.send_lines(lines).await;
            }
            [arg] => match self.retained_number(verb, arg) {
                Ok(n) => {
                    let value = column(&self.messages[n - 1]);
                    self.conn.send(format!("+OK {n} {value}")).await;
                }
                Err(e) => self.reject(e).await,
            },
            _ => {
                self.reject(MailError::ProtocolSyntax(format!(
                    "{} command must have zero or one argument",
                    verb.as_str()
                )))
                .await
            }
        }
    }

    /// `RETR` (whole message) or `TOP` (`body_lines` set).
    async fn send_message(&mut self, n: usize, body_lines: Option<usize>) {
        let Some(mailbox) = self.mailbox.clone() else {
            return self.out_of_sequence(Verb::Retr).await;
        };
        let id = self.messages[n - 1].id.clone();
        let raw = match mailbox.read_raw(&id) {
            Ok(raw) => raw,
            Err(e) => {
                error!(id = %id, error = %e, "Failed to read message");
                self.conn
                    .send("-ERR Failed to retrieve that message, internal error")
                    .await;
                return;
            }
        };

        let selected: Vec<&[u8]> = match body_lines {
            Some(count) => top_lines(&raw, count),
            None => raw_lines(&raw),
        };
        let mut lines = Vec::with_capacity(selected.len() + 2);
        lines.push(format!("+OK {} octets", raw.len()).into_bytes());
        lines.extend(selected.into_iter().map(dot_stuff));
        lines.push(b".".to_vec());
        self.conn.send_lines(lines).await;
    }
}
