//! Message metadata and decoded body types.

use chrono::{DateTime, Utc};

/// Metadata for a single stored message, persisted in the mailbox index.
///
/// `from`, `to` and `subject` are filled in from the headers when the
/// message is closed; they are empty while the message is still open.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct MessageMeta {
    /// Process-unique, time-derived identifier (`20240131T235959-0042`).
    pub id: String,

    /// Receipt timestamp, assigned at creation.
    pub date: DateTime<Utc>,

    /// Sender, normalized through address parsing when possible.
    pub from: String,

    /// One entry per recipient listed in the `To:` header.
    pub to: Vec<String>,

    /// Decoded subject line.
    pub subject: String,

    /// Byte length of the raw message.
    pub size: u64,
}

impl std::fmt::Display for MessageMeta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "\"{}\" from {}", self.subject, self.from)
    }
}

/// Full body of a message, decoded on demand from the raw file.
///
/// Never stored in the index.
#[derive(Debug, Clone)]
pub struct MessageBody {
    /// Plain-text body (from the `text/plain` part, or stripped from HTML).
    pub text: Option<String>,

    /// HTML body (from the `text/html` part, if present). Not sanitized.
    pub html: Option<String>,

    /// Raw headers as a single string.
    pub raw_headers: String,

    /// Names of attached parts.
    pub attachments: Vec<String>,
}
