//! Centralized error types for mailcatch.

use std::path::PathBuf;
use thiserror::Error;

/// All errors produced by the mailcatch library.
#[derive(Error, Debug)]
pub enum MailError {
    /// A message or mailbox id is not present.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Append or close was called on a message that is no longer open.
    #[error("Message {0} is not writable")]
    NotWritable(String),

    /// The recipient address cannot be mapped to a mailbox.
    #[error("Invalid address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    /// The persisted index is corrupt or was written by an incompatible version.
    #[error("Corrupt or incompatible index '{path}': {reason}")]
    IndexCorrupt { path: PathBuf, reason: String },

    /// I/O error against the backing storage, with the associated path.
    #[error("Storage unavailable at '{path}': {source}")]
    StorageUnavailable {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A command line could not be parsed.
    #[error("Syntax error: {0}")]
    ProtocolSyntax(String),

    /// A valid command was sent in a state that does not accept it.
    #[error("Command {0} is out of sequence")]
    OutOfSequence(String),

    /// The peer stayed silent longer than the idle timeout.
    #[error("Idle timeout after {0} seconds")]
    IdleTimeout(u64),

    /// The transport (socket or listener) failed.
    #[error("Transport error: {0}")]
    Transport(#[source] std::io::Error),
}

/// Convenience alias for `Result<T, MailError>`.
pub type Result<T> = std::result::Result<T, MailError>;

impl MailError {
    /// Create a `StorageUnavailable` variant from a path and an `io::Error`.
    ///
    /// `NotFound` I/O errors map to [`MailError::NotFound`] so callers can
    /// tell a missing raw file apart from a broken disk.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::NotFound {
            return Self::NotFound(path.display().to_string());
        }
        Self::StorageUnavailable { path, source }
    }

    /// Create an `InvalidAddress` variant.
    pub fn invalid_address(address: &str, reason: impl Into<String>) -> Self {
        Self::InvalidAddress {
            address: address.to_string(),
            reason: reason.into(),
        }
    }
}
