//! Binary index file format.
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │ HEADER                               │
//! │  magic: [u8; 8] = b"MCATIDX\0"       │
//! │  version: u32                        │
//! │  mailbox: String                     │
//! │  message_count: u64                  │
//! ├──────────────────────────────────────┤
//! │ ENTRIES                              │
//! │  bincode-serialized Vec<MessageMeta> │
//! └──────────────────────────────────────┘
//! ```
//!
//! The whole file is one bincode-encoded [`IndexFile`], rewritten wholesale
//! on every mutation.

use crate::model::message::MessageMeta;

/// Magic bytes identifying a mailcatch index file.
pub const MAGIC: &[u8; 8] = b"MCATIDX\0";

/// Current index format version.
pub const VERSION: u32 = 1;

/// File name of the index inside each mailbox directory.
pub const INDEX_FILE: &str = "index.bin";

/// Extension of raw message files.
pub const RAW_EXTENSION: &str = "raw";

/// Serializable index header.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct IndexHeader {
    /// Magic bytes (must equal [`MAGIC`]).
    pub magic: [u8; 8],
    /// Format version (must equal [`VERSION`]).
    pub version: u32,
    /// Normalized name of the mailbox owning this index.
    pub mailbox: String,
    /// Number of entries that follow.
    pub message_count: u64,
}

impl IndexHeader {
    /// Header for a mailbox holding `message_count` messages.
    pub fn new(mailbox: &str, message_count: usize) -> Self {
        Self {
            magic: *MAGIC,
            version: VERSION,
            mailbox: mailbox.to_string(),
            message_count: message_count as u64,
        }
    }

    /// Validate that the header is well-formed and matches the current format.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.magic != *MAGIC {
            return Err("Invalid magic bytes".into());
        }
        if self.version != VERSION {
            return Err(format!(
                "Incompatible version: expected {VERSION}, found {}",
                self.version
            ));
        }
        Ok(())
    }
}

/// Complete on-disk representation of a mailbox index.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct IndexFile {
    pub header: IndexHeader,
    pub entries: Vec<MessageMeta>,
}
