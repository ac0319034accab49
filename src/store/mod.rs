//! Mailbox storage.
//!
//! Three capabilities, each its own trait so that alternate backends satisfy
//! the same contract:
//!
//! - [`DataStore`] resolves recipient addresses to mailboxes.
//! - [`Mailbox`] lists, reads and deletes the messages of one recipient.
//! - [`MessageWriter`] streams a new message in and commits it on close.
//!
//! [`file::FileDataStore`] persists to disk; [`memory::MemoryDataStore`]
//! keeps everything in RAM.

pub mod file;
pub mod memory;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::message::{MessageBody, MessageMeta};

/// Root of the storage hierarchy.
pub trait DataStore: Send + Sync {
    /// Resolve the mailbox for an address, creating it on first use.
    ///
    /// Addresses differing only in local-part case (or `+tag`) resolve to
    /// the same mailbox.
    fn mailbox_for(&self, address: &str) -> Result<Arc<dyn Mailbox>>;

    /// Every mailbox currently holding storage.
    fn all_mailboxes(&self) -> Result<Vec<Arc<dyn Mailbox>>>;
}

/// The messages addressed to one normalized recipient.
pub trait Mailbox: Send + Sync {
    /// Normalized mailbox name.
    fn name(&self) -> &str;

    /// Metadata for every closed message, oldest first.
    fn list(&self) -> Result<Vec<MessageMeta>>;

    /// Metadata for one message.
    fn get(&self, id: &str) -> Result<MessageMeta>;

    /// Start a new message, evicting the oldest messages first when the
    /// mailbox is at capacity.
    fn new_message(&self) -> Result<Box<dyn MessageWriter>>;

    /// The raw bytes of a message, exactly as appended.
    fn read_raw(&self, id: &str) -> Result<Vec<u8>>;

    /// The decoded body of a message.
    fn read_body(&self, id: &str) -> Result<MessageBody>;

    /// Remove a message from the index and reclaim its storage.
    fn delete(&self, id: &str) -> Result<()>;

    /// Remove every message.
    fn purge(&self) -> Result<()>;
}

/// A message being received. Writable until [`MessageWriter::close`].
pub trait MessageWriter: Send {
    fn id(&self) -> &str;

    fn date(&self) -> DateTime<Utc>;

    /// Bytes appended so far.
    fn size(&self) -> u64;

    fn is_writable(&self) -> bool;

    /// Append raw message bytes.
    fn append(&mut self, data: &[u8]) -> Result<()>;

    /// Finish the message: parse its headers and add it to the mailbox index.
    fn close(&mut self) -> Result<MessageMeta>;
}

static ID_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Generate a message id: the receipt time plus a four digit counter that
/// cycles process-wide, e.g. `20240131T235959-0042`.
pub fn generate_id(date: DateTime<Utc>) -> String {
    let n = ID_COUNTER.fetch_add(1, Ordering::Relaxed) % 10_000;
    format!("{}-{n:04}", date.format("%Y%m%dT%H%M%S"))
}
