//! File-backed message store.
//!
//! Layout under the configured root:
//!
//! ```text
//! <root>/mail/<h[0..3]>/<h[0..6]>/<h>/index.bin
//! <root>/mail/<h[0..3]>/<h[0..6]>/<h>/<message id>.raw
//! ```
//!
//! where `h` is the hex SHA-256 of the normalized mailbox name.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::{DateTime, Utc};
use lru::LruCache;
use sha2::{Digest, Sha256};
use tracing::{debug, trace, warn};

use crate::error::{MailError, Result};
use crate::index::format::{INDEX_FILE, RAW_EXTENSION};
use crate::index::persist;
use crate::model::address::parse_mailbox_name;
use crate::model::message::{MessageBody, MessageMeta};
use crate::parser::{header, mime};
use crate::store::{generate_id, DataStore, Mailbox, MessageWriter};

/// Number of decoded bodies kept per mailbox.
const BODY_CACHE_SIZE: usize = 16;

/// Ids tried before giving up on finding one without a raw file.
const ID_ATTEMPTS: usize = 16;

/// Hash a mailbox name into the directory name that stores it.
pub fn hash_mailbox_name(name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Root of the on-disk store.
///
/// While any handle to a mailbox is alive, every lookup returns a handle
/// sharing the same lock. Mailboxes nobody holds are dropped from memory.
pub struct FileDataStore {
    mail_path: PathBuf,
    mailbox_msg_cap: usize,
    mailboxes: Mutex<HashMap<String, Weak<MailboxInner>>>,
}

impl FileDataStore {
    /// Open (creating if needed) a store rooted at `path`.
    ///
    /// `mailbox_msg_cap` of 0 disables eviction.
    pub fn open(path: impl AsRef<Path>, mailbox_msg_cap: usize) -> Result<Self> {
        let mail_path = path.as_ref().join("mail");
        std::fs::create_dir_all(&mail_path).map_err(|e| MailError::io(&mail_path, e))?;
        debug!(path = %mail_path.display(), cap = mailbox_msg_cap, "Opened file store");
        Ok(Self {
            mail_path,
            mailbox_msg_cap,
            mailboxes: Mutex::new(HashMap::new()),
        })
    }

    fn mailbox_path(&self, dir_name: &str) -> PathBuf {
        self.mail_path
            .join(&dir_name[0..3])
            .join(&dir_name[0..6])
            .join(dir_name)
    }

    fn live_handle(&self, dir_name: &str) -> Option<FileMailbox> {
        lock(&self.mailboxes)
            .get(dir_name)
            .and_then(Weak::upgrade)
            .map(|inner| FileMailbox { inner })
    }

    /// Shared handle for a hashed directory, constructing it when no live
    /// handle exists.
    fn handle(&self, dir_name: &str, name: String) -> FileMailbox {
        let mut cache = lock(&self.mailboxes);
        if let Some(inner) = cache.get(dir_name).and_then(Weak::upgrade) {
            return FileMailbox { inner };
        }
        cache.retain(|_, inner| inner.strong_count() > 0);
        let mailbox = self.detached(dir_name, name);
        cache.insert(dir_name.to_string(), Arc::downgrade(&mailbox.inner));
        mailbox
    }

    fn detached(&self, dir_name: &str, name: String) -> FileMailbox {
        FileMailbox::new(
            name,
            dir_name.to_string(),
            self.mailbox_path(dir_name),
            self.mailbox_msg_cap,
        )
    }

    /// Handle for a directory found on disk.
    ///
    /// Only directories whose index records the mailbox name are shared;
    /// the rest get a private handle named after the hash.
    fn discovered(&self, dir_name: &str, path: &Path) -> FileMailbox {
        match persist::load_index(&path.join(INDEX_FILE)) {
            Ok(loaded) => match loaded.mailbox {
                Some(name) => self.handle(dir_name, name),
                None => self.detached(dir_name, dir_name.to_string()),
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Unreadable index");
                self.detached(dir_name, dir_name.to_string())
            }
        }
    }

    #[cfg(test)]
    fn cached_handles(&self) -> usize {
        lock(&self.mailboxes).len()
    }
}

fn subdirectories(path: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(path).map_err(|e| MailError::io(path, e))? {
        let entry = entry.map_err(|e| MailError::io(path, e))?;
        if entry.path().is_dir() {
            dirs.push((entry.file_name().to_string_lossy().into_owned(), entry.path()));
        }
    }
    dirs.sort();
    Ok(dirs)
}

impl DataStore for FileDataStore {
    fn mailbox_for(&self, address: &str) -> Result<Arc<dyn Mailbox>> {
        let name = parse_mailbox_name(address)?;
        let dir_name = hash_mailbox_name(&name);
        Ok(Arc::new(self.handle(&dir_name, name)))
    }

    fn all_mailboxes(&self) -> Result<Vec<Arc<dyn Mailbox>>> {
        let mut mailboxes: Vec<Arc<dyn Mailbox>> = Vec::new();
        for (_, level1) in subdirectories(&self.mail_path)? {
            for (_, level2) in subdirectories(&level1)? {
                for (dir_name, path) in subdirectories(&level2)? {
                    let mailbox = self
                        .live_handle(&dir_name)
                        .unwrap_or_else(|| self.discovered(&dir_name, &path));
                    mailboxes.push(Arc::new(mailbox));
                }
            }
        }
        Ok(mailboxes)
    }
}

/// In-memory view of a mailbox index.
#[derive(Default)]
struct MailboxState {
    index_loaded: bool,
    messages: Vec<MessageMeta>,
    /// Writers handed out and not yet dropped. Their raw files live in the
    /// mailbox directory, so it is only removed while this is zero.
    open_writers: usize,
}

struct MailboxInner {
    name: String,
    dir_name: String,
    path: PathBuf,
    index_path: PathBuf,
    cap: usize,
    /// Held for every read-modify-write of the index.
    state: Mutex<MailboxState>,
    bodies: Mutex<LruCache<String, MessageBody>>,
}

/// One recipient's directory: an index plus one raw file per message.
#[derive(Clone)]
pub struct FileMailbox {
    inner: Arc<MailboxInner>,
}

impl std::fmt::Display for FileMailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.inner.name, self.inner.dir_name)
    }
}

impl FileMailbox {
    fn new(name: String, dir_name: String, path: PathBuf, cap: usize) -> Self {
        let index_path = path.join(INDEX_FILE);
        let cache_size = NonZeroUsize::new(BODY_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(MailboxInner {
                name,
                dir_name,
                path,
                index_path,
                cap,
                state: Mutex::new(MailboxState::default()),
                bodies: Mutex::new(LruCache::new(cache_size)),
            }),
        }
    }

    fn raw_path(&self, id: &str) -> PathBuf {
        self.inner.path.join(format!("{id}.{RAW_EXTENSION}"))
    }

    fn create_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.inner.path).map_err(|e| MailError::io(&self.inner.path, e))
    }

    /// Replace the in-memory list with the persisted index.
    fn reload(&self, state: &mut MailboxState) -> Result<()> {
        let loaded = persist::load_index(&self.inner.index_path)?;
        state.messages = loaded.entries;
        state.index_loaded = true;
        Ok(())
    }

    fn ensure_loaded(&self, state: &mut MailboxState) -> Result<()> {
        if state.index_loaded {
            return Ok(());
        }
        self.reload(state)
    }

    /// Remove the whole mailbox directory once it holds no messages.
    fn reclaim_storage(&self) -> Result<()> {
        trace!(mailbox = %self, "Removing mailbox directory");
        match std::fs::remove_dir_all(&self.inner.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(MailError::io(&self.inner.path, e)),
        }
    }

    fn forget_body(&self, id: &str) {
        lock(&self.inner.bodies).pop(id);
    }

    /// Empty the mailbox without touching raw files of open writers.
    fn clear_index_locked(&self, state: &mut MailboxState) -> Result<()> {
        let indexed = match persist::load_index(&self.inner.index_path) {
            Ok(loaded) => loaded.entries,
            Err(e) => {
                warn!(mailbox = %self, error = %e, "Purging mailbox with unreadable index");
                Vec::new()
            }
        };
        if self.inner.path.exists() {
            persist::write_index(&self.inner.index_path, &self.inner.name, &[])?;
        }
        state.messages.clear();
        state.index_loaded = true;

        for meta in indexed {
            let raw = self.raw_path(&meta.id);
            match std::fs::remove_file(&raw) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %raw.display(), error = %e, "Failed to remove raw message"),
            }
        }
        Ok(())
    }

    /// First id in this mailbox with no raw file on disk.
    fn unused_id(&self, date: DateTime<Utc>) -> Result<String> {
        std::iter::repeat_with(|| generate_id(date))
            .take(ID_ATTEMPTS)
            .find(|id| !self.raw_path(id).exists())
            .ok_or_else(|| MailError::NotWritable(format!("no free message id in mailbox {self}")))
    }

    /// Called when a writer is dropped. Removes the directory if the
    /// mailbox was emptied while the writer was open.
    fn release_writer(&self) {
        let mut state = lock(&self.inner.state);
        state.open_writers = state.open_writers.saturating_sub(1);
        if state.open_writers > 0 || !state.messages.is_empty() || !self.inner.path.exists() {
            return;
        }
        let emptied = self.reload(&mut state).map(|()| state.messages.is_empty());
        match emptied {
            Ok(true) => {
                if let Err(e) = self.reclaim_storage() {
                    warn!(mailbox = %self, error = %e, "Failed to remove empty mailbox");
                }
            }
            Ok(false) => {}
            Err(e) => warn!(mailbox = %self, error = %e, "Failed to reload index"),
        }
    }

    /// Delete `id` while the state lock is held.
    ///
    /// The in-memory list only changes once the new index is on disk.
    fn delete_locked(&self, state: &mut MailboxState, id: &str) -> Result<()> {
        self.ensure_loaded(state)?;
        self.forget_body(id);

        if let Some(pos) = state.messages.iter().position(|m| m.id == id) {
            let mut remaining = state.messages.clone();
            remaining.remove(pos);
            if remaining.is_empty() && state.open_writers == 0 {
                self.reclaim_storage()?;
                state.messages = remaining;
                return Ok(());
            }
            persist::write_index(&self.inner.index_path, &self.inner.name, &remaining)?;
            state.messages = remaining;
        }

        let raw = self.raw_path(id);
        trace!(path = %raw.display(), "Deleting raw message");
        std::fs::remove_file(&raw).map_err(|e| MailError::io(&raw, e))
    }

    /// Evict from the front until the mailbox is under its cap.
    fn evict_locked(&self, state: &mut MailboxState) -> Result<()> {
        self.ensure_loaded(state)?;
        while state.messages.len() >= self.inner.cap {
            let oldest = state.messages[0].id.clone();
            debug!(mailbox = %self, id = %oldest, "Evicting oldest message");
            if let Err(e) = self.delete_locked(state, &oldest) {
                warn!(mailbox = %self, id = %oldest, error = %e, "Failed to evict message");
                if state.messages.first().is_some_and(|m| m.id == oldest) {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Append a closed message to the index.
    ///
    /// The index is reloaded first so entries written by other handles on
    /// the same directory (another process) are kept.
    fn commit(&self, meta: MessageMeta) -> Result<()> {
        let mut state = lock(&self.inner.state);
        self.reload(&mut state)?;
        self.create_dir()?;

        let mut updated = state.messages.clone();
        updated.push(meta);
        persist::write_index(&self.inner.index_path, &self.inner.name, &updated)?;
        state.messages = updated;
        Ok(())
    }
}

impl Mailbox for FileMailbox {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn list(&self) -> Result<Vec<MessageMeta>> {
        let mut state = lock(&self.inner.state);
        self.ensure_loaded(&mut state)?;
        Ok(state.messages.clone())
    }

    fn get(&self, id: &str) -> Result<MessageMeta> {
        let mut state = lock(&self.inner.state);
        self.ensure_loaded(&mut state)?;
        state
            .messages
            .iter()
            .find(|m| m.id == id)
            .cloned()
            .ok_or_else(|| MailError::NotFound(format!("message {id} in mailbox {self}")))
    }

    fn new_message(&self) -> Result<Box<dyn MessageWriter>> {
        let date = Utc::now();
        let id = {
            let mut state = lock(&self.inner.state);
            if self.inner.cap > 0 {
                self.evict_locked(&mut state)?;
            }
            let id = self.unused_id(date)?;
            state.open_writers += 1;
            id
        };
        trace!(mailbox = %self, id = %id, "New message");
        Ok(Box::new(FileMessageWriter {
            mailbox: self.clone(),
            raw_path: self.raw_path(&id),
            id,
            date,
            size: 0,
            writable: true,
            writer: None,
        }))
    }

    fn read_raw(&self, id: &str) -> Result<Vec<u8>> {
        self.get(id)?;
        let raw = self.raw_path(id);
        std::fs::read(&raw).map_err(|e| MailError::io(&raw, e))
    }

    fn read_body(&self, id: &str) -> Result<MessageBody> {
        if let Some(body) = lock(&self.inner.bodies).get(id) {
            return Ok(body.clone());
        }
        let body = mime::parse_message_body(&self.read_raw(id)?);
        lock(&self.inner.bodies).put(id.to_string(), body.clone());
        Ok(body)
    }

    fn delete(&self, id: &str) -> Result<()> {
        let mut state = lock(&self.inner.state);
        self.delete_locked(&mut state, id)
    }

    fn purge(&self) -> Result<()> {
        let mut state = lock(&self.inner.state);
        lock(&self.inner.bodies).clear();
        if state.open_writers > 0 {
            self.clear_index_locked(&mut state)?;
        } else {
            self.reclaim_storage()?;
            state.messages.clear();
            state.index_loaded = true;
        }
        debug!(mailbox = %self, "Purged mailbox");
        Ok(())
    }
}

/// Streams a new message to its raw file.
pub struct FileMessageWriter {
    mailbox: FileMailbox,
    id: String,
    date: DateTime<Utc>,
    raw_path: PathBuf,
    size: u64,
    writable: bool,
    writer: Option<BufWriter<File>>,
}

impl FileMessageWriter {
    fn finish_raw(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer
                .flush()
                .map_err(|e| MailError::io(&self.raw_path, e))?;
            writer
                .get_ref()
                .sync_data()
                .map_err(|e| MailError::io(&self.raw_path, e))?;
        }
        Ok(())
    }
}

impl MessageWriter for FileMessageWriter {
    fn id(&self) -> &str {
        &self.id
    }

    fn date(&self) -> DateTime<Utc> {
        self.date
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn is_writable(&self) -> bool {
        self.writable
    }

    fn append(&mut self, data: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(MailError::NotWritable(self.id.clone()));
        }

        if self.writer.is_none() {
            let opened = self
                .mailbox
                .create_dir()
                .and_then(|()| {
                    OpenOptions::new()
                        .write(true)
                        .create_new(true)
                        .open(&self.raw_path)
                        .map_err(|e| MailError::io(&self.raw_path, e))
                });
            match opened {
                Ok(file) => self.writer = Some(BufWriter::new(file)),
                Err(e) => {
                    self.writable = false;
                    return Err(e);
                }
            }
        }

        if let Some(writer) = self.writer.as_mut() {
            if let Err(e) = writer.write_all(data) {
                self.writable = false;
                return Err(MailError::io(&self.raw_path, e));
            }
        }
        self.size += data.len() as u64;
        Ok(())
    }

    fn close(&mut self) -> Result<MessageMeta> {
        if !self.writable {
            return Err(MailError::NotWritable(self.id.clone()));
        }
        self.writable = false;
        self.finish_raw()?;

        let raw = std::fs::read(&self.raw_path).map_err(|e| MailError::io(&self.raw_path, e))?;
        let summary = header::summarize_headers(&raw);

        let meta = MessageMeta {
            id: self.id.clone(),
            date: self.date,
            from: summary.from,
            to: summary.to,
            subject: summary.subject,
            size: self.size,
        };
        self.mailbox.commit(meta.clone())?;
        debug!(mailbox = %self.mailbox, message = %meta, size = meta.size, "Message stored");
        Ok(meta)
    }
}

impl Drop for FileMessageWriter {
    fn drop(&mut self) {
        self.writer = None;
        self.mailbox.release_writer();
    }
}
