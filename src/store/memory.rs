//! In-memory message store.
//!
//! Same contract as the file store without touching disk. Used by tests
//! and handy for embedding a throwaway server.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::error::{MailError, Result};
use crate::model::address::parse_mailbox_name;
use crate::model::message::{MessageBody, MessageMeta};
use crate::parser::{header, mime};
use crate::store::{generate_id, DataStore, Mailbox, MessageWriter};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A [`DataStore`] that keeps every mailbox in RAM.
#[derive(Default)]
pub struct MemoryDataStore {
    mailbox_msg_cap: usize,
    mailboxes: Mutex<HashMap<String, MemoryMailbox>>,
}

impl MemoryDataStore {
    /// `mailbox_msg_cap` of 0 disables eviction.
    pub fn new(mailbox_msg_cap: usize) -> Self {
        Self {
            mailbox_msg_cap,
            mailboxes: Mutex::new(HashMap::new()),
        }
    }
}

impl DataStore for MemoryDataStore {
    fn mailbox_for(&self, address: &str) -> Result<Arc<dyn Mailbox>> {
        let name = parse_mailbox_name(address)?;
        let mailbox = lock(&self.mailboxes)
            .entry(name.clone())
            .or_insert_with(|| MemoryMailbox {
                name,
                cap: self.mailbox_msg_cap,
                messages: Arc::new(Mutex::new(Vec::new())),
            })
            .clone();
        Ok(Arc::new(mailbox))
    }

    fn all_mailboxes(&self) -> Result<Vec<Arc<dyn Mailbox>>> {
        let mut mailboxes: Vec<MemoryMailbox> = lock(&self.mailboxes)
            .values()
            .filter(|mb| !lock(&mb.messages).is_empty())
            .cloned()
            .collect();
        mailboxes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(mailboxes
            .into_iter()
            .map(|mb| Arc::new(mb) as Arc<dyn Mailbox>)
            .collect())
    }
}

struct StoredMessage {
    meta: MessageMeta,
    raw: Arc<Vec<u8>>,
}

/// One mailbox held in memory.
#[derive(Clone)]
pub struct MemoryMailbox {
    name: String,
    cap: usize,
    messages: Arc<Mutex<Vec<StoredMessage>>>,
}

impl MemoryMailbox {
    fn raw(&self, id: &str) -> Result<Arc<Vec<u8>>> {
        lock(&self.messages)
            .iter()
            .find(|m| m.meta.id == id)
            .map(|m| Arc::clone(&m.raw))
            .ok_or_else(|| MailError::NotFound(format!("message {id} in mailbox {}", self.name)))
    }
}

impl Mailbox for MemoryMailbox {
    fn name(&self) -> &str {
        &self.name
    }

    fn list(&self) -> Result<Vec<MessageMeta>> {
        Ok(lock(&self.messages).iter().map(|m| m.meta.clone()).collect())
    }

    fn get(&self, id: &str) -> Result<MessageMeta> {
        lock(&self.messages)
            .iter()
            .find(|m| m.meta.id == id)
            .map(|m| m.meta.clone())
            .ok_or_else(|| MailError::NotFound(format!("message {id} in mailbox {}", self.name)))
    }

    fn new_message(&self) -> Result<Box<dyn MessageWriter>> {
        if self.cap > 0 {
            let mut messages = lock(&self.messages);
            while messages.len() >= self.cap {
                let evicted = messages.remove(0);
                warn!(mailbox = %self.name, id = %evicted.meta.id, "Evicted oldest message");
            }
        }

        let date = Utc::now();
        Ok(Box::new(MemoryMessageWriter {
            mailbox: self.clone(),
            id: generate_id(date),
            date,
            data: Vec::new(),
            writable: true,
        }))
    }

    fn read_raw(&self, id: &str) -> Result<Vec<u8>> {
        Ok(self.raw(id)?.as_ref().clone())
    }

    fn read_body(&self, id: &str) -> Result<MessageBody> {
        Ok(mime::parse_message_body(&self.raw(id)?))
    }

    fn delete(&self, id: &str) -> Result<()> {
        let mut messages = lock(&self.messages);
        let before = messages.len();
        messages.retain(|m| m.meta.id != id);
        if messages.len() == before {
            return Err(MailError::NotFound(format!(
                "message {id} in mailbox {}",
                self.name
            )));
        }
        Ok(())
    }

    fn purge(&self) -> Result<()> {
        lock(&self.messages).clear();
        Ok(())
    }
}

/// Buffers a message in memory until it is closed.
pub struct MemoryMessageWriter {
    mailbox: MemoryMailbox,
    id: String,
    date: DateTime<Utc>,
    data: Vec<u8>,
    writable: bool,
}

impl MessageWriter for MemoryMessageWriter {
    fn id(&self) -> &str {
        &self.id
    }

    fn date(&self) -> DateTime<Utc> {
        self.date
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn is_writable(&self) -> bool {
        self.writable
    }

    fn append(&mut self, data: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(MailError::NotWritable(self.id.clone()));
        }
        self.data.extend_from_slice(data);
        Ok(())
    }

    fn close(&mut self) -> Result<MessageMeta> {
        if !self.writable {
            return Err(MailError::NotWritable(self.id.clone()));
        }
        self.writable = false;

        let summary = header::summarize_headers(&self.data);
        let meta = MessageMeta {
            id: self.id.clone(),
            date: self.date,
            from: summary.from,
            to: summary.to,
            subject: summary.subject,
            size: self.data.len() as u64,
        };
        lock(&self.mailbox.messages).push(StoredMessage {
            meta: meta.clone(),
            raw: Arc::new(std::mem::take(&mut self.data)),
        });
        Ok(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_message(mailbox: &dyn Mailbox, subject: &str) -> MessageMeta {
        let mut msg = mailbox.new_message().unwrap();
        msg.append(format!("Subject: {subject}\r\n\r\nbody\r\n").as_bytes())
            .unwrap();
        msg.close().unwrap()
    }

    #[test]
    fn test_case_folded_addresses_share_mailbox() {
        let store = MemoryDataStore::new(0);
        let a = store.mailbox_for("James@example.com").unwrap();
        let b = store.mailbox_for("james@example.com").unwrap();
        let meta = store_message(a.as_ref(), "shared");
        assert_eq!(b.get(&meta.id).unwrap().subject, "shared");
    }

    #[test]
    fn test_cap_evicts_oldest() {
        let store = MemoryDataStore::new(2);
        let mb = store.mailbox_for("james").unwrap();
        store_message(mb.as_ref(), "m1");
        store_message(mb.as_ref(), "m2");
        store_message(mb.as_ref(), "m3");
        let subjects: Vec<_> = mb.list().unwrap().into_iter().map(|m| m.subject).collect();
        assert_eq!(subjects, ["m2", "m3"]);
    }

    #[test]
    fn test_delete_twice_reports_not_found() {
        let store = MemoryDataStore::new(0);
        let mb = store.mailbox_for("james").unwrap();
        let keep = store_message(mb.as_ref(), "keep");
        let gone = store_message(mb.as_ref(), "gone");
        mb.delete(&gone.id).unwrap();
        assert!(matches!(mb.delete(&gone.id), Err(MailError::NotFound(_))));
        assert_eq!(mb.list().unwrap(), vec![keep]);
    }

    #[test]
    fn test_all_mailboxes_skips_empty() {
        let store = MemoryDataStore::new(0);
        store.mailbox_for("empty").unwrap();
        store_message(store.mailbox_for("full").unwrap().as_ref(), "x");
        let names: Vec<_> = store
            .all_mailboxes()
            .unwrap()
            .iter()
            .map(|mb| mb.name().to_string())
            .collect();
        assert_eq!(names, ["full"]);
    }
}
