//! Reading and writing mailbox index files.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use tracing::{debug, trace};

use crate::error::{MailError, Result};
use crate::index::format::{IndexFile, IndexHeader};
use crate::model::message::MessageMeta;

/// Contents of a successfully decoded index.
#[derive(Debug, Default)]
pub struct LoadedIndex {
    /// Mailbox name recorded in the header (`None` when no index exists yet).
    pub mailbox: Option<String>,
    /// Entries in insertion order.
    pub entries: Vec<MessageMeta>,
}

/// Load an index file.
///
/// A missing file is not an error: the mailbox simply has no messages yet.
pub fn load_index(idx_path: &Path) -> Result<LoadedIndex> {
    let data = match std::fs::read(idx_path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            trace!(path = %idx_path.display(), "Index does not exist (yet)");
            return Ok(LoadedIndex::default());
        }
        Err(e) => return Err(MailError::io(idx_path, e)),
    };

    let file: IndexFile = bincode::deserialize(&data).map_err(|e| MailError::IndexCorrupt {
        path: idx_path.to_path_buf(),
        reason: format!("Deserialization failed: {e}"),
    })?;

    file.header
        .validate()
        .map_err(|reason| MailError::IndexCorrupt {
            path: idx_path.to_path_buf(),
            reason,
        })?;

    if file.entries.len() as u64 != file.header.message_count {
        return Err(MailError::IndexCorrupt {
            path: idx_path.to_path_buf(),
            reason: format!(
                "Message count mismatch: header says {}, found {}",
                file.header.message_count,
                file.entries.len()
            ),
        });
    }

    debug!(
        path = %idx_path.display(),
        count = file.entries.len(),
        "Loaded index"
    );
    Ok(LoadedIndex {
        mailbox: Some(file.header.mailbox),
        entries: file.entries,
    })
}

/// Overwrite the index with `entries`.
///
/// The new contents go to a sibling temp file which is then renamed over the
/// old index, so readers never observe a half-written index.
pub fn write_index(idx_path: &Path, mailbox: &str, entries: &[MessageMeta]) -> Result<()> {
    let file = IndexFile {
        header: IndexHeader::new(mailbox, entries.len()),
        entries: entries.to_vec(),
    };
    let bytes = bincode::serialize(&file).map_err(|e| MailError::IndexCorrupt {
        path: idx_path.to_path_buf(),
        reason: format!("Serialization failed: {e}"),
    })?;

    let tmp_path = idx_path.with_extension("tmp");
    let out = File::create(&tmp_path).map_err(|e| MailError::io(&tmp_path, e))?;
    let mut writer = BufWriter::new(out);
    writer
        .write_all(&bytes)
        .map_err(|e| MailError::io(&tmp_path, e))?;
    writer.flush().map_err(|e| MailError::io(&tmp_path, e))?;
    drop(writer);

    std::fs::rename(&tmp_path, idx_path).map_err(|e| MailError::io(idx_path, e))?;
    trace!(path = %idx_path.display(), count = entries.len(), "Index written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::format::INDEX_FILE;
    use chrono::Utc;

    fn meta(id: &str) -> MessageMeta {
        MessageMeta {
            id: id.to_string(),
            date: Utc::now(),
            from: "a@b.com".to_string(),
            to: vec!["c@d.com".to_string()],
            subject: "subject".to_string(),
            size: 42,
        }
    }

    #[test]
    fn test_missing_index_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = load_index(&dir.path().join(INDEX_FILE)).unwrap();
        assert!(loaded.entries.is_empty());
        assert!(loaded.mailbox.is_none());
    }

    #[test]
    fn test_write_then_load_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(INDEX_FILE);
        write_index(&path, "james", &[meta("1"), meta("2"), meta("3")]).unwrap();

        let loaded = load_index(&path).unwrap();
        assert_eq!(loaded.mailbox.as_deref(), Some("james"));
        let ids: Vec<_> = loaded.entries.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["1", "2", "3"]);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_garbage_index_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(INDEX_FILE);
        std::fs::write(&path, b"definitely not bincode").unwrap();
        assert!(matches!(
            load_index(&path),
            Err(MailError::IndexCorrupt { .. })
        ));
    }

    #[test]
    fn test_wrong_magic_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(INDEX_FILE);
        let mut header = IndexHeader::new("x", 0);
        header.magic = *b"MBOXTUI\0";
        let bytes = bincode::serialize(&IndexFile {
            header,
            entries: Vec::new(),
        })
        .unwrap();
        std::fs::write(&path, bytes).unwrap();
        assert!(matches!(
            load_index(&path),
            Err(MailError::IndexCorrupt { .. })
        ));
    }
}
