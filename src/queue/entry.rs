use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::buffer::{BodyBuffer, FileBuffer, read_to_vec};
use crate::header::{Header, HeaderParseError};
use crate::message::{MessageId, MessageMeta};
use crate::status::SmtpStatus;

/// A recipient the queue gave up on, with the status that sealed it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedRcpt {
    pub rcpt: String,
    pub status: SmtpStatus,
}

/// Envelope state persisted in the `.meta` file.
///
/// `tries` counts charged delivery attempts, is at least 1 from the first
/// persist on and never decreases; `last_attempt` only moves forward. A
/// recipient is in exactly one of: delivered (gone from both lists),
/// `recipients` (pending) or `failed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryMeta {
    pub meta: MessageMeta,
    pub mail_from: String,
    pub recipients: Vec<String>,
    pub failed: Vec<FailedRcpt>,
    pub tries: u32,
    pub queued_at: DateTime<Utc>,
    pub last_attempt: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("queue I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("queue metadata is corrupt: {0}")]
    Meta(#[from] serde_json::Error),
    #[error("queued header is corrupt: {0}")]
    Header(#[from] HeaderParseError),
}

const META_EXT: &str = "meta";
const HEADER_EXT: &str = "header";
const BODY_EXT: &str = "body";
const TMP_SUFFIX: &str = ".tmp";

/// Flat directory of `<id>.meta` / `<id>.header` / `<id>.body` triples.
///
/// Writes go through a temp file, fsync and rename, with a directory fsync
/// behind the meta rename: either all three files land, or the entry is
/// dangling and [`QueueStorage::scan`] removes it on the next startup.
pub(crate) struct QueueStorage {
    dir: PathBuf,
}

impl QueueStorage {
    pub(crate) fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, id: &MessageId, ext: &str) -> PathBuf {
        self.dir.join(format!("{id}.{ext}"))
    }

    async fn write_file(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        let tmp = PathBuf::from(format!("{}{TMP_SUFFIX}", path.display()));
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn sync_dir(&self) -> io::Result<()> {
        fs::File::open(&self.dir).await?.sync_all().await
    }

    /// Persist a complete entry. Body and header are written first and only
    /// once; the meta rename is what makes the entry exist.
    pub(crate) async fn write_entry(
        &self,
        id: &MessageId,
        meta: &EntryMeta,
        header: &Header,
        body: &dyn BodyBuffer,
    ) -> Result<(), StorageError> {
        let data = read_to_vec(body)?;
        self.write_file(&self.path(id, BODY_EXT), &data).await?;
        self.write_file(&self.path(id, HEADER_EXT), &header.to_bytes())
            .await?;
        self.write_file(&self.path(id, META_EXT), &serde_json::to_vec_pretty(meta)?)
            .await?;
        self.sync_dir().await?;
        Ok(())
    }

    /// Rewrite the meta file after an attempt. On failure the previous meta
    /// survives the rename, so a reload retries once more.
    pub(crate) async fn update_meta(
        &self,
        id: &MessageId,
        meta: &EntryMeta,
    ) -> Result<(), StorageError> {
        self.write_file(&self.path(id, META_EXT), &serde_json::to_vec_pretty(meta)?)
            .await?;
        self.sync_dir().await?;
        Ok(())
    }

    pub(crate) async fn read_meta(&self, id: &MessageId) -> Result<EntryMeta, StorageError> {
        let data = fs::read(self.path(id, META_EXT)).await?;
        Ok(serde_json::from_slice(&data)?)
    }

    pub(crate) async fn read_header(&self, id: &MessageId) -> Result<Header, StorageError> {
        let data = fs::read(self.path(id, HEADER_EXT)).await?;
        Ok(Header::parse(&data)?)
    }

    pub(crate) fn body_buffer(&self, id: &MessageId) -> FileBuffer {
        FileBuffer::new(self.path(id, BODY_EXT))
    }

    pub(crate) async fn remove_entry(&self, id: &MessageId) -> io::Result<()> {
        for ext in [META_EXT, HEADER_EXT, BODY_EXT] {
            match fs::remove_file(self.path(id, ext)).await {
                Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
                _ => {}
            }
        }
        self.sync_dir().await
    }

    /// Load every complete entry; delete stragglers of incomplete ones and
    /// leftover temp files from interrupted writes.
    pub(crate) async fn scan(&self) -> Result<Vec<(MessageId, EntryMeta)>, StorageError> {
        let mut ids = Vec::new();
        let mut reader = fs::read_dir(&self.dir).await?;
        while let Some(dirent) = reader.next_entry().await? {
            let name = dirent.file_name();
            let Some(name) = name.to_str() else {
                warn!(path = %dirent.path().display(), "ignoring non-UTF-8 file in queue directory");
                continue;
            };
            if name.ends_with(TMP_SUFFIX) {
                debug!(file = name, "removing leftover temp file");
                let _ = fs::remove_file(dirent.path()).await;
                continue;
            }
            let Some((stem, ext)) = name.split_once('.') else {
                warn!(file = name, "ignoring unexpected file in queue directory");
                continue;
            };
            let Ok(id) = stem.parse::<MessageId>() else {
                warn!(file = name, "ignoring file with malformed queue id");
                continue;
            };
            if ext == META_EXT {
                ids.push(id);
            } else if ext != HEADER_EXT && ext != BODY_EXT {
                warn!(file = name, "ignoring unexpected file in queue directory");
            }
        }

        let mut entries = Vec::new();
        for id in ids {
            let complete = fs::try_exists(self.path(&id, HEADER_EXT)).await?
                && fs::try_exists(self.path(&id, BODY_EXT)).await?;
            if !complete {
                warn!(message_id = %id, "removing dangling queue entry");
                self.remove_entry(&id).await?;
                continue;
            }
            match self.read_meta(&id).await {
                Ok(meta) => entries.push((id, meta)),
                Err(e) => {
                    warn!(message_id = %id, error = %e, "removing unreadable queue entry");
                    self.remove_entry(&id).await?;
                }
            }
        }
        // body/header files without a meta file never became an entry
        let mut reader = fs::read_dir(&self.dir).await?;
        while let Some(dirent) = reader.next_entry().await? {
            let name = dirent.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some((stem, ext)) = name.split_once('.') else {
                continue;
            };
            if (ext == HEADER_EXT || ext == BODY_EXT)
                && let Ok(id) = stem.parse::<MessageId>()
                && !entries.iter().any(|(known, _)| known == &id)
            {
                warn!(message_id = %id, file = name, "removing stragglers of incomplete entry");
                self.remove_entry(&id).await?;
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::buffer::MemoryBuffer;

    fn sample_meta() -> EntryMeta {
        EntryMeta {
            meta: MessageMeta::new("smtp", "client.example.org"),
            mail_from: "sender@example.org".into(),
            recipients: vec!["a@example.com".into(), "b@example.com".into()],
            failed: vec![],
            tries: 1,
            queued_at: Utc::now(),
            last_attempt: Utc::now(),
        }
    }

    fn sample_header() -> Header {
        Header::parse(b"From: sender@example.org\r\nSubject: queued\r\n\r\n").unwrap()
    }

    #[tokio::test]
    async fn entry_roundtrip_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let storage = QueueStorage::new(dir.path());
        let meta = sample_meta();
        let id = meta.meta.id.clone();
        let header = sample_header();
        let body = MemoryBuffer::new(b"body bytes\r\n".to_vec());

        storage.write_entry(&id, &meta, &header, &body).await.unwrap();

        let loaded = storage.read_meta(&id).await.unwrap();
        assert_eq!(loaded.mail_from, meta.mail_from);
        assert_eq!(loaded.recipients, meta.recipients);
        assert_eq!(loaded.tries, 1);

        let loaded_header = storage.read_header(&id).await.unwrap();
        assert_eq!(loaded_header.to_bytes(), header.to_bytes());
        assert_eq!(
            read_to_vec(&storage.body_buffer(&id)).unwrap(),
            b"body bytes\r\n"
        );
    }

    #[tokio::test]
    async fn scan_returns_persisted_entries() {
        let dir = tempfile::tempdir().unwrap();
        let storage = QueueStorage::new(dir.path());
        let meta = sample_meta();
        let id = meta.meta.id.clone();
        let body = MemoryBuffer::new(b"x".to_vec());
        storage
            .write_entry(&id, &meta, &sample_header(), &body)
            .await
            .unwrap();

        let entries = storage.scan().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, id);
    }

    #[tokio::test]
    async fn scan_removes_dangling_entries() {
        let dir = tempfile::tempdir().unwrap();
        let storage = QueueStorage::new(dir.path());

        // meta without header/body
        let lonely = MessageId::generate();
        fs::write(storage.path(&lonely, META_EXT), b"{}").await.unwrap();
        // body without meta
        let headless = MessageId::generate();
        fs::write(storage.path(&headless, BODY_EXT), b"data").await.unwrap();
        // leftover temp file
        fs::write(dir.path().join(format!("{lonely}.meta.tmp")), b"x")
            .await
            .unwrap();

        let entries = storage.scan().await.unwrap();
        assert!(entries.is_empty());

        let mut reader = fs::read_dir(dir.path()).await.unwrap();
        assert!(reader.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_meta_replaces_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let storage = QueueStorage::new(dir.path());
        let mut meta = sample_meta();
        let id = meta.meta.id.clone();
        let body = MemoryBuffer::new(b"x".to_vec());
        storage
            .write_entry(&id, &meta, &sample_header(), &body)
            .await
            .unwrap();

        meta.tries = 2;
        meta.recipients.pop();
        storage.update_meta(&id, &meta).await.unwrap();

        let loaded = storage.read_meta(&id).await.unwrap();
        assert_eq!(loaded.tries, 2);
        assert_eq!(loaded.recipients, ["a@example.com"]);
    }
}
