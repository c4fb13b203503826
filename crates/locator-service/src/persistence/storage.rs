use std::collections::HashMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::NamedTempFile;
use thiserror::Error;

/// A failure of the durable storage.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The owner of the storage went away. Nothing can be read or written anymore and callers
    /// should stop trying without raising an alarm.
    #[error("storage context invalidated")]
    ContextInvalidated,
    /// The storage cannot be used right now.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("storage I/O failed")]
    Io(#[from] io::Error),
    #[error("failed to serialize record")]
    Serialization(#[from] serde_json::Error),
}

/// A local key/value store for named records.
#[async_trait]
pub trait DurableStorage: Send + Sync + 'static {
    /// Reads the record `key`, `None` if it was never written.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Replaces the record `key` with `value`.
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError>;

    /// Deletes the record `key`. Deleting a missing record is not an error.
    async fn remove(&self, key: &str) -> Result<(), StorageError>;

    /// The number of bytes currently occupied by all records.
    async fn bytes_used(&self) -> Result<u64, StorageError>;
}

/// Stores every record as a JSON file in a directory.
///
/// Writes go to a temporary file in the same directory first, which is then moved into place.
/// A crash in the middle of a write never leaves a partial record behind.
#[derive(Debug, Clone)]
pub struct FsStorage {
    dir: PathBuf,
}

impl FsStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, key: &str) -> Result<PathBuf, StorageError> {
        let valid = !key.is_empty()
            && key
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
        if !valid {
            return Err(StorageError::Unavailable(format!(
                "invalid record name `{key}`"
            )));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }
}

fn persist_record(dir: &Path, path: &Path, value: &[u8]) -> io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let mut temp_file = NamedTempFile::new_in(dir)?;
    temp_file.write_all(value)?;
    temp_file.as_file().sync_data()?;
    temp_file.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[async_trait]
impl DurableStorage for FsStorage {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let path = self.record_path(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        let path = self.record_path(key)?;
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || persist_record(&dir, &path, &value))
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))??;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        let path = self.record_path(key)?;
        match tokio::fs::remove_file(&path).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    async fn bytes_used(&self) -> Result<u64, StorageError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut total = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                total += entry.metadata().await?.len();
            }
        }
        Ok(total)
    }
}

/// Keeps records in memory. Used when no storage directory is configured, and in tests.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    records: Mutex<HashMap<String, Vec<u8>>>,
    invalidated: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every further operation fail with [`StorageError::ContextInvalidated`].
    pub fn invalidate(&self) {
        self.invalidated.store(true, Ordering::Relaxed);
    }

    fn check(&self) -> Result<(), StorageError> {
        match self.invalidated.load(Ordering::Relaxed) {
            true => Err(StorageError::ContextInvalidated),
            false => Ok(()),
        }
    }
}

#[async_trait]
impl DurableStorage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.check()?;
        Ok(self.records.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        self.check()?;
        self.records.lock().insert(key.to_owned(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.check()?;
        self.records.lock().remove(key);
        Ok(())
    }

    async fn bytes_used(&self) -> Result<u64, StorageError> {
        self.check()?;
        let records = self.records.lock();
        Ok(records
            .iter()
            .map(|(key, value)| (key.len() + value.len()) as u64)
            .sum())
    }
}
