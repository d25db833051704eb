//! JSONL storage provider
//!
//! Each collection is appended to `<dir>/<collection>.jsonl`, one record per
//! line. Binary content lands in `<dir>/content/<key>`. An exclusive lock on
//! `<dir>/.lock` keeps two processes from writing the same directory.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use fs2::FileExt;
use tracing::{debug, info, warn};

use crate::{StorageError, StorageProvider, StoredRecord};

const LOCK_FILE: &str = ".lock";
const CONTENT_DIR: &str = "content";

struct JsonlInner {
    writers: HashMap<String, BufWriter<File>>,
    keys: HashSet<(String, String)>,
    lock_file: Option<File>,
    closed: bool,
}

/// Append-only JSONL storage provider
pub struct JsonlStore {
    dir: PathBuf,
    inner: Mutex<JsonlInner>,
}

impl JsonlStore {
    /// Open or create a store rooted at `dir`
    ///
    /// Keys already present on disk are loaded so de-duplication holds across
    /// reopen.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        debug!(?dir, "JsonlStore::open: called");
        fs::create_dir_all(&dir)?;

        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(dir.join(LOCK_FILE))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| StorageError::Locked(dir.display().to_string()))?;

        let mut keys = HashSet::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let Some(collection) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            for record in read_collection(&dir, collection)? {
                keys.insert((record.collection, record.key));
            }
        }
        info!(?dir, existing = keys.len(), "Opened JSONL store");

        Ok(Self {
            dir,
            inner: Mutex::new(JsonlInner {
                writers: HashMap::new(),
                keys,
                lock_file: Some(lock_file),
                closed: false,
            }),
        })
    }

    /// Root directory of the store
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, JsonlInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn collection_path(&self, collection: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", collection))
    }
}

fn validate_key(key: &str) -> Result<(), StorageError> {
    if key.is_empty() || key.contains('/') || key.contains('\\') || key == "." || key == ".." {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(())
}

fn flush_writers(inner: &mut JsonlInner) -> Result<(), StorageError> {
    for (collection, writer) in inner.writers.iter_mut() {
        debug!(%collection, "flush_writers: flushing");
        writer.flush()?;
        writer.get_ref().sync_data()?;
    }
    Ok(())
}

#[async_trait]
impl StorageProvider for JsonlStore {
    async fn save(&self, records: Vec<StoredRecord>) -> Result<usize, StorageError> {
        debug!(count = records.len(), "JsonlStore::save: called");
        let mut inner = self.lock();
        if inner.closed {
            return Err(StorageError::Closed);
        }

        let mut written = 0;
        for record in records {
            validate_key(&record.collection)?;
            let id = (record.collection.clone(), record.key.clone());
            if inner.keys.contains(&id) {
                debug!(key = %record.key, "JsonlStore::save: duplicate key ignored");
                continue;
            }

            let line = serde_json::to_string(&record)?;
            if !inner.writers.contains_key(&record.collection) {
                let path = self.collection_path(&record.collection);
                debug!(?path, "JsonlStore::save: opening collection file");
                let file = OpenOptions::new().create(true).append(true).open(&path)?;
                inner.writers.insert(record.collection.clone(), BufWriter::new(file));
            }
            if let Some(writer) = inner.writers.get_mut(&record.collection) {
                writeln!(writer, "{}", line)?;
            }
            inner.keys.insert(id);
            written += 1;
        }
        Ok(written)
    }

    async fn save_content(&self, key: &str, content: &[u8]) -> Result<(), StorageError> {
        debug!(%key, len = content.len(), "JsonlStore::save_content: called");
        validate_key(key)?;
        if self.lock().closed {
            return Err(StorageError::Closed);
        }

        let content_dir = self.dir.join(CONTENT_DIR);
        fs::create_dir_all(&content_dir)?;
        let tmp = content_dir.join(format!(".{}.tmp", key));
        fs::write(&tmp, content)?;
        fs::rename(&tmp, content_dir.join(key))?;
        Ok(())
    }

    async fn flush(&self) -> Result<(), StorageError> {
        debug!("JsonlStore::flush: called");
        let mut inner = self.lock();
        if inner.closed {
            return Ok(());
        }
        flush_writers(&mut inner)
    }

    async fn close(&self) -> Result<(), StorageError> {
        debug!("JsonlStore::close: called");
        let mut inner = self.lock();
        if inner.closed {
            debug!("JsonlStore::close: already closed");
            return Ok(());
        }
        flush_writers(&mut inner)?;
        inner.writers.clear();
        if let Some(lock_file) = inner.lock_file.take() {
            if let Err(e) = FileExt::unlock(&lock_file) {
                warn!(error = %e, "JsonlStore::close: failed to release lock");
            }
        }
        inner.closed = true;
        info!(dir = ?self.dir, "Closed JSONL store");
        Ok(())
    }
}

/// Read every record of a collection from a store directory
pub fn read_collection(dir: impl AsRef<Path>, collection: &str) -> Result<Vec<StoredRecord>, StorageError> {
    let path = dir.as_ref().join(format!("{}.jsonl", collection));
    debug!(?path, "read_collection: reading");
    if !path.exists() {
        return Ok(Vec::new());
    }

    let content = fs::read_to_string(&path)?;
    let mut records = Vec::new();
    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<StoredRecord>(line) {
            Ok(record) => records.push(record),
            Err(e) => {
                warn!(line, error = %e, "read_collection: failed to parse line");
            }
        }
    }
    Ok(records)
}
