//! In-memory storage provider

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use crate::{StorageError, StorageProvider, StoredRecord};

#[derive(Default)]
struct MemoryInner {
    records: Vec<StoredRecord>,
    keys: HashSet<(String, String)>,
    content: HashMap<String, Vec<u8>>,
    flushes: usize,
    closed: bool,
}

/// Storage provider that keeps everything in memory
///
/// Records are kept in the order they were saved.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// All saved records, in save order
    pub fn records(&self) -> Vec<StoredRecord> {
        self.lock().records.clone()
    }

    /// Saved records of one collection, in save order
    pub fn collection(&self, name: &str) -> Vec<StoredRecord> {
        self.lock()
            .records
            .iter()
            .filter(|r| r.collection == name)
            .cloned()
            .collect()
    }

    /// Stored blob by key
    pub fn content(&self, key: &str) -> Option<Vec<u8>> {
        self.lock().content.get(key).cloned()
    }

    /// Number of flush calls observed
    pub fn flush_count(&self) -> usize {
        self.lock().flushes
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

#[async_trait]
impl StorageProvider for MemoryStore {
    async fn save(&self, records: Vec<StoredRecord>) -> Result<usize, StorageError> {
        debug!(count = records.len(), "MemoryStore::save: called");
        let mut inner = self.lock();
        if inner.closed {
            return Err(StorageError::Closed);
        }

        let mut written = 0;
        for record in records {
            if inner.keys.insert((record.collection.clone(), record.key.clone())) {
                inner.records.push(record);
                written += 1;
            } else {
                debug!(key = %record.key, "MemoryStore::save: duplicate key ignored");
            }
        }
        Ok(written)
    }

    async fn save_content(&self, key: &str, content: &[u8]) -> Result<(), StorageError> {
        debug!(%key, len = content.len(), "MemoryStore::save_content: called");
        let mut inner = self.lock();
        if inner.closed {
            return Err(StorageError::Closed);
        }
        inner.content.insert(key.to_string(), content.to_vec());
        Ok(())
    }

    async fn flush(&self) -> Result<(), StorageError> {
        let mut inner = self.lock();
        if !inner.closed {
            inner.flushes += 1;
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        debug!("MemoryStore::close: called");
        self.lock().closed = true;
        Ok(())
    }
}
