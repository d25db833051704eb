//! PageStore - storage providers for collected page-visit records
//!
//! The [`StorageProvider`] trait is the contract the task manager writes
//! through. Records are de-duplicated on their storage key, so handing the same
//! record to a provider twice never produces two copies.
//!
//! # Providers
//!
//! - [`MemoryStore`] - in-process store for tests and embedding
//! - [`JsonlStore`] - one JSONL file per collection plus a content directory

mod error;
mod jsonl;
mod memory;
mod record;

pub use error::StorageError;
pub use jsonl::{JsonlStore, read_collection};
pub use memory::MemoryStore;
pub use record::{Record, StoredRecord, to_stored};

use async_trait::async_trait;

/// Durable sink for structured records and binary content
///
/// Implementations must be safe for concurrent `save` calls. `flush` and
/// `close` must be idempotent.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Persist a batch of records, returning how many were newly written
    async fn save(&self, records: Vec<StoredRecord>) -> Result<usize, StorageError>;

    /// Persist a binary blob under the given key
    async fn save_content(&self, key: &str, content: &[u8]) -> Result<(), StorageError>;

    /// Force buffered writes to durable storage
    async fn flush(&self) -> Result<(), StorageError>;

    /// Flush and release resources; later saves fail with [`StorageError::Closed`]
    async fn close(&self) -> Result<(), StorageError>;
}
