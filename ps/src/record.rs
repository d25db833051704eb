//! Record types handed to storage providers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::StorageError;

/// Domain types that can be persisted through a [`crate::StorageProvider`]
pub trait Record {
    /// Collection (table / file) the record belongs to
    fn collection_name() -> &'static str;

    /// Unique storage key within the collection
    fn key(&self) -> String;
}

/// A record in its storage form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub collection: String,
    pub key: String,
    pub body: Value,
    pub stored_at: DateTime<Utc>,
}

/// Convert a domain record into its storage form
pub fn to_stored<R: Record + Serialize>(record: &R) -> Result<StoredRecord, StorageError> {
    Ok(StoredRecord {
        collection: R::collection_name().to_string(),
        key: record.key(),
        body: serde_json::to_value(record)?,
        stored_at: Utc::now(),
    })
}
