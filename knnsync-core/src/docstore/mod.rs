//! Size-constrained document store.
//!
//! The chunked backend and the catalog persist small JSON documents grouped in
//! collections, the way a hosted document database does. Every implementation
//! enforces a per-document size ceiling on the serialized document.
//!
//! # Usage Example
//!
//! ```no_run
//! use knnsync_core::docstore::{DocumentStore, InMemoryDocumentStore};
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = InMemoryDocumentStore::new(1024 * 1024);
//! let doc = json!({"version": 1}).as_object().cloned().unwrap();
//! store.set("models/model-1/meta", "dataset", doc).await?;
//! let loaded = store.get("models/model-1/meta", "dataset").await?;
//! assert!(loaded.is_some());
//! # Ok(())
//! # }
//! ```

pub mod in_memory;
pub mod local_fs;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::{SyncError, SyncResult};

pub use in_memory::InMemoryDocumentStore;
pub use local_fs::LocalFsDocumentStore;

/// A JSON object stored under `(collection, id)`.
pub type Document = Map<String, Value>;

/// Abstracts the document database used for chunks and catalog records.
///
/// # Thread Safety
///
/// Implementations must be shareable between tasks (`Send + Sync`).
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch one document, `None` if absent.
    async fn get(&self, collection: &str, id: &str) -> SyncResult<Option<Document>>;

    /// Create or overwrite a document.
    async fn set(&self, collection: &str, id: &str, document: Document) -> SyncResult<()>;

    /// Shallow-merge fields into a document, creating it if needed.
    async fn merge(&self, collection: &str, id: &str, fields: Document) -> SyncResult<()> {
        let mut document = self.get(collection, id).await?.unwrap_or_default();
        document.extend(fields);
        self.set(collection, id, document).await
    }

    /// Remove a document. Removing an absent document is not an error.
    async fn delete(&self, collection: &str, id: &str) -> SyncResult<()>;

    /// All documents of a collection, ordered by id.
    async fn list(&self, collection: &str) -> SyncResult<Vec<(String, Document)>>;

    /// Per-document ceiling in bytes.
    fn max_document_bytes(&self) -> usize;
}

/// Serializes a document and checks it against the store ceiling.
pub fn encode_document(document: &Document, limit: usize) -> SyncResult<Vec<u8>> {
    let bytes = serde_json::to_vec(document)?;
    if bytes.len() > limit {
        return Err(SyncError::PayloadTooLarge {
            size: bytes.len(),
            limit,
        });
    }
    Ok(bytes)
}

/// Converts a serializable value into a document.
pub fn to_document<T: serde::Serialize>(value: &T) -> SyncResult<Document> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(SyncError::Serialization(format!(
            "expected a JSON object, got {}",
            other
        ))),
    }
}

pub fn from_document<T: serde::de::DeserializeOwned>(document: Document) -> SyncResult<T> {
    Ok(serde_json::from_value(Value::Object(document))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_document_enforces_limit() {
        let doc = json!({"payload": "x".repeat(100)}).as_object().cloned().unwrap();
        assert!(encode_document(&doc, 1000).is_ok());
        assert!(matches!(
            encode_document(&doc, 50),
            Err(SyncError::PayloadTooLarge { limit: 50, .. })
        ));
    }

    #[test]
    fn test_to_document_rejects_non_objects() {
        assert!(to_document(&json!({"a": 1})).is_ok());
        assert!(matches!(
            to_document(&json!([1, 2])),
            Err(SyncError::Serialization(_))
        ));
    }
}
