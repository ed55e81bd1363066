//! In-memory document store.
//!
//! Stores collections in a DashMap for thread-safe concurrent access. Clones
//! share the same storage, so a test can hand one clone to the engine and
//! inspect another.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{Document, DocumentStore, encode_document};
use crate::error::{SyncError, SyncResult};

const NO_FAULT: usize = usize::MAX;

/// In-memory document store with an optional injected write failure.
///
/// # Performance Characteristics
///
/// - No I/O, constant-time document access
/// - Data is lost when the process terminates
#[derive(Clone)]
pub struct InMemoryDocumentStore {
    max_document_bytes: usize,
    collections: Arc<DashMap<String, BTreeMap<String, Document>>>,
    writes: Arc<AtomicUsize>,
    fail_from_write: Arc<AtomicUsize>,
}

impl InMemoryDocumentStore {
    pub fn new(max_document_bytes: usize) -> Self {
        Self {
            max_document_bytes,
            collections: Arc::new(DashMap::new()),
            writes: Arc::new(AtomicUsize::new(0)),
            fail_from_write: Arc::new(AtomicUsize::new(NO_FAULT)),
        }
    }

    /// Lets the next `n` writes succeed and fails every write after them,
    /// simulating a connection dropped in the middle of a save.
    pub fn fail_after_writes(&self, n: usize) {
        let current = self.writes.load(Ordering::SeqCst);
        self.fail_from_write.store(current + n, Ordering::SeqCst);
    }

    pub fn clear_faults(&self) {
        self.fail_from_write.store(NO_FAULT, Ordering::SeqCst);
    }

    /// Number of successful writes so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn document_count(&self, collection: &str) -> usize {
        self.collections
            .get(collection)
            .map(|c| c.len())
            .unwrap_or(0)
    }

    fn check_fault(&self) -> SyncResult<()> {
        if self.writes.load(Ordering::SeqCst) >= self.fail_from_write.load(Ordering::SeqCst) {
            return Err(SyncError::Storage("injected write failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn get(&self, collection: &str, id: &str) -> SyncResult<Option<Document>> {
        Ok(self
            .collections
            .get(collection)
            .and_then(|c| c.get(id).cloned()))
    }

    async fn set(&self, collection: &str, id: &str, document: Document) -> SyncResult<()> {
        self.check_fault()?;
        encode_document(&document, self.max_document_bytes)?;
        self.collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), document);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> SyncResult<()> {
        let now_empty = match self.collections.get_mut(collection) {
            Some(mut docs) => {
                docs.remove(id);
                docs.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.collections.remove_if(collection, |_, docs| docs.is_empty());
        }
        Ok(())
    }

    async fn list(&self, collection: &str) -> SyncResult<Vec<(String, Document)>> {
        Ok(self
            .collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .map(|(id, doc)| (id.clone(), doc.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn max_document_bytes(&self) -> usize {
        self.max_document_bytes
    }
}
