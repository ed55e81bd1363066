//! Local file system document store.
//!
//! Each document is stored as one JSON file at
//! `<base_dir>/<collection>/<id>.json`; collection paths containing `/` map
//! to nested directories. Writes go to a temporary file in the target
//! directory and are renamed into place.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::{Document, DocumentStore, encode_document};
use crate::error::{SyncError, SyncResult};

const FILE_EXTENSION: &str = "json";

#[derive(Debug, Clone)]
pub struct LocalFsDocumentStore {
    base_dir: PathBuf,
    max_document_bytes: usize,
}

impl LocalFsDocumentStore {
    pub fn new<P: Into<PathBuf>>(base_dir: P, max_document_bytes: usize) -> Self {
        Self {
            base_dir: base_dir.into(),
            max_document_bytes,
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn collection_dir(&self, collection: &str) -> PathBuf {
        let mut path = self.base_dir.clone();
        for segment in collection.split('/').filter(|s| !s.is_empty()) {
            path.push(sanitize_segment(segment));
        }
        path
    }

    fn document_path(&self, collection: &str, id: &str) -> PathBuf {
        self.collection_dir(collection)
            .join(format!("{}.{}", sanitize_segment(id), FILE_EXTENSION))
    }

    async fn write_atomically(&self, path: &Path, data: &[u8]) -> SyncResult<()> {
        let dir = path.parent().ok_or_else(|| {
            SyncError::Storage("Invalid path: no parent directory".to_string())
        })?;

        fs::create_dir_all(dir)
            .await
            .map_err(|e| SyncError::Storage(format!("Failed to create directory: {}", e)))?;

        let temp_file = NamedTempFile::new_in(dir).map_err(|e| {
            SyncError::Storage(format!("Failed to create temporary file: {}", e))
        })?;
        let temp_path = temp_file.path().to_path_buf();

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| SyncError::Storage(format!("Failed to create file: {}", e)))?;
        file.write_all(data)
            .await
            .map_err(|e| SyncError::Storage(format!("Failed to write to file: {}", e)))?;
        file.flush()
            .await
            .map_err(|e| SyncError::Storage(format!("Failed to flush file: {}", e)))?;

        fs::rename(&temp_path, path)
            .await
            .map_err(|e| SyncError::Storage(format!("Failed to rename file: {}", e)))?;

        Ok(())
    }
}

/// Replaces characters that are problematic in file names.
fn sanitize_segment(segment: &str) -> String {
    let cleaned = segment.replace(['/', '\\', ':', '*', '?', '"', '<', '>', '|'], "_");
    if cleaned == "." || cleaned == ".." {
        "_".to_string()
    } else {
        cleaned
    }
}

#[async_trait]
impl DocumentStore for LocalFsDocumentStore {
    async fn get(&self, collection: &str, id: &str) -> SyncResult<Option<Document>> {
        let path = self.document_path(collection, id);
        let contents = match fs::read(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(SyncError::Storage(format!(
                    "Failed to read {}: {}",
                    path.display(),
                    e
                )));
            }
        };
        let document: Document = serde_json::from_slice(&contents).map_err(|e| {
            SyncError::Serialization(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        Ok(Some(document))
    }

    async fn set(&self, collection: &str, id: &str, document: Document) -> SyncResult<()> {
        let bytes = encode_document(&document, self.max_document_bytes)?;
        let path = self.document_path(collection, id);
        self.write_atomically(&path, &bytes).await
    }

    async fn delete(&self, collection: &str, id: &str) -> SyncResult<()> {
        let path = self.document_path(collection, id);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SyncError::Storage(format!(
                "Failed to delete {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn list(&self, collection: &str) -> SyncResult<Vec<(String, Document)>> {
        let dir = self.collection_dir(collection);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(SyncError::Storage(format!(
                    "Failed to list {}: {}",
                    dir.display(),
                    e
                )));
            }
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SyncError::Storage(format!("Failed to list {}: {}", dir.display(), e)))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(FILE_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();

        let mut documents = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(document) = self.get(collection, &id).await? {
                documents.push((id, document));
            }
        }
        Ok(documents)
    }

    fn max_document_bytes(&self) -> usize {
        self.max_document_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn create_test_store() -> (LocalFsDocumentStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalFsDocumentStore::new(temp_dir.path(), 4096);
        (store, temp_dir)
    }

    fn doc(value: serde_json::Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_set_and_get_nested_collection() {
        let (store, temp_dir) = create_test_store();
        store
            .set("models/model-1/chunks", "000000", doc(json!({"index": 0})))
            .await
            .unwrap();

        assert!(
            temp_dir
                .path()
                .join("models/model-1/chunks/000000.json")
                .exists()
        );
        let loaded = store
            .get("models/model-1/chunks", "000000")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded["index"], json!(0));
    }

    #[tokio::test]
    async fn test_missing_document_and_collection() {
        let (store, _temp_dir) = create_test_store();
        assert!(store.get("nothing", "here").await.unwrap().is_none());
        assert!(store.list("nothing").await.unwrap().is_empty());
        store.delete("nothing", "here").await.unwrap();
    }

    #[tokio::test]
    async fn test_list_sorted_and_delete() {
        let (store, _temp_dir) = create_test_store();
        for id in ["b", "c", "a"] {
            store.set("col", id, doc(json!({"id": id}))).await.unwrap();
        }
        store.delete("col", "b").await.unwrap();
        let listed = store.list("col").await.unwrap();
        let ids: Vec<_> = listed.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert_eq!(listed[1].1["id"], json!("c"));
    }

    #[tokio::test]
    async fn test_size_ceiling() {
        let (store, _temp_dir) = create_test_store();
        let result = store
            .set("col", "big", doc(json!({"payload": "x".repeat(5000)})))
            .await;
        assert!(matches!(result, Err(SyncError::PayloadTooLarge { .. })));
        assert!(store.get("col", "big").await.unwrap().is_none());
    }

    #[test]
    fn test_sanitize_segment() {
        assert_eq!(sanitize_segment("a:b*c?"), "a_b_c_");
        assert_eq!(sanitize_segment(".."), "_");
    }
}
