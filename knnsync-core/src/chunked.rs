//! Chunked document backend.
//!
//! Stores an artifact as an ordered set of size-bounded documents in a
//! [`DocumentStore`]. Each chunk carries at most `chunk_size` raw bytes,
//! base64-encoded, so that the document stays under the store ceiling after
//! the ~33% expansion.
//!
//! Layout for a model `model-1`:
//!
//! - `models/model-1/chunks/000000`, `000001`, ... one [`ChunkDocument`] each
//! - `models/model-1/meta/dataset` the [`DatasetMeta`] document
//!
//! A save deletes every existing chunk before writing the new set, and only
//! writes the metadata document once every chunk is stored.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::dataset::ModelId;
use crate::docstore::{DocumentStore, from_document, to_document};
use crate::error::{SyncError, SyncResult};

/// Room reserved in every chunk document for the fields around the payload.
pub const CHUNK_ENVELOPE_BYTES: usize = 256;

const META_DOCUMENT_ID: &str = "dataset";

/// Length of the base64 encoding of `raw_len` bytes.
pub fn encoded_chunk_len(raw_len: usize) -> usize {
    raw_len.div_ceil(3) * 4
}

/// One fragment of an artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkDocument {
    pub dataset_version: u64,
    pub index: usize,
    /// base64 of the raw slice
    pub payload: String,
    /// length of the raw slice
    pub byte_length: usize,
}

/// Per-model metadata written after a complete chunk set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetMeta {
    pub dataset_version: u64,
    pub chunk_count: usize,
    pub byte_length: usize,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct ChunkedBackend {
    store: Arc<dyn DocumentStore>,
    chunk_size: usize,
}

impl ChunkedBackend {
    pub fn new(store: Arc<dyn DocumentStore>, chunk_size: usize) -> Self {
        Self {
            store,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn chunks_collection(model_id: &ModelId) -> String {
        format!("models/{}/chunks", model_id)
    }

    fn meta_collection(model_id: &ModelId) -> String {
        format!("models/{}/meta", model_id)
    }

    /// Writes `bytes` as a fresh chunk set tagged with `version` and returns
    /// the number of chunks.
    ///
    /// If a chunk write fails, the chunks written by this call are removed
    /// again and the metadata document is left untouched: the model then
    /// holds no chunks and must be saved again before it can be loaded.
    pub async fn save(&self, model_id: &ModelId, bytes: &[u8], version: u64) -> SyncResult<usize> {
        let collection = Self::chunks_collection(model_id);

        let removed = self.delete_chunks(&collection).await?;
        debug!(model_id = %model_id, removed, "Removed previous chunk set");

        let slices: Vec<&[u8]> = if bytes.is_empty() {
            vec![&[]]
        } else {
            bytes.chunks(self.chunk_size).collect()
        };

        for (index, slice) in slices.iter().enumerate() {
            let chunk = ChunkDocument {
                dataset_version: version,
                index,
                payload: STANDARD.encode(slice),
                byte_length: slice.len(),
            };
            let document = to_document(&chunk)?;
            if let Err(e) = self.store.set(&collection, &chunk_id(index), document).await {
                warn!(
                    model_id = %model_id,
                    operation = "chunked_save",
                    chunk = index,
                    chunks = slices.len(),
                    version,
                    error = %e,
                    "Chunk write failed, discarding partial chunk set"
                );
                if let Err(cleanup) = self.delete_chunks(&collection).await {
                    warn!(model_id = %model_id, error = %cleanup, "Failed to discard partial chunk set");
                }
                return Err(e);
            }
        }

        let meta = DatasetMeta {
            dataset_version: version,
            chunk_count: slices.len(),
            byte_length: bytes.len(),
            updated_at: Utc::now(),
        };
        self.store
            .merge(
                &Self::meta_collection(model_id),
                META_DOCUMENT_ID,
                to_document(&meta)?,
            )
            .await?;

        info!(
            model_id = %model_id,
            chunks = slices.len(),
            bytes = bytes.len(),
            version,
            "Saved chunked artifact"
        );
        Ok(slices.len())
    }

    /// Reassembles the artifact bytes.
    ///
    /// Fails with `NotFound` when no chunk exists and with `Integrity` when
    /// the chunk set is not contiguous, mixes versions, has a payload whose
    /// length disagrees with its `byteLength`, or disagrees with the version
    /// recorded in the metadata document.
    pub async fn load(&self, model_id: &ModelId) -> SyncResult<Vec<u8>> {
        let documents = self.store.list(&Self::chunks_collection(model_id)).await?;
        if documents.is_empty() {
            return Err(SyncError::NotFound(format!(
                "no chunks stored for model {}",
                model_id
            )));
        }

        let mut bytes = Vec::new();
        let mut version = None;
        for (position, (id, document)) in documents.into_iter().enumerate() {
            let chunk: ChunkDocument = from_document(document).map_err(|e| {
                SyncError::Integrity(format!("chunk {} of model {} is malformed: {}", id, model_id, e))
            })?;
            if chunk.index != position {
                return Err(SyncError::Integrity(format!(
                    "model {} chunk set is not contiguous: expected index {}, found {}",
                    model_id, position, chunk.index
                )));
            }
            let expected_version = *version.get_or_insert(chunk.dataset_version);
            if chunk.dataset_version != expected_version {
                return Err(SyncError::Integrity(format!(
                    "model {} chunk {} has version {}, expected {}",
                    model_id, chunk.index, chunk.dataset_version, expected_version
                )));
            }
            let slice = STANDARD.decode(&chunk.payload).map_err(|e| {
                SyncError::Integrity(format!(
                    "model {} chunk {} payload is not valid base64: {}",
                    model_id, chunk.index, e
                ))
            })?;
            if slice.len() != chunk.byte_length {
                return Err(SyncError::Integrity(format!(
                    "model {} chunk {} holds {} bytes, expected {}",
                    model_id,
                    chunk.index,
                    slice.len(),
                    chunk.byte_length
                )));
            }
            bytes.extend_from_slice(&slice);
        }

        if let (Some(meta), Some(version)) = (self.metadata(model_id).await?, version) {
            if meta.dataset_version != version {
                return Err(SyncError::Integrity(format!(
                    "model {} chunks carry version {} but metadata records {}",
                    model_id, version, meta.dataset_version
                )));
            }
        }

        debug!(model_id = %model_id, bytes = bytes.len(), "Reassembled chunked artifact");
        Ok(bytes)
    }

    /// Removes every chunk and the metadata document. Safe to call when
    /// nothing is stored.
    pub async fn delete(&self, model_id: &ModelId) -> SyncResult<()> {
        let removed = self.delete_chunks(&Self::chunks_collection(model_id)).await?;
        self.store
            .delete(&Self::meta_collection(model_id), META_DOCUMENT_ID)
            .await?;
        info!(model_id = %model_id, chunks = removed, "Deleted chunked artifact");
        Ok(())
    }

    pub async fn chunk_count(&self, model_id: &ModelId) -> SyncResult<usize> {
        Ok(self.store.list(&Self::chunks_collection(model_id)).await?.len())
    }

    pub async fn metadata(&self, model_id: &ModelId) -> SyncResult<Option<DatasetMeta>> {
        self.store
            .get(&Self::meta_collection(model_id), META_DOCUMENT_ID)
            .await?
            .map(from_document)
            .transpose()
    }

    async fn delete_chunks(&self, collection: &str) -> SyncResult<usize> {
        let existing = self.store.list(collection).await?;
        for (id, _) in &existing {
            self.store.delete(collection, id).await?;
        }
        Ok(existing.len())
    }
}

fn chunk_id(index: usize) -> String {
    format!("{:06}", index)
}
