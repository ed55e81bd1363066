//! Catalog of persisted models.
//!
//! Model ids come from a fixed pool (`model-1..model-N`). Each model has one
//! [`CatalogRecord`] document in the `catalog` collection, holding its display
//! name, the backend that stores its artifact, and a dataset version that
//! increases by one per successful save.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use strum::{Display, EnumString};
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::config::CatalogConfig;
use crate::dataset::ModelId;
use crate::docstore::{DocumentStore, from_document, to_document};
use crate::error::{SyncError, SyncResult};

pub const CATALOG_COLLECTION: &str = "catalog";

/// Storage mechanism holding a model's artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum BackendKind {
    Chunked,
    Blob,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogRecord {
    pub model_id: ModelId,
    pub display_name: String,
    /// `None` until the first successful save.
    pub backend: Option<BackendKind>,
    /// Blob URL for blob-backed models; chunked models are addressed by id.
    pub locator: Option<String>,
    pub dataset_version: u64,
    pub size_bytes: usize,
    pub classes_count: usize,
    pub examples_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields overwritten after a successful save.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogUpdate {
    pub backend: BackendKind,
    pub locator: Option<String>,
    pub size_bytes: usize,
    pub classes_count: usize,
    pub examples_count: usize,
}

/// Removes the stored artifact of a model, whatever backend holds it.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ArtifactReaper: Send + Sync {
    async fn delete_artifacts(&self, record: &CatalogRecord) -> SyncResult<()>;
}

pub struct CatalogManager {
    store: Arc<dyn DocumentStore>,
    pool_size: usize,
    max_name_len: usize,
    write_lock: Mutex<()>,
}

impl CatalogManager {
    pub fn new(store: Arc<dyn DocumentStore>, config: &CatalogConfig) -> Self {
        Self {
            store,
            pool_size: config.pool_size,
            max_name_len: config.max_name_len,
            write_lock: Mutex::new(()),
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// All records, ordered by pool slot.
    pub async fn list(&self) -> SyncResult<Vec<CatalogRecord>> {
        let mut records = self
            .store
            .list(CATALOG_COLLECTION)
            .await?
            .into_iter()
            .map(|(_, document)| from_document::<CatalogRecord>(document))
            .collect::<SyncResult<Vec<_>>>()?;
        records.sort_by_key(|r| (r.model_id.slot().unwrap_or(usize::MAX), r.model_id.clone()));
        Ok(records)
    }

    pub async fn get(&self, model_id: &ModelId) -> SyncResult<Option<CatalogRecord>> {
        self.store
            .get(CATALOG_COLLECTION, model_id.as_str())
            .await?
            .map(from_document)
            .transpose()
    }

    /// Like [`get`](Self::get) but an absent record is `NotFound`.
    pub async fn require(&self, model_id: &ModelId) -> SyncResult<CatalogRecord> {
        self.get(model_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("model {} is not in the catalog", model_id)))
    }

    /// Creates the record for one pool slot.
    pub async fn create(&self, model_id: &ModelId) -> SyncResult<CatalogRecord> {
        let slot = model_id
            .slot()
            .filter(|slot| *slot <= self.pool_size)
            .ok_or_else(|| {
                SyncError::Validation(format!(
                    "model id {} is not one of model-1..model-{}",
                    model_id, self.pool_size
                ))
            })?;

        let _guard = self.write_lock.lock().await;
        if self.get(model_id).await?.is_some() {
            return Err(SyncError::AlreadyExists(format!("model {}", model_id)));
        }
        if self.store.list(CATALOG_COLLECTION).await?.len() >= self.pool_size {
            return Err(SyncError::PoolExhausted(self.pool_size));
        }

        let now = Utc::now();
        let record = CatalogRecord {
            model_id: model_id.clone(),
            display_name: format!("Model {}", slot),
            backend: None,
            locator: None,
            dataset_version: 0,
            size_bytes: 0,
            classes_count: 0,
            examples_count: 0,
            created_at: now,
            updated_at: now,
        };
        self.write(&record).await?;
        info!(model_id = %model_id, operation = "catalog_create", "Created catalog record");
        Ok(record)
    }

    /// Creates the record for the first free pool slot.
    pub async fn create_next(&self) -> SyncResult<CatalogRecord> {
        let taken: Vec<usize> = self
            .list()
            .await?
            .iter()
            .filter_map(|r| r.model_id.slot())
            .collect();
        let slot = (1..=self.pool_size)
            .find(|slot| !taken.contains(slot))
            .ok_or(SyncError::PoolExhausted(self.pool_size))?;
        self.create(&ModelId::pool_slot(slot)).await
    }

    pub async fn rename(&self, model_id: &ModelId, name: &str) -> SyncResult<CatalogRecord> {
        let name = name.trim();
        if name.is_empty() {
            return Err(SyncError::Validation("model name must not be empty".to_string()));
        }
        if name.chars().count() > self.max_name_len {
            return Err(SyncError::Validation(format!(
                "model name must be at most {} characters",
                self.max_name_len
            )));
        }

        let _guard = self.write_lock.lock().await;
        let mut record = self.require(model_id).await?;
        record.display_name = name.to_string();
        record.updated_at = Utc::now();
        self.write(&record).await?;
        info!(model_id = %model_id, operation = "catalog_rename", "Renamed model");
        Ok(record)
    }

    /// Removes the model's artifacts, then its record. If the artifacts
    /// cannot be removed the record is kept so the data stays reachable.
    pub async fn delete(&self, model_id: &ModelId, reaper: &dyn ArtifactReaper) -> SyncResult<()> {
        let _guard = self.write_lock.lock().await;
        let record = self.require(model_id).await?;

        // A record without a backend may still own artifacts from a save
        // whose catalog update failed.
        if let Err(e) = reaper.delete_artifacts(&record).await {
            error!(
                model_id = %model_id,
                operation = "catalog_delete",
                backend = ?record.backend,
                error = %e,
                "Failed to delete model artifacts, keeping catalog record"
            );
            return Err(e);
        }

        self.store
            .delete(CATALOG_COLLECTION, model_id.as_str())
            .await?;
        info!(model_id = %model_id, operation = "catalog_delete", "Deleted model");
        Ok(())
    }

    /// Records a successful save and returns the new dataset version.
    pub async fn update_after_save(
        &self,
        model_id: &ModelId,
        update: CatalogUpdate,
    ) -> SyncResult<u64> {
        let _guard = self.write_lock.lock().await;
        let mut record = self.require(model_id).await?;

        record.dataset_version += 1;
        record.backend = Some(update.backend);
        record.locator = update.locator;
        record.size_bytes = update.size_bytes;
        record.classes_count = update.classes_count;
        record.examples_count = update.examples_count;
        record.updated_at = Utc::now();
        self.write(&record).await?;

        info!(
            model_id = %model_id,
            version = record.dataset_version,
            backend = %update.backend,
            bytes = record.size_bytes,
            "Catalog record updated"
        );
        Ok(record.dataset_version)
    }

    async fn write(&self, record: &CatalogRecord) -> SyncResult<()> {
        self.store
            .set(
                CATALOG_COLLECTION,
                record.model_id.as_str(),
                to_document(record)?,
            )
            .await
    }
}
