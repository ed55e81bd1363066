//! Storage router.
//!
//! Picks a backend for every save, falls back from the blob backend to the
//! chunked backend on any upload failure, and only advances the catalog
//! version once a backend has accepted the artifact. Artifacts of a previous
//! backend are removed after the catalog update commits. Loads are dispatched to
//! the backend recorded in the catalog, without fallback.

use async_trait::async_trait;
use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::blob::BlobStore;
use crate::catalog::{ArtifactReaper, BackendKind, CatalogManager, CatalogRecord, CatalogUpdate};
use crate::chunked::ChunkedBackend;
use crate::codec::{self, Artifact, DecodedDataset};
use crate::config::RoutingConfig;
use crate::dataset::{Dataset, ModelId};
use crate::error::{SyncError, SyncResult};

/// Non-fatal problems reported alongside a successful save.
#[derive(Debug, Clone, PartialEq)]
pub enum SaveWarning {
    /// The blob upload failed and the artifact went to the chunked backend.
    BlobFallback { reason: SyncError },
    /// Artifacts left behind by a previous backend could not be removed.
    CleanupFailed { backend: BackendKind, reason: String },
}

impl fmt::Display for SaveWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BlobFallback { reason } => {
                write!(f, "external storage failed ({}), saved in chunks instead", reason)
            }
            Self::CleanupFailed { backend, reason } => {
                write!(f, "could not remove old {} artifact: {}", backend, reason)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SaveOutcome {
    pub version: u64,
    pub backend: BackendKind,
    pub locator: Option<String>,
    /// Stored size: compressed size for blobs, artifact size for chunks.
    pub size_bytes: usize,
    pub chunk_count: Option<usize>,
    pub warnings: Vec<SaveWarning>,
}

pub struct StorageRouter {
    catalog: Arc<CatalogManager>,
    chunked: ChunkedBackend,
    blob: Option<Arc<dyn BlobStore>>,
    routing: RoutingConfig,
    dimension: usize,
}

impl StorageRouter {
    pub fn new(
        catalog: Arc<CatalogManager>,
        chunked: ChunkedBackend,
        blob: Option<Arc<dyn BlobStore>>,
        routing: RoutingConfig,
        dimension: usize,
    ) -> Self {
        Self {
            catalog,
            chunked,
            blob,
            routing,
            dimension,
        }
    }

    pub fn catalog(&self) -> &Arc<CatalogManager> {
        &self.catalog
    }

    pub fn chunked(&self) -> &ChunkedBackend {
        &self.chunked
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    fn wants_blob(&self, size: usize) -> bool {
        self.blob.is_some()
            && (self.routing.force_external || size > self.routing.external_threshold_bytes)
    }

    /// Encodes and stores a dataset, then records the save in the catalog.
    pub async fn save(&self, model_id: &ModelId, dataset: &Dataset) -> SyncResult<SaveOutcome> {
        let record = self.catalog.require(model_id).await?;
        let artifact = Artifact::from_dataset(dataset, record.created_at, Utc::now());
        let bytes = artifact.to_bytes()?;
        let version = record.dataset_version + 1;
        let mut warnings = Vec::new();

        let mut stored = None;
        if let Some(blob) = self.blob.as_ref().filter(|_| self.wants_blob(bytes.len())) {
            match blob.upload(model_id, &bytes).await {
                Ok(upload) => stored = Some(upload),
                Err(e) => {
                    warn!(
                        model_id = %model_id,
                        operation = "save",
                        bytes = bytes.len(),
                        error = %e,
                        kind = e.kind(),
                        "Blob upload failed, falling back to chunked storage"
                    );
                    warnings.push(SaveWarning::BlobFallback { reason: e });
                }
            }
        }

        let (update, chunk_count) = match stored {
            Some(upload) => (
                CatalogUpdate {
                    backend: BackendKind::Blob,
                    locator: Some(upload.locator),
                    size_bytes: upload.compressed_size_bytes,
                    classes_count: dataset.len(),
                    examples_count: dataset.total_examples(),
                },
                None,
            ),
            None => {
                let chunks = self
                    .chunked
                    .save(model_id, &bytes, version)
                    .await
                    .inspect_err(|e| {
                        error!(
                            model_id = %model_id,
                            operation = "save",
                            bytes = bytes.len(),
                            version,
                            error = %e,
                            "Chunked save failed, catalog left unchanged"
                        )
                    })?;
                (
                    CatalogUpdate {
                        backend: BackendKind::Chunked,
                        locator: None,
                        size_bytes: bytes.len(),
                        classes_count: dataset.len(),
                        examples_count: dataset.total_examples(),
                    },
                    Some(chunks),
                )
            }
        };

        let backend = update.backend;
        let locator = update.locator.clone();
        let size_bytes = update.size_bytes;
        let new_version = self.catalog.update_after_save(model_id, update).await?;
        if new_version != version {
            warn!(
                model_id = %model_id,
                expected = version,
                version = new_version,
                "Catalog version moved during save"
            );
        }

        // The previous backend is only reaped once the catalog points away from it.
        if let Some(previous) = record.backend.filter(|b| *b != backend) {
            if let Err(e) = self.remove_from(previous, model_id).await {
                warn!(
                    model_id = %model_id,
                    backend = %previous,
                    error = %e,
                    "Failed to clean up artifacts of previous backend"
                );
                warnings.push(SaveWarning::CleanupFailed {
                    backend: previous,
                    reason: e.to_string(),
                });
            }
        }

        info!(
            model_id = %model_id,
            backend = %backend,
            bytes = size_bytes,
            version = new_version,
            "Dataset saved"
        );
        Ok(SaveOutcome {
            version: new_version,
            backend,
            locator,
            size_bytes,
            chunk_count,
            warnings,
        })
    }

    /// Loads the dataset from the backend recorded in the catalog.
    pub async fn load(&self, model_id: &ModelId) -> SyncResult<DecodedDataset> {
        let record = self.catalog.require(model_id).await?;
        let bytes = self.fetch(&record).await.inspect_err(|e| {
            error!(
                model_id = %model_id,
                operation = "load",
                backend = ?record.backend,
                error = %e,
                "Failed to load artifact"
            )
        })?;

        let decoded = codec::decode(&bytes, self.dimension)?;
        info!(
            model_id = %model_id,
            bytes = bytes.len(),
            version = record.dataset_version,
            classes = decoded.dataset.len(),
            warnings = decoded.warnings.len(),
            "Dataset loaded"
        );
        Ok(decoded)
    }

    async fn fetch(&self, record: &CatalogRecord) -> SyncResult<Vec<u8>> {
        match record.backend {
            None => Err(SyncError::NotFound(format!(
                "model {} has never been saved",
                record.model_id
            ))),
            Some(BackendKind::Chunked) => self.chunked.load(&record.model_id).await,
            Some(BackendKind::Blob) => {
                let locator = record.locator.as_deref().ok_or_else(|| {
                    SyncError::NotFound(format!("model {} has no blob locator", record.model_id))
                })?;
                self.blob_store()?.download(locator).await
            }
        }
    }

    async fn remove_from(&self, backend: BackendKind, model_id: &ModelId) -> SyncResult<()> {
        debug!(model_id = %model_id, backend = %backend, "Removing artifacts");
        match backend {
            BackendKind::Chunked => self.chunked.delete(model_id).await,
            BackendKind::Blob => self.blob_store()?.delete(model_id).await,
        }
    }

    fn blob_store(&self) -> SyncResult<&Arc<dyn BlobStore>> {
        self.blob.as_ref().ok_or_else(|| {
            SyncError::Validation("blob backend is not configured".to_string())
        })
    }
}

#[async_trait]
impl ArtifactReaper for StorageRouter {
    async fn delete_artifacts(&self, record: &CatalogRecord) -> SyncResult<()> {
        if let Some(backend) = record.backend {
            self.remove_from(backend, &record.model_id).await?;
        }
        if record.backend != Some(BackendKind::Chunked) {
            self.chunked.delete(&record.model_id).await?;
        }
        if record.backend.is_none() && self.blob.is_some() {
            if let Err(e) = self.remove_from(BackendKind::Blob, &record.model_id).await {
                warn!(
                    model_id = %record.model_id,
                    error = %e,
                    "Could not check blob store for an unrecorded artifact"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::{BlobUpload, MockBlobStore};
    use crate::config::CatalogConfig;
    use crate::dataset::Label;
    use crate::docstore::InMemoryDocumentStore;
    use std::sync::Mutex;

    const DIM: usize = 8;

    struct Fixture {
        router: StorageRouter,
        store: InMemoryDocumentStore,
        id: ModelId,
    }

    async fn fixture(blob: Option<MockBlobStore>, routing: RoutingConfig) -> Fixture {
        let store = InMemoryDocumentStore::new(1024 * 1024);
        let docs: Arc<dyn crate::docstore::DocumentStore> = Arc::new(store.clone());
        let catalog = Arc::new(CatalogManager::new(docs.clone(), &CatalogConfig::default()));
        let id = ModelId::parse("model-1").unwrap();
        catalog.create(&id).await.unwrap();
        let router = StorageRouter::new(
            catalog,
            ChunkedBackend::new(docs, 64),
            blob.map(|b| Arc::new(b) as Arc<dyn BlobStore>),
            routing,
            DIM,
        );
        Fixture { router, store, id }
    }

    fn routing(threshold: usize, force_external: bool) -> RoutingConfig {
        RoutingConfig {
            external_threshold_bytes: threshold,
            force_external,
        }
    }

    fn dataset() -> Dataset {
        let mut dataset = Dataset::new(DIM);
        let cat = Label::parse("cat").unwrap();
        let dog = Label::parse("dog").unwrap();
        for i in 0..3 {
            dataset.push(&cat, vec![i as f32; DIM].into()).unwrap();
        }
        for i in 0..5 {
            dataset.push(&dog, vec![0.5 + i as f32; DIM].into()).unwrap();
        }
        dataset
    }

    fn uploading_blob(uploaded: Arc<Mutex<Vec<u8>>>) -> MockBlobStore {
        let mut blob = MockBlobStore::new();
        blob.expect_upload().returning(move |id, bytes| {
            *uploaded.lock().unwrap() = bytes.to_vec();
            Ok(BlobUpload {
                locator: format!("http://blob.local/api/models/{}", id),
                compressed_size_bytes: 42,
            })
        });
        blob
    }

    #[tokio::test]
    async fn test_small_artifact_goes_to_chunks() {
        let mut blob = MockBlobStore::new();
        blob.expect_upload().times(0);
        let f = fixture(Some(blob), routing(usize::MAX, false)).await;

        let outcome = f.router.save(&f.id, &dataset()).await.unwrap();
        assert_eq!(outcome.backend, BackendKind::Chunked);
        assert_eq!(outcome.version, 1);
        assert!(outcome.chunk_count.unwrap() > 1);
        assert!(outcome.warnings.is_empty());

        let loaded = f.router.load(&f.id).await.unwrap();
        assert_eq!(loaded.dataset, dataset());
    }

    #[tokio::test]
    async fn test_large_artifact_goes_to_blob() {
        let uploaded = Arc::new(Mutex::new(Vec::new()));
        let f = fixture(Some(uploading_blob(uploaded.clone())), routing(16, false)).await;

        let outcome = f.router.save(&f.id, &dataset()).await.unwrap();
        assert_eq!(outcome.backend, BackendKind::Blob);
        assert_eq!(outcome.size_bytes, 42);
        assert_eq!(
            outcome.locator.as_deref(),
            Some("http://blob.local/api/models/model-1")
        );
        assert_eq!(f.router.chunked().chunk_count(&f.id).await.unwrap(), 0);

        let record = f.router.catalog().require(&f.id).await.unwrap();
        assert_eq!(record.backend, Some(BackendKind::Blob));
        assert_eq!(record.examples_count, 8);
        assert_eq!(record.classes_count, 2);
        let decoded = codec::decode(&uploaded.lock().unwrap(), DIM).unwrap();
        assert_eq!(decoded.dataset, dataset());
    }

    #[tokio::test]
    async fn test_force_external_ignores_threshold() {
        let uploaded = Arc::new(Mutex::new(Vec::new()));
        let f = fixture(Some(uploading_blob(uploaded)), routing(usize::MAX, true)).await;
        let outcome = f.router.save(&f.id, &dataset()).await.unwrap();
        assert_eq!(outcome.backend, BackendKind::Blob);
    }

    #[tokio::test]
    async fn test_unconfigured_blob_is_never_used() {
        let f = fixture(None, routing(0, true)).await;
        let outcome = f.router.save(&f.id, &dataset()).await.unwrap();
        assert_eq!(outcome.backend, BackendKind::Chunked);
        assert!(outcome.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_failing_blob_falls_back_to_chunks() {
        let mut blob = MockBlobStore::new();
        blob.expect_upload()
            .times(1)
            .returning(|_, _| Err(SyncError::NetworkUnreachable("connection refused".into())));
        let f = fixture(Some(blob), routing(16, false)).await;

        let outcome = f.router.save(&f.id, &dataset()).await.unwrap();
        assert_eq!(outcome.backend, BackendKind::Chunked);
        assert_eq!(
            outcome.warnings,
            vec![SaveWarning::BlobFallback {
                reason: SyncError::NetworkUnreachable("connection refused".into())
            }]
        );
        let record = f.router.catalog().require(&f.id).await.unwrap();
        assert_eq!(record.backend, Some(BackendKind::Chunked));
        assert_eq!(f.router.load(&f.id).await.unwrap().dataset, dataset());
    }

    #[tokio::test]
    async fn test_auth_failure_also_falls_back() {
        let mut blob = MockBlobStore::new();
        blob.expect_upload()
            .returning(|_, _| Err(SyncError::AuthFailure("Invalid API key".into())));
        let f = fixture(Some(blob), routing(0, false)).await;
        let outcome = f.router.save(&f.id, &dataset()).await.unwrap();
        assert_eq!(outcome.backend, BackendKind::Chunked);
        assert_eq!(outcome.warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_version_increments_only_on_success() {
        let f = fixture(None, routing(usize::MAX, false)).await;
        for expected in 1..=3 {
            let outcome = f.router.save(&f.id, &dataset()).await.unwrap();
            assert_eq!(outcome.version, expected);
        }

        f.store.fail_after_writes(0);
        assert!(f.router.save(&f.id, &dataset()).await.is_err());
        f.store.clear_faults();

        let record = f.router.catalog().require(&f.id).await.unwrap();
        assert_eq!(record.dataset_version, 3);
        let outcome = f.router.save(&f.id, &dataset()).await.unwrap();
        assert_eq!(outcome.version, 4);
        let meta = f.router.chunked().metadata(&f.id).await.unwrap().unwrap();
        assert_eq!(meta.dataset_version, 4);
    }

    #[tokio::test]
    async fn test_both_backends_failing_reports_error() {
        let mut blob = MockBlobStore::new();
        blob.expect_upload()
            .returning(|_, _| Err(SyncError::Timeout("slow".into())));
        let f = fixture(Some(blob), routing(0, false)).await;
        f.store.fail_after_writes(0);

        assert!(matches!(
            f.router.save(&f.id, &dataset()).await,
            Err(SyncError::Storage(_))
        ));
        f.store.clear_faults();
        let record = f.router.catalog().require(&f.id).await.unwrap();
        assert_eq!(record.dataset_version, 0);
        assert!(record.backend.is_none());
    }

    #[tokio::test]
    async fn test_blob_to_chunked_migration_removes_blob() {
        let mut blob = MockBlobStore::new();
        blob.expect_upload().times(1).returning(|id, _| {
            Ok(BlobUpload {
                locator: format!("http://blob.local/api/models/{}", id),
                compressed_size_bytes: 10,
            })
        });
        blob.expect_delete().times(1).returning(|_| Ok(()));
        let mut f = fixture(Some(blob), routing(0, false)).await;
        f.router.save(&f.id, &dataset()).await.unwrap();

        f.router.routing.external_threshold_bytes = usize::MAX;
        let outcome = f.router.save(&f.id, &dataset()).await.unwrap();
        assert_eq!(outcome.backend, BackendKind::Chunked);
        assert!(outcome.warnings.is_empty());
        assert_eq!(outcome.version, 2);
    }

    #[tokio::test]
    async fn test_chunked_to_blob_migration_removes_chunks() {
        let uploaded = Arc::new(Mutex::new(Vec::new()));
        let mut f = fixture(Some(uploading_blob(uploaded)), routing(usize::MAX, false)).await;
        f.router.save(&f.id, &dataset()).await.unwrap();
        assert!(f.router.chunked().chunk_count(&f.id).await.unwrap() > 0);

        f.router.routing.external_threshold_bytes = 16;
        let outcome = f.router.save(&f.id, &dataset()).await.unwrap();
        assert_eq!(outcome.backend, BackendKind::Blob);
        assert_eq!(outcome.version, 2);
        assert!(outcome.warnings.is_empty());
        assert_eq!(f.router.chunked().chunk_count(&f.id).await.unwrap(), 0);
        assert!(f.router.chunked().metadata(&f.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_catalog_update_keeps_previous_chunks() {
        let uploaded = Arc::new(Mutex::new(Vec::new()));
        let mut f = fixture(Some(uploading_blob(uploaded)), routing(usize::MAX, false)).await;
        f.router.save(&f.id, &dataset()).await.unwrap();
        let chunks = f.router.chunked().chunk_count(&f.id).await.unwrap();

        f.router.routing.external_threshold_bytes = 16;
        f.store.fail_after_writes(0);
        assert!(matches!(
            f.router.save(&f.id, &dataset()).await,
            Err(SyncError::Storage(_))
        ));
        f.store.clear_faults();

        let record = f.router.catalog().require(&f.id).await.unwrap();
        assert_eq!(record.backend, Some(BackendKind::Chunked));
        assert_eq!(record.dataset_version, 1);
        assert_eq!(f.router.chunked().chunk_count(&f.id).await.unwrap(), chunks);
        assert_eq!(f.router.load(&f.id).await.unwrap().dataset, dataset());
    }

    #[tokio::test]
    async fn test_failed_cleanup_is_only_a_warning() {
        let mut blob = MockBlobStore::new();
        blob.expect_upload().times(1).returning(|_, _| {
            Ok(BlobUpload {
                locator: "http://blob.local/api/models/model-1".to_string(),
                compressed_size_bytes: 10,
            })
        });
        blob.expect_delete()
            .returning(|_| Err(SyncError::NetworkUnreachable("down".into())));
        let mut f = fixture(Some(blob), routing(0, false)).await;
        f.router.save(&f.id, &dataset()).await.unwrap();

        f.router.routing.external_threshold_bytes = usize::MAX;
        let outcome = f.router.save(&f.id, &dataset()).await.unwrap();
        assert_eq!(outcome.backend, BackendKind::Chunked);
        assert!(matches!(
            outcome.warnings.as_slice(),
            [SaveWarning::CleanupFailed {
                backend: BackendKind::Blob,
                ..
            }]
        ));
    }

    #[tokio::test]
    async fn test_load_from_blob() {
        let bytes = codec::encode(&dataset(), Utc::now()).unwrap();
        let mut blob = MockBlobStore::new();
        blob.expect_upload().returning(|_, _| {
            Ok(BlobUpload {
                locator: "http://blob.local/api/models/model-1".to_string(),
                compressed_size_bytes: 10,
            })
        });
        blob.expect_download()
            .withf(|locator| locator == "http://blob.local/api/models/model-1")
            .returning(move |_| Ok(bytes.clone()));
        let f = fixture(Some(blob), routing(0, false)).await;
        f.router.save(&f.id, &dataset()).await.unwrap();

        let loaded = f.router.load(&f.id).await.unwrap();
        assert_eq!(loaded.dataset, dataset());
    }

    #[tokio::test]
    async fn test_load_errors_are_not_retried_elsewhere() {
        let mut blob = MockBlobStore::new();
        blob.expect_upload().returning(|_, _| {
            Ok(BlobUpload {
                locator: "http://blob.local/api/models/model-1".to_string(),
                compressed_size_bytes: 10,
            })
        });
        blob.expect_download()
            .times(1)
            .returning(|_| Err(SyncError::NetworkUnreachable("down".into())));
        let f = fixture(Some(blob), routing(0, false)).await;
        f.router.save(&f.id, &dataset()).await.unwrap();

        assert!(matches!(
            f.router.load(&f.id).await,
            Err(SyncError::NetworkUnreachable(_))
        ));
    }

    #[tokio::test]
    async fn test_unsaved_and_unknown_models() {
        let f = fixture(None, routing(usize::MAX, false)).await;
        assert!(matches!(f.router.load(&f.id).await, Err(SyncError::NotFound(_))));

        let unknown = ModelId::parse("model-2").unwrap();
        assert!(matches!(
            f.router.save(&unknown, &dataset()).await,
            Err(SyncError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_catalog_delete_reaps_unrecorded_artifacts() {
        let mut blob = MockBlobStore::new();
        blob.expect_delete().times(1).returning(|_| Ok(()));
        let f = fixture(Some(blob), routing(usize::MAX, false)).await;

        // Chunks written by a save whose catalog update never landed.
        f.router.chunked().save(&f.id, b"{}", 1).await.unwrap();
        let record = f.router.catalog().require(&f.id).await.unwrap();
        assert!(record.backend.is_none());

        f.router.catalog().delete(&f.id, &f.router).await.unwrap();
        assert_eq!(f.router.chunked().chunk_count(&f.id).await.unwrap(), 0);
        assert!(f.router.chunked().metadata(&f.id).await.unwrap().is_none());
        assert!(f.router.catalog().get(&f.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_catalog_delete_reaps_chunks() {
        let f = fixture(None, routing(usize::MAX, false)).await;
        f.router.save(&f.id, &dataset()).await.unwrap();
        assert!(f.router.chunked().chunk_count(&f.id).await.unwrap() > 0);

        f.router.catalog().delete(&f.id, &f.router).await.unwrap();
        assert_eq!(f.router.chunked().chunk_count(&f.id).await.unwrap(), 0);
        assert!(f.router.catalog().get(&f.id).await.unwrap().is_none());
    }
}
