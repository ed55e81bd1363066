//! Session-level persistence operations.
//!
//! [`ModelSync`] ties the router, the catalog and the local fallback to a
//! [`SessionContext`]. Every save or load of a model holds that model's lock
//! from the [`ModelLocks`](crate::session::ModelLocks) of the session for its
//! whole duration.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::autosave::DatasetSaver;
use crate::blob::{BlobStore, HttpBlobStore};
use crate::catalog::CatalogManager;
use crate::chunked::ChunkedBackend;
use crate::codec::DecodeWarning;
use crate::config::SyncConfig;
use crate::dataset::ModelId;
use crate::docstore::DocumentStore;
use crate::embedding_store::CountMismatch;
use crate::error::{SyncError, SyncResult};
use crate::fallback::LocalFallback;
use crate::router::{SaveOutcome, StorageRouter};
use crate::session::SessionContext;

/// What a load put into the session's store.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadReport {
    pub classes: usize,
    pub examples: usize,
    pub warnings: Vec<DecodeWarning>,
    pub mismatches: Vec<CountMismatch>,
}

pub struct ModelSync {
    router: Arc<StorageRouter>,
    fallback: Option<LocalFallback>,
    config: SyncConfig,
}

impl ModelSync {
    pub fn new(router: Arc<StorageRouter>, fallback: Option<LocalFallback>, config: SyncConfig) -> Self {
        Self {
            router,
            fallback,
            config,
        }
    }

    /// Builds the full stack on top of a document store. The blob backend is
    /// only wired in when both its endpoint and key are configured.
    pub fn from_config(
        config: SyncConfig,
        documents: Arc<dyn DocumentStore>,
        fallback: Option<LocalFallback>,
    ) -> SyncResult<Self> {
        config.validate()?;
        let catalog = Arc::new(CatalogManager::new(documents.clone(), &config.catalog));
        let chunked = ChunkedBackend::new(documents, config.chunking.chunk_size_bytes);
        let blob: Option<Arc<dyn BlobStore>> = if config.blob.is_configured() {
            Some(Arc::new(HttpBlobStore::new(&config.blob)?))
        } else {
            info!("Blob backend not configured, using chunked storage only");
            None
        };
        let router = StorageRouter::new(
            catalog,
            chunked,
            blob,
            config.routing.clone(),
            config.embedding_dimension,
        );
        Ok(Self::new(Arc::new(router), fallback, config))
    }

    pub fn router(&self) -> &Arc<StorageRouter> {
        &self.router
    }

    pub fn catalog(&self) -> &Arc<CatalogManager> {
        self.router.catalog()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Saves the session's dataset to its current model.
    pub async fn save_now(&self, session: &SessionContext) -> SyncResult<SaveOutcome> {
        require_admin(session, "save")?;
        let model_id = session
            .current_model()
            .await
            .ok_or_else(|| SyncError::Validation("no model selected".to_string()))?;
        self.save_model(session, &model_id).await
    }

    pub async fn save_model(
        &self,
        session: &SessionContext,
        model_id: &ModelId,
    ) -> SyncResult<SaveOutcome> {
        require_admin(session, "save")?;
        let _guard = session.locks.acquire(model_id).await;
        let snapshot = session.store.read().await.snapshot();

        match self.router.save(model_id, &snapshot).await {
            Ok(outcome) => {
                for warning in &outcome.warnings {
                    warn!(model_id = %model_id, warning = %warning, "Save completed with warning");
                }
                Ok(outcome)
            }
            Err(e) => {
                error!(
                    model_id = %model_id,
                    operation = "save",
                    examples = snapshot.total_examples(),
                    error = %e,
                    "Save failed"
                );
                if e.is_network_class() {
                    if let Some(fallback) = &self.fallback {
                        match fallback.save(&snapshot) {
                            Ok(bytes) => {
                                info!(model_id = %model_id, bytes, "Dataset kept in local snapshot")
                            }
                            Err(local) => {
                                error!(model_id = %model_id, error = %local, "Local snapshot failed too")
                            }
                        }
                    }
                }
                Err(e)
            }
        }
    }

    /// Replaces the session's dataset with the stored one and makes
    /// `model_id` the current model.
    pub async fn load(&self, session: &SessionContext, model_id: &ModelId) -> SyncResult<LoadReport> {
        let _guard = session.locks.acquire(model_id).await;
        let decoded = self.router.load(model_id).await?;

        let mut store = session.store.write().await;
        store.replace(decoded.dataset);
        let mismatches = store.reconcile(&decoded.advisory_counts);
        let report = LoadReport {
            classes: store.dataset().len(),
            examples: store.dataset().total_examples(),
            warnings: decoded.warnings,
            mismatches,
        };
        drop(store);

        session.set_current_model(Some(model_id.clone())).await;
        Ok(report)
    }

    /// Restores the local snapshot into the session, if there is one.
    pub async fn load_local(&self, session: &SessionContext) -> SyncResult<Option<LoadReport>> {
        let Some(fallback) = &self.fallback else {
            return Ok(None);
        };
        let Some(restored) = fallback.load(self.config.embedding_dimension)? else {
            return Ok(None);
        };

        let mut store = session.store.write().await;
        store.replace(restored.dataset);
        let mismatches = store.reconcile(&restored.advisory_counts);
        Ok(Some(LoadReport {
            classes: store.dataset().len(),
            examples: store.dataset().total_examples(),
            warnings: restored.warnings,
            mismatches,
        }))
    }

    /// Clears the session's dataset and the local snapshot.
    pub async fn reset(&self, session: &SessionContext) -> SyncResult<()> {
        session.store.write().await.reset();
        if let Some(fallback) = &self.fallback {
            fallback.clear()?;
        }
        info!("Session dataset cleared");
        Ok(())
    }

    /// Deletes a model's artifacts and catalog record.
    pub async fn delete_model(&self, session: &SessionContext, model_id: &ModelId) -> SyncResult<()> {
        require_admin(session, "delete")?;
        let _guard = session.locks.acquire(model_id).await;
        self.catalog().delete(model_id, self.router.as_ref()).await?;
        if session.current_model().await.as_ref() == Some(model_id) {
            session.set_current_model(None).await;
        }
        Ok(())
    }
}

#[async_trait]
impl DatasetSaver for ModelSync {
    async fn save(&self, session: &SessionContext) -> SyncResult<SaveOutcome> {
        self.save_now(session).await
    }
}

fn require_admin(session: &SessionContext, operation: &str) -> SyncResult<()> {
    if !session.is_admin() {
        return Err(SyncError::AuthFailure(format!(
            "{} requires the admin capability",
            operation
        )));
    }
    Ok(())
}
