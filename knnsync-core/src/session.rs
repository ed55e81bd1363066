//! Session context passed explicitly to every engine operation.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::dataset::ModelId;
use crate::embedding_store::EmbeddingStore;

/// The acting user, as far as persistence is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Principal {
    pub admin: bool,
}

impl Principal {
    pub fn admin() -> Self {
        Self { admin: true }
    }

    pub fn viewer() -> Self {
        Self { admin: false }
    }
}

/// One lock per model id, held for the whole duration of a save or load.
#[derive(Clone, Default)]
pub struct ModelLocks {
    locks: Arc<DashMap<ModelId, Arc<Mutex<()>>>>,
}

impl ModelLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for the model's lock. Dropping the guard releases it.
    pub async fn acquire(&self, model_id: &ModelId) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(model_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Whether a save or load currently holds the model's lock.
    pub fn is_locked(&self, model_id: &ModelId) -> bool {
        self.locks
            .get(model_id)
            .map(|lock| lock.try_lock().is_err())
            .unwrap_or(false)
    }
}

#[derive(Clone)]
pub struct SessionContext {
    pub principal: Principal,
    pub store: Arc<RwLock<EmbeddingStore>>,
    current_model: Arc<RwLock<Option<ModelId>>>,
    pub locks: ModelLocks,
}

impl SessionContext {
    pub fn new(principal: Principal, dimension: usize) -> Self {
        Self {
            principal,
            store: Arc::new(RwLock::new(EmbeddingStore::new(dimension))),
            current_model: Arc::new(RwLock::new(None)),
            locks: ModelLocks::new(),
        }
    }

    pub fn is_admin(&self) -> bool {
        self.principal.admin
    }

    pub async fn current_model(&self) -> Option<ModelId> {
        self.current_model.read().await.clone()
    }

    pub async fn set_current_model(&self, model_id: Option<ModelId>) {
        *self.current_model.write().await = model_id;
    }
}
