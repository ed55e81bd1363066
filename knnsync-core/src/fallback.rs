//! Local fallback snapshot.
//!
//! When no remote backend accepts a save, the dataset is written as one JSON
//! value under a fixed key of a quota-limited key-value store:
//!
//! ```json
//! {
//!   "classes": { "cat": { "name": "cat", "examples": 3 } },
//!   "dataset": { "cat": [0.1, 0.2, ...] }
//! }
//! ```
//!
//! On load, a class whose flat array is empty or not a multiple of the
//! dimension is skipped.

use dashmap::DashMap;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::codec::DecodeWarning;
use crate::dataset::{Dataset, EmbeddingVector, Label};
use crate::error::{SyncError, SyncResult};

/// Key the snapshot is stored under.
pub const FALLBACK_KEY: &str = "knnsync.dataset";

/// A small synchronous key-value store with a byte quota.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> SyncResult<Option<String>>;

    /// Stores a value. On `QuotaExceeded` the previous value is kept.
    fn set(&self, key: &str, value: String) -> SyncResult<()>;

    fn remove(&self, key: &str) -> SyncResult<()>;
}

#[derive(Clone)]
pub struct InMemoryKeyValueStore {
    quota_bytes: usize,
    entries: Arc<DashMap<String, String>>,
}

impl InMemoryKeyValueStore {
    pub fn new(quota_bytes: usize) -> Self {
        Self {
            quota_bytes,
            entries: Arc::new(DashMap::new()),
        }
    }

    /// Bytes used by keys and values.
    pub fn used_bytes(&self) -> usize {
        self.entries
            .iter()
            .map(|e| e.key().len() + e.value().len())
            .sum()
    }
}

impl KeyValueStore for InMemoryKeyValueStore {
    fn get(&self, key: &str) -> SyncResult<Option<String>> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    fn set(&self, key: &str, value: String) -> SyncResult<()> {
        let replaced = self
            .entries
            .get(key)
            .map(|v| key.len() + v.len())
            .unwrap_or(0);
        let available = self.quota_bytes.saturating_sub(self.used_bytes() - replaced);
        let required = key.len() + value.len();
        if required > available {
            return Err(SyncError::QuotaExceeded {
                required,
                available,
            });
        }
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> SyncResult<()> {
        self.entries.remove(key);
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ClassEntry {
    name: String,
    examples: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    classes: IndexMap<String, ClassEntry>,
    #[serde(default)]
    dataset: IndexMap<String, Vec<f32>>,
}

/// A dataset restored from the local snapshot.
#[derive(Debug, Clone)]
pub struct RestoredSnapshot {
    pub dataset: Dataset,
    pub warnings: Vec<DecodeWarning>,
    /// Example counts recorded in the snapshot's class list.
    pub advisory_counts: IndexMap<String, usize>,
}

#[derive(Clone)]
pub struct LocalFallback {
    kv: Arc<dyn KeyValueStore>,
}

impl LocalFallback {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    /// Writes the snapshot and returns its size in bytes.
    pub fn save(&self, dataset: &Dataset) -> SyncResult<usize> {
        let mut snapshot = Snapshot::default();
        for bucket in dataset.iter() {
            let name = bucket.label.to_string();
            snapshot.classes.insert(
                name.clone(),
                ClassEntry {
                    name: name.clone(),
                    examples: bucket.example_count(),
                },
            );
            if bucket.example_count() > 0 {
                let flat = bucket
                    .vectors
                    .iter()
                    .flat_map(|v| v.as_slice().iter().copied())
                    .collect();
                snapshot.dataset.insert(name, flat);
            }
        }

        let json = serde_json::to_string(&snapshot)?;
        let size = json.len();
        self.kv.set(FALLBACK_KEY, json).inspect_err(|e| {
            warn!(operation = "fallback_save", bytes = size, error = %e, "Local snapshot not written")
        })?;
        info!(bytes = size, classes = dataset.len(), "Saved local snapshot");
        Ok(size)
    }

    /// Reads the snapshot, `None` if there is none.
    pub fn load(&self, dimension: usize) -> SyncResult<Option<RestoredSnapshot>> {
        if dimension == 0 {
            return Err(SyncError::Validation(
                "embedding dimension must be positive".to_string(),
            ));
        }
        let Some(json) = self.kv.get(FALLBACK_KEY)? else {
            debug!("No local snapshot found");
            return Ok(None);
        };
        let snapshot: Snapshot = serde_json::from_str(&json)?;

        let mut dataset = Dataset::new(dimension);
        let mut warnings = Vec::new();
        let mut skip = |label: &str, reason: String| {
            warn!(label, reason = %reason, "Skipping class from local snapshot");
            warnings.push(DecodeWarning {
                label: label.to_string(),
                reason,
            });
        };

        for (name, data) in snapshot.dataset {
            let label = match Label::parse(&name) {
                Ok(label) => label,
                Err(e) => {
                    skip(&name, e.to_string());
                    continue;
                }
            };
            if data.is_empty() {
                skip(&name, "no data".to_string());
                continue;
            }
            if data.len() % dimension != 0 {
                skip(
                    &name,
                    format!(
                        "data length {} is not a multiple of {}",
                        data.len(),
                        dimension
                    ),
                );
                continue;
            }
            let vectors = data
                .chunks_exact(dimension)
                .map(|v| EmbeddingVector::new(v.to_vec()))
                .collect();
            dataset.insert_bucket(label, vectors)?;
        }

        let advisory_counts = snapshot
            .classes
            .iter()
            .map(|(name, entry)| (name.clone(), entry.examples))
            .collect();
        // classes created but never trained have no data entry
        for (name, entry) in &snapshot.classes {
            if let Ok(label) = Label::parse(name) {
                if entry.examples == 0 && !dataset.contains(&label) {
                    dataset.add_class(label)?;
                }
            }
        }

        Ok(Some(RestoredSnapshot {
            dataset,
            warnings,
            advisory_counts,
        }))
    }

    pub fn clear(&self) -> SyncResult<()> {
        self.kv.remove(FALLBACK_KEY)
    }
}
