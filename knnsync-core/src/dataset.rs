//! Data model of a nearest-neighbor classifier dataset.
//!
//! A [`Dataset`] maps class labels to the embedding vectors captured for
//! them. Insertion order of labels is preserved so that listings stay stable
//! between renders; equality ignores it.

use indexmap::IndexMap;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::error::{SyncError, SyncResult};

/// Longest accepted class label, in characters.
pub const MAX_LABEL_CHARS: usize = 50;

lazy_static! {
    static ref MODEL_ID_PATTERN: Regex = Regex::new(r"^[a-zA-Z0-9_-]+$").unwrap();
}

/// An immutable embedding produced by the feature extractor.
///
/// Cloning shares the underlying buffer; once a vector is handed to a
/// [`Dataset`] nobody mutates it again.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingVector(Arc<[f32]>);

impl EmbeddingVector {
    pub fn new(values: Vec<f32>) -> Self {
        Self(Arc::from(values))
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn dimension(&self) -> usize {
        self.0.len()
    }
}

impl From<Vec<f32>> for EmbeddingVector {
    fn from(values: Vec<f32>) -> Self {
        Self::new(values)
    }
}

/// A validated class label.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Label(String);

impl Label {
    /// Trims the input and checks length and charset.
    ///
    /// Letters and digits of any script are accepted, plus space, `_`, `-`
    /// and `.`.
    pub fn parse(raw: &str) -> SyncResult<Self> {
        let trimmed = raw.trim();
        let chars = trimmed.chars().count();
        if chars == 0 {
            return Err(SyncError::Validation("label cannot be empty".to_string()));
        }
        if chars > MAX_LABEL_CHARS {
            return Err(SyncError::Validation(format!(
                "label is {} characters, the limit is {}",
                chars, MAX_LABEL_CHARS
            )));
        }
        if let Some(bad) = trimmed
            .chars()
            .find(|c| !(c.is_alphanumeric() || matches!(c, ' ' | '_' | '-' | '.')))
        {
            return Err(SyncError::Validation(format!(
                "label {:?} contains forbidden character {:?}",
                trimmed, bad
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Label {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Label> for String {
    fn from(label: Label) -> Self {
        label.0
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a persisted model, safe to use in URLs and file names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ModelId(String);

impl ModelId {
    pub fn parse(raw: &str) -> SyncResult<Self> {
        if !is_valid_model_id(raw) {
            return Err(SyncError::Validation(format!(
                "model id {:?} must contain only alphanumeric characters, hyphens, and underscores",
                raw
            )));
        }
        Ok(Self(raw.to_string()))
    }

    /// Id of the n-th slot of the catalog pool (1-based).
    pub fn pool_slot(slot: usize) -> Self {
        Self(format!("model-{}", slot))
    }

    /// The 1-based pool slot this id names, if it is a pool id.
    pub fn slot(&self) -> Option<usize> {
        self.0
            .strip_prefix("model-")
            .and_then(|n| n.parse::<usize>().ok())
            .filter(|n| *n > 0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

pub fn is_valid_model_id(raw: &str) -> bool {
    MODEL_ID_PATTERN.is_match(raw)
}

impl TryFrom<String> for ModelId {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ModelId> for String {
    fn from(id: ModelId) -> Self {
        id.0
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The vectors captured for one class.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassBucket {
    pub label: Label,
    pub vectors: Vec<EmbeddingVector>,
}

impl ClassBucket {
    pub fn new(label: Label) -> Self {
        Self {
            label,
            vectors: Vec::new(),
        }
    }

    pub fn example_count(&self) -> usize {
        self.vectors.len()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    dimension: usize,
    buckets: IndexMap<Label, ClassBucket>,
}

impl Dataset {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            buckets: IndexMap::new(),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Adds an empty class. Fails if the label is already present.
    pub fn add_class(&mut self, label: Label) -> SyncResult<()> {
        if self.buckets.contains_key(&label) {
            return Err(SyncError::AlreadyExists(format!("class {}", label)));
        }
        self.buckets.insert(label.clone(), ClassBucket::new(label));
        Ok(())
    }

    /// Appends a vector to a class, creating the class if needed.
    /// Returns the new example count of that class.
    pub fn push(&mut self, label: &Label, vector: EmbeddingVector) -> SyncResult<usize> {
        self.check_dimension(&vector)?;
        let bucket = self
            .buckets
            .entry(label.clone())
            .or_insert_with(|| ClassBucket::new(label.clone()));
        bucket.vectors.push(vector);
        Ok(bucket.example_count())
    }

    /// Inserts or replaces a whole class.
    pub fn insert_bucket(&mut self, label: Label, vectors: Vec<EmbeddingVector>) -> SyncResult<()> {
        for vector in &vectors {
            self.check_dimension(vector)?;
        }
        self.buckets
            .insert(label.clone(), ClassBucket { label, vectors });
        Ok(())
    }

    pub fn remove(&mut self, label: &Label) -> Option<ClassBucket> {
        self.buckets.shift_remove(label)
    }

    pub fn get(&self, label: &str) -> Option<&ClassBucket> {
        self.buckets.iter().find(|(l, _)| l.as_str() == label).map(|(_, b)| b)
    }

    pub fn contains(&self, label: &Label) -> bool {
        self.buckets.contains_key(label)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClassBucket> {
        self.buckets.values()
    }

    pub fn labels(&self) -> impl Iterator<Item = &Label> {
        self.buckets.keys()
    }

    /// Number of classes, including classes without examples.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn total_examples(&self) -> usize {
        self.buckets.values().map(ClassBucket::example_count).sum()
    }

    /// Number of classes that hold at least one example.
    pub fn trained_classes(&self) -> usize {
        self.buckets
            .values()
            .filter(|b| b.example_count() > 0)
            .count()
    }

    pub fn class_counts(&self) -> IndexMap<String, usize> {
        self.buckets
            .iter()
            .map(|(label, bucket)| (label.to_string(), bucket.example_count()))
            .collect()
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
    }

    fn check_dimension(&self, vector: &EmbeddingVector) -> SyncResult<()> {
        if vector.dimension() != self.dimension {
            return Err(SyncError::ShapeMismatch {
                expected: self.dimension,
                actual: vector.dimension(),
            });
        }
        Ok(())
    }
}
