//! The live embedding store owned by a session.
//!
//! Wraps a [`Dataset`] with a consistency state. A vector whose dimension
//! disagrees with the store moves it to `Corrupted`; [`EmbeddingStore::reset`]
//! is the only way back to `Consistent`. Capture performs that reset once,
//! recreating the store with the new dimension, so capturing can go on.

use indexmap::IndexMap;
use tracing::{debug, warn};

use crate::dataset::{ClassBucket, Dataset, EmbeddingVector, Label};
use crate::error::{SyncError, SyncResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreState {
    Consistent,
    Corrupted(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureOutcome {
    /// Examples held by the class after the capture.
    pub example_count: usize,
    /// Whether the store was cleared and recreated to accept the vector.
    pub reset: bool,
}

/// A raw image handed to the feature extractor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl Frame {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Self {
        Self {
            width,
            height,
            pixels,
        }
    }
}

/// External feature extraction capability.
#[cfg_attr(test, mockall::automock)]
pub trait Embedder: Send + Sync {
    fn embed(&self, frame: &Frame) -> SyncResult<EmbeddingVector>;
}

/// A class whose recorded example count disagreed with the live count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountMismatch {
    pub label: String,
    pub recorded: usize,
    pub live: usize,
}

#[derive(Debug, Clone)]
pub struct EmbeddingStore {
    dataset: Dataset,
    state: StoreState,
}

impl EmbeddingStore {
    pub fn new(dimension: usize) -> Self {
        Self {
            dataset: Dataset::new(dimension),
            state: StoreState::Consistent,
        }
    }

    pub fn state(&self) -> &StoreState {
        &self.state
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    pub fn dimension(&self) -> usize {
        self.dataset.dimension()
    }

    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }

    /// Copy of the current dataset. Vectors are shared, not duplicated.
    pub fn snapshot(&self) -> Dataset {
        self.dataset.clone()
    }

    pub fn add_class(&mut self, label: Label) -> SyncResult<()> {
        self.dataset.add_class(label)
    }

    pub fn delete_class(&mut self, label: &Label) -> SyncResult<ClassBucket> {
        self.dataset
            .remove(label)
            .ok_or_else(|| SyncError::NotFound(format!("class {}", label)))
    }

    /// Appends a vector. A dimension mismatch triggers the one-time reset.
    pub fn capture(&mut self, label: &Label, vector: EmbeddingVector) -> SyncResult<CaptureOutcome> {
        let mut reset = false;
        if let StoreState::Corrupted(reason) = &self.state {
            warn!(reason = %reason, "Capturing into a corrupted store, resetting it first");
            self.reset_with_dimension(vector.dimension());
            reset = true;
        }

        match self.dataset.push(label, vector.clone()) {
            Ok(example_count) => Ok(CaptureOutcome {
                example_count,
                reset,
            }),
            Err(SyncError::ShapeMismatch { expected, actual }) => {
                self.mark_corrupted(format!(
                    "captured vector has dimension {}, store expects {}",
                    actual, expected
                ));
                warn!(
                    expected,
                    actual,
                    classes = self.dataset.len(),
                    "Dimension changed during capture, clearing and recreating the store"
                );
                self.reset_with_dimension(actual);
                let example_count = self.dataset.push(label, vector)?;
                Ok(CaptureOutcome {
                    example_count,
                    reset: true,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Embeds a frame and captures the result. The frame is released as
    /// soon as the embedding is produced, whether or not embedding succeeds.
    pub fn capture_frame(
        &mut self,
        label: &Label,
        frame: Frame,
        embedder: &dyn Embedder,
    ) -> SyncResult<CaptureOutcome> {
        let vector = {
            let frame = frame;
            embedder.embed(&frame)
        }?;
        self.capture(label, vector)
    }

    /// Replaces the whole dataset, e.g. after a load.
    pub fn replace(&mut self, dataset: Dataset) {
        self.dataset = dataset;
        self.state = StoreState::Consistent;
    }

    /// Removes every class, keeping the dimension.
    pub fn clear(&mut self) {
        self.dataset.clear();
    }

    pub fn mark_corrupted(&mut self, reason: String) {
        self.state = StoreState::Corrupted(reason);
    }

    /// Clears the store and returns it to `Consistent`.
    pub fn reset(&mut self) {
        let dimension = self.dataset.dimension();
        self.reset_with_dimension(dimension);
    }

    fn reset_with_dimension(&mut self, dimension: usize) {
        self.dataset = Dataset::new(dimension);
        self.state = StoreState::Consistent;
    }

    /// Compares counts recorded in a loaded artifact with the live counts.
    /// The live count wins; every disagreement is logged and returned.
    pub fn reconcile(&self, recorded: &IndexMap<String, usize>) -> Vec<CountMismatch> {
        let mut mismatches = Vec::new();
        for (label, recorded) in recorded {
            let live = self
                .dataset
                .get(label)
                .map(ClassBucket::example_count)
                .unwrap_or(0);
            if live != *recorded {
                warn!(label = %label, recorded, live, "Example count disagrees with stored record");
                mismatches.push(CountMismatch {
                    label: label.clone(),
                    recorded: *recorded,
                    live,
                });
            }
        }
        debug!(mismatches = mismatches.len(), "Reconciled example counts");
        mismatches
    }
}
