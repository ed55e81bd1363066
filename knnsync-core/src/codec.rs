//! Serialization codec for classifier datasets.
//!
//! A dataset is serialized into an [`Artifact`]: a self-describing JSON
//! document holding, per class, its shape `[count, dimension]` and the
//! flattened vectors as base64 of little-endian `f32` bytes. Decoding follows
//! a partial-success policy: a corrupt class is skipped with a warning, the
//! rest of the dataset is still recovered. Only a dimension disagreement with
//! the live model aborts the whole decode.
//!
//! Compression is a separate whole-artifact transform used by the blob
//! backend.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use tracing::warn;

use crate::dataset::{Dataset, EmbeddingVector, Label};
use crate::error::{SyncError, SyncResult};

/// Format tag written into every artifact.
pub const ARTIFACT_FORMAT: &str = "knnsync.dataset/v1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub format: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub dimension: usize,
    pub classes: Vec<ArtifactClass>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactClass {
    pub label: String,
    /// `[example count, dimension]`
    pub shape: [usize; 2],
    /// base64 of the flattened little-endian `f32` payload
    pub data: String,
}

/// A class that could not be restored.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeWarning {
    pub label: String,
    pub reason: String,
}

impl fmt::Display for DecodeWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "class {:?} skipped: {}", self.label, self.reason)
    }
}

#[derive(Debug, Clone)]
pub struct DecodedDataset {
    pub dataset: Dataset,
    pub warnings: Vec<DecodeWarning>,
    /// Example counts as declared by the artifact, including skipped classes.
    pub advisory_counts: IndexMap<String, usize>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Artifact {
    pub fn from_dataset(
        dataset: &Dataset,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        let dimension = dataset.dimension();
        let classes = dataset
            .iter()
            .map(|bucket| {
                let mut flat = Vec::with_capacity(bucket.example_count() * dimension);
                for vector in &bucket.vectors {
                    flat.extend_from_slice(vector.as_slice());
                }
                ArtifactClass {
                    label: bucket.label.to_string(),
                    shape: [bucket.example_count(), dimension],
                    data: encode_floats(&flat),
                }
            })
            .collect();

        Self {
            format: ARTIFACT_FORMAT.to_string(),
            created_at,
            updated_at,
            dimension,
            classes,
        }
    }

    pub fn to_bytes(&self) -> SyncResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> SyncResult<Self> {
        let artifact: Self = serde_json::from_slice(bytes)
            .map_err(|e| SyncError::Serialization(format!("Failed to parse artifact: {}", e)))?;
        if artifact.format != ARTIFACT_FORMAT {
            return Err(SyncError::Serialization(format!(
                "Unsupported artifact format {:?}",
                artifact.format
            )));
        }
        Ok(artifact)
    }

    /// Rebuilds a dataset, skipping corrupt classes.
    pub fn into_dataset(self, expected_dimension: usize) -> SyncResult<DecodedDataset> {
        if expected_dimension == 0 {
            return Err(SyncError::Validation(
                "embedding dimension must be positive".to_string(),
            ));
        }
        if self.dimension != expected_dimension {
            return Err(SyncError::ShapeMismatch {
                expected: expected_dimension,
                actual: self.dimension,
            });
        }

        let mut dataset = Dataset::new(expected_dimension);
        let mut warnings = Vec::new();
        let mut seen = HashSet::new();
        let mut advisory_counts = IndexMap::new();

        for class in self.classes {
            advisory_counts.insert(class.label.clone(), class.shape[0]);
            if class.shape[1] != expected_dimension {
                return Err(SyncError::ShapeMismatch {
                    expected: expected_dimension,
                    actual: class.shape[1],
                });
            }
            match restore_class(&class, expected_dimension) {
                Ok((label, vectors)) => {
                    if !seen.insert(label.clone()) {
                        warnings.push(skip(&class.label, "duplicate label".to_string()));
                        continue;
                    }
                    dataset.insert_bucket(label, vectors)?;
                }
                Err(reason) => warnings.push(skip(&class.label, reason)),
            }
        }

        Ok(DecodedDataset {
            dataset,
            warnings,
            advisory_counts,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Serializes a dataset; both timestamps are set to `now`.
pub fn encode(dataset: &Dataset, now: DateTime<Utc>) -> SyncResult<Vec<u8>> {
    Artifact::from_dataset(dataset, now, now).to_bytes()
}

pub fn decode(bytes: &[u8], expected_dimension: usize) -> SyncResult<DecodedDataset> {
    Artifact::from_bytes(bytes)?.into_dataset(expected_dimension)
}

fn restore_class(
    class: &ArtifactClass,
    dimension: usize,
) -> Result<(Label, Vec<EmbeddingVector>), String> {
    let label = Label::parse(&class.label).map_err(|e| e.to_string())?;
    let floats = decode_floats(&class.data)?;
    if floats.len() % dimension != 0 {
        return Err(format!(
            "payload length {} is not a multiple of dimension {}",
            floats.len(),
            dimension
        ));
    }
    let count = floats.len() / dimension;
    if count != class.shape[0] {
        return Err(format!(
            "declared {} examples but payload holds {}",
            class.shape[0], count
        ));
    }
    let vectors = floats
        .chunks_exact(dimension)
        .map(|v| EmbeddingVector::new(v.to_vec()))
        .collect();
    Ok((label, vectors))
}

fn skip(label: &str, reason: String) -> DecodeWarning {
    let warning = DecodeWarning {
        label: label.to_string(),
        reason,
    };
    warn!(label = %warning.label, reason = %warning.reason, "Skipping class while decoding artifact");
    warning
}

pub fn encode_floats(values: &[f32]) -> String {
    let mut buf = Vec::with_capacity(values.len() * 4);
    for value in values {
        buf.extend_from_slice(&value.to_le_bytes());
    }
    STANDARD.encode(buf)
}

pub fn decode_floats(data: &str) -> Result<Vec<f32>, String> {
    let bytes = STANDARD
        .decode(data)
        .map_err(|e| format!("payload is not valid base64: {}", e))?;
    if bytes.len() % 4 != 0 {
        return Err(format!(
            "payload byte length {} is not a multiple of 4",
            bytes.len()
        ));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

/// Gzip-compresses a whole encoded artifact.
#[cfg(feature = "gzip")]
pub fn compress(data: &[u8]) -> SyncResult<Vec<u8>> {
    use flate2::{Compression, write::GzEncoder};
    use std::io::Write;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| SyncError::Serialization(format!("Failed to compress data: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| SyncError::Serialization(format!("Failed to finish compression: {}", e)))
}

#[cfg(feature = "gzip")]
pub fn decompress(data: &[u8]) -> SyncResult<Vec<u8>> {
    use flate2::read::GzDecoder;
    use std::io::Read;

    let mut decoder = GzDecoder::new(data);
    let mut decompressed = Vec::new();
    decoder
        .read_to_end(&mut decompressed)
        .map_err(|e| SyncError::Serialization(format!("Failed to decompress data: {}", e)))?;
    Ok(decompressed)
}

#[cfg(not(feature = "gzip"))]
pub fn compress(_data: &[u8]) -> SyncResult<Vec<u8>> {
    Err(SyncError::CompressionUnavailable(
        "built without the gzip feature".to_string(),
    ))
}

#[cfg(not(feature = "gzip"))]
pub fn decompress(_data: &[u8]) -> SyncResult<Vec<u8>> {
    Err(SyncError::CompressionUnavailable(
        "built without the gzip feature".to_string(),
    ))
}
