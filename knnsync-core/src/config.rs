//! Engine configuration.
//!
//! All sizes are in bytes, all durations serialize as integer milliseconds.
//! A configuration can be loaded from a JSON file; every field has a default
//! so a partial file is enough.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize, Serializer};
use std::{fs::File, io::BufReader, path::Path, time::Duration};

use crate::error::{SyncError, SyncResult};

/// Dimension of the embeddings produced by the feature extractor.
pub const DEFAULT_EMBEDDING_DIMENSION: usize = 1024;

const KIB: usize = 1024;
const MIB: usize = 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_embedding_dimension")]
    pub embedding_dimension: usize,

    #[serde(default)]
    pub chunking: ChunkingConfig,

    #[serde(default)]
    pub blob: BlobConfig,

    #[serde(default)]
    pub routing: RoutingConfig,

    #[serde(default)]
    pub catalog: CatalogConfig,

    #[serde(default)]
    pub autosave: AutosaveConfig,

    #[serde(default)]
    pub fallback: FallbackConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Raw bytes per chunk, before base64 expansion.
    #[serde(default = "default_chunk_size")]
    pub chunk_size_bytes: usize,

    /// Per-document ceiling enforced by the document store.
    #[serde(default = "default_max_document_bytes")]
    pub max_document_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobConfig {
    /// Base URL of the blob server, e.g. `https://models.example.com`.
    #[serde(default)]
    pub endpoint: String,

    #[serde(default = "empty_secret", serialize_with = "serialize_secret")]
    pub api_key: SecretString,

    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,

    #[serde(default = "default_request_timeout", with = "duration_ms")]
    pub request_timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Artifacts larger than this go to the blob backend when it is configured.
    #[serde(default = "default_external_threshold")]
    pub external_threshold_bytes: usize,

    #[serde(default)]
    pub force_external: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    #[serde(default = "default_max_name_len")]
    pub max_name_len: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutosaveConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_debounce", with = "duration_ms")]
    pub debounce: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    #[serde(default = "default_fallback_quota")]
    pub quota_bytes: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            embedding_dimension: default_embedding_dimension(),
            chunking: ChunkingConfig::default(),
            blob: BlobConfig::default(),
            routing: RoutingConfig::default(),
            catalog: CatalogConfig::default(),
            autosave: AutosaveConfig::default(),
            fallback: FallbackConfig::default(),
        }
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size_bytes: default_chunk_size(),
            max_document_bytes: default_max_document_bytes(),
        }
    }
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: empty_secret(),
            max_upload_bytes: default_max_upload_bytes(),
            request_timeout: default_request_timeout(),
        }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            external_threshold_bytes: default_external_threshold(),
            force_external: false,
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            max_name_len: default_max_name_len(),
        }
    }
}

impl Default for AutosaveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce: default_debounce(),
        }
    }
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            quota_bytes: default_fallback_quota(),
        }
    }
}

impl BlobConfig {
    pub fn new(endpoint: &str, api_key: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            api_key: SecretString::new(Box::from(api_key)),
            ..Default::default()
        }
    }

    /// The blob backend is only used when both endpoint and key are set.
    pub fn is_configured(&self) -> bool {
        !self.endpoint.trim().is_empty() && !self.api_key.expose_secret().is_empty()
    }
}

impl SyncConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> SyncResult<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            SyncError::Storage(format!("Failed to open config {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_reader(BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_str(s: &str) -> SyncResult<Self> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values
    ///
    /// # Validation Rules
    ///
    /// - embedding_dimension must be positive
    /// - chunk_size_bytes must be positive and its base64 expansion plus
    ///   envelope must fit in max_document_bytes
    /// - pool_size must be positive
    pub fn validate(&self) -> SyncResult<()> {
        if self.embedding_dimension == 0 {
            return Err(SyncError::Validation(
                "embedding_dimension must be greater than 0".to_string(),
            ));
        }
        if self.chunking.chunk_size_bytes == 0 {
            return Err(SyncError::Validation(
                "chunk_size_bytes must be greater than 0".to_string(),
            ));
        }
        let encoded = crate::chunked::encoded_chunk_len(self.chunking.chunk_size_bytes);
        if encoded + crate::chunked::CHUNK_ENVELOPE_BYTES > self.chunking.max_document_bytes {
            return Err(SyncError::Validation(format!(
                "chunk_size_bytes {} expands to {} bytes, over the {} byte document ceiling",
                self.chunking.chunk_size_bytes, encoded, self.chunking.max_document_bytes
            )));
        }
        if self.catalog.pool_size == 0 {
            return Err(SyncError::Validation(
                "pool_size must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

fn serialize_secret<S>(secret: &SecretString, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(secret.expose_secret())
}

fn empty_secret() -> SecretString {
    SecretString::new(Box::default())
}

fn default_embedding_dimension() -> usize {
    DEFAULT_EMBEDDING_DIMENSION
}

fn default_chunk_size() -> usize {
    500 * KIB
}

fn default_max_document_bytes() -> usize {
    MIB
}

fn default_max_upload_bytes() -> usize {
    50 * MIB
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_external_threshold() -> usize {
    800 * KIB
}

fn default_pool_size() -> usize {
    10
}

fn default_max_name_len() -> usize {
    50
}

fn default_true() -> bool {
    true
}

fn default_debounce() -> Duration {
    Duration::from_millis(2000)
}

fn default_fallback_quota() -> usize {
    5 * MIB
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.embedding_dimension, 1024);
        assert_eq!(config.chunking.chunk_size_bytes, 500 * 1024);
        assert_eq!(config.chunking.max_document_bytes, 1024 * 1024);
        assert_eq!(config.routing.external_threshold_bytes, 800 * 1024);
        assert_eq!(config.blob.max_upload_bytes, 50 * 1024 * 1024);
        assert_eq!(config.catalog.pool_size, 10);
        assert_eq!(config.autosave.debounce, Duration::from_millis(2000));
        assert!(!config.blob.is_configured());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = SyncConfig::from_str(
            r#"{"blob": {"endpoint": "http://localhost:3000", "api_key": "k"}, "autosave": {"debounce": 250}}"#,
        )
        .unwrap();
        assert!(config.blob.is_configured());
        assert_eq!(config.autosave.debounce, Duration::from_millis(250));
        assert!(config.autosave.enabled);
        assert_eq!(config.chunking.chunk_size_bytes, 500 * 1024);
    }

    #[test]
    fn test_serde_roundtrip_keeps_key() {
        let mut config = SyncConfig::default();
        config.blob = BlobConfig::new("http://blob", "secret-key");
        let json = serde_json::to_string(&config).unwrap();
        let parsed = SyncConfig::from_str(&json).unwrap();
        assert_eq!(parsed.blob.api_key.expose_secret(), "secret-key");
        assert_eq!(parsed.blob.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_blob_needs_endpoint_and_key() {
        assert!(!BlobConfig::new("", "key").is_configured());
        assert!(!BlobConfig::new("http://blob", "").is_configured());
        assert!(BlobConfig::new("http://blob", "key").is_configured());
    }

    #[test]
    fn test_validate_rejects_oversized_chunks() {
        let mut config = SyncConfig::default();
        config.chunking.chunk_size_bytes = 900 * 1024;
        assert!(matches!(config.validate(), Err(SyncError::Validation(_))));

        config.chunking.chunk_size_bytes = 0;
        assert!(matches!(config.validate(), Err(SyncError::Validation(_))));
    }

    #[test]
    fn test_validate_rejects_zero_dimension_and_pool() {
        let mut config = SyncConfig::default();
        config.embedding_dimension = 0;
        assert!(config.validate().is_err());

        let mut config = SyncConfig::default();
        config.catalog.pool_size = 0;
        assert!(config.validate().is_err());
    }
}
