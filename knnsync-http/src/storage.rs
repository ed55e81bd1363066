//! On-disk model store: `{modelId}.gz` plus a `{modelId}.meta.json` sidecar
//! per model, both in one flat data directory.

use chrono::Utc;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::models::ModelMetadata;

const DATA_EXTENSION: &str = "gz";
const META_EXTENSION: &str = "meta.json";

#[derive(Debug, Clone)]
pub struct ModelStorage {
    data_dir: PathBuf,
}

impl ModelStorage {
    pub fn new<P: Into<PathBuf>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Creates the data directory if it is missing.
    pub async fn ensure_data_dir(&self) -> io::Result<()> {
        fs::create_dir_all(&self.data_dir).await
    }

    fn data_path(&self, model_id: &str) -> PathBuf {
        self.data_dir
            .join(format!("{}.{}", model_id, DATA_EXTENSION))
    }

    fn meta_path(&self, model_id: &str) -> PathBuf {
        self.data_dir
            .join(format!("{}.{}", model_id, META_EXTENSION))
    }

    /// Writes the compressed artifact and its metadata sidecar.
    /// `model_id` must already be validated.
    pub async fn write(&self, model_id: &str, data: &[u8]) -> io::Result<ModelMetadata> {
        self.write_atomically(&self.data_path(model_id), data).await?;

        let metadata = ModelMetadata {
            model_id: model_id.to_string(),
            size_bytes: data.len(),
            uploaded_at: Utc::now(),
            content_encoding: "gzip".to_string(),
        };
        let json = serde_json::to_vec_pretty(&metadata)?;
        self.write_atomically(&self.meta_path(model_id), &json)
            .await?;
        Ok(metadata)
    }

    /// Reads the stored artifact, `None` if absent.
    /// Opens the artifact for streaming, with its length in bytes.
    pub async fn open(&self, model_id: &str) -> io::Result<Option<(fs::File, u64)>> {
        let file = match fs::File::open(self.data_path(model_id)).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let len = file.metadata().await?.len();
        Ok(Some((file, len)))
    }

    /// Reads the sidecar. A missing or unreadable sidecar yields `None`.
    pub async fn metadata(&self, model_id: &str) -> Option<ModelMetadata> {
        let content = fs::read(self.meta_path(model_id)).await.ok()?;
        match serde_json::from_slice(&content) {
            Ok(metadata) => Some(metadata),
            Err(e) => {
                warn!(model_id, error = %e, "Ignoring unreadable metadata sidecar");
                None
            }
        }
    }

    /// Removes the artifact and its sidecar. Returns `false` if the artifact
    /// did not exist.
    pub async fn delete(&self, model_id: &str) -> io::Result<bool> {
        match fs::remove_file(self.data_path(model_id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e),
        }
        if let Err(e) = fs::remove_file(self.meta_path(model_id)).await {
            debug!(model_id, error = %e, "No metadata sidecar removed");
        }
        Ok(true)
    }

    async fn write_atomically(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        let temp_file = NamedTempFile::new_in(&self.data_dir)?;
        let temp_path = temp_file.path().to_path_buf();

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(data).await?;
        file.flush().await?;

        fs::rename(&temp_path, path).await
    }
}
