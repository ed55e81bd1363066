use knnsync_core::docstore::LocalFsDocumentStore;
use knnsync_core::{ModelSync, SyncConfig};
use secrecy::{ExposeSecret, SecretString};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

use crate::error::CliResult;

/// Where the CLI reads its settings from.
/// Supported sources(in order of precedence):
/// - CLI arguments(by clap)
/// - Environment variables(by clap)
/// - Dot-env file(by clap and dotenv)
/// - `--config` JSON file
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub config_file: Option<PathBuf>,
    pub store_dir: PathBuf,
    pub endpoint: Option<String>,
    pub api_key: Option<SecretString>,
}

impl Settings {
    /// Loads the config file if given and applies the blob overrides.
    pub fn resolve(&self) -> CliResult<SyncConfig> {
        let mut config = match &self.config_file {
            Some(path) => {
                debug!(path = %path.display(), "Loading config file");
                SyncConfig::from_file(path)?
            }
            None => SyncConfig::default(),
        };
        if let Some(endpoint) = &self.endpoint {
            config.blob.endpoint = endpoint.clone();
        }
        if let Some(api_key) = &self.api_key {
            config.blob.api_key = api_key.clone();
        }
        config.validate()?;
        Ok(config)
    }

    /// Opens the sync stack over the local document store.
    pub fn open(&self) -> CliResult<ModelSync> {
        let config = self.resolve()?;
        let documents = LocalFsDocumentStore::new(
            self.store_dir.clone(),
            config.chunking.max_document_bytes,
        );
        Ok(ModelSync::from_config(config, Arc::new(documents), None)?)
    }
}

/// Masks all but the last 4 characters.
pub fn partial_show_secret(s: &SecretString) -> String {
    let chars = s.expose_secret().chars();
    if chars.clone().count() <= 4 {
        "**************************".to_string()
    } else {
        let last_4 = chars.rev().take(4).collect::<String>();
        format!(
            "**********************{}",
            last_4.chars().rev().collect::<String>()
        )
    }
}
