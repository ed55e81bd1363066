use axum::{Router, extract::DefaultBodyLimit, middleware};
use secrecy::{ExposeSecret, SecretString};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::auth::api_key_middleware;
use crate::cors::{DEFAULT_ALLOWED_ORIGINS, cors_layer, origin_guard};
use crate::routes::create_api_router;
use crate::storage::ModelStorage;

pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host address to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Pre-shared key for uploads and deletes
    pub api_key: SecretString,

    /// Directory holding `{modelId}.gz` files
    pub data_dir: PathBuf,

    pub allowed_origins: Vec<String>,

    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            api_key: SecretString::new(Box::default()),
            data_dir: PathBuf::from("./data"),
            allowed_origins: DEFAULT_ALLOWED_ORIGINS
                .iter()
                .map(|o| o.to_string())
                .collect(),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("API_KEY is not set; refusing to start")]
    MissingApiKey,

    #[error("Failed to create data directory {path}: {source}")]
    DataDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid listen address: {0}")]
    Address(#[from] std::net::AddrParseError),

    #[error("Server IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone)]
pub struct AppState {
    pub storage: ModelStorage,
    pub api_key: Arc<SecretString>,
    pub allowed_origins: Arc<Vec<String>>,
    pub max_upload_bytes: usize,
}

impl AppState {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            storage: ModelStorage::new(config.data_dir.clone()),
            api_key: Arc::new(config.api_key.clone()),
            allowed_origins: Arc::new(config.allowed_origins.clone()),
            max_upload_bytes: config.max_upload_bytes,
        }
    }
}

/// Wires routes, middleware and state into a servable router.
pub fn create_app(state: AppState) -> Router {
    create_api_router()
        .layer(DefaultBodyLimit::max(state.max_upload_bytes))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            api_key_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&state.allowed_origins))
        .layer(middleware::from_fn_with_state(state.clone(), origin_guard))
        .with_state(state)
}

/// Checks the key and prepares the data directory. Both failures are fatal.
pub async fn prepare(config: &ServerConfig) -> Result<Router, ServerError> {
    if config.api_key.expose_secret().trim().is_empty() {
        error!("API_KEY environment variable is not set");
        return Err(ServerError::MissingApiKey);
    }

    let state = AppState::new(config);
    state
        .storage
        .ensure_data_dir()
        .await
        .map_err(|source| ServerError::DataDir {
            path: config.data_dir.clone(),
            source,
        })?;
    info!(data_dir = %config.data_dir.display(), "Data directory ready");

    Ok(create_app(state))
}

/// Start the HTTP server
pub async fn start_server(config: ServerConfig) -> Result<(), ServerError> {
    let app = prepare(&config).await?;

    let addr = format!("{}:{}", config.host, config.port).parse::<SocketAddr>()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(
        %addr,
        allowed_origins = %config.allowed_origins.join(", "),
        max_upload_bytes = config.max_upload_bytes,
        "Model storage server listening"
    );

    axum::serve(listener, app).await?;
    Ok(())
}
