use axum::{
    extract::{Request, State},
    http::Method,
    middleware::Next,
    response::Response,
};
use secrecy::ExposeSecret;
use tracing::warn;

use crate::error::AppError;
use crate::server::AppState;

pub use knnsync_core::blob::API_KEY_HEADER;

/// Axum middleware for API key authentication on mutating model routes
pub async fn api_key_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    if !requires_api_key(request.method(), request.uri().path()) {
        return Ok(next.run(request).await);
    }

    let api_key = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or(AppError::MissingApiKey)?;

    if api_key != state.api_key.expose_secret() {
        warn!(path = %request.uri().path(), "Invalid API key attempt");
        return Err(AppError::InvalidApiKey);
    }

    Ok(next.run(request).await)
}

/// Uploads and deletes need a key; reads are public.
pub fn requires_api_key(method: &Method, path: &str) -> bool {
    is_models_path(path) && (method == Method::POST || method == Method::DELETE)
}

pub fn is_models_path(path: &str) -> bool {
    path.starts_with("/api/models/")
}
