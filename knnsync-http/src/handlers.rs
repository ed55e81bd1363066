use axum::{
    Json,
    body::{Body, Bytes},
    extract::{Path, State, rejection::BytesRejection},
    http::{StatusCode, header},
    response::IntoResponse,
};
use chrono::Utc;
use knnsync_core::dataset::is_valid_model_id;
use tokio_util::io::ReaderStream;
use tracing::info;

use crate::error::AppError;
use crate::models::{DeleteResponse, ErrorResponse, HealthResponse, UploadResponse};
use crate::server::AppState;

const MIB: f64 = 1024.0 * 1024.0;

fn validate_model_id(model_id: &str) -> Result<(), AppError> {
    if is_valid_model_id(model_id) {
        Ok(())
    } else {
        Err(AppError::InvalidModelId)
    }
}

/// Store a model artifact
///
/// The body is the gzip-compressed artifact. An existing artifact for the
/// same id is replaced.
#[utoipa::path(
    post,
    path = "/api/models/{model_id}",
    params(("model_id" = String, Path, description = "Model id, `[a-zA-Z0-9_-]+`")),
    request_body(content = Vec<u8>, content_type = "application/octet-stream"),
    responses(
        (status = 200, description = "Artifact stored", body = UploadResponse),
        (status = 400, description = "Invalid id or empty body", body = ErrorResponse),
        (status = 401, description = "Missing or invalid API key", body = ErrorResponse),
        (status = 413, description = "Body over the upload limit", body = ErrorResponse)
    ),
    tag = "models"
)]
#[axum::debug_handler]
pub async fn upload_model(
    State(state): State<AppState>,
    Path(model_id): Path<String>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<UploadResponse>, AppError> {
    validate_model_id(&model_id)?;
    let body = body.map_err(|rejection| {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            AppError::PayloadTooLarge {
                limit: state.max_upload_bytes,
            }
        } else {
            AppError::internal("Upload failed", rejection.body_text())
        }
    })?;
    if body.is_empty() {
        return Err(AppError::EmptyBody);
    }

    let size_mb = body.len() as f64 / MIB;
    info!(model_id = %model_id, bytes = body.len(), "Saving model ({:.2} MB)", size_mb);
    let metadata = state
        .storage
        .write(&model_id, &body)
        .await
        .map_err(|e| AppError::internal("Upload failed", e))?;
    info!(model_id = %model_id, "Model saved");

    Ok(Json(UploadResponse {
        success: true,
        model_id,
        size_bytes: metadata.size_bytes,
        message: format!("Model uploaded successfully ({:.2} MB)", size_mb),
    }))
}

/// Fetch a model artifact
///
/// Returns the stored bytes unchanged with `Content-Encoding: gzip`.
#[utoipa::path(
    get,
    path = "/api/models/{model_id}",
    params(("model_id" = String, Path, description = "Model id")),
    responses(
        (status = 200, description = "Compressed artifact", body = Vec<u8>, content_type = "application/octet-stream"),
        (status = 400, description = "Invalid id", body = ErrorResponse),
        (status = 404, description = "No artifact stored", body = ErrorResponse)
    ),
    tag = "models"
)]
pub async fn download_model(
    State(state): State<AppState>,
    Path(model_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    validate_model_id(&model_id)?;
    let (file, len) = state
        .storage
        .open(&model_id)
        .await
        .map_err(|e| AppError::internal("Download failed", e))?
        .ok_or_else(|| AppError::ModelNotFound(model_id.clone()))?;

    info!(model_id = %model_id, bytes = len, "Serving model");
    let headers = [
        (header::CONTENT_TYPE, "application/octet-stream".to_string()),
        (header::CONTENT_ENCODING, "gzip".to_string()),
        (header::CONTENT_LENGTH, len.to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}.gz\"", model_id),
        ),
    ];
    Ok((headers, Body::from_stream(ReaderStream::new(file))))
}

/// Delete a model artifact
///
/// An absent artifact is a 404, not a success.
#[utoipa::path(
    delete,
    path = "/api/models/{model_id}",
    params(("model_id" = String, Path, description = "Model id")),
    responses(
        (status = 200, description = "Artifact removed", body = DeleteResponse),
        (status = 400, description = "Invalid id", body = ErrorResponse),
        (status = 401, description = "Missing or invalid API key", body = ErrorResponse),
        (status = 404, description = "No artifact stored", body = ErrorResponse)
    ),
    tag = "models"
)]
pub async fn delete_model(
    State(state): State<AppState>,
    Path(model_id): Path<String>,
) -> Result<Json<DeleteResponse>, AppError> {
    validate_model_id(&model_id)?;
    let removed = state
        .storage
        .delete(&model_id)
        .await
        .map_err(|e| AppError::internal("Delete failed", e))?;
    if !removed {
        return Err(AppError::ModelNotFound(model_id));
    }

    info!(model_id = %model_id, "Model deleted");
    Ok(Json(DeleteResponse {
        success: true,
        model_id,
        message: "Model deleted successfully".to_string(),
    }))
}

/// Health check endpoint for container health monitoring
#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Server is up", body = HealthResponse)),
    tag = "health"
)]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        timestamp: Utc::now(),
        data_dir: state.storage.data_dir().display().to_string(),
    })
}

pub async fn not_found() -> AppError {
    AppError::RouteNotFound
}
