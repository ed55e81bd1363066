//! Error handling for knnsync-http
//!
//! Every failure is rendered as `{ "error": ..., "message": ... }` JSON.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

/// Application error type
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Model ID must contain only alphanumeric characters, hyphens, and underscores")]
    InvalidModelId,

    #[error("Request body must contain model data")]
    EmptyBody,

    #[error("Model {0} does not exist")]
    ModelNotFound(String),

    #[error("X-API-Key header is required")]
    MissingApiKey,

    #[error("The provided API key is incorrect")]
    InvalidApiKey,

    #[error("Request body exceeds the {limit} byte limit")]
    PayloadTooLarge { limit: usize },

    #[error("Origin {0} is not allowed")]
    OriginNotAllowed(String),

    #[error("The requested endpoint does not exist")]
    RouteNotFound,

    #[error("{context}: {message}")]
    Internal { context: &'static str, message: String },
}

impl PartialEq<StatusCode> for AppError {
    fn eq(&self, status_code: &StatusCode) -> bool {
        &self.status() == status_code
    }
}

impl AppError {
    pub fn internal(context: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Internal {
            context,
            message: err.to_string(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidModelId | Self::EmptyBody => StatusCode::BAD_REQUEST,
            Self::ModelNotFound(_) | Self::RouteNotFound => StatusCode::NOT_FOUND,
            Self::MissingApiKey | Self::InvalidApiKey => StatusCode::UNAUTHORIZED,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::OriginNotAllowed(_) => StatusCode::FORBIDDEN,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short error title used in the `error` field.
    fn title(&self) -> &'static str {
        match self {
            Self::InvalidModelId => "Invalid model ID",
            Self::EmptyBody => "Empty request body",
            Self::ModelNotFound(_) => "Model not found",
            Self::MissingApiKey => "Missing API key",
            Self::InvalidApiKey => "Invalid API key",
            Self::PayloadTooLarge { .. } => "Payload too large",
            Self::OriginNotAllowed(_) => "Not allowed by CORS",
            Self::RouteNotFound => "Not found",
            Self::Internal { context, .. } => context,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            Self::Internal { message, .. } => message.clone(),
            other => other.to_string(),
        };
        if status.is_server_error() {
            tracing::error!(error = self.title(), message = %message, "Request failed");
        }

        let body = Json(json!({
            "error": self.title(),
            "message": message,
        }));

        (status, body).into_response()
    }
}
