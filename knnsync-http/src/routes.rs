use axum::{Router, routing::get};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::handlers;
use crate::models::{DeleteResponse, ErrorResponse, HealthResponse, ModelMetadata, UploadResponse};
use crate::server::AppState;

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::upload_model,
        handlers::download_model,
        handlers::delete_model,
        handlers::health_check
    ),
    components(schemas(
        UploadResponse,
        DeleteResponse,
        HealthResponse,
        ErrorResponse,
        ModelMetadata
    )),
    tags(
        (name = "models", description = "Compressed model artifacts"),
        (name = "health", description = "Liveness")
    )
)]
pub struct ApiDoc;

/// Create the main API router with state
pub fn create_api_router() -> Router<AppState> {
    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route("/health", get(handlers::health_check))
        .route(
            "/api/models/{model_id}",
            get(handlers::download_model)
                .post(handlers::upload_model)
                .delete(handlers::delete_model),
        )
        .fallback(handlers::not_found)
}
