//! Health check endpoint.

use axum::Json;

use crate::api::types::HealthResponse;

/// GET /health - Health check endpoint.
#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    responses(
        (status = 200, description = "Server is up", body = HealthResponse)
    )
)]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".into(),
        version: crate::VERSION.into(),
    })
}
