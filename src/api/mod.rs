//! HTTP management API for agentvm.
//!
//! Exposes VM registration and the agent runtime controls: parking a VM for
//! an LLM wait, delivering the response into the guest, and inspecting
//! pending requests.
//!
//! # Example
//!
//! ```bash
//! # Start the server
//! agentvm serve --listen 127.0.0.1:8080
//!
//! # Park a VM while its agent waits for an LLM
//! curl -X PATCH http://localhost:8080/api/v1/vms/vm1/agent/runtime \
//!   -H "Content-Type: application/json" \
//!   -d '{"state": "LlmWaiting", "pause_on_wait": true, "target_balloon_mib": 128,
//!        "expect_request_id": "req-1", "resume_on_delivery": true}'
//!
//! # Hand the response back
//! curl -X PUT http://localhost:8080/api/v1/vms/vm1/agent/runtime/response \
//!   -H "Content-Type: application/json" \
//!   -d '{"request_id": "req-1", "response": "hello", "vsock_port": 11000}'
//! ```

pub mod error;
pub mod handlers;
pub mod state;
pub mod sweeper;
pub mod types;
pub mod validation;

use axum::{
    routing::{delete, get, put},
    Json, Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use utoipa::OpenApi;

use state::ApiState;

/// OpenAPI document for the management API.
#[derive(OpenApi)]
#[openapi(
    info(title = "agentvm API", description = "Agent runtime controller for Firecracker VMs"),
    paths(
        handlers::health::health,
        handlers::vms::register_vm,
        handlers::vms::list_vms,
        handlers::vms::get_vm,
        handlers::vms::delete_vm,
        handlers::runtime::set_runtime_state,
        handlers::runtime::get_runtime_state,
        handlers::runtime::submit_response,
        handlers::runtime::list_pending,
        handlers::runtime::cancel_pending,
        handlers::runtime::get_balloon,
    ),
    components(schemas(
        types::HealthResponse,
        types::ApiErrorResponse,
        types::RegisterVmRequest,
        types::VmInfo,
        types::ListVmsResponse,
        types::DeleteVmResponse,
        types::SetRuntimeStateRequest,
        types::RuntimeStateResponse,
        types::SubmitResponseRequest,
        types::SubmitResponseResponse,
        types::PendingRequestInfo,
        types::ListPendingResponse,
        types::BalloonResponse,
        crate::runtime::LifecycleState,
        crate::runtime::RuntimeTarget,
        crate::runtime::PendingPhase,
    )),
    tags(
        (name = "Health", description = "Server liveness"),
        (name = "VMs", description = "VM registration"),
        (name = "Runtime", description = "LLM wait parking and response delivery")
    )
)]
pub struct ApiDoc;

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// Create the API router with all endpoints.
pub fn create_router(state: Arc<ApiState>, request_timeout: Duration) -> Router {
    // Health check and API docs
    let meta_routes = Router::new()
        .route("/health", get(handlers::health::health))
        .route("/api-docs/openapi.json", get(openapi_json));

    // VM routes
    let vm_routes = Router::new()
        .route(
            "/",
            get(handlers::vms::list_vms).post(handlers::vms::register_vm),
        )
        .route(
            "/:id",
            get(handlers::vms::get_vm).delete(handlers::vms::delete_vm),
        )
        // Runtime routes
        .route(
            "/:id/agent/runtime",
            get(handlers::runtime::get_runtime_state).patch(handlers::runtime::set_runtime_state),
        )
        .route(
            "/:id/agent/runtime/response",
            put(handlers::runtime::submit_response),
        )
        .route(
            "/:id/agent/runtime/pending",
            get(handlers::runtime::list_pending),
        )
        .route(
            "/:id/agent/runtime/pending/:request_id",
            delete(handlers::runtime::cancel_pending),
        )
        .route("/:id/balloon", get(handlers::runtime::get_balloon));

    let api_v1 = Router::new().nest("/vms", vm_routes);

    Router::new()
        .merge(meta_routes)
        .nest("/api/v1", api_v1)
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
