//! VM registration handlers.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;

use crate::api::error::ApiError;
use crate::api::state::ApiState;
use crate::api::types::{
    ApiErrorResponse, DeleteVmResponse, ListVmsResponse, RegisterVmRequest, VmInfo,
};
use crate::api::validation::validate_register;
use crate::config::VmSpec;

/// Register a Firecracker VM.
#[utoipa::path(
    post,
    path = "/api/v1/vms",
    tag = "VMs",
    request_body = RegisterVmRequest,
    responses(
        (status = 201, description = "VM registered", body = VmInfo),
        (status = 400, description = "Invalid request", body = ApiErrorResponse),
        (status = 409, description = "VM already exists", body = ApiErrorResponse),
        (status = 500, description = "Balloon baseline could not be read", body = ApiErrorResponse)
    )
)]
pub async fn register_vm(
    State(state): State<Arc<ApiState>>,
    payload: Result<Json<RegisterVmRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<VmInfo>), ApiError> {
    let Json(req) = payload?;
    validate_register(&req)?;

    let spec = VmSpec::from(&req);
    state.register_firecracker(&spec).await?;

    let summary = state.supervisor().summary(&req.name).await?;
    Ok((StatusCode::CREATED, Json(summary.into())))
}

/// List registered VMs.
#[utoipa::path(
    get,
    path = "/api/v1/vms",
    tag = "VMs",
    responses(
        (status = 200, description = "Registered VMs", body = ListVmsResponse)
    )
)]
pub async fn list_vms(State(state): State<Arc<ApiState>>) -> Json<ListVmsResponse> {
    let vms = state
        .supervisor()
        .summaries()
        .await
        .into_iter()
        .map(VmInfo::from)
        .collect();
    Json(ListVmsResponse { vms })
}

/// Get a VM.
#[utoipa::path(
    get,
    path = "/api/v1/vms/{id}",
    tag = "VMs",
    params(
        ("id" = String, Path, description = "VM id")
    ),
    responses(
        (status = 200, description = "VM details", body = VmInfo),
        (status = 404, description = "VM not found", body = ApiErrorResponse)
    )
)]
pub async fn get_vm(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<VmInfo>, ApiError> {
    let summary = state.supervisor().summary(&id).await?;
    Ok(Json(summary.into()))
}

/// Remove a VM from runtime control.
///
/// The VM process is left alone; its pending requests are dropped.
#[utoipa::path(
    delete,
    path = "/api/v1/vms/{id}",
    tag = "VMs",
    params(
        ("id" = String, Path, description = "VM id")
    ),
    responses(
        (status = 200, description = "VM removed", body = DeleteVmResponse),
        (status = 404, description = "VM not found", body = ApiErrorResponse)
    )
)]
pub async fn delete_vm(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<DeleteVmResponse>, ApiError> {
    let dropped_requests = state.supervisor().deregister(&id)?;
    Ok(Json(DeleteVmResponse {
        deleted: id,
        dropped_requests,
    }))
}
