//! Agent runtime handlers.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    Json,
};
use std::sync::Arc;

use agentvm_protocol::ports;

use crate::api::error::ApiError;
use crate::api::state::ApiState;
use crate::api::types::{
    ApiErrorResponse, BalloonResponse, ListPendingResponse, PendingRequestInfo,
    RuntimeStateResponse, SetRuntimeStateRequest, SubmitResponseRequest, SubmitResponseResponse,
};
use crate::api::validation::{state_options, validate_request_id, validate_submission};
use crate::runtime::ResponseSubmission;

/// Change a VM's runtime state.
#[utoipa::path(
    patch,
    path = "/api/v1/vms/{id}/agent/runtime",
    tag = "Runtime",
    params(
        ("id" = String, Path, description = "VM id")
    ),
    request_body = SetRuntimeStateRequest,
    responses(
        (status = 200, description = "State settled", body = RuntimeStateResponse),
        (status = 400, description = "Invalid transition or request", body = ApiErrorResponse),
        (status = 404, description = "VM not found", body = ApiErrorResponse),
        (status = 409, description = "Duplicate expectation or superseded", body = ApiErrorResponse),
        (status = 500, description = "Side effect failed, state rolled back", body = ApiErrorResponse),
        (status = 502, description = "Guest failed to quiesce", body = ApiErrorResponse),
        (status = 504, description = "Guest quiescence timed out", body = ApiErrorResponse)
    )
)]
pub async fn set_runtime_state(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    payload: Result<Json<SetRuntimeStateRequest>, JsonRejection>,
) -> Result<Json<RuntimeStateResponse>, ApiError> {
    let Json(req) = payload?;
    let options = state_options(&req, ports::LLM_RESPONSE)?;

    let settled = state.supervisor().set_state(&id, req.state, options).await?;
    Ok(Json(settled.into()))
}

/// Get a VM's settled runtime state.
#[utoipa::path(
    get,
    path = "/api/v1/vms/{id}/agent/runtime",
    tag = "Runtime",
    params(
        ("id" = String, Path, description = "VM id")
    ),
    responses(
        (status = 200, description = "Settled state", body = RuntimeStateResponse),
        (status = 404, description = "VM not found", body = ApiErrorResponse)
    )
)]
pub async fn get_runtime_state(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<RuntimeStateResponse>, ApiError> {
    let settled = state.supervisor().runtime_state(&id).await?;
    Ok(Json(settled.into()))
}

/// Deliver an LLM response into the guest.
#[utoipa::path(
    put,
    path = "/api/v1/vms/{id}/agent/runtime/response",
    tag = "Runtime",
    params(
        ("id" = String, Path, description = "VM id")
    ),
    request_body = SubmitResponseRequest,
    responses(
        (status = 200, description = "Response delivered", body = SubmitResponseResponse),
        (status = 400, description = "Invalid request", body = ApiErrorResponse),
        (status = 404, description = "VM not found", body = ApiErrorResponse),
        (status = 409, description = "Request already being delivered", body = ApiErrorResponse),
        (status = 500, description = "Delivered, but resuming the VM failed", body = ApiErrorResponse),
        (status = 502, description = "Guest listener unreachable", body = ApiErrorResponse)
    )
)]
pub async fn submit_response(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    payload: Result<Json<SubmitResponseRequest>, JsonRejection>,
) -> Result<Json<SubmitResponseResponse>, ApiError> {
    let Json(req) = payload?;
    validate_submission(&req)?;

    let report = state
        .supervisor()
        .submit_response(
            &id,
            ResponseSubmission {
                request_id: req.request_id,
                response: req.response,
                vsock_port: req.vsock_port,
                resume_vm: req.resume_vm,
            },
        )
        .await?;
    Ok(Json(report.into()))
}

/// List a VM's pending requests.
#[utoipa::path(
    get,
    path = "/api/v1/vms/{id}/agent/runtime/pending",
    tag = "Runtime",
    params(
        ("id" = String, Path, description = "VM id")
    ),
    responses(
        (status = 200, description = "Pending requests", body = ListPendingResponse),
        (status = 404, description = "VM not found", body = ApiErrorResponse)
    )
)]
pub async fn list_pending(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<ListPendingResponse>, ApiError> {
    let requests = state
        .supervisor()
        .list_pending(&id)?
        .into_iter()
        .map(PendingRequestInfo::from)
        .collect();
    Ok(Json(ListPendingResponse { requests }))
}

/// Cancel an expected request.
#[utoipa::path(
    delete,
    path = "/api/v1/vms/{id}/agent/runtime/pending/{request_id}",
    tag = "Runtime",
    params(
        ("id" = String, Path, description = "VM id"),
        ("request_id" = String, Path, description = "Request id")
    ),
    responses(
        (status = 200, description = "Request cancelled", body = PendingRequestInfo),
        (status = 400, description = "Request is being delivered", body = ApiErrorResponse),
        (status = 404, description = "VM or request not found", body = ApiErrorResponse)
    )
)]
pub async fn cancel_pending(
    State(state): State<Arc<ApiState>>,
    Path((id, request_id)): Path<(String, String)>,
) -> Result<Json<PendingRequestInfo>, ApiError> {
    validate_request_id(&request_id)?;
    let request = state.supervisor().cancel_pending(&id, &request_id)?;
    Ok(Json(request.into()))
}

/// Get the committed balloon size.
#[utoipa::path(
    get,
    path = "/api/v1/vms/{id}/balloon",
    tag = "Runtime",
    params(
        ("id" = String, Path, description = "VM id")
    ),
    responses(
        (status = 200, description = "Balloon size", body = BalloonResponse),
        (status = 404, description = "VM not found", body = ApiErrorResponse)
    )
)]
pub async fn get_balloon(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<BalloonResponse>, ApiError> {
    let amount_mib = state.supervisor().balloon_amount(&id).await?;
    Ok(Json(BalloonResponse { amount_mib }))
}
