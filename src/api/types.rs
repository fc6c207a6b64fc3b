//! API request and response types.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::runtime::{
    DeliveryReport, LifecycleState, PendingPhase, PendingRequest, RuntimeTarget, VmRuntimeState,
    VmSummary,
};

// ============================================================================
// Common
// ============================================================================

/// Health check response.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// Always `ok`.
    pub status: String,
    /// Server version.
    pub version: String,
}

/// Error body returned by every failing endpoint.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ApiErrorResponse {
    /// Human-readable message.
    pub error: String,
    /// Stable machine-readable code, e.g. `INVALID_TRANSITION`.
    pub code: String,
}

// ============================================================================
// VMs
// ============================================================================

/// Register a Firecracker VM with the runtime controller.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct RegisterVmRequest {
    /// VM name, used as its id.
    pub name: String,
    /// Firecracker API socket path.
    pub api_socket: String,
    /// Firecracker hybrid vsock socket path.
    pub vsock_uds: String,
    /// Firecracker process id, enables host page reclaim.
    #[serde(default)]
    pub pid: Option<i32>,
    /// Guest memory size in MiB.
    pub mem_size_mib: u32,
    /// Balloon baseline in MiB. Read from the device when omitted.
    #[serde(default)]
    pub balloon_baseline_mib: Option<u32>,
    /// Guest quiescence port.
    #[serde(default)]
    pub quiescence_port: Option<u32>,
}

/// Registered VM overview.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct VmInfo {
    /// VM id.
    pub name: String,
    /// Runtime lifecycle state.
    pub state: LifecycleState,
    /// Guest memory size in MiB.
    pub mem_size_mib: u32,
    /// Balloon baseline in MiB.
    pub balloon_baseline_mib: u32,
    /// Committed balloon size in MiB.
    pub balloon_amount_mib: u32,
    /// Number of pending requests.
    pub pending_requests: usize,
    /// Registration time (Unix seconds).
    pub registered_at: u64,
}

impl From<VmSummary> for VmInfo {
    fn from(s: VmSummary) -> Self {
        Self {
            name: s.state.vm_id.to_string(),
            state: s.state.lifecycle,
            mem_size_mib: s.mem_size_mib,
            balloon_baseline_mib: s.balloon_baseline_mib,
            balloon_amount_mib: s.balloon_amount_mib,
            pending_requests: s.pending_requests,
            registered_at: s.registered_at,
        }
    }
}

/// List of VMs.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ListVmsResponse {
    /// Registered VMs.
    pub vms: Vec<VmInfo>,
}

/// VM removed from runtime control.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DeleteVmResponse {
    /// Removed VM id.
    pub deleted: String,
    /// Pending requests dropped with it.
    pub dropped_requests: usize,
}

// ============================================================================
// Agent runtime
// ============================================================================

/// Change a VM's runtime state.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct SetRuntimeStateRequest {
    /// Target state.
    pub state: RuntimeTarget,
    /// Halt vCPUs while waiting.
    #[serde(default)]
    pub pause_on_wait: bool,
    /// Balloon size while waiting, in MiB.
    #[serde(default)]
    pub target_balloon_mib: Option<u32>,
    /// Require a guest quiescence acknowledgement.
    #[serde(default)]
    pub acknowledge_on_stop: bool,
    /// Register a pending response with this id.
    #[serde(default)]
    pub expect_request_id: Option<String>,
    /// Guest port for the expected response.
    #[serde(default)]
    pub expect_vsock_port: Option<u32>,
    /// Resume the VM once the expected response is delivered.
    #[serde(default)]
    pub resume_on_delivery: Option<bool>,
}

/// Settled runtime state.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RuntimeStateResponse {
    /// VM id.
    pub vm_id: String,
    /// Lifecycle state.
    pub state: LifecycleState,
    /// Committed balloon target of the active wait.
    pub balloon_target_mib: Option<u32>,
    /// Whether the active wait halted vCPUs.
    pub pause_on_wait: bool,
    /// Whether the active wait was acknowledged by the guest.
    pub acknowledge_on_stop: bool,
}

impl From<VmRuntimeState> for RuntimeStateResponse {
    fn from(s: VmRuntimeState) -> Self {
        Self {
            vm_id: s.vm_id.to_string(),
            state: s.lifecycle,
            balloon_target_mib: s.balloon_target_mib,
            pause_on_wait: s.pause_on_wait,
            acknowledge_on_stop: s.acknowledge_on_stop,
        }
    }
}

/// Deliver an LLM response into the guest.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct SubmitResponseRequest {
    /// Request the response answers.
    pub request_id: String,
    /// Opaque response payload.
    pub response: String,
    /// Guest port. Must match the port of an announced request.
    pub vsock_port: u32,
    /// Resume the VM after delivery.
    #[serde(default)]
    pub resume_vm: Option<bool>,
}

/// Successful delivery.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SubmitResponseResponse {
    /// Delivered request.
    pub request_id: String,
    /// Guest port written to.
    pub vsock_port: u32,
    /// Attempts used.
    pub attempts: u32,
    /// Frame size in bytes.
    pub bytes: usize,
    /// Runtime state after delivery.
    pub runtime: RuntimeStateResponse,
}

impl From<DeliveryReport> for SubmitResponseResponse {
    fn from(r: DeliveryReport) -> Self {
        Self {
            request_id: r.request_id,
            vsock_port: r.vsock_port,
            attempts: r.attempts,
            bytes: r.bytes,
            runtime: r.state.into(),
        }
    }
}

/// A pending LLM request.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct PendingRequestInfo {
    /// Request id.
    pub request_id: String,
    /// Guest port.
    pub vsock_port: u32,
    /// Resume after delivery.
    pub resume_on_delivery: bool,
    /// Phase.
    pub phase: PendingPhase,
    /// Creation time (Unix seconds).
    pub created_at: u64,
    /// Age in seconds.
    pub age_secs: u64,
}

impl From<PendingRequest> for PendingRequestInfo {
    fn from(r: PendingRequest) -> Self {
        Self {
            age_secs: r.age().as_secs(),
            request_id: r.request_id,
            vsock_port: r.vsock_port,
            resume_on_delivery: r.resume_on_delivery,
            phase: r.phase,
            created_at: r.created_at,
        }
    }
}

/// Pending requests of a VM.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ListPendingResponse {
    /// Requests, oldest first.
    pub requests: Vec<PendingRequestInfo>,
}

/// Current balloon size.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct BalloonResponse {
    /// Committed balloon size in MiB.
    pub amount_mib: u32,
}
