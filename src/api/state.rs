//! API server state management.

use std::sync::Arc;

use crate::api::types::RegisterVmRequest;
use crate::config::{RuntimeConfig, VmSpec};
use crate::runtime::{RuntimeError, RuntimeSupervisor, VmProfile};
use crate::vm::{backend, VmId};

/// Shared API server state.
#[derive(Debug, Clone)]
pub struct ApiState {
    supervisor: Arc<RuntimeSupervisor>,
}

impl ApiState {
    /// Create API state around a supervisor.
    pub fn new(supervisor: Arc<RuntimeSupervisor>) -> Self {
        Self { supervisor }
    }

    /// Create API state with an empty supervisor.
    pub fn with_runtime(runtime: RuntimeConfig) -> Self {
        Self::new(Arc::new(RuntimeSupervisor::new(runtime)))
    }

    /// The runtime supervisor.
    pub fn supervisor(&self) -> &Arc<RuntimeSupervisor> {
        &self.supervisor
    }

    /// Register a Firecracker VM described by `spec`.
    pub async fn register_firecracker(&self, spec: &VmSpec) -> Result<(), RuntimeError> {
        let backends = backend::firecracker(spec, self.supervisor.runtime_config());
        let profile = VmProfile {
            mem_size_mib: spec.mem_size_mib,
            balloon_baseline_mib: spec.balloon_baseline_mib,
            quiescence_port: spec.quiescence_port,
        };
        self.supervisor
            .register(VmId::new(spec.name.as_str()), profile, backends)
            .await
    }
}

impl From<&RegisterVmRequest> for VmSpec {
    fn from(req: &RegisterVmRequest) -> Self {
        Self {
            name: req.name.clone(),
            api_socket: req.api_socket.clone().into(),
            vsock_uds: req.vsock_uds.clone().into(),
            pid: req.pid,
            mem_size_mib: req.mem_size_mib,
            balloon_baseline_mib: req.balloon_baseline_mib,
            quiescence_port: req
                .quiescence_port
                .unwrap_or(agentvm_protocol::ports::QUIESCENCE),
        }
    }
}
