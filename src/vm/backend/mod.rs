//! VM backend implementations.
//!
//! This module wires a Firecracker VM's management API, hybrid vsock socket
//! and process into the collaborator interfaces the runtime drives.

mod firecracker;
mod reclaim;
mod vsock;

use std::sync::Arc;

use crate::config::{RuntimeConfig, VmSpec};
use crate::vm::VmBackends;

pub use firecracker::FirecrackerApi;
pub use reclaim::ProcessReclaimer;
pub use vsock::HybridVsock;

/// Build the collaborators for a Firecracker VM.
pub fn firecracker(spec: &VmSpec, runtime: &RuntimeConfig) -> VmBackends {
    let api = Arc::new(FirecrackerApi::new(&spec.api_socket));
    VmBackends {
        vcpu: api.clone(),
        balloon: api,
        reclaimer: Arc::new(ProcessReclaimer::new(spec.pid, spec.mem_size_mib)),
        transport: Arc::new(HybridVsock::new(
            &spec.vsock_uds,
            runtime.delivery_attempt_timeout,
        )),
    }
}
