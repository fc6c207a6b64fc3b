//! Registry of VMs under runtime control.
//!
//! The supervisor's lock only guards the VM map. Every VM has its own
//! state machine lock and pending registry, so a slow transition on one VM
//! never delays another.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::RuntimeConfig;
use crate::runtime::error::RuntimeError;
use crate::runtime::machine::{SupersedeSignal, VmProfile, VmRuntimeStateMachine};
use crate::runtime::pending::{PendingRegistry, PendingRequest};
use crate::runtime::reclaim::ReclaimError;
use crate::runtime::relay::{DeliveryReport, RelayError, ResponseRelay};
use crate::runtime::state::{RuntimeTarget, SetStateOptions, VmRuntimeState};
use crate::util::unix_timestamp;
use crate::vm::{VmBackends, VmId};

type Result<T> = std::result::Result<T, RuntimeError>;

/// A response submitted for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseSubmission {
    /// Request the response answers.
    pub request_id: String,
    /// Opaque payload.
    pub response: String,
    /// Guest port; must match the port of an announced request.
    pub vsock_port: u32,
    /// Resume the VM after delivery; defaults to the registered flag.
    pub resume_vm: Option<bool>,
}

/// Overview of one registered VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmSummary {
    /// Runtime state.
    pub state: VmRuntimeState,
    /// Guest memory size in MiB.
    pub mem_size_mib: u32,
    /// Balloon size restored after a wait.
    pub balloon_baseline_mib: u32,
    /// Committed balloon size.
    pub balloon_amount_mib: u32,
    /// Number of pending requests.
    pub pending_requests: usize,
    /// Registration time, seconds since the Unix epoch.
    pub registered_at: u64,
}

struct VmSlot {
    vm_id: VmId,
    mem_size_mib: u32,
    baseline_mib: u32,
    registered_at: u64,
    machine: tokio::sync::Mutex<VmRuntimeStateMachine>,
    pending: PendingRegistry,
    supersede: Arc<SupersedeSignal>,
}

/// Owns every VM's runtime state machine.
pub struct RuntimeSupervisor {
    slots: RwLock<HashMap<VmId, Arc<VmSlot>>>,
    runtime: RuntimeConfig,
    relay: ResponseRelay,
}

impl RuntimeSupervisor {
    /// Create an empty supervisor.
    pub fn new(runtime: RuntimeConfig) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            relay: ResponseRelay::new(&runtime),
            runtime,
        }
    }

    /// Runtime settings in effect.
    pub fn runtime_config(&self) -> &RuntimeConfig {
        &self.runtime
    }

    fn slot(&self, vm_id: &str) -> Result<Arc<VmSlot>> {
        self.slots
            .read()
            .get(vm_id)
            .cloned()
            .ok_or_else(|| RuntimeError::vm_not_found(vm_id))
    }

    /// Register a VM in `Running` with its collaborators.
    ///
    /// Without a configured baseline, the balloon's current target is used.
    pub async fn register(
        &self,
        vm_id: VmId,
        profile: VmProfile,
        backends: VmBackends,
    ) -> Result<()> {
        if self.slots.read().contains_key(&vm_id) {
            return Err(RuntimeError::VmExists(vm_id.to_string()));
        }

        let baseline_mib = match profile.balloon_baseline_mib {
            Some(mib) => mib,
            None => backends
                .balloon
                .target_mib()
                .await
                .map_err(|e| RuntimeError::ReclaimFailed(ReclaimError::Device(e)))?,
        };
        if baseline_mib >= profile.mem_size_mib {
            return Err(RuntimeError::invalid(format!(
                "balloon baseline {} MiB must be less than guest memory of {} MiB",
                baseline_mib, profile.mem_size_mib
            )));
        }

        let supersede = Arc::new(SupersedeSignal::default());
        let machine = VmRuntimeStateMachine::new(
            vm_id.clone(),
            &profile,
            baseline_mib,
            backends,
            &self.runtime,
            Arc::clone(&supersede),
        );
        let slot = Arc::new(VmSlot {
            vm_id: vm_id.clone(),
            mem_size_mib: profile.mem_size_mib,
            baseline_mib,
            registered_at: unix_timestamp(),
            machine: tokio::sync::Mutex::new(machine),
            pending: PendingRegistry::new(vm_id.clone()),
            supersede,
        });

        let mut slots = self.slots.write();
        if slots.contains_key(&vm_id) {
            return Err(RuntimeError::VmExists(vm_id.to_string()));
        }
        slots.insert(vm_id.clone(), slot);
        tracing::info!(
            vm_id = %vm_id,
            mem_size_mib = profile.mem_size_mib,
            baseline_mib,
            "VM registered"
        );
        Ok(())
    }

    /// Remove a VM and drop its pending requests.
    ///
    /// Returns the number of pending requests dropped.
    pub fn deregister(&self, vm_id: &str) -> Result<usize> {
        let slot = self
            .slots
            .write()
            .remove(vm_id)
            .ok_or_else(|| RuntimeError::vm_not_found(vm_id))?;
        let dropped = slot.pending.close();
        tracing::info!(vm_id = %slot.vm_id, dropped_requests = dropped, "VM deregistered");
        Ok(dropped)
    }

    /// Registered VM ids, sorted.
    pub fn vm_ids(&self) -> Vec<VmId> {
        let mut ids: Vec<VmId> = self.slots.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of registered VMs.
    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    /// Whether no VM is registered.
    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }

    /// Move a VM to `target`.
    ///
    /// A `Running` request supersedes an in-flight wait transition. A wait
    /// carrying an expectation registers it before any side effect and
    /// drops it again if the transition fails.
    pub async fn set_state(
        &self,
        vm_id: &str,
        target: RuntimeTarget,
        options: SetStateOptions,
    ) -> Result<VmRuntimeState> {
        let slot = self.slot(vm_id)?;

        let expected = match (&options.expect, target) {
            (Some(expect), RuntimeTarget::LlmWaiting) => {
                slot.pending.register(
                    &expect.request_id,
                    expect.vsock_port,
                    expect.resume_on_delivery,
                )?;
                Some(expect.request_id.clone())
            }
            _ => None,
        };

        // The transition runs on its own task so a dropped caller cannot
        // leave the VM between settled states.
        let task_slot = Arc::clone(&slot);
        let result = tokio::spawn(async move {
            let supersede = (target == RuntimeTarget::Running).then(|| task_slot.supersede.raise());
            let mut machine = task_slot.machine.lock().await;
            drop(supersede);
            // Work queued behind the lock must not touch a deregistered VM.
            if task_slot.pending.is_closed() {
                return Err(RuntimeError::vm_not_found(&task_slot.vm_id));
            }
            machine.set_state(target, options).await
        })
        .await
        .map_err(|e| RuntimeError::Internal(e.to_string()))
        .and_then(|r| r);

        if result.is_err() {
            if let Some(request_id) = expected {
                if let Err(e) = slot.pending.cancel(&request_id) {
                    tracing::debug!(
                        vm_id = %slot.vm_id,
                        request_id = %request_id,
                        error = %e,
                        "expectation not dropped"
                    );
                }
            }
        }
        result
    }

    /// Settled runtime state. Waits for any in-flight transition.
    pub async fn runtime_state(&self, vm_id: &str) -> Result<VmRuntimeState> {
        let slot = self.slot(vm_id)?;
        let machine = slot.machine.lock().await;
        Ok(machine.state().clone())
    }

    /// Committed balloon size of a VM.
    pub async fn balloon_amount(&self, vm_id: &str) -> Result<u32> {
        let slot = self.slot(vm_id)?;
        let machine = slot.machine.lock().await;
        Ok(machine.balloon_amount())
    }

    /// Overview of a VM.
    pub async fn summary(&self, vm_id: &str) -> Result<VmSummary> {
        let slot = self.slot(vm_id)?;
        Ok(Self::summarize(&slot).await)
    }

    /// Overview of every VM, sorted by id.
    pub async fn summaries(&self) -> Vec<VmSummary> {
        let mut slots: Vec<Arc<VmSlot>> = self.slots.read().values().cloned().collect();
        slots.sort_by(|a, b| a.vm_id.cmp(&b.vm_id));
        let mut out = Vec::with_capacity(slots.len());
        for slot in slots {
            out.push(Self::summarize(&slot).await);
        }
        out
    }

    async fn summarize(slot: &VmSlot) -> VmSummary {
        let machine = slot.machine.lock().await;
        VmSummary {
            state: machine.state().clone(),
            mem_size_mib: slot.mem_size_mib,
            balloon_baseline_mib: slot.baseline_mib,
            balloon_amount_mib: machine.balloon_amount(),
            pending_requests: slot.pending.list().len(),
            registered_at: slot.registered_at,
        }
    }

    /// Deliver a response to a VM's guest.
    ///
    /// The request is claimed first, so a concurrent submission of the same
    /// id fails fast. Undelivered requests return to `Expected`.
    pub async fn submit_response(
        &self,
        vm_id: &str,
        submission: ResponseSubmission,
    ) -> Result<DeliveryReport> {
        let slot = self.slot(vm_id)?;
        let claim = slot.pending.claim(
            &submission.request_id,
            submission.vsock_port,
            submission.resume_vm,
        )?;

        let relay = self.relay.clone();
        tokio::spawn(async move {
            let request_id = submission.request_id;
            let outcome = {
                let mut machine = slot.machine.lock().await;
                if slot.pending.is_closed() {
                    Err(RelayError::Undelivered(RuntimeError::vm_not_found(&slot.vm_id)))
                } else {
                    relay.deliver(&mut machine, claim, &submission.response).await
                }
            };
            match outcome {
                Ok(report) => {
                    slot.pending.complete(&request_id);
                    Ok(report)
                }
                Err(RelayError::Undelivered(e)) => {
                    slot.pending.release(&request_id);
                    Err(e)
                }
                Err(RelayError::Followup(e)) => {
                    slot.pending.complete(&request_id);
                    Err(e)
                }
            }
        })
        .await
        .map_err(|e| RuntimeError::Internal(e.to_string()))?
    }

    /// Announce a response that will be submitted later.
    pub fn register_pending(
        &self,
        vm_id: &str,
        request_id: &str,
        vsock_port: u32,
        resume_on_delivery: bool,
    ) -> Result<PendingRequest> {
        self.slot(vm_id)?
            .pending
            .register(request_id, vsock_port, resume_on_delivery)
    }

    /// Look up a pending request.
    pub fn resolve_pending(&self, vm_id: &str, request_id: &str) -> Result<PendingRequest> {
        self.slot(vm_id)?.pending.resolve(request_id)
    }

    /// Cancel an expected request.
    pub fn cancel_pending(&self, vm_id: &str, request_id: &str) -> Result<PendingRequest> {
        let request = self.slot(vm_id)?.pending.cancel(request_id)?;
        tracing::info!(vm_id, request_id, "pending request cancelled");
        Ok(request)
    }

    /// Pending requests of a VM, oldest first.
    pub fn list_pending(&self, vm_id: &str) -> Result<Vec<PendingRequest>> {
        Ok(self.slot(vm_id)?.pending.list())
    }

    /// Drop expected requests older than `ttl` on every VM.
    ///
    /// Lifecycle state is never touched. Returns the number dropped.
    pub fn sweep_stale(&self, ttl: Duration) -> usize {
        let slots: Vec<Arc<VmSlot>> = self.slots.read().values().cloned().collect();
        let mut dropped = 0;
        for slot in slots {
            for request_id in slot.pending.sweep_expired(ttl) {
                tracing::info!(vm_id = %slot.vm_id, request_id = %request_id, "stale pending request dropped");
                dropped += 1;
            }
        }
        dropped
    }
}

impl std::fmt::Debug for RuntimeSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeSupervisor")
            .field("vms", &self.vm_ids())
            .field("runtime", &self.runtime)
            .finish()
    }
}
