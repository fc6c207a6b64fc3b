//! Runtime state types and the two-phase transition record.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::vm::VmId;

/// Lifecycle of a VM under the runtime controller.
///
/// `EnteringWait` and `Resuming` exist only while a transition holds the
/// VM lock; readers always observe `Running` or `LlmWaiting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub enum LifecycleState {
    /// Guest executing normally (initial state).
    Running,
    /// Wait-side effects being applied.
    EnteringWait,
    /// Guest parked while an external LLM call is in flight.
    LlmWaiting,
    /// Resume-side effects being applied.
    Resuming,
}

impl LifecycleState {
    /// Whether this is a settled (externally observable) state.
    pub fn is_settled(self) -> bool {
        matches!(self, LifecycleState::Running | LifecycleState::LlmWaiting)
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleState::Running => write!(f, "Running"),
            LifecycleState::EnteringWait => write!(f, "EnteringWait"),
            LifecycleState::LlmWaiting => write!(f, "LlmWaiting"),
            LifecycleState::Resuming => write!(f, "Resuming"),
        }
    }
}

/// States a caller may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub enum RuntimeTarget {
    /// Resume normal execution.
    Running,
    /// Park the guest for an LLM wait.
    LlmWaiting,
}

impl From<RuntimeTarget> for LifecycleState {
    fn from(target: RuntimeTarget) -> Self {
        match target {
            RuntimeTarget::Running => LifecycleState::Running,
            RuntimeTarget::LlmWaiting => LifecycleState::LlmWaiting,
        }
    }
}

/// A response the caller expects to submit later, registered on wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedResponse {
    /// Request id the response will carry.
    pub request_id: String,
    /// Guest port the response goes to.
    pub vsock_port: u32,
    /// Resume the VM once the response is delivered.
    pub resume_on_delivery: bool,
}

/// Options for a state change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetStateOptions {
    /// Halt vCPUs while waiting.
    pub pause_on_wait: bool,
    /// Inflate the balloon to this size while waiting.
    pub target_balloon_mib: Option<u32>,
    /// Require a guest quiescence acknowledgement before settling.
    pub acknowledge_on_stop: bool,
    /// Register a pending response expectation.
    pub expect: Option<ExpectedResponse>,
}

impl SetStateOptions {
    /// True when no wait-side option is set.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Settled runtime state of one VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmRuntimeState {
    /// VM identifier.
    pub vm_id: VmId,
    /// Current lifecycle state.
    pub lifecycle: LifecycleState,
    /// Committed balloon target of the active wait, if any.
    pub balloon_target_mib: Option<u32>,
    /// Whether the active wait halted vCPUs.
    pub pause_on_wait: bool,
    /// Whether the active wait was acknowledged by the guest.
    pub acknowledge_on_stop: bool,
}

impl VmRuntimeState {
    /// Initial state for a newly registered VM.
    pub fn new(vm_id: VmId) -> Self {
        Self {
            vm_id,
            lifecycle: LifecycleState::Running,
            balloon_target_mib: None,
            pause_on_wait: false,
            acknowledge_on_stop: false,
        }
    }
}

/// A staged side effect and how to undo it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Undo {
    /// Guest acknowledged quiescence; tell it to continue.
    ReleaseQuiescence,
    /// Balloon target was raised; return it to baseline.
    RestoreBalloon,
    /// vCPUs were halted; resume them.
    ResumeVcpus,
    /// vCPUs were resumed; halt them again.
    PauseVcpus,
}

/// A transition in progress.
///
/// Side effects are staged as they commit on the device side. On failure
/// the staged effects are undone in reverse order and the lifecycle falls
/// back to `from`; on success it becomes `to`.
#[derive(Debug)]
pub(crate) struct Transition {
    pub from: LifecycleState,
    pub to: LifecycleState,
    staged: Vec<Undo>,
}

impl Transition {
    pub fn begin(from: LifecycleState, to: LifecycleState) -> Self {
        Self {
            from,
            to,
            staged: Vec::new(),
        }
    }

    /// Record an applied side effect.
    pub fn stage(&mut self, undo: Undo) {
        self.staged.push(undo);
    }

    /// Undo actions, most recent first.
    pub fn rollback_plan(self) -> impl Iterator<Item = Undo> {
        self.staged.into_iter().rev()
    }
}
