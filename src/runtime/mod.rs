//! Agent runtime controller.
//!
//! Parks a VM while its agent waits on an external LLM call and hands the
//! response back afterwards:
//!
//! - [`VmRuntimeStateMachine`]: per-VM lifecycle with transactional
//!   side effects
//! - [`MemoryReclaimCoordinator`]: balloon inflation and host reclaim
//! - [`PendingRegistry`]: requests awaiting a response
//! - [`ResponseRelay`]: delivery into the guest
//! - [`RuntimeSupervisor`]: the registry of VMs tying it together

pub mod error;
pub mod machine;
pub mod pending;
pub mod reclaim;
pub mod relay;
pub mod state;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod testing;

pub use error::RuntimeError;
pub use machine::{SupersedeSignal, VmProfile, VmRuntimeStateMachine};
pub use pending::{PendingPhase, PendingRegistry, PendingRequest};
pub use reclaim::{MemoryReclaimCoordinator, ReclaimError};
pub use relay::{DeliveryReport, ResponseRelay};
pub use state::{
    ExpectedResponse, LifecycleState, RuntimeTarget, SetStateOptions, VmRuntimeState,
};
pub use supervisor::{ResponseSubmission, RuntimeSupervisor, VmSummary};
