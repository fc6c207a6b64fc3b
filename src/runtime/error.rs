//! Runtime controller errors.

use std::time::Duration;
use thiserror::Error;

use crate::error::Error;
use crate::runtime::reclaim::ReclaimError;

/// Failures reported by the runtime controller.
///
/// A failed transition always leaves the VM in its last settled state.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Target state unreachable or options malformed.
    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    /// The balloon did not converge or host reclaim failed.
    #[error("memory reclaim failed: {0}")]
    ReclaimFailed(#[source] ReclaimError),

    /// Halting vCPUs failed.
    #[error("failed to pause vCPUs: {0}")]
    PauseFailed(#[source] Error),

    /// Resuming vCPUs failed.
    #[error("failed to resume vCPUs: {0}")]
    ResumeFailed(#[source] Error),

    /// The guest did not acknowledge quiescence in time.
    #[error("guest did not acknowledge quiescence within {0:?}")]
    QuiescenceTimeout(Duration),

    /// The guest refused the quiescence request or broke the exchange.
    #[error("guest failed to quiesce: {0}")]
    QuiescenceFailed(String),

    /// The response could not be written to the guest within the retry budget.
    #[error("delivery of '{request_id}' failed after {attempts} attempt(s): {reason}")]
    DeliveryFailed {
        /// Request being delivered.
        request_id: String,
        /// Number of connect-and-write attempts made.
        attempts: u32,
        /// Last transport error.
        reason: String,
    },

    /// A pending request with this id already exists for the VM.
    #[error("request '{request_id}' is already pending for VM '{vm_id}'")]
    DuplicateRequest {
        /// Owning VM.
        vm_id: String,
        /// Colliding request id.
        request_id: String,
    },

    /// Unknown VM or request.
    #[error("{0} not found")]
    NotFound(String),

    /// A VM with this id is already registered.
    #[error("VM '{0}' already exists")]
    VmExists(String),

    /// A resume request arrived while entering the wait state; the wait was
    /// rolled back.
    #[error("wait transition superseded by a resume request")]
    Superseded,

    /// A transition task died before reporting its outcome.
    #[error("internal error: {0}")]
    Internal(String),
}

impl RuntimeError {
    /// Stable machine-readable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            RuntimeError::InvalidTransition(_) => "INVALID_TRANSITION",
            RuntimeError::ReclaimFailed(_) => "RECLAIM_FAILED",
            RuntimeError::PauseFailed(_) => "PAUSE_FAILED",
            RuntimeError::ResumeFailed(_) => "RESUME_FAILED",
            RuntimeError::QuiescenceTimeout(_) => "QUIESCENCE_TIMEOUT",
            RuntimeError::QuiescenceFailed(_) => "QUIESCENCE_FAILED",
            RuntimeError::DeliveryFailed { .. } => "DELIVERY_FAILED",
            RuntimeError::DuplicateRequest { .. } => "DUPLICATE_REQUEST",
            RuntimeError::NotFound(_) => "NOT_FOUND",
            RuntimeError::VmExists(_) => "VM_EXISTS",
            RuntimeError::Superseded => "SUPERSEDED",
            RuntimeError::Internal(_) => "INTERNAL",
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        RuntimeError::InvalidTransition(msg.into())
    }

    pub(crate) fn vm_not_found(vm_id: impl std::fmt::Display) -> Self {
        RuntimeError::NotFound(format!("VM '{}'", vm_id))
    }

    pub(crate) fn request_not_found(vm_id: impl std::fmt::Display, request_id: &str) -> Self {
        RuntimeError::NotFound(format!("request '{}' on VM '{}'", request_id, vm_id))
    }
}
