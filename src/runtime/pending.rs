//! Pending LLM request registry.
//!
//! Each VM owns one registry. Entries are either `Expected` (announced,
//! response not yet submitted) or `InFlight` (a delivery holds the claim).
//! Delivered entries are removed; failed deliveries fall back to
//! `Expected` so the caller can retry.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};
use utoipa::ToSchema;

use crate::runtime::error::RuntimeError;
use crate::runtime::machine::VmRuntimeStateMachine;
use crate::runtime::state::{RuntimeTarget, SetStateOptions, VmRuntimeState};
use crate::util::unix_timestamp;
use crate::vm::VmId;

/// Future returned by a [`DeliveryContinuation`].
pub type ContinuationFuture<'a> =
    Pin<Box<dyn Future<Output = Result<VmRuntimeState, RuntimeError>> + Send + 'a>>;

/// Action run against the VM after its response was delivered.
pub type DeliveryContinuation =
    Box<dyn for<'a> FnOnce(&'a mut VmRuntimeStateMachine) -> ContinuationFuture<'a> + Send>;

fn continuation<F>(f: F) -> DeliveryContinuation
where
    F: for<'a> FnOnce(&'a mut VmRuntimeStateMachine) -> ContinuationFuture<'a> + Send + 'static,
{
    Box::new(f)
}

/// Continuation that returns the VM to `Running`.
pub fn resume_continuation() -> DeliveryContinuation {
    continuation(|machine| {
        Box::pin(machine.set_state(RuntimeTarget::Running, SetStateOptions::default()))
    })
}

/// Phase of a pending request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PendingPhase {
    /// Waiting for the response to be submitted.
    Expected,
    /// A delivery is in progress.
    InFlight,
}

/// An outstanding LLM request for one VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    /// Caller-chosen id, unique within the VM.
    pub request_id: String,
    /// Guest port the response is written to.
    pub vsock_port: u32,
    /// Resume the VM after delivery.
    pub resume_on_delivery: bool,
    /// Current phase.
    pub phase: PendingPhase,
    /// Creation time, seconds since the Unix epoch.
    pub created_at: u64,
    registered: Instant,
}

impl PendingRequest {
    fn new(request_id: &str, vsock_port: u32, resume_on_delivery: bool, phase: PendingPhase) -> Self {
        Self {
            request_id: request_id.to_string(),
            vsock_port,
            resume_on_delivery,
            phase,
            created_at: unix_timestamp(),
            registered: Instant::now(),
        }
    }

    /// Time since the entry was created.
    pub fn age(&self) -> Duration {
        self.registered.elapsed()
    }
}

/// A request claimed for delivery.
pub struct ClaimedRequest {
    /// Snapshot of the claimed entry.
    pub request: PendingRequest,
    /// Runs after a successful delivery.
    pub on_delivered: Option<DeliveryContinuation>,
}

impl std::fmt::Debug for ClaimedRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimedRequest")
            .field("request", &self.request)
            .field("on_delivered", &self.on_delivered.is_some())
            .finish()
    }
}

#[derive(Debug, Default)]
struct Entries {
    map: HashMap<String, PendingRequest>,
    closed: bool,
}

/// Registry of pending requests for one VM.
#[derive(Debug)]
pub struct PendingRegistry {
    vm_id: VmId,
    inner: Mutex<Entries>,
}

impl PendingRegistry {
    /// Create an empty registry for `vm_id`.
    pub fn new(vm_id: VmId) -> Self {
        Self {
            vm_id,
            inner: Mutex::new(Entries::default()),
        }
    }

    fn duplicate(&self, request_id: &str) -> RuntimeError {
        RuntimeError::DuplicateRequest {
            vm_id: self.vm_id.to_string(),
            request_id: request_id.to_string(),
        }
    }

    /// Announce a response that will be submitted later.
    pub fn register(
        &self,
        request_id: &str,
        vsock_port: u32,
        resume_on_delivery: bool,
    ) -> Result<PendingRequest, RuntimeError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(RuntimeError::vm_not_found(&self.vm_id));
        }
        if inner.map.contains_key(request_id) {
            return Err(self.duplicate(request_id));
        }
        let request = PendingRequest::new(
            request_id,
            vsock_port,
            resume_on_delivery,
            PendingPhase::Expected,
        );
        inner.map.insert(request_id.to_string(), request.clone());
        tracing::debug!(vm_id = %self.vm_id, request_id, vsock_port, "pending request registered");
        Ok(request)
    }

    /// Claim a request for delivery.
    ///
    /// An `Expected` entry must have been registered for the same port; the
    /// submission may override its resume flag. An absent entry is created
    /// in flight. An entry already in flight is a duplicate.
    pub fn claim(
        &self,
        request_id: &str,
        vsock_port: u32,
        resume_on_delivery: Option<bool>,
    ) -> Result<ClaimedRequest, RuntimeError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(RuntimeError::vm_not_found(&self.vm_id));
        }

        let request = match inner.map.get_mut(request_id) {
            Some(entry) if entry.phase == PendingPhase::InFlight => {
                return Err(self.duplicate(request_id));
            }
            Some(entry) if entry.vsock_port != vsock_port => {
                return Err(RuntimeError::invalid(format!(
                    "request '{}' expects a response on vsock port {}, not {}",
                    request_id, entry.vsock_port, vsock_port
                )));
            }
            Some(entry) => {
                if let Some(resume) = resume_on_delivery {
                    entry.resume_on_delivery = resume;
                }
                entry.phase = PendingPhase::InFlight;
                entry.clone()
            }
            None => {
                let entry = PendingRequest::new(
                    request_id,
                    vsock_port,
                    resume_on_delivery.unwrap_or(false),
                    PendingPhase::InFlight,
                );
                inner.map.insert(request_id.to_string(), entry.clone());
                entry
            }
        };

        let on_delivered = request.resume_on_delivery.then(resume_continuation);
        Ok(ClaimedRequest {
            request,
            on_delivered,
        })
    }

    /// Whether the owning VM was torn down.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Remove a delivered request.
    pub fn complete(&self, request_id: &str) -> Option<PendingRequest> {
        self.inner.lock().map.remove(request_id)
    }

    /// Return an in-flight request to `Expected` after a failed delivery.
    pub fn release(&self, request_id: &str) {
        if let Some(entry) = self.inner.lock().map.get_mut(request_id) {
            entry.phase = PendingPhase::Expected;
        }
    }

    /// Look up a request.
    pub fn resolve(&self, request_id: &str) -> Result<PendingRequest, RuntimeError> {
        self.inner
            .lock()
            .map
            .get(request_id)
            .cloned()
            .ok_or_else(|| RuntimeError::request_not_found(&self.vm_id, request_id))
    }

    /// Drop an expected request. In-flight requests cannot be cancelled.
    pub fn cancel(&self, request_id: &str) -> Result<PendingRequest, RuntimeError> {
        let mut inner = self.inner.lock();
        let phase = inner.map.get(request_id).map(|entry| entry.phase);
        match phase {
            Some(PendingPhase::InFlight) => Err(RuntimeError::invalid(format!(
                "request '{}' is being delivered",
                request_id
            ))),
            _ => inner
                .map
                .remove(request_id)
                .ok_or_else(|| RuntimeError::request_not_found(&self.vm_id, request_id)),
        }
    }

    /// All requests, oldest first.
    pub fn list(&self) -> Vec<PendingRequest> {
        let mut requests: Vec<_> = self.inner.lock().map.values().cloned().collect();
        requests.sort_by(|a, b| a.registered.cmp(&b.registered));
        requests
    }

    /// Drop `Expected` entries older than `ttl`. Returns the dropped ids.
    pub fn sweep_expired(&self, ttl: Duration) -> Vec<String> {
        let mut inner = self.inner.lock();
        let expired: Vec<String> = inner
            .map
            .values()
            .filter(|r| r.phase == PendingPhase::Expected && r.age() >= ttl)
            .map(|r| r.request_id.clone())
            .collect();
        for id in &expired {
            inner.map.remove(id);
        }
        expired
    }

    /// Drop every entry and refuse new ones. Returns the number dropped.
    pub fn close(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.closed = true;
        let dropped = inner.map.len();
        inner.map.clear();
        dropped
    }
}
