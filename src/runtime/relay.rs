//! Delivery of LLM responses into a waiting guest.

use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;

use agentvm_protocol::llm_response_frame;

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::runtime::error::RuntimeError;
use crate::runtime::machine::VmRuntimeStateMachine;
use crate::runtime::pending::ClaimedRequest;
use crate::runtime::state::VmRuntimeState;
use crate::vm::GuestTransport;

/// Outcome of a successful delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Delivered request.
    pub request_id: String,
    /// Guest port written to.
    pub vsock_port: u32,
    /// Connect-and-write attempts used.
    pub attempts: u32,
    /// Frame size in bytes.
    pub bytes: usize,
    /// VM state after the delivery and its continuation.
    pub state: VmRuntimeState,
}

/// Relay failures, split by whether the payload reached the guest.
#[derive(Debug)]
pub enum RelayError {
    /// Nothing was delivered; the request may be retried.
    Undelivered(RuntimeError),
    /// The payload was delivered but the follow-up step failed.
    Followup(RuntimeError),
}

/// Writes responses to guest listeners with bounded retries.
#[derive(Debug, Clone)]
pub struct ResponseRelay {
    retry_budget: Duration,
    retry_interval: Duration,
    attempt_timeout: Duration,
}

impl ResponseRelay {
    /// Create a relay using the delivery settings of `runtime`.
    pub fn new(runtime: &RuntimeConfig) -> Self {
        Self {
            retry_budget: runtime.delivery_retry_budget,
            retry_interval: runtime.delivery_retry_interval,
            attempt_timeout: runtime.delivery_attempt_timeout,
        }
    }

    /// Deliver `response` for a claimed request.
    ///
    /// A paused guest is resumed for the duration of the write. Afterwards
    /// the request's continuation runs if it has one; otherwise the guest is
    /// halted again when its wait asked for that.
    pub async fn deliver(
        &self,
        machine: &mut VmRuntimeStateMachine,
        claim: ClaimedRequest,
        response: &str,
    ) -> std::result::Result<DeliveryReport, RelayError> {
        let ClaimedRequest {
            request,
            on_delivered,
        } = claim;

        let frame = llm_response_frame(&request.request_id, response).map_err(|e| {
            RelayError::Undelivered(RuntimeError::invalid(format!("response not encodable: {}", e)))
        })?;

        machine
            .open_delivery_window()
            .await
            .map_err(RelayError::Undelivered)?;

        let transport = machine.transport();
        let attempts = match self
            .write_with_retry(transport.as_ref(), request.vsock_port, &frame)
            .await
        {
            Ok(attempts) => attempts,
            Err((attempts, e)) => {
                if let Err(pause) = machine.close_delivery_window().await {
                    tracing::error!(vm_id = %machine.vm_id(), error = %pause, "failed to re-pause after failed delivery");
                }
                tracing::warn!(
                    vm_id = %machine.vm_id(),
                    request_id = %request.request_id,
                    attempts,
                    error = %e,
                    "response delivery failed"
                );
                return Err(RelayError::Undelivered(RuntimeError::DeliveryFailed {
                    request_id: request.request_id,
                    attempts,
                    reason: e.to_string(),
                }));
            }
        };

        tracing::info!(
            vm_id = %machine.vm_id(),
            request_id = %request.request_id,
            vsock_port = request.vsock_port,
            bytes = frame.len(),
            attempts,
            "response delivered"
        );

        let followup = match on_delivered {
            Some(continuation) => continuation(&mut *machine).await.map(|_| ()),
            None => Ok(()),
        };
        if let Err(e) = followup {
            if let Err(pause) = machine.close_delivery_window().await {
                tracing::error!(vm_id = %machine.vm_id(), error = %pause, "failed to re-pause after delivery");
            }
            return Err(RelayError::Followup(e));
        }
        machine
            .close_delivery_window()
            .await
            .map_err(RelayError::Followup)?;

        Ok(DeliveryReport {
            request_id: request.request_id,
            vsock_port: request.vsock_port,
            attempts,
            bytes: frame.len(),
            state: machine.state().clone(),
        })
    }

    /// Connect and write `frame` until it succeeds or the retry budget is
    /// spent. Returns the attempts used.
    async fn write_with_retry(
        &self,
        transport: &dyn GuestTransport,
        port: u32,
        frame: &[u8],
    ) -> std::result::Result<u32, (u32, Error)> {
        let deadline = Instant::now() + self.retry_budget;
        let mut attempts = 0;
        loop {
            attempts += 1;
            let err = match tokio::time::timeout(self.attempt_timeout, write_once(transport, port, frame)).await {
                Ok(Ok(())) => return Ok(attempts),
                Ok(Err(e)) => e,
                Err(_) => Error::Timeout(format!(
                    "delivery attempt to port {} after {:?}",
                    port, self.attempt_timeout
                )),
            };
            if Instant::now() + self.retry_interval >= deadline {
                return Err((attempts, err));
            }
            tracing::debug!(port, attempt = attempts, error = %err, "delivery attempt failed, retrying");
            tokio::time::sleep(self.retry_interval).await;
        }
    }
}

async fn write_once(transport: &dyn GuestTransport, port: u32, frame: &[u8]) -> Result<()> {
    let mut stream = transport.connect(port).await?;
    stream.write_all(frame).await?;
    stream.flush().await?;
    // The guest reads until EOF; a failed shutdown after a full write is not
    // a delivery failure.
    if let Err(e) = stream.shutdown().await {
        tracing::debug!(port, error = %e, "shutdown after delivery failed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::pending::PendingRegistry;
    use crate::runtime::state::{LifecycleState, RuntimeTarget, SetStateOptions};
    use crate::runtime::testing::{fast_runtime, machine_for, FakeVm};
    use crate::vm::VmId;

    async fn waiting_machine(vm: &FakeVm) -> VmRuntimeStateMachine {
        let mut machine = machine_for(vm, &fast_runtime());
        machine
            .set_state(
                RuntimeTarget::LlmWaiting,
                SetStateOptions {
                    pause_on_wait: true,
                    target_balloon_mib: Some(128),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        vm.clear_calls();
        machine
    }

    #[tokio::test]
    async fn test_delivery_with_resume() {
        let vm = FakeVm::new(2);
        let mut machine = waiting_machine(&vm).await;
        let registry = PendingRegistry::new(VmId::new("vm1"));
        let claim = registry.claim("req-1", 11000, Some(true)).unwrap();

        let report = ResponseRelay::new(&fast_runtime())
            .deliver(&mut machine, claim, "hello")
            .await
            .unwrap();

        assert_eq!(report.attempts, 1);
        assert_eq!(report.state.lifecycle, LifecycleState::Running);
        assert_eq!(machine.balloon_amount(), 2);
        assert_eq!(
            vm.delivered(11000),
            vec![r#"{"type":"llm_response","request_id":"req-1","response":"hello"}"#]
        );
        assert_eq!(vm.calls(), vec!["vcpu.resume", "deliver:11000", "balloon.set:2"]);
    }

    #[tokio::test]
    async fn test_delivery_without_resume_repauses() {
        let vm = FakeVm::new(2);
        let mut machine = waiting_machine(&vm).await;
        let registry = PendingRegistry::new(VmId::new("vm1"));
        let claim = registry.claim("req-1", 11000, None).unwrap();

        let report = ResponseRelay::new(&fast_runtime())
            .deliver(&mut machine, claim, "hello")
            .await
            .unwrap();

        assert_eq!(report.state.lifecycle, LifecycleState::LlmWaiting);
        assert!(machine.vcpus_paused());
        assert_eq!(machine.balloon_amount(), 128);
        assert_eq!(vm.calls(), vec!["vcpu.resume", "deliver:11000", "vcpu.pause"]);
    }

    #[tokio::test]
    async fn test_delivery_retries_until_listener_appears() {
        let vm = FakeVm::new(2);
        vm.fail_times("connect", 2);
        let mut machine = waiting_machine(&vm).await;
        let registry = PendingRegistry::new(VmId::new("vm1"));
        let claim = registry.claim("req-1", 11000, None).unwrap();

        let report = ResponseRelay::new(&fast_runtime())
            .deliver(&mut machine, claim, "hello")
            .await
            .unwrap();
        assert_eq!(report.attempts, 3);
        assert_eq!(vm.delivered(11000).len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_listener_fails_and_repauses() {
        let vm = FakeVm::new(2);
        vm.close_port(11000);
        let mut machine = waiting_machine(&vm).await;
        let registry = PendingRegistry::new(VmId::new("vm1"));
        let claim = registry.claim("req-1", 11000, Some(true)).unwrap();

        let err = ResponseRelay::new(&fast_runtime())
            .deliver(&mut machine, claim, "hello")
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            RelayError::Undelivered(RuntimeError::DeliveryFailed { attempts, .. }) if attempts > 1
        ));
        assert_eq!(machine.state().lifecycle, LifecycleState::LlmWaiting);
        assert!(machine.vcpus_paused());
        assert_eq!(machine.balloon_amount(), 128);
    }

    #[tokio::test]
    async fn test_failed_continuation_is_followup_error() {
        let vm = FakeVm::new(2);
        let mut machine = waiting_machine(&vm).await;
        let registry = PendingRegistry::new(VmId::new("vm1"));
        let claim = registry.claim("req-1", 11000, Some(true)).unwrap();
        vm.fail_next("balloon.set");

        let err = ResponseRelay::new(&fast_runtime())
            .deliver(&mut machine, claim, "hello")
            .await
            .unwrap_err();

        assert!(matches!(err, RelayError::Followup(RuntimeError::ReclaimFailed(_))));
        assert_eq!(vm.delivered(11000).len(), 1);
        assert_eq!(machine.state().lifecycle, LifecycleState::LlmWaiting);
        assert!(machine.vcpus_paused());
    }
}
