//! Per-VM runtime state machine.
//!
//! Entering `LlmWaiting` applies its side effects in a fixed order:
//! guest quiescence, balloon inflation with host reclaim, then vCPU pause.
//! Leaving it reverses them: vCPU resume, balloon deflation, then a resume
//! notice to a quiesced guest. Quiescence and convergence need a running
//! guest, which is why the pause comes last.
//!
//! Each transition stages its applied effects in a [`Transition`]. A failure
//! at any step undoes the staged effects in reverse order and restores the
//! previous settled state.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Notify;

use agentvm_protocol::{decode_line, encode_line, GuestMessage, HostMessage, MAX_FRAME_SIZE};

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::runtime::error::RuntimeError;
use crate::runtime::reclaim::MemoryReclaimCoordinator;
use crate::runtime::state::{
    LifecycleState, RuntimeTarget, SetStateOptions, Transition, Undo, VmRuntimeState,
};
use crate::vm::{GuestStream, GuestTransport, VcpuControl, VmBackends, VmId};

/// Interval between quiescence connect attempts.
const QUIESCE_CONNECT_INTERVAL: Duration = Duration::from_millis(50);

/// Static properties of a registered VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmProfile {
    /// Guest memory size in MiB.
    pub mem_size_mib: u32,
    /// Balloon size restored after a wait. Read from the device when unset.
    pub balloon_baseline_mib: Option<u32>,
    /// Guest port answering quiescence requests.
    pub quiescence_port: u32,
}

/// Raised by resume requests so an in-flight wait transition can abort.
///
/// The counter stays raised while at least one resume request is waiting
/// for the VM lock.
#[derive(Debug, Default)]
pub struct SupersedeSignal {
    waiting: AtomicUsize,
    notify: Notify,
}

impl SupersedeSignal {
    /// Raise the signal until the returned guard is dropped.
    pub fn raise(self: &Arc<Self>) -> SupersedeGuard {
        self.waiting.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
        SupersedeGuard(Arc::clone(self))
    }

    /// Whether any resume request is waiting.
    pub fn is_raised(&self) -> bool {
        self.waiting.load(Ordering::SeqCst) > 0
    }

    /// Complete once the signal is raised.
    pub async fn raised(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_raised() {
                return;
            }
            notified.await;
        }
    }
}

/// Keeps a [`SupersedeSignal`] raised.
#[derive(Debug)]
pub struct SupersedeGuard(Arc<SupersedeSignal>);

impl Drop for SupersedeGuard {
    fn drop(&mut self) {
        self.0.waiting.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Runtime state machine owning one VM's collaborators.
pub struct VmRuntimeStateMachine {
    state: VmRuntimeState,
    vcpu: Arc<dyn VcpuControl>,
    transport: Arc<dyn GuestTransport>,
    reclaim: MemoryReclaimCoordinator,
    supersede: Arc<SupersedeSignal>,
    mem_size_mib: u32,
    quiescence_port: u32,
    quiescence_timeout: Duration,
    notice_timeout: Duration,
    vcpus_paused: bool,
    quiesced: bool,
}

impl VmRuntimeStateMachine {
    /// Create a machine in `Running` with the balloon at `baseline_mib`.
    pub fn new(
        vm_id: VmId,
        profile: &VmProfile,
        baseline_mib: u32,
        backends: VmBackends,
        runtime: &RuntimeConfig,
        supersede: Arc<SupersedeSignal>,
    ) -> Self {
        let reclaim = MemoryReclaimCoordinator::new(
            vm_id.clone(),
            backends.balloon,
            backends.reclaimer,
            baseline_mib,
            runtime,
        );
        Self {
            state: VmRuntimeState::new(vm_id),
            vcpu: backends.vcpu,
            transport: backends.transport,
            reclaim,
            supersede,
            mem_size_mib: profile.mem_size_mib,
            quiescence_port: profile.quiescence_port,
            quiescence_timeout: runtime.quiescence_timeout,
            notice_timeout: runtime.delivery_attempt_timeout,
            vcpus_paused: false,
            quiesced: false,
        }
    }

    /// VM identifier.
    pub fn vm_id(&self) -> &VmId {
        &self.state.vm_id
    }

    /// Current settled state.
    pub fn state(&self) -> &VmRuntimeState {
        &self.state
    }

    /// Committed balloon size in MiB.
    pub fn balloon_amount(&self) -> u32 {
        self.reclaim.current_amount()
    }

    /// Balloon size restored after a wait.
    pub fn balloon_baseline(&self) -> u32 {
        self.reclaim.baseline_mib()
    }

    /// Whether guest vCPUs are currently halted.
    pub fn vcpus_paused(&self) -> bool {
        self.vcpus_paused
    }

    /// The VM's guest transport.
    pub fn transport(&self) -> Arc<dyn GuestTransport> {
        Arc::clone(&self.transport)
    }

    /// Move the VM to `target`.
    ///
    /// Requesting the current state is a no-op. Wait options are rejected
    /// for a `Running` target.
    pub async fn set_state(
        &mut self,
        target: RuntimeTarget,
        options: SetStateOptions,
    ) -> std::result::Result<VmRuntimeState, RuntimeError> {
        self.validate(target, &options)?;

        if LifecycleState::from(target) == self.state.lifecycle {
            tracing::debug!(vm_id = %self.state.vm_id, state = %self.state.lifecycle, "already in requested state");
            return Ok(self.state.clone());
        }

        match target {
            RuntimeTarget::LlmWaiting => self.enter_wait(options).await,
            RuntimeTarget::Running => self.leave_wait().await,
        }
    }

    fn validate(
        &self,
        target: RuntimeTarget,
        options: &SetStateOptions,
    ) -> std::result::Result<(), RuntimeError> {
        if target == RuntimeTarget::Running {
            if !options.is_empty() {
                return Err(RuntimeError::invalid(
                    "wait options are only valid for the LlmWaiting target",
                ));
            }
            return Ok(());
        }

        if let Some(target_mib) = options.target_balloon_mib {
            let baseline = self.reclaim.baseline_mib();
            if target_mib < baseline {
                return Err(RuntimeError::invalid(format!(
                    "target_balloon_mib {} is below the balloon baseline of {} MiB",
                    target_mib, baseline
                )));
            }
            if target_mib >= self.mem_size_mib {
                return Err(RuntimeError::invalid(format!(
                    "target_balloon_mib {} must be less than guest memory of {} MiB",
                    target_mib, self.mem_size_mib
                )));
            }
        }
        if let Some(expect) = &options.expect {
            if expect.request_id.is_empty() {
                return Err(RuntimeError::invalid("expected request_id cannot be empty"));
            }
        }
        Ok(())
    }

    async fn enter_wait(
        &mut self,
        options: SetStateOptions,
    ) -> std::result::Result<VmRuntimeState, RuntimeError> {
        let mut txn = Transition::begin(self.state.lifecycle, LifecycleState::LlmWaiting);
        self.state.lifecycle = LifecycleState::EnteringWait;

        match self.apply_wait(&mut txn, &options).await {
            Ok(()) => {
                self.state.lifecycle = txn.to;
                self.state.pause_on_wait = options.pause_on_wait;
                self.state.acknowledge_on_stop = options.acknowledge_on_stop;
                self.state.balloon_target_mib = options
                    .target_balloon_mib
                    .map(|_| self.reclaim.current_amount());
                tracing::info!(
                    vm_id = %self.state.vm_id,
                    paused = self.vcpus_paused,
                    balloon_mib = self.reclaim.current_amount(),
                    quiesced = self.quiesced,
                    "entered LlmWaiting"
                );
                Ok(self.state.clone())
            }
            Err(e) => {
                tracing::warn!(vm_id = %self.state.vm_id, error = %e, "wait transition failed, rolling back");
                self.rollback(txn).await;
                Err(e)
            }
        }
    }

    async fn apply_wait(
        &mut self,
        txn: &mut Transition,
        options: &SetStateOptions,
    ) -> std::result::Result<(), RuntimeError> {
        let supersede = Arc::clone(&self.supersede);

        if options.acknowledge_on_stop {
            // Staged before the exchange: the guest may act on the request
            // even when its acknowledgement never arrives.
            txn.stage(Undo::ReleaseQuiescence);
            tokio::select! {
                result = quiesce_guest(self.transport.as_ref(), self.quiescence_port, self.quiescence_timeout) => result?,
                _ = supersede.raised() => return Err(RuntimeError::Superseded),
            }
            self.quiesced = true;
        }

        if let Some(target_mib) = options.target_balloon_mib {
            if target_mib > self.reclaim.current_amount() {
                txn.stage(Undo::RestoreBalloon);
                tokio::select! {
                    result = self.reclaim.inflate(target_mib) => {
                        result.map_err(RuntimeError::ReclaimFailed)?;
                    }
                    _ = supersede.raised() => return Err(RuntimeError::Superseded),
                }
            }
        }

        if supersede.is_raised() {
            return Err(RuntimeError::Superseded);
        }

        if options.pause_on_wait {
            self.vcpu.pause().await.map_err(RuntimeError::PauseFailed)?;
            self.vcpus_paused = true;
            txn.stage(Undo::ResumeVcpus);
        }
        Ok(())
    }

    async fn leave_wait(&mut self) -> std::result::Result<VmRuntimeState, RuntimeError> {
        let mut txn = Transition::begin(self.state.lifecycle, LifecycleState::Running);
        self.state.lifecycle = LifecycleState::Resuming;

        match self.apply_resume(&mut txn).await {
            Ok(()) => {
                self.state.lifecycle = txn.to;
                self.state.pause_on_wait = false;
                self.state.acknowledge_on_stop = false;
                self.state.balloon_target_mib = None;
                if self.quiesced {
                    self.quiesced = false;
                    self.send_resume_notice().await;
                }
                tracing::info!(vm_id = %self.state.vm_id, "resumed to Running");
                Ok(self.state.clone())
            }
            Err(e) => {
                tracing::warn!(vm_id = %self.state.vm_id, error = %e, "resume transition failed, rolling back");
                self.rollback(txn).await;
                Err(e)
            }
        }
    }

    async fn apply_resume(&mut self, txn: &mut Transition) -> std::result::Result<(), RuntimeError> {
        if self.vcpus_paused {
            self.vcpu.resume().await.map_err(RuntimeError::ResumeFailed)?;
            self.vcpus_paused = false;
            txn.stage(Undo::PauseVcpus);
        }
        if self.reclaim.current_amount() != self.reclaim.baseline_mib() {
            self.reclaim
                .deflate()
                .await
                .map_err(RuntimeError::ReclaimFailed)?;
        }
        Ok(())
    }

    async fn rollback(&mut self, txn: Transition) {
        let from = txn.from;
        for undo in txn.rollback_plan() {
            if let Err(e) = self.undo(undo).await {
                tracing::error!(vm_id = %self.state.vm_id, step = ?undo, error = %e, "rollback step failed");
            }
        }
        self.state.lifecycle = from;
    }

    async fn undo(&mut self, undo: Undo) -> std::result::Result<(), RuntimeError> {
        match undo {
            Undo::ResumeVcpus => {
                self.vcpu.resume().await.map_err(RuntimeError::ResumeFailed)?;
                self.vcpus_paused = false;
            }
            Undo::PauseVcpus => {
                self.vcpu.pause().await.map_err(RuntimeError::PauseFailed)?;
                self.vcpus_paused = true;
            }
            Undo::RestoreBalloon => {
                self.reclaim
                    .deflate()
                    .await
                    .map_err(RuntimeError::ReclaimFailed)?;
            }
            Undo::ReleaseQuiescence => {
                self.quiesced = false;
                self.send_resume_notice().await;
            }
        }
        Ok(())
    }

    /// Let a paused guest run so it can accept a delivery.
    pub(crate) async fn open_delivery_window(&mut self) -> std::result::Result<(), RuntimeError> {
        if self.vcpus_paused {
            self.vcpu.resume().await.map_err(RuntimeError::ResumeFailed)?;
            self.vcpus_paused = false;
            tracing::debug!(vm_id = %self.state.vm_id, "vCPUs resumed for delivery");
        }
        Ok(())
    }

    /// Halt the guest again if the current wait wants it halted.
    pub(crate) async fn close_delivery_window(&mut self) -> std::result::Result<(), RuntimeError> {
        if self.state.lifecycle == LifecycleState::LlmWaiting
            && self.state.pause_on_wait
            && !self.vcpus_paused
        {
            self.vcpu.pause().await.map_err(RuntimeError::PauseFailed)?;
            self.vcpus_paused = true;
            tracing::debug!(vm_id = %self.state.vm_id, "vCPUs paused after delivery");
        }
        Ok(())
    }

    async fn send_resume_notice(&self) {
        let notice = async {
            let frame = encode_line(&HostMessage::Resume)?;
            let mut stream = self.transport.connect(self.quiescence_port).await?;
            stream.write_all(&frame).await?;
            stream.flush().await?;
            Ok::<(), Error>(())
        };
        match tokio::time::timeout(self.notice_timeout, notice).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(vm_id = %self.state.vm_id, error = %e, "failed to send resume notice")
            }
            Err(_) => tracing::warn!(vm_id = %self.state.vm_id, "resume notice timed out"),
        }
    }
}

impl std::fmt::Debug for VmRuntimeStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmRuntimeStateMachine")
            .field("state", &self.state)
            .field("reclaim", &self.reclaim)
            .field("vcpus_paused", &self.vcpus_paused)
            .field("quiesced", &self.quiesced)
            .finish_non_exhaustive()
    }
}

/// Ask the guest agent to quiesce and wait for its acknowledgement.
///
/// Connection failures are retried until `timeout`, since the agent may not
/// be listening yet.
async fn quiesce_guest(
    transport: &dyn GuestTransport,
    port: u32,
    timeout: Duration,
) -> std::result::Result<(), RuntimeError> {
    let exchange = async {
        let stream = loop {
            match transport.connect(port).await {
                Ok(stream) => break stream,
                Err(e) => {
                    tracing::debug!(port, error = %e, "quiescence listener not reachable yet");
                    tokio::time::sleep(QUIESCE_CONNECT_INTERVAL).await;
                }
            }
        };
        exchange_quiesce(stream).await
    };

    match tokio::time::timeout(timeout, exchange).await {
        Err(_) => Err(RuntimeError::QuiescenceTimeout(timeout)),
        Ok(Ok(GuestMessage::Quiesced)) => Ok(()),
        Ok(Ok(GuestMessage::Error { message })) => Err(RuntimeError::QuiescenceFailed(message)),
        Ok(Err(e)) => Err(RuntimeError::QuiescenceFailed(e.to_string())),
    }
}

async fn exchange_quiesce(mut stream: GuestStream) -> Result<GuestMessage> {
    stream.write_all(&encode_line(&HostMessage::Quiesce)?).await?;
    stream.flush().await?;

    let mut reader = BufReader::new(stream).take(MAX_FRAME_SIZE as u64);
    let mut line = Vec::new();
    if reader.read_until(b'\n', &mut line).await? == 0 {
        return Err(Error::protocol("guest closed the quiescence stream"));
    }
    Ok(decode_line(&line)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::state::ExpectedResponse;
    use crate::runtime::testing::{fast_runtime, machine_for, Convergence, FakeVm, QuiesceMode};

    fn wait_options(target_mib: Option<u32>) -> SetStateOptions {
        SetStateOptions {
            pause_on_wait: true,
            target_balloon_mib: target_mib,
            acknowledge_on_stop: true,
            expect: None,
        }
    }

    #[tokio::test]
    async fn test_wait_applies_effects_in_order() {
        let vm = FakeVm::new(2);
        let mut machine = machine_for(&vm, &fast_runtime());

        let state = machine
            .set_state(RuntimeTarget::LlmWaiting, wait_options(Some(128)))
            .await
            .unwrap();
        assert_eq!(state.lifecycle, LifecycleState::LlmWaiting);
        assert_eq!(state.balloon_target_mib, Some(128));
        assert!(machine.vcpus_paused());
        assert_eq!(machine.balloon_amount(), 128);
        assert_eq!(
            vm.calls(),
            vec!["quiesce", "balloon.set:128", "reclaim:126", "vcpu.pause"]
        );
    }

    #[tokio::test]
    async fn test_resume_reverses_effects() {
        let vm = FakeVm::new(2);
        let mut machine = machine_for(&vm, &fast_runtime());
        machine
            .set_state(RuntimeTarget::LlmWaiting, wait_options(Some(128)))
            .await
            .unwrap();
        vm.clear_calls();

        let state = machine
            .set_state(RuntimeTarget::Running, SetStateOptions::default())
            .await
            .unwrap();
        assert_eq!(state.lifecycle, LifecycleState::Running);
        assert_eq!(state.balloon_target_mib, None);
        assert!(!machine.vcpus_paused());
        assert_eq!(machine.balloon_amount(), 2);
        assert_eq!(vm.calls(), vec!["vcpu.resume", "balloon.set:2", "notice:resume"]);
    }

    #[tokio::test]
    async fn test_same_state_is_noop() {
        let vm = FakeVm::new(2);
        let mut machine = machine_for(&vm, &fast_runtime());

        let state = machine
            .set_state(RuntimeTarget::Running, SetStateOptions::default())
            .await
            .unwrap();
        assert_eq!(state.lifecycle, LifecycleState::Running);
        assert!(vm.calls().is_empty());
    }

    #[tokio::test]
    async fn test_running_with_wait_options_is_invalid() {
        let vm = FakeVm::new(2);
        let mut machine = machine_for(&vm, &fast_runtime());

        let err = machine
            .set_state(RuntimeTarget::Running, wait_options(None))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn test_balloon_target_bounds() {
        let vm = FakeVm::new(2);
        let mut machine = machine_for(&vm, &fast_runtime());

        for target in [1, 256, 300] {
            let options = SetStateOptions {
                target_balloon_mib: Some(target),
                ..Default::default()
            };
            let err = machine
                .set_state(RuntimeTarget::LlmWaiting, options)
                .await
                .unwrap_err();
            assert!(matches!(err, RuntimeError::InvalidTransition(_)), "{target}");
        }
        assert_eq!(machine.state().lifecycle, LifecycleState::Running);
        assert!(vm.calls().is_empty());
    }

    #[tokio::test]
    async fn test_empty_expected_request_id_is_invalid() {
        let vm = FakeVm::new(2);
        let mut machine = machine_for(&vm, &fast_runtime());
        let options = SetStateOptions {
            expect: Some(ExpectedResponse {
                request_id: String::new(),
                vsock_port: 11000,
                resume_on_delivery: false,
            }),
            ..Default::default()
        };
        assert!(matches!(
            machine.set_state(RuntimeTarget::LlmWaiting, options).await,
            Err(RuntimeError::InvalidTransition(_))
        ));
    }

    #[tokio::test]
    async fn test_partial_inflate_rolls_back_quiescence() {
        let vm = FakeVm::new(2);
        vm.set_convergence(Convergence::Stall(64));
        let mut machine = machine_for(&vm, &fast_runtime());

        let err = machine
            .set_state(RuntimeTarget::LlmWaiting, wait_options(Some(128)))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::ReclaimFailed(_)), "{err}");
        assert_eq!(machine.state().lifecycle, LifecycleState::Running);
        assert!(!machine.vcpus_paused());
        assert_eq!(machine.balloon_amount(), 2);

        let calls = vm.calls();
        assert_eq!(calls.first().map(String::as_str), Some("quiesce"));
        assert!(!calls.contains(&"vcpu.pause".to_string()));
        assert!(!calls.iter().any(|c| c.starts_with("reclaim:")));
        assert_eq!(calls.last().map(String::as_str), Some("notice:resume"));
    }

    #[tokio::test]
    async fn test_pause_failure_restores_balloon() {
        let vm = FakeVm::new(2);
        vm.fail_next("vcpu.pause");
        let mut machine = machine_for(&vm, &fast_runtime());

        let err = machine
            .set_state(RuntimeTarget::LlmWaiting, wait_options(Some(128)))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::PauseFailed(_)));
        assert_eq!(machine.state().lifecycle, LifecycleState::Running);
        assert_eq!(machine.balloon_amount(), 2);
        assert_eq!(vm.balloon_target(), 2);
    }

    #[tokio::test]
    async fn test_silent_guest_times_out() {
        let vm = FakeVm::new(2);
        vm.set_quiesce_mode(QuiesceMode::Silent);
        let mut machine = machine_for(&vm, &fast_runtime());

        let err = machine
            .set_state(RuntimeTarget::LlmWaiting, wait_options(Some(128)))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::QuiescenceTimeout(_)));
        assert_eq!(machine.state().lifecycle, LifecycleState::Running);
        assert_eq!(vm.calls(), vec!["quiesce", "notice:resume"]);
    }

    #[tokio::test]
    async fn test_supersede_during_quiescence_releases_guest() {
        let vm = FakeVm::new(2);
        vm.set_quiesce_mode(QuiesceMode::Silent);
        let mut runtime = fast_runtime();
        runtime.quiescence_timeout = Duration::from_secs(30);
        let mut machine = machine_for(&vm, &runtime);
        let signal = Arc::clone(&machine.supersede);

        let raise = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            signal.raise()
        };
        let (result, guard) = tokio::join!(
            machine.set_state(RuntimeTarget::LlmWaiting, wait_options(Some(128))),
            raise
        );
        drop(guard);

        assert!(matches!(result, Err(RuntimeError::Superseded)));
        assert_eq!(machine.state().lifecycle, LifecycleState::Running);
        // The late-quiescing guest is told to carry on
        assert_eq!(vm.calls(), vec!["quiesce", "notice:resume"]);

        let state = machine
            .set_state(RuntimeTarget::Running, SetStateOptions::default())
            .await
            .unwrap();
        assert_eq!(state.lifecycle, LifecycleState::Running);
        assert_eq!(vm.calls(), vec!["quiesce", "notice:resume"]);
    }

    #[tokio::test]
    async fn test_guest_refusal_is_reported() {
        let vm = FakeVm::new(2);
        vm.set_quiesce_mode(QuiesceMode::Refuse("busy".into()));
        let mut machine = machine_for(&vm, &fast_runtime());

        let err = machine
            .set_state(RuntimeTarget::LlmWaiting, wait_options(None))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::QuiescenceFailed(ref m) if m == "busy"));
    }

    #[tokio::test]
    async fn test_failed_resume_keeps_waiting() {
        let vm = FakeVm::new(2);
        let mut machine = machine_for(&vm, &fast_runtime());
        machine
            .set_state(RuntimeTarget::LlmWaiting, wait_options(Some(128)))
            .await
            .unwrap();

        vm.fail_next("balloon.set");
        let err = machine
            .set_state(RuntimeTarget::Running, SetStateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::ReclaimFailed(_)));
        assert_eq!(machine.state().lifecycle, LifecycleState::LlmWaiting);
        assert!(machine.vcpus_paused());
        assert_eq!(machine.balloon_amount(), 128);
    }

    #[tokio::test]
    async fn test_supersede_aborts_inflation() {
        let vm = FakeVm::new(2);
        vm.set_convergence(Convergence::Manual);
        let mut runtime = fast_runtime();
        runtime.balloon_convergence_timeout = Duration::from_secs(30);
        let mut machine = machine_for(&vm, &runtime);
        let signal = Arc::clone(&machine.supersede);

        let raise = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            signal.raise()
        };
        let (result, _guard) = tokio::join!(
            machine.set_state(RuntimeTarget::LlmWaiting, wait_options(Some(128))),
            raise
        );

        assert!(matches!(result, Err(RuntimeError::Superseded)));
        assert_eq!(machine.state().lifecycle, LifecycleState::Running);
        assert_eq!(vm.balloon_target(), 2);
        assert!(!machine.vcpus_paused());
    }

    #[tokio::test]
    async fn test_delivery_window_repauses_waiting_vm() {
        let vm = FakeVm::new(2);
        let mut machine = machine_for(&vm, &fast_runtime());
        machine
            .set_state(RuntimeTarget::LlmWaiting, wait_options(None))
            .await
            .unwrap();
        vm.clear_calls();

        machine.open_delivery_window().await.unwrap();
        assert!(!machine.vcpus_paused());
        machine.close_delivery_window().await.unwrap();
        assert!(machine.vcpus_paused());
        assert_eq!(vm.calls(), vec!["vcpu.resume", "vcpu.pause"]);
    }

    #[tokio::test]
    async fn test_supersede_signal_wakes_waiter() {
        let signal = Arc::new(SupersedeSignal::default());
        assert!(!signal.is_raised());

        let waiter = {
            let signal = Arc::clone(&signal);
            tokio::spawn(async move { signal.raised().await })
        };
        let guard = signal.raise();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();

        drop(guard);
        assert!(!signal.is_raised());
    }
}
