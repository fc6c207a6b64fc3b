//! Per-VM memory reclaim coordination.
//!
//! Sequences balloon inflation with host-side page reclaim: the host hint is
//! only issued once the guest driver has actually handed the pages back.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use crate::config::RuntimeConfig;
use crate::error::Error;
use crate::vm::{BalloonDevice, PageReclaimer, ReclaimHint, VmId};

/// Memory reclaim failures.
#[derive(Debug, Error)]
pub enum ReclaimError {
    /// The balloon did not reach its inflation target in time.
    #[error("balloon reached {achieved} MiB of {target} MiB before the convergence timeout")]
    PartialInflate {
        /// Requested size.
        target: u32,
        /// Size reached when the timeout expired.
        achieved: u32,
    },

    /// The balloon did not return to its baseline in time.
    #[error("balloon still at {achieved} MiB, expected {target} MiB, after the convergence timeout")]
    PartialDeflate {
        /// Baseline size.
        target: u32,
        /// Size reached when the timeout expired.
        achieved: u32,
    },

    /// The balloon device rejected a request.
    #[error("balloon device: {0}")]
    Device(#[source] Error),

    /// The host rejected the reclaim hint.
    #[error("host reclaim: {0}")]
    Hint(#[source] Error),
}

/// Drives one VM's balloon and host reclaim.
pub struct MemoryReclaimCoordinator {
    vm_id: VmId,
    balloon: Arc<dyn BalloonDevice>,
    reclaimer: Arc<dyn PageReclaimer>,
    baseline_mib: u32,
    committed_mib: u32,
    convergence_timeout: Duration,
    poll_interval: Duration,
}

impl MemoryReclaimCoordinator {
    /// Create a coordinator whose balloon currently sits at `baseline_mib`.
    pub fn new(
        vm_id: VmId,
        balloon: Arc<dyn BalloonDevice>,
        reclaimer: Arc<dyn PageReclaimer>,
        baseline_mib: u32,
        runtime: &RuntimeConfig,
    ) -> Self {
        Self {
            vm_id,
            balloon,
            reclaimer,
            baseline_mib,
            committed_mib: baseline_mib,
            convergence_timeout: runtime.balloon_convergence_timeout,
            poll_interval: runtime.balloon_poll_interval,
        }
    }

    /// Balloon size restored after a wait.
    pub fn baseline_mib(&self) -> u32 {
        self.baseline_mib
    }

    /// Last committed balloon target.
    pub fn current_amount(&self) -> u32 {
        self.committed_mib
    }

    /// Inflate the balloon to `target_mib` and hint the host to reclaim the
    /// freed memory.
    ///
    /// Returns the MiB freed by this inflation. The target is committed only
    /// once the balloon converged; a host hint failure after convergence
    /// still leaves the new target committed.
    pub async fn inflate(&mut self, target_mib: u32) -> Result<u32, ReclaimError> {
        let previous = self.committed_mib;
        if target_mib <= previous {
            return Ok(0);
        }

        self.balloon
            .set_target_mib(target_mib)
            .await
            .map_err(ReclaimError::Device)?;

        if let Err(achieved) = self.converge(|actual| actual >= target_mib).await? {
            tracing::warn!(
                vm_id = %self.vm_id,
                target_mib,
                achieved_mib = achieved,
                "balloon inflation did not converge"
            );
            return Err(ReclaimError::PartialInflate {
                target: target_mib,
                achieved,
            });
        }
        self.committed_mib = target_mib;

        let freed_mib = target_mib - previous;
        self.reclaimer
            .reclaim(ReclaimHint {
                freed_mib,
                balloon_mib: target_mib,
            })
            .await
            .map_err(ReclaimError::Hint)?;

        tracing::info!(vm_id = %self.vm_id, target_mib, freed_mib, "balloon inflated");
        Ok(freed_mib)
    }

    /// Return the balloon to its baseline.
    ///
    /// On failure the previous target is requested again and the committed
    /// amount is left unchanged.
    pub async fn deflate(&mut self) -> Result<(), ReclaimError> {
        let previous = self.committed_mib;
        let baseline = self.baseline_mib;

        let result = match self.balloon.set_target_mib(baseline).await {
            Ok(()) => match self.converge(|actual| actual <= baseline).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(achieved)) => Err(ReclaimError::PartialDeflate {
                    target: baseline,
                    achieved,
                }),
                Err(e) => Err(e),
            },
            Err(e) => Err(ReclaimError::Device(e)),
        };

        match result {
            Ok(()) => {
                self.committed_mib = baseline;
                tracing::info!(vm_id = %self.vm_id, baseline_mib = baseline, "balloon deflated");
                Ok(())
            }
            Err(e) => {
                if previous != baseline {
                    if let Err(restore) = self.balloon.set_target_mib(previous).await {
                        tracing::warn!(
                            vm_id = %self.vm_id,
                            target_mib = previous,
                            error = %restore,
                            "failed to restore balloon target"
                        );
                    }
                }
                Err(e)
            }
        }
    }

    /// Poll the achieved balloon size until `reached` holds or the
    /// convergence timeout expires. The inner `Err` carries the last size
    /// observed.
    async fn converge(
        &self,
        reached: impl Fn(u32) -> bool,
    ) -> Result<Result<(), u32>, ReclaimError> {
        let deadline = Instant::now() + self.convergence_timeout;
        loop {
            let actual = self.balloon.actual_mib().await.map_err(ReclaimError::Device)?;
            if reached(actual) {
                return Ok(Ok(()));
            }
            if Instant::now() >= deadline {
                return Ok(Err(actual));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

impl std::fmt::Debug for MemoryReclaimCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryReclaimCoordinator")
            .field("vm_id", &self.vm_id)
            .field("baseline_mib", &self.baseline_mib)
            .field("committed_mib", &self.committed_mib)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testing::{fast_runtime, Convergence, FakeVm};

    fn coordinator(vm: &FakeVm) -> MemoryReclaimCoordinator {
        let backends = vm.backends();
        MemoryReclaimCoordinator::new(
            VmId::new("vm1"),
            backends.balloon,
            backends.reclaimer,
            2,
            &fast_runtime(),
        )
    }

    #[tokio::test]
    async fn test_inflate_commits_then_hints() {
        let vm = FakeVm::new(2);
        let mut coord = coordinator(&vm);

        assert_eq!(coord.inflate(128).await.unwrap(), 126);
        assert_eq!(coord.current_amount(), 128);
        assert_eq!(vm.balloon_target(), 128);
        assert_eq!(
            vm.reclaim_hints(),
            vec![ReclaimHint {
                freed_mib: 126,
                balloon_mib: 128
            }]
        );
        let calls = vm.calls();
        let set = calls.iter().position(|c| c == "balloon.set:128").unwrap();
        let hint = calls.iter().position(|c| c == "reclaim:126").unwrap();
        assert!(set < hint);
    }

    #[tokio::test]
    async fn test_partial_inflate_skips_hint() {
        let vm = FakeVm::new(2);
        vm.set_convergence(Convergence::Stall(64));
        let mut coord = coordinator(&vm);

        let err = coord.inflate(128).await.unwrap_err();
        assert!(matches!(
            err,
            ReclaimError::PartialInflate {
                target: 128,
                achieved: 64
            }
        ));
        assert_eq!(coord.current_amount(), 2);
        assert!(vm.reclaim_hints().is_empty());
    }

    #[tokio::test]
    async fn test_hint_failure_keeps_commit() {
        let vm = FakeVm::new(2);
        vm.fail_next("reclaim");
        let mut coord = coordinator(&vm);

        assert!(matches!(coord.inflate(64).await, Err(ReclaimError::Hint(_))));
        assert_eq!(coord.current_amount(), 64);
    }

    #[tokio::test]
    async fn test_deflate_returns_to_baseline() {
        let vm = FakeVm::new(2);
        let mut coord = coordinator(&vm);
        coord.inflate(128).await.unwrap();

        coord.deflate().await.unwrap();
        assert_eq!(coord.current_amount(), 2);
        assert_eq!(vm.balloon_target(), 2);
    }

    #[tokio::test]
    async fn test_failed_deflate_restores_previous_target() {
        let vm = FakeVm::new(2);
        let mut coord = coordinator(&vm);
        coord.inflate(128).await.unwrap();

        vm.set_convergence(Convergence::Stall(100));
        let err = coord.deflate().await.unwrap_err();
        assert!(matches!(err, ReclaimError::PartialDeflate { target: 2, .. }));
        assert_eq!(coord.current_amount(), 128);
        assert_eq!(vm.balloon_target(), 128);
    }

    #[tokio::test]
    async fn test_inflate_to_current_amount_is_noop() {
        let vm = FakeVm::new(2);
        let mut coord = coordinator(&vm);
        assert_eq!(coord.inflate(2).await.unwrap(), 0);
        assert!(vm.calls().is_empty());
    }
}
