//! Background maintenance for the runtime supervisor.
//!
//! The sweeper periodically drops pending expectations that were never
//! answered, so a caller that crashed mid-wait does not leak entries.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::runtime::RuntimeSupervisor;

/// Periodic pending-request sweeper.
pub struct Sweeper {
    supervisor: Arc<RuntimeSupervisor>,
    interval: Duration,
    pending_ttl: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl Sweeper {
    /// Create a sweeper using the supervisor's runtime settings.
    pub fn new(supervisor: Arc<RuntimeSupervisor>, shutdown_rx: watch::Receiver<bool>) -> Self {
        let runtime = supervisor.runtime_config();
        Self {
            interval: runtime.sweep_interval,
            pending_ttl: runtime.pending_ttl,
            supervisor,
            shutdown_rx,
        }
    }

    /// Run the sweep loop until shutdown is signaled.
    pub async fn run(mut self) {
        if self.pending_ttl.is_zero() {
            tracing::debug!("pending_ttl is zero, sweeper disabled");
            return;
        }

        let mut ticker = tokio::time::interval(self.interval);
        // Don't catch up on missed ticks
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        tracing::info!(
            interval = ?self.interval,
            pending_ttl = ?self.pending_ttl,
            "sweeper started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep();
                }
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        tracing::info!("sweeper shutting down");
                        break;
                    }
                }
            }
        }
    }

    fn sweep(&self) -> usize {
        let dropped = self.supervisor.sweep_stale(self.pending_ttl);
        if dropped > 0 {
            tracing::info!(dropped, "dropped stale pending requests");
        }
        dropped
    }
}
