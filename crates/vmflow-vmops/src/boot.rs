//! Boot-readiness polling
//!
//! After power-on the VM takes a while to show up as running. The
//! poller checks the power state at a short fixed interval until it
//! observes running or the wall-clock deadline passes. The deadline is
//! returned as a value, not raised: the spawn workflow logs it and
//! carries on, since a slow boot is not proof of a failed one.

use crate::config::VmOpsConfig;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};
use vmflow_backend::VirtualizationBackend;
use vmflow_types::VmRef;

/// Time source for the poller, injectable so tests simulate elapsed
/// time without real delays.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    async fn sleep(&self, duration: Duration);
}

/// Real wall clock backed by the tokio timer
#[derive(Debug, Default, Clone)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// The VM was not observed running before the deadline. Documented as
/// non-fatal: callers continue and leave the instance in whatever state
/// it reaches on its own.
#[derive(Debug, Error)]
#[error("VM not running after {0:?}")]
pub struct BootTimeout(pub Duration);

/// Bounded-time wait for a VM to reach the running power state
pub struct BootReadinessPoller {
    backend: Arc<dyn VirtualizationBackend>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    timeout: Duration,
}

impl BootReadinessPoller {
    pub fn new(backend: Arc<dyn VirtualizationBackend>, config: &VmOpsConfig) -> Self {
        Self {
            backend,
            clock: Arc::new(TokioClock),
            interval: config.boot_poll_interval,
            timeout: config.running_timeout,
        }
    }

    /// Substitute the time source
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Poll until the VM is running or the deadline passes. Yields to
    /// the runtime between polls, so concurrent workflows keep making
    /// progress.
    pub async fn await_running(&self, vm: &VmRef) -> Result<(), BootTimeout> {
        let deadline = self.clock.now() + self.timeout;
        loop {
            match self.backend.power_state(vm).await {
                Ok(state) if state.is_running() => {
                    debug!(vm = %vm, "VM reached running state");
                    return Ok(());
                }
                Ok(state) => {
                    debug!(vm = %vm, ?state, "VM not yet running");
                }
                // Transient query failures count as "not yet running"
                Err(e) => {
                    warn!(vm = %vm, error = %e, "Power state query failed during boot wait");
                }
            }
            if self.clock.now() >= deadline {
                return Err(BootTimeout(self.timeout));
            }
            self.clock.sleep(self.interval).await;
        }
    }
}
