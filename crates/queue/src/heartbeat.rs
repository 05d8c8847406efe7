//! Liveness heartbeat: probe the backend, restart dead workers.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, warn};

use crate::registry::QueueManager;

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub interval: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
        }
    }
}

/// Outcome of one heartbeat tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeartbeatReport {
    pub backend_ok: bool,
    pub restarted: Vec<&'static str>,
}

/// Periodic liveness check. Never touches job state.
pub struct Heartbeat {
    manager: Arc<QueueManager>,
    config: HeartbeatConfig,
}

impl Heartbeat {
    pub fn new(manager: Arc<QueueManager>, config: HeartbeatConfig) -> Self {
        Self { manager, config }
    }

    /// One probe-and-restart pass. Probe failures are logged, not returned.
    pub async fn tick(&self) -> HeartbeatReport {
        let backend_ok = match self.manager.backend().ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "heartbeat: backend ping failed");
                false
            }
        };

        let restarted = self.manager.restart_dead_workers();
        if !restarted.is_empty() {
            warn!(queues = ?restarted, "heartbeat: restarted workers");
        }
        debug!(backend_ok, "heartbeat");

        HeartbeatReport { backend_ok, restarted }
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(
            async move {
                let mut interval = tokio::time::interval(self.config.interval);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                // First tick fires immediately; workers were just started.
                interval.tick().await;

                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = interval.tick() => {
                            self.tick().await;
                        }
                    }
                }
            }
            .instrument(info_span!("heartbeat")),
        )
    }
}
