//! Process-level supervision: background loops, safety net, orderly shutdown.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};

use crate::heartbeat::{Heartbeat, HeartbeatConfig};
use crate::health::{HealthConfig, HealthMonitor};
use crate::registry::QueueManager;

/// Panic messages containing any of these trigger a stalled-recovery pass.
const RECOVERABLE_MARKERS: [&str; 3] = ["redis", "lock", "connection"];

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub heartbeat: HeartbeatConfig,
    pub health: HealthConfig,
    /// Budget for the whole shutdown sequence.
    pub shutdown_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            heartbeat: HeartbeatConfig::default(),
            health: HealthConfig::default(),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Everything stopped within budget; `aborted_workers` had to be force-closed.
    Completed { aborted_workers: usize },
    /// The budget ran out; the caller should exit hard.
    TimedOut,
}

/// Whether a panic message points at backend/lease/connection trouble.
pub fn is_recoverable_failure(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    RECOVERABLE_MARKERS.iter().any(|m| lower.contains(m))
}

/// Owns the queue manager's long-lived companions.
pub struct Supervisor {
    manager: Arc<QueueManager>,
    config: SupervisorConfig,
    cancel: CancellationToken,
    recovery: Arc<Notify>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Supervisor {
    pub fn new(manager: Arc<QueueManager>, config: SupervisorConfig) -> Self {
        Self {
            manager,
            config,
            cancel: CancellationToken::new(),
            recovery: Arc::new(Notify::new()),
            tasks: Vec::new(),
        }
    }

    pub fn manager(&self) -> &Arc<QueueManager> {
        &self.manager
    }

    /// Token cancelled when shutdown begins.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Start heartbeat, health monitor and the stalled-recovery listener.
    pub fn start(&mut self) {
        let heartbeat = Heartbeat::new(self.manager.clone(), self.config.heartbeat.clone());
        self.tasks.push(("heartbeat", heartbeat.spawn(self.cancel.child_token())));

        let health = HealthMonitor::new(self.manager.clone(), self.config.health.clone());
        self.tasks.push(("health-monitor", health.spawn(self.cancel.child_token())));

        let recovery = spawn_recovery_listener(self.manager.clone(), self.recovery.clone(), self.cancel.child_token());
        self.tasks.push(("stalled-recovery", recovery));

        info!("supervisor started");
    }

    /// Track another background loop; it is given a token that fires on shutdown.
    pub fn spawn_with(&mut self, name: &'static str, spawn: impl FnOnce(CancellationToken) -> JoinHandle<()>) {
        let handle = spawn(self.cancel.child_token());
        self.tasks.push((name, handle));
    }

    /// Ask for an out-of-band stalled-recovery pass.
    pub fn request_recovery(&self) {
        self.recovery.notify_one();
    }

    /// Install a panic hook that logs every panic and requests a stalled-recovery
    /// pass when the panic looks like backend trouble. The previous hook still runs.
    pub fn install_panic_hook(&self) {
        let recovery = self.recovery.clone();
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let message = if let Some(s) = info.payload().downcast_ref::<&str>() {
                (*s).to_string()
            } else if let Some(s) = info.payload().downcast_ref::<String>() {
                s.clone()
            } else {
                String::new()
            };
            let location = info.location().map(|l| l.to_string()).unwrap_or_default();

            if is_recoverable_failure(&message) {
                error!(panic = %message, location = %location, "backend-related panic; scheduling stalled recovery");
                recovery.notify_one();
            } else {
                error!(panic = %message, location = %location, "panic caught by safety net");
            }
            previous(info);
        }));
    }

    /// Stop everything in order: timers, workers (drained then force-closed),
    /// `cleanup`, backend connection. Bounded by the configured timeout.
    pub async fn shutdown<F>(self, cleanup: F) -> ShutdownOutcome
    where
        F: Future<Output = ()>,
    {
        let budget = self.config.shutdown_timeout;
        let manager = self.manager.clone();
        let cancel = self.cancel.clone();
        let tasks = self.tasks;

        let sequence = async move {
            info!("shutdown: stopping timers");
            cancel.cancel();
            for (name, task) in tasks {
                if let Err(e) = task.await {
                    if e.is_panic() {
                        warn!(task = name, "background task had panicked");
                    }
                }
            }

            info!("shutdown: draining workers");
            let aborted_workers = manager.shutdown_workers(budget.mul_f64(0.8)).await;

            info!("shutdown: flushing pending work");
            cleanup.await;

            if let Err(e) = manager.backend().close().await {
                warn!(error = %e, "shutdown: failed to close backend");
            }
            aborted_workers
        };

        match tokio::time::timeout(budget, sequence).await {
            Ok(aborted_workers) => {
                info!(aborted_workers, "shutdown complete");
                ShutdownOutcome::Completed { aborted_workers }
            }
            Err(_) => {
                error!(timeout_ms = budget.as_millis() as u64, "shutdown timed out");
                ShutdownOutcome::TimedOut
            }
        }
    }
}

/// One stalled-recovery pass over every defined queue.
pub async fn recover_all(manager: &QueueManager) -> usize {
    let backend = manager.backend();
    let mut recovered = 0;
    for queue in manager.queue_names() {
        let max_stalled = manager.definition(queue).map(|d| d.worker.max_stalled).unwrap_or(3);
        match backend.recover_stalled(queue, max_stalled).await {
            Ok(report) => {
                recovered += report.requeued.len() + report.failed.len();
                if !report.is_empty() {
                    warn!(
                        queue,
                        requeued = report.requeued.len(),
                        failed = report.failed.len(),
                        "safety net recovered stalled jobs"
                    );
                }
            }
            Err(e) => warn!(queue, error = %e, "safety net stalled recovery failed"),
        }
    }
    recovered
}

fn spawn_recovery_listener(manager: Arc<QueueManager>, recovery: Arc<Notify>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = recovery.notified() => {
                        recover_all(&manager).await;
                    }
                }
            }
        }
        .instrument(info_span!("stalled-recovery")),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_failures_are_detected_case_insensitively() {
        assert!(is_recoverable_failure("Redis connection reset"));
        assert!(is_recoverable_failure("Missing lock for job 42"));
        assert!(is_recoverable_failure("CONNECTION refused"));
        assert!(!is_recoverable_failure("index out of bounds"));
    }
}
