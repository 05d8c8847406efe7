//! Periodic queue health checks.
//!
//! Per queue: read counts, prune the oldest failed jobs once the failed set
//! grows past its threshold, and force-requeue active jobs that have been
//! running far longer than any handler should. A failing check on one queue
//! does not affect the others.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};

use courier_core::{Clock, SystemClock};

use crate::backend::{BackendError, QueueBackend};
use crate::registry::QueueManager;
use crate::types::{JobCounts, JobId, JobState};

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub interval: Duration,
    /// Failed jobs kept before pruning kicks in.
    pub max_failed: usize,
    /// Active count above which active jobs are scanned for overruns.
    pub max_active: usize,
    /// Processing time after which an active job is forced back to waiting.
    pub active_timeout: Duration,
    /// Upper bound on active jobs inspected per pass.
    pub scan_limit: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(120),
            max_failed: 100,
            max_active: 50,
            active_timeout: Duration::from_secs(300),
            scan_limit: 1000,
        }
    }
}

/// Result of checking one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueHealth {
    pub counts: JobCounts,
    pub pruned: usize,
    pub requeued: Vec<JobId>,
}

#[derive(Debug, Clone)]
pub struct HealthReport {
    pub queue: &'static str,
    pub outcome: Result<QueueHealth, BackendError>,
}

pub struct HealthMonitor {
    manager: Arc<QueueManager>,
    clock: Arc<dyn Clock>,
    config: HealthConfig,
}

impl HealthMonitor {
    pub fn new(manager: Arc<QueueManager>, config: HealthConfig) -> Self {
        Self::with_clock(manager, config, Arc::new(SystemClock))
    }

    pub fn with_clock(manager: Arc<QueueManager>, config: HealthConfig, clock: Arc<dyn Clock>) -> Self {
        Self { manager, clock, config }
    }

    /// Check every defined queue once.
    pub async fn check_all(&self) -> Vec<HealthReport> {
        let backend = self.manager.backend();
        let mut reports = Vec::new();
        for queue in self.manager.queue_names() {
            let outcome = self.check_queue(backend.as_ref(), queue).await;
            match &outcome {
                Ok(health) => info!(
                    queue,
                    waiting = health.counts.waiting,
                    delayed = health.counts.delayed,
                    active = health.counts.active,
                    completed = health.counts.completed,
                    failed = health.counts.failed,
                    pruned = health.pruned,
                    requeued = health.requeued.len(),
                    "queue health"
                ),
                Err(e) => warn!(queue, error = %e, "queue health check failed"),
            }
            reports.push(HealthReport { queue, outcome });
        }
        reports
    }

    async fn check_queue(&self, backend: &dyn QueueBackend, queue: &'static str) -> Result<QueueHealth, BackendError> {
        let counts = backend.counts(queue).await?;

        let mut pruned = 0;
        if counts.failed > self.config.max_failed {
            let excess = counts.failed - self.config.max_failed;
            pruned = backend.clean(queue, JobState::Failed, Duration::ZERO, excess).await?;
        }

        let mut requeued = Vec::new();
        if counts.active > self.config.max_active {
            let cutoff = self.clock.now() - chrono::Duration::from_std(self.config.active_timeout).unwrap_or_default();
            let active = backend.list(queue, &[JobState::Active], self.config.scan_limit).await?;
            for job in active {
                let overran = job.processed_on.is_some_and(|started| started < cutoff);
                if !overran {
                    continue;
                }
                match backend.move_to_waiting(queue, &job.id).await {
                    Ok(true) => {
                        warn!(queue, job_id = %job.id, "requeued overrunning active job");
                        requeued.push(job.id);
                    }
                    Ok(false) => {}
                    Err(e) => warn!(queue, job_id = %job.id, error = %e, "failed to requeue active job"),
                }
            }
        }

        Ok(QueueHealth { counts, pruned, requeued })
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(
            async move {
                let start = tokio::time::Instant::now() + self.config.interval;
                let mut interval = tokio::time::interval_at(start, self.config.interval);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = interval.tick() => {
                            self.check_all().await;
                        }
                    }
                }
            }
            .instrument(info_span!("health-monitor")),
        )
    }
}
