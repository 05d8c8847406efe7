//! Queue worker: claims jobs, runs the handler, settles the outcome.
//!
//! One worker serves one queue. It keeps up to `concurrency` jobs in flight,
//! renews each job's lease at half the lock duration while its handler runs, and
//! periodically sweeps the queue for jobs whose lease lapsed (crashed or wedged
//! workers). Handler panics are caught and recorded as failed attempts.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use rand::Rng;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::backend::{BackendError, QueueBackend};
use crate::job::{JobContext, JobError, JobHandler, QueueJob, decode};
use crate::types::{ClaimedJob, FailOutcome};

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Maximum jobs in flight.
    pub concurrency: usize,
    /// Lease length; renewed at half this while a handler runs.
    pub lock_duration: Duration,
    /// How often to sweep for lapsed leases.
    pub stalled_interval: Duration,
    /// Lease lapses tolerated before a job is failed.
    pub max_stalled: u32,
    /// Idle poll interval (jittered ±20%).
    pub poll_interval: Duration,
    /// How long shutdown waits for in-flight jobs before aborting them.
    pub drain_timeout: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            lock_duration: Duration::from_secs(120),
            stalled_interval: Duration::from_secs(120),
            max_stalled: 3,
            poll_interval: Duration::from_millis(500),
            drain_timeout: Duration::from_secs(4),
        }
    }
}

impl WorkerOptions {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_lock_duration(mut self, lock_duration: Duration) -> Self {
        self.lock_duration = lock_duration;
        self
    }
}

/// Handle to a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    queue: &'static str,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn queue(&self) -> &'static str {
        self.queue
    }

    /// False once the worker loop has exited (stopped or crashed).
    pub fn is_running(&self) -> bool {
        !self.join.is_finished()
    }

    /// Stop claiming new jobs. In-flight jobs keep running until drained.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Stop and wait up to `timeout` for the loop to drain. Returns false if it
    /// had to be aborted.
    pub async fn shutdown(mut self, timeout: Duration) -> bool {
        self.cancel.cancel();
        match tokio::time::timeout(timeout, &mut self.join).await {
            Ok(_) => true,
            Err(_) => {
                warn!(queue = self.queue, "worker did not drain in time; aborting");
                self.join.abort();
                false
            }
        }
    }
}

/// A worker bound to one job family and its handler.
pub struct Worker<J: QueueJob, H: JobHandler<J>> {
    backend: Arc<dyn QueueBackend>,
    handler: Arc<H>,
    opts: WorkerOptions,
    _job: std::marker::PhantomData<fn() -> J>,
}

impl<J: QueueJob, H: JobHandler<J>> Worker<J, H> {
    pub fn new(backend: Arc<dyn QueueBackend>, handler: Arc<H>, opts: WorkerOptions) -> Self {
        Self {
            backend,
            handler,
            opts,
            _job: std::marker::PhantomData,
        }
    }

    /// Spawn the worker loop. `cancel` stops it; cancelling a parent token works too.
    pub fn spawn(self, cancel: CancellationToken) -> WorkerHandle {
        let span = info_span!("worker", queue = J::QUEUE);
        let join = tokio::spawn(self.run(cancel.clone()).instrument(span));
        WorkerHandle {
            queue: J::QUEUE,
            cancel,
            join,
        }
    }

    async fn run(self, cancel: CancellationToken) {
        let queue = J::QUEUE;
        info!(queue, concurrency = self.opts.concurrency, "worker started");

        let stalled = tokio::spawn(
            stalled_loop(self.backend.clone(), queue, self.opts.clone(), cancel.child_token())
                .instrument(info_span!("stalled-checker", queue)),
        );

        let semaphore = Arc::new(Semaphore::new(self.opts.concurrency.max(1)));
        let mut tasks = JoinSet::new();

        loop {
            while tasks.try_join_next().is_some() {}

            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            if cancel.is_cancelled() {
                break;
            }

            match self.backend.claim(queue, self.opts.lock_duration).await {
                Ok(Some(claimed)) => {
                    debug!(queue, job_id = %claimed.job.id, name = %claimed.job.name, "claimed job");
                    let backend = self.backend.clone();
                    let handler = self.handler.clone();
                    let opts = self.opts.clone();
                    let span = info_span!("job", queue, job_id = %claimed.job.id, job_name = %claimed.job.name);
                    tasks.spawn(
                        async move {
                            process::<J, H>(backend, handler, &opts, claimed).await;
                            drop(permit);
                        }
                        .instrument(span),
                    );
                }
                Ok(None) => {
                    drop(permit);
                    idle(&cancel, self.opts.poll_interval).await;
                }
                Err(e) => {
                    drop(permit);
                    log_backend_error(queue, "failed to claim job", &e);
                    idle(&cancel, self.opts.poll_interval).await;
                }
            }
        }

        stalled.abort();

        let in_flight = tasks.len();
        if in_flight > 0 {
            info!(queue, in_flight, "draining in-flight jobs");
            let drained = tokio::time::timeout(self.opts.drain_timeout, async {
                while tasks.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!(queue, remaining = tasks.len(), "drain timed out; aborting in-flight jobs");
                tasks.abort_all();
                while tasks.join_next().await.is_some() {}
            }
        }

        info!(queue, "worker stopped");
    }
}

/// Sleep one jittered poll interval, waking early on cancellation.
async fn idle(cancel: &CancellationToken, poll: Duration) {
    let wait = jittered(poll);
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(wait) => {}
    }
}

fn jittered(base: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.8..1.2);
    base.mul_f64(factor)
}

fn log_backend_error(queue: &str, what: &str, e: &BackendError) {
    if e.is_connection_error() {
        warn!(queue, error = %e, "{what} (backend unreachable)");
    } else {
        error!(queue, error = %e, "{what}");
    }
}

async fn stalled_loop(backend: Arc<dyn QueueBackend>, queue: &'static str, opts: WorkerOptions, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval_at(Instant::now() + opts.stalled_interval, opts.stalled_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        match backend.recover_stalled(queue, opts.max_stalled).await {
            Ok(report) if report.is_empty() => {}
            Ok(report) => warn!(
                queue,
                requeued = report.requeued.len(),
                failed = report.failed.len(),
                "recovered stalled jobs"
            ),
            Err(e) => log_backend_error(queue, "stalled check failed", &e),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Run one claimed job to completion and settle it with the backend.
async fn process<J: QueueJob, H: JobHandler<J>>(
    backend: Arc<dyn QueueBackend>,
    handler: Arc<H>,
    opts: &WorkerOptions,
    claimed: ClaimedJob,
) {
    let ClaimedJob { job, token } = claimed;
    let queue = J::QUEUE;

    let outcome = match decode::<J>(&job.name, &job.data) {
        Err(e) => Err(JobError::permanent(format!("undecodable {} payload: {e}", job.name))),
        Ok(payload) => {
            let ctx = JobContext {
                id: job.id.clone(),
                queue: queue.to_string(),
                name: job.name.clone(),
                attempts_made: job.attempts_made,
                max_attempts: job.opts.attempts,
            };
            let run = AssertUnwindSafe(handler.handle(payload, ctx)).catch_unwind();
            tokio::pin!(run);

            let half = (opts.lock_duration / 2).max(Duration::from_millis(10));
            let mut renew = tokio::time::interval_at(Instant::now() + half, half);
            renew.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    result = &mut run => {
                        break match result {
                            Ok(result) => result,
                            Err(panic) => Err(JobError::retry(anyhow::anyhow!(
                                "handler panicked: {}",
                                panic_message(panic.as_ref())
                            ))),
                        };
                    }
                    _ = renew.tick() => {
                        match backend.extend_lock(queue, &job.id, token, opts.lock_duration).await {
                            Ok(true) => {}
                            Ok(false) => warn!(queue, job_id = %job.id, "lease lost while handler running"),
                            Err(e) => log_backend_error(queue, "failed to renew lease", &e),
                        }
                    }
                }
            }
        }
    };

    let settled = match outcome {
        Ok(()) => backend.complete(queue, &job.id, token).await.map(|_| {
            debug!(queue, job_id = %job.id, "job completed");
        }),
        Err(JobError::Deferred(delay)) => backend.defer(queue, &job.id, token, delay).await.map(|_| {
            info!(queue, job_id = %job.id, delay_secs = delay.as_secs(), "job deferred");
        }),
        Err(JobError::Permanent(reason)) => backend
            .fail(queue, &job.id, token, &reason, false)
            .await
            .map(|_| error!(queue, job_id = %job.id, reason = %reason, "job failed permanently")),
        Err(JobError::Failed(err)) => {
            let reason = format!("{err:#}");
            backend
                .fail(queue, &job.id, token, &reason, true)
                .await
                .map(|outcome| match outcome {
                    FailOutcome::Retrying { attempt, delay } => warn!(
                        queue,
                        job_id = %job.id,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %reason,
                        "job failed; retrying"
                    ),
                    FailOutcome::Failed { attempts } => error!(
                        queue,
                        job_id = %job.id,
                        attempts,
                        error = %reason,
                        "job failed; attempts exhausted"
                    ),
                })
        }
    };

    match settled {
        Ok(()) => {}
        Err(BackendError::LockMismatch(id)) => {
            warn!(queue, job_id = %id, "lease revoked before settling; result discarded")
        }
        Err(e) => log_backend_error(queue, "failed to settle job", &e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_twenty_percent() {
        let base = Duration::from_millis(1000);
        for _ in 0..100 {
            let d = jittered(base);
            assert!(d >= Duration::from_millis(800) && d <= Duration::from_millis(1200));
        }
    }

    #[test]
    fn panic_messages_are_extracted() {
        let p: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(p.as_ref()), "boom");
        let p: Box<dyn Any + Send> = Box::new(String::from("lock lost"));
        assert_eq!(panic_message(p.as_ref()), "lock lost");
    }
}
