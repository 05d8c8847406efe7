//! In-memory queue backend for tests/dev.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use courier_core::{Clock, SystemClock};

use super::{BackendError, QueueBackend};
use crate::types::{
    ClaimedJob, FailOutcome, JobCounts, JobId, JobOptions, JobRecord, JobState, LockToken,
    RepeatSpec, RepeatableJob, StalledOutcome, StalledReport,
};

#[derive(Debug, Default)]
struct QueueState {
    jobs: HashMap<JobId, JobRecord>,
    /// Claim order for waiting jobs.
    waiting: VecDeque<JobId>,
    /// Finish order, oldest first.
    completed: VecDeque<JobId>,
    failed: VecDeque<JobId>,
    paused: bool,
    repeatables: BTreeMap<String, RepeatableJob>,
}

impl QueueState {
    fn insert(&mut self, job: JobRecord) -> JobId {
        let id = job.id.clone();
        if job.state == JobState::Waiting {
            self.waiting.push_back(id.clone());
        }
        self.jobs.insert(id.clone(), job);
        id
    }

    fn detach(&mut self, id: &JobId) {
        self.waiting.retain(|j| j != id);
        self.completed.retain(|j| j != id);
        self.failed.retain(|j| j != id);
    }

    /// Promote due delayed jobs, in `run_at` order.
    fn promote_delayed(&mut self, now: DateTime<Utc>) {
        let mut due: Vec<_> = self
            .jobs
            .values()
            .filter(|j| j.state == JobState::Delayed && j.is_ready(now))
            .map(|j| (j.run_at, j.created_at, j.id.clone()))
            .collect();
        due.sort();

        for (_, _, id) in due {
            if let Some(job) = self.jobs.get_mut(&id) {
                job.state = JobState::Waiting;
                self.waiting.push_back(id);
            }
        }
    }

    fn materialise_repeatables(&mut self, queue: &str, now: DateTime<Utc>) {
        let due: Vec<String> = self
            .repeatables
            .values()
            .filter(|r| r.next_run <= now)
            .map(|r| r.key.clone())
            .collect();

        for key in due {
            let Some(rep) = self.repeatables.get_mut(&key) else {
                continue;
            };
            let id = rep.occurrence_id();
            let mut job = JobRecord::new(queue, &rep.name, rep.data.clone(), rep.opts.clone(), now);
            job.id = id.clone();
            job.state = JobState::Waiting;
            job.run_at = now;
            job.repeat_key = Some(key.clone());
            rep.advance(now);

            if !self.jobs.contains_key(&id) {
                self.insert(job);
            }
        }
    }

    /// Drop the oldest finished jobs beyond the retention count.
    fn trim(&mut self, state: JobState, keep: usize) {
        let list = match state {
            JobState::Completed => &mut self.completed,
            JobState::Failed => &mut self.failed,
            _ => return,
        };
        while list.len() > keep {
            if let Some(id) = list.pop_front() {
                self.jobs.remove(&id);
            }
        }
    }

    fn finish(&mut self, id: &JobId) {
        let Some(job) = self.jobs.get(id) else {
            return;
        };
        let (state, keep) = match job.state {
            JobState::Completed => (JobState::Completed, job.opts.keep_completed),
            JobState::Failed => (JobState::Failed, job.opts.keep_failed),
            _ => return,
        };
        match state {
            JobState::Completed => self.completed.push_back(id.clone()),
            _ => self.failed.push_back(id.clone()),
        }
        self.trim(state, keep);
    }
}

/// In-memory backend.
///
/// Time is read from an injectable [`Clock`] so tests can step through delays,
/// lease expiry and repeatable intervals without sleeping.
pub struct InMemoryBackend {
    clock: Arc<dyn Clock>,
    queues: Mutex<HashMap<String, QueueState>>,
    available: AtomicBool,
    closed: AtomicBool,
}

impl std::fmt::Debug for InMemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBackend")
            .field("available", &self.available.load(Ordering::Relaxed))
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            queues: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Simulate the backing store going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn guard(&self) -> Result<MutexGuard<'_, HashMap<String, QueueState>>, BackendError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BackendError::Closed);
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("in-memory backend marked unavailable".into()));
        }
        self.queues
            .lock()
            .map_err(|_| BackendError::Command("queue state lock poisoned".into()))
    }

    fn with_queue<T>(
        &self,
        queue: &str,
        f: impl FnOnce(&mut QueueState, DateTime<Utc>) -> Result<T, BackendError>,
    ) -> Result<T, BackendError> {
        let now = self.clock.now();
        let mut queues = self.guard()?;
        let state = queues.entry(queue.to_string()).or_default();
        f(state, now)
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn leased<'a>(
    state: &'a mut QueueState,
    id: &JobId,
    token: LockToken,
) -> Result<&'a mut JobRecord, BackendError> {
    match state.jobs.get_mut(id) {
        Some(job) if job.holds_lease(token) => Ok(job),
        Some(_) => Err(BackendError::LockMismatch(id.clone())),
        None => Err(BackendError::NotFound(id.clone())),
    }
}

#[async_trait]
impl QueueBackend for InMemoryBackend {
    async fn ping(&self) -> Result<(), BackendError> {
        self.guard().map(|_| ())
    }

    async fn add(
        &self,
        queue: &str,
        name: &str,
        data: JsonValue,
        opts: JobOptions,
    ) -> Result<JobId, BackendError> {
        self.with_queue(queue, |state, now| {
            if let Some(id) = &opts.job_id {
                if let Some(existing) = state.jobs.get(id) {
                    if !existing.state.is_finished() {
                        return Ok(id.clone());
                    }
                    state.detach(id);
                    state.jobs.remove(id);
                }
            }
            Ok(state.insert(JobRecord::new(queue, name, data, opts, now)))
        })
    }

    async fn claim(&self, queue: &str, lock_for: Duration) -> Result<Option<ClaimedJob>, BackendError> {
        self.with_queue(queue, |state, now| {
            state.promote_delayed(now);
            if state.paused {
                return Ok(None);
            }
            state.materialise_repeatables(queue, now);

            while let Some(id) = state.waiting.pop_front() {
                let Some(job) = state.jobs.get_mut(&id) else {
                    continue;
                };
                if job.state != JobState::Waiting {
                    continue;
                }
                let token = job.mark_active(now, lock_for);
                return Ok(Some(ClaimedJob {
                    job: job.clone(),
                    token,
                }));
            }
            Ok(None)
        })
    }

    async fn extend_lock(
        &self,
        queue: &str,
        id: &JobId,
        token: LockToken,
        lock_for: Duration,
    ) -> Result<bool, BackendError> {
        self.with_queue(queue, |state, now| {
            Ok(match state.jobs.get_mut(id) {
                Some(job) if job.holds_lease(token) => {
                    job.lock = Some(crate::types::JobLock {
                        token,
                        expires_at: now + chrono::Duration::from_std(lock_for).unwrap_or_default(),
                    });
                    true
                }
                _ => false,
            })
        })
    }

    async fn complete(&self, queue: &str, id: &JobId, token: LockToken) -> Result<(), BackendError> {
        self.with_queue(queue, |state, now| {
            leased(state, id, token)?.mark_completed(now);
            state.finish(id);
            Ok(())
        })
    }

    async fn fail(
        &self,
        queue: &str,
        id: &JobId,
        token: LockToken,
        reason: &str,
        retry: bool,
    ) -> Result<FailOutcome, BackendError> {
        self.with_queue(queue, |state, now| {
            let outcome = leased(state, id, token)?.mark_failed(reason.to_string(), retry, now);
            state.finish(id);
            Ok(outcome)
        })
    }

    async fn defer(
        &self,
        queue: &str,
        id: &JobId,
        token: LockToken,
        delay: Duration,
    ) -> Result<(), BackendError> {
        self.with_queue(queue, |state, now| {
            leased(state, id, token)?.mark_deferred(delay, now);
            Ok(())
        })
    }

    async fn get(&self, queue: &str, id: &JobId) -> Result<Option<JobRecord>, BackendError> {
        self.with_queue(queue, |state, _| Ok(state.jobs.get(id).cloned()))
    }

    async fn counts(&self, queue: &str) -> Result<JobCounts, BackendError> {
        self.with_queue(queue, |state, _| {
            let mut counts = JobCounts {
                paused: state.paused,
                ..Default::default()
            };
            for job in state.jobs.values() {
                match job.state {
                    JobState::Waiting => counts.waiting += 1,
                    JobState::Delayed => counts.delayed += 1,
                    JobState::Active => counts.active += 1,
                    JobState::Completed => counts.completed += 1,
                    JobState::Failed => counts.failed += 1,
                }
            }
            Ok(counts)
        })
    }

    async fn list(
        &self,
        queue: &str,
        states: &[JobState],
        limit: usize,
    ) -> Result<Vec<JobRecord>, BackendError> {
        self.with_queue(queue, |state, _| {
            let mut result: Vec<_> = state
                .jobs
                .values()
                .filter(|j| states.contains(&j.state))
                .cloned()
                .collect();
            result.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
            result.truncate(limit);
            Ok(result)
        })
    }

    async fn remove(&self, queue: &str, id: &JobId) -> Result<bool, BackendError> {
        self.with_queue(queue, |state, _| {
            state.detach(id);
            Ok(state.jobs.remove(id).is_some())
        })
    }

    async fn move_to_waiting(&self, queue: &str, id: &JobId) -> Result<bool, BackendError> {
        self.with_queue(queue, |state, now| {
            let Some(job) = state.jobs.get_mut(id) else {
                return Ok(false);
            };
            if !matches!(job.state, JobState::Active | JobState::Delayed) {
                return Ok(false);
            }
            job.state = JobState::Waiting;
            job.run_at = now;
            job.lock = None;
            state.waiting.push_back(id.clone());
            Ok(true)
        })
    }

    async fn change_delay(&self, queue: &str, id: &JobId, delay: Duration) -> Result<bool, BackendError> {
        self.with_queue(queue, |state, now| {
            let Some(job) = state.jobs.get_mut(id) else {
                return Ok(false);
            };
            if !matches!(job.state, JobState::Waiting | JobState::Delayed) {
                return Ok(false);
            }
            job.mark_deferred(delay, now);
            state.waiting.retain(|j| j != id);
            Ok(true)
        })
    }

    async fn clean(
        &self,
        queue: &str,
        target: JobState,
        grace: Duration,
        limit: usize,
    ) -> Result<usize, BackendError> {
        self.with_queue(queue, |state, now| {
            let cutoff = now - chrono::Duration::from_std(grace).unwrap_or_default();
            let list = match target {
                JobState::Completed => &mut state.completed,
                JobState::Failed => &mut state.failed,
                other => {
                    return Err(BackendError::Command(format!(
                        "clean only supports finished states, got {}",
                        other.as_str()
                    )));
                }
            };

            let mut removed = Vec::new();
            while removed.len() < limit {
                let Some(id) = list.front() else {
                    break;
                };
                let old_enough = state
                    .jobs
                    .get(id)
                    .and_then(|j| j.finished_on)
                    .is_none_or(|at| at <= cutoff);
                if !old_enough {
                    break;
                }
                if let Some(id) = list.pop_front() {
                    removed.push(id);
                }
            }
            for id in &removed {
                state.jobs.remove(id);
            }
            Ok(removed.len())
        })
    }

    async fn recover_stalled(&self, queue: &str, max_stalled: u32) -> Result<StalledReport, BackendError> {
        self.with_queue(queue, |state, now| {
            let mut lapsed: Vec<_> = state
                .jobs
                .values()
                .filter(|j| j.state == JobState::Active && j.lock.is_none_or(|l| l.expires_at <= now))
                .map(|j| (j.processed_on, j.id.clone()))
                .collect();
            lapsed.sort();

            let mut report = StalledReport::default();
            for (_, id) in lapsed {
                let Some(job) = state.jobs.get_mut(&id) else {
                    continue;
                };
                match job.mark_stalled(max_stalled, now) {
                    StalledOutcome::Requeued => {
                        state.waiting.push_back(id.clone());
                        report.requeued.push(id);
                    }
                    StalledOutcome::Failed => {
                        state.finish(&id);
                        report.failed.push(id);
                    }
                }
            }
            Ok(report)
        })
    }

    async fn pause(&self, queue: &str) -> Result<(), BackendError> {
        self.with_queue(queue, |state, _| {
            state.paused = true;
            Ok(())
        })
    }

    async fn resume(&self, queue: &str) -> Result<(), BackendError> {
        self.with_queue(queue, |state, _| {
            state.paused = false;
            Ok(())
        })
    }

    async fn add_repeatable(&self, queue: &str, spec: RepeatSpec) -> Result<String, BackendError> {
        self.with_queue(queue, |state, now| {
            let rep = RepeatableJob::from_spec(spec, now);
            let key = rep.key.clone();
            state.repeatables.insert(key.clone(), rep);
            Ok(key)
        })
    }

    async fn repeatables(&self, queue: &str) -> Result<Vec<RepeatableJob>, BackendError> {
        self.with_queue(queue, |state, _| Ok(state.repeatables.values().cloned().collect()))
    }

    async fn remove_repeatable(&self, queue: &str, key: &str) -> Result<bool, BackendError> {
        self.with_queue(queue, |state, _| Ok(state.repeatables.remove(key).is_some()))
    }

    async fn close(&self) -> Result<(), BackendError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
