//! Core job types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Unique job identifier.
///
/// Backend-generated ids are UUIDv7 strings; callers may supply their own id to
/// de-duplicate enqueues (see [`JobOptions::job_id`]).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn custom(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque lease token handed to the worker that claimed a job.
///
/// Completing, failing or deferring a job requires the token of the current
/// lease; a revoked or expired lease is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockToken(Uuid);

impl LockToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LockToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for LockToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

/// Where a job currently sits in its queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Ready to be claimed.
    Waiting,
    /// Waiting for its `run_at` (initial delay, retry backoff, pause).
    Delayed,
    /// Claimed by a worker holding a lease.
    Active,
    /// Finished successfully.
    Completed,
    /// Exhausted its attempts, stalled too often, or failed permanently.
    Failed,
}

impl JobState {
    pub fn is_finished(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt-1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Retry delay policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub strategy: BackoffStrategy,
    /// Base delay between retries
    pub base: Duration,
    /// Maximum delay cap
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::exponential(Duration::from_secs(5))
    }
}

impl BackoffPolicy {
    /// Exponential backoff starting at `base`, capped at one hour.
    pub fn exponential(base: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base,
            max: Duration::from_secs(3600),
        }
    }

    pub fn fixed(delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Fixed,
            base: delay,
            max: delay,
        }
    }

    /// Calculate delay before retrying after the given failed attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base.as_millis() as f64;
        let max_ms = self.max.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi((attempt - 1).min(62) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        Duration::from_millis(delay_ms.max(0.0) as u64)
    }
}

/// Per-job options. Queues carry defaults; producers override per enqueue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Total attempts including the first run.
    pub attempts: u32,
    pub backoff: BackoffPolicy,
    /// Initial delay before the job becomes claimable.
    pub delay: Duration,
    /// Caller-supplied id; an unfinished job with the same id de-duplicates the add.
    pub job_id: Option<JobId>,
    /// How many completed jobs the queue retains.
    pub keep_completed: usize,
    /// How many failed jobs the queue retains.
    pub keep_failed: usize,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            attempts: 5,
            backoff: BackoffPolicy::default(),
            delay: Duration::ZERO,
            job_id: None,
            keep_completed: 100,
            keep_failed: 500,
        }
    }
}

impl JobOptions {
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_job_id(mut self, id: impl Into<String>) -> Self {
        self.job_id = Some(JobId::custom(id));
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }
}

/// Lease held by the worker processing an active job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobLock {
    pub token: LockToken,
    pub expires_at: DateTime<Utc>,
}

/// A job as stored by a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub queue: String,
    /// Job type name (the variant name of the queue's job enum).
    pub name: String,
    pub data: JsonValue,
    pub opts: JobOptions,
    pub state: JobState,
    /// Failed attempts so far.
    pub attempts_made: u32,
    /// How many times the job's lease lapsed while active.
    pub stalled_count: u32,
    pub created_at: DateTime<Utc>,
    /// Earliest time the job may be claimed.
    pub run_at: DateTime<Utc>,
    pub processed_on: Option<DateTime<Utc>>,
    pub finished_on: Option<DateTime<Utc>>,
    pub failed_reason: Option<String>,
    /// Set when materialised from a repeatable registration.
    pub repeat_key: Option<String>,
    #[serde(default)]
    pub lock: Option<JobLock>,
}

impl JobRecord {
    /// Build a fresh record for `add`.
    pub fn new(
        queue: &str,
        name: &str,
        data: JsonValue,
        opts: JobOptions,
        now: DateTime<Utc>,
    ) -> Self {
        let id = opts.job_id.clone().unwrap_or_default();
        let delayed = !opts.delay.is_zero();
        let run_at = now + chrono::Duration::from_std(opts.delay).unwrap_or_default();
        Self {
            id,
            queue: queue.to_string(),
            name: name.to_string(),
            data,
            opts,
            state: if delayed {
                JobState::Delayed
            } else {
                JobState::Waiting
            },
            attempts_made: 0,
            stalled_count: 0,
            created_at: now,
            run_at,
            processed_on: None,
            finished_on: None,
            failed_reason: None,
            repeat_key: None,
            lock: None,
        }
    }

    /// Check if a delayed job is due.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        now >= self.run_at
    }

    /// Mark the job as claimed under a fresh lease.
    pub fn mark_active(&mut self, now: DateTime<Utc>, lock_for: Duration) -> LockToken {
        let token = LockToken::new();
        self.state = JobState::Active;
        self.processed_on = Some(now);
        self.lock = Some(JobLock {
            token,
            expires_at: now + chrono::Duration::from_std(lock_for).unwrap_or_default(),
        });
        token
    }

    /// Whether `token` is the current, unexpired lease on an active job.
    pub fn holds_lease(&self, token: LockToken) -> bool {
        self.state == JobState::Active && self.lock.is_some_and(|l| l.token == token)
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Completed;
        self.finished_on = Some(now);
        self.lock = None;
    }

    /// Record a failed attempt and decide between retry and terminal failure.
    pub fn mark_failed(&mut self, reason: String, retry: bool, now: DateTime<Utc>) -> FailOutcome {
        self.attempts_made += 1;
        self.failed_reason = Some(reason);
        self.lock = None;

        if retry && self.attempts_made < self.opts.attempts {
            let delay = self.opts.backoff.delay_for_attempt(self.attempts_made);
            self.state = JobState::Delayed;
            self.run_at = now + chrono::Duration::from_std(delay).unwrap_or_default();
            FailOutcome::Retrying {
                attempt: self.attempts_made,
                delay,
            }
        } else {
            self.state = JobState::Failed;
            self.finished_on = Some(now);
            FailOutcome::Failed {
                attempts: self.attempts_made,
            }
        }
    }

    /// Move back to delayed without consuming an attempt.
    pub fn mark_deferred(&mut self, delay: Duration, now: DateTime<Utc>) {
        self.state = JobState::Delayed;
        self.run_at = now + chrono::Duration::from_std(delay).unwrap_or_default();
        self.lock = None;
    }

    /// Handle a lapsed lease: back to waiting, or failed past `max_stalled`.
    pub fn mark_stalled(&mut self, max_stalled: u32, now: DateTime<Utc>) -> StalledOutcome {
        self.stalled_count += 1;
        self.lock = None;
        if self.stalled_count > max_stalled {
            self.state = JobState::Failed;
            self.finished_on = Some(now);
            self.failed_reason = Some("job stalled more than allowable limit".to_string());
            StalledOutcome::Failed
        } else {
            self.state = JobState::Waiting;
            StalledOutcome::Requeued
        }
    }
}

/// Result of recording a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Scheduled again after `delay`.
    Retrying { attempt: u32, delay: Duration },
    /// Terminal; the job now sits in the failed set.
    Failed { attempts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StalledOutcome {
    Requeued,
    Failed,
}

/// A claimed job plus the lease needed to settle it.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job: JobRecord,
    pub token: LockToken,
}

/// Snapshot of a queue's size per state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub waiting: usize,
    pub delayed: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub paused: bool,
}

/// Outcome of a stalled-job sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StalledReport {
    pub requeued: Vec<JobId>,
    pub failed: Vec<JobId>,
}

impl StalledReport {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.failed.is_empty()
    }
}

/// Request to register a repeatable (timer-driven) job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepeatSpec {
    pub name: String,
    pub every: Duration,
    /// Extra delay before the first run (used to stagger startup).
    pub offset: Duration,
    /// Run once right away instead of waiting one full interval.
    pub immediately: bool,
    pub data: JsonValue,
    pub opts: JobOptions,
}

impl RepeatSpec {
    pub fn every(name: impl Into<String>, every: Duration) -> Self {
        Self {
            name: name.into(),
            every,
            offset: Duration::ZERO,
            immediately: false,
            data: JsonValue::Object(Default::default()),
            opts: JobOptions::default(),
        }
    }

    pub fn with_offset(mut self, offset: Duration) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_data(mut self, data: JsonValue) -> Self {
        self.data = data;
        self
    }

    /// Registration key; one registration per (name, interval).
    pub fn key(&self) -> String {
        repeat_key(&self.name, self.every)
    }

    /// When the first occurrence becomes due.
    pub fn first_run(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let wait = if self.immediately {
            self.offset
        } else {
            self.offset + self.every
        };
        now + chrono::Duration::from_std(wait).unwrap_or_default()
    }
}

pub fn repeat_key(name: &str, every: Duration) -> String {
    format!("{}::{}", name, every.as_millis())
}

/// A repeatable registration as held by a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepeatableJob {
    pub key: String,
    pub name: String,
    pub every: Duration,
    pub next_run: DateTime<Utc>,
    pub data: JsonValue,
    pub opts: JobOptions,
}

impl RepeatableJob {
    pub fn from_spec(spec: RepeatSpec, now: DateTime<Utc>) -> Self {
        Self {
            key: spec.key(),
            next_run: spec.first_run(now),
            name: spec.name,
            every: spec.every,
            data: spec.data,
            opts: spec.opts,
        }
    }

    /// Id of the occurrence due at `next_run`; stable so a double materialisation de-duplicates.
    pub fn occurrence_id(&self) -> JobId {
        JobId::custom(format!("repeat:{}:{}", self.key, self.next_run.timestamp_millis()))
    }

    /// Advance past `now`, skipping missed ticks.
    pub fn advance(&mut self, now: DateTime<Utc>) {
        let step = chrono::Duration::from_std(self.every).unwrap_or_default();
        if step <= chrono::Duration::zero() {
            self.next_run = now;
            return;
        }
        while self.next_run <= now {
            self.next_run += step;
        }
    }
}
