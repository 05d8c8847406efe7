//! Queue backend abstraction.
//!
//! The backend is the single source of truth for job state. Every state
//! transition it exposes is atomic with respect to other callers: two workers
//! can never claim the same job, and a settle call carrying a stale lease is
//! rejected instead of overwriting whatever happened to the job since.

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::types::{
    ClaimedJob, FailOutcome, JobCounts, JobId, JobOptions, JobRecord, JobState, LockToken,
    RepeatSpec, RepeatableJob, StalledReport,
};

pub use memory::InMemoryBackend;
#[cfg(feature = "redis")]
pub use self::redis::RedisBackend;

/// Backend operation error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    /// The backing store could not be reached.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    /// A command was rejected or returned something unexpected.
    #[error("backend command failed: {0}")]
    Command(String),
    /// The caller no longer holds the lease on this job.
    #[error("lease on job {0} is not held by this worker")]
    LockMismatch(JobId),
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("serialization error: {0}")]
    Serialization(String),
    /// The backend was closed during shutdown.
    #[error("backend closed")]
    Closed,
}

impl BackendError {
    /// Connection-level trouble, as opposed to a rejected operation.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, BackendError::Unavailable(_) | BackendError::Closed)
    }
}

impl From<serde_json::Error> for BackendError {
    fn from(value: serde_json::Error) -> Self {
        BackendError::Serialization(value.to_string())
    }
}

/// Durable job storage shared by all workers.
#[async_trait]
pub trait QueueBackend: Send + Sync + 'static {
    /// Lightweight liveness probe.
    async fn ping(&self) -> Result<(), BackendError>;

    /// Enqueue a job. With `opts.job_id` set and an unfinished job already
    /// holding that id, the existing id is returned and nothing is added.
    async fn add(
        &self,
        queue: &str,
        name: &str,
        data: JsonValue,
        opts: JobOptions,
    ) -> Result<JobId, BackendError>;

    /// Claim the next ready job and lease it for `lock_for`.
    ///
    /// Promotes due delayed jobs and materialises due repeatable registrations
    /// first. Returns `None` when nothing is ready or the queue is paused.
    async fn claim(&self, queue: &str, lock_for: Duration) -> Result<Option<ClaimedJob>, BackendError>;

    /// Renew a lease. Returns `false` when the lease is gone.
    async fn extend_lock(
        &self,
        queue: &str,
        id: &JobId,
        token: LockToken,
        lock_for: Duration,
    ) -> Result<bool, BackendError>;

    async fn complete(&self, queue: &str, id: &JobId, token: LockToken) -> Result<(), BackendError>;

    /// Record a failed attempt; retries per the job's options when `retry` is set.
    async fn fail(
        &self,
        queue: &str,
        id: &JobId,
        token: LockToken,
        reason: &str,
        retry: bool,
    ) -> Result<FailOutcome, BackendError>;

    /// Move an active job back to delayed without consuming an attempt.
    async fn defer(
        &self,
        queue: &str,
        id: &JobId,
        token: LockToken,
        delay: Duration,
    ) -> Result<(), BackendError>;

    async fn get(&self, queue: &str, id: &JobId) -> Result<Option<JobRecord>, BackendError>;

    async fn counts(&self, queue: &str) -> Result<JobCounts, BackendError>;

    /// Jobs in any of `states`, oldest first, at most `limit`.
    async fn list(
        &self,
        queue: &str,
        states: &[JobState],
        limit: usize,
    ) -> Result<Vec<JobRecord>, BackendError>;

    /// Remove a job in any state. Returns whether it existed.
    async fn remove(&self, queue: &str, id: &JobId) -> Result<bool, BackendError>;

    /// Force an active or delayed job back to waiting, revoking any lease.
    /// Returns `false` if the job was in neither state.
    async fn move_to_waiting(&self, queue: &str, id: &JobId) -> Result<bool, BackendError>;

    /// Re-delay a waiting or delayed job. Returns `false` otherwise.
    async fn change_delay(&self, queue: &str, id: &JobId, delay: Duration) -> Result<bool, BackendError>;

    /// Remove up to `limit` of the oldest jobs in a finished `state` that
    /// finished more than `grace` ago. Returns how many were removed.
    async fn clean(
        &self,
        queue: &str,
        state: JobState,
        grace: Duration,
        limit: usize,
    ) -> Result<usize, BackendError>;

    /// Requeue active jobs whose lease lapsed; fail those past `max_stalled`.
    async fn recover_stalled(&self, queue: &str, max_stalled: u32) -> Result<StalledReport, BackendError>;

    async fn pause(&self, queue: &str) -> Result<(), BackendError>;

    async fn resume(&self, queue: &str) -> Result<(), BackendError>;

    /// Register (or replace) a repeatable job. Returns its key.
    async fn add_repeatable(&self, queue: &str, spec: RepeatSpec) -> Result<String, BackendError>;

    async fn repeatables(&self, queue: &str) -> Result<Vec<RepeatableJob>, BackendError>;

    /// Remove a repeatable registration. Returns whether it existed.
    async fn remove_repeatable(&self, queue: &str, key: &str) -> Result<bool, BackendError>;

    /// Release the connection. Further calls fail with [`BackendError::Closed`].
    async fn close(&self) -> Result<(), BackendError>;
}
