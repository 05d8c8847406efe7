//! Typed producer handle.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::{BackendError, QueueBackend};
use crate::job::{QueueJob, decode, encode};
use crate::types::{JobCounts, JobId, JobOptions, JobRecord, JobState};

/// Producer for one queue's job family.
///
/// Cheap to clone; all clones share the backend connection.
pub struct Queue<J: QueueJob> {
    backend: Arc<dyn QueueBackend>,
    defaults: JobOptions,
    _job: PhantomData<fn() -> J>,
}

impl<J: QueueJob> Clone for Queue<J> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            defaults: self.defaults.clone(),
            _job: PhantomData,
        }
    }
}

impl<J: QueueJob> std::fmt::Debug for Queue<J> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue").field("name", &J::QUEUE).finish()
    }
}

impl<J: QueueJob> Queue<J> {
    pub fn new(backend: Arc<dyn QueueBackend>, defaults: JobOptions) -> Self {
        Self {
            backend,
            defaults,
            _job: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        J::QUEUE
    }

    /// Options new jobs start from.
    pub fn defaults(&self) -> &JobOptions {
        &self.defaults
    }

    pub fn backend(&self) -> &Arc<dyn QueueBackend> {
        &self.backend
    }

    /// Enqueue with the queue's default options.
    pub async fn add(&self, job: &J) -> Result<JobId, BackendError> {
        self.add_with(job, self.defaults.clone()).await
    }

    /// Enqueue after `delay`, optionally under a caller-chosen id.
    pub async fn add_delayed(&self, job: &J, delay: Duration, job_id: Option<String>) -> Result<JobId, BackendError> {
        let mut opts = self.defaults.clone().with_delay(delay);
        if let Some(id) = job_id {
            opts = opts.with_job_id(id);
        }
        self.add_with(job, opts).await
    }

    pub async fn add_with(&self, job: &J, opts: JobOptions) -> Result<JobId, BackendError> {
        let (name, data) = encode(job)?;
        let id = self.backend.add(J::QUEUE, &name, data, opts).await?;
        tracing::debug!(queue = J::QUEUE, job_id = %id, name = %name, "job enqueued");
        Ok(id)
    }

    pub async fn get(&self, id: &JobId) -> Result<Option<JobRecord>, BackendError> {
        self.backend.get(J::QUEUE, id).await
    }

    /// Whether `id` refers to a job still waiting, delayed or active.
    pub async fn is_pending(&self, id: &JobId) -> Result<bool, BackendError> {
        Ok(self
            .backend
            .get(J::QUEUE, id)
            .await?
            .is_some_and(|job| !job.state.is_finished()))
    }

    /// Unfinished jobs decoded into the queue's job type. Undecodable records are skipped.
    pub async fn pending(&self, limit: usize) -> Result<Vec<(JobRecord, J)>, BackendError> {
        let records = self
            .backend
            .list(J::QUEUE, &[JobState::Waiting, JobState::Delayed, JobState::Active], limit)
            .await?;
        Ok(records
            .into_iter()
            .filter_map(|record| {
                let job = decode::<J>(&record.name, &record.data).ok()?;
                Some((record, job))
            })
            .collect())
    }

    pub async fn counts(&self) -> Result<JobCounts, BackendError> {
        self.backend.counts(J::QUEUE).await
    }

    pub async fn remove(&self, id: &JobId) -> Result<bool, BackendError> {
        self.backend.remove(J::QUEUE, id).await
    }

    pub async fn move_to_waiting(&self, id: &JobId) -> Result<bool, BackendError> {
        self.backend.move_to_waiting(J::QUEUE, id).await
    }

    pub async fn change_delay(&self, id: &JobId, delay: Duration) -> Result<bool, BackendError> {
        self.backend.change_delay(J::QUEUE, id, delay).await
    }
}
