//! Idempotent setup of timer-driven (repeatable) jobs.

use std::time::Duration;

use tracing::{info, warn};

use crate::backend::{BackendError, QueueBackend};
use crate::types::RepeatSpec;

/// Registration gap between consecutive entries so they don't all fire together.
pub const STAGGER: Duration = Duration::from_secs(2);

/// One desired repeatable registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepeatableEntry {
    pub queue: &'static str,
    pub job_name: &'static str,
    pub every: Duration,
}

impl RepeatableEntry {
    pub const fn new(queue: &'static str, job_name: &'static str, every: Duration) -> Self {
        Self { queue, job_name, every }
    }
}

/// What reconciliation did for one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciled {
    pub queue: &'static str,
    pub job_name: &'static str,
    pub removed: usize,
    pub key: String,
}

/// Make `entries` the exact set of repeatable registrations for their job names.
///
/// For each entry: pause its queue, drop every registration with that job name
/// (whatever the interval), resume, then register once with a staggered offset.
/// Safe to run on every start. A failure to remove an individual stale
/// registration is logged and skipped.
pub async fn reconcile(backend: &dyn QueueBackend, entries: &[RepeatableEntry]) -> Result<Vec<Reconciled>, BackendError> {
    let mut done = Vec::with_capacity(entries.len());

    for (index, entry) in entries.iter().enumerate() {
        backend.pause(entry.queue).await?;
        let removed = remove_existing(backend, entry).await;
        // Resume even if listing failed, so the queue isn't left paused.
        backend.resume(entry.queue).await?;
        let removed = removed?;

        let offset = STAGGER * index as u32;
        let spec = RepeatSpec::every(entry.job_name, entry.every).with_offset(offset);
        let key = backend.add_repeatable(entry.queue, spec).await?;

        info!(
            queue = entry.queue,
            job_name = entry.job_name,
            every_ms = entry.every.as_millis() as u64,
            offset_ms = offset.as_millis() as u64,
            removed,
            "repeatable job registered"
        );
        done.push(Reconciled {
            queue: entry.queue,
            job_name: entry.job_name,
            removed,
            key,
        });
    }

    Ok(done)
}

async fn remove_existing(backend: &dyn QueueBackend, entry: &RepeatableEntry) -> Result<usize, BackendError> {
    let existing = backend.repeatables(entry.queue).await?;
    let mut removed = 0;
    for rep in existing.iter().filter(|r| r.name == entry.job_name) {
        match backend.remove_repeatable(entry.queue, &rep.key).await {
            Ok(true) => removed += 1,
            Ok(false) => {}
            Err(e) => warn!(queue = entry.queue, key = %rep.key, error = %e, "failed to remove stale repeatable"),
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;

    const ENTRIES: [RepeatableEntry; 2] = [
        RepeatableEntry::new("campaign", "VerifyCampaigns", Duration::from_secs(300)),
        RepeatableEntry::new("schedule-monitor", "VerifySchedules", Duration::from_secs(60)),
    ];

    #[tokio::test]
    async fn reconcile_twice_leaves_one_registration_per_name() {
        let backend = InMemoryBackend::new();

        reconcile(&backend, &ENTRIES).await.unwrap();
        let second = reconcile(&backend, &ENTRIES).await.unwrap();

        assert_eq!(second[0].removed, 1);
        assert_eq!(backend.repeatables("campaign").await.unwrap().len(), 1);
        assert_eq!(backend.repeatables("schedule-monitor").await.unwrap().len(), 1);
        assert!(!backend.counts("campaign").await.unwrap().paused);
    }

    #[tokio::test]
    async fn reconcile_replaces_registrations_with_a_different_interval() {
        let backend = InMemoryBackend::new();
        backend
            .add_repeatable("campaign", RepeatSpec::every("VerifyCampaigns", Duration::from_secs(30)))
            .await
            .unwrap();

        reconcile(&backend, &ENTRIES[..1]).await.unwrap();

        let reps = backend.repeatables("campaign").await.unwrap();
        assert_eq!(reps.len(), 1);
        assert_eq!(reps[0].every, Duration::from_secs(300));
    }
}
