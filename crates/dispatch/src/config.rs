//! Pipeline tuning.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Campaigns started per VerifyCampaigns run.
    pub verify_limit: usize,
    /// Contacts enqueued per batch in ProcessCampaign.
    pub contact_batch: usize,
    /// Pause between contact batches.
    pub batch_pause: Duration,
    /// Jitter range for ProcessCampaign after a campaign starts.
    pub process_jitter: (Duration, Duration),
    /// TTL of the campaign and settings caches.
    pub cache_ttl: Duration,
    pub cache_sweep_interval: Duration,
    /// How long pause pushes pending jobs out (and a dispatch on a paused campaign defers itself).
    pub pause_delay: Duration,
    /// Upper bound on queued jobs scanned by pause/resume/cancel.
    pub control_scan_limit: usize,
    /// Schedules claimed per VerifySchedules run.
    pub schedule_limit: usize,
    /// Jitter range for SendMessage jobs.
    pub schedule_jitter: (Duration, Duration),
    pub coalesce_window: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            verify_limit: 100,
            contact_batch: 100,
            batch_pause: Duration::from_secs(1),
            process_jitter: (Duration::from_secs(1), Duration::from_secs(5)),
            cache_ttl: Duration::from_secs(5 * 60),
            cache_sweep_interval: Duration::from_secs(15 * 60),
            pause_delay: Duration::from_secs(24 * 60 * 60),
            control_scan_limit: 100_000,
            schedule_limit: 500,
            schedule_jitter: (Duration::from_secs(1), Duration::from_secs(20)),
            coalesce_window: Duration::from_secs(3),
        }
    }
}
