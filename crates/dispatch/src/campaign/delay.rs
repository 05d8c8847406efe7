//! Per-contact pacing.

use std::time::Duration;

use rand::Rng;

use crate::model::CampaignSettings;

/// Dispatch delay for the contact at `index` (0-based) in a campaign.
///
/// Each contact gets `message_interval`; from index `longer_interval_after`
/// onwards (when that is non-zero) `greater_interval` is added on top.
pub fn contact_delay(index: usize, settings: &CampaignSettings) -> Duration {
    let threshold = settings.longer_interval_after as usize;
    if threshold > 0 && index >= threshold {
        settings.message_interval + settings.greater_interval
    } else {
        settings.message_interval
    }
}

/// Uniform jitter in `[min, max]`.
pub fn jitter(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let ms = rand::thread_rng().gen_range(min.as_millis() as u64..=max.as_millis() as u64);
    Duration::from_millis(ms)
}
