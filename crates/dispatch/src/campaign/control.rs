//! Operator actions on a running campaign.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use courier_core::{CampaignId, Clock, DomainError, ShippingId};
use courier_queue::{JobId, JobState, Queue};

use super::jobs::{CampaignJob, DispatchCampaign};
use super::{CampaignCache, publish};
use crate::coalesce::UpdateCoalescer;
use crate::error::PipelineError;
use crate::model::CampaignStatus;
use crate::ports::CampaignStore;

/// Pause, resume and cancel campaigns, and record recipient confirmations.
///
/// Status changes go through the same conditional update the pipeline uses,
/// then the campaign's queued jobs are adjusted to match.
pub struct CampaignControl {
    campaigns: Arc<dyn CampaignStore>,
    queue: Queue<CampaignJob>,
    cache: Arc<CampaignCache>,
    coalescer: Arc<UpdateCoalescer>,
    clock: Arc<dyn Clock>,
    pause_delay: Duration,
    scan_limit: usize,
}

impl CampaignControl {
    pub fn new(
        campaigns: Arc<dyn CampaignStore>,
        queue: Queue<CampaignJob>,
        cache: Arc<CampaignCache>,
        coalescer: Arc<UpdateCoalescer>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            campaigns,
            queue,
            cache,
            coalescer,
            clock,
            pause_delay: Duration::from_secs(24 * 60 * 60),
            scan_limit: 100_000,
        }
    }

    pub fn with_pause_delay(mut self, delay: Duration) -> Self {
        self.pause_delay = delay;
        self
    }

    pub fn with_scan_limit(mut self, limit: usize) -> Self {
        self.scan_limit = limit;
        self
    }

    /// Pause a running campaign and push its queued jobs out by the pause delay.
    /// Returns how many jobs were delayed.
    pub async fn pause(&self, id: CampaignId) -> Result<usize, PipelineError> {
        self.change_status(id, CampaignStatus::Pausada).await?;
        let mut delayed = 0;
        for job_id in self.queued_jobs(id, &[JobState::Waiting, JobState::Delayed]).await? {
            if self.queue.change_delay(&job_id, self.pause_delay).await? {
                delayed += 1;
            }
        }
        info!(campaign_id = %id, delayed, "campaign paused");
        Ok(delayed)
    }

    /// Resume a paused campaign and make its queued jobs claimable now.
    pub async fn resume(&self, id: CampaignId) -> Result<usize, PipelineError> {
        self.change_status(id, CampaignStatus::EmAndamento).await?;
        let mut moved = 0;
        for job_id in self.queued_jobs(id, &[JobState::Delayed]).await? {
            if self.queue.move_to_waiting(&job_id).await? {
                moved += 1;
            }
        }
        info!(campaign_id = %id, moved, "campaign resumed");
        Ok(moved)
    }

    /// Cancel a campaign and drop every job still queued or running for it.
    pub async fn cancel(&self, id: CampaignId) -> Result<usize, PipelineError> {
        self.change_status(id, CampaignStatus::Cancelada).await?;
        let mut removed = 0;
        let states = [JobState::Waiting, JobState::Delayed, JobState::Active];
        for job_id in self.queued_jobs(id, &states).await? {
            if self.queue.remove(&job_id).await? {
                removed += 1;
            }
        }
        info!(campaign_id = %id, removed, "campaign cancelled");
        Ok(removed)
    }

    /// Record a recipient's confirmation and queue the main message.
    /// Returns the dispatch job id, or `None` when the row was already delivered.
    pub async fn confirm_shipping(&self, shipping_id: ShippingId) -> Result<Option<JobId>, PipelineError> {
        let shipping = self
            .campaigns
            .shipping(shipping_id)
            .await?
            .ok_or_else(|| DomainError::not_found(format!("shipping {shipping_id}")))?;
        if shipping.delivered_at.is_some() {
            return Ok(None);
        }
        if shipping.confirmation_requested_at.is_none() {
            return Err(DomainError::validation("no confirmation was requested for this shipping").into());
        }
        if !self.campaigns.mark_confirmed(shipping_id, self.clock.now()).await? {
            info!(shipping_id = %shipping_id, "confirmation already recorded");
        }

        let dispatch = DispatchCampaign {
            campaign_id: shipping.campaign_id,
            campaign_shipping_id: shipping.id,
            contact_list_item_id: shipping.contact_id,
        };
        let job_id = self
            .queue
            .add_delayed(&CampaignJob::DispatchCampaign(dispatch.clone()), Duration::ZERO, Some(dispatch.job_id()))
            .await?;
        self.campaigns.set_shipping_job(shipping.id, job_id.as_str()).await?;
        info!(shipping_id = %shipping_id, job_id = %job_id, "confirmed shipping queued for dispatch");
        Ok(Some(job_id))
    }

    async fn change_status(&self, id: CampaignId, to: CampaignStatus) -> Result<(), PipelineError> {
        let campaign = self
            .campaigns
            .campaign(id)
            .await?
            .ok_or_else(|| DomainError::not_found(format!("campaign {id}")))?;
        campaign.status.transition(to)?;

        let applied = self.campaigns.transition_status(id, &[campaign.status], to, None).await?;
        if !applied {
            return Err(DomainError::conflict(format!("campaign {id} changed status concurrently")).into());
        }
        self.cache.invalidate(&id);

        match self.campaigns.campaign(id).await? {
            Some(updated) => publish(&self.coalescer, &updated),
            None => warn!(campaign_id = %id, "campaign vanished after status change"),
        }
        Ok(())
    }

    async fn queued_jobs(&self, id: CampaignId, states: &[JobState]) -> Result<Vec<JobId>, PipelineError> {
        Ok(self
            .queue
            .pending(self.scan_limit)
            .await?
            .into_iter()
            .filter(|(record, job)| job.campaign_id() == Some(id) && states.contains(&record.state))
            .map(|(record, _)| record.id)
            .collect())
    }
}
