//! The four campaign stages.
//!
//! `VerifyCampaigns` starts due campaigns, `ProcessCampaign` fans a campaign
//! out into one `PrepareContact` per recipient, `PrepareContact` creates the
//! shipping row and schedules its `DispatchCampaign`, and `DispatchCampaign`
//! talks to the transport. Every stage is safe to re-run: rows are
//! found-or-created, dispatch jobs carry a deterministic id, and the final
//! FINALIZADA transition is a conditional update.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use courier_core::{CampaignId, Clock, CompanyId};
use courier_queue::{JobContext, JobError, JobHandler, JobId, Queue};

use super::delay::{contact_delay, jitter};
use super::jobs::{CampaignJob, DispatchCampaign, PrepareContact, ProcessCampaign};
use super::{CampaignCache, CampaignSnapshot, SettingsCache, publish};
use crate::coalesce::UpdateCoalescer;
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::model::{Campaign, CampaignSettings, CampaignStatus, Connection, NewShipping};
use crate::ports::{
    CampaignStore, ConnectionDirectory, ConversationRequest, ConversationStore, MessagingTransport, OutboundContent,
    SettingsStore,
};
use crate::template::compose;

/// Collaborators shared by the campaign pipeline and campaign control.
#[derive(Clone)]
pub struct CampaignDeps {
    pub campaigns: Arc<dyn CampaignStore>,
    pub settings: Arc<dyn SettingsStore>,
    pub connections: Arc<dyn ConnectionDirectory>,
    pub conversations: Arc<dyn ConversationStore>,
    pub transport: Arc<dyn MessagingTransport>,
    pub coalescer: Arc<UpdateCoalescer>,
    pub clock: Arc<dyn Clock>,
}

/// What a `ProcessCampaign` run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// This many `PrepareContact` jobs were enqueued.
    Enqueued(usize),
    /// The campaign is paused; the job should come back later.
    Paused,
    /// Campaign gone, or in a status that no longer fans out.
    Skipped,
}

/// What a `PrepareContact` run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrepareOutcome {
    /// A dispatch job was enqueued (or de-duplicated onto the existing one).
    Queued(JobId),
    /// The row's dispatch job is still waiting, delayed or running.
    AlreadyQueued,
    /// The row needs no further dispatch.
    Settled,
    /// Campaign or contact gone, or the campaign already ended.
    Skipped,
}

/// What a `DispatchCampaign` run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Main message handed to the transport; `failed_sends` parts errored and were logged.
    Delivered { failed_sends: usize },
    /// The destination is not on the network; the row is settled without a send.
    NotOnNetwork,
    ConfirmationRequested,
    AwaitingConfirmation,
    AlreadyDelivered,
    /// The campaign is paused; the job should come back later.
    Paused,
    /// Campaign or row gone, or the campaign is not running.
    Dropped,
}

pub struct CampaignPipeline {
    deps: CampaignDeps,
    queue: Queue<CampaignJob>,
    cache: Arc<CampaignCache>,
    settings_cache: Arc<SettingsCache>,
    config: PipelineConfig,
}

impl CampaignPipeline {
    pub fn new(deps: CampaignDeps, queue: Queue<CampaignJob>, config: PipelineConfig) -> Self {
        let cache = Arc::new(CampaignCache::new(config.cache_ttl, deps.clock.clone()));
        let settings_cache = Arc::new(SettingsCache::new(config.cache_ttl, deps.clock.clone()));
        Self {
            deps,
            queue,
            cache,
            settings_cache,
            config,
        }
    }

    pub fn campaign_cache(&self) -> Arc<CampaignCache> {
        self.cache.clone()
    }

    pub fn settings_cache(&self) -> Arc<SettingsCache> {
        self.settings_cache.clone()
    }

    pub fn queue(&self) -> &Queue<CampaignJob> {
        &self.queue
    }

    async fn snapshot(&self, id: CampaignId) -> Result<Option<Arc<CampaignSnapshot>>, PipelineError> {
        if let Some(hit) = self.cache.get(&id) {
            return Ok(Some(hit));
        }
        let Some(campaign) = self.deps.campaigns.campaign(id).await? else {
            return Ok(None);
        };
        let contacts = self.deps.campaigns.contacts(id).await?;
        let snapshot = Arc::new(CampaignSnapshot { campaign, contacts });
        self.cache.set(id, snapshot.clone());
        Ok(Some(snapshot))
    }

    async fn settings(&self, company_id: CompanyId) -> Result<CampaignSettings, PipelineError> {
        if let Some(hit) = self.settings_cache.get(&company_id) {
            return Ok(hit);
        }
        let settings = self.deps.settings.campaign_settings(company_id).await?;
        self.settings_cache.set(company_id, settings.clone());
        Ok(settings)
    }

    /// Start every due PROGRAMADA campaign. Returns how many were started here.
    #[instrument(skip(self))]
    pub async fn verify_campaigns(&self) -> Result<usize, PipelineError> {
        let now = self.deps.clock.now();
        let due = self.deps.campaigns.due_campaigns(now, self.config.verify_limit).await?;
        let mut started = 0;

        for mut campaign in due {
            let won = self
                .deps
                .campaigns
                .transition_status(campaign.id, &[CampaignStatus::Programada], CampaignStatus::EmAndamento, None)
                .await?;
            if !won {
                debug!(campaign_id = %campaign.id, "campaign already started elsewhere");
                continue;
            }
            campaign.status = CampaignStatus::EmAndamento;
            self.cache.invalidate(&campaign.id);

            let (min, max) = self.config.process_jitter;
            let delay = jitter(min, max);
            let job = CampaignJob::ProcessCampaign(ProcessCampaign {
                id: campaign.id,
                delay: delay.as_millis() as u64,
            });
            self.queue.add_delayed(&job, delay, None).await?;
            publish(&self.deps.coalescer, &campaign);
            info!(campaign_id = %campaign.id, delay_ms = delay.as_millis() as u64, "campaign started");
            started += 1;
        }
        Ok(started)
    }

    /// Enqueue one `PrepareContact` per contact, in batches. A campaign
    /// without contacts is finished on the spot.
    #[instrument(skip(self, job), fields(campaign_id = %job.id))]
    pub async fn process_campaign(&self, job: ProcessCampaign) -> Result<ProcessOutcome, PipelineError> {
        let Some(snapshot) = self.snapshot(job.id).await? else {
            warn!("campaign not found; nothing to process");
            return Ok(ProcessOutcome::Skipped);
        };
        match snapshot.campaign.status {
            CampaignStatus::EmAndamento => {}
            CampaignStatus::Pausada => {
                debug!("campaign paused; fan-out deferred");
                return Ok(ProcessOutcome::Paused);
            }
            other => {
                info!(status = other.as_str(), "campaign not running; skipping");
                return Ok(ProcessOutcome::Skipped);
            }
        }
        let settings = self.settings(snapshot.campaign.company_id).await?;
        let batch_size = self.config.contact_batch.max(1);
        let mut enqueued = 0;

        for (batch_no, batch) in snapshot.contacts.chunks(batch_size).enumerate() {
            if batch_no > 0 {
                tokio::time::sleep(self.config.batch_pause).await;
            }
            for (offset, contact) in batch.iter().enumerate() {
                let index = batch_no * batch_size + offset;
                let delay = contact_delay(index, &settings);
                let prepare = CampaignJob::PrepareContact(PrepareContact {
                    contact_id: contact.id,
                    campaign_id: job.id,
                    delay: delay.as_millis() as u64,
                    variables: settings.variables.clone(),
                });
                self.queue.add(&prepare).await?;
                enqueued += 1;
            }
            debug!(batch = batch_no, size = batch.len(), "contact batch enqueued");
        }

        info!(contacts = enqueued, "campaign fanned out");
        if enqueued == 0 {
            self.check_completion(job.id).await?;
        }
        Ok(ProcessOutcome::Enqueued(enqueued))
    }

    /// Find-or-create the contact's shipping row and schedule its dispatch.
    #[instrument(skip(self, job), fields(campaign_id = %job.campaign_id, contact_id = %job.contact_id))]
    pub async fn prepare_contact(&self, job: PrepareContact) -> Result<PrepareOutcome, PipelineError> {
        let Some(snapshot) = self.snapshot(job.campaign_id).await? else {
            warn!("campaign not found; skipping contact");
            return Ok(PrepareOutcome::Skipped);
        };
        let campaign = &snapshot.campaign;
        if campaign.status.is_terminal() {
            debug!(status = campaign.status.as_str(), "campaign ended; skipping contact");
            return Ok(PrepareOutcome::Skipped);
        }

        let contact = match snapshot.contacts.iter().find(|c| c.id == job.contact_id) {
            Some(contact) => contact.clone(),
            None => match self.deps.campaigns.contact(job.campaign_id, job.contact_id).await? {
                Some(contact) => contact,
                None => {
                    warn!("contact not found; skipping");
                    return Ok(PrepareOutcome::Skipped);
                }
            },
        };

        let (message, confirmation_message) = {
            let mut rng = rand::thread_rng();
            let message = compose(&campaign.messages, &contact, &job.variables, &mut rng);
            let confirmation_message = if campaign.confirmation {
                compose(&campaign.confirmation_messages, &contact, &job.variables, &mut rng)
            } else {
                None
            };
            (message.unwrap_or_default(), confirmation_message)
        };

        let (row, created) = self
            .deps
            .campaigns
            .find_or_create_shipping(NewShipping {
                campaign_id: job.campaign_id,
                contact_id: contact.id,
                number: contact.number.clone(),
                message,
                confirmation_message,
                confirmation: campaign.confirmation,
            })
            .await?;

        if row.is_settled() {
            self.check_completion(job.campaign_id).await?;
            return Ok(PrepareOutcome::Settled);
        }

        if let (false, Some(existing)) = (created, row.job_id.as_deref()) {
            if self.queue.is_pending(&JobId::custom(existing)).await? {
                debug!(job_id = existing, "dispatch already queued");
                return Ok(PrepareOutcome::AlreadyQueued);
            }
        }

        let dispatch = DispatchCampaign {
            campaign_id: job.campaign_id,
            campaign_shipping_id: row.id,
            contact_list_item_id: contact.id,
        };
        let job_id = self
            .queue
            .add_delayed(
                &CampaignJob::DispatchCampaign(dispatch.clone()),
                Duration::from_millis(job.delay),
                Some(dispatch.job_id()),
            )
            .await?;
        self.deps.campaigns.set_shipping_job(row.id, job_id.as_str()).await?;
        debug!(shipping_id = %row.id, job_id = %job_id, delay_ms = job.delay, "dispatch scheduled");

        self.check_completion(job.campaign_id).await?;
        Ok(PrepareOutcome::Queued(job_id))
    }

    /// Send one shipping row.
    #[instrument(skip(self, job), fields(campaign_id = %job.campaign_id, shipping_id = %job.campaign_shipping_id))]
    pub async fn dispatch(&self, job: DispatchCampaign) -> Result<DispatchOutcome, PipelineError> {
        let campaigns = &self.deps.campaigns;
        let Some(campaign) = campaigns.campaign(job.campaign_id).await? else {
            warn!("campaign not found; dropping dispatch");
            return Ok(DispatchOutcome::Dropped);
        };
        let Some(shipping) = campaigns.shipping(job.campaign_shipping_id).await? else {
            warn!("shipping row not found; dropping dispatch");
            return Ok(DispatchOutcome::Dropped);
        };
        // A delivered row stays delivered whatever the campaign did since.
        if shipping.delivered_at.is_some() {
            self.check_completion(campaign.id).await?;
            return Ok(DispatchOutcome::AlreadyDelivered);
        }
        match campaign.status {
            CampaignStatus::EmAndamento => {}
            CampaignStatus::Pausada => return Ok(DispatchOutcome::Paused),
            other => {
                info!(status = other.as_str(), "campaign not running; dropping dispatch");
                return Ok(DispatchOutcome::Dropped);
            }
        }
        let needs_confirmation = shipping.confirmation && shipping.confirmed_at.is_none();
        if needs_confirmation && shipping.confirmation_requested_at.is_some() {
            return Ok(DispatchOutcome::AwaitingConfirmation);
        }

        let connection = self.resolve_connection(&campaign).await?;
        let check = self.deps.transport.check_exists(&connection, &shipping.number).await?;
        let now = self.deps.clock.now();

        if !check.exists {
            campaigns.mark_delivered(shipping.id, now).await?;
            info!(number = %shipping.number, "destination not on the network; row settled");
            self.check_completion(campaign.id).await?;
            return Ok(DispatchOutcome::NotOnNetwork);
        }
        let destination = check.normalized_id.unwrap_or_else(|| shipping.number.clone());

        if needs_confirmation {
            if let Some(text) = shipping.confirmation_message.as_deref().filter(|t| !t.trim().is_empty()) {
                self.send_logged(&connection, &destination, OutboundContent::Text(text.to_string()))
                    .await;
            }
            campaigns.mark_confirmation_requested(shipping.id, now).await?;
            info!("confirmation requested");
            return Ok(DispatchOutcome::ConfirmationRequested);
        }

        let mut failed_sends = 0;
        if !shipping.message.trim().is_empty()
            && !self
                .send_logged(&connection, &destination, OutboundContent::Text(shipping.message.clone()))
                .await
        {
            failed_sends += 1;
        }
        for attachment in campaign.media.iter().chain(campaign.files.iter()) {
            let content = OutboundContent::Media {
                attachment: attachment.clone(),
                caption: None,
            };
            if !self.send_logged(&connection, &destination, content).await {
                failed_sends += 1;
            }
        }

        if campaign.open_ticket {
            let request = ConversationRequest {
                company_id: campaign.company_id,
                contact_id: shipping.contact_id,
                connection_id: connection.id,
                status: campaign.ticket_status,
                user_id: campaign.ticket_user_id,
            };
            if let Err(e) = self.deps.conversations.open_or_reuse(request).await {
                warn!(error = %e, "failed to open conversation after campaign send");
            }
        }

        campaigns.mark_delivered(shipping.id, self.deps.clock.now()).await?;
        info!(failed_sends, "campaign message dispatched");
        self.check_completion(campaign.id).await?;
        Ok(DispatchOutcome::Delivered { failed_sends })
    }

    async fn resolve_connection(&self, campaign: &Campaign) -> Result<Connection, PipelineError> {
        if let Some(id) = campaign.connection_id {
            match self.deps.connections.connection(id).await? {
                Some(connection) => return Ok(connection),
                None => warn!(connection_id = %id, "campaign connection missing; using company default"),
            }
        }
        self.deps
            .connections
            .default_connection(campaign.company_id)
            .await?
            .ok_or_else(|| PipelineError::NoConnection(format!("company {}", campaign.company_id)))
    }

    /// Returns whether the send went through. Failures are logged, not raised.
    async fn send_logged(&self, connection: &Connection, destination: &str, content: OutboundContent) -> bool {
        match self.deps.transport.send(connection, destination, &content).await {
            Ok(message_id) => {
                debug!(message_id = %message_id, "message sent");
                true
            }
            Err(e) => {
                warn!(destination, error = %e, "send failed; counting as delivered");
                false
            }
        }
    }

    /// Move a running campaign to FINALIZADA once every contact is delivered,
    /// which an empty contact list trivially is. Returns whether this call
    /// made the transition.
    pub async fn check_completion(&self, campaign_id: CampaignId) -> Result<bool, PipelineError> {
        let campaigns = &self.deps.campaigns;
        let total = campaigns.contact_count(campaign_id).await?;
        let delivered = campaigns.delivered_count(campaign_id).await?;
        if delivered < total {
            return Ok(false);
        }

        let finished = campaigns
            .transition_status(
                campaign_id,
                &[CampaignStatus::EmAndamento],
                CampaignStatus::Finalizada,
                Some(self.deps.clock.now()),
            )
            .await?;
        if finished {
            self.cache.invalidate(&campaign_id);
            if let Some(campaign) = campaigns.campaign(campaign_id).await? {
                publish(&self.deps.coalescer, &campaign);
            }
            info!(campaign_id = %campaign_id, delivered, total, "campaign finished");
        }
        Ok(finished)
    }
}

#[async_trait]
impl JobHandler<CampaignJob> for CampaignPipeline {
    async fn handle(&self, job: CampaignJob, _ctx: JobContext) -> Result<(), JobError> {
        match job {
            CampaignJob::VerifyCampaigns(_) => {
                self.verify_campaigns().await?;
            }
            CampaignJob::ProcessCampaign(process) => {
                if self.process_campaign(process).await? == ProcessOutcome::Paused {
                    return Err(JobError::Deferred(self.config.pause_delay));
                }
            }
            CampaignJob::PrepareContact(prepare) => {
                self.prepare_contact(prepare).await?;
            }
            CampaignJob::DispatchCampaign(dispatch) => {
                if self.dispatch(dispatch).await? == DispatchOutcome::Paused {
                    return Err(JobError::Deferred(self.config.pause_delay));
                }
            }
        }
        Ok(())
    }
}
