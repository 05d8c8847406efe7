//! Scheduled message pipeline: `VerifySchedules` claims due rows and
//! `SendMessage` delivers one, handling tag-linked and independent recurrence.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, instrument, warn};

use courier_core::{Clock, ConnectionId};
use courier_queue::{JobContext, JobError, JobHandler, Queue};

use super::jobs::{ScheduleMonitorJob, ScheduledMessageJob, SendMessage};
use crate::campaign::delay::jitter;
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::model::{Connection, Schedule, ScheduleStatus};
use crate::ports::{ConnectionDirectory, MessagingTransport, OutboundContent, ScheduleStore};

#[derive(Clone)]
pub struct ScheduleDeps {
    pub schedules: Arc<dyn ScheduleStore>,
    pub connections: Arc<dyn ConnectionDirectory>,
    pub transport: Arc<dyn MessagingTransport>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Sent and marked ENVIADA; carries the follow-up occurrence if one was appended.
    Sent { next: Option<DateTime<Utc>> },
    /// Tag-linked row sent and moved back to PENDENTE.
    Rescheduled { send_at: DateTime<Utc> },
    /// Already sent, cancelled or gone.
    Skipped,
}

pub struct SchedulePipeline {
    deps: ScheduleDeps,
    messages: Queue<ScheduledMessageJob>,
    config: PipelineConfig,
}

impl SchedulePipeline {
    pub fn new(deps: ScheduleDeps, messages: Queue<ScheduledMessageJob>, config: PipelineConfig) -> Self {
        Self { deps, messages, config }
    }

    /// Claim due rows and enqueue one `SendMessage` each. Returns how many were claimed.
    #[instrument(skip(self))]
    pub async fn verify_schedules(&self) -> Result<usize, PipelineError> {
        let now = self.deps.clock.now();
        let due = self.deps.schedules.due_schedules(now, self.config.schedule_limit).await?;
        if due.is_empty() {
            return Ok(0);
        }

        let ids: Vec<_> = due.iter().map(|s| s.id).collect();
        let claimed = self.deps.schedules.claim_schedules(&ids).await?;
        let (min, max) = self.config.schedule_jitter;

        for schedule in due.iter().filter(|s| claimed.contains(&s.id)) {
            let job = ScheduledMessageJob::SendMessage(SendMessage {
                schedule_id: schedule.id,
                whatsapp_id: schedule.connection_id,
            });
            self.messages.add_delayed(&job, jitter(min, max), None).await?;
        }
        info!(due = due.len(), claimed = claimed.len(), "due schedules claimed");
        Ok(claimed.len())
    }

    /// Deliver one scheduled message. Failures before the message is out leave
    /// the row in ERRO and surface for retry; once it is out the job succeeds.
    #[instrument(skip(self, job), fields(schedule_id = %job.schedule_id))]
    pub async fn send_message(&self, job: SendMessage) -> Result<SendOutcome, PipelineError> {
        let Some(schedule) = self.deps.schedules.schedule(job.schedule_id).await? else {
            warn!("schedule not found; skipping");
            return Ok(SendOutcome::Skipped);
        };
        if schedule.sent_at.is_some() || matches!(schedule.status, ScheduleStatus::Enviada | ScheduleStatus::Cancelada) {
            debug!(status = schedule.status.as_str(), "schedule already settled");
            return Ok(SendOutcome::Skipped);
        }

        if let Err(e) = self.send(&schedule, job.whatsapp_id).await {
            error!(error = %e, "scheduled send failed");
            if let Err(mark) = self.deps.schedules.set_schedule_status(schedule.id, ScheduleStatus::Erro).await {
                warn!(error = %mark, "failed to mark schedule as ERRO");
            }
            return Err(e);
        }
        Ok(self.settle(&schedule).await)
    }

    async fn send(&self, schedule: &Schedule, preferred: Option<ConnectionId>) -> Result<(), PipelineError> {
        self.deps
            .schedules
            .set_schedule_status(schedule.id, ScheduleStatus::Processando)
            .await?;
        let connection = self.resolve_connection(schedule, preferred).await?;
        self.send_content(&connection, schedule).await
    }

    /// Record a send that already happened. Store failures are logged only:
    /// a retry would deliver the message a second time.
    async fn settle(&self, schedule: &Schedule) -> SendOutcome {
        let schedules = &self.deps.schedules;
        let now = self.deps.clock.now();

        if let Some(tag) = schedule.tag_recurrence {
            if tag.repeat_every_days == 0 {
                match schedules.mark_sent(schedule.id, now).await {
                    Ok(()) => info!(tag_id = %tag.tag_id, "tag message sent"),
                    Err(e) => error!(tag_id = %tag.tag_id, error = %e, "tag message sent but not marked ENVIADA"),
                }
                return SendOutcome::Sent { next: None };
            }
            let send_at = schedule.send_at + chrono::Duration::days(i64::from(tag.repeat_every_days));
            match schedules.reschedule(schedule.id, send_at).await {
                Ok(()) => info!(tag_id = %tag.tag_id, next = %send_at, "tag message sent and rescheduled"),
                Err(e) => error!(tag_id = %tag.tag_id, error = %e, "tag message sent but not rescheduled"),
            }
            return SendOutcome::Rescheduled { send_at };
        }

        if let Err(e) = schedules.mark_sent(schedule.id, now).await {
            error!(error = %e, "message sent but not marked ENVIADA");
        }
        let next = match schedule.next_row() {
            Some(row) => {
                let send_at = row.send_at;
                match schedules.insert_schedule(row).await {
                    Ok(()) => {
                        info!(recurrence = schedule.recurrence.as_str(), next = %send_at, "next occurrence appended");
                        Some(send_at)
                    }
                    Err(e) => {
                        error!(recurrence = schedule.recurrence.as_str(), error = %e, "failed to append next occurrence");
                        None
                    }
                }
            }
            None => None,
        };
        info!("scheduled message sent");
        SendOutcome::Sent { next }
    }

    async fn resolve_connection(&self, schedule: &Schedule, preferred: Option<ConnectionId>) -> Result<Connection, PipelineError> {
        for id in [preferred, schedule.connection_id].into_iter().flatten() {
            if let Some(connection) = self.deps.connections.connection(id).await? {
                return Ok(connection);
            }
            warn!(connection_id = %id, "connection not found; trying the next candidate");
        }
        self.deps
            .connections
            .default_connection(schedule.company_id)
            .await?
            .ok_or_else(|| PipelineError::NoConnection(format!("company {}", schedule.company_id)))
    }

    async fn send_content(&self, connection: &Connection, schedule: &Schedule) -> Result<(), PipelineError> {
        let transport = &self.deps.transport;
        match &schedule.media {
            Some(attachment) => {
                let caption = (!schedule.body.trim().is_empty()).then(|| schedule.body.clone());
                let content = OutboundContent::Media {
                    attachment: attachment.clone(),
                    caption,
                };
                transport.send(connection, &schedule.number, &content).await?;
            }
            None => {
                transport
                    .send(connection, &schedule.number, &OutboundContent::Text(schedule.body.clone()))
                    .await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl JobHandler<ScheduleMonitorJob> for SchedulePipeline {
    async fn handle(&self, job: ScheduleMonitorJob, _ctx: JobContext) -> Result<(), JobError> {
        match job {
            ScheduleMonitorJob::VerifySchedules(_) => {
                self.verify_schedules().await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl JobHandler<ScheduledMessageJob> for SchedulePipeline {
    async fn handle(&self, job: ScheduledMessageJob, _ctx: JobContext) -> Result<(), JobError> {
        match job {
            ScheduledMessageJob::SendMessage(send) => {
                self.send_message(send).await?;
            }
        }
        Ok(())
    }
}
