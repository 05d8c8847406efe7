//! Collaborator interfaces the pipelines depend on.
//!
//! Every mutation that guards an invariant is expressed as a conditional
//! update returning whether it applied, so concurrent jobs can race safely.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use courier_core::{CampaignId, CompanyId, ConnectionId, ContactId, ConversationId, ScheduleId, ShippingId, UserId};

use crate::error::{NotifyError, StoreError, TransportError};
use crate::model::{
    Campaign, CampaignSettings, CampaignShipping, CampaignStatus, Connection, Contact, ConversationStatus, MediaAttachment,
    NewShipping, Schedule, ScheduleStatus,
};

#[async_trait]
pub trait CampaignStore: Send + Sync + 'static {
    /// PROGRAMADA campaigns with `scheduled_at <= now`, oldest first.
    async fn due_campaigns(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Campaign>, StoreError>;

    async fn campaign(&self, id: CampaignId) -> Result<Option<Campaign>, StoreError>;

    async fn contacts(&self, campaign_id: CampaignId) -> Result<Vec<Contact>, StoreError>;

    async fn contact(&self, campaign_id: CampaignId, contact_id: ContactId) -> Result<Option<Contact>, StoreError>;

    async fn contact_count(&self, campaign_id: CampaignId) -> Result<u64, StoreError>;

    /// Set `to` only if the current status is one of `from`. `completed_at` is
    /// written alongside when given. Returns whether the row changed.
    async fn transition_status(
        &self,
        id: CampaignId,
        from: &[CampaignStatus],
        to: CampaignStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError>;

    /// Atomic find-or-create on (campaign, contact). The flag tells whether the row is new.
    async fn find_or_create_shipping(&self, new: NewShipping) -> Result<(CampaignShipping, bool), StoreError>;

    async fn shipping(&self, id: ShippingId) -> Result<Option<CampaignShipping>, StoreError>;

    async fn set_shipping_job(&self, id: ShippingId, job_id: &str) -> Result<(), StoreError>;

    /// Stamp `delivered_at` if unset. Returns whether this call set it.
    async fn mark_delivered(&self, id: ShippingId, at: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Stamp `confirmation_requested_at` if unset.
    async fn mark_confirmation_requested(&self, id: ShippingId, at: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Stamp `confirmed_at` if a confirmation was requested and none recorded yet.
    async fn mark_confirmed(&self, id: ShippingId, at: DateTime<Utc>) -> Result<bool, StoreError>;

    async fn delivered_count(&self, campaign_id: CampaignId) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait ScheduleStore: Send + Sync + 'static {
    /// PENDENTE, unsent rows with `send_at <= now`, oldest first.
    async fn due_schedules(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Schedule>, StoreError>;

    /// Flip the given rows PENDENTE → AGENDADA. Returns the ids that were flipped.
    async fn claim_schedules(&self, ids: &[ScheduleId]) -> Result<Vec<ScheduleId>, StoreError>;

    async fn schedule(&self, id: ScheduleId) -> Result<Option<Schedule>, StoreError>;

    async fn set_schedule_status(&self, id: ScheduleId, status: ScheduleStatus) -> Result<(), StoreError>;

    /// ENVIADA with `sent_at`.
    async fn mark_sent(&self, id: ScheduleId, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Back to PENDENTE at a new `send_at`.
    async fn reschedule(&self, id: ScheduleId, send_at: DateTime<Utc>) -> Result<(), StoreError>;

    async fn insert_schedule(&self, schedule: Schedule) -> Result<(), StoreError>;
}

#[async_trait]
pub trait SettingsStore: Send + Sync + 'static {
    /// Settings for a company, defaults when none are stored.
    async fn campaign_settings(&self, company_id: CompanyId) -> Result<CampaignSettings, StoreError>;
}

#[async_trait]
pub trait ConnectionDirectory: Send + Sync + 'static {
    async fn connection(&self, id: ConnectionId) -> Result<Option<Connection>, StoreError>;

    async fn default_connection(&self, company_id: CompanyId) -> Result<Option<Connection>, StoreError>;
}

/// Parameters for opening (or reusing) a conversation after a campaign send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationRequest {
    pub company_id: CompanyId,
    pub contact_id: ContactId,
    pub connection_id: ConnectionId,
    pub status: ConversationStatus,
    pub user_id: Option<UserId>,
}

#[async_trait]
pub trait ConversationStore: Send + Sync + 'static {
    /// Reuse the contact's unfinished conversation on this connection or open one.
    async fn open_or_reuse(&self, request: ConversationRequest) -> Result<ConversationId, StoreError>;
}

/// What to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundContent {
    Text(String),
    Media {
        attachment: MediaAttachment,
        caption: Option<String>,
    },
}

/// Result of a destination existence check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistsResult {
    pub exists: bool,
    /// Provider-normalised destination id to send to.
    pub normalized_id: Option<String>,
}

#[async_trait]
pub trait MessagingTransport: Send + Sync + 'static {
    /// Returns the provider message id.
    async fn send(&self, connection: &Connection, destination: &str, content: &OutboundContent) -> Result<String, TransportError>;

    async fn check_exists(&self, connection: &Connection, number: &str) -> Result<ExistsResult, TransportError>;
}

#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    /// Fire-and-forget event to a tenant-scoped audience.
    async fn emit(&self, event: &str, payload: JsonValue) -> Result<(), NotifyError>;
}
