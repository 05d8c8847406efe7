//! Bulk campaign dispatch.

pub mod control;
pub mod delay;
pub mod jobs;
pub mod pipeline;

use std::sync::Arc;

use tracing::warn;

use courier_core::{CampaignId, CompanyId};

use crate::cache::TtlCache;
use crate::coalesce::UpdateCoalescer;
use crate::model::{Campaign, CampaignSettings, Contact};

pub use control::CampaignControl;
pub use jobs::{CAMPAIGN_QUEUE, CampaignJob, DispatchCampaign, PrepareContact, ProcessCampaign, VerifyCampaigns};
pub use pipeline::{CampaignDeps, CampaignPipeline, DispatchOutcome, PrepareOutcome, ProcessOutcome};

/// A campaign together with its contact list, as cached.
#[derive(Debug, Clone, PartialEq)]
pub struct CampaignSnapshot {
    pub campaign: Campaign,
    pub contacts: Vec<Contact>,
}

pub type CampaignCache = TtlCache<CampaignId, Arc<CampaignSnapshot>>;
pub type SettingsCache = TtlCache<CompanyId, CampaignSettings>;

/// Queue a realtime update carrying the campaign's current state.
pub(crate) fn publish(coalescer: &UpdateCoalescer, campaign: &Campaign) {
    match serde_json::to_value(campaign) {
        Ok(record) => coalescer.push(campaign.company_id, campaign.id, record),
        Err(e) => warn!(campaign_id = %campaign.id, error = %e, "failed to serialise campaign update"),
    }
}
