//! Jobs on the `campaign` queue.

use serde::{Deserialize, Serialize};

use courier_core::{CampaignId, ContactId, ShippingId};
use courier_queue::QueueJob;

use crate::model::Variable;

pub const CAMPAIGN_QUEUE: &str = "campaign";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "data")]
pub enum CampaignJob {
    /// Repeatable sweep for due campaigns.
    VerifyCampaigns(VerifyCampaigns),
    ProcessCampaign(ProcessCampaign),
    PrepareContact(PrepareContact),
    DispatchCampaign(DispatchCampaign),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyCampaigns {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessCampaign {
    pub id: CampaignId,
    /// Jitter applied when this job was enqueued, in milliseconds.
    pub delay: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrepareContact {
    pub contact_id: ContactId,
    pub campaign_id: CampaignId,
    /// Dispatch delay for this contact, in milliseconds.
    pub delay: u64,
    #[serde(default)]
    pub variables: Vec<Variable>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchCampaign {
    pub campaign_id: CampaignId,
    pub campaign_shipping_id: ShippingId,
    pub contact_list_item_id: ContactId,
}

impl DispatchCampaign {
    /// Job id shared by every enqueue of this shipping's dispatch.
    pub fn job_id(&self) -> String {
        dispatch_job_id(self.campaign_id, self.campaign_shipping_id)
    }
}

pub fn dispatch_job_id(campaign_id: CampaignId, shipping_id: ShippingId) -> String {
    format!("dispatch-{campaign_id}-{shipping_id}")
}

impl CampaignJob {
    /// The campaign a job acts on; `None` for the periodic sweep.
    pub fn campaign_id(&self) -> Option<CampaignId> {
        match self {
            CampaignJob::VerifyCampaigns(_) => None,
            CampaignJob::ProcessCampaign(p) => Some(p.id),
            CampaignJob::PrepareContact(p) => Some(p.campaign_id),
            CampaignJob::DispatchCampaign(d) => Some(d.campaign_id),
        }
    }
}

impl QueueJob for CampaignJob {
    const QUEUE: &'static str = CAMPAIGN_QUEUE;

    fn name(&self) -> &'static str {
        match self {
            CampaignJob::VerifyCampaigns(_) => "VerifyCampaigns",
            CampaignJob::ProcessCampaign(_) => "ProcessCampaign",
            CampaignJob::PrepareContact(_) => "PrepareContact",
            CampaignJob::DispatchCampaign(_) => "DispatchCampaign",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_queue::job::{decode, encode};

    #[test]
    fn payloads_use_camel_case_field_names() {
        let job = CampaignJob::DispatchCampaign(DispatchCampaign {
            campaign_id: CampaignId::new(),
            campaign_shipping_id: ShippingId::new(),
            contact_list_item_id: ContactId::new(),
        });
        let (name, data) = encode(&job).unwrap();
        assert_eq!(name, "DispatchCampaign");
        assert!(data.get("campaignShippingId").is_some());
        assert!(data.get("contactListItemId").is_some());
    }

    #[test]
    fn repeatable_sweep_decodes_from_empty_data() {
        let job: CampaignJob = decode("VerifyCampaigns", &serde_json::json!({})).unwrap();
        assert_eq!(job, CampaignJob::VerifyCampaigns(VerifyCampaigns {}));
        assert_eq!(job.campaign_id(), None);
    }

    #[test]
    fn dispatch_job_id_is_deterministic() {
        let d = DispatchCampaign {
            campaign_id: CampaignId::new(),
            campaign_shipping_id: ShippingId::new(),
            contact_list_item_id: ContactId::new(),
        };
        assert_eq!(d.job_id(), d.clone().job_id());
        assert!(d.job_id().starts_with("dispatch-"));
    }
}
