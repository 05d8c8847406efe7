//! Jobs on the `schedule-monitor` and `scheduled-messages` queues.

use serde::{Deserialize, Serialize};

use courier_core::{ConnectionId, ScheduleId};
use courier_queue::QueueJob;

pub const SCHEDULE_MONITOR_QUEUE: &str = "schedule-monitor";
pub const SCHEDULED_MESSAGES_QUEUE: &str = "scheduled-messages";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", content = "data")]
pub enum ScheduleMonitorJob {
    /// Repeatable sweep for due schedules.
    VerifySchedules(VerifySchedules),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifySchedules {}

impl QueueJob for ScheduleMonitorJob {
    const QUEUE: &'static str = SCHEDULE_MONITOR_QUEUE;

    fn name(&self) -> &'static str {
        match self {
            ScheduleMonitorJob::VerifySchedules(_) => "VerifySchedules",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", content = "data")]
pub enum ScheduledMessageJob {
    SendMessage(SendMessage),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    pub schedule_id: ScheduleId,
    /// Connection chosen by the producer; falls back to the schedule's, then the company default.
    #[serde(default)]
    pub whatsapp_id: Option<ConnectionId>,
}

impl QueueJob for ScheduledMessageJob {
    const QUEUE: &'static str = SCHEDULED_MESSAGES_QUEUE;

    fn name(&self) -> &'static str {
        match self {
            ScheduledMessageJob::SendMessage(_) => "SendMessage",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_queue::job::{decode, encode};

    #[test]
    fn send_message_tolerates_a_missing_connection() {
        let id = ScheduleId::new();
        let job: ScheduledMessageJob =
            decode("SendMessage", &serde_json::json!({ "scheduleId": id.to_string() })).unwrap();
        assert_eq!(
            job,
            ScheduledMessageJob::SendMessage(SendMessage {
                schedule_id: id,
                whatsapp_id: None
            })
        );
    }

    #[test]
    fn monitor_job_encodes_under_its_variant_name() {
        let (name, data) = encode(&ScheduleMonitorJob::VerifySchedules(VerifySchedules {})).unwrap();
        assert_eq!(name, "VerifySchedules");
        assert_eq!(data, serde_json::json!({}));
    }
}
