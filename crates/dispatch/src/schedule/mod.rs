//! Scheduled one-off and recurring messages.

pub mod jobs;
pub mod pipeline;

pub use jobs::{SCHEDULE_MONITOR_QUEUE, SCHEDULED_MESSAGES_QUEUE, ScheduleMonitorJob, ScheduledMessageJob, SendMessage, VerifySchedules};
pub use pipeline::{ScheduleDeps, SchedulePipeline, SendOutcome};
