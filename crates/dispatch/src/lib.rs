//! Campaign and scheduled-message dispatch on top of `courier-queue`.
//!
//! - [`campaign`]: VerifyCampaigns → ProcessCampaign → PrepareContact → DispatchCampaign, plus pause/resume/cancel
//! - [`schedule`]: VerifySchedules → SendMessage, with recurrence
//! - [`ports`]: the stores, transport and notifier the pipelines call
//! - [`memory`], [`postgres`], [`http_transport`], [`notify`]: port implementations
//! - [`setup`]: queue definitions, repeatable timers and wiring

pub mod cache;
pub mod campaign;
pub mod coalesce;
pub mod config;
pub mod error;
pub mod http_transport;
pub mod memory;
pub mod model;
pub mod notify;
pub mod ports;
pub mod postgres;
pub mod schedule;
pub mod setup;
pub mod template;

pub use cache::TtlCache;
pub use campaign::{CampaignControl, CampaignJob, CampaignPipeline, DispatchOutcome, PrepareOutcome, ProcessOutcome};
pub use coalesce::UpdateCoalescer;
pub use config::PipelineConfig;
pub use error::{NotifyError, PipelineError, StoreError, TransportError};
pub use schedule::{ScheduleMonitorJob, SchedulePipeline, ScheduledMessageJob, SendOutcome};
pub use setup::{Ports, REPEATABLES, Services};
