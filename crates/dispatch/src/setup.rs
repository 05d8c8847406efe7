//! Queue definitions, repeatable timers and pipeline wiring.

use std::sync::Arc;
use std::time::Duration;

use courier_core::Clock;
use courier_queue::{QueueDefinition, QueueManager, RepeatableEntry};

use crate::campaign::{CAMPAIGN_QUEUE, CampaignControl, CampaignDeps, CampaignJob, CampaignPipeline};
use crate::coalesce::UpdateCoalescer;
use crate::config::PipelineConfig;
use crate::ports::{
    CampaignStore, ConnectionDirectory, ConversationStore, MessagingTransport, Notifier, ScheduleStore, SettingsStore,
};
use crate::schedule::{
    SCHEDULE_MONITOR_QUEUE, SCHEDULED_MESSAGES_QUEUE, ScheduleDeps, ScheduleMonitorJob, SchedulePipeline,
    ScheduledMessageJob,
};

pub const DEFAULT_CAMPAIGN_CONCURRENCY: usize = 100;

/// Timer-driven sweeps, reconciled on every start.
pub const REPEATABLES: [RepeatableEntry; 2] = [
    RepeatableEntry::new(CAMPAIGN_QUEUE, "VerifyCampaigns", Duration::from_secs(5 * 60)),
    RepeatableEntry::new(SCHEDULE_MONITOR_QUEUE, "VerifySchedules", Duration::from_secs(60)),
];

pub fn queue_definitions(campaign_concurrency: usize) -> Vec<QueueDefinition> {
    vec![
        QueueDefinition::new(CAMPAIGN_QUEUE).with_concurrency(campaign_concurrency),
        QueueDefinition::new(SCHEDULE_MONITOR_QUEUE).with_concurrency(5),
        QueueDefinition::new(SCHEDULED_MESSAGES_QUEUE).with_concurrency(10),
    ]
}

pub fn define_queues(manager: &QueueManager, campaign_concurrency: usize) {
    for definition in queue_definitions(campaign_concurrency) {
        manager.define(definition);
    }
}

/// External collaborators the pipelines run against.
#[derive(Clone)]
pub struct Ports {
    pub campaigns: Arc<dyn CampaignStore>,
    pub schedules: Arc<dyn ScheduleStore>,
    pub settings: Arc<dyn SettingsStore>,
    pub connections: Arc<dyn ConnectionDirectory>,
    pub conversations: Arc<dyn ConversationStore>,
    pub transport: Arc<dyn MessagingTransport>,
    pub notifier: Arc<dyn Notifier>,
    pub clock: Arc<dyn Clock>,
}

/// The wired pipelines, ready to be handed to workers.
#[derive(Clone)]
pub struct Services {
    pub campaigns: Arc<CampaignPipeline>,
    pub control: Arc<CampaignControl>,
    pub schedules: Arc<SchedulePipeline>,
    pub coalescer: Arc<UpdateCoalescer>,
}

/// Build the pipelines over `manager`'s queues. Call after [`define_queues`].
pub fn build(manager: &QueueManager, ports: Ports, config: PipelineConfig) -> Services {
    let coalescer = Arc::new(UpdateCoalescer::new(
        ports.notifier.clone(),
        ports.clock.clone(),
        config.coalesce_window,
    ));

    let campaign_queue = manager.queue::<CampaignJob>();
    let campaigns = Arc::new(CampaignPipeline::new(
        CampaignDeps {
            campaigns: ports.campaigns.clone(),
            settings: ports.settings.clone(),
            connections: ports.connections.clone(),
            conversations: ports.conversations.clone(),
            transport: ports.transport.clone(),
            coalescer: coalescer.clone(),
            clock: ports.clock.clone(),
        },
        campaign_queue.clone(),
        config.clone(),
    ));

    let control = Arc::new(
        CampaignControl::new(
            ports.campaigns.clone(),
            campaign_queue,
            campaigns.campaign_cache(),
            coalescer.clone(),
            ports.clock.clone(),
        )
        .with_pause_delay(config.pause_delay)
        .with_scan_limit(config.control_scan_limit),
    );

    let schedules = Arc::new(SchedulePipeline::new(
        ScheduleDeps {
            schedules: ports.schedules,
            connections: ports.connections,
            transport: ports.transport,
            clock: ports.clock,
        },
        manager.queue::<ScheduledMessageJob>(),
        config,
    ));

    Services {
        campaigns,
        control,
        schedules,
        coalescer,
    }
}

/// Start one worker per queue. Returns how many were started.
pub fn start_workers(manager: &QueueManager, services: &Services) -> usize {
    [
        manager.start_worker::<CampaignJob, _>(services.campaigns.clone()),
        manager.start_worker::<ScheduleMonitorJob, _>(services.schedules.clone()),
        manager.start_worker::<ScheduledMessageJob, _>(services.schedules.clone()),
    ]
    .into_iter()
    .filter(|started| *started)
    .count()
}
