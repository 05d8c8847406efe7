#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use courier_core::{CompanyId, ConnectionId, ManualClock};
use courier_dispatch::memory::{CollectingNotifier, InMemoryStore, RecordingTransport};
use courier_dispatch::model::{Campaign, CampaignStatus, Connection, Contact};
use courier_dispatch::setup::{self, Ports, Services};
use courier_dispatch::PipelineConfig;
use courier_queue::{InMemoryBackend, QueueBackend, QueueJob, QueueManager};

pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub transport: Arc<RecordingTransport>,
    pub notifier: Arc<CollectingNotifier>,
    pub clock: Arc<ManualClock>,
    pub manager: Arc<QueueManager>,
    pub services: Services,
    pub company: CompanyId,
    pub connection: Connection,
}

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 3, 9, 0, 0).unwrap()
}

pub fn test_config() -> PipelineConfig {
    PipelineConfig {
        batch_pause: Duration::from_millis(1),
        ..PipelineConfig::default()
    }
}

pub async fn harness() -> Harness {
    harness_with(test_config()).await
}

pub async fn harness_with(config: PipelineConfig) -> Harness {
    let clock = ManualClock::arc(start_time());
    let backend: Arc<dyn QueueBackend> = Arc::new(InMemoryBackend::with_clock(clock.clone()));
    let manager = Arc::new(QueueManager::connect(backend).await.unwrap());
    setup::define_queues(&manager, 10);

    let store = Arc::new(InMemoryStore::new());
    let transport = Arc::new(RecordingTransport::new());
    let notifier = Arc::new(CollectingNotifier::default());
    let company = CompanyId::new();
    let connection = Connection {
        id: ConnectionId::new(),
        company_id: company,
        name: "main".into(),
        is_default: true,
    };
    store.add_connection(connection.clone()).unwrap();

    let services = setup::build(
        &manager,
        Ports {
            campaigns: store.clone(),
            schedules: store.clone(),
            settings: store.clone(),
            connections: store.clone(),
            conversations: store.clone(),
            transport: transport.clone(),
            notifier: notifier.clone(),
            clock: clock.clone(),
        },
        config,
    );

    Harness {
        store,
        transport,
        notifier,
        clock,
        manager,
        services,
        company,
        connection,
    }
}

impl Harness {
    /// A campaign with `n` contacts named after their index, stored with `status`.
    pub fn campaign(&self, status: CampaignStatus, n: usize) -> (Campaign, Vec<Contact>) {
        let mut campaign = Campaign::new(self.company, "launch");
        campaign.status = status;
        campaign.messages = vec!["Olá {firstName}".into()];
        campaign.scheduled_at = Some(self.clock_now() - chrono::Duration::minutes(1));
        let contacts: Vec<Contact> = (0..n)
            .map(|i| Contact::new(format!("Contact{i} Silva"), format!("55119000000{i:02}")))
            .collect();
        self.store.add_campaign(campaign.clone(), contacts.clone()).unwrap();
        (campaign, contacts)
    }

    pub fn clock_now(&self) -> DateTime<Utc> {
        use courier_core::Clock;
        self.clock.now()
    }

    /// Unfinished jobs of `J`'s queue, decoded.
    pub async fn pending<J: QueueJob>(&self) -> Vec<J> {
        self.manager
            .queue::<J>()
            .pending(10_000)
            .await
            .unwrap()
            .into_iter()
            .map(|(_, job)| job)
            .collect()
    }
}
