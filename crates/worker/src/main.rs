use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};

use courier_core::{Clock, SystemClock};
use courier_dispatch::http_transport::{HttpTransport, HttpTransportConfig};
use courier_dispatch::notify::RedisPubSubNotifier;
use courier_dispatch::postgres::PgStore;
use courier_dispatch::{PipelineConfig, Ports, REPEATABLES, TtlCache, setup};
use courier_queue::{QueueBackend, QueueManager, RedisBackend, ShutdownOutcome, Supervisor, SupervisorConfig, reconcile};
use courier_worker::WorkerConfig;
use courier_worker::shutdown::install_shutdown_handler;

const COALESCE_TICK: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    courier_observability::init();

    let config = WorkerConfig::from_env()?;
    let pipeline_config = PipelineConfig::default();

    let backend: Arc<dyn QueueBackend> = Arc::new(
        RedisBackend::connect(&config.redis_url, config.queue_prefix.clone())
            .await
            .context("connecting to the queue backend")?,
    );
    let manager = Arc::new(QueueManager::connect(backend).await.context("checking the queue backend")?);

    let store = Arc::new(PgStore::connect(&config.database_url).await.context("connecting to postgres")?);
    store.migrate().await.context("running migrations")?;

    let mut transport_config = HttpTransportConfig::new(config.transport_url.clone());
    transport_config.token = config.transport_token.clone();
    let transport = Arc::new(HttpTransport::new(transport_config).context("building the transport client")?);
    let notifier = Arc::new(
        RedisPubSubNotifier::connect(&config.redis_url, config.notify_channel.clone())
            .await
            .context("connecting the notifier")?,
    );
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    setup::define_queues(&manager, config.campaign_concurrency);
    let services = setup::build(
        &manager,
        Ports {
            campaigns: store.clone(),
            schedules: store.clone(),
            settings: store.clone(),
            connections: store.clone(),
            conversations: store.clone(),
            transport,
            notifier,
            clock,
        },
        pipeline_config.clone(),
    );
    let started = setup::start_workers(&manager, &services);
    info!(workers = started, "workers started");

    let reconciled = reconcile(manager.backend().as_ref(), &REPEATABLES)
        .await
        .context("registering repeatable jobs")?;
    let stale: usize = reconciled.iter().map(|r| r.removed).sum();
    info!(registered = reconciled.len(), stale_removed = stale, "repeatable jobs in place");

    let mut supervisor = Supervisor::new(
        manager.clone(),
        SupervisorConfig {
            shutdown_timeout: config.shutdown_timeout,
            ..SupervisorConfig::default()
        },
    );
    supervisor.start();
    supervisor.install_panic_hook();

    let sweep = pipeline_config.cache_sweep_interval;
    let campaign_cache = services.campaigns.campaign_cache();
    supervisor.spawn_with("campaign-cache-sweeper", move |cancel| {
        TtlCache::spawn_sweeper(campaign_cache, sweep, "campaign", cancel)
    });
    let settings_cache = services.campaigns.settings_cache();
    supervisor.spawn_with("settings-cache-sweeper", move |cancel| {
        TtlCache::spawn_sweeper(settings_cache, sweep, "settings", cancel)
    });
    let coalescer = services.coalescer.clone();
    supervisor.spawn_with("update-coalescer", move |cancel| coalescer.spawn(COALESCE_TICK, cancel));

    install_shutdown_handler().cancelled().await;

    let coalescer = services.coalescer.clone();
    let outcome = supervisor
        .shutdown(async move {
            let flushed = coalescer.flush_now().await;
            if flushed > 0 {
                info!(flushed, "pending campaign updates flushed");
            }
            store.close().await;
        })
        .await;

    if outcome == ShutdownOutcome::TimedOut {
        warn!("forcing exit after shutdown timeout");
        std::process::exit(1);
    }
    Ok(())
}
