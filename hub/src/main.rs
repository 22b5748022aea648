use hub_core::cloud::CloudStackAdapter;
use hub_core::config::HubConfig;
use hub_core::enrollment::EnrollmentManager;
use hub_core::failover::FailoverEngine;
use hub_core::mount::MountManager;
use hub_core::nbd::NbdTargetManager;
use hub_core::orchestrator::ReplicationOrchestrator;
use hub_core::progress::ProgressBus;
use hub_core::registry::{ConfigCredentialResolver, ConfigNetworkResolver, ConfigNodeResolver};
use hub_core::scheduler::Scheduler;
use hub_core::store::Database;
use hub_core::{api, logging};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = HubConfig::load().map_err(|e| anyhow::anyhow!("configuration error: {e}"))?;
    logging::init(&config.logging.level, config.logging.json_format);
    info!("hub starting");

    let database = Database::new(&config.database.url).await.map_err(|e| anyhow::anyhow!(e))?;
    database.migrate().await.map_err(|e| anyhow::anyhow!(e))?;
    info!("store migrated");
    let pool = database.pool().clone();
    let database = Arc::new(database);

    let node_clients = Arc::new(ConfigNodeResolver::new(config.node_registry.clone()));
    let credentials = Arc::new(ConfigCredentialResolver::new(config.credentials.clone()));
    let networks = Arc::new(ConfigNetworkResolver::new(config.networks.clone()));
    let cloud = Arc::new(CloudStackAdapter::new(
        config.cloud.api_url.clone(),
        config.cloud.api_key.clone(),
        config.cloud.secret_key.clone(),
    ));
    let nbd = Arc::new(NbdTargetManager::new(config.server.public_host.clone()));
    let progress = Arc::new(ProgressBus::new());

    let orchestrator = ReplicationOrchestrator::new(
        pool.clone(),
        node_clients.clone(),
        credentials,
        cloud.clone(),
        nbd,
        progress.clone(),
    );

    let failover = FailoverEngine::new(pool.clone(), node_clients, cloud, networks, orchestrator.clone());
    let scheduler = Scheduler::new(pool.clone(), orchestrator.clone(), config.scheduler.tick_seconds);
    let mounts = MountManager::new(pool.clone());
    let enrollment = Arc::new(EnrollmentManager::new(pool.clone()));

    tokio::spawn(scheduler.run());
    info!(tick_seconds = config.scheduler.tick_seconds, "scheduler started");

    tokio::spawn(mounts.clone().run_sweep(Duration::from_secs(60)));
    info!("restore mount sweep started");

    {
        let enrollment = enrollment.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                ticker.tick().await;
                match enrollment.sweep_expired().await {
                    Ok(0) => {}
                    Ok(n) => info!(count = n, "swept expired enrollments"),
                    Err(e) => error!(error = %e, "enrolment sweep failed"),
                }
            }
        });
    }
    info!("enrolment expiry sweep started");

    let state = api::AppState {
        db: database,
        config: Arc::new(config.clone()),
        enrollment,
        orchestrator: Arc::new(orchestrator),
        failover: Arc::new(failover),
        mounts: Arc::new(mounts),
        progress,
    };

    let app = api::router(state);
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "hub listening");
    axum::serve(listener, app).await?;

    Ok(())
}
