use node_core::api::{self, AppState, LocalEnrollmentState};
use node_core::config::NodeConfig;
use node_core::enrollment::{EnrollmentClient, NodeKeypair};
use node_core::mover::MoverSupervisor;
use node_core::replication::ReplicateManager;
use node_core::tunnel::TunnelSupervisor;
use node_core::vcenter::{VCenterAdapter, VCenterHttpAdapter};
use node_core::logging;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = NodeConfig::load().map_err(|e| anyhow::anyhow!("configuration error: {e}"))?;
    logging::init(&config.logging.level, config.logging.json_format);
    info!("node starting");

    let keypair = Arc::new(NodeKeypair::load_or_generate(Path::new("/etc/node/node_key")).await?);
    let enrollment_client = Arc::new(EnrollmentClient::new(&config.tunnel.oma_host, config.tunnel.oma_port));

    let vcenter: Arc<dyn VCenterAdapter> = Arc::new(VCenterHttpAdapter::new());
    let mover = Arc::new(MoverSupervisor::new(
        config.mover.binary_path.clone(),
        config.mover.max_retries,
        std::time::Duration::from_secs(config.mover.retry_backoff_seconds),
    ));
    let replication_manager =
        Arc::new(ReplicateManager::new(vcenter.clone(), mover, config.mover.chunk_size_bytes, config.mover.throughput_cap_mbps));

    let (tunnel_supervisor, tunnel_state) = TunnelSupervisor::new(config.tunnel.clone());
    tokio::spawn(async move { tunnel_supervisor.run().await });
    info!("tunnel supervisor started");

    let state = AppState {
        config: Arc::new(config.clone()),
        vcenter,
        replication: replication_manager,
        tunnel_state,
        enrollment_client,
        keypair,
        local_enrollment: Arc::new(RwLock::new(LocalEnrollmentState::default())),
        nbd_export: Arc::new(RwLock::new(None)),
    };

    let app = api::router(state);
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "node control API listening");
    axum::serve(listener, app).await?;

    Ok(())
}
