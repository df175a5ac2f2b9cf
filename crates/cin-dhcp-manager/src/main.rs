use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use cin_api::build_router;
use cin_api::state::ApiState;
use cin_common::config::config_path;
use cin_common::{LogFormat, ManagerConfig};
use cin_kea::KeaClient;
use cin_leases::LeaseService;
use cin_registry::{MappingStore, SubnetRegistry};
use tracing::{debug, error, info};

const DEFAULT_LOG_FILTER: &str =
    "cin_dhcp_manager=info,cin_api=info,cin_registry=info,cin_kea=info,cin_leases=info,tower_http=info";

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let path = config_path();
    let config = ManagerConfig::load_or_default(&path)?;
    init_tracing(config.log_format);

    info!(config = %path.display(), "cin-dhcp-manager starting...");

    // Local mapping store
    let store = MappingStore::open(&config.database_path).with_context(|| {
        format!("Failed to open database {}", config.database_path.display())
    })?;
    info!(path = %config.database_path.display(), "Mapping store ready");

    // Kea control agents
    let kea = KeaClient::new(&config.kea).context("Failed to build Kea client")?;
    for server in kea.servers() {
        info!(server = %server.name, url = %server.url, priority = server.priority, "Kea server");
    }
    if let Some(file) = &config.kea.config_file {
        info!(file = %file, "Subnet changes will be persisted with config-write");
    }

    let registry = Arc::new(SubnetRegistry::new(
        kea.clone(),
        store,
        config.kea.config_file.clone(),
    ));
    let leases = Arc::new(LeaseService::new(kea, &config.leases));

    // Lease page cache purge timer (every 30s)
    {
        let leases = leases.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(30)).await;
                let purged = leases.purge_cache();
                if purged > 0 {
                    debug!(purged, "Purged expired lease pages");
                }
            }
        });
    }

    let router = build_router(ApiState { registry, leases });

    let listener = tokio::net::TcpListener::bind(&config.listen_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_address))?;
    info!("API listening on {}", config.listen_address);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("API server failed")?;

    info!("Shutting down...");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {e}");
    }
}
