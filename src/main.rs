use anyhow::Result;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use microgrid_supervisor::api::{self, AppState};
use microgrid_supervisor::config::load_config;
use microgrid_supervisor::modbus::TcpTransport;
use microgrid_supervisor::{metrics, Supervisor};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("microgrid_supervisor=info")),
        )
        .init();

    info!("Starting microgrid supervisor v{}", env!("CARGO_PKG_VERSION"));

    let config = Arc::new(load_config()?);
    info!(
        "Loaded {} devices, polling every {}ms",
        config.devices.len(),
        config.polling.interval_ms
    );

    let metrics = if config.server.metrics_enabled {
        Some(metrics::install()?)
    } else {
        None
    };

    let transport = Arc::new(TcpTransport::new(config.polling.request_timeout()));
    let supervisor = Arc::new(Supervisor::new(&config, transport));
    let polling = supervisor.spawn_polling();

    let state = AppState {
        supervisor,
        config,
        metrics,
    };

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
        info!("Shutting down");
    };

    let served = api::serve(state, shutdown).await;
    polling.abort();
    served
}
