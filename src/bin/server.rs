//! Timeline sync server binary.
//!
//! Reads configuration from `TIMELINE_SYNC_CONFIG` and the environment,
//! loads persisted tasks, and serves the real-time protocol until Ctrl-C.

use timeline_sync::{SyncConfig, SyncService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("timeline_sync=info")),
        )
        .init();

    let config = SyncConfig::from_env().map_err(|e| anyhow::anyhow!("bad configuration: {e}"))?;

    tracing::info!(
        bind = %config.bind_addr(),
        storage = ?config.storage.backend,
        broadcast = ?config.sync.broadcast_kind,
        "timeline-sync starting"
    );

    let service = SyncService::start(&config).await.map_err(|e| {
        tracing::error!(error = %e, "timeline-sync failed to start");
        anyhow::anyhow!("startup failed: {e}")
    })?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested; flushing pending saves");

    service.shutdown().await.map_err(|e| {
        tracing::error!(error = %e, "final flush failed");
        anyhow::anyhow!("shutdown failed: {e}")
    })?;

    tracing::info!("timeline-sync shut down cleanly");
    Ok(())
}
