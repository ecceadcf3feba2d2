//! Smoke-test binary: boots a proxy from environment config and prints its
//! state every second until interrupted.

use std::time::Duration;

use standby_proxy::proxy::Proxy;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let proxy = Proxy::from_env().await?;
    tracing::info!("proxy started");

    loop {
        let metrics = proxy.get_metrics().await;
        tracing::info!(
            state = ?metrics.state,
            primary_healthy = metrics.primary_healthy,
            fallback_healthy = metrics.fallback_healthy,
            pending_writes = metrics.pending_write_count,
            unsynced = metrics.unsynced_count,
            "status"
        );
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}
