use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use throttled_listener::config::Config;
use throttled_listener::listener::RateLimitedListen;
use throttled_listener::proxy::Forwarder;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load Config
    let config = Config::load()?;

    // Initialize logging; RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting throttled proxy...");
    info!(
        "Throttle: 1 connection per {}ms, burst {}",
        config.refill_interval_ms, config.bucket_size
    );

    // Governs every permit wait for the lifetime of the process
    let shutdown = CancellationToken::new();

    let factory = RateLimitedListen::from_config(&config, shutdown.clone())?;
    let listener = Arc::new(factory.listen(config.listen_addr.as_str()).await?);
    info!("Listening on {}", listener.local_addr()?);

    if let Some(period) = config.stats_interval() {
        let stats = listener.stats();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => stats.log_stats(),
                    _ = shutdown.cancelled() => break,
                }
            }
        });
    }

    let forwarder = Forwarder::new(listener.clone(), config.upstream_addr.clone(), shutdown.clone());
    let forwarder = tokio::spawn(forwarder.run());

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    shutdown.cancel();
    if let Err(e) = listener.close().await {
        warn!("Failed to close listener: {}", e);
    }
    forwarder.await?;
    listener.stats().log_stats();

    Ok(())
}
