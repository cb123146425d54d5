//! `connpool watch`: run the pools with the refresher and log stats.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use connpool::Refresher;

use super::build_subsystem;

pub async fn watch(config: &Path, set: &[String], interval_secs: u64) -> Result<()> {
    let subsystem = build_subsystem(config, set).await?;
    let refresher = Refresher::new(subsystem.registry.clone());
    refresher.start();
    info!(
        interval_secs,
        refresh_interval_ms = subsystem.config.effective_refresh_interval().as_millis() as u64,
        "watching connection pools, Ctrl-C to stop"
    );

    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                subsystem.aggregator.log_snapshot().await;
            }
            result = &mut ctrl_c => {
                result.context("failed to install Ctrl-C handler")?;
                info!("shutdown signal received");
                break;
            }
        }
    }

    refresher.shutdown().await;
    subsystem.registry.shutdown().await;
    let stats = subsystem.aggregator.snapshot().await;
    info!(
        total_created = stats.total_created,
        total_refreshed = stats.total_refreshed,
        "connpool stopped"
    );
    Ok(())
}
