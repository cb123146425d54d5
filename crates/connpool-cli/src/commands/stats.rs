//! `connpool stats`: print one statistics document.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;

use super::{build_subsystem, settle};

pub async fn stats(config: &Path, set: &[String], settle_ms: u64, compact: bool) -> Result<()> {
    let subsystem = build_subsystem(config, set).await?;
    settle(&subsystem.registry, Duration::from_millis(settle_ms)).await;

    let stats = subsystem.aggregator.snapshot().await;
    println!("{}", stats.to_json(!compact)?);

    subsystem.registry.shutdown().await;
    Ok(())
}
