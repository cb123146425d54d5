pub mod stats;
pub mod watch;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::info;

use connpool::{ParameterUpdate, PoolConfig, PoolRegistry, StatsAggregator, TcpTransport, TopologyView};
use connpool_core::ConnPoolConfig;

const RECV_TIMEOUT: Duration = Duration::from_secs(30);

/// A running subsystem built from connpool.toml.
pub struct Subsystem {
    pub registry: Arc<PoolRegistry>,
    pub aggregator: StatsAggregator,
    pub config: PoolConfig,
}

/// Load the config file, build a registry over TCP, install the topology
/// and apply `--set` overrides.
pub async fn build_subsystem(path: &Path, assignments: &[String]) -> Result<Subsystem> {
    let file = ConnPoolConfig::from_file(path)
        .with_context(|| format!("failed to load {}", path.display()))?;

    let config = file
        .pool
        .as_ref()
        .map(PoolConfig::from_section)
        .unwrap_or_default();
    let topology = file
        .topology
        .as_ref()
        .map(TopologyView::from_section)
        .unwrap_or_default();
    if topology.is_empty() {
        bail!("{} lists no hosts under [topology]", path.display());
    }

    let mut update = ParameterUpdate::default();
    for assignment in assignments {
        update.parse_assignment(assignment)?;
    }

    let transport = Arc::new(TcpTransport::new(config.connect_timeout, RECV_TIMEOUT));
    let registry = PoolRegistry::new(config.clone(), transport);
    registry.set_parameters(&update).await?;
    registry.on_topology_change(topology).await?;

    let config = registry.config().await;
    info!(
        pool = %registry.name(),
        hosts = registry.topology().len(),
        min_size = config.min_size,
        max_size = config.max_size,
        "connection pools ready"
    );

    let aggregator =
        StatsAggregator::new(file.health_metrics_enabled()).register(Arc::clone(&registry));
    Ok(Subsystem {
        registry,
        aggregator,
        config,
    })
}

/// Wait up to `limit` for every pool to finish its warm-up.
pub async fn settle(registry: &PoolRegistry, limit: Duration) {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        let mut pending = 0;
        for pool in registry.pools().await {
            pending += pool.snapshot().await.connecting;
        }
        if pending == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// `connpool init`: write a starter config.
pub fn init(output: &Path, group: &str, hosts: &[String]) -> Result<()> {
    if output.exists() {
        bail!("{} already exists", output.display());
    }
    let hosts: Vec<&str> = hosts.iter().map(String::as_str).collect();
    let config = ConnPoolConfig::scaffold(group, &hosts);
    std::fs::write(output, config.to_toml_string()?)
        .with_context(|| format!("failed to write {}", output.display()))?;
    println!("Wrote {}", output.display());
    Ok(())
}
