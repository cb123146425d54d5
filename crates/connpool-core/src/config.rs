//! connpool.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnPoolConfig {
    pub pool: Option<PoolSection>,
    pub topology: Option<TopologySection>,
    pub features: Option<FeaturesSection>,
}

/// Pool bounds and timers. Every field falls back to the runtime default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolSection {
    /// Logical pool name reported under `pools` in the stats output.
    pub name: Option<String>,
    pub min_size: Option<usize>,
    pub max_size: Option<usize>,
    /// Idle time before a ready connection is refreshed.
    pub refresh_requirement_ms: Option<u64>,
    /// Upper bound on a single refresh round-trip.
    pub refresh_timeout_ms: Option<u64>,
    /// Refresher tick; defaults to a fraction of `refresh_requirement_ms`.
    pub refresh_interval_ms: Option<u64>,
    pub checkout_timeout_ms: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
    /// Refresh every connection as soon as it is checked in.
    pub refresh_after_use: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopologySection {
    /// Hosts that belong to no group.
    pub hosts: Option<Vec<String>>,
    /// Group (replica set) name to member hosts.
    pub groups: Option<BTreeMap<String, Vec<String>>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeaturesSection {
    /// Report `wasNeverUsed` and `totalWasNeverUsed`.
    pub conn_health_metrics: Option<bool>,
}

impl ConnPoolConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: ConnPoolConfig = toml::from_str(content)?;
        if let Some(pool) = &config.pool {
            if let (Some(min), Some(max)) = (pool.min_size, pool.max_size) {
                anyhow::ensure!(
                    min <= max,
                    "pool.min_size ({min}) must not exceed pool.max_size ({max})"
                );
            }
            anyhow::ensure!(pool.max_size != Some(0), "pool.max_size must be at least 1");
        }
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Every host named anywhere in the topology section, deduplicated.
    pub fn topology_hosts(&self) -> Vec<String> {
        let Some(topology) = &self.topology else {
            return Vec::new();
        };
        let mut hosts: Vec<String> = topology.hosts.clone().unwrap_or_default();
        if let Some(groups) = &topology.groups {
            hosts.extend(groups.values().flatten().cloned());
        }
        hosts.sort();
        hosts.dedup();
        hosts
    }

    /// Whether the extended connection health metrics are reported.
    pub fn health_metrics_enabled(&self) -> bool {
        self.features
            .as_ref()
            .and_then(|f| f.conn_health_metrics)
            .unwrap_or(false)
    }

    /// Scaffold a minimal connpool.toml for a single replica set.
    pub fn scaffold(group: &str, hosts: &[&str]) -> Self {
        let mut groups = BTreeMap::new();
        groups.insert(
            group.to_string(),
            hosts.iter().map(|h| h.to_string()).collect(),
        );
        ConnPoolConfig {
            pool: Some(PoolSection {
                name: Some("default".to_string()),
                min_size: Some(1),
                max_size: Some(64),
                refresh_requirement_ms: Some(60_000),
                refresh_timeout_ms: Some(20_000),
                ..Default::default()
            }),
            topology: Some(TopologySection {
                hosts: None,
                groups: Some(groups),
            }),
            features: Some(FeaturesSection {
                conn_health_metrics: Some(true),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_scaffold_round_trips_through_toml() {
        let config = ConnPoolConfig::scaffold("rs0", &["a:27017", "b:27017"]);
        let toml_str = config.to_toml_string().unwrap();
        assert!(toml_str.contains("rs0"));
        let parsed = ConnPoolConfig::from_toml_str(&toml_str).unwrap();
        assert_eq!(parsed.topology_hosts(), vec!["a:27017", "b:27017"]);
        assert!(parsed.health_metrics_enabled());
    }

    #[test]
    fn test_parse_empty() {
        let config = ConnPoolConfig::from_toml_str("").unwrap();
        assert!(config.pool.is_none());
        assert!(config.topology_hosts().is_empty());
        assert!(!config.health_metrics_enabled());
    }

    #[test]
    fn test_parse_full() {
        let toml_str = r#"
[pool]
name = "TaskExecutorPool-0"
min_size = 2
max_size = 8
refresh_requirement_ms = 1000
refresh_after_use = true

[topology]
hosts = ["config:27019"]

[topology.groups]
rs0 = ["a:27017", "b:27017"]

[features]
conn_health_metrics = true
"#;
        let config = ConnPoolConfig::from_toml_str(toml_str).unwrap();
        let pool = config.pool.as_ref().unwrap();
        assert_eq!(pool.name.as_deref(), Some("TaskExecutorPool-0"));
        assert_eq!(pool.min_size, Some(2));
        assert_eq!(pool.refresh_after_use, Some(true));
        assert_eq!(
            config.topology_hosts(),
            vec!["a:27017", "b:27017", "config:27019"]
        );
    }

    #[test]
    fn test_min_above_max_rejected() {
        let err = ConnPoolConfig::from_toml_str("[pool]\nmin_size = 9\nmax_size = 3\n")
            .unwrap_err();
        assert!(err.to_string().contains("must not exceed"));
    }

    #[test]
    fn test_zero_max_rejected() {
        assert!(ConnPoolConfig::from_toml_str("[pool]\nmax_size = 0\n").is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[pool]\nmin_size = 4").unwrap();
        let config = ConnPoolConfig::from_file(file.path()).unwrap();
        assert_eq!(config.pool.unwrap().min_size, Some(4));
    }
}
