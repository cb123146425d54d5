//! Point-in-time pool statistics.
//!
//! [`StatsAggregator::snapshot`] reads each host pool's counters under
//! that pool's own lock, then groups and sums them. No lock spans more
//! than one pool, so totals are sums of individually exact per-host
//! records. Every per-host record satisfies
//! `inUse + available + refreshing <= created`, and so do the sums.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::host_pool::PoolSnapshot;
use crate::registry::PoolRegistry;

/// Counts for one host, or the sum over several.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostStats {
    pub in_use: u64,
    pub available: u64,
    pub refreshing: u64,
    pub created: u64,
    pub refreshed: u64,
    /// Present only with connection health metrics enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub was_never_used: Option<u64>,
}

impl HostStats {
    fn zero(health_metrics: bool) -> Self {
        Self {
            was_never_used: health_metrics.then_some(0),
            ..Self::default()
        }
    }

    fn from_snapshot(snap: &PoolSnapshot, health_metrics: bool) -> Self {
        Self {
            in_use: snap.in_use as u64,
            available: snap.available as u64,
            refreshing: snap.refreshing as u64,
            created: snap.created,
            refreshed: snap.refreshed,
            was_never_used: health_metrics.then_some(snap.was_never_used),
        }
    }

    fn add(&mut self, other: &HostStats) {
        self.in_use += other.in_use;
        self.available += other.available;
        self.refreshing += other.refreshing;
        self.created += other.created;
        self.refreshed += other.refreshed;
        if let Some(n) = other.was_never_used {
            *self.was_never_used.get_or_insert(0) += n;
        }
    }
}

/// A replica group: its member hosts and their summed counts.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupStats {
    pub hosts: Vec<String>,
    #[serde(flatten)]
    pub totals: HostStats,
}

/// One registry: summed counts plus the per-host breakdown.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    #[serde(flatten)]
    pub totals: HostStats,
    pub hosts: BTreeMap<String, HostStats>,
}

/// The full statistics document.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnPoolStats {
    pub num_client_connections: u64,
    #[serde(rename = "numAScopedConnections")]
    pub num_scoped_connections: u64,
    pub total_in_use: u64,
    pub total_available: u64,
    pub total_refreshing: u64,
    pub total_created: u64,
    pub total_refreshed: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_was_never_used: Option<u64>,
    /// Group name to group record. Empty when no host carries a group.
    pub replica_sets: BTreeMap<String, GroupStats>,
    /// Registry name to registry record.
    pub pools: BTreeMap<String, PoolStats>,
    /// Host to host record.
    pub hosts: BTreeMap<String, HostStats>,
}

impl ConnPoolStats {
    /// Process totals as a single record.
    pub fn totals(&self) -> HostStats {
        HostStats {
            in_use: self.total_in_use,
            available: self.total_available,
            refreshing: self.total_refreshing,
            created: self.total_created,
            refreshed: self.total_refreshed,
            was_never_used: self.total_was_never_used,
        }
    }

    fn set_totals(&mut self, totals: &HostStats) {
        self.total_in_use = totals.in_use;
        self.total_available = totals.available;
        self.total_refreshing = totals.refreshing;
        self.total_created = totals.created;
        self.total_refreshed = totals.refreshed;
        self.total_was_never_used = totals.was_never_used;
    }

    pub fn to_json(&self, pretty: bool) -> serde_json::Result<String> {
        if pretty {
            serde_json::to_string_pretty(self)
        } else {
            serde_json::to_string(self)
        }
    }
}

/// Builds [`ConnPoolStats`] from one or more registries.
#[derive(Debug, Default)]
pub struct StatsAggregator {
    registries: Vec<Arc<PoolRegistry>>,
    health_metrics: bool,
}

impl StatsAggregator {
    /// `health_metrics` enables `wasNeverUsed` and `totalWasNeverUsed`.
    pub fn new(health_metrics: bool) -> Self {
        Self {
            registries: Vec::new(),
            health_metrics,
        }
    }

    pub fn register(mut self, registry: Arc<PoolRegistry>) -> Self {
        self.registries.push(registry);
        self
    }

    pub fn health_metrics_enabled(&self) -> bool {
        self.health_metrics
    }

    /// Read every pool and assemble the statistics document. Read-only.
    pub async fn snapshot(&self) -> ConnPoolStats {
        let health = self.health_metrics;
        let mut stats = ConnPoolStats::default();
        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for registry in &self.registries {
            let topology = registry.topology();
            let mut pool_stats = PoolStats {
                totals: HostStats::zero(health),
                hosts: BTreeMap::new(),
            };

            for host in topology.hosts() {
                pool_stats
                    .hosts
                    .insert(host.to_string(), HostStats::zero(health));
                if let Some(group) = topology.group_of(host) {
                    groups
                        .entry(group.to_string())
                        .or_default()
                        .push(host.to_string());
                }
            }
            for pool in registry.pools().await {
                let snap = pool.snapshot().await;
                pool_stats
                    .hosts
                    .insert(pool.host().to_string(), HostStats::from_snapshot(&snap, health));
            }

            for (host, record) in &pool_stats.hosts {
                pool_stats.totals.add(record);
                stats
                    .hosts
                    .entry(host.clone())
                    .or_insert_with(|| HostStats::zero(health))
                    .add(record);
            }

            let gauges = registry.gauges();
            stats.num_client_connections += gauges.client();
            stats.num_scoped_connections += gauges.scoped();
            stats.pools.insert(registry.name().to_string(), pool_stats);
        }

        for (group, mut members) in groups {
            members.sort();
            members.dedup();
            let mut totals = HostStats::zero(health);
            for host in &members {
                if let Some(record) = stats.hosts.get(host) {
                    totals.add(record);
                }
            }
            stats.replica_sets.insert(
                group,
                GroupStats {
                    hosts: members,
                    totals,
                },
            );
        }

        let mut totals = HostStats::zero(health);
        for record in stats.hosts.values() {
            totals.add(record);
        }
        stats.set_totals(&totals);
        stats
    }

    /// Take a snapshot and log it, one event per host plus one for totals.
    pub async fn log_snapshot(&self) -> ConnPoolStats {
        let stats = self.snapshot().await;
        for (host, record) in &stats.hosts {
            info!(
                %host,
                in_use = record.in_use,
                available = record.available,
                refreshing = record.refreshing,
                created = record.created,
                refreshed = record.refreshed,
                was_never_used = record.was_never_used,
                "host pool stats"
            );
        }
        info!(
            total_in_use = stats.total_in_use,
            total_available = stats.total_available,
            total_refreshing = stats.total_refreshing,
            total_created = stats.total_created,
            total_refreshed = stats.total_refreshed,
            total_was_never_used = stats.total_was_never_used,
            client_connections = stats.num_client_connections,
            scoped_connections = stats.num_scoped_connections,
            "connection pool stats"
        );
        stats
    }
}
