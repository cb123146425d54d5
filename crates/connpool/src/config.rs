//! Runtime pool configuration and live parameter updates.

use std::time::Duration;

use connpool_core::config::PoolSection;

use crate::error::{PoolError, PoolResult};

/// Configuration shared by every host pool in a registry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    /// Logical pool name reported under `pools` (default: "default").
    pub name: String,
    /// Connections kept warm per host (default: 1).
    pub min_size: usize,
    /// Maximum connections per host (default: 64).
    pub max_size: usize,
    /// Idle time before a ready connection is refreshed (default: 60s).
    pub refresh_requirement: Duration,
    /// Upper bound for one refresh round-trip (default: 20s).
    pub refresh_timeout: Duration,
    /// Fixed refresher tick. `None` derives it from `refresh_requirement`.
    pub refresh_interval: Option<Duration>,
    /// Maximum time a checkout waits for capacity (default: 20s).
    pub checkout_timeout: Duration,
    /// Timeout for establishing a connection (default: 10s).
    pub connect_timeout: Duration,
    /// Refresh every connection as soon as it is checked in (default: false).
    pub refresh_after_use: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            min_size: 1,
            max_size: 64,
            refresh_requirement: Duration::from_secs(60),
            refresh_timeout: Duration::from_secs(20),
            refresh_interval: None,
            checkout_timeout: Duration::from_secs(20),
            connect_timeout: Duration::from_secs(10),
            refresh_after_use: false,
        }
    }
}

impl PoolConfig {
    /// Build from the `[pool]` section of connpool.toml.
    pub fn from_section(section: &PoolSection) -> Self {
        let defaults = Self::default();
        let ms = |v: Option<u64>, d: Duration| v.map(Duration::from_millis).unwrap_or(d);
        Self {
            name: section.name.clone().unwrap_or(defaults.name),
            min_size: section.min_size.unwrap_or(defaults.min_size),
            max_size: section.max_size.unwrap_or(defaults.max_size),
            refresh_requirement: ms(section.refresh_requirement_ms, defaults.refresh_requirement),
            refresh_timeout: ms(section.refresh_timeout_ms, defaults.refresh_timeout),
            refresh_interval: section.refresh_interval_ms.map(Duration::from_millis),
            checkout_timeout: ms(section.checkout_timeout_ms, defaults.checkout_timeout),
            connect_timeout: ms(section.connect_timeout_ms, defaults.connect_timeout),
            refresh_after_use: section.refresh_after_use.unwrap_or(defaults.refresh_after_use),
        }
    }

    /// Refresher tick: the fixed interval if set, else a quarter of the
    /// refresh requirement, never below 10ms.
    pub fn effective_refresh_interval(&self) -> Duration {
        self.refresh_interval
            .unwrap_or(self.refresh_requirement / 4)
            .max(Duration::from_millis(10))
    }

    /// Apply an update, rejecting bounds that would leave `min > max`.
    pub fn apply(&mut self, update: &ParameterUpdate) -> PoolResult<()> {
        let min = update.min_size.unwrap_or(self.min_size);
        let max = update.max_size.unwrap_or(self.max_size);
        if max == 0 {
            return Err(PoolError::InvalidParameter(
                "maxSize must be at least 1".to_string(),
            ));
        }
        if min > max {
            return Err(PoolError::InvalidParameter(format!(
                "minSize ({min}) must not exceed maxSize ({max})"
            )));
        }
        if update.refresh_requirement.is_some_and(|r| r.is_zero()) {
            return Err(PoolError::InvalidParameter(
                "refreshRequirementMS must be positive".to_string(),
            ));
        }
        self.min_size = min;
        self.max_size = max;
        if let Some(requirement) = update.refresh_requirement {
            self.refresh_requirement = requirement;
        }
        if let Some(after_use) = update.refresh_after_use {
            self.refresh_after_use = after_use;
        }
        Ok(())
    }
}

/// A runtime parameter change. Unset fields are left alone.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParameterUpdate {
    pub min_size: Option<usize>,
    pub max_size: Option<usize>,
    pub refresh_requirement: Option<Duration>,
    pub refresh_after_use: Option<bool>,
}

impl ParameterUpdate {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Merge a `name=value` assignment such as `minSize=15`.
    ///
    /// Recognized names: `minSize`, `maxSize`, `refreshRequirementMS`,
    /// `refreshAfterUse`.
    pub fn parse_assignment(&mut self, assignment: &str) -> PoolResult<()> {
        let (name, value) = assignment.split_once('=').ok_or_else(|| {
            PoolError::InvalidParameter(format!("expected name=value, got '{assignment}'"))
        })?;
        let (name, value) = (name.trim(), value.trim());
        let bad_value =
            || PoolError::InvalidParameter(format!("invalid value '{value}' for {name}"));
        match name {
            "minSize" => self.min_size = Some(value.parse().map_err(|_| bad_value())?),
            "maxSize" => self.max_size = Some(value.parse().map_err(|_| bad_value())?),
            "refreshRequirementMS" => {
                let ms: u64 = value.parse().map_err(|_| bad_value())?;
                self.refresh_requirement = Some(Duration::from_millis(ms));
            }
            "refreshAfterUse" => {
                self.refresh_after_use = Some(value.parse().map_err(|_| bad_value())?)
            }
            other => {
                return Err(PoolError::InvalidParameter(format!(
                    "unknown parameter '{other}'"
                )));
            }
        }
        Ok(())
    }
}
