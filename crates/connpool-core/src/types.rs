//! Shared types used across connpool crates.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Address of a backend host, normally `host:port`.
///
/// Used as the registry key, so two spellings of the same host are two
/// different pools.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostAddr(String);

impl HostAddr {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HostAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for HostAddr {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for HostAddr {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Lifecycle state of a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Physical establishment in progress.
    Connecting,
    /// Idle in the pool, available for checkout.
    Ready,
    /// Checked out by a caller.
    InUse,
    /// Undergoing a health refresh; unavailable to callers.
    Refreshing,
    /// Refresh failed; about to be evicted.
    Failed,
}

impl ConnectionState {
    /// Whether a connection may move from `self` to `next`.
    ///
    /// InUse and Refreshing never transition into each other.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Ready)
                | (Ready, InUse)
                | (InUse, Ready)
                | (Ready, Refreshing)
                | (Refreshing, Ready)
                | (Refreshing, Failed)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Ready => write!(f, "ready"),
            ConnectionState::InUse => write!(f, "in-use"),
            ConnectionState::Refreshing => write!(f, "refreshing"),
            ConnectionState::Failed => write!(f, "failed"),
        }
    }
}
