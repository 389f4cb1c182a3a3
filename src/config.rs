//! Adapter and tunnel configuration.
//!
//! Everything has a default; a JSON file (see [`Config::load`]) only needs
//! to name the fields it changes.  The CLI layers its flags on top.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::cache::{ListingPolicy, TRACE_PENDING_ENTRY};
use crate::errors::{RemoteError, RemoteResult};
use crate::path::{DEFAULT_SENTINEL, PathTranslator};
use crate::uri::DEFAULT_SCHEME;

// ── Constants ──────────────────────────────────────────────────────────────

/// Well-known tunnel endpoint on the management host.
pub const DEFAULT_TUNNEL_PATH: &str = "/AppServiceTunnel/Tunnel.ashx";

const DEFAULT_KEEPALIVE_RETRY_SECS: u64 = 5;
const DEFAULT_KEEPALIVE_STEADY_SECS: u64 = 60;

// ── Tunnel ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Local listen port; `0` lets the OS pick one.
    pub local_port: u16,
    pub bind_address: IpAddr,
    /// Upstream path on the management host.
    pub path: String,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            local_port: 0,
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            path: DEFAULT_TUNNEL_PATH.to_string(),
        }
    }
}

impl TunnelConfig {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.local_port)
    }
}

// ── Keep-alive ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct KeepAliveConfig {
    pub enabled: bool,
    /// Delay after a failed probe.
    pub retry_interval_secs: u64,
    /// Delay after a successful probe.
    pub steady_interval_secs: u64,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            retry_interval_secs: DEFAULT_KEEPALIVE_RETRY_SECS,
            steady_interval_secs: DEFAULT_KEEPALIVE_STEADY_SECS,
        }
    }
}

impl KeepAliveConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub fn steady_interval(&self) -> Duration {
        Duration::from_secs(self.steady_interval_secs)
    }
}

// ── Top level ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub scheme: String,
    /// Reject every mutating filesystem operation.
    pub read_only: bool,
    /// Segment that marks the home directory in remote paths.
    pub home_sentinel: String,
    /// Glob patterns of entries left out of listings.
    pub hidden_entries: Vec<String>,
    /// Synthetic "open externally" entry that sorts first.
    pub pinned_entry: Option<String>,
    pub tunnel: TunnelConfig,
    pub keepalive: KeepAliveConfig,
    /// Overall bound on attaching a debugger; unbounded when unset.
    pub attach_deadline_secs: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scheme: DEFAULT_SCHEME.to_string(),
            read_only: false,
            home_sentinel: DEFAULT_SENTINEL.to_string(),
            hidden_entries: vec![TRACE_PENDING_ENTRY.to_string()],
            pinned_entry: None,
            tunnel: TunnelConfig::default(),
            keepalive: KeepAliveConfig::default(),
            attach_deadline_secs: None,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> RemoteResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            RemoteError::Internal(format!("cannot read config {}: {e}", path.display()))
        })?;
        Self::from_json(&raw)
            .map_err(|e| RemoteError::Internal(format!("{}: {e}", path.display())))
    }

    pub fn from_json(raw: &str) -> RemoteResult<Self> {
        serde_json::from_str(raw)
            .map_err(|e| RemoteError::Internal(format!("invalid config: {e}")))
    }

    pub fn listing_policy(&self) -> ListingPolicy {
        ListingPolicy {
            hidden: self.hidden_entries.clone(),
            pinned: self.pinned_entry.clone(),
        }
    }

    pub fn translator(&self) -> PathTranslator {
        PathTranslator::new(self.home_sentinel.clone())
    }

    pub fn attach_deadline(&self) -> Option<Duration> {
        self.attach_deadline_secs.map(Duration::from_secs)
    }
}
