//! Node configuration.
//!
//! Everything a node needs to start comes from `P2P_*` environment
//! variables (or the CLI flags that mirror them). Durations accept `ms`,
//! `s` and `m` suffixes or bare seconds.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_RAFT_ADDR: &str = "127.0.0.1:17000";
pub const DEFAULT_HTTP_ADDR: &str = "0.0.0.0:18080";
pub const DEFAULT_APPLY_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_JOIN_RETRIES: u32 = 30;
pub const DEFAULT_JOIN_RETRY_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_STARTUP_WAIT_LEADER: Duration = Duration::from_secs(4);
pub const DEFAULT_SNAPSHOT_RETAIN: usize = 2;

/// Error types for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid {name}: {reason}")]
    Invalid { name: String, reason: String },
}

fn invalid(name: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        name: name.to_string(),
        reason: reason.into(),
    }
}

/// Full node configuration with protocol defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Stable string identity of this node (`P2P_NODE_ID`).
    pub node_id: String,
    /// Reserved bind for a dedicated raft transport (`P2P_RAFT_ADDR`).
    pub raft_addr: String,
    /// HTTP surface bind (`P2P_HTTP_ADDR`).
    pub http_addr: String,
    /// Address peers use to reach this node (`P2P_ADVERTISE_ADDR`); derived
    /// from `http_addr` when unset.
    pub advertise_addr: String,
    /// Persistent store directory (`P2P_DATA_DIR`).
    pub data_dir: PathBuf,
    /// Single-node bootstrap when the stores are pristine (`P2P_BOOTSTRAP`).
    pub bootstrap: bool,
    /// Raft apply timeout (`P2P_APPLY_TIMEOUT`).
    pub apply_timeout: Duration,
    /// Existing cluster to join at startup (`P2P_JOIN_ENDPOINT`).
    pub join_endpoint: Option<String>,
    pub join_retries: u32,
    pub join_retry_delay: Duration,
    /// How long startup blocks until a leader is observable.
    pub startup_wait_leader: Duration,
    /// Raft snapshot files kept on disk (`P2P_SNAPSHOT_RETAIN`).
    pub snapshot_retain: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let node_id = default_node_id();
        Self {
            data_dir: PathBuf::from(format!("tmp/p2pnode/{node_id}")),
            node_id,
            raft_addr: DEFAULT_RAFT_ADDR.to_string(),
            http_addr: DEFAULT_HTTP_ADDR.to_string(),
            advertise_addr: String::new(),
            bootstrap: false,
            apply_timeout: DEFAULT_APPLY_TIMEOUT,
            join_endpoint: None,
            join_retries: DEFAULT_JOIN_RETRIES,
            join_retry_delay: DEFAULT_JOIN_RETRY_DELAY,
            startup_wait_leader: DEFAULT_STARTUP_WAIT_LEADER,
            snapshot_retain: DEFAULT_SNAPSHOT_RETAIN,
        }
    }
}

fn default_node_id() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "node-1".to_string())
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl NodeConfig {
    /// Reads the `P2P_*` environment, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(node_id) = env_var("P2P_NODE_ID") {
            config.data_dir = PathBuf::from(format!("tmp/p2pnode/{node_id}"));
            config.node_id = node_id;
        }
        if let Some(addr) = env_var("P2P_RAFT_ADDR") {
            config.raft_addr = addr;
        }
        if let Some(addr) = env_var("P2P_HTTP_ADDR") {
            config.http_addr = addr;
        }
        if let Some(addr) = env_var("P2P_ADVERTISE_ADDR") {
            config.advertise_addr = addr;
        }
        if let Some(dir) = env_var("P2P_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(raw) = env_var("P2P_BOOTSTRAP") {
            config.bootstrap = parse_bool("P2P_BOOTSTRAP", &raw)?;
        }
        if let Some(raw) = env_var("P2P_APPLY_TIMEOUT") {
            config.apply_timeout = parse_duration("P2P_APPLY_TIMEOUT", &raw)?;
        }
        config.join_endpoint = env_var("P2P_JOIN_ENDPOINT");
        if let Some(raw) = env_var("P2P_JOIN_RETRIES") {
            config.join_retries = raw
                .trim()
                .parse()
                .map_err(|_| invalid("P2P_JOIN_RETRIES", "expected an integer"))?;
        }
        if let Some(raw) = env_var("P2P_JOIN_RETRY_DELAY") {
            config.join_retry_delay = parse_duration("P2P_JOIN_RETRY_DELAY", &raw)?;
        }
        if let Some(raw) = env_var("P2P_STARTUP_WAIT_LEADER") {
            config.startup_wait_leader = parse_duration("P2P_STARTUP_WAIT_LEADER", &raw)?;
        }
        if let Some(raw) = env_var("P2P_SNAPSHOT_RETAIN") {
            config.snapshot_retain = raw
                .trim()
                .parse()
                .map_err(|_| invalid("P2P_SNAPSHOT_RETAIN", "expected an integer"))?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id.trim().is_empty() {
            return Err(invalid("P2P_NODE_ID", "must not be empty"));
        }
        self.http_addr
            .parse::<SocketAddr>()
            .map_err(|e| invalid("P2P_HTTP_ADDR", e.to_string()))?;
        self.raft_addr
            .parse::<SocketAddr>()
            .map_err(|e| invalid("P2P_RAFT_ADDR", e.to_string()))?;
        if self.apply_timeout.is_zero() {
            return Err(invalid("P2P_APPLY_TIMEOUT", "must be positive"));
        }
        if self.snapshot_retain == 0 {
            return Err(invalid("P2P_SNAPSHOT_RETAIN", "must be at least 1"));
        }
        Ok(())
    }

    /// Numeric raft id: the decimal value of the node id when it parses,
    /// otherwise the first 8 bytes of its SHA-256.
    pub fn raft_id(&self) -> u64 {
        raft_id_for(&self.node_id)
    }

    /// The HTTP base URL peers should use for this node.
    pub fn advertise_url(&self) -> String {
        let addr = if self.advertise_addr.trim().is_empty() {
            // 0.0.0.0 binds are unreachable as-is; advertise loopback.
            self.http_addr.replace("0.0.0.0", "127.0.0.1")
        } else {
            self.advertise_addr.clone()
        };
        if addr.starts_with("http://") || addr.starts_with("https://") {
            addr
        } else {
            format!("http://{addr}")
        }
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.data_dir.join("snapshots")
    }

    pub fn raft_log_path(&self) -> PathBuf {
        self.data_dir.join("raft-log.sled")
    }

    pub fn raft_stable_path(&self) -> PathBuf {
        self.data_dir.join("raft-stable.sled")
    }
}

/// Deterministic string-to-raft-id derivation shared by every node.
pub fn raft_id_for(node_id: &str) -> u64 {
    if let Ok(n) = node_id.trim().parse::<u64>() {
        return n;
    }
    let digest = Sha256::digest(node_id.trim().as_bytes());
    u64::from_be_bytes(digest[..8].try_into().expect("8-byte slice"))
}

fn parse_bool(name: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(invalid(name, "expected true or false")),
    }
}

/// Parses `1500ms`, `5s`, `2m` or bare seconds.
pub fn parse_duration(name: &str, raw: &str) -> Result<Duration, ConfigError> {
    let raw = raw.trim();
    let (digits, unit): (&str, &str) = match raw.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => raw.split_at(idx),
        None => (raw, "s"),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| invalid(name, format!("bad duration {raw:?}")))?;
    match unit.trim() {
        "ms" => Ok(Duration::from_millis(value)),
        "s" | "" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        other => Err(invalid(name, format!("unknown duration unit {other:?}"))),
    }
}
