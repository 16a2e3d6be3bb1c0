//! Configuration for stockgroup members

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix (`STOCKGROUP__GROUP__NAME=...`)
pub const ENV_PREFIX: &str = "STOCKGROUP";

/// Global configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Process-level settings (sockets, logging)
    #[serde(default)]
    pub node: NodeConfig,

    /// Group settings (cluster, seeds, timeouts)
    #[serde(default)]
    pub group: GroupConfig,
}

impl Config {
    /// Load configuration from an optional TOML file, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config: Config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("group.seeds")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.group.validate()
    }
}

/// Process-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Bind address for member-to-member traffic
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    /// Address other members should dial (defaults to the bound address)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advertise_addr: Option<String>,

    /// Bind address for the HTTP admin API (disabled when absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_addr: Option<SocketAddr>,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 7800))
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            advertise_addr: None,
            http_addr: None,
            log_level: default_log_level(),
        }
    }
}

/// Group membership and protocol timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    /// Cluster name; members of different clusters never form a group
    #[serde(default = "default_cluster")]
    pub cluster: String,

    /// Member display name
    #[serde(default = "default_name")]
    pub name: String,

    /// Addresses of members to contact when joining
    #[serde(default)]
    pub seeds: Vec<String>,

    #[serde(default = "default_join_timeout")]
    pub join_timeout_ms: u64,

    #[serde(default = "default_join_retry")]
    pub join_retry_ms: u64,

    #[serde(default = "default_state_transfer_timeout")]
    pub state_transfer_timeout_ms: u64,

    /// Default timeout for SYNC broadcast calls
    #[serde(default = "default_call_timeout")]
    pub call_timeout_ms: u64,

    /// Default timeout for acquiring a cluster lock
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_ms: u64,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// Silence after which a member is suspected and evicted
    #[serde(default = "default_liveness_timeout")]
    pub liveness_timeout_ms: u64,

    #[serde(default = "default_leave_timeout")]
    pub leave_timeout_ms: u64,
}

fn default_cluster() -> String {
    "stocks".to_string()
}
fn default_name() -> String {
    "Y".to_string()
}
fn default_join_timeout() -> u64 {
    3_000
}
fn default_join_retry() -> u64 {
    250
}
fn default_state_transfer_timeout() -> u64 {
    30_000
}
fn default_call_timeout() -> u64 {
    5_000
}
fn default_lock_timeout() -> u64 {
    10_000
}
fn default_heartbeat_interval() -> u64 {
    500
}
fn default_liveness_timeout() -> u64 {
    3_000
}
fn default_leave_timeout() -> u64 {
    2_000
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            cluster: default_cluster(),
            name: default_name(),
            seeds: Vec::new(),
            join_timeout_ms: default_join_timeout(),
            join_retry_ms: default_join_retry(),
            state_transfer_timeout_ms: default_state_transfer_timeout(),
            call_timeout_ms: default_call_timeout(),
            lock_timeout_ms: default_lock_timeout(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            liveness_timeout_ms: default_liveness_timeout(),
            leave_timeout_ms: default_leave_timeout(),
        }
    }
}

impl GroupConfig {
    pub fn new(cluster: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_seeds(mut self, seeds: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.seeds = seeds.into_iter().map(Into::into).collect();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.cluster.trim().is_empty() {
            return Err(Error::InvalidConfig("cluster name is empty".into()));
        }
        if self.name.trim().is_empty() {
            return Err(Error::InvalidConfig("member name is empty".into()));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(Error::InvalidConfig("heartbeat interval must be > 0".into()));
        }
        if self.liveness_timeout_ms <= self.heartbeat_interval_ms {
            return Err(Error::InvalidConfig(format!(
                "liveness timeout ({}ms) must exceed heartbeat interval ({}ms)",
                self.liveness_timeout_ms, self.heartbeat_interval_ms
            )));
        }
        Ok(())
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn join_retry(&self) -> Duration {
        Duration::from_millis(self.join_retry_ms)
    }

    pub fn state_transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.state_transfer_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    pub fn leave_timeout(&self) -> Duration {
        Duration::from_millis(self.leave_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.group.cluster, "stocks");
        assert_eq!(config.group.state_transfer_timeout(), Duration::from_secs(30));
        assert!(config.node.http_addr.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[node]
bind_addr = "127.0.0.1:7900"
http_addr = "127.0.0.1:8080"

[group]
name = "X"
seeds = ["127.0.0.1:7800"]
lock_timeout_ms = 1500
"#
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.node.bind_addr, "127.0.0.1:7900".parse().unwrap());
        assert_eq!(config.node.http_addr, Some("127.0.0.1:8080".parse().unwrap()));
        assert_eq!(config.group.name, "X");
        assert_eq!(config.group.seeds, vec!["127.0.0.1:7800".to_string()]);
        assert_eq!(config.group.lock_timeout(), Duration::from_millis(1500));
        assert_eq!(config.group.cluster, "stocks");
    }

    #[test]
    fn test_validate_rejects_bad_timeouts() {
        let mut group = GroupConfig::new("stocks", "A");
        group.liveness_timeout_ms = group.heartbeat_interval_ms;
        assert!(matches!(group.validate(), Err(Error::InvalidConfig(_))));

        let group = GroupConfig::new("stocks", " ");
        assert!(group.validate().is_err());
    }
}
