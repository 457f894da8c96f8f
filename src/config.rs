// src/config.rs

//! Manages node configuration: loading from TOML, defaults, and validation.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use tracing::info;

/// Top-level configuration for a cluster node process.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    /// Address the bus listener binds to, and the default announced IP.
    #[serde(default = "default_host")]
    pub host: String,
    /// The client-facing TCP port. The bus port derives from it unless
    /// overridden.
    #[serde(default = "default_port")]
    pub port: u16,
    /// The client-facing TLS port, if the deployment serves TLS clients.
    /// Announced on the bus as the secondary port.
    #[serde(default)]
    pub tls_port: Option<u16>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub cluster: ClusterConfig,
}

/// Holds all configuration settings related to cluster membership.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ClusterConfig {
    /// The path to the persisted node table (e.g., `nodes.conf`).
    #[serde(default = "default_config_file")]
    pub config_file: String,
    /// Time after which a node that did not answer a PING is suspected down.
    #[serde(with = "humantime_serde", default = "default_node_timeout")]
    pub node_timeout: Duration,
    /// An optional IP address to announce to other nodes instead of `host`.
    pub announce_ip: Option<String>,
    /// An optional port to announce for client connections.
    pub announce_port: Option<u16>,
    /// An optional port to announce for the cluster bus.
    pub announce_bus_port: Option<u16>,
    /// An optional hostname announced through the bus extension section.
    pub announce_hostname: Option<String>,
    /// An optional human-readable node name, propagated like the hostname.
    pub announce_nodename: Option<String>,
    /// The port offset for the cluster bus. The final bus port is
    /// client_port + bus_port_offset.
    #[serde(default = "default_bus_port_offset")]
    pub bus_port_offset: u16,
    /// Per-link outgoing buffer budget in bytes. A link whose queue exceeds
    /// this is dropped and reconnected. `0` disables the limit.
    #[serde(default)]
    pub link_send_buffer_limit: usize,
    /// If `true`, the cluster is marked down when any slot is uncovered.
    #[serde(default = "default_true")]
    pub require_full_coverage: bool,
    /// Allows replicas to migrate toward orphaned primaries.
    #[serde(default = "default_true")]
    pub allow_replica_migration: bool,
    /// Minimum number of replicas a primary must retain for one of its
    /// replicas to migrate away.
    #[serde(default = "default_migration_barrier")]
    pub migration_barrier: usize,
    /// Multiplier bounding how stale a replica's data may be before it is
    /// disqualified from automatic failover. `0` disables the check.
    #[serde(default = "default_replica_validity_factor")]
    pub replica_validity_factor: u64,
    /// If `true`, a replica never tries to fail over its primary
    /// automatically. Manual failover stays available.
    #[serde(default)]
    pub no_failover: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            config_file: default_config_file(),
            node_timeout: default_node_timeout(),
            announce_ip: None,
            announce_port: None,
            announce_bus_port: None,
            announce_hostname: None,
            announce_nodename: None,
            bus_port_offset: default_bus_port_offset(),
            link_send_buffer_limit: 0,
            require_full_coverage: true,
            allow_replica_migration: true,
            migration_barrier: default_migration_barrier(),
            replica_validity_factor: default_replica_validity_factor(),
            no_failover: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            tls_port: None,
            log_level: default_log_level(),
            cluster: ClusterConfig::default(),
        }
    }
}

impl Config {
    /// Loads the configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file '{path}'"))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file '{path}'"))?;
        config.validate()?;
        info!("Configuration loaded from {path}");
        Ok(config)
    }

    /// Checks cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        self.bus_port()?;
        if self.cluster.node_timeout < Duration::from_millis(100) {
            return Err(anyhow!("cluster.node_timeout must be at least 100ms"));
        }
        Ok(())
    }

    /// The node timeout in milliseconds, the unit all liveness math runs in.
    pub fn node_timeout_ms(&self) -> u64 {
        self.cluster.node_timeout.as_millis() as u64
    }

    /// The port the bus listener binds to.
    pub fn bus_port(&self) -> Result<u16> {
        match u32::from(self.port).checked_add(u32::from(self.cluster.bus_port_offset)) {
            Some(port) if port <= u32::from(u16::MAX) => Ok(port as u16),
            _ => Err(anyhow!(
                "Calculated cluster bus port ({}) exceeds the valid range (max 65535). \
                 Please check 'port' and 'bus_port_offset' settings.",
                u32::from(self.port) + u32::from(self.cluster.bus_port_offset)
            )),
        }
    }

    /// The IP other nodes should use to reach us.
    pub fn announced_ip(&self) -> String {
        self.cluster
            .announce_ip
            .clone()
            .unwrap_or_else(|| self.host.clone())
    }

    /// The client port other nodes should advertise for us.
    pub fn announced_port(&self) -> u16 {
        self.cluster.announce_port.unwrap_or(self.port)
    }

    /// The bus port other nodes should connect to.
    pub fn announced_bus_port(&self) -> u16 {
        self.cluster
            .announce_bus_port
            .or_else(|| self.bus_port().ok())
            .unwrap_or(self.port)
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    7878
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_config_file() -> String {
    "nodes.conf".to_string()
}
fn default_node_timeout() -> Duration {
    Duration::from_secs(15)
}
fn default_bus_port_offset() -> u16 {
    10000
}
fn default_migration_barrier() -> usize {
    1
}
fn default_replica_validity_factor() -> u64 {
    10
}
fn default_true() -> bool {
    true
}
