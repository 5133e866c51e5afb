//! Static cluster configuration.
//!
//! A cluster is an ordered list of `(host, base_port)` pairs shared by every
//! node. A node is identified only by its index in that list. Each node uses
//! three ports derived from its base port:
//!
//! - `base`: client connections
//! - `base + 1`: command channel (forwarded store operations)
//! - `base + 2`: sync channel (snapshot pushes)
//!
//! The configuration is usually read from TOML:
//!
//! ```toml
//! data_dir = "data"
//!
//! [[nodes]]
//! host = "127.0.0.1"
//! base_port = 40130
//!
//! [timeouts]
//! command_ms = 1000
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, ensure, Context, Result};
use serde::{Deserialize, Serialize};

/// Machine ids travel as one byte in handshakes.
pub const MAX_NODES: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAddress {
    pub host: String,
    pub base_port: u16,
}

impl NodeAddress {
    pub fn new(host: impl Into<String>, base_port: u16) -> Self {
        Self {
            host: host.into(),
            base_port,
        }
    }

    pub fn client_addr(&self) -> String {
        format!("{}:{}", self.host, self.base_port)
    }

    pub fn command_addr(&self) -> String {
        format!("{}:{}", self.host, self.base_port + 1)
    }

    pub fn sync_addr(&self) -> String {
        format!("{}:{}", self.host, self.base_port + 2)
    }
}

impl FromStr for NodeAddress {
    type Err = anyhow::Error;

    /// Parses `host:base_port`.
    fn from_str(value: &str) -> Result<Self> {
        let (host, port) = value
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("invalid node '{value}', expected host:base_port"))?;
        let base_port = port
            .parse()
            .with_context(|| format!("invalid base port in '{value}'"))?;
        Ok(Self::new(host, base_port))
    }
}

/// Per-role network timeouts. Exceeding any of them marks the peer down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Per-attempt connect timeout during mesh formation (also the retry pause).
    pub connect_retry_ms: u64,
    /// Forwarded request/response round trip.
    pub command_ms: u64,
    /// Snapshot push to one replica.
    pub sync_ms: u64,
    /// Reading a handshake from a freshly accepted connection.
    pub handshake_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect_retry_ms: 100,
            command_ms: 1000,
            sync_ms: 100,
            handshake_ms: 1000,
        }
    }
}

impl Timeouts {
    pub fn connect_retry(&self) -> Duration {
        Duration::from_millis(self.connect_retry_ms)
    }

    pub fn command(&self) -> Duration {
        Duration::from_millis(self.command_ms)
    }

    pub fn sync(&self) -> Duration {
        Duration::from_millis(self.sync_ms)
    }

    pub fn handshake(&self) -> Duration {
        Duration::from_millis(self.handshake_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub nodes: Vec<NodeAddress>,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub timeouts: Timeouts,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

impl ClusterConfig {
    pub fn new(nodes: Vec<NodeAddress>, data_dir: impl Into<PathBuf>) -> Result<Self> {
        let config = Self {
            nodes,
            data_dir: data_dir.into(),
            timeouts: Timeouts::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).context("failed to parse cluster config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.is_empty(), "cluster requires at least one node");
        ensure!(
            self.nodes.len() <= MAX_NODES,
            "cluster supports at most {MAX_NODES} nodes, got {}",
            self.nodes.len()
        );
        for node in &self.nodes {
            ensure!(
                node.base_port <= u16::MAX - 2,
                "base port {} leaves no room for command and sync ports",
                node.base_port
            );
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Configuration for one node: its index plus the shared cluster layout.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub machine_id: usize,
    pub cluster: ClusterConfig,
}

impl NodeConfig {
    pub fn new(machine_id: usize, cluster: ClusterConfig) -> Result<Self> {
        ensure!(
            machine_id < cluster.len(),
            "machine id {machine_id} out of range for a {}-node cluster",
            cluster.len()
        );
        Ok(Self {
            machine_id,
            cluster,
        })
    }

    pub fn address(&self) -> &NodeAddress {
        &self.cluster.nodes[self.machine_id]
    }

    /// Ids of every other node, ascending.
    pub fn peer_ids(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.cluster.len()).filter(move |id| *id != self.machine_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ports_derive_from_base() {
        let node = NodeAddress::new("10.0.0.1", 40130);
        assert_eq!(node.client_addr(), "10.0.0.1:40130");
        assert_eq!(node.command_addr(), "10.0.0.1:40131");
        assert_eq!(node.sync_addr(), "10.0.0.1:40132");
    }

    #[test]
    fn parses_toml_with_defaults() {
        let config = ClusterConfig::from_toml_str(
            r#"
            [[nodes]]
            host = "127.0.0.1"
            base_port = 40130

            [[nodes]]
            host = "127.0.0.1"
            base_port = 40140

            [timeouts]
            command_ms = 250
            "#,
        )
        .unwrap();
        assert_eq!(config.len(), 2);
        assert_eq!(config.data_dir, PathBuf::from("data"));
        assert_eq!(config.timeouts.command(), Duration::from_millis(250));
        assert_eq!(config.timeouts.sync(), Duration::from_millis(100));
    }

    #[test]
    fn rejects_invalid_layouts() {
        assert!(ClusterConfig::from_toml_str("nodes = []").is_err());
        assert!(ClusterConfig::new(vec![NodeAddress::new("h", u16::MAX)], "d").is_err());

        let cluster = ClusterConfig::new(vec![NodeAddress::new("h", 1000)], "d").unwrap();
        assert!(NodeConfig::new(1, cluster.clone()).is_err());
        assert!(NodeConfig::new(0, cluster).is_ok());
    }

    #[test]
    fn parses_node_from_cli_form() {
        let node: NodeAddress = "localhost:40130".parse().unwrap();
        assert_eq!(node, NodeAddress::new("localhost", 40130));
        assert!("localhost".parse::<NodeAddress>().is_err());
    }

    #[test]
    fn peer_ids_skip_self() {
        let cluster = ClusterConfig::new(
            (0..3).map(|i| NodeAddress::new("h", 1000 + i * 10)).collect(),
            "d",
        )
        .unwrap();
        let node = NodeConfig::new(1, cluster).unwrap();
        assert_eq!(node.peer_ids().collect::<Vec<_>>(), vec![0, 2]);
    }
}
