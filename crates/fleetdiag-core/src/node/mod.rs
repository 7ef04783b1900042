//! Cluster node model and the discovery capability.
//!
//! Discovery itself (service registries, cloud APIs, …) lives outside the
//! core; the engine consumes it through the narrow [`NodeDiscovery`] trait.

use std::fs;
use std::net::IpAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Role a node plays in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Coordinator-eligible node.
    Master,
    /// Private worker node.
    Agent,
    /// Worker node on the public network.
    AgentPublic,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Master => write!(f, "master"),
            Self::Agent => write!(f, "agent"),
            Self::AgentPublic => write!(f, "agent_public"),
        }
    }
}

impl Role {
    /// Whether the role counts as an agent for node-set resolution.
    #[must_use]
    pub const fn is_agent(self) -> bool {
        matches!(self, Self::Agent | Self::AgentPublic)
    }
}

/// Immutable snapshot of a cluster member as reported by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Address the node serves its diagnostics endpoint on.
    pub ip: IpAddr,

    /// Hostname, when discovery knows one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// Node role.
    pub role: Role,

    /// Cluster-member identifier, when discovery knows one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Whether this node currently leads the masters.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub leader: bool,
}

/// Errors produced by the discovery capability.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// The node inventory could not be enumerated.
    #[error("could not enumerate {what}: {reason}")]
    Unavailable {
        /// What was being enumerated (e.g. "master nodes").
        what: String,
        /// Human-readable cause.
        reason: String,
    },

    /// The inventory file could not be read or parsed.
    #[error("could not load node inventory from {path}: {reason}")]
    Inventory {
        /// Path of the inventory file.
        path: String,
        /// Human-readable cause.
        reason: String,
    },
}

/// Capability that enumerates cluster members and describes the local node.
pub trait NodeDiscovery: Send + Sync {
    /// All master nodes, including the local one when it is a master.
    fn master_nodes(&self) -> Result<Vec<Node>, DiscoveryError>;

    /// All agent and public-agent nodes.
    fn agent_nodes(&self) -> Result<Vec<Node>, DiscoveryError>;

    /// Role of the local node.
    fn node_role(&self) -> Result<Role, DiscoveryError>;

    /// Address of the local node as peers see it.
    fn local_ip(&self) -> Result<IpAddr, DiscoveryError>;
}

/// Capability that reports disk usage under the bundle working directory.
pub trait DiskUsage: Send + Sync {
    /// Used fraction of the partition holding `path`, in percent.
    fn used_percent(&self, path: &Path) -> Option<f64>;
}

/// Disk-usage probe that reports nothing.
///
/// Stands in on platforms where no probe is wired up; the status report then
/// shows zero usage instead of failing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDiskUsage;

impl DiskUsage for NoDiskUsage {
    fn used_percent(&self, _path: &Path) -> Option<f64> {
        None
    }
}

/// Discovery backed by a static inventory file.
///
/// The file is a JSON document of the shape
/// `{"local_ip": "…", "local_role": "master", "nodes": [Node, …]}` and is
/// re-read on every call so that an operator can update the inventory while
/// the daemon runs.
#[derive(Debug, Clone)]
pub struct StaticDiscovery {
    path: std::path::PathBuf,
}

#[derive(Debug, Deserialize)]
struct Inventory {
    local_ip: IpAddr,
    local_role: Role,
    nodes: Vec<Node>,
}

impl StaticDiscovery {
    /// Discovery reading the inventory at `path`.
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn load(&self) -> Result<Inventory, DiscoveryError> {
        let path = self.path.display().to_string();
        let raw = fs::read(&self.path).map_err(|err| DiscoveryError::Inventory {
            path: path.clone(),
            reason: err.to_string(),
        })?;
        serde_json::from_slice(&raw).map_err(|err| DiscoveryError::Inventory {
            path,
            reason: err.to_string(),
        })
    }
}

impl NodeDiscovery for StaticDiscovery {
    fn master_nodes(&self) -> Result<Vec<Node>, DiscoveryError> {
        let inventory = self.load()?;
        Ok(inventory
            .nodes
            .into_iter()
            .filter(|n| n.role == Role::Master)
            .collect())
    }

    fn agent_nodes(&self) -> Result<Vec<Node>, DiscoveryError> {
        let inventory = self.load()?;
        Ok(inventory
            .nodes
            .into_iter()
            .filter(|n| n.role.is_agent())
            .collect())
    }

    fn node_role(&self) -> Result<Role, DiscoveryError> {
        Ok(self.load()?.local_role)
    }

    fn local_ip(&self) -> Result<IpAddr, DiscoveryError> {
        Ok(self.load()?.local_ip)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_role_display_matches_wire_format() {
        assert_eq!(Role::Master.to_string(), "master");
        assert_eq!(Role::Agent.to_string(), "agent");
        assert_eq!(Role::AgentPublic.to_string(), "agent_public");
    }

    #[test]
    fn test_node_round_trips_through_json() {
        let node = Node {
            ip: "10.0.7.1".parse().unwrap(),
            host: Some("master-0".to_string()),
            role: Role::Master,
            id: Some("member-a1".to_string()),
            leader: true,
        };
        let raw = serde_json::to_string(&node).unwrap();
        let back: Node = serde_json::from_str(&raw).unwrap();
        assert_eq!(node, back);
    }

    #[test]
    fn test_static_discovery_splits_masters_and_agents() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "local_ip": "10.0.7.1",
                "local_role": "master",
                "nodes": [
                    {{"ip": "10.0.7.1", "role": "master", "leader": true}},
                    {{"ip": "10.0.7.2", "role": "agent"}},
                    {{"ip": "10.0.7.3", "role": "agent_public"}}
                ]
            }}"#
        )
        .unwrap();

        let discovery = StaticDiscovery::new(file.path());
        assert_eq!(discovery.master_nodes().unwrap().len(), 1);
        assert_eq!(discovery.agent_nodes().unwrap().len(), 2);
        assert_eq!(discovery.node_role().unwrap(), Role::Master);
        assert_eq!(discovery.local_ip().unwrap().to_string(), "10.0.7.1");
    }

    #[test]
    fn test_static_discovery_reports_missing_inventory() {
        let discovery = StaticDiscovery::new("/does/not/exist.json");
        let err = discovery.master_nodes().unwrap_err();
        assert!(err.to_string().contains("could not load node inventory"));
    }
}
