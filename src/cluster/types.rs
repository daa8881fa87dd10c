use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

const COORDINATOR_ID: &str = "coordinator";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Well-known id of the coordinating node, so peers can address it
    /// before any directory exchange has happened.
    pub fn coordinator() -> Self {
        Self(COORDINATOR_ID.to_string())
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, clap::ValueEnum)]
#[value(rename_all = "kebab-case")]
pub enum NodeRole {
    Coordinator,
    Worker,
    TableServer,
}

impl NodeRole {
    /// Only table servers are eligible to own shards.
    pub fn serves_tables(&self) -> bool {
        matches!(self, NodeRole::TableServer)
    }
}

/// A single process in the cluster.
///
/// `addr` is the HTTP address where the node's table server listens.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeInfo {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub role: NodeRole,
}
