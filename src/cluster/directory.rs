use dashmap::DashMap;
use std::sync::Arc;

use super::types::{NodeId, NodeInfo};

/// Node id -> address book shared by the transport and the table server.
pub struct ClusterDirectory {
    pub local_node: NodeInfo,
    members: DashMap<NodeId, NodeInfo>,
}

impl ClusterDirectory {
    pub fn new(local_node: NodeInfo) -> Arc<Self> {
        let members = DashMap::new();
        members.insert(local_node.id.clone(), local_node.clone());

        Arc::new(Self {
            local_node,
            members,
        })
    }

    pub fn get_member(&self, id: &NodeId) -> Option<NodeInfo> {
        self.members.get(id).map(|entry| entry.value().clone())
    }

    pub fn insert(&self, node: NodeInfo) {
        match self.members.insert(node.id.clone(), node.clone()) {
            Some(previous) if previous.addr != node.addr => {
                tracing::info!(
                    "Node {} moved from {} to {}",
                    node.id,
                    previous.addr,
                    node.addr
                );
            }
            Some(_) => {}
            None => {
                tracing::debug!("Discovered node {} ({:?}) at {}", node.id, node.role, node.addr);
            }
        }
    }

    pub fn merge(&self, nodes: &[NodeInfo]) {
        for node in nodes {
            self.insert(node.clone());
        }
    }

    /// All known members, ordered by id.
    pub fn members(&self) -> Vec<NodeInfo> {
        let mut nodes: Vec<NodeInfo> = self
            .members
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    pub fn table_servers(&self) -> Vec<NodeInfo> {
        self.members()
            .into_iter()
            .filter(|node| node.role.serves_tables())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
