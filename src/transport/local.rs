use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::{Arc, Weak};

use super::Transport;
use crate::assignment::protocol::ControlMessage;
use crate::cluster::types::{NodeId, NodeInfo};
use crate::server::registry::TableServer;
use crate::table::protocol::{GetRequest, GetResponse, ShardAssignment, UpdateBatch};

/// In-process hub connecting the table servers of one process.
#[derive(Default)]
pub struct LocalNetwork {
    servers: DashMap<NodeId, Arc<TableServer>>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn attach(&self, server: Arc<TableServer>) {
        let id = server.local_node().id.clone();
        tracing::debug!("Attached {} to the local network", id);
        self.servers.insert(id, server);
    }

    pub fn detach(&self, node: &NodeId) -> Option<Arc<TableServer>> {
        self.servers.remove(node).map(|(_, server)| server)
    }

    /// A transport delivering to the servers attached to this hub.
    ///
    /// It only holds a weak handle, since attached servers own tables that
    /// own the transport.
    pub fn transport(self: &Arc<Self>) -> Arc<dyn Transport> {
        Arc::new(LocalTransport {
            network: Arc::downgrade(self),
        })
    }

    fn server(&self, node: &NodeId) -> Result<Arc<TableServer>> {
        self.servers
            .get(node)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| anyhow::anyhow!("Node {} is not attached to the local network", node))
    }
}

pub struct LocalTransport {
    network: Weak<LocalNetwork>,
}

impl LocalTransport {
    fn server(&self, node: &NodeId) -> Result<Arc<TableServer>> {
        let network = self
            .network
            .upgrade()
            .ok_or_else(|| anyhow::anyhow!("Local network has been shut down"))?;
        network.server(node)
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn get(&self, owner: &NodeId, request: &GetRequest) -> Result<GetResponse> {
        let server = self.server(owner)?;
        // Behave like a round trip: the caller is always suspended once.
        tokio::task::yield_now().await;
        server.handle_get(request)
    }

    async fn send_updates(&self, owner: &NodeId, batch: &UpdateBatch) -> Result<usize> {
        let server = self.server(owner)?;
        tokio::task::yield_now().await;
        server.apply_updates(batch)
    }

    async fn assign_shards(&self, node: &NodeId, assignment: &ShardAssignment) -> Result<usize> {
        let server = self.server(node)?;
        tokio::task::yield_now().await;
        Ok(server.apply_assignment(assignment))
    }

    async fn register(&self, coordinator: &NodeInfo, node: &NodeInfo) -> Result<bool> {
        let server = self.server(&coordinator.id)?;
        tokio::task::yield_now().await;
        Ok(server.accept_registration(node.clone()))
    }

    async fn send_control(&self, node: &NodeId, message: &ControlMessage) -> Result<()> {
        let server = self.server(node)?;
        tokio::task::yield_now().await;
        server.accept_control(message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::directory::ClusterDirectory;
    use crate::cluster::types::NodeRole;

    fn server(id: &str, port: u16) -> Arc<TableServer> {
        let node = NodeInfo {
            id: NodeId::from(id),
            addr: format!("127.0.0.1:{}", port).parse().unwrap(),
            role: NodeRole::TableServer,
        };
        TableServer::new(ClusterDirectory::new(node))
    }

    #[tokio::test]
    async fn test_unknown_node_is_an_error() {
        let network = LocalNetwork::new();
        let transport = network.transport();

        let request = GetRequest {
            table_id: 0,
            shard: 0,
            key: vec![1],
        };
        assert!(transport.get(&NodeId::from("nobody"), &request).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_table_is_an_error() {
        let network = LocalNetwork::new();
        network.attach(server("a", 1));
        let transport = network.transport();

        let request = GetRequest {
            table_id: 42,
            shard: 0,
            key: vec![1],
        };
        assert!(transport.get(&NodeId::from("a"), &request).await.is_err());
    }

    #[tokio::test]
    async fn test_dropped_network_fails_cleanly() {
        let network = LocalNetwork::new();
        network.attach(server("a", 1));
        let transport = network.transport();
        drop(network);

        let assignment = ShardAssignment::default();
        assert!(transport
            .assign_shards(&NodeId::from("a"), &assignment)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_detach() {
        let network = LocalNetwork::new();
        network.attach(server("a", 1));
        let transport = network.transport();

        assert!(network.detach(&NodeId::from("a")).is_some());
        let assignment = ShardAssignment::default();
        assert!(transport
            .assign_shards(&NodeId::from("a"), &assignment)
            .await
            .is_err());
    }
}
