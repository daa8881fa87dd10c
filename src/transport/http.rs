use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::net::SocketAddr;
use std::sync::Arc;

use super::Transport;
use crate::assignment::protocol::{
    ControlMessage, ENDPOINT_CONTROL, ENDPOINT_REGISTER, RegisterRequest, RegisterResponse,
};
use crate::cluster::directory::ClusterDirectory;
use crate::cluster::types::{NodeId, NodeInfo};
use crate::config::TransportConfig;
use crate::table::protocol::{
    AckResponse, ENDPOINT_SHARD_ASSIGNMENT, ENDPOINT_TABLE_GET, ENDPOINT_TABLE_UPDATES,
    GetRequest, GetResponse, ShardAssignment, UpdateBatch,
};

/// Sends table messages as JSON POSTs to the peer's table server.
///
/// Peers are resolved through the cluster directory, so a node can only reach
/// nodes it has learned about from registration or the assignment broadcast.
pub struct HttpTransport {
    directory: Arc<ClusterDirectory>,
    http_client: reqwest::Client,
    config: TransportConfig,
}

impl HttpTransport {
    pub fn new(directory: Arc<ClusterDirectory>, config: TransportConfig) -> Self {
        Self {
            directory,
            http_client: reqwest::Client::new(),
            config,
        }
    }

    fn resolve(&self, node: &NodeId) -> Result<SocketAddr> {
        self.directory
            .get_member(node)
            .map(|member| member.addr)
            .ok_or_else(|| anyhow::anyhow!("Node {} not found in cluster directory", node))
    }

    /// POSTs `payload` as JSON, retrying connection failures with doubling,
    /// jittered backoff. HTTP error statuses are returned, not retried.
    async fn post_with_retry<T: Serialize + ?Sized>(
        &self,
        url: String,
        payload: &T,
    ) -> Result<reqwest::Response> {
        let mut delay_ms = self.config.initial_backoff.as_millis() as u64;
        let max_delay_ms = self.config.max_backoff.as_millis() as u64;
        let attempts = self.config.attempts.max(1);

        for attempt in 0..attempts {
            let response = self
                .http_client
                .post(url.clone())
                .json(payload)
                .timeout(self.config.request_timeout)
                .send()
                .await;

            match response {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    if attempt + 1 == attempts {
                        return Err(anyhow::anyhow!(e));
                    }
                    tracing::debug!("POST {} failed (attempt {}): {}", url, attempt + 1, e);
                    let jitter = rand::random::<u64>() % self.config.max_jitter_ms.max(1);
                    tokio::time::sleep(std::time::Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(max_delay_ms);
                }
            }
        }

        Err(anyhow::anyhow!("Retry attempts exhausted"))
    }

    async fn post_json<T, R>(&self, addr: SocketAddr, endpoint: &str, payload: &T) -> Result<R>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = format!("http://{}{}", addr, endpoint);
        let response = self.post_with_retry(url, payload).await?;

        if !response.status().is_success() {
            return Err(anyhow::anyhow!(
                "{} on {} failed: {}",
                endpoint,
                addr,
                response.status()
            ));
        }

        response
            .json::<R>()
            .await
            .with_context(|| format!("Invalid response from {}{}", addr, endpoint))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, owner: &NodeId, request: &GetRequest) -> Result<GetResponse> {
        let addr = self.resolve(owner)?;
        self.post_json(addr, ENDPOINT_TABLE_GET, request).await
    }

    async fn send_updates(&self, owner: &NodeId, batch: &UpdateBatch) -> Result<usize> {
        let addr = self.resolve(owner)?;
        let ack: AckResponse = self.post_json(addr, ENDPOINT_TABLE_UPDATES, batch).await?;
        if !ack.success {
            anyhow::bail!("Node {} rejected batch {}", owner, batch.batch_id);
        }
        Ok(ack.applied)
    }

    async fn assign_shards(&self, node: &NodeId, assignment: &ShardAssignment) -> Result<usize> {
        let addr = self.resolve(node)?;
        let ack: AckResponse = self
            .post_json(addr, ENDPOINT_SHARD_ASSIGNMENT, assignment)
            .await?;
        if !ack.success {
            anyhow::bail!("Node {} rejected the shard assignment", node);
        }
        Ok(ack.applied)
    }

    async fn register(&self, coordinator: &NodeInfo, node: &NodeInfo) -> Result<bool> {
        let request = RegisterRequest { node: node.clone() };
        let response: RegisterResponse = self
            .post_json(coordinator.addr, ENDPOINT_REGISTER, &request)
            .await?;
        Ok(response.accepted)
    }

    async fn send_control(&self, node: &NodeId, message: &ControlMessage) -> Result<()> {
        let addr = self.resolve(node)?;
        let ack: AckResponse = self.post_json(addr, ENDPOINT_CONTROL, message).await?;
        if !ack.success {
            anyhow::bail!("Node {} rejected {:?}", node, message.signal);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assignment::protocol::ControlSignal;
    use crate::cluster::types::NodeRole;
    use std::time::{Duration, Instant};

    fn transport_with_peer(peer: SocketAddr, config: TransportConfig) -> HttpTransport {
        let local = NodeInfo {
            id: NodeId::from("w"),
            addr: "127.0.0.1:7003".parse().unwrap(),
            role: NodeRole::Worker,
        };
        let directory = ClusterDirectory::new(local);
        directory.insert(NodeInfo {
            id: NodeId::from("a"),
            addr: peer,
            role: NodeRole::TableServer,
        });
        HttpTransport::new(directory, config)
    }

    async fn closed_port() -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    #[tokio::test]
    async fn test_unreachable_peer_fails_after_retries() {
        let config = TransportConfig {
            attempts: 3,
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(30),
            ..TransportConfig::default()
        };
        let transport = transport_with_peer(closed_port().await, config);

        let started = Instant::now();
        let message = ControlMessage {
            signal: ControlSignal::WorkerEnd,
            source: NodeId::from("w"),
        };
        assert!(transport.send_control(&NodeId::from("a"), &message).await.is_err());

        // two backoffs of at least 20 and 30 ms between the three attempts
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_single_attempt_does_not_wait() {
        let config = TransportConfig {
            attempts: 1,
            initial_backoff: Duration::from_secs(5),
            ..TransportConfig::default()
        };
        let transport = transport_with_peer(closed_port().await, config);

        let request = GetRequest {
            table_id: 0,
            shard: 0,
            key: vec![1],
        };
        let result = tokio::time::timeout(
            Duration::from_secs(2),
            transport.get(&NodeId::from("a"), &request),
        )
        .await
        .expect("no backoff after the last attempt");
        assert!(result.is_err());
    }
}
