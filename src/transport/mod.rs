//! Transport Module
//!
//! Point-to-point delivery of table messages between nodes.
//!
//! ## Implementations
//! - **`http`**: JSON over HTTP with `reqwest`, retried with jittered backoff. Used by
//!   the `table-node` binary.
//! - **`local`**: in-process hub that calls the receiving `TableServer` directly. Used
//!   by tests and single-process clusters.

pub mod http;
pub mod local;

use anyhow::Result;
use async_trait::async_trait;

use crate::assignment::protocol::ControlMessage;
use crate::cluster::types::{NodeId, NodeInfo};
use crate::table::protocol::{GetRequest, GetResponse, ShardAssignment, UpdateBatch};

#[async_trait]
pub trait Transport: Send + Sync {
    /// Reads one key from the owner of its shard.
    async fn get(&self, owner: &NodeId, request: &GetRequest) -> Result<GetResponse>;

    /// Delivers a batch of buffered writes; returns the number of entries applied.
    async fn send_updates(&self, owner: &NodeId, batch: &UpdateBatch) -> Result<usize>;

    /// Delivers the shard assignment; returns the number of assignments received.
    async fn assign_shards(&self, node: &NodeId, assignment: &ShardAssignment) -> Result<usize>;

    /// Announces `node` to the coordinator. Returns whether it was accepted.
    async fn register(&self, coordinator: &NodeInfo, node: &NodeInfo) -> Result<bool>;

    /// Delivers a lifecycle signal (barrier release, end of work, shutdown).
    async fn send_control(&self, node: &NodeId, message: &ControlMessage) -> Result<()>;
}
