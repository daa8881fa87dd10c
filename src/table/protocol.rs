//! Table Network Protocol
//!
//! Data Transfer Objects exchanged between nodes for remote reads, buffered
//! update batches and the shard assignment broadcast. Keys and values travel
//! already encoded with the table's codecs; the envelopes themselves are JSON.

use serde::{Deserialize, Serialize};

use crate::cluster::types::{NodeId, NodeInfo};

// --- API Endpoints ---

/// Remote read of one key from the shard owner.
pub const ENDPOINT_TABLE_GET: &str = "/internal/table/get";
/// Delivery of a batch of buffered mutations to the shard owner.
pub const ENDPOINT_TABLE_UPDATES: &str = "/internal/table/updates";
/// Broadcast of the shard -> owner map by the coordinator.
pub const ENDPOINT_SHARD_ASSIGNMENT: &str = "/internal/shard_assignment";
/// Per-table statistics of the receiving node.
pub const ENDPOINT_TABLE_STATS: &str = "/table/stats";

// --- Data Transfer Objects ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GetRequest {
    pub table_id: u32,
    pub shard: usize,
    /// Key encoded with the table's key codec.
    pub key: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GetResponse {
    pub found: bool,
    /// Value encoded with the table's value codec; empty when `found` is false.
    pub value: Vec<u8>,
}

impl GetResponse {
    pub fn found(value: Vec<u8>) -> Self {
        Self { found: true, value }
    }

    pub fn missing() -> Self {
        Self {
            found: false,
            value: Vec::new(),
        }
    }

    pub fn into_value(self) -> Option<Vec<u8>> {
        self.found.then_some(self.value)
    }
}

/// How the owner applies a buffered mutation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum WriteMode {
    /// Insert or overwrite.
    Put,
    /// Merge with the table's accumulator.
    Accumulate,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdateEntry {
    pub shard: usize,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub mode: WriteMode,
}

impl UpdateEntry {
    /// Bytes this entry accounts for in the pending-write ledger.
    pub fn encoded_len(&self) -> usize {
        self.key.len() + self.value.len()
    }
}

/// Mutations for one table, all owned by the receiving node.
///
/// `batch_id` lets the owner acknowledge a retried delivery without applying
/// it twice.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdateBatch {
    pub table_id: u32,
    pub batch_id: String,
    pub source: NodeId,
    pub entries: Vec<UpdateEntry>,
}

impl UpdateBatch {
    pub fn new(table_id: u32, source: NodeId, entries: Vec<UpdateEntry>) -> Self {
        Self {
            table_id,
            batch_id: uuid::Uuid::new_v4().to_string(),
            source,
            entries,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShardOwner {
    pub table_id: u32,
    pub shard: usize,
    pub owner: NodeId,
}

/// The complete shard -> owner map plus the directory of every node, so that
/// receivers can reach the owners they route to.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ShardAssignment {
    pub assignments: Vec<ShardOwner>,
    pub nodes: Vec<NodeInfo>,
}

impl ShardAssignment {
    pub fn for_table(&self, table_id: u32) -> impl Iterator<Item = &ShardOwner> + '_ {
        self.assignments
            .iter()
            .filter(move |assignment| assignment.table_id == table_id)
    }
}

/// Acknowledgment for update batches and assignment broadcasts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AckResponse {
    pub success: bool,
    /// Number of entries (or shards) applied by the receiver.
    pub applied: usize,
}
