use serde::{Deserialize, Serialize};

use crate::cluster::types::NodeId;

/// Progress of the coordinator's one-shot assignment run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AssignmentPhase {
    Collecting,
    Assigning,
    Broadcasting,
    Done,
}

/// Shape of one registered table, which is all the assignment needs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct TableShape {
    pub table_id: u32,
    pub num_shards: usize,
}

/// A table server known to the coordinator and the shards it was handed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerState {
    pub id: NodeId,
    pub shards: Vec<(u32, usize)>,
}

impl ServerState {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            shards: Vec::new(),
        }
    }
}

/// How far a node has come through the cluster lifecycle. Stages only move
/// forward.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum NodeStage {
    Starting,
    /// The assignment has been applied locally; peers may still lack it.
    Assigned,
    /// Every node has applied the assignment.
    Ready,
    Loaded,
    Shutdown,
}
