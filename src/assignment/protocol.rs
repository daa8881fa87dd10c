//! Registration and lifecycle messages between the coordinator and the other nodes.

use serde::{Deserialize, Serialize};

use crate::cluster::types::{NodeId, NodeInfo};

/// A node announcing itself to the coordinator.
pub const ENDPOINT_REGISTER: &str = "/internal/register";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegisterRequest {
    pub node: NodeInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegisterResponse {
    /// False when the receiver is not collecting registrations.
    pub accepted: bool,
}

/// Cluster lifecycle signals exchanged after registration.
pub const ENDPOINT_CONTROL: &str = "/internal/control";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ControlSignal {
    /// Coordinator -> nodes: every node has applied the shard assignment.
    AssignmentReady,
    /// Coordinator -> nodes: the initial data set has been written.
    LoadComplete,
    /// Node -> coordinator: the node finished its work and flushed its writes.
    WorkerEnd,
    /// Coordinator -> nodes: every node has ended, exit now.
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControlMessage {
    pub signal: ControlSignal,
    pub source: NodeId,
}
