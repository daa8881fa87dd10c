//! Table Server Module
//!
//! The receiving side of every node: a registry of the node's tables that
//! dispatches inbound reads, update batches, registrations and the shard
//! assignment, plus the axum routes exposing it.

pub mod handlers;
pub mod registry;

pub use handlers::router;
pub use registry::TableServer;
