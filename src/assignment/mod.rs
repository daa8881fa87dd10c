//! Shard Assignment Module
//!
//! One-shot protocol run by the coordinator after the tables have been
//! created on every node.
//!
//! ## Phases
//! 1. **Collecting**: every other node registers (`/internal/register`); duplicates are ignored.
//! 2. **Assigning**: the shards of each table go round-robin to the registered table servers.
//! 3. **Broadcasting**: the complete assignment, together with the node directory, is applied
//!    locally and sent to every registered node; each acknowledgement is awaited.
//! 4. **Done**: every acknowledgement is in; `AssignmentReady` releases the nodes,
//!    which may now route every key.
//!
//! The coordinator then drives the rest of the lifecycle over `/internal/control`:
//! `LoadComplete` after the initial data set is written, `WorkerEnd` from each
//! node when it is done, and `Shutdown` once every node has ended.

pub mod coordinator;
pub mod handlers;
pub mod protocol;
pub mod types;

pub use coordinator::{ShardAssigner, register_with_coordinator, report_end, round_robin};

#[cfg(test)]
mod tests;
