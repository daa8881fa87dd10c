//! Cluster Directory Module
//!
//! Identities and addresses of the processes taking part in a table cluster.
//!
//! ## Core Concepts
//! - **Roles**: one coordinator runs the shard assignment, table servers own shards,
//!   workers only read and write through the typed tables.
//! - **Directory**: every node keeps a `ClusterDirectory` mapping node ids to addresses.
//!   It is seeded with the local node and filled from registrations (coordinator) or
//!   from the shard assignment broadcast (everyone else).

pub mod directory;
pub mod types;

#[cfg(test)]
mod tests;
