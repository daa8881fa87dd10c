//! Sharded Parameter Table Library
//!
//! Distributed key/value tables whose shards are spread over the table servers
//! of a cluster. Application code reads and writes through typed tables; keys of
//! locally owned shards are served in place, remote reads travel to the owner
//! and remote writes are buffered and merged there with the table's accumulator.
//!
//! ## Architecture Modules
//!
//! - **`table`**: descriptors, per-shard partitions, routing, the pending-write
//!   ledger and the typed front-end (`TypedTable`).
//! - **`assignment`**: the coordinator's one-shot protocol that collects
//!   registrations and hands out shard ownership round-robin, then the
//!   release, load and shutdown signals of the node lifecycle.
//! - **`server`**: the per-node `TableServer` that receives reads, update batches
//!   and the assignment, plus its axum routes.
//! - **`transport`**: delivery of table messages, over HTTP (`reqwest`) or
//!   in-process for tests.
//! - **`cluster`**: node identities, roles and the address directory.
//! - **`config`**: command-line and transport settings.

pub mod assignment;
pub mod cluster;
pub mod config;
pub mod server;
pub mod table;
pub mod transport;
