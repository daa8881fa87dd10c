//! Distributed Table Module
//!
//! A key/value abstraction whose shards are spread over the table servers of
//! the cluster.
//!
//! ## Core Concepts
//! - **Shards**: the descriptor's sharder maps every key to one of `num_shards` shards.
//! - **Ownership**: each shard has exactly one owner once the coordinator has
//!   broadcast the assignment; routing before that is a contract violation.
//! - **Local access**: keys of locally owned shards are read and written in place,
//!   serialized per key by the `AccessCoordinator`.
//! - **Remote access**: reads go to the owner over the transport; writes are queued in
//!   the pending-write ledger and flushed as one batch per owner, where they are
//!   merged with the table's accumulator.
//!
//! ## Submodules
//! - **`descriptor`**: immutable table configuration (sharder, accumulator, codecs).
//! - **`partition`**: the per-shard in-memory store.
//! - **`access`**: per-key local access coordinator.
//! - **`global`**: shard routing, ledger and the server-side entry points.
//! - **`typed`**: the typed front-end used by application code.
//! - **`protocol`**: wire messages.

pub mod access;
pub mod codec;
pub mod descriptor;
pub mod global;
pub mod partition;
pub mod protocol;
pub mod typed;

use std::sync::atomic::{AtomicBool, Ordering};


static ABORT_ON_VIOLATION: AtomicBool = AtomicBool::new(!cfg!(test));

/// Chooses between aborting the process (the default) and panicking on a
/// contract violation. A panic only unwinds the task it happens in, so a node
/// serving requests keeps running after it.
pub fn set_abort_on_contract_violation(abort: bool) {
    ABORT_ON_VIOLATION.store(abort, Ordering::SeqCst);
}

/// Stops the process on a caller or protocol bug (routing before assignment,
/// touching an unowned partition, out-of-range shard, unsupported operation).
#[track_caller]
pub(crate) fn contract_violation(message: String) -> ! {
    let location = std::panic::Location::caller();
    tracing::error!("contract violation at {}: {}", location, message);
    if ABORT_ON_VIOLATION.load(Ordering::SeqCst) {
        std::process::abort();
    }
    panic!("contract violation: {}", message);
}
