//! Local Access Coordinator
//!
//! Serializes a node's synchronous accesses to a key against its own
//! asynchronous completion path, so that a local `get`/`put` and an in-flight
//! `async_get_collect` for the same key never touch the partition at the same
//! time.
//!
//! Every successful `sync_local_put` / `sync_local_get` must be paired with
//! exactly one `event_complete`. A missing release leaves the key registered
//! forever and any later waiter blocks; there is no timeout.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use tokio::sync::Notify;

type SlotKey = (u32, Vec<u8>);

#[derive(Default)]
pub struct AccessCoordinator {
    /// Keys with an outstanding access, each with the notifier its waiters park on.
    slots: DashMap<SlotKey, Arc<Notify>>,
}

impl AccessCoordinator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Waits until no access is registered for `key`, then registers one.
    pub async fn sync_local_put(&self, table_id: u32, key: &[u8]) {
        let slot: SlotKey = (table_id, key.to_vec());

        loop {
            let notify = match self.slots.entry(slot.clone()) {
                Entry::Vacant(entry) => {
                    entry.insert(Arc::new(Notify::new()));
                    return;
                }
                Entry::Occupied(entry) => entry.get().clone(),
            };

            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            // The holder may have released between the entry lookup and `enable`.
            if !self.is_held_by(&slot, &notify) {
                continue;
            }

            tracing::trace!("Waiting for access to key in table {}", table_id);
            notified.await;
        }
    }

    /// Registers an access for `key` if none is outstanding. Never waits.
    pub fn sync_local_get(&self, table_id: u32, key: &[u8]) -> bool {
        match self.slots.entry((table_id, key.to_vec())) {
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(Notify::new()));
                true
            }
            Entry::Occupied(_) => false,
        }
    }

    /// Releases the registration for `key` and wakes every waiter.
    pub fn event_complete(&self, table_id: u32, key: &[u8]) {
        match self.slots.remove(&(table_id, key.to_vec())) {
            Some((_, notify)) => notify.notify_waiters(),
            None => {
                tracing::warn!(
                    "event_complete without a registered access (table {})",
                    table_id
                );
            }
        }
    }

    pub fn is_outstanding(&self, table_id: u32, key: &[u8]) -> bool {
        self.slots.contains_key(&(table_id, key.to_vec()))
    }

    pub fn outstanding(&self) -> usize {
        self.slots.len()
    }

    fn is_held_by(&self, slot: &SlotKey, notify: &Arc<Notify>) -> bool {
        self.slots
            .get(slot)
            .map(|current| Arc::ptr_eq(current.value(), notify))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_sync_local_get_is_exclusive() {
        let access = AccessCoordinator::new();

        assert!(access.sync_local_get(0, b"k"));
        assert!(!access.sync_local_get(0, b"k"));
        assert!(access.is_outstanding(0, b"k"));

        access.event_complete(0, b"k");
        assert!(!access.is_outstanding(0, b"k"));
        assert!(access.sync_local_get(0, b"k"));
    }

    #[test]
    fn test_tables_do_not_share_slots() {
        let access = AccessCoordinator::new();

        assert!(access.sync_local_get(0, b"k"));
        assert!(access.sync_local_get(1, b"k"));
        assert_eq!(access.outstanding(), 2);
    }

    #[test]
    fn test_unpaired_release_is_harmless() {
        let access = AccessCoordinator::new();
        access.event_complete(0, b"never-registered");
        assert_eq!(access.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_sync_local_put_waits_for_release() {
        let access = AccessCoordinator::new();
        access.sync_local_put(0, b"w").await;

        let waiter = {
            let access = access.clone();
            tokio::spawn(async move {
                access.sync_local_put(0, b"w").await;
                access.event_complete(0, b"w");
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished(), "second access must wait for the first");

        access.event_complete(0, b"w");

        tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("waiter should be released")
            .unwrap();
        assert_eq!(access.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_many_waiters_are_serialized() {
        let access = AccessCoordinator::new();
        let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut handles = Vec::new();

        for _ in 0..16 {
            let access = access.clone();
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                access.sync_local_put(7, b"shared").await;
                let inside = counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                assert_eq!(inside, 0, "two accesses held the same key");
                tokio::task::yield_now().await;
                counter.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
                access.event_complete(7, b"shared");
            }));
        }

        for handle in handles {
            tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .expect("access should not deadlock")
                .unwrap();
        }
        assert_eq!(access.outstanding(), 0);
    }
}
