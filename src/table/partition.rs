//! Local Partition
//!
//! In-memory store for exactly one shard on one node. The descriptor's
//! accumulator is bound at construction so `update` merges instead of
//! overwriting.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::descriptor::{Accumulator, TableKey, TableValue};

pub trait LocalPartition<K, V>: Send + Sync {
    fn shard(&self) -> usize;

    fn get(&self, key: &K) -> Option<V>;

    fn contains(&self, key: &K) -> bool;

    /// Inserts or overwrites.
    fn put(&self, key: K, value: V);

    /// Merges `value` into the stored value with the partition's accumulator,
    /// inserting it when the key is absent.
    fn update(&self, key: K, value: V);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clear(&self);

    /// Capacity hint for the expected number of entries.
    fn resize(&self, new_size: usize);

    fn entries(&self) -> Vec<(K, V)>;
}

/// Builds the partition for a shard once this node becomes its owner.
pub trait PartitionFactory<K, V>: Send + Sync {
    fn create(
        &self,
        shard: usize,
        accumulator: Arc<dyn Accumulator<V>>,
    ) -> Arc<dyn LocalPartition<K, V>>;
}

pub struct MemoryPartition<K, V> {
    shard: usize,
    data: RwLock<HashMap<K, V>>,
    accumulator: Arc<dyn Accumulator<V>>,
}

impl<K, V> MemoryPartition<K, V>
where
    K: TableKey,
    V: TableValue,
{
    pub fn new(shard: usize, accumulator: Arc<dyn Accumulator<V>>) -> Self {
        Self {
            shard,
            data: RwLock::new(HashMap::new()),
            accumulator,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<K, V>> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<K, V>> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<K, V> LocalPartition<K, V> for MemoryPartition<K, V>
where
    K: TableKey,
    V: TableValue,
{
    fn shard(&self) -> usize {
        self.shard
    }

    fn get(&self, key: &K) -> Option<V> {
        self.read().get(key).cloned()
    }

    fn contains(&self, key: &K) -> bool {
        self.read().contains_key(key)
    }

    fn put(&self, key: K, value: V) {
        self.write().insert(key, value);
    }

    fn update(&self, key: K, value: V) {
        match self.write().entry(key) {
            Entry::Occupied(mut entry) => self.accumulator.accumulate(entry.get_mut(), value),
            Entry::Vacant(entry) => {
                entry.insert(value);
            }
        }
    }

    fn len(&self) -> usize {
        self.read().len()
    }

    fn clear(&self) {
        self.write().clear();
    }

    fn resize(&self, new_size: usize) {
        let mut data = self.write();
        if new_size > data.capacity() {
            let additional = new_size - data.len();
            data.reserve(additional);
        } else {
            data.shrink_to(new_size);
        }
    }

    fn entries(&self) -> Vec<(K, V)> {
        self.read()
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryPartitionFactory;

impl<K, V> PartitionFactory<K, V> for MemoryPartitionFactory
where
    K: TableKey,
    V: TableValue,
{
    fn create(
        &self,
        shard: usize,
        accumulator: Arc<dyn Accumulator<V>>,
    ) -> Arc<dyn LocalPartition<K, V>> {
        Arc::new(MemoryPartition::new(shard, accumulator))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::descriptor::{Replace, Sum};

    #[test]
    fn test_put_overwrites_update_accumulates() {
        let partition = MemoryPartition::<String, i64>::new(0, Arc::new(Sum));

        partition.put("w".to_string(), 5);
        partition.put("w".to_string(), 7);
        assert_eq!(partition.get(&"w".to_string()), Some(7));

        partition.update("w".to_string(), 3);
        assert_eq!(partition.get(&"w".to_string()), Some(10));

        partition.update("fresh".to_string(), 4);
        assert_eq!(partition.get(&"fresh".to_string()), Some(4));
    }

    #[test]
    fn test_clear_and_len() {
        let partition = MemoryPartition::<i32, i32>::new(2, Arc::new(Replace));
        for i in 0..10 {
            partition.put(i, i * i);
        }

        assert_eq!(partition.shard(), 2);
        assert_eq!(partition.len(), 10);
        assert!(partition.contains(&3));

        partition.clear();
        assert!(partition.is_empty());
        assert!(!partition.contains(&3));
    }

    #[test]
    fn test_resize_keeps_entries() {
        let partition = MemoryPartition::<i32, i32>::new(0, Arc::new(Replace));
        partition.put(1, 1);

        partition.resize(1024);
        partition.resize(0);

        assert_eq!(partition.entries(), vec![(1, 1)]);
    }

    #[test]
    fn test_factory_binds_accumulator() {
        let partition =
            PartitionFactory::<i32, i64>::create(&MemoryPartitionFactory, 1, Arc::new(Sum));

        partition.update(9, 2);
        partition.update(9, 2);

        assert_eq!(partition.get(&9), Some(4));
    }
}
