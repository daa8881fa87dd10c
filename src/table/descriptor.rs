//! Table Descriptor
//!
//! Immutable per-table configuration shared by every partition of a table:
//! shard count, codecs, shard selection, merge-on-write semantics and the
//! factory that builds local partitions.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::AddAssign;
use std::sync::Arc;

use super::codec::{BincodeCodec, Codec};
use super::partition::{MemoryPartitionFactory, PartitionFactory};

/// Bounds every table key satisfies.
pub trait TableKey: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

impl<T> TableKey for T where T: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

/// Bounds every table value satisfies.
pub trait TableValue: Clone + Send + Sync + 'static {}

impl<T> TableValue for T where T: Clone + Send + Sync + 'static {}

/// Maps a key onto a shard index in `[0, num_shards)`.
pub trait Sharder<K>: Send + Sync {
    fn shard(&self, key: &K, num_shards: usize) -> usize;
}

/// Hashes the key with the std SipHash hasher (fixed keys, so every process
/// agrees on the placement).
#[derive(Debug, Clone, Copy, Default)]
pub struct HashSharder;

impl<K: Hash> Sharder<K> for HashSharder {
    fn shard(&self, key: &K, num_shards: usize) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % num_shards as u64) as usize
    }
}

/// Integer keys placed by `key mod num_shards`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModSharder;

impl<K> Sharder<K> for ModSharder
where
    K: Copy + Into<i64>,
{
    fn shard(&self, key: &K, num_shards: usize) -> usize {
        let key: i64 = (*key).into();
        key.rem_euclid(num_shards as i64) as usize
    }
}

pub struct FnSharder<F>(pub F);

impl<K, F> Sharder<K> for FnSharder<F>
where
    F: Fn(&K, usize) -> usize + Send + Sync,
{
    fn shard(&self, key: &K, num_shards: usize) -> usize {
        (self.0)(key, num_shards)
    }
}

/// Merge-on-write: folds an incoming update into the stored value.
///
/// When several nodes `update` the same key, batches reach the owner in no
/// particular order, so the function should be commutative and associative
/// (sum, max, ...) for the result to converge.
pub trait Accumulator<V>: Send + Sync {
    fn accumulate(&self, current: &mut V, update: V);
}

/// Last write wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct Replace;

impl<V> Accumulator<V> for Replace {
    fn accumulate(&self, current: &mut V, update: V) {
        *current = update;
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Sum;

impl<V: AddAssign> Accumulator<V> for Sum {
    fn accumulate(&self, current: &mut V, update: V) {
        *current += update;
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Max;

impl<V: PartialOrd> Accumulator<V> for Max {
    fn accumulate(&self, current: &mut V, update: V) {
        if update > *current {
            *current = update;
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Min;

impl<V: PartialOrd> Accumulator<V> for Min {
    fn accumulate(&self, current: &mut V, update: V) {
        if update < *current {
            *current = update;
        }
    }
}

/// Adds parameter vectors element by element, growing the stored vector when
/// the update is longer.
#[derive(Debug, Clone, Copy, Default)]
pub struct ElementwiseSum;

impl<T> Accumulator<Vec<T>> for ElementwiseSum
where
    T: AddAssign + Copy + Default,
{
    fn accumulate(&self, current: &mut Vec<T>, update: Vec<T>) {
        if current.len() < update.len() {
            current.resize(update.len(), T::default());
        }
        for (slot, delta) in current.iter_mut().zip(update) {
            *slot += delta;
        }
    }
}

pub struct FnAccumulator<F>(pub F);

impl<V, F> Accumulator<V> for FnAccumulator<F>
where
    F: Fn(&mut V, V) + Send + Sync,
{
    fn accumulate(&self, current: &mut V, update: V) {
        (self.0)(current, update)
    }
}

/// Immutable configuration of one distributed table.
pub struct TableDescriptor<K, V> {
    pub table_id: u32,
    pub num_shards: usize,
    pub key_codec: Arc<dyn Codec<K>>,
    pub value_codec: Arc<dyn Codec<V>>,
    pub sharder: Arc<dyn Sharder<K>>,
    pub accumulator: Arc<dyn Accumulator<V>>,
    pub partition_factory: Arc<dyn PartitionFactory<K, V>>,
    /// Buffered bytes destined for remote owners before a write triggers a
    /// flush. `0` flushes on every remote write.
    pub flush_threshold_bytes: usize,
}

impl<K, V> TableDescriptor<K, V>
where
    K: TableKey + Serialize + DeserializeOwned,
    V: TableValue + Serialize + DeserializeOwned,
{
    /// Bincode codecs, hash sharding, last-write-wins accumulation and
    /// in-memory partitions.
    pub fn new(table_id: u32, num_shards: usize) -> Self {
        if num_shards == 0 {
            super::contract_violation(format!("table {} declared with zero shards", table_id));
        }

        Self {
            table_id,
            num_shards,
            key_codec: Arc::new(BincodeCodec),
            value_codec: Arc::new(BincodeCodec),
            sharder: Arc::new(HashSharder),
            accumulator: Arc::new(Replace),
            partition_factory: Arc::new(MemoryPartitionFactory),
            flush_threshold_bytes: 0,
        }
    }
}

impl<K, V> TableDescriptor<K, V> {
    pub fn with_key_codec(mut self, codec: impl Codec<K> + 'static) -> Self {
        self.key_codec = Arc::new(codec);
        self
    }

    pub fn with_value_codec(mut self, codec: impl Codec<V> + 'static) -> Self {
        self.value_codec = Arc::new(codec);
        self
    }

    pub fn with_sharder(mut self, sharder: impl Sharder<K> + 'static) -> Self {
        self.sharder = Arc::new(sharder);
        self
    }

    pub fn with_accumulator(mut self, accumulator: impl Accumulator<V> + 'static) -> Self {
        self.accumulator = Arc::new(accumulator);
        self
    }

    pub fn with_partition_factory(mut self, factory: impl PartitionFactory<K, V> + 'static) -> Self {
        self.partition_factory = Arc::new(factory);
        self
    }

    pub fn with_flush_threshold(mut self, bytes: usize) -> Self {
        self.flush_threshold_bytes = bytes;
        self
    }
}

impl<K, V> Clone for TableDescriptor<K, V> {
    fn clone(&self) -> Self {
        Self {
            table_id: self.table_id,
            num_shards: self.num_shards,
            key_codec: self.key_codec.clone(),
            value_codec: self.value_codec.clone(),
            sharder: self.sharder.clone(),
            accumulator: self.accumulator.clone(),
            partition_factory: self.partition_factory.clone(),
            flush_threshold_bytes: self.flush_threshold_bytes,
        }
    }
}

impl<K, V> fmt::Debug for TableDescriptor<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableDescriptor")
            .field("table_id", &self.table_id)
            .field("num_shards", &self.num_shards)
            .field("flush_threshold_bytes", &self.flush_threshold_bytes)
            .finish_non_exhaustive()
    }
}
