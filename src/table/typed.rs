//! Typed Table Front-End
//!
//! What application code holds. Every operation computes the key's shard and
//! either touches the local partition (serialized through the access
//! coordinator) or goes to the owner: reads over the transport, writes through
//! the pending-write ledger.

use anyhow::Result;
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use super::access::AccessCoordinator;
use super::contract_violation;
use super::descriptor::{TableKey, TableValue};
use super::global::{GlobalTable, TableStats};
use super::protocol::{UpdateEntry, WriteMode};

pub struct TypedTable<K, V> {
    table: Arc<GlobalTable<K, V>>,
    access: Arc<AccessCoordinator>,
}

impl<K, V> Clone for TypedTable<K, V> {
    fn clone(&self) -> Self {
        Self {
            table: self.table.clone(),
            access: self.access.clone(),
        }
    }
}

impl<K, V> TypedTable<K, V>
where
    K: TableKey,
    V: TableValue,
{
    pub fn new(table: Arc<GlobalTable<K, V>>, access: Arc<AccessCoordinator>) -> Self {
        Self { table, access }
    }

    pub fn global(&self) -> &Arc<GlobalTable<K, V>> {
        &self.table
    }

    pub fn table_id(&self) -> u32 {
        self.table.table_id()
    }

    pub fn get_shard(&self, key: &K) -> usize {
        self.table.get_shard(key)
    }

    /// Inserts or overwrites `key`.
    pub async fn put(&self, key: K, value: V) -> Result<()> {
        self.write(key, value, WriteMode::Put).await
    }

    /// Merges `value` into `key` with the table's accumulator.
    pub async fn update(&self, key: K, value: V) -> Result<()> {
        self.write(key, value, WriteMode::Accumulate).await
    }

    async fn write(&self, key: K, value: V, mode: WriteMode) -> Result<()> {
        let shard = self.table.get_shard(&key);
        let encoded_key = self.table.descriptor().key_codec.encode(&key)?;

        if self.table.is_local_shard(shard) {
            let partition = self.table.get_partition(shard);
            self.access
                .sync_local_put(self.table_id(), &encoded_key)
                .await;
            match mode {
                WriteMode::Put => partition.put(key, value),
                WriteMode::Accumulate => partition.update(key, value),
            }
            self.access.event_complete(self.table_id(), &encoded_key);
            return Ok(());
        }

        let encoded_value = self.table.descriptor().value_codec.encode(&value)?;
        self.table.queue_update(UpdateEntry {
            shard,
            key: encoded_key,
            value: encoded_value,
            mode,
        });
        if self.table.should_flush() {
            self.table.send_updates().await?;
        }
        Ok(())
    }

    /// Reads `key`, waiting for the owner's reply when the shard is remote.
    pub async fn get(&self, key: &K) -> Result<Option<V>> {
        let shard = self.table.get_shard(key);
        let encoded_key = self.table.descriptor().key_codec.encode(key)?;

        if self.table.is_local_shard(shard) {
            let partition = self.table.get_partition(shard);
            self.access
                .sync_local_put(self.table_id(), &encoded_key)
                .await;
            let value = partition.get(key);
            self.access.event_complete(self.table_id(), &encoded_key);
            return Ok(value);
        }

        match self.table.get_remote(shard, encoded_key).await? {
            Some(bytes) => Ok(Some(self.table.descriptor().value_codec.decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Starts a read without waiting. Always reports "not ready"; collect the
    /// value with `async_get_collect`.
    pub fn async_get(&self, key: &K) -> Result<bool> {
        let shard = self.table.get_shard(key);
        if !self.table.is_local_shard(shard) {
            let encoded_key = self.table.descriptor().key_codec.encode(key)?;
            self.table.async_get_remote(shard, encoded_key);
        }
        Ok(false)
    }

    /// `Pending` until the value started by `async_get` is available. Each
    /// fired remote read becomes `Ready` exactly once.
    pub fn async_get_collect(&self, key: &K) -> Poll<Result<Option<V>>> {
        let shard = self.table.get_shard(key);
        let encoded_key = match self.table.descriptor().key_codec.encode(key) {
            Ok(bytes) => bytes,
            Err(e) => return Poll::Ready(Err(e.into())),
        };

        if self.table.is_local_shard(shard) {
            if !self.access.sync_local_get(self.table_id(), &encoded_key) {
                return Poll::Pending;
            }
            let value = self.table.get_partition(shard).get(key);
            self.access.event_complete(self.table_id(), &encoded_key);
            return Poll::Ready(Ok(value));
        }

        match self.table.async_get_remote_collect(shard, &encoded_key) {
            Poll::Ready(Ok(Some(bytes))) => Poll::Ready(
                self.table
                    .descriptor()
                    .value_codec
                    .decode(&bytes)
                    .map(Some)
                    .map_err(Into::into),
            ),
            Poll::Ready(Ok(None)) => Poll::Ready(Ok(None)),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }

    /// Polls `async_get_collect`, sleeping `backoff` between attempts.
    pub async fn collect_with_backoff(&self, key: &K, backoff: Duration) -> Result<Option<V>> {
        loop {
            match self.async_get_collect(key) {
                Poll::Ready(result) => return result,
                Poll::Pending => tokio::time::sleep(backoff).await,
            }
        }
    }

    pub async fn contains(&self, key: &K) -> Result<bool> {
        let shard = self.table.get_shard(key);
        let encoded_key = self.table.descriptor().key_codec.encode(key)?;

        if self.table.is_local_shard(shard) {
            let partition = self.table.get_partition(shard);
            self.access
                .sync_local_put(self.table_id(), &encoded_key)
                .await;
            let found = partition.contains(key);
            self.access.event_complete(self.table_id(), &encoded_key);
            return Ok(found);
        }

        Ok(self.table.get_remote(shard, encoded_key).await?.is_some())
    }

    /// Removal is not supported by distributed tables.
    pub fn remove(&self, key: &K) -> ! {
        contract_violation(format!(
            "remove({:?}) is not supported on table {}",
            key,
            self.table_id()
        ))
    }

    /// Sends every queued remote write now, regardless of the flush threshold.
    pub async fn flush(&self) -> Result<usize> {
        self.table.send_updates().await
    }

    pub fn pending_write_bytes(&self) -> usize {
        self.table.pending_write_bytes()
    }

    pub fn clear(&self, shard: usize) {
        self.table.clear(shard)
    }

    pub fn stats(&self) -> TableStats {
        self.table.stats()
    }
}
