use anyhow::Result;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};
use std::task::Poll;
use std::time::{SystemTime, UNIX_EPOCH};

use super::contract_violation;
use super::descriptor::{TableDescriptor, TableKey, TableValue};
use super::partition::LocalPartition;
use super::protocol::{
    GetRequest, GetResponse, ShardAssignment, UpdateBatch, UpdateEntry, WriteMode,
};
use crate::cluster::types::NodeId;
use crate::transport::Transport;

/// Batch ids remembered for de-duplication before the memory is reset.
const PROCESSED_BATCH_LIMIT: usize = 10_000;

/// Uncollected replies kept per key; older ones are dropped first.
const MAX_COMPLETIONS_PER_KEY: usize = 64;

/// Distinct keys with uncollected replies before the queue is reset.
const COMPLETION_KEY_LIMIT: usize = 10_000;

type CompletionQueue = DashMap<(usize, Vec<u8>), VecDeque<Result<GetResponse>>>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionInfo {
    /// `None` until the assignment broadcast has been applied.
    pub owner: Option<NodeId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TableStats {
    pub table_id: u32,
    pub num_shards: usize,
    pub local_shards: usize,
    /// Entries stored in this node's partitions.
    pub table_size: usize,
    pub pending_writes: usize,
    pub pending_write_bytes: usize,
}

/// Type-erased view of a table used by the table server to dispatch inbound
/// messages without knowing the key/value types.
pub trait TableHandler: Send + Sync {
    fn table_id(&self) -> u32;

    fn num_shards(&self) -> usize;

    fn handle_get(&self, request: &GetRequest) -> GetResponse;

    fn apply_updates(&self, batch: &UpdateBatch) -> Result<usize>;

    fn update_partitions(&self, assignment: &ShardAssignment);

    fn stats(&self) -> TableStats;
}

/// One distributed table as seen from one node: the shard -> owner map, the
/// partitions of locally owned shards and the ledger of writes waiting to be
/// flushed to remote owners.
///
/// Routing state, partitions and ledger sit behind separate locks. None of
/// them is held while calling into a partition or the transport.
pub struct GlobalTable<K, V> {
    descriptor: TableDescriptor<K, V>,
    local_node: NodeId,
    transport: Arc<dyn Transport>,
    partinfo: RwLock<Vec<PartitionInfo>>,
    partitions: RwLock<Vec<Option<Arc<dyn LocalPartition<K, V>>>>>,
    pending: Mutex<Vec<UpdateEntry>>,
    /// Bytes queued or in flight; released once the owner acknowledged them.
    pending_bytes: AtomicUsize,
    processed_batches: DashMap<String, u64>,
    /// Replies to `async_get_remote`, keyed by shard and encoded key, oldest first.
    completions: Arc<CompletionQueue>,
}

impl<K, V> GlobalTable<K, V>
where
    K: TableKey,
    V: TableValue,
{
    pub fn new(
        descriptor: TableDescriptor<K, V>,
        local_node: NodeId,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        let num_shards = descriptor.num_shards;
        tracing::debug!(
            "Initialized table {} with {} shards on {}",
            descriptor.table_id,
            num_shards,
            local_node
        );

        Arc::new(Self {
            descriptor,
            local_node,
            transport,
            partinfo: RwLock::new(vec![PartitionInfo::default(); num_shards]),
            partitions: RwLock::new(vec![None; num_shards]),
            pending: Mutex::new(Vec::new()),
            pending_bytes: AtomicUsize::new(0),
            processed_batches: DashMap::new(),
            completions: Arc::new(DashMap::new()),
        })
    }

    pub fn descriptor(&self) -> &TableDescriptor<K, V> {
        &self.descriptor
    }

    pub fn table_id(&self) -> u32 {
        self.descriptor.table_id
    }

    pub fn num_shards(&self) -> usize {
        self.descriptor.num_shards
    }

    pub fn local_node(&self) -> &NodeId {
        &self.local_node
    }

    // --- Routing ---

    pub fn get_shard(&self, key: &K) -> usize {
        let num_shards = self.num_shards();
        let shard = self.descriptor.sharder.shard(key, num_shards);
        if shard >= num_shards {
            contract_violation(format!(
                "key {:?} mapped to shard {} but table {} has {} shards",
                key,
                shard,
                self.table_id(),
                num_shards
            ));
        }
        shard
    }

    pub fn owner(&self, shard: usize) -> NodeId {
        if shard >= self.num_shards() {
            contract_violation(format!(
                "shard {} out of range for table {} ({} shards)",
                shard,
                self.table_id(),
                self.num_shards()
            ));
        }
        match self.try_owner(shard) {
            Some(owner) => owner,
            None => contract_violation(format!(
                "table {} shard {} routed before shard assignment",
                self.table_id(),
                shard
            )),
        }
    }

    pub fn try_owner(&self, shard: usize) -> Option<NodeId> {
        self.read_partinfo()
            .get(shard)
            .and_then(|info| info.owner.clone())
    }

    pub fn get_partition_info(&self, shard: usize) -> Option<PartitionInfo> {
        self.read_partinfo().get(shard).cloned()
    }

    /// True once every shard has an owner.
    pub fn is_assigned(&self) -> bool {
        self.read_partinfo().iter().all(|info| info.owner.is_some())
    }

    pub fn is_local_shard(&self, shard: usize) -> bool {
        self.owner(shard) == self.local_node
    }

    pub fn is_local_key(&self, key: &K) -> bool {
        self.is_local_shard(self.get_shard(key))
    }

    pub fn local_shards(&self) -> Vec<usize> {
        self.read_partitions()
            .iter()
            .enumerate()
            .filter_map(|(shard, slot)| slot.as_ref().map(|_| shard))
            .collect()
    }

    /// The partition of a locally owned shard. Callers check `is_local_shard` first.
    pub fn get_partition(&self, shard: usize) -> Arc<dyn LocalPartition<K, V>> {
        if !self.is_local_shard(shard) {
            contract_violation(format!(
                "table {} shard {} is owned by {}, not by {}",
                self.table_id(),
                shard,
                self.owner(shard),
                self.local_node
            ));
        }
        match self.local_partition(shard) {
            Some(partition) => partition,
            None => contract_violation(format!(
                "table {} shard {} is local but has no partition",
                self.table_id(),
                shard
            )),
        }
    }

    fn local_partition(&self, shard: usize) -> Option<Arc<dyn LocalPartition<K, V>>> {
        self.read_partitions()
            .get(shard)
            .and_then(|slot| slot.clone())
    }

    fn local_partitions(&self) -> Vec<Arc<dyn LocalPartition<K, V>>> {
        self.read_partitions().iter().flatten().cloned().collect()
    }

    // --- Server-side entry points ---

    /// Answers a peer's read of a key in a shard this node owns.
    pub fn handle_get(&self, request: &GetRequest) -> GetResponse {
        let key = match self.descriptor.key_codec.decode(&request.key) {
            Ok(key) => key,
            Err(e) => {
                tracing::warn!("GET: table {} received an undecodable key: {}", self.table_id(), e);
                return GetResponse::missing();
            }
        };

        let partition = self.get_partition(request.shard);
        match partition.get(&key) {
            Some(value) => match self.descriptor.value_codec.encode(&value) {
                Ok(bytes) => GetResponse::found(bytes),
                Err(e) => {
                    tracing::error!("GET: failed to encode value for {:?}: {}", key, e);
                    GetResponse::missing()
                }
            },
            None => {
                tracing::debug!("GET: {:?} not found in shard {}", key, request.shard);
                GetResponse::missing()
            }
        }
    }

    /// Applies a peer's buffered writes to local partitions. `Put` entries
    /// overwrite, `Accumulate` entries merge with the table's accumulator.
    ///
    /// The whole batch is decoded and every shard checked against the local
    /// routing before anything is applied, so a malformed or misrouted batch
    /// is rejected with nothing applied and may be retried once routing agrees.
    /// The batch id is recorded only when the batch is applied.
    pub fn apply_updates(&self, batch: &UpdateBatch) -> Result<usize> {
        if batch.table_id != self.table_id() {
            anyhow::bail!(
                "batch for table {} delivered to table {}",
                batch.table_id,
                self.table_id()
            );
        }
        if self.processed_batches.contains_key(&batch.batch_id) {
            tracing::debug!(
                "Skipping already applied batch {} from {}",
                batch.batch_id,
                batch.source
            );
            return Ok(0);
        }

        let mut decoded = Vec::with_capacity(batch.entries.len());
        for entry in &batch.entries {
            let partition = self.owned_partition(entry.shard).map_err(|e| {
                anyhow::anyhow!("batch {} from {}: {}", batch.batch_id, batch.source, e)
            })?;
            let key = self.descriptor.key_codec.decode(&entry.key)?;
            let value = self.descriptor.value_codec.decode(&entry.value)?;
            decoded.push((partition, entry.mode, key, value));
        }

        if !self.should_process(&batch.batch_id) {
            tracing::debug!("Batch {} was applied concurrently", batch.batch_id);
            return Ok(0);
        }

        let applied = decoded.len();
        for (partition, mode, key, value) in decoded {
            match mode {
                WriteMode::Put => partition.put(key, value),
                WriteMode::Accumulate => partition.update(key, value),
            }
        }

        tracing::debug!(
            "Applied {} updates from {} to table {}",
            applied,
            batch.source,
            self.table_id()
        );
        Ok(applied)
    }

    /// Like `get_partition`, but an error for shards a peer should not have
    /// sent here.
    fn owned_partition(&self, shard: usize) -> Result<Arc<dyn LocalPartition<K, V>>> {
        if shard >= self.num_shards() {
            anyhow::bail!("shard {} out of range for table {}", shard, self.table_id());
        }
        match self.try_owner(shard) {
            Some(owner) if owner == self.local_node => {}
            Some(owner) => anyhow::bail!(
                "table {} shard {} is owned by {}, not by {}",
                self.table_id(),
                shard,
                owner,
                self.local_node
            ),
            None => anyhow::bail!(
                "table {} shard {} has no owner on {} yet",
                self.table_id(),
                shard,
                self.local_node
            ),
        }
        self.local_partition(shard).ok_or_else(|| {
            anyhow::anyhow!("table {} shard {} has no partition", self.table_id(), shard)
        })
    }

    /// Records the owners broadcast by the coordinator, creating partitions
    /// for shards this node now owns and dropping those it no longer owns.
    pub fn update_partitions(&self, assignment: &ShardAssignment) {
        let table_id = self.table_id();

        let owners: Vec<Option<NodeId>> = {
            let mut partinfo = self.write_partinfo();
            for assigned in assignment.for_table(table_id) {
                let Some(info) = partinfo.get_mut(assigned.shard) else {
                    tracing::warn!(
                        "Ignoring assignment of shard {} for table {} ({} shards)",
                        assigned.shard,
                        table_id,
                        self.num_shards()
                    );
                    continue;
                };
                if let Some(previous) = &info.owner
                    && previous != &assigned.owner
                {
                    tracing::info!(
                        "Table {} shard {} moves from {} to {}",
                        table_id,
                        assigned.shard,
                        previous,
                        assigned.owner
                    );
                }
                info.owner = Some(assigned.owner.clone());
            }
            partinfo.iter().map(|info| info.owner.clone()).collect()
        };

        let mut partitions = self.write_partitions();
        for (shard, owner) in owners.iter().enumerate() {
            let is_local = owner.as_ref() == Some(&self.local_node);
            let has_partition = partitions[shard].is_some();
            if is_local && !has_partition {
                partitions[shard] = Some(
                    self.descriptor
                        .partition_factory
                        .create(shard, self.descriptor.accumulator.clone()),
                );
            } else if !is_local && has_partition {
                tracing::info!("Dropping partition {} of table {}", shard, table_id);
                partitions[shard] = None;
            }
        }

        tracing::info!(
            "Table {} on {}: {} of {} shards local",
            table_id,
            self.local_node,
            partitions.iter().filter(|slot| slot.is_some()).count(),
            self.num_shards()
        );
    }

    // --- Pending-write ledger ---

    /// Queues an encoded mutation for a remote owner.
    pub fn queue_update(&self, entry: UpdateEntry) {
        self.pending_bytes
            .fetch_add(entry.encoded_len(), Ordering::SeqCst);
        self.lock_pending().push(entry);
    }

    pub fn should_flush(&self) -> bool {
        let has_pending = !self.lock_pending().is_empty();
        has_pending && self.pending_write_bytes() >= self.descriptor.flush_threshold_bytes
    }

    /// Drains the ledger into one batch per owner and sends them.
    ///
    /// Batches that fail are put back at the front of the ledger and the first
    /// error is returned after every owner has been tried.
    pub async fn send_updates(&self) -> Result<usize> {
        let drained = std::mem::take(&mut *self.lock_pending());
        if drained.is_empty() {
            return Ok(0);
        }

        let mut by_owner: BTreeMap<NodeId, Vec<UpdateEntry>> = BTreeMap::new();
        for entry in drained {
            by_owner
                .entry(self.owner(entry.shard))
                .or_default()
                .push(entry);
        }

        let mut sent = 0;
        let mut first_error = None;
        for (owner, entries) in by_owner {
            let bytes: usize = entries.iter().map(UpdateEntry::encoded_len).sum();
            let count = entries.len();
            let batch = UpdateBatch::new(self.table_id(), self.local_node.clone(), entries);

            match self.transport.send_updates(&owner, &batch).await {
                Ok(_) => {
                    self.pending_bytes.fetch_sub(bytes, Ordering::SeqCst);
                    sent += count;
                    tracing::debug!(
                        "Flushed {} updates ({} bytes) of table {} to {}",
                        count,
                        bytes,
                        self.table_id(),
                        owner
                    );
                }
                Err(e) => {
                    tracing::warn!("Failed to flush {} updates to {}: {}", count, owner, e);
                    self.requeue(batch.entries);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(sent),
        }
    }

    pub fn pending_write_bytes(&self) -> usize {
        self.pending_bytes.load(Ordering::SeqCst)
    }

    pub fn pending_writes(&self) -> usize {
        self.lock_pending().len()
    }

    fn requeue(&self, entries: Vec<UpdateEntry>) {
        let mut pending = self.lock_pending();
        let newer = std::mem::replace(&mut *pending, entries);
        pending.extend(newer);
    }

    fn should_process(&self, batch_id: &str) -> bool {
        if self.processed_batches.len() > PROCESSED_BATCH_LIMIT {
            self.processed_batches.clear();
        }
        match self.processed_batches.entry(batch_id.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(now_ms());
                true
            }
        }
    }

    // --- Remote reads ---

    /// Fetches an encoded key from its owner, waiting for the round trip.
    /// There is no timeout at this layer.
    pub async fn get_remote(&self, shard: usize, key: Vec<u8>) -> Result<Option<Vec<u8>>> {
        let owner = self.owner(shard);
        let request = GetRequest {
            table_id: self.table_id(),
            shard,
            key,
        };
        let response = self.transport.get(&owner, &request).await?;
        Ok(response.into_value())
    }

    /// Sends the read without waiting; the reply lands in the completion queue.
    /// Must be called from within a tokio runtime.
    pub fn async_get_remote(&self, shard: usize, key: Vec<u8>) {
        let owner = self.owner(shard);
        let transport = self.transport.clone();
        let completions = self.completions.clone();
        let request = GetRequest {
            table_id: self.table_id(),
            shard,
            key,
        };

        tokio::spawn(async move {
            let result = transport.get(&owner, &request).await;
            if let Err(e) = &result {
                tracing::warn!("Async GET to {} failed: {}", owner, e);
            }
            push_completion(&completions, (request.shard, request.key), result);
        });
    }

    /// Takes the oldest reply received for `key` in `shard`, if any.
    pub fn async_get_remote_collect(
        &self,
        shard: usize,
        key: &[u8],
    ) -> Poll<Result<Option<Vec<u8>>>> {
        let slot = (shard, key.to_vec());
        let completion = {
            let Some(mut queue) = self.completions.get_mut(&slot) else {
                return Poll::Pending;
            };
            queue.pop_front()
        };
        self.completions.remove_if(&slot, |_, queue| queue.is_empty());

        match completion {
            Some(result) => Poll::Ready(result.map(GetResponse::into_value)),
            None => Poll::Pending,
        }
    }

    // --- Bookkeeping ---

    /// Uncollected async replies across all keys.
    pub fn pending_completions(&self) -> usize {
        self.completions.iter().map(|entry| entry.value().len()).sum()
    }

    /// Drops local data of a shard and any uncollected async replies for it.
    /// Writes already queued for remote owners stay queued.
    pub fn clear(&self, shard: usize) {
        self.completions.retain(|(queued, _), _| *queued != shard);
        match self.local_partition(shard) {
            Some(partition) => {
                partition.clear();
                tracing::info!("Cleared shard {} of table {}", shard, self.table_id());
            }
            None => {
                tracing::debug!("No local data for shard {} of table {}", shard, self.table_id());
            }
        }
    }

    pub fn resize(&self, new_size: usize) {
        for partition in self.local_partitions() {
            partition.resize(new_size);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.local_partitions()
            .iter()
            .all(|partition| partition.is_empty())
    }

    pub fn shard_size(&self, shard: usize) -> usize {
        self.local_partition(shard)
            .map(|partition| partition.len())
            .unwrap_or(0)
    }

    pub fn stats(&self) -> TableStats {
        let partitions = self.local_partitions();
        TableStats {
            table_id: self.table_id(),
            num_shards: self.num_shards(),
            local_shards: partitions.len(),
            table_size: partitions.iter().map(|partition| partition.len()).sum(),
            pending_writes: self.pending_writes(),
            pending_write_bytes: self.pending_write_bytes(),
        }
    }

    fn read_partinfo(&self) -> RwLockReadGuard<'_, Vec<PartitionInfo>> {
        self.partinfo.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_partinfo(&self) -> RwLockWriteGuard<'_, Vec<PartitionInfo>> {
        self.partinfo.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_partitions(&self) -> RwLockReadGuard<'_, Vec<Option<Arc<dyn LocalPartition<K, V>>>>> {
        self.partitions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_partitions(
        &self,
    ) -> RwLockWriteGuard<'_, Vec<Option<Arc<dyn LocalPartition<K, V>>>>> {
        self.partitions.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_pending(&self) -> MutexGuard<'_, Vec<UpdateEntry>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<K, V> TableHandler for GlobalTable<K, V>
where
    K: TableKey,
    V: TableValue,
{
    fn table_id(&self) -> u32 {
        GlobalTable::table_id(self)
    }

    fn num_shards(&self) -> usize {
        GlobalTable::num_shards(self)
    }

    fn handle_get(&self, request: &GetRequest) -> GetResponse {
        GlobalTable::handle_get(self, request)
    }

    fn apply_updates(&self, batch: &UpdateBatch) -> Result<usize> {
        GlobalTable::apply_updates(self, batch)
    }

    fn update_partitions(&self, assignment: &ShardAssignment) {
        GlobalTable::update_partitions(self, assignment)
    }

    fn stats(&self) -> TableStats {
        GlobalTable::stats(self)
    }
}

fn push_completion(
    completions: &CompletionQueue,
    slot: (usize, Vec<u8>),
    result: Result<GetResponse>,
) {
    if completions.len() >= COMPLETION_KEY_LIMIT && !completions.contains_key(&slot) {
        tracing::warn!(
            "{} keys with uncollected async replies, dropping them",
            completions.len()
        );
        completions.clear();
    }
    let mut queue = completions.entry(slot).or_default();
    if queue.len() >= MAX_COMPLETIONS_PER_KEY {
        tracing::warn!("Dropping oldest uncollected async reply");
        queue.pop_front();
    }
    queue.push_back(result);
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
