use anyhow::Result;
use dashmap::DashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, watch};

use crate::assignment::protocol::{ControlMessage, ControlSignal};
use crate::assignment::types::{NodeStage, TableShape};
use crate::cluster::directory::ClusterDirectory;
use crate::cluster::types::{NodeId, NodeInfo};
use crate::table::access::AccessCoordinator;
use crate::table::contract_violation;
use crate::table::descriptor::{TableDescriptor, TableKey, TableValue};
use crate::table::global::{GlobalTable, TableHandler, TableStats};
use crate::table::protocol::{GetRequest, GetResponse, ShardAssignment, UpdateBatch};
use crate::table::typed::TypedTable;
use crate::transport::Transport;

/// Per-node registry of tables and the receiving end of every table message.
///
/// Inbound reads, update batches and the assignment broadcast are dispatched
/// here by table id, whether they arrive over HTTP or the local transport.
pub struct TableServer {
    directory: Arc<ClusterDirectory>,
    access: Arc<AccessCoordinator>,
    tables: DashMap<u32, Arc<dyn TableHandler>>,
    /// Set on the coordinator while it is collecting registrations.
    registrations: Mutex<Option<mpsc::UnboundedSender<NodeInfo>>>,
    /// Set on the coordinator; receives the ids of nodes that finished.
    worker_ends: Mutex<Option<mpsc::UnboundedSender<NodeId>>>,
    stage: watch::Sender<NodeStage>,
}

impl TableServer {
    pub fn new(directory: Arc<ClusterDirectory>) -> Arc<Self> {
        let (stage, _) = watch::channel(NodeStage::Starting);
        Arc::new(Self {
            directory,
            access: AccessCoordinator::new(),
            tables: DashMap::new(),
            registrations: Mutex::new(None),
            worker_ends: Mutex::new(None),
            stage,
        })
    }

    pub fn local_node(&self) -> &NodeInfo {
        &self.directory.local_node
    }

    pub fn directory(&self) -> &Arc<ClusterDirectory> {
        &self.directory
    }

    pub fn access(&self) -> &Arc<AccessCoordinator> {
        &self.access
    }

    /// Creates a table on this node and returns its typed handle.
    ///
    /// Every node of the cluster must create the same tables, with the same
    /// ids and shard counts, before the assignment runs.
    pub fn create_table<K, V>(
        &self,
        descriptor: TableDescriptor<K, V>,
        transport: Arc<dyn Transport>,
    ) -> TypedTable<K, V>
    where
        K: TableKey,
        V: TableValue,
    {
        let table = GlobalTable::new(descriptor, self.local_node().id.clone(), transport);
        self.register_table(table.clone());
        TypedTable::new(table, self.access.clone())
    }

    pub fn register_table(&self, table: Arc<dyn TableHandler>) {
        let table_id = table.table_id();
        if self.tables.contains_key(&table_id) {
            contract_violation(format!(
                "table {} registered twice on {}",
                table_id,
                self.local_node().id
            ));
        }
        tracing::info!(
            "Registered table {} ({} shards) on {}",
            table_id,
            table.num_shards(),
            self.local_node().id
        );
        self.tables.insert(table_id, table);
    }

    pub fn table(&self, table_id: u32) -> Option<Arc<dyn TableHandler>> {
        self.tables.get(&table_id).map(|entry| entry.value().clone())
    }

    fn require_table(&self, table_id: u32) -> Result<Arc<dyn TableHandler>> {
        self.table(table_id)
            .ok_or_else(|| anyhow::anyhow!("Table {} is not registered on {}", table_id, self.local_node().id))
    }

    /// Registered tables ordered by id.
    pub fn table_shapes(&self) -> Vec<TableShape> {
        let mut shapes: Vec<TableShape> = self
            .tables
            .iter()
            .map(|entry| TableShape {
                table_id: entry.value().table_id(),
                num_shards: entry.value().num_shards(),
            })
            .collect();
        shapes.sort();
        shapes
    }

    pub fn handle_get(&self, request: &GetRequest) -> Result<GetResponse> {
        let table = self.require_table(request.table_id)?;
        Ok(table.handle_get(request))
    }

    pub fn apply_updates(&self, batch: &UpdateBatch) -> Result<usize> {
        let table = self.require_table(batch.table_id)?;
        table.apply_updates(batch)
    }

    /// Learns the node directory and hands the shard owners to every table.
    /// Returns the number of assignments received.
    pub fn apply_assignment(&self, assignment: &ShardAssignment) -> usize {
        self.directory.merge(&assignment.nodes);

        let tables: Vec<Arc<dyn TableHandler>> = self
            .tables
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for table in tables {
            table.update_partitions(assignment);
        }

        self.advance(NodeStage::Assigned);
        tracing::info!(
            "Applied shard assignment ({} shards, {} nodes) on {}",
            assignment.assignments.len(),
            assignment.nodes.len(),
            self.local_node().id
        );
        assignment.assignments.len()
    }

    pub fn stage(&self) -> NodeStage {
        *self.stage.borrow()
    }

    /// True once an assignment has been applied on this node.
    pub fn is_assigned(&self) -> bool {
        self.stage() >= NodeStage::Assigned
    }

    /// Moves the node forward to `stage`; earlier stages are ignored.
    pub fn advance(&self, stage: NodeStage) {
        let moved = self.stage.send_if_modified(|current| {
            if stage > *current {
                *current = stage;
                true
            } else {
                false
            }
        });
        if moved {
            tracing::debug!("{} reached stage {:?}", self.local_node().id, stage);
        }
    }

    /// Resolves once the node has reached `stage`.
    pub async fn wait_for_stage(&self, stage: NodeStage) {
        let mut receiver = self.stage.subscribe();
        // The sender lives as long as `self`, so the channel cannot close here.
        let _ = receiver.wait_for(|current| *current >= stage).await;
    }

    /// Resolves once the coordinator has confirmed that every node applied
    /// the assignment, so any peer can be routed to.
    pub async fn wait_for_assignment(&self) {
        self.wait_for_stage(NodeStage::Ready).await
    }

    pub fn accept_control(&self, message: &ControlMessage) {
        tracing::debug!("Control {:?} from {}", message.signal, message.source);
        match message.signal {
            ControlSignal::AssignmentReady => self.advance(NodeStage::Ready),
            ControlSignal::LoadComplete => self.advance(NodeStage::Loaded),
            ControlSignal::Shutdown => self.advance(NodeStage::Shutdown),
            ControlSignal::WorkerEnd => {
                let worker_ends = self
                    .worker_ends
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                match worker_ends.as_ref() {
                    Some(sender) => {
                        let _ = sender.send(message.source.clone());
                    }
                    None => {
                        tracing::warn!("Ignoring end of {}: not coordinating", message.source);
                    }
                }
            }
        }
    }

    /// Starts collecting `WorkerEnd` signals; they are delivered on the returned channel.
    pub fn attach_worker_ends(&self) -> mpsc::UnboundedReceiver<NodeId> {
        let (sender, receiver) = mpsc::unbounded_channel();
        *self
            .worker_ends
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(sender);
        receiver
    }

    /// Starts accepting registrations; they are delivered on the returned channel.
    pub fn attach_registrations(&self) -> mpsc::UnboundedReceiver<NodeInfo> {
        let (sender, receiver) = mpsc::unbounded_channel();
        *self
            .registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(sender);
        receiver
    }

    pub fn detach_registrations(&self) {
        self.registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub fn accept_registration(&self, node: NodeInfo) -> bool {
        let registrations = self
            .registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = registrations.as_ref() else {
            tracing::warn!("Rejected registration of {}: not collecting", node.id);
            return false;
        };

        self.directory.insert(node.clone());
        tracing::info!("Registration from {} ({:?}) at {}", node.id, node.role, node.addr);
        sender.send(node).is_ok()
    }

    pub fn stats(&self) -> Vec<TableStats> {
        let mut stats: Vec<TableStats> = self
            .tables
            .iter()
            .map(|entry| entry.value().stats())
            .collect();
        stats.sort_by_key(|table| table.table_id);
        stats
    }

    pub fn table_stats(&self, table_id: u32) -> Option<TableStats> {
        self.table(table_id).map(|table| table.stats())
    }
}
