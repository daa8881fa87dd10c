use anyhow::{Context, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, watch};

use super::protocol::{ControlMessage, ControlSignal};
use super::types::{AssignmentPhase, ServerState, TableShape};
use crate::cluster::types::{NodeId, NodeInfo};
use crate::server::registry::TableServer;
use crate::table::protocol::{ShardAssignment, ShardOwner};
use crate::transport::Transport;

const REGISTER_MAX_BACKOFF: Duration = Duration::from_millis(1200);

/// Runs the one-shot shard assignment on the coordinator.
///
/// Waits for `expected` distinct registrations, hands the shards of every
/// table registered on the coordinator's own server to the registered table
/// servers, then broadcasts the result and waits for every acknowledgement.
/// Only then are the nodes released with `AssignmentReady`.
///
/// After the run the assigner drives the rest of the lifecycle: `signal_all`
/// for cluster-wide signals and `shutdown_cluster` once every node has ended.
pub struct ShardAssigner {
    server: Arc<TableServer>,
    transport: Arc<dyn Transport>,
    expected: usize,
    registrations: Mutex<mpsc::UnboundedReceiver<NodeInfo>>,
    worker_ends: Mutex<mpsc::UnboundedReceiver<NodeId>>,
    registered: Mutex<Vec<NodeInfo>>,
    phase: watch::Sender<AssignmentPhase>,
}

impl ShardAssigner {
    /// Starts collecting registrations on `server` right away.
    pub fn new(server: Arc<TableServer>, transport: Arc<dyn Transport>, expected: usize) -> Arc<Self> {
        let registrations = server.attach_registrations();
        let worker_ends = server.attach_worker_ends();
        let (phase, _) = watch::channel(AssignmentPhase::Collecting);

        Arc::new(Self {
            server,
            transport,
            expected,
            registrations: Mutex::new(registrations),
            worker_ends: Mutex::new(worker_ends),
            registered: Mutex::new(Vec::new()),
            phase,
        })
    }

    pub fn phase(&self) -> AssignmentPhase {
        *self.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<AssignmentPhase> {
        self.phase.subscribe()
    }

    pub async fn run(&self) -> Result<ShardAssignment> {
        let registered = self.collect().await?;

        self.set_phase(AssignmentPhase::Assigning);
        let mut servers: Vec<ServerState> = registered
            .iter()
            .filter(|node| node.role.serves_tables())
            .map(|node| ServerState::new(node.id.clone()))
            .collect();
        if servers.is_empty() {
            anyhow::bail!(
                "No table servers among {} registered nodes; cannot assign shards",
                registered.len()
            );
        }

        let server_ids: Vec<NodeId> = servers.iter().map(|server| server.id.clone()).collect();
        let assignments = round_robin(&self.server.table_shapes(), &server_ids);
        for assigned in &assignments {
            if let Some(state) = servers.iter_mut().find(|state| state.id == assigned.owner) {
                state.shards.push((assigned.table_id, assigned.shard));
            }
        }
        for state in &servers {
            tracing::info!("Assigned {} shards to {}", state.shards.len(), state.id);
        }

        let assignment = ShardAssignment {
            assignments,
            nodes: self.server.directory().members(),
        };

        self.set_phase(AssignmentPhase::Broadcasting);
        self.broadcast(&assignment, &registered).await?;
        *self.registered.lock().await = registered;
        self.signal_all(ControlSignal::AssignmentReady).await?;

        self.set_phase(AssignmentPhase::Done);
        tracing::info!(
            "Shard assignment complete: {} shards over {} table servers",
            assignment.assignments.len(),
            servers.len()
        );
        Ok(assignment)
    }

    async fn collect(&self) -> Result<Vec<NodeInfo>> {
        self.set_phase(AssignmentPhase::Collecting);
        tracing::info!("Waiting for {} registrations", self.expected);

        let mut receiver = self.registrations.lock().await;
        let mut registered: BTreeMap<NodeId, NodeInfo> = BTreeMap::new();

        while registered.len() < self.expected {
            let Some(node) = receiver.recv().await else {
                anyhow::bail!(
                    "Registration channel closed after {} of {} nodes",
                    registered.len(),
                    self.expected
                );
            };
            if node.id == self.server.local_node().id {
                continue;
            }
            let id = node.id.clone();
            if registered.insert(id.clone(), node).is_some() {
                tracing::debug!("Ignoring duplicate registration from {}", id);
            } else {
                tracing::info!("Registered {} ({}/{})", id, registered.len(), self.expected);
            }
        }

        self.server.detach_registrations();
        Ok(registered.into_values().collect())
    }

    /// Table servers are sent the assignment before any other node, so a node
    /// that can route never routes to an owner that has not installed its shards.
    async fn broadcast(&self, assignment: &ShardAssignment, registered: &[NodeInfo]) -> Result<()> {
        self.server.apply_assignment(assignment);

        let (servers, others): (Vec<&NodeInfo>, Vec<&NodeInfo>) =
            registered.iter().partition(|node| node.role.serves_tables());
        for node in servers.into_iter().chain(others) {
            let applied = self
                .transport
                .assign_shards(&node.id, assignment)
                .await
                .with_context(|| format!("Failed to deliver shard assignment to {}", node.id))?;
            tracing::debug!("{} acknowledged {} assignments", node.id, applied);
        }
        Ok(())
    }

    /// Delivers `signal` to this node and then to every registered node.
    pub async fn signal_all(&self, signal: ControlSignal) -> Result<()> {
        if signal == ControlSignal::WorkerEnd {
            anyhow::bail!("WorkerEnd is sent to the coordinator, not broadcast");
        }
        let message = ControlMessage {
            signal,
            source: self.server.local_node().id.clone(),
        };
        self.server.accept_control(&message);

        let registered = self.registered.lock().await.clone();
        for node in &registered {
            self.transport
                .send_control(&node.id, &message)
                .await
                .with_context(|| format!("Failed to deliver {:?} to {}", signal, node.id))?;
        }
        tracing::info!("Signalled {:?} to {} nodes", signal, registered.len());
        Ok(())
    }

    /// Waits until every registered node has reported `WorkerEnd`, then
    /// tells the whole cluster to shut down.
    pub async fn shutdown_cluster(&self) -> Result<()> {
        let expected: BTreeSet<NodeId> = self
            .registered
            .lock()
            .await
            .iter()
            .map(|node| node.id.clone())
            .collect();
        let mut ended: BTreeSet<NodeId> = BTreeSet::new();
        let mut receiver = self.worker_ends.lock().await;

        while ended.len() < expected.len() {
            let Some(id) = receiver.recv().await else {
                anyhow::bail!(
                    "Worker end channel closed after {} of {} nodes",
                    ended.len(),
                    expected.len()
                );
            };
            if !expected.contains(&id) {
                tracing::warn!("Ignoring end of unregistered node {}", id);
                continue;
            }
            if ended.insert(id.clone()) {
                tracing::info!("{} ended ({}/{})", id, ended.len(), expected.len());
            }
        }

        self.signal_all(ControlSignal::Shutdown).await
    }

    fn set_phase(&self, phase: AssignmentPhase) {
        let previous = self.phase.send_replace(phase);
        if previous != phase {
            tracing::debug!("Assignment phase {:?} -> {:?}", previous, phase);
        }
    }
}

/// Hands out the shards of each table in order, cycling over `servers`
/// sorted by id and restarting from the first server for every table.
pub fn round_robin(tables: &[TableShape], servers: &[NodeId]) -> Vec<ShardOwner> {
    if servers.is_empty() {
        return Vec::new();
    }
    let mut servers = servers.to_vec();
    servers.sort();

    let mut assignments = Vec::new();
    for table in tables {
        for shard in 0..table.num_shards {
            assignments.push(ShardOwner {
                table_id: table.table_id,
                shard,
                owner: servers[shard % servers.len()].clone(),
            });
        }
    }
    assignments
}

/// Tells the coordinator that `local` finished its work.
pub async fn report_end(
    transport: &dyn Transport,
    coordinator: &NodeId,
    local: &NodeId,
) -> Result<()> {
    let message = ControlMessage {
        signal: ControlSignal::WorkerEnd,
        source: local.clone(),
    };
    transport
        .send_control(coordinator, &message)
        .await
        .context("Failed to report end to the coordinator")
}

/// Registers `node` with the coordinator, retrying with backoff until the
/// coordinator accepts it.
pub async fn register_with_coordinator(
    transport: &dyn Transport,
    coordinator: &NodeInfo,
    node: &NodeInfo,
    initial_backoff: Duration,
) -> Result<()> {
    let mut delay = initial_backoff;
    let mut attempt = 0usize;

    loop {
        attempt += 1;
        match transport.register(coordinator, node).await {
            Ok(true) => {
                tracing::info!("Registered {} with coordinator at {}", node.id, coordinator.addr);
                return Ok(());
            }
            Ok(false) => {
                tracing::debug!("Coordinator declined registration of {} (attempt {})", node.id, attempt);
            }
            Err(e) => {
                if attempt % 10 == 0 {
                    tracing::warn!("Still unable to reach coordinator at {}: {}", coordinator.addr, e);
                } else {
                    tracing::debug!("Registration attempt {} failed: {}", attempt, e);
                }
            }
        }
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(REGISTER_MAX_BACKOFF);
    }
}
