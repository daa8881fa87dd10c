//! Assignment Module Tests
//!
//! ## Test Scopes
//! - **Round robin**: placement order, wrapping, idle servers, per-table restart.
//! - **Protocol**: registration, broadcast and acknowledgement over the in-process transport.
//! - **Lifecycle**: the release barrier, load and shutdown signals.

#[cfg(test)]
mod tests {
    use crate::assignment::coordinator::{
        ShardAssigner, register_with_coordinator, report_end, round_robin,
    };
    use crate::assignment::protocol::ControlSignal;
    use crate::assignment::types::{AssignmentPhase, NodeStage, TableShape};
    use crate::cluster::directory::ClusterDirectory;
    use crate::cluster::types::{NodeId, NodeInfo, NodeRole};
    use crate::server::registry::TableServer;
    use crate::table::descriptor::{ModSharder, Sum, TableDescriptor};
    use crate::table::protocol::ShardOwner;
    use crate::table::typed::TypedTable;
    use crate::transport::Transport;
    use crate::transport::local::LocalNetwork;
    use std::sync::Arc;
    use std::time::Duration;

    fn ids(names: &[&str]) -> Vec<NodeId> {
        names.iter().map(|name| NodeId::from(*name)).collect()
    }

    fn owners_of(assignments: &[ShardOwner], table_id: u32) -> Vec<String> {
        assignments
            .iter()
            .filter(|assigned| assigned.table_id == table_id)
            .map(|assigned| assigned.owner.0.clone())
            .collect()
    }

    struct Node {
        info: NodeInfo,
        server: Arc<TableServer>,
        table: TypedTable<i32, i64>,
    }

    fn spawn_node(network: &Arc<LocalNetwork>, id: NodeId, port: u16, role: NodeRole) -> Node {
        let info = NodeInfo {
            id,
            addr: format!("127.0.0.1:{}", port).parse().unwrap(),
            role,
        };
        let server = TableServer::new(ClusterDirectory::new(info.clone()));
        network.attach(server.clone());
        let table = server.create_table(
            TableDescriptor::<i32, i64>::new(0, 4)
                .with_sharder(ModSharder)
                .with_accumulator(Sum),
            network.transport(),
        );
        Node {
            info,
            server,
            table,
        }
    }

    async fn register(network: &Arc<LocalNetwork>, coordinator: &Node, node: &Node) {
        let transport = network.transport();
        register_with_coordinator(
            transport.as_ref(),
            &coordinator.info,
            &node.info,
            Duration::from_millis(10),
        )
        .await
        .unwrap();
    }

    async fn wait_assigned(node: &Node) {
        tokio::time::timeout(Duration::from_secs(2), node.server.wait_for_assignment())
            .await
            .expect("assignment should reach every node");
    }

    // ============================================================
    // ROUND ROBIN TESTS
    // ============================================================

    #[test]
    fn test_round_robin_alternates_sorted_servers() {
        let tables = [TableShape {
            table_id: 0,
            num_shards: 4,
        }];

        // input order does not matter, servers are sorted by id
        let assignments = round_robin(&tables, &ids(&["b", "a"]));

        assert_eq!(owners_of(&assignments, 0), vec!["a", "b", "a", "b"]);
        let shards: Vec<usize> = assignments.iter().map(|assigned| assigned.shard).collect();
        assert_eq!(shards, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_round_robin_wraps() {
        let tables = [TableShape {
            table_id: 0,
            num_shards: 5,
        }];

        let assignments = round_robin(&tables, &ids(&["a", "b"]));
        assert_eq!(owners_of(&assignments, 0), vec!["a", "b", "a", "b", "a"]);
    }

    #[test]
    fn test_round_robin_more_servers_than_shards() {
        let tables = [TableShape {
            table_id: 0,
            num_shards: 2,
        }];

        let assignments = round_robin(&tables, &ids(&["a", "b", "c"]));
        assert_eq!(owners_of(&assignments, 0), vec!["a", "b"]);
    }

    #[test]
    fn test_round_robin_restarts_per_table() {
        let tables = [
            TableShape {
                table_id: 0,
                num_shards: 3,
            },
            TableShape {
                table_id: 1,
                num_shards: 2,
            },
        ];

        let assignments = round_robin(&tables, &ids(&["a", "b"]));
        assert_eq!(owners_of(&assignments, 0), vec!["a", "b", "a"]);
        assert_eq!(owners_of(&assignments, 1), vec!["a", "b"]);
    }

    #[test]
    fn test_round_robin_without_servers() {
        let tables = [TableShape {
            table_id: 0,
            num_shards: 4,
        }];
        assert!(round_robin(&tables, &[]).is_empty());
    }

    // ============================================================
    // PROTOCOL TESTS
    // ============================================================

    #[tokio::test]
    async fn test_full_assignment_protocol() {
        let network = LocalNetwork::new();
        let coordinator = spawn_node(&network, NodeId::coordinator(), 7000, NodeRole::Coordinator);
        let a = spawn_node(&network, NodeId::from("a"), 7001, NodeRole::TableServer);
        let b = spawn_node(&network, NodeId::from("b"), 7002, NodeRole::TableServer);
        let w = spawn_node(&network, NodeId::from("w"), 7003, NodeRole::Worker);

        let assigner = ShardAssigner::new(coordinator.server.clone(), network.transport(), 3);
        assert_eq!(assigner.phase(), AssignmentPhase::Collecting);

        let run = {
            let assigner = assigner.clone();
            tokio::spawn(async move { assigner.run().await })
        };

        for node in [&a, &b, &w] {
            register(&network, &coordinator, node).await;
        }
        for node in [&coordinator, &a, &b, &w] {
            wait_assigned(node).await;
        }

        let assignment = run.await.unwrap().unwrap();
        assert_eq!(assigner.phase(), AssignmentPhase::Done);
        assert_eq!(owners_of(&assignment.assignments, 0), vec!["a", "b", "a", "b"]);
        assert_eq!(assignment.nodes.len(), 4);

        assert_eq!(a.table.global().local_shards(), vec![0, 2]);
        assert_eq!(b.table.global().local_shards(), vec![1, 3]);
        assert!(w.table.global().local_shards().is_empty());
        assert!(coordinator.table.global().local_shards().is_empty());

        // every node learned every address
        assert_eq!(w.server.directory().len(), 4);

        w.table.update(6, 2).await.unwrap();
        coordinator.table.update(6, 3).await.unwrap();
        assert_eq!(a.table.get(&6).await.unwrap(), Some(5));
    }

    #[tokio::test]
    async fn test_duplicate_registrations_are_ignored() {
        let network = LocalNetwork::new();
        let coordinator = spawn_node(&network, NodeId::coordinator(), 7000, NodeRole::Coordinator);
        let a = spawn_node(&network, NodeId::from("a"), 7001, NodeRole::TableServer);
        let b = spawn_node(&network, NodeId::from("b"), 7002, NodeRole::TableServer);

        let assigner = ShardAssigner::new(coordinator.server.clone(), network.transport(), 2);
        let run = tokio::spawn(async move { assigner.run().await });

        register(&network, &coordinator, &a).await;
        register(&network, &coordinator, &a).await;
        register(&network, &coordinator, &b).await;

        let assignment = tokio::time::timeout(Duration::from_secs(2), run)
            .await
            .expect("assignment should finish")
            .unwrap()
            .unwrap();
        assert_eq!(owners_of(&assignment.assignments, 0), vec!["a", "b", "a", "b"]);
        wait_assigned(&b).await;
        assert_eq!(b.table.global().local_shards(), vec![1, 3]);
    }

    #[tokio::test]
    async fn test_no_table_servers_is_an_error() {
        let network = LocalNetwork::new();
        let coordinator = spawn_node(&network, NodeId::coordinator(), 7000, NodeRole::Coordinator);
        let w = spawn_node(&network, NodeId::from("w"), 7003, NodeRole::Worker);

        let assigner = ShardAssigner::new(coordinator.server.clone(), network.transport(), 1);
        let run = tokio::spawn(async move { assigner.run().await });

        register(&network, &coordinator, &w).await;

        let result = run.await.unwrap();
        assert!(result.is_err());
        assert!(!w.server.is_assigned());
    }

    #[tokio::test]
    async fn test_registration_rejected_when_not_collecting() {
        let network = LocalNetwork::new();
        let coordinator = spawn_node(&network, NodeId::coordinator(), 7000, NodeRole::Coordinator);
        let a = spawn_node(&network, NodeId::from("a"), 7001, NodeRole::TableServer);

        let transport = network.transport();
        let accepted = transport.register(&coordinator.info, &a.info).await.unwrap();
        assert!(!accepted);
    }

    // ============================================================
    // LIFECYCLE TESTS
    // ============================================================

    #[tokio::test]
    async fn test_worker_sorting_first_is_released_after_servers() {
        let network = LocalNetwork::new();
        let coordinator = spawn_node(&network, NodeId::coordinator(), 7000, NodeRole::Coordinator);
        // the worker's id sorts before the table server's
        let w = spawn_node(&network, NodeId::from("a"), 7001, NodeRole::Worker);
        let s = spawn_node(&network, NodeId::from("s"), 7002, NodeRole::TableServer);

        let assigner = ShardAssigner::new(coordinator.server.clone(), network.transport(), 2);
        let run = tokio::spawn(async move { assigner.run().await });

        register(&network, &coordinator, &w).await;
        register(&network, &coordinator, &s).await;

        wait_assigned(&w).await;
        assert!(s.server.is_assigned());
        assert_eq!(s.table.global().local_shards(), vec![0, 1, 2, 3]);

        // routing right after release reaches an owner that installed its shards
        w.table.update(1, 4).await.unwrap();
        assert_eq!(w.table.get(&1).await.unwrap(), Some(4));

        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_nodes_wait_for_release_after_applying() {
        let network = LocalNetwork::new();
        let coordinator = spawn_node(&network, NodeId::coordinator(), 7000, NodeRole::Coordinator);
        let a = spawn_node(&network, NodeId::from("a"), 7001, NodeRole::TableServer);

        // applying alone leaves the node waiting for the coordinator
        a.server.apply_assignment(&Default::default());
        let early =
            tokio::time::timeout(Duration::from_millis(50), a.server.wait_for_assignment()).await;
        assert!(early.is_err());

        let assigner = ShardAssigner::new(coordinator.server.clone(), network.transport(), 1);
        let run = tokio::spawn(async move { assigner.run().await });
        register(&network, &coordinator, &a).await;

        wait_assigned(&a).await;
        run.await.unwrap().unwrap();
        assert_eq!(a.table.global().local_shards(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_load_and_shutdown_signals() {
        let network = LocalNetwork::new();
        let coordinator = spawn_node(&network, NodeId::coordinator(), 7000, NodeRole::Coordinator);
        let a = spawn_node(&network, NodeId::from("a"), 7001, NodeRole::TableServer);
        let w = spawn_node(&network, NodeId::from("w"), 7002, NodeRole::Worker);

        let assigner = ShardAssigner::new(coordinator.server.clone(), network.transport(), 2);
        let run = {
            let assigner = assigner.clone();
            tokio::spawn(async move { assigner.run().await })
        };
        register(&network, &coordinator, &a).await;
        register(&network, &coordinator, &w).await;
        run.await.unwrap().unwrap();

        coordinator.table.put(3, 9).await.unwrap();
        coordinator.table.flush().await.unwrap();
        assigner.signal_all(ControlSignal::LoadComplete).await.unwrap();
        for node in [&coordinator, &a, &w] {
            assert_eq!(node.server.stage(), NodeStage::Loaded);
        }
        assert_eq!(w.table.get(&3).await.unwrap(), Some(9));

        assert!(assigner.signal_all(ControlSignal::WorkerEnd).await.is_err());

        let shutdown = {
            let assigner = assigner.clone();
            tokio::spawn(async move { assigner.shutdown_cluster().await })
        };
        let transport = network.transport();
        report_end(transport.as_ref(), &coordinator.info.id, &w.info.id)
            .await
            .unwrap();
        // an unregistered node does not count towards the shutdown
        report_end(transport.as_ref(), &coordinator.info.id, &NodeId::from("ghost"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(a.server.stage(), NodeStage::Loaded);

        report_end(transport.as_ref(), &coordinator.info.id, &a.info.id)
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(2), shutdown)
            .await
            .expect("every node ended")
            .unwrap()
            .unwrap();
        for node in [&coordinator, &a, &w] {
            assert_eq!(node.server.stage(), NodeStage::Shutdown);
        }
    }
}
