//! Cluster Module Tests
//!
//! ## Test Scopes
//! - **Identities**: uniqueness and ordering of node ids.
//! - **Directory**: member bookkeeping and role filtering.

#[cfg(test)]
mod tests {
    use crate::cluster::directory::ClusterDirectory;
    use crate::cluster::types::{NodeId, NodeInfo, NodeRole};

    fn node(id: &str, port: u16, role: NodeRole) -> NodeInfo {
        NodeInfo {
            id: NodeId::from(id),
            addr: format!("127.0.0.1:{}", port).parse().unwrap(),
            role,
        }
    }

    // ============================================================
    // NODE ID TESTS
    // ============================================================

    #[test]
    fn test_node_id_is_unique() {
        let id1 = NodeId::new();
        let id2 = NodeId::new();

        assert_ne!(id1, id2, "Each NodeId should be unique");
    }

    #[test]
    fn test_coordinator_id_is_stable() {
        assert_eq!(NodeId::coordinator(), NodeId::coordinator());
        assert_eq!(NodeId::coordinator().to_string(), "coordinator");
    }

    #[test]
    fn test_only_table_servers_serve_tables() {
        assert!(NodeRole::TableServer.serves_tables());
        assert!(!NodeRole::Worker.serves_tables());
        assert!(!NodeRole::Coordinator.serves_tables());
    }

    #[test]
    fn test_node_info_json_roundtrip() {
        let info = node("server-a", 7001, NodeRole::TableServer);

        let json = serde_json::to_string(&info).expect("Serialization failed");
        let restored: NodeInfo = serde_json::from_str(&json).expect("Deserialization failed");

        assert_eq!(restored, info);
    }

    // ============================================================
    // DIRECTORY TESTS
    // ============================================================

    #[test]
    fn test_directory_contains_local_node() {
        let local = node("coordinator", 7000, NodeRole::Coordinator);
        let directory = ClusterDirectory::new(local.clone());

        assert_eq!(directory.len(), 1);
        assert_eq!(directory.get_member(&local.id), Some(local));
    }

    #[test]
    fn test_directory_merge_and_filter() {
        let directory = ClusterDirectory::new(node("coordinator", 7000, NodeRole::Coordinator));

        directory.merge(&[
            node("server-b", 7002, NodeRole::TableServer),
            node("worker-1", 7003, NodeRole::Worker),
            node("server-a", 7001, NodeRole::TableServer),
        ]);

        assert_eq!(directory.len(), 4);

        let servers: Vec<NodeId> = directory
            .table_servers()
            .into_iter()
            .map(|node| node.id)
            .collect();
        assert_eq!(servers, vec![NodeId::from("server-a"), NodeId::from("server-b")]);
    }

    #[test]
    fn test_directory_insert_replaces_address() {
        let directory = ClusterDirectory::new(node("coordinator", 7000, NodeRole::Coordinator));

        directory.insert(node("server-a", 7001, NodeRole::TableServer));
        directory.insert(node("server-a", 7101, NodeRole::TableServer));

        let member = directory.get_member(&NodeId::from("server-a")).unwrap();
        assert_eq!(member.addr.port(), 7101);
        assert_eq!(directory.len(), 2);
    }
}
