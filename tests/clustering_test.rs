// Clustering scenarios - from two solo nodes to a ten-node tree

mod common;

use blemesh::node::DiscoveryState;
use blemesh::proto::NodeId;
use blemesh::util::ErrorCode;
use common::TestMesh;

#[test]
fn test_two_nodes_form_cluster_within_ten_seconds() {
    let mut mesh = TestMesh::new(2);

    assert!(mesh.run_until(100, |m| m.clustered()), "no cluster after 10 s");

    // The founding id of the higher node survives the merge
    let expected = (2u32 << 16) | 1;
    assert_eq!(mesh.nodes[0].node().cluster_id().raw(), expected);
    assert_eq!(mesh.nodes[1].node().cluster_id().raw(), expected);
    assert_eq!(mesh.nodes[0].node().cluster_size(), 2);
    assert_eq!(mesh.nodes[1].node().cluster_size(), 2);

    mesh.assert_master_bits_consistent();
    assert_eq!(mesh.fabric.link_count(), 1);
}

#[test]
fn test_ten_nodes_converge_to_one_cluster() {
    let mut mesh = TestMesh::new(10);

    assert!(mesh.run_until(600, |m| m.clustered()), "no cluster after 60 s");

    let first = mesh.nodes[0].node().cluster_id();
    for node in &mesh.nodes {
        assert_eq!(node.node().cluster_id(), first);
        assert_eq!(node.node().cluster_size(), 10);
    }

    // A tree over ten nodes has exactly nine links
    assert_eq!(mesh.fabric.link_count(), 9);
    mesh.assert_master_bits_consistent();

    // Sizes agree across every live link after propagation settled
    mesh.run(50);
    for node in &mesh.nodes {
        assert_eq!(node.node().cluster_size(), 10);
    }
}

#[test]
fn test_handshake_counted_once_per_link() {
    let mut mesh = TestMesh::new(2);
    assert!(mesh.run_until(100, |m| m.clustered()));
    mesh.run(20);

    for node in &mesh.nodes {
        assert_eq!(node.error_log().counter(ErrorCode::CountHandshakeDone), 1);
    }
}

#[test]
fn test_neighbor_ring_stays_bounded_and_fresh() {
    let mut mesh = TestMesh::new(10);
    mesh.run(300);

    for node in &mesh.nodes {
        let ring = node.node().neighbors();
        assert!(ring.len() <= blemesh::node::JOIN_ME_BUFFER_SLOTS);
        let now = node.app_timer_ds();
        for entry in ring.iter() {
            assert!(entry.age_ds(now) <= ring.max_age_ds());
        }
    }
}

#[test]
fn test_different_networks_never_mesh() {
    use blemesh::proto::NetworkId;
    use blemesh::storage::NodeIdentity;
    use blemesh::MeshConfig;

    let identities = vec![
        NodeIdentity::new(NodeId(1), NetworkId(10)),
        NodeIdentity::new(NodeId(2), NetworkId(11)),
    ];
    let mut mesh = TestMesh::with_identities(identities, MeshConfig::default());
    mesh.run(200);

    assert_eq!(mesh.fabric.link_count(), 0);
    assert_eq!(mesh.nodes[0].node().cluster_size(), 1);
    assert_eq!(mesh.nodes[1].node().cluster_size(), 1);
}

#[test]
fn test_lonely_node_drops_to_low_duty() {
    let mut mesh = TestMesh::new(1);
    // Enough decisions with an empty neighbor ring pass the threshold
    mesh.run(100);
    assert_eq!(mesh.nodes[0].node().state(), DiscoveryState::DiscoveryLow);
}

#[test]
fn test_saturated_node_sacrifices_worst_link_for_newcomer() {
    use blemesh::proto::NetworkId;
    use blemesh::storage::NodeIdentity;
    use blemesh::MeshConfig;

    // Node 1 has a single outbound slot and nothing inbound, so its link
    // to node 2 saturates it completely
    let boards = vec![
        (
            NodeIdentity::new(NodeId(1), NetworkId(10)),
            MeshConfig::default().with_mesh_connections(0, 1),
        ),
        (
            NodeIdentity::new(NodeId(2), NetworkId(10)),
            MeshConfig::default().with_mesh_connections(1, 0),
        ),
        (
            NodeIdentity::new(NodeId(3), NetworkId(10)),
            MeshConfig::default().with_mesh_connections(1, 1),
        ),
    ];
    let mut mesh = TestMesh::with_boards(boards);

    // Keep node 3 off the air until 1 and 2 have saturated each other
    mesh.fabric.set_unreachable(2, true);
    let paired = mesh.run_until(200, |m| {
        m.nodes[0].node().cluster_size() == 2 && m.nodes[1].node().cluster_size() == 2
    });
    assert!(paired, "initial pair never formed");

    // Node 3 appears with free slots neither side can take; one of the
    // saturated pair must give up the 1-2 link to reach it
    mesh.fabric.set_unreachable(2, false);
    let freed = mesh.run_until(600, |m| {
        m.nodes[..2].iter().any(|n| {
            n.error_log()
                .counter(ErrorCode::InfoEmergencyDisconnectSuccessful)
                >= 1
        })
    });
    assert!(freed, "no saturated node ever sacrificed a link");

    // With the slot free again the three of them can still become one mesh
    assert!(mesh.run_until(900, |m| m.clustered()), "mesh never healed");
}
