// Shared harness - a little mesh on the loopback fabric
//
// Builds N nodes wired to one fabric and steps radio + timers together,
// one decisecond per tick.

use blemesh::ble::loopback::LoopbackFabric;
use blemesh::ble::BleGapAddr;
use blemesh::proto::{NetworkId, NodeId};
use blemesh::storage::{MemoryRecordStore, NodeIdentity};
use blemesh::{BoardConfig, MeshConfig, MeshNode};

pub const TEST_NETWORK: NetworkId = NetworkId(10);

pub struct TestMesh {
    pub fabric: LoopbackFabric,
    pub nodes: Vec<MeshNode>,
}

#[allow(dead_code)]
impl TestMesh {
    pub fn new(count: u16) -> Self {
        let identities = (1..=count)
            .map(|id| NodeIdentity::new(NodeId(id), TEST_NETWORK))
            .collect();
        Self::with_identities(identities, MeshConfig::default())
    }

    pub fn with_config(count: u16, config: MeshConfig) -> Self {
        let identities = (1..=count)
            .map(|id| NodeIdentity::new(NodeId(id), TEST_NETWORK))
            .collect();
        Self::with_identities(identities, config)
    }

    pub fn with_identities(identities: Vec<NodeIdentity>, config: MeshConfig) -> Self {
        let boards = identities
            .into_iter()
            .map(|identity| (identity, config.clone()))
            .collect();
        Self::with_boards(boards)
    }

    /// Heterogeneous setups: every node brings its own configuration
    pub fn with_boards(boards: Vec<(NodeIdentity, MeshConfig)>) -> Self {
        let fabric = LoopbackFabric::new();
        if let Some((_, config)) = boards.first() {
            fabric.set_default_mtu(config.default_mtu);
        }
        let nodes = boards
            .into_iter()
            .enumerate()
            .map(|(index, (identity, config))| {
                let addr = BleGapAddr::new([identity.node_id.raw() as u8, 0, 0, 0, 0, 1]);
                let radio = fabric.endpoint(addr);
                let board = BoardConfig {
                    identity,
                    mesh: config,
                    seed: 42 + index as u64,
                };
                MeshNode::init(board, Box::new(MemoryRecordStore::new()), Box::new(radio))
                    .expect("node init failed")
            })
            .collect();
        Self { fabric, nodes }
    }

    /// One decisecond of fabric and node time
    pub fn tick(&mut self) {
        self.fabric.tick(1);
        for (index, node) in self.nodes.iter_mut().enumerate() {
            while let Some(event) = self.fabric.take_event(index) {
                node.ble_event(event);
            }
            node.timer_event(1);
        }
    }

    pub fn run(&mut self, ticks: u32) {
        for _ in 0..ticks {
            self.tick();
        }
    }

    /// Tick until the predicate holds; returns whether it ever did
    pub fn run_until(&mut self, max_ticks: u32, pred: impl Fn(&TestMesh) -> bool) -> bool {
        for _ in 0..max_ticks {
            if pred(self) {
                return true;
            }
            self.tick();
        }
        pred(self)
    }

    /// All nodes share one cluster id and report the full size
    pub fn clustered(&self) -> bool {
        let expected = self.nodes.len() as i16;
        let first = self.nodes[0].node().cluster_id();
        self.nodes
            .iter()
            .all(|n| n.node().cluster_id() == first && n.node().cluster_size() == expected)
    }

    /// Exactly one end of every mesh link holds the master bit
    pub fn assert_master_bits_consistent(&self) {
        for node in &self.nodes {
            for conn in node.connections().mesh_connections() {
                if !conn.handshake_done() {
                    continue;
                }
                let partner = &self.nodes[(conn.partner_id.raw() - 1) as usize];
                let back = partner
                    .connections()
                    .connection_to_partner(node.node().node_id())
                    .unwrap_or_else(|| {
                        panic!(
                            "partner {} has no link back to {}",
                            conn.partner_id,
                            node.node().node_id()
                        )
                    });
                let bits =
                    conn.mesh().unwrap().master_bit as u8 + back.mesh().unwrap().master_bit as u8;
                assert_eq!(
                    bits,
                    1,
                    "master bit not unique on link {} <-> {}",
                    node.node().node_id(),
                    conn.partner_id
                );
            }
        }
    }
}
