// Mesh handshake - three messages that merge two clusters
//
// Explicit state machine, no radio in sight. Inputs are timer ticks and
// decoded packets, outputs are packets to send and a final verdict. The
// central opens with CLUSTER_WELCOME, the peripheral answers CLUSTER_ACK_1,
// the central confirms the merged identity with CLUSTER_ACK_2.
//
// Merge rule: the numerically larger cluster id survives and its side keeps
// the master bit; equal ids (which regular discovery never produces) fall
// to the central.

use crate::proto::conn::{ClusterAck1, ClusterAck2, ClusterWelcome, ConnPacket};
use crate::proto::{ClusterId, ClusterSize, HopCount, NodeId};
use crate::util::DsTime;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeRole {
    Central,
    Peripheral,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum HsState {
    Idle,
    /// Central: welcome sent, waiting for ack1
    AwaitAck1,
    /// Peripheral: ack1 sent, waiting for ack2
    AwaitAck2,
    Done,
    Failed,
}

/// What this node contributes to the handshake
#[derive(Clone, Copy, Debug)]
pub struct LocalClusterInfo {
    pub node_id: NodeId,
    pub cluster_id: ClusterId,
    pub cluster_size: ClusterSize,
    pub hops_to_sink: HopCount,
    pub mesh_write_handle: u16,
}

/// The partner's advertised state, known to the central from the beacon
/// that triggered the connection
#[derive(Clone, Copy, Debug)]
pub struct PartnerSnapshot {
    pub node_id: NodeId,
    pub cluster_id: ClusterId,
    pub cluster_size: ClusterSize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HandshakeResult {
    /// Our side kept its cluster id and with it the master bit
    pub completed_as_winner: bool,
    pub merged_cluster_id: ClusterId,
    pub merged_cluster_size: ClusterSize,
    pub partner_id: NodeId,
    /// Nodes reachable through this link right after the merge
    pub partner_subtree_size: ClusterSize,
    pub partner_hops_to_sink: HopCount,
    pub partner_write_handle: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeAbort {
    Timeout,
    UnexpectedPacket,
    /// Both ends already share a cluster id; a link would close a cycle
    SameCluster,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandshakeOutput {
    Send(ConnPacket),
    Done(HandshakeResult),
    Abort(HandshakeAbort),
    DuplicateAck1,
    DuplicateAck2,
}

pub enum HandshakeInput {
    Start { now_ds: DsTime },
    Timer { now_ds: DsTime },
    Packet(ConnPacket),
}

#[derive(Debug)]
pub struct HandshakeFsm {
    role: HandshakeRole,
    state: HsState,
    local: LocalClusterInfo,
    /// Filled at start for the central, from the welcome for the peripheral
    partner: Option<PartnerSnapshot>,
    partner_hops: HopCount,
    partner_write_handle: u16,
    deadline_ds: DsTime,
    timeout_ds: u32,
    result: Option<HandshakeResult>,
}

impl HandshakeFsm {
    pub fn central(local: LocalClusterInfo, partner: PartnerSnapshot, timeout_ds: u32) -> Self {
        Self {
            role: HandshakeRole::Central,
            state: HsState::Idle,
            local,
            partner: Some(partner),
            partner_hops: 0,
            partner_write_handle: 0,
            deadline_ds: 0,
            timeout_ds,
            result: None,
        }
    }

    pub fn peripheral(local: LocalClusterInfo, timeout_ds: u32) -> Self {
        Self {
            role: HandshakeRole::Peripheral,
            state: HsState::Idle,
            local,
            partner: None,
            partner_hops: 0,
            partner_write_handle: 0,
            deadline_ds: 0,
            timeout_ds,
            result: None,
        }
    }

    pub fn role(&self) -> HandshakeRole {
        self.role
    }

    pub fn is_done(&self) -> bool {
        self.state == HsState::Done
    }

    pub fn result(&self) -> Option<&HandshakeResult> {
        self.result.as_ref()
    }

    /// Winner side of a merge between two cluster ids, seen from `ours`
    fn we_win(ours: ClusterId, theirs: ClusterId, we_are_central: bool) -> bool {
        if ours == theirs {
            we_are_central
        } else {
            ours > theirs
        }
    }

    pub fn process(&mut self, input: HandshakeInput) -> Vec<HandshakeOutput> {
        match input {
            HandshakeInput::Start { now_ds } => self.handle_start(now_ds),
            HandshakeInput::Timer { now_ds } => self.handle_timer(now_ds),
            HandshakeInput::Packet(packet) => self.handle_packet(packet),
        }
    }

    fn handle_start(&mut self, now_ds: DsTime) -> Vec<HandshakeOutput> {
        self.deadline_ds = now_ds.saturating_add(self.timeout_ds);
        match self.role {
            HandshakeRole::Central => {
                self.state = HsState::AwaitAck1;
                let partner = self.partner.expect("central always has a snapshot");
                vec![HandshakeOutput::Send(ConnPacket::ClusterWelcome(
                    ClusterWelcome {
                        sender: self.local.node_id,
                        receiver: partner.node_id,
                        cluster_id: self.local.cluster_id,
                        cluster_size: self.local.cluster_size,
                        mesh_write_handle: self.local.mesh_write_handle,
                        hops_to_sink: self.local.hops_to_sink,
                    },
                ))]
            }
            HandshakeRole::Peripheral => {
                // Waits for the welcome; only the deadline is armed
                vec![]
            }
        }
    }

    fn handle_timer(&mut self, now_ds: DsTime) -> Vec<HandshakeOutput> {
        if matches!(self.state, HsState::Done | HsState::Failed) {
            return vec![];
        }
        if now_ds >= self.deadline_ds {
            self.state = HsState::Failed;
            return vec![HandshakeOutput::Abort(HandshakeAbort::Timeout)];
        }
        vec![]
    }

    fn handle_packet(&mut self, packet: ConnPacket) -> Vec<HandshakeOutput> {
        match (self.role, packet) {
            (HandshakeRole::Peripheral, ConnPacket::ClusterWelcome(welcome)) => {
                self.handle_welcome(welcome)
            }
            (HandshakeRole::Central, ConnPacket::ClusterAck1(ack1)) => self.handle_ack1(ack1),
            (HandshakeRole::Peripheral, ConnPacket::ClusterAck2(ack2)) => self.handle_ack2(ack2),
            _ => {
                self.state = HsState::Failed;
                vec![HandshakeOutput::Abort(HandshakeAbort::UnexpectedPacket)]
            }
        }
    }

    fn handle_welcome(&mut self, welcome: ClusterWelcome) -> Vec<HandshakeOutput> {
        match self.state {
            HsState::Idle | HsState::AwaitAck2 => {}
            _ => {
                self.state = HsState::Failed;
                return vec![HandshakeOutput::Abort(HandshakeAbort::UnexpectedPacket)];
            }
        }
        // The central joined our cluster through another link while this
        // connect was in flight; the tree must not gain a second path
        if welcome.cluster_id == self.local.cluster_id {
            self.state = HsState::Failed;
            return vec![HandshakeOutput::Abort(HandshakeAbort::SameCluster)];
        }
        // A repeated welcome just re-triggers the ack; state is unchanged
        self.partner = Some(PartnerSnapshot {
            node_id: welcome.sender,
            cluster_id: welcome.cluster_id,
            cluster_size: welcome.cluster_size,
        });
        self.partner_hops = welcome.hops_to_sink;
        self.partner_write_handle = welcome.mesh_write_handle;
        self.state = HsState::AwaitAck2;
        vec![HandshakeOutput::Send(ConnPacket::ClusterAck1(ClusterAck1 {
            sender: self.local.node_id,
            receiver: welcome.sender,
            hops_to_sink: self.local.hops_to_sink,
        }))]
    }

    fn handle_ack1(&mut self, ack1: ClusterAck1) -> Vec<HandshakeOutput> {
        match self.state {
            HsState::AwaitAck1 => {}
            HsState::Done => return vec![HandshakeOutput::DuplicateAck1],
            _ => {
                self.state = HsState::Failed;
                return vec![HandshakeOutput::Abort(HandshakeAbort::UnexpectedPacket)];
            }
        }
        let partner = self.partner.expect("central always has a snapshot");
        let winner = Self::we_win(self.local.cluster_id, partner.cluster_id, true);
        let merged_cluster_id = if winner {
            self.local.cluster_id
        } else {
            partner.cluster_id
        };
        let merged_cluster_size = self.local.cluster_size + partner.cluster_size;
        self.partner_hops = ack1.hops_to_sink;

        let result = HandshakeResult {
            completed_as_winner: winner,
            merged_cluster_id,
            merged_cluster_size,
            partner_id: partner.node_id,
            partner_subtree_size: partner.cluster_size,
            partner_hops_to_sink: ack1.hops_to_sink,
            partner_write_handle: self.partner_write_handle,
        };
        self.result = Some(result);
        self.state = HsState::Done;
        vec![
            HandshakeOutput::Send(ConnPacket::ClusterAck2(ClusterAck2 {
                sender: self.local.node_id,
                receiver: partner.node_id,
                cluster_id: merged_cluster_id,
                cluster_size: merged_cluster_size,
            })),
            HandshakeOutput::Done(result),
        ]
    }

    fn handle_ack2(&mut self, ack2: ClusterAck2) -> Vec<HandshakeOutput> {
        match self.state {
            HsState::AwaitAck2 => {}
            HsState::Done => return vec![HandshakeOutput::DuplicateAck2],
            _ => {
                self.state = HsState::Failed;
                return vec![HandshakeOutput::Abort(HandshakeAbort::UnexpectedPacket)];
            }
        }
        let partner = self.partner.expect("welcome arrived before ack2");
        let winner = ack2.cluster_id == self.local.cluster_id
            && !Self::we_win(partner.cluster_id, self.local.cluster_id, true);
        let result = HandshakeResult {
            completed_as_winner: winner,
            merged_cluster_id: ack2.cluster_id,
            merged_cluster_size: ack2.cluster_size,
            partner_id: partner.node_id,
            partner_subtree_size: ack2.cluster_size - self.local.cluster_size,
            partner_hops_to_sink: self.partner_hops,
            partner_write_handle: self.partner_write_handle,
        };
        self.result = Some(result);
        self.state = HsState::Done;
        vec![HandshakeOutput::Done(result)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(node: u16, cluster: ClusterId, size: ClusterSize) -> LocalClusterInfo {
        LocalClusterInfo {
            node_id: NodeId(node),
            cluster_id: cluster,
            cluster_size: size,
            hops_to_sink: crate::proto::HOPS_UNKNOWN,
            mesh_write_handle: 0x12,
        }
    }

    /// Drive both ends against each other and return their results
    fn run_full_handshake(
        central: &mut HandshakeFsm,
        peripheral: &mut HandshakeFsm,
    ) -> (HandshakeResult, HandshakeResult) {
        peripheral.process(HandshakeInput::Start { now_ds: 0 });
        let mut central_result = None;
        let mut peripheral_result = None;
        let mut to_peripheral: Vec<ConnPacket> = Vec::new();
        let mut to_central: Vec<ConnPacket> = Vec::new();

        for output in central.process(HandshakeInput::Start { now_ds: 0 }) {
            if let HandshakeOutput::Send(p) = output {
                to_peripheral.push(p);
            }
        }
        while !(to_peripheral.is_empty() && to_central.is_empty()) {
            for packet in std::mem::take(&mut to_peripheral) {
                for output in peripheral.process(HandshakeInput::Packet(packet)) {
                    match output {
                        HandshakeOutput::Send(p) => to_central.push(p),
                        HandshakeOutput::Done(r) => peripheral_result = Some(r),
                        other => panic!("unexpected peripheral output {:?}", other),
                    }
                }
            }
            for packet in std::mem::take(&mut to_central) {
                for output in central.process(HandshakeInput::Packet(packet)) {
                    match output {
                        HandshakeOutput::Send(p) => to_peripheral.push(p),
                        HandshakeOutput::Done(r) => central_result = Some(r),
                        other => panic!("unexpected central output {:?}", other),
                    }
                }
            }
        }
        (central_result.unwrap(), peripheral_result.unwrap())
    }

    #[test]
    fn test_two_solo_nodes_merge_to_larger_id() {
        let id1 = ClusterId::from_parts(NodeId(1), 1);
        let id2 = ClusterId::from_parts(NodeId(2), 1);
        // Node 1 connects as central to node 2
        let mut central = HandshakeFsm::central(
            local(1, id1, 1),
            PartnerSnapshot {
                node_id: NodeId(2),
                cluster_id: id2,
                cluster_size: 1,
            },
            60,
        );
        let mut peripheral = HandshakeFsm::peripheral(local(2, id2, 1), 60);

        let (c, p) = run_full_handshake(&mut central, &mut peripheral);

        assert_eq!(c.merged_cluster_id, id2);
        assert_eq!(p.merged_cluster_id, id2);
        assert_eq!(c.merged_cluster_size, 2);
        assert_eq!(p.merged_cluster_size, 2);
        // Node 2's id survived, so node 2 holds the master bit
        assert!(!c.completed_as_winner);
        assert!(p.completed_as_winner);
        assert_eq!(c.partner_subtree_size, 1);
        assert_eq!(p.partner_subtree_size, 1);
    }

    #[test]
    fn test_exactly_one_winner_regardless_of_direction() {
        let big = ClusterId::from_parts(NodeId(9), 3);
        let small = ClusterId::from_parts(NodeId(4), 2);

        // Big cluster connects outward
        let mut central = HandshakeFsm::central(
            local(9, big, 5),
            PartnerSnapshot {
                node_id: NodeId(4),
                cluster_id: small,
                cluster_size: 2,
            },
            60,
        );
        let mut peripheral = HandshakeFsm::peripheral(local(4, small, 2), 60);
        let (c, p) = run_full_handshake(&mut central, &mut peripheral);
        assert!(c.completed_as_winner && !p.completed_as_winner);
        assert_eq!(c.merged_cluster_size, 7);

        // Small cluster connects outward; winner side flips with it
        let mut central = HandshakeFsm::central(
            local(4, small, 2),
            PartnerSnapshot {
                node_id: NodeId(9),
                cluster_id: big,
                cluster_size: 5,
            },
            60,
        );
        let mut peripheral = HandshakeFsm::peripheral(local(9, big, 5), 60);
        let (c, p) = run_full_handshake(&mut central, &mut peripheral);
        assert!(!c.completed_as_winner && p.completed_as_winner);
        assert_eq!(p.merged_cluster_id, big);
    }

    #[test]
    fn test_duplicate_ack1_is_idempotent() {
        let id1 = ClusterId::from_parts(NodeId(1), 1);
        let id2 = ClusterId::from_parts(NodeId(2), 1);
        let mut central = HandshakeFsm::central(
            local(1, id1, 1),
            PartnerSnapshot {
                node_id: NodeId(2),
                cluster_id: id2,
                cluster_size: 1,
            },
            60,
        );
        central.process(HandshakeInput::Start { now_ds: 0 });
        let ack1 = ConnPacket::ClusterAck1(ClusterAck1 {
            sender: NodeId(2),
            receiver: NodeId(1),
            hops_to_sink: HOPS_UNKNOWN_TEST,
        });
        let first = central.process(HandshakeInput::Packet(ack1.clone()));
        assert!(matches!(first.last(), Some(HandshakeOutput::Done(_))));
        let result_after_first = *central.result().unwrap();

        let second = central.process(HandshakeInput::Packet(ack1));
        assert_eq!(second, vec![HandshakeOutput::DuplicateAck1]);
        assert_eq!(*central.result().unwrap(), result_after_first);
    }

    const HOPS_UNKNOWN_TEST: HopCount = crate::proto::HOPS_UNKNOWN;

    #[test]
    fn test_duplicate_ack2_is_idempotent() {
        let id1 = ClusterId::from_parts(NodeId(1), 1);
        let id2 = ClusterId::from_parts(NodeId(2), 1);
        let mut peripheral = HandshakeFsm::peripheral(local(2, id2, 1), 60);
        peripheral.process(HandshakeInput::Start { now_ds: 0 });
        peripheral.process(HandshakeInput::Packet(ConnPacket::ClusterWelcome(
            ClusterWelcome {
                sender: NodeId(1),
                receiver: NodeId(2),
                cluster_id: id1,
                cluster_size: 1,
                mesh_write_handle: 0x12,
                hops_to_sink: HOPS_UNKNOWN_TEST,
            },
        )));
        let ack2 = ConnPacket::ClusterAck2(ClusterAck2 {
            sender: NodeId(1),
            receiver: NodeId(2),
            cluster_id: id2,
            cluster_size: 2,
        });
        let first = peripheral.process(HandshakeInput::Packet(ack2.clone()));
        assert!(matches!(first.last(), Some(HandshakeOutput::Done(_))));
        let result_after_first = *peripheral.result().unwrap();

        let second = peripheral.process(HandshakeInput::Packet(ack2));
        assert_eq!(second, vec![HandshakeOutput::DuplicateAck2]);
        assert_eq!(*peripheral.result().unwrap(), result_after_first);
    }

    #[test]
    fn test_repeated_welcome_retriggers_ack1() {
        let id1 = ClusterId::from_parts(NodeId(1), 1);
        let id2 = ClusterId::from_parts(NodeId(2), 1);
        let mut peripheral = HandshakeFsm::peripheral(local(2, id2, 1), 60);
        peripheral.process(HandshakeInput::Start { now_ds: 0 });
        let welcome = ConnPacket::ClusterWelcome(ClusterWelcome {
            sender: NodeId(1),
            receiver: NodeId(2),
            cluster_id: id1,
            cluster_size: 1,
            mesh_write_handle: 0x12,
            hops_to_sink: HOPS_UNKNOWN_TEST,
        });
        let first = peripheral.process(HandshakeInput::Packet(welcome.clone()));
        let second = peripheral.process(HandshakeInput::Packet(welcome));
        assert_eq!(first, second);
    }

    #[test]
    fn test_timeout_aborts() {
        let id1 = ClusterId::from_parts(NodeId(1), 1);
        let mut central = HandshakeFsm::central(
            local(1, id1, 1),
            PartnerSnapshot {
                node_id: NodeId(2),
                cluster_id: ClusterId::from_parts(NodeId(2), 1),
                cluster_size: 1,
            },
            60,
        );
        central.process(HandshakeInput::Start { now_ds: 100 });
        assert!(central.process(HandshakeInput::Timer { now_ds: 159 }).is_empty());
        assert_eq!(
            central.process(HandshakeInput::Timer { now_ds: 160 }),
            vec![HandshakeOutput::Abort(HandshakeAbort::Timeout)]
        );
        // Once failed the machine stays quiet
        assert!(central.process(HandshakeInput::Timer { now_ds: 200 }).is_empty());
    }

    #[test]
    fn test_unexpected_packet_aborts() {
        let id2 = ClusterId::from_parts(NodeId(2), 1);
        let mut peripheral = HandshakeFsm::peripheral(local(2, id2, 1), 60);
        peripheral.process(HandshakeInput::Start { now_ds: 0 });
        // ACK2 before any welcome is a protocol violation
        let outputs = peripheral.process(HandshakeInput::Packet(ConnPacket::ClusterAck2(
            ClusterAck2 {
                sender: NodeId(1),
                receiver: NodeId(2),
                cluster_id: id2,
                cluster_size: 2,
            },
        )));
        assert_eq!(
            outputs,
            vec![HandshakeOutput::Abort(HandshakeAbort::UnexpectedPacket)]
        );
    }
}
