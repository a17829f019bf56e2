// Connection manager - owns every slot and schedules all traffic
//
// Fan-in point for radio events: it resolves inbound links, drives the
// handshake machines, reassembles and routes received messages, keeps the
// transmitters fed under flow control and handles disconnection including
// the reestablish window. It is the only place that creates or destroys
// connections.

use super::connection::{
    Connection, ConnectionDirection, ConnectionKind, ConnectionState, MeshLinkState,
    TransmitResult,
};
use super::handshake::{
    HandshakeAbort, HandshakeFsm, HandshakeInput, HandshakeOutput, HandshakeResult,
    LocalClusterInfo, PartnerSnapshot,
};
use super::queue::{DeliveryPriority, QueueError};
use crate::ble::{BleError, BleEvent, BleGapAddr, BlePlatform, ConnHandle, HciReason};
use crate::config::MeshConfig;
use crate::proto::conn::{ClusterInfoUpdate, ConnPacket, ConnPacketHeader, MessageType};
use crate::proto::{ClusterSize, NodeId, HOPS_UNKNOWN};
use crate::util::{DsTime, ErrorCode, ErrorLog};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CmError {
    #[error("no free connection slot")]
    NoFreeSlot,

    #[error("another outgoing connection is in flight")]
    AlreadyConnecting,

    #[error("radio rejected the request: {0}")]
    Radio(BleError),
}

/// What the manager reports upward to the node and the module layer
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A mesh link finished its handshake
    HandshakeDone {
        conn_id: u8,
        result: HandshakeResult,
    },
    /// A handshaked mesh link is gone for good
    MeshDisconnected {
        conn_id: u8,
        partner_id: NodeId,
        /// Nodes that were reachable through the lost link
        subtree_size: ClusterSize,
        /// Whether our side held the master bit of the lost link
        had_master_bit: bool,
    },
    /// A handshake attempt failed (timeout or protocol violation)
    HandshakeFailed {
        conn_id: u8,
        partner_id: NodeId,
    },
    /// The GAP connect never completed
    ConnectingTimeout {
        partner_id: NodeId,
    },
    /// A dropped mesh link entered its reestablish window
    ReestablishStarted {
        conn_id: u8,
    },
    /// The link came back without a new handshake
    ReestablishSucceeded {
        conn_id: u8,
    },
    /// A cluster-state delta arrived on a mesh link
    ClusterUpdateReceived {
        conn_id: u8,
        update: ClusterInfoUpdate,
    },
    /// A fully reassembled message addressed to this node (or broadcast);
    /// `from_conn` is None for loopback sends
    MeshMessageReceived {
        from_conn: Option<u8>,
        packet: ConnPacket,
    },
    /// Data arrived on a non-mesh connection
    AppDataReceived {
        conn_id: u8,
        data: Vec<u8>,
    },
}

pub struct ConnectionManager {
    own_id: NodeId,
    own_is_sink: bool,
    /// Handle of our mesh characteristic, told to partners in the handshake
    local_write_handle: u16,
    config: MeshConfig,
    slots: Vec<Option<Connection>>,
    events: Vec<ConnectionEvent>,
    next_conn_id: u8,
    /// Only one GAP connect may be in flight
    pending_outgoing: Option<usize>,
}

impl ConnectionManager {
    pub fn new(own_id: NodeId, own_is_sink: bool, local_write_handle: u16, config: MeshConfig) -> Self {
        let total = config.total_connections();
        let mut slots = Vec::with_capacity(total);
        slots.resize_with(total, || None);
        Self {
            own_id,
            own_is_sink,
            local_write_handle,
            config,
            slots,
            events: Vec::new(),
            next_conn_id: 1,
            pending_outgoing: None,
        }
    }

    pub fn take_events(&mut self) -> Vec<ConnectionEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn local_write_handle(&self) -> u16 {
        self.local_write_handle
    }

    // ------------------------------------------------------------------
    // Slot accounting
    // ------------------------------------------------------------------

    fn count_slots(&self, pred: impl Fn(&Connection) -> bool) -> usize {
        self.slots.iter().flatten().filter(|c| pred(c)).count()
    }

    /// Inbound mesh slots still free; resolvers count as taken because they
    /// may still claim one
    pub fn free_mesh_in_connections(&self) -> u8 {
        let used = self.count_slots(|c| {
            c.direction == ConnectionDirection::In
                && matches!(c.kind, ConnectionKind::Mesh(_) | ConnectionKind::Resolver { .. })
        });
        (self.config.mesh_in_connections as usize).saturating_sub(used) as u8
    }

    pub fn free_mesh_out_connections(&self) -> u8 {
        let used = self.count_slots(|c| {
            c.direction == ConnectionDirection::Out && matches!(c.kind, ConnectionKind::Mesh(_))
        });
        (self.config.mesh_out_connections as usize).saturating_sub(used) as u8
    }

    fn find_free_slot(&self) -> Option<usize> {
        self.slots.iter().position(|s| s.is_none())
    }

    fn slot_by_handle(&self, handle: ConnHandle) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.as_ref().map(|c| c.conn_handle == Some(handle)).unwrap_or(false))
    }

    fn slot_by_address(&self, addr: &BleGapAddr, state: ConnectionState) -> Option<usize> {
        self.slots.iter().position(|s| {
            s.as_ref()
                .map(|c| c.partner_address == *addr && c.state == state)
                .unwrap_or(false)
        })
    }

    pub fn connection(&self, conn_id: u8) -> Option<&Connection> {
        self.slots.iter().flatten().find(|c| c.id == conn_id)
    }

    fn slot_by_conn_id(&self, conn_id: u8) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.as_ref().map(|c| c.id == conn_id).unwrap_or(false))
    }

    pub fn mesh_connections(&self) -> impl Iterator<Item = &Connection> {
        self.slots.iter().flatten().filter(|c| c.is_mesh())
    }

    pub fn handshaked_mesh_connections(&self) -> impl Iterator<Item = &Connection> {
        self.slots.iter().flatten().filter(|c| c.is_handshaked_mesh())
    }

    pub fn connection_to_partner(&self, partner_id: NodeId) -> Option<&Connection> {
        self.slots
            .iter()
            .flatten()
            .find(|c| c.is_handshaked_mesh() && c.partner_id == partner_id)
    }

    /// Total queued packets across all connections
    pub fn pending_packets(&self) -> usize {
        self.slots.iter().flatten().map(|c| c.pending_packets()).sum()
    }

    /// True while any link is connecting, resolving or mid-handshake
    pub fn has_handshake_in_flight(&self) -> bool {
        self.slots.iter().flatten().any(|c| {
            matches!(
                c.state,
                ConnectionState::Connecting | ConnectionState::Handshaking
            ) || matches!(c.kind, ConnectionKind::Resolver { .. })
        })
    }

    /// Smallest hop count toward a sink among live links
    pub fn hops_to_shortest_sink(&self) -> i16 {
        if self.own_is_sink {
            return 0;
        }
        self.handshaked_mesh_connections()
            .filter_map(|c| c.mesh().map(|m| m.hops_to_sink))
            .filter(|h| *h >= 0 && *h < HOPS_UNKNOWN)
            .min()
            .map(|h| h + 1)
            .unwrap_or(HOPS_UNKNOWN)
    }

    fn sink_connection_id(&self, exclude_conn: Option<u8>) -> Option<u8> {
        self.handshaked_mesh_connections()
            .filter(|c| Some(c.id) != exclude_conn)
            .filter_map(|c| c.mesh().map(|m| (c.id, m.hops_to_sink)))
            .filter(|(_, h)| *h >= 0 && *h < HOPS_UNKNOWN)
            .min_by_key(|(_, h)| *h)
            .map(|(id, _)| id)
    }

    /// The link we would sacrifice first: weakest signal, then smallest
    /// subtree behind it
    pub fn worst_mesh_connection(&self) -> Option<u8> {
        self.handshaked_mesh_connections()
            .min_by_key(|c| {
                (
                    c.average_rssi().unwrap_or(0),
                    c.mesh().map(|m| m.connected_subtree_size).unwrap_or(0),
                )
            })
            .map(|c| c.id)
    }

    fn new_connection(
        &mut self,
        direction: ConnectionDirection,
        kind: ConnectionKind,
        addr: BleGapAddr,
    ) -> Connection {
        let id = self.next_conn_id;
        self.next_conn_id = self.next_conn_id.wrapping_add(1).max(1);
        Connection::new(
            id,
            direction,
            kind,
            addr,
            self.config.default_mtu,
            self.config.send_queue_bytes,
            self.config.reassembly_buffer_bytes,
            self.config.unreliable_buffer_count,
            self.config.reliable_buffer_count,
            self.config.write_retry_count,
        )
    }

    // ------------------------------------------------------------------
    // Outgoing connections
    // ------------------------------------------------------------------

    /// Open a mesh connection toward a partner picked by discovery
    pub fn connect_as_master(
        &mut self,
        partner: PartnerSnapshot,
        addr: BleGapAddr,
        partner_write_handle: u16,
        radio: &mut dyn BlePlatform,
    ) -> Result<u8, CmError> {
        if self.pending_outgoing.is_some() {
            return Err(CmError::AlreadyConnecting);
        }
        if self.free_mesh_out_connections() == 0 {
            return Err(CmError::NoFreeSlot);
        }
        let slot = self.find_free_slot().ok_or(CmError::NoFreeSlot)?;

        let mut mesh = MeshLinkState::new();
        mesh.partner_cluster_id = partner.cluster_id;
        mesh.connected_subtree_size = partner.cluster_size;
        mesh.partner_write_handle = partner_write_handle;

        let mut conn = self.new_connection(ConnectionDirection::Out, ConnectionKind::Mesh(mesh), addr);
        conn.partner_id = partner.node_id;
        conn.state = ConnectionState::Connecting;
        let conn_id = conn.id;

        radio
            .connect(addr, self.config.connecting_timeout_ds as u16)
            .map_err(CmError::Radio)?;

        debug!(partner = %partner.node_id, conn = conn_id, "connecting as master");
        self.slots[slot] = Some(conn);
        self.pending_outgoing = Some(slot);
        Ok(conn_id)
    }

    /// Deliberately tear a link down (no reestablishment)
    pub fn disconnect(&mut self, conn_id: u8, radio: &mut dyn BlePlatform) {
        if let Some(idx) = self.slot_by_conn_id(conn_id) {
            let conn = self.slots[idx].as_mut().unwrap();
            conn.reestablish_timeout_sec = 0;
            if let Some(handle) = conn.conn_handle {
                let _ = radio.disconnect(handle, HciReason::LOCAL_HOST_TERMINATED);
            } else {
                self.finalize_slot(idx);
            }
        }
    }

    // ------------------------------------------------------------------
    // Radio events
    // ------------------------------------------------------------------

    pub fn handle_ble_event(
        &mut self,
        event: &BleEvent,
        now_ds: DsTime,
        local: LocalClusterInfo,
        radio: &mut dyn BlePlatform,
        errors: &mut ErrorLog,
    ) {
        match event {
            BleEvent::Connected { conn, addr, role } => {
                self.handle_connected(*conn, *addr, *role, now_ds, local, radio, errors);
            }
            BleEvent::ConnectingTimeout { addr } => {
                self.handle_connecting_timeout(*addr);
            }
            BleEvent::Disconnected { conn, reason } => {
                self.handle_disconnected(*conn, *reason, now_ds, errors);
            }
            BleEvent::WriteRx { conn, data, .. } | BleEvent::NotificationRx { conn, data, .. } => {
                self.handle_data_received(*conn, data, now_ds, local, radio, errors);
            }
            BleEvent::TxComplete { conn, count } => {
                if let Some(idx) = self.slot_by_handle(*conn) {
                    self.slots[idx].as_mut().unwrap().return_credits(*count);
                    self.fill_transmit_buffers(idx, radio, errors);
                }
            }
            BleEvent::MtuChanged { conn, mtu } => {
                if let Some(idx) = self.slot_by_handle(*conn) {
                    self.slots[idx].as_mut().unwrap().mtu = *mtu;
                }
            }
            BleEvent::AdvReport { .. } => {}
        }
    }

    fn handle_connected(
        &mut self,
        handle: ConnHandle,
        addr: BleGapAddr,
        role: crate::ble::ConnRole,
        now_ds: DsTime,
        local: LocalClusterInfo,
        radio: &mut dyn BlePlatform,
        errors: &mut ErrorLog,
    ) {
        // A returning partner within its reestablish window resumes the old
        // link without a handshake
        if let Some(idx) = self.slot_by_address(&addr, ConnectionState::Reestablishing) {
            let reliable = self.config.reliable_buffer_count;
            let unreliable = self.config.unreliable_buffer_count;
            let conn = self.slots[idx].as_mut().unwrap();
            conn.conn_handle = Some(handle);
            conn.state = ConnectionState::HandshakeDone;
            // The radio starts the new link with fresh buffers
            conn.reliable_buffers_free = reliable;
            conn.unreliable_buffers_free = unreliable;
            let conn_id = conn.id;
            if self.pending_outgoing == Some(idx) {
                self.pending_outgoing = None;
            }
            info!(conn = conn_id, "mesh link reestablished");
            errors.push_count(ErrorCode::InfoReestablishSuccess, 0);
            self.events
                .push(ConnectionEvent::ReestablishSucceeded { conn_id });
            return;
        }

        match role {
            crate::ble::ConnRole::Central => {
                let Some(idx) = self.slot_by_address(&addr, ConnectionState::Connecting) else {
                    // We did not ask for this connection
                    let _ = radio.disconnect(handle, HciReason::LOCAL_HOST_TERMINATED);
                    return;
                };
                self.pending_outgoing = None;
                errors.push_count(ErrorCode::CountConnectionSuccess, 0);
                let conn = self.slots[idx].as_mut().unwrap();
                conn.conn_handle = Some(handle);
                conn.state = ConnectionState::Handshaking;
                conn.handshake_started_ds = now_ds;

                let partner = PartnerSnapshot {
                    node_id: conn.partner_id,
                    cluster_id: conn
                        .mesh()
                        .map(|m| m.partner_cluster_id)
                        .unwrap_or(crate::proto::ClusterId::INVALID),
                    cluster_size: conn.mesh().map(|m| m.connected_subtree_size).unwrap_or(1),
                };
                let mut fsm =
                    HandshakeFsm::central(local, partner, self.config.handshake_timeout_ds);
                let outputs = fsm.process(HandshakeInput::Start { now_ds });
                if let Some(mesh) = conn.mesh_mut() {
                    mesh.handshake = Some(Box::new(fsm));
                }
                self.apply_handshake_outputs(idx, outputs, radio, errors);
            }
            crate::ble::ConnRole::Peripheral => {
                let in_used = self.count_slots(|c| c.direction == ConnectionDirection::In);
                let in_capacity = (self.config.mesh_in_connections
                    + self.config.app_in_connections) as usize;
                let free = self.find_free_slot();
                if in_used >= in_capacity || free.is_none() {
                    warn!("inbound connection rejected, no spot");
                    errors.push_error(ErrorCode::WarnCmFailNoSpot, 0, 0);
                    let _ = radio.disconnect(handle, HciReason::LOCAL_HOST_TERMINATED);
                    return;
                }
                let idx = free.unwrap();
                let mut conn = self.new_connection(
                    ConnectionDirection::In,
                    ConnectionKind::Resolver { since_ds: now_ds },
                    addr,
                );
                conn.conn_handle = Some(handle);
                conn.state = ConnectionState::Connected;
                trace!(conn = conn.id, "inbound connection awaiting resolution");
                self.slots[idx] = Some(conn);
            }
        }
    }

    fn handle_connecting_timeout(&mut self, addr: BleGapAddr) {
        if let Some(idx) = self.slot_by_address(&addr, ConnectionState::Connecting) {
            let partner_id = self.slots[idx].as_ref().unwrap().partner_id;
            self.slots[idx] = None;
            if self.pending_outgoing == Some(idx) {
                self.pending_outgoing = None;
            }
            debug!(partner = %partner_id, "gap connect timed out");
            self.events
                .push(ConnectionEvent::ConnectingTimeout { partner_id });
        } else if let Some(idx) = self.slot_by_address(&addr, ConnectionState::Reestablishing) {
            // Reconnect attempt failed; the timer retries until the
            // reestablish window closes
            if self.pending_outgoing == Some(idx) {
                self.pending_outgoing = None;
            }
        }
    }

    fn handle_disconnected(
        &mut self,
        handle: ConnHandle,
        reason: HciReason,
        now_ds: DsTime,
        errors: &mut ErrorLog,
    ) {
        let Some(idx) = self.slot_by_handle(handle) else {
            return;
        };
        let conn = self.slots[idx].as_mut().unwrap();
        conn.disconnected_at_ds = now_ds;
        conn.conn_handle = None;

        let eligible = conn.is_handshaked_mesh()
            && conn.reestablish_timeout_sec > 0
            && reason.is_link_loss();
        if eligible {
            conn.state = ConnectionState::Reestablishing;
            let conn_id = conn.id;
            info!(conn = conn_id, "link lost, trying to reestablish");
            errors.push_count(ErrorCode::InfoTryingReestablish, 0);
            self.events
                .push(ConnectionEvent::ReestablishStarted { conn_id });
        } else {
            self.finalize_slot(idx);
        }
    }

    /// Remove a slot for good, reporting the loss if it was a live mesh link
    fn finalize_slot(&mut self, idx: usize) {
        let Some(conn) = self.slots[idx].take() else {
            return;
        };
        if self.pending_outgoing == Some(idx) {
            self.pending_outgoing = None;
        }
        let was_live_mesh = matches!(
            conn.state,
            ConnectionState::HandshakeDone | ConnectionState::Reestablishing
        ) && conn.is_mesh();
        if was_live_mesh {
            let mesh = conn.mesh().unwrap();
            debug!(conn = conn.id, partner = %conn.partner_id, "mesh link removed");
            self.events.push(ConnectionEvent::MeshDisconnected {
                conn_id: conn.id,
                partner_id: conn.partner_id,
                subtree_size: mesh.connected_subtree_size,
                had_master_bit: mesh.master_bit,
            });
        } else if conn.state == ConnectionState::Handshaking && conn.is_mesh() {
            // The link died mid-handshake; discovery must hear about it
            self.events.push(ConnectionEvent::HandshakeFailed {
                conn_id: conn.id,
                partner_id: conn.partner_id,
            });
        }
    }

    // ------------------------------------------------------------------
    // Receive path
    // ------------------------------------------------------------------

    fn handle_data_received(
        &mut self,
        handle: ConnHandle,
        data: &[u8],
        now_ds: DsTime,
        local: LocalClusterInfo,
        radio: &mut dyn BlePlatform,
        errors: &mut ErrorLog,
    ) {
        let Some(idx) = self.slot_by_handle(handle) else {
            errors.push_count(ErrorCode::CountAccessToRemovedConnection, 0);
            return;
        };

        let conn = self.slots[idx].as_mut().unwrap();
        let result = conn.reassemble(data);
        if result.split_error {
            warn!(conn = conn.id, "fragment missing, dropping partial message");
            errors.push_error(ErrorCode::WarnSplitPacketMissing, 0, 0);
        }
        let Some(message) = result.completed else {
            return;
        };

        if matches!(
            self.slots[idx].as_ref().unwrap().kind,
            ConnectionKind::Resolver { .. }
        ) {
            self.resolve_connection(idx, &message, now_ds, local, radio, errors);
        } else if self.slots[idx].as_ref().unwrap().is_mesh() {
            self.handle_mesh_message(idx, &message, local, radio, errors);
        } else {
            let conn_id = self.slots[idx].as_ref().unwrap().id;
            self.events.push(ConnectionEvent::AppDataReceived {
                conn_id,
                data: message,
            });
        }
    }

    /// First bytes on an inbound link decide what it becomes. The mesh
    /// handshake opener claims it as a mesh link; everything else with a
    /// known discriminator becomes an app link.
    fn resolve_connection(
        &mut self,
        idx: usize,
        data: &[u8],
        now_ds: DsTime,
        local: LocalClusterInfo,
        radio: &mut dyn BlePlatform,
        errors: &mut ErrorLog,
    ) {
        let message_type = data.first().copied().and_then(MessageType::from_u8);
        match message_type {
            Some(MessageType::ClusterWelcome) => {
                let mesh_in_used = self.count_slots(|c| {
                    c.direction == ConnectionDirection::In && c.is_mesh()
                });
                if mesh_in_used >= self.config.mesh_in_connections as usize {
                    warn!("mesh-in pool exhausted, dropping inbound link");
                    errors.push_error(ErrorCode::WarnCmFailNoSpot, 0, 0);
                    self.disconnect_slot(idx, radio);
                    return;
                }
                // One merge at a time: while we are connecting out or
                // another handshake is running, further openers are turned
                // away and will retry
                if self.slots.iter().flatten().any(|c| {
                    matches!(
                        c.state,
                        ConnectionState::Connecting | ConnectionState::Handshaking
                    )
                }) {
                    debug!("merge already in flight, rejecting opener");
                    self.disconnect_slot(idx, radio);
                    return;
                }
                let conn = self.slots[idx].as_mut().unwrap();
                trace!(conn = conn.id, "inbound link resolved to mesh");
                conn.kind = ConnectionKind::Mesh(MeshLinkState::new());
                conn.state = ConnectionState::Handshaking;
                conn.handshake_started_ds = now_ds;
                let mut fsm = HandshakeFsm::peripheral(local, self.config.handshake_timeout_ds);
                let mut outputs = fsm.process(HandshakeInput::Start { now_ds });
                match ConnPacket::decode(data) {
                    Ok(packet) => {
                        conn.partner_id = packet.sender();
                        // The ack goes back to the handle the welcome named
                        if let ConnPacket::ClusterWelcome(welcome) = &packet {
                            if let Some(mesh) = conn.mesh_mut() {
                                mesh.partner_write_handle = welcome.mesh_write_handle;
                            }
                        }
                        outputs.extend(fsm.process(HandshakeInput::Packet(packet)));
                    }
                    Err(_) => {
                        errors.push_count(ErrorCode::CountReceivedInvalidPacket, 0);
                        self.disconnect_slot(idx, radio);
                        return;
                    }
                }
                if let Some(mesh) = self.slots[idx].as_mut().unwrap().mesh_mut() {
                    mesh.handshake = Some(Box::new(fsm));
                }
                self.apply_handshake_outputs(idx, outputs, radio, errors);
            }
            Some(_) => {
                let conn = self.slots[idx].as_mut().unwrap();
                trace!(conn = conn.id, "inbound link resolved to app");
                conn.kind = ConnectionKind::App;
                conn.state = ConnectionState::HandshakeDone;
                let conn_id = conn.id;
                self.events.push(ConnectionEvent::AppDataReceived {
                    conn_id,
                    data: data.to_vec(),
                });
            }
            None => {
                errors.push_count(ErrorCode::CountReceivedInvalidPacket, 0);
                self.disconnect_slot(idx, radio);
            }
        }
    }

    fn handle_mesh_message(
        &mut self,
        idx: usize,
        message: &[u8],
        local: LocalClusterInfo,
        radio: &mut dyn BlePlatform,
        errors: &mut ErrorLog,
    ) {
        let packet = match ConnPacket::decode(message) {
            Ok(packet) => packet,
            Err(err) => {
                trace!(?err, "undecodable mesh message");
                errors.push_count(ErrorCode::CountReceivedInvalidPacket, 0);
                return;
            }
        };

        let conn = self.slots[idx].as_mut().unwrap();
        let conn_id = conn.id;

        if conn.state == ConnectionState::Handshaking {
            // The partner may have merged into our cluster through another
            // link since we captured its beacon; completing now would close
            // a cycle
            let snapshot_stale = matches!(packet, ConnPacket::ClusterAck1(_))
                && conn
                    .mesh()
                    .map(|m| m.partner_cluster_id == local.cluster_id)
                    .unwrap_or(false);
            if snapshot_stale {
                debug!(conn = conn_id, "partner joined us mid-handshake, dropping link");
                let partner_id = conn.partner_id;
                self.events
                    .push(ConnectionEvent::HandshakeFailed { conn_id, partner_id });
                self.disconnect_slot(idx, radio);
                return;
            }
            if let Some(mut fsm) = conn.mesh_mut().and_then(|m| m.handshake.take()) {
                let outputs = fsm.process(HandshakeInput::Packet(packet));
                if let Some(mesh) = self.slots[idx].as_mut().unwrap().mesh_mut() {
                    mesh.handshake = Some(fsm);
                }
                self.apply_handshake_outputs(idx, outputs, radio, errors);
            }
            return;
        }

        match packet {
            // Late handshake retransmits after completion are idempotent
            ConnPacket::ClusterAck1(_) => {
                errors.push_count(ErrorCode::CountHandshakeAck1Duplicate, 0);
            }
            ConnPacket::ClusterAck2(_) => {
                errors.push_count(ErrorCode::CountHandshakeAck2Duplicate, 0);
            }
            ConnPacket::ClusterWelcome(_) => {
                errors.push_count(ErrorCode::CountReceivedInvalidPacket, 0);
            }
            ConnPacket::ClusterInfoUpdate(update) => {
                self.events.push(ConnectionEvent::ClusterUpdateReceived {
                    conn_id,
                    update,
                });
            }
            other => {
                self.route_received(other, conn_id, errors);
            }
        }
    }

    /// Deliver or forward a non-control packet along the tree
    fn route_received(&mut self, packet: ConnPacket, from_conn: u8, errors: &mut ErrorLog) {
        let receiver = packet.receiver();
        let for_us = receiver == self.own_id
            || receiver.is_broadcast()
            || (receiver == NodeId::SHORTEST_SINK && self.own_is_sink);

        if for_us {
            self.events.push(ConnectionEvent::MeshMessageReceived {
                from_conn: Some(from_conn),
                packet: packet.clone(),
            });
        }
        if receiver == self.own_id || (receiver == NodeId::SHORTEST_SINK && self.own_is_sink) {
            return;
        }

        // Forward: broadcast floods the tree, sink traffic climbs the hop
        // gradient, unicast for someone else floods too (tree = one path)
        let raw = packet.encode();
        if receiver == NodeId::SHORTEST_SINK {
            if let Some(target) = self.sink_connection_id(Some(from_conn)) {
                self.enqueue_on(target, &raw, DeliveryPriority::Medium, true, errors);
            }
            return;
        }
        let targets: Vec<u8> = self
            .handshaked_mesh_connections()
            .filter(|c| c.id != from_conn)
            .map(|c| c.id)
            .collect();
        for target in targets {
            self.enqueue_on(target, &raw, DeliveryPriority::Low, false, errors);
        }
    }

    // ------------------------------------------------------------------
    // Handshake plumbing
    // ------------------------------------------------------------------

    fn apply_handshake_outputs(
        &mut self,
        idx: usize,
        outputs: Vec<HandshakeOutput>,
        radio: &mut dyn BlePlatform,
        errors: &mut ErrorLog,
    ) {
        for output in outputs {
            let conn = self.slots[idx].as_mut().unwrap();
            let conn_id = conn.id;
            match output {
                HandshakeOutput::Send(packet) => {
                    let raw = packet.encode();
                    if conn
                        .queue_packet(DeliveryPriority::High, true, &raw)
                        .is_err()
                    {
                        warn!(conn = conn_id, "handshake packet did not fit the queue");
                        errors.push_error(ErrorCode::WarnHandshakeTimeout, 1, 0);
                        self.disconnect_slot(idx, radio);
                        return;
                    }
                    self.fill_transmit_buffers(idx, radio, errors);
                }
                HandshakeOutput::Done(result) => {
                    // A concurrent merge may have produced a second link to
                    // the same partner; the younger one gives way
                    let duplicate = self
                        .slots
                        .iter()
                        .flatten()
                        .any(|c| c.is_handshaked_mesh() && c.partner_id == result.partner_id);
                    if duplicate {
                        debug!(conn = conn_id, partner = %result.partner_id, "duplicate link, dropping");
                        let partner_id = result.partner_id;
                        self.events
                            .push(ConnectionEvent::HandshakeFailed { conn_id, partner_id });
                        self.disconnect_slot(idx, radio);
                        return;
                    }
                    let conn = self.slots[idx].as_mut().unwrap();
                    conn.state = ConnectionState::HandshakeDone;
                    conn.partner_id = result.partner_id;
                    conn.reestablish_timeout_sec = self.config.reestablish_timeout_sec;
                    if let Some(mesh) = conn.mesh_mut() {
                        mesh.master_bit = result.completed_as_winner;
                        mesh.partner_cluster_id = result.merged_cluster_id;
                        mesh.connected_subtree_size = result.partner_subtree_size;
                        mesh.hops_to_sink = result.partner_hops_to_sink;
                        if result.partner_write_handle != 0 {
                            mesh.partner_write_handle = result.partner_write_handle;
                        }
                        mesh.handshake = None;
                    }
                    info!(
                        conn = conn_id,
                        partner = %result.partner_id,
                        winner = result.completed_as_winner,
                        "handshake done"
                    );
                    errors.push_count(ErrorCode::CountHandshakeDone, 0);
                    self.events
                        .push(ConnectionEvent::HandshakeDone { conn_id, result });
                }
                HandshakeOutput::Abort(abort) => {
                    let partner_id = conn.partner_id;
                    match abort {
                        HandshakeAbort::Timeout => {
                            warn!(conn = conn_id, "handshake timed out");
                            errors.push_error(ErrorCode::WarnHandshakeTimeout, 0, 0);
                        }
                        HandshakeAbort::UnexpectedPacket => {
                            warn!(conn = conn_id, "handshake protocol violation");
                            errors.push_count(ErrorCode::CountReceivedInvalidPacket, 0);
                        }
                        HandshakeAbort::SameCluster => {
                            debug!(conn = conn_id, "already clustered with partner, dropping link");
                        }
                    }
                    self.events
                        .push(ConnectionEvent::HandshakeFailed { conn_id, partner_id });
                    self.disconnect_slot(idx, radio);
                    return;
                }
                HandshakeOutput::DuplicateAck1 => {
                    errors.push_count(ErrorCode::CountHandshakeAck1Duplicate, 0);
                }
                HandshakeOutput::DuplicateAck2 => {
                    errors.push_count(ErrorCode::CountHandshakeAck2Duplicate, 0);
                }
            }
        }
    }

    fn disconnect_slot(&mut self, idx: usize, radio: &mut dyn BlePlatform) {
        if let Some(conn) = self.slots[idx].as_mut() {
            conn.reestablish_timeout_sec = 0;
            match conn.conn_handle {
                Some(handle) => {
                    let _ = radio.disconnect(handle, HciReason::LOCAL_HOST_TERMINATED);
                    // Slot is freed when the disconnect event arrives
                }
                None => self.finalize_slot(idx),
            }
        }
    }

    // ------------------------------------------------------------------
    // Send path
    // ------------------------------------------------------------------

    /// Queue an encoded packet toward its header receiver. Returns whether
    /// the message was accepted anywhere (loopback included).
    pub fn send_mesh_message(
        &mut self,
        raw: &[u8],
        priority: DeliveryPriority,
        reliable: bool,
        errors: &mut ErrorLog,
    ) -> bool {
        let Ok(header) = ConnPacketHeader::decode(raw) else {
            return false;
        };
        let receiver = header.receiver;

        // Loopback and local broadcast copy
        if receiver == self.own_id || receiver.is_broadcast() {
            if let Ok(packet) = ConnPacket::decode(raw) {
                self.events.push(ConnectionEvent::MeshMessageReceived {
                    from_conn: None,
                    packet,
                });
            }
            if receiver == self.own_id {
                return true;
            }
        }
        if receiver == NodeId::SHORTEST_SINK {
            if self.own_is_sink {
                if let Ok(packet) = ConnPacket::decode(raw) {
                    self.events.push(ConnectionEvent::MeshMessageReceived {
                        from_conn: None,
                        packet,
                    });
                }
                return true;
            }
            let Some(target) = self.sink_connection_id(None) else {
                return false;
            };
            return self.enqueue_on(target, raw, priority, reliable, errors);
        }

        if let Some(conn) = self.connection_to_partner(receiver) {
            let target = conn.id;
            return self.enqueue_on(target, raw, priority, reliable, errors);
        }

        // Broadcast or a destination beyond our direct partners: flood
        let targets: Vec<u8> = self.handshaked_mesh_connections().map(|c| c.id).collect();
        let mut queued = receiver.is_broadcast();
        for target in targets {
            queued |= self.enqueue_on(target, raw, priority, reliable, errors);
        }
        queued
    }

    fn enqueue_on(
        &mut self,
        conn_id: u8,
        raw: &[u8],
        priority: DeliveryPriority,
        reliable: bool,
        errors: &mut ErrorLog,
    ) -> bool {
        let Some(idx) = self.slot_by_conn_id(conn_id) else {
            return false;
        };
        let conn = self.slots[idx].as_mut().unwrap();
        match conn.queue_packet(priority, reliable, raw) {
            Ok(()) => true,
            Err(QueueError::Full) | Err(QueueError::TooBig(_)) => {
                conn.dropped_packets = conn.dropped_packets.saturating_add(1);
                errors.push_count(ErrorCode::CountDroppedPackets, 0);
                false
            }
        }
    }

    /// Accumulate a cluster delta for every live link except the causing
    /// one. `current_cluster_id` is the id the partners still hold, i.e.
    /// ours from before the change.
    pub fn queue_cluster_update(
        &mut self,
        except_conn: Option<u8>,
        size_change: ClusterSize,
        new_cluster_id: Option<crate::proto::ClusterId>,
        current_cluster_id: crate::proto::ClusterId,
    ) {
        for conn in self.slots.iter_mut().flatten() {
            if !conn.is_handshaked_mesh() || Some(conn.id) == except_conn {
                continue;
            }
            if let Some(mesh) = conn.mesh_mut() {
                mesh.pending_update
                    .merge(size_change, new_cluster_id, current_cluster_id);
            }
        }
    }

    /// A delta arrived over a link: the subtree behind it changed and the
    /// partner reported its new sink distance
    pub fn apply_cluster_delta(&mut self, conn_id: u8, size_change: ClusterSize, partner_hops: i16) {
        if let Some(idx) = self.slot_by_conn_id(conn_id) {
            if let Some(mesh) = self.slots[idx].as_mut().unwrap().mesh_mut() {
                mesh.connected_subtree_size += size_change;
                mesh.hops_to_sink = partner_hops;
            }
        }
    }

    /// Feed an RSSI observation into the live connection to this partner
    pub fn sample_partner_rssi(&mut self, partner_id: NodeId, rssi: i8) {
        if let Some(conn) = self
            .slots
            .iter_mut()
            .flatten()
            .find(|c| c.is_handshaked_mesh() && c.partner_id == partner_id)
        {
            conn.add_rssi_sample(rssi);
        }
    }

    // ------------------------------------------------------------------
    // Timer
    // ------------------------------------------------------------------

    pub fn timer(
        &mut self,
        _passed_ds: u16,
        now_ds: DsTime,
        local: LocalClusterInfo,
        radio: &mut dyn BlePlatform,
        errors: &mut ErrorLog,
    ) {
        // Resolver timeout: nobody claimed the inbound link
        for idx in 0..self.slots.len() {
            let timed_out = matches!(
                self.slots[idx].as_ref().map(|c| &c.kind),
                Some(ConnectionKind::Resolver { since_ds })
                    if now_ds.saturating_sub(*since_ds) >= self.config.resolver_timeout_ds
            );
            if timed_out {
                debug!("resolver timed out, dropping inbound link");
                errors.push_count(ErrorCode::CountAccessToRemovedConnection, 0);
                self.disconnect_slot(idx, radio);
            }
        }

        // Handshake deadlines
        for idx in 0..self.slots.len() {
            let handshaking = self.slots[idx]
                .as_ref()
                .map(|c| c.state == ConnectionState::Handshaking)
                .unwrap_or(false);
            if !handshaking {
                continue;
            }
            if let Some(mut fsm) = self.slots[idx]
                .as_mut()
                .unwrap()
                .mesh_mut()
                .and_then(|m| m.handshake.take())
            {
                let outputs = fsm.process(HandshakeInput::Timer { now_ds });
                if let Some(mesh) = self.slots[idx].as_mut().unwrap().mesh_mut() {
                    mesh.handshake = Some(fsm);
                }
                self.apply_handshake_outputs(idx, outputs, radio, errors);
            }
        }

        // Reestablish windows: retry as central, give up on expiry
        for idx in 0..self.slots.len() {
            let Some(conn) = self.slots[idx].as_ref() else {
                continue;
            };
            if conn.state != ConnectionState::Reestablishing {
                continue;
            }
            let window_ds = conn.reestablish_timeout_sec as u32 * 10;
            if now_ds.saturating_sub(conn.disconnected_at_ds) >= window_ds {
                debug!(conn = conn.id, "reestablish window expired");
                self.finalize_slot(idx);
                continue;
            }
            if conn.direction == ConnectionDirection::Out && self.pending_outgoing.is_none() {
                let addr = conn.partner_address;
                if radio.connect(addr, self.config.connecting_timeout_ds).is_ok() {
                    self.pending_outgoing = Some(idx);
                }
            }
        }

        // Flush accumulated cluster deltas on the vital lane
        for idx in 0..self.slots.len() {
            let Some(conn) = self.slots[idx].as_mut() else {
                continue;
            };
            if !conn.is_handshaked_mesh() {
                continue;
            }
            let partner_id = conn.partner_id;
            let Some(mesh) = conn.mesh_mut() else {
                continue;
            };
            if mesh.pending_update.is_empty() {
                continue;
            }
            let pending = mesh.pending_update;
            let update = ConnPacket::ClusterInfoUpdate(ClusterInfoUpdate {
                sender: self.own_id,
                receiver: partner_id,
                current_cluster_id: pending.current_cluster_id.unwrap_or(local.cluster_id),
                new_cluster_id: pending.new_cluster_id.unwrap_or(local.cluster_id),
                cluster_size_change: pending.size_change,
                hops_to_sink: local.hops_to_sink,
            });
            let raw = update.encode();
            match conn.queue_packet(DeliveryPriority::Vital, true, &raw) {
                Ok(()) => {
                    if let Some(mesh) = conn.mesh_mut() {
                        mesh.pending_update.take();
                    }
                }
                Err(_) => {
                    warn!(conn = conn.id, "vital lane full, delta stays pending");
                    errors.push_error(ErrorCode::WarnVitalPrioQueueFull, 0, 0);
                }
            }
        }

        // Keep the transmitters busy
        for idx in 0..self.slots.len() {
            if self.slots[idx].is_some() {
                self.fill_transmit_buffers(idx, radio, errors);
            }
        }
    }

    fn fill_transmit_buffers(
        &mut self,
        idx: usize,
        radio: &mut dyn BlePlatform,
        errors: &mut ErrorLog,
    ) {
        loop {
            let Some(conn) = self.slots[idx].as_mut() else {
                return;
            };
            match conn.transmit_next(radio) {
                TransmitResult::Sent => continue,
                TransmitResult::Idle | TransmitResult::NoCredits => return,
                TransmitResult::Failed => {
                    warn!(conn = conn.id, "reliable write exhausted its retries");
                    errors.push_error(ErrorCode::WarnGattWriteError, 0, 0);
                    self.disconnect_slot(idx, radio);
                    return;
                }
            }
        }
    }
}
