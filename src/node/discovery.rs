// Node - the discovery and clustering state machine
//
// Decides when to advertise, when to scan, whom to connect to and how two
// clusters become one. Reads the neighbor ring filled from JOIN_ME beacons,
// scores candidates for the master and slave roles and hands chosen
// partners to the connection manager. Merges, partitions and size changes
// fan out as cluster deltas over the remaining links.

use super::neighbors::{NeighborEntry, NeighborRing};
use crate::advertising::{AdvJob, AdvJobHandle, AdvertisingController};
use crate::ble::{AdvType, BleGapAddr, BlePlatform};
use crate::config::MeshConfig;
use crate::conn::{
    ConnectionEvent, ConnectionManager, LocalClusterInfo, PartnerSnapshot,
};
use crate::proto::adv::{self, JoinMePayload, MeshAdvPacket};
use crate::proto::{ClusterId, ClusterSize, NodeId};
use crate::scanning::{ScanController, ScanJob, ScanJobHandle, ScanUse};
use crate::storage::NodeIdentity;
use crate::util::battery::BATTERY_RUNTIME_INFINITE;
use crate::util::{DsTime, ErrorCode, ErrorLog};
use tracing::{debug, info, warn};

/// Discovery states of the node
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiscoveryState {
    Bootup,
    /// Aggressive advertise and scan to find partners fast
    DiscoveryHigh,
    /// Reduced duty after repeated empty decisions
    DiscoveryLow,
    /// Idle; only serves already-connected neighbors
    DiscoveryOff,
    /// A connect or handshake we initiated is in flight
    Handshake,
    /// A dropped mesh link is being reopened
    Reestablishing,
}

/// Outcome of one partner-selection round
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecisionResult {
    ConnectAsMaster(NodeId),
    ConnectAsSlave(NodeId),
    NoNodesFound,
}

struct EmergencyCandidate {
    node: NodeId,
    sightings: u8,
}

pub struct Node {
    identity: NodeIdentity,
    config: MeshConfig,
    restart_counter: u16,

    cluster_id: ClusterId,
    cluster_size: ClusterSize,

    state: DiscoveryState,
    neighbors: NeighborRing,
    /// Cluster id we acknowledge while waiting as slave
    current_ack_id: ClusterId,
    last_decision_ds: DsTime,
    no_nodes_found_counter: u8,
    connection_loss_counter: u16,
    battery_runtime_minutes: Option<u32>,

    blacklist: Vec<(NodeId, DsTime)>,
    emergency: Option<EmergencyCandidate>,

    adv_job: Option<AdvJobHandle>,
    scan_job: Option<ScanJobHandle>,
}

impl Node {
    pub fn new(identity: NodeIdentity, restart_counter: u16, config: MeshConfig) -> Self {
        let cluster_id = ClusterId::from_parts(identity.node_id, restart_counter);
        let max_age = config.max_neighbor_age_ds;
        Self {
            identity,
            config,
            restart_counter,
            cluster_id,
            cluster_size: 1,
            state: DiscoveryState::Bootup,
            neighbors: NeighborRing::new(max_age),
            current_ack_id: ClusterId::INVALID,
            last_decision_ds: 0,
            no_nodes_found_counter: 0,
            connection_loss_counter: 0,
            battery_runtime_minutes: None,
            blacklist: Vec::new(),
            emergency: None,
            adv_job: None,
            scan_job: None,
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn node_id(&self) -> NodeId {
        self.identity.node_id
    }

    pub fn cluster_id(&self) -> ClusterId {
        self.cluster_id
    }

    pub fn cluster_size(&self) -> ClusterSize {
        self.cluster_size
    }

    pub fn state(&self) -> DiscoveryState {
        self.state
    }

    pub fn neighbors(&self) -> &NeighborRing {
        &self.neighbors
    }

    pub fn connection_loss_counter(&self) -> u16 {
        self.connection_loss_counter
    }

    pub fn set_battery_runtime_minutes(&mut self, minutes: Option<u32>) {
        self.battery_runtime_minutes = minutes;
    }

    /// Snapshot handed to the connection manager for handshakes and
    /// cluster updates
    pub fn local_cluster_info(&self, cm: &ConnectionManager) -> LocalClusterInfo {
        LocalClusterInfo {
            node_id: self.identity.node_id,
            cluster_id: self.cluster_id,
            cluster_size: self.cluster_size,
            hops_to_sink: cm.hops_to_shortest_sink(),
            mesh_write_handle: cm.local_write_handle(),
        }
    }

    // ------------------------------------------------------------------
    // Startup and state changes
    // ------------------------------------------------------------------

    /// Leave bootup: create the JOIN_ME advertising job and the mesh scan
    /// job, then start discovering at high duty.
    pub fn start(
        &mut self,
        cm: &ConnectionManager,
        adv: &mut AdvertisingController,
        scan: &mut ScanController,
    ) {
        let job = AdvJob::scheduled(
            self.config.join_me_adv_slots,
            self.config.adv_interval_units_high,
            AdvType::ConnectableUndirected,
        );
        self.adv_job = adv.add_job(job).ok();
        self.scan_job = scan
            .add_job(ScanJob::endless(
                self.config.scan_interval_units_high,
                self.config.scan_window_units_high,
                ScanUse::Mesh,
            ))
            .ok();
        self.state = DiscoveryState::DiscoveryHigh;
        info!(node = %self.identity.node_id, cluster = %self.cluster_id, "node started");
        self.update_join_me(cm, adv);
    }

    fn change_state(
        &mut self,
        new_state: DiscoveryState,
        adv: &mut AdvertisingController,
        scan: &mut ScanController,
    ) {
        if self.state == new_state {
            return;
        }
        debug!(node = %self.identity.node_id, ?new_state, "discovery state change");
        self.state = new_state;

        let (adv_interval, scan_params) = match new_state {
            DiscoveryState::DiscoveryHigh | DiscoveryState::Reestablishing => (
                self.config.adv_interval_units_high,
                Some((
                    self.config.scan_interval_units_high,
                    self.config.scan_window_units_high,
                )),
            ),
            DiscoveryState::DiscoveryLow => (
                self.config.adv_interval_units_low,
                Some((
                    self.config.scan_interval_units_low,
                    self.config.scan_window_units_low,
                )),
            ),
            // Saturated nodes still listen at minimal duty so a better
            // partner can trigger the emergency path
            DiscoveryState::DiscoveryOff => (
                self.config.adv_interval_units_low,
                Some((
                    self.config.scan_interval_units_low,
                    self.config.scan_window_units_low,
                )),
            ),
            DiscoveryState::Bootup | DiscoveryState::Handshake => return,
        };

        if let Some(handle) = self.adv_job {
            if let Some(job) = adv.job_mut(handle) {
                job.interval_units = adv_interval;
            }
            let _ = adv.refresh_job(handle);
        }
        match (scan_params, self.scan_job) {
            (Some((interval, window)), Some(handle)) => {
                if let Some(job) = scan.job_mut(handle) {
                    job.interval_units = interval;
                    job.window_units = window;
                }
            }
            (Some((interval, window)), None) => {
                self.scan_job = scan
                    .add_job(ScanJob::endless(interval, window, ScanUse::Mesh))
                    .ok();
            }
            (None, Some(handle)) => {
                scan.remove_job(handle);
                self.scan_job = None;
            }
            (None, None) => {}
        }
    }

    /// Forced state change from the terminal or a module
    pub fn set_discovery(
        &mut self,
        state: DiscoveryState,
        adv: &mut AdvertisingController,
        scan: &mut ScanController,
    ) {
        self.change_state(state, adv, scan);
    }

    /// Discovery state appropriate for the current slot usage
    fn discovery_state_for_slots(&self, cm: &ConnectionManager) -> DiscoveryState {
        if cm.free_mesh_in_connections() > 0 || cm.free_mesh_out_connections() > 0 {
            DiscoveryState::DiscoveryHigh
        } else {
            DiscoveryState::DiscoveryOff
        }
    }

    // ------------------------------------------------------------------
    // JOIN_ME advertising
    // ------------------------------------------------------------------

    fn join_me_payload(&self, cm: &ConnectionManager) -> JoinMePayload {
        JoinMePayload {
            sender: self.identity.node_id,
            cluster_id: self.cluster_id,
            cluster_size: self.cluster_size,
            free_mesh_in: cm.free_mesh_in_connections().min(7),
            free_mesh_out: cm.free_mesh_out_connections().min(31),
            battery_runtime: self
                .battery_runtime_minutes
                .map(crate::util::battery::encode_runtime_minutes)
                .unwrap_or(BATTERY_RUNTIME_INFINITE),
            tx_power: self.identity.dbm_tx,
            device_type: self.identity.device_type,
            hops_to_sink: cm.hops_to_shortest_sink(),
            mesh_write_handle: cm.local_write_handle(),
            ack_field: self.current_ack_id,
        }
    }

    /// Refresh the advertised beacon after anything it carries changed
    pub fn update_join_me(&mut self, cm: &ConnectionManager, adv: &mut AdvertisingController) {
        let Some(handle) = self.adv_job else {
            return;
        };
        let frame = adv::encode_join_me(self.identity.network_id, &self.join_me_payload(cm));
        if let Some(job) = adv.job_mut(handle) {
            job.adv_data.set(&frame);
        }
        let _ = adv.refresh_job(handle);
    }

    // ------------------------------------------------------------------
    // Scan reports
    // ------------------------------------------------------------------

    /// Process one advertising report. Returns the parsed mesh packet so
    /// the module layer can observe it too.
    pub fn handle_adv_report(
        &mut self,
        addr: BleGapAddr,
        rssi: i8,
        data: &[u8],
        now_ds: DsTime,
        cm: &mut ConnectionManager,
        adv: &mut AdvertisingController,
        scan: &mut ScanController,
        errors: &mut ErrorLog,
    ) -> Option<MeshAdvPacket> {
        let packet = adv::parse(data).ok()?;
        let MeshAdvPacket::JoinMe {
            network_id,
            payload,
        } = packet
        else {
            return Some(packet);
        };

        if network_id != self.identity.network_id {
            return Some(packet);
        }
        if payload.sender == self.identity.node_id {
            return Some(packet);
        }

        errors.push_count(ErrorCode::CountJoinMeReceived, 0);
        cm.sample_partner_rssi(payload.sender, rssi);
        self.neighbors.upsert(
            NeighborEntry {
                payload,
                rssi,
                received_time_ds: now_ds,
                address: addr,
            },
            now_ds,
        );

        // A foreign cluster deserves full attention
        if self.state == DiscoveryState::DiscoveryLow && payload.cluster_id != self.cluster_id {
            self.change_state(DiscoveryState::DiscoveryHigh, adv, scan);
        }
        Some(packet)
    }

    // ------------------------------------------------------------------
    // Partner selection
    // ------------------------------------------------------------------

    fn is_blacklisted(&self, node: NodeId, now_ds: DsTime) -> bool {
        self.blacklist
            .iter()
            .any(|(id, until)| *id == node && *until > now_ds)
    }

    fn blacklist_partner(&mut self, node: NodeId, now_ds: DsTime) {
        let until = now_ds.saturating_add(self.config.blacklist_duration_ds);
        self.blacklist.retain(|(id, _)| *id != node);
        self.blacklist.push((node, until));
    }

    /// Value of merging with a candidate; zero means "not an option".
    /// Monotone in the smaller cluster's size, RSSI only breaks ties.
    fn cluster_score(&self, entry: &NeighborEntry) -> u32 {
        let smaller = entry
            .payload
            .cluster_size
            .min(self.cluster_size)
            .max(1) as u32;
        let capacity = (entry.payload.free_mesh_in + entry.payload.free_mesh_out).min(7) as u32;
        let ack_bonus = if entry.payload.ack_field == self.cluster_id {
            500
        } else {
            0
        };
        smaller * 1000 + ack_bonus + capacity * 100 + (entry.rssi as i32 + 128).max(0) as u32
    }

    fn score_as_master(&self, entry: &NeighborEntry, cm: &ConnectionManager, now_ds: DsTime) -> u32 {
        if entry.payload.cluster_id == self.cluster_id
            || entry.payload.free_mesh_in == 0
            || cm.free_mesh_out_connections() == 0
            || self.is_blacklisted(entry.sender(), now_ds)
        {
            return 0;
        }
        self.cluster_score(entry)
    }

    fn score_as_slave(&self, entry: &NeighborEntry, cm: &ConnectionManager, now_ds: DsTime) -> u32 {
        if entry.payload.cluster_id == self.cluster_id
            || entry.payload.free_mesh_out == 0
            || cm.free_mesh_in_connections() == 0
            || self.is_blacklisted(entry.sender(), now_ds)
        {
            return 0;
        }
        self.cluster_score(entry)
    }

    /// Between equal scores the lexicographically smaller (NodeId,
    /// ClusterId) pair wins, so both endpoints agree without talking.
    fn better_candidate<'a>(
        best: Option<(&'a NeighborEntry, u32)>,
        entry: &'a NeighborEntry,
        score: u32,
    ) -> Option<(&'a NeighborEntry, u32)> {
        if score == 0 {
            return best;
        }
        match best {
            None => Some((entry, score)),
            Some((current, current_score)) => {
                if score > current_score
                    || (score == current_score
                        && (entry.sender(), entry.payload.cluster_id)
                            < (current.sender(), current.payload.cluster_id))
                {
                    Some((entry, score))
                } else {
                    Some((current, current_score))
                }
            }
        }
    }

    /// One partner-selection round over the fresh neighbors
    pub fn determine_best_cluster(
        &mut self,
        now_ds: DsTime,
        cm: &mut ConnectionManager,
        adv: &mut AdvertisingController,
        scan: &mut ScanController,
        radio: &mut dyn BlePlatform,
        errors: &mut ErrorLog,
    ) -> DecisionResult {
        let mut best_master: Option<(&NeighborEntry, u32)> = None;
        let mut best_slave: Option<(&NeighborEntry, u32)> = None;
        for entry in self.neighbors.fresh(now_ds) {
            best_master =
                Self::better_candidate(best_master, entry, self.score_as_master(entry, cm, now_ds));
            best_slave =
                Self::better_candidate(best_slave, entry, self.score_as_slave(entry, cm, now_ds));
        }
        // Copy the winners out so the ring borrow ends before any mutation
        let master_pick = best_master.map(|(entry, score)| {
            (
                PartnerSnapshot {
                    node_id: entry.sender(),
                    cluster_id: entry.payload.cluster_id,
                    cluster_size: entry.payload.cluster_size,
                },
                entry.address,
                entry.payload.mesh_write_handle,
                // Whether the candidate could equally initiate toward us;
                // in that case only one of the pair may act
                entry.payload.free_mesh_out > 0 && cm.free_mesh_in_connections() > 0,
                entry.payload.ack_field == self.cluster_id,
                score,
            )
        });
        let slave_pick =
            best_slave.map(|(entry, score)| (entry.sender(), entry.payload.cluster_id, score));

        let master_score = master_pick
            .as_ref()
            .map(|(_, _, _, _, _, s)| *s)
            .unwrap_or(0);
        let slave_score = slave_pick.map(|(_, _, s)| s).unwrap_or(0);

        if master_score > 0 && master_score >= slave_score {
            let (partner, addr, write_handle, they_could_initiate, acked_us, _) =
                master_pick.unwrap();
            let partner_id = partner.node_id;
            // Symmetric connects are broken deterministically: when both
            // sides could act, the lexicographically smaller (NodeId,
            // ClusterId) pair initiates; an ack overrides the order.
            let we_initiate = acked_us
                || !they_could_initiate
                || (self.identity.node_id, self.cluster_id) < (partner_id, partner.cluster_id);
            if we_initiate {
                match cm.connect_as_master(partner, addr, write_handle, radio) {
                    Ok(_) => {
                        self.no_nodes_found_counter = 0;
                        self.change_state(DiscoveryState::Handshake, adv, scan);
                        return DecisionResult::ConnectAsMaster(partner_id);
                    }
                    Err(err) => {
                        debug!(partner = %partner_id, %err, "connect as master not possible");
                        errors.push_error(ErrorCode::WarnConnectAsMasterNotPossible, 0, 0);
                    }
                }
            }
        }
        if slave_score > 0 || master_score > 0 {
            let (partner_id, ack) = match slave_pick {
                Some((partner_id, ack, score)) if score > 0 => (partner_id, ack),
                _ => {
                    let (partner, ..) = master_pick.unwrap();
                    (partner.node_id, partner.cluster_id)
                }
            };
            if self.current_ack_id != ack {
                self.current_ack_id = ack;
                self.update_join_me(cm, adv);
            }
            self.no_nodes_found_counter = 0;
            return DecisionResult::ConnectAsSlave(partner_id);
        }

        self.no_nodes_found_counter = self.no_nodes_found_counter.saturating_add(1);
        if self.state == DiscoveryState::DiscoveryHigh
            && self.no_nodes_found_counter >= self.config.no_nodes_found_threshold
        {
            self.change_state(DiscoveryState::DiscoveryLow, adv, scan);
        }
        DecisionResult::NoNodesFound
    }

    /// Saturated but a better partner keeps appearing: sacrifice the worst
    /// link once the candidate has proven it still has a free slot.
    fn consider_emergency_disconnect(
        &mut self,
        now_ds: DsTime,
        cm: &mut ConnectionManager,
        radio: &mut dyn BlePlatform,
        errors: &mut ErrorLog,
    ) {
        let candidate = self
            .neighbors
            .fresh(now_ds)
            .filter(|e| {
                e.payload.cluster_id != self.cluster_id
                    && !self.is_blacklisted(e.sender(), now_ds)
                    && (e.payload.free_mesh_in > 0 || e.payload.free_mesh_out > 0)
            })
            .map(|e| e.sender())
            .next();

        let Some(candidate) = candidate else {
            self.emergency = None;
            return;
        };

        let sightings = match &mut self.emergency {
            Some(tracker) if tracker.node == candidate => {
                tracker.sightings = tracker.sightings.saturating_add(1);
                tracker.sightings
            }
            _ => {
                self.emergency = Some(EmergencyCandidate {
                    node: candidate,
                    sightings: 1,
                });
                1
            }
        };
        if sightings < self.config.emergency_sightings_required {
            return;
        }
        self.emergency = None;
        match cm.worst_mesh_connection() {
            Some(worst) => {
                info!(candidate = %candidate, "emergency disconnect of worst link");
                errors.push_count(ErrorCode::InfoEmergencyDisconnectSuccessful, 0);
                cm.disconnect(worst, radio);
            }
            None => {
                errors.push_count(
                    ErrorCode::CountEmergencyDisconnectCantDisconnectAnybody,
                    0,
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Timer
    // ------------------------------------------------------------------

    pub fn timer(
        &mut self,
        now_ds: DsTime,
        cm: &mut ConnectionManager,
        adv: &mut AdvertisingController,
        scan: &mut ScanController,
        radio: &mut dyn BlePlatform,
        errors: &mut ErrorLog,
    ) {
        self.neighbors.purge_stale(now_ds);
        self.blacklist.retain(|(_, until)| *until > now_ds);

        if now_ds.saturating_sub(self.last_decision_ds) < self.config.decision_interval_ds {
            return;
        }
        self.last_decision_ds = now_ds;

        match self.state {
            DiscoveryState::DiscoveryHigh | DiscoveryState::DiscoveryLow => {
                if cm.free_mesh_in_connections() == 0 && cm.free_mesh_out_connections() == 0 {
                    self.change_state(DiscoveryState::DiscoveryOff, adv, scan);
                    return;
                }
                // One merge at a time; an inbound handshake pauses us too
                if cm.has_handshake_in_flight() {
                    return;
                }
                self.determine_best_cluster(now_ds, cm, adv, scan, radio, errors);
            }
            DiscoveryState::DiscoveryOff => {
                self.consider_emergency_disconnect(now_ds, cm, radio, errors);
            }
            _ => {}
        }
    }

    // ------------------------------------------------------------------
    // Connection events
    // ------------------------------------------------------------------

    pub fn handle_connection_event(
        &mut self,
        event: &ConnectionEvent,
        now_ds: DsTime,
        cm: &mut ConnectionManager,
        adv: &mut AdvertisingController,
        scan: &mut ScanController,
        errors: &mut ErrorLog,
    ) {
        match event {
            ConnectionEvent::HandshakeDone { conn_id, result } => {
                let old_cluster_id = self.cluster_id;
                self.cluster_id = result.merged_cluster_id;
                // Applied as a delta so a cluster update that raced the
                // handshake is not erased
                self.cluster_size += result.partner_subtree_size;
                self.current_ack_id = ClusterId::INVALID;
                self.no_nodes_found_counter = 0;
                info!(
                    node = %self.identity.node_id,
                    cluster = %self.cluster_id,
                    size = self.cluster_size,
                    "joined cluster"
                );
                // Everyone on our side of the new link learns about the
                // added subtree; the id only travels when it changed
                let new_id = (old_cluster_id != self.cluster_id).then_some(self.cluster_id);
                cm.queue_cluster_update(
                    Some(*conn_id),
                    result.partner_subtree_size,
                    new_id,
                    old_cluster_id,
                );
                let next = self.discovery_state_for_slots(cm);
                self.change_state(next, adv, scan);
                self.update_join_me(cm, adv);
            }
            ConnectionEvent::MeshDisconnected {
                partner_id,
                subtree_size,
                had_master_bit,
                ..
            } => {
                self.connection_loss_counter = self.connection_loss_counter.saturating_add(1);
                self.cluster_size = (self.cluster_size - subtree_size).max(1);
                let old_cluster_id = self.cluster_id;
                debug!(
                    node = %self.identity.node_id,
                    partner = %partner_id,
                    lost = subtree_size,
                    "mesh link lost"
                );
                // The partition that lost the master bit takes a new
                // identity so the halves can merge again later
                let new_id = if *had_master_bit {
                    None
                } else {
                    let id = ClusterId::from_parts(
                        self.identity.node_id,
                        self.restart_counter
                            .wrapping_add(self.connection_loss_counter),
                    );
                    self.cluster_id = id;
                    Some(id)
                };
                cm.queue_cluster_update(None, -subtree_size, new_id, old_cluster_id);
                let next = self.discovery_state_for_slots(cm);
                self.change_state(next, adv, scan);
                self.update_join_me(cm, adv);
            }
            ConnectionEvent::HandshakeFailed { partner_id, .. } => {
                self.blacklist_partner(*partner_id, now_ds);
                if self.state == DiscoveryState::Handshake {
                    let next = self.discovery_state_for_slots(cm);
                    self.change_state(next, adv, scan);
                }
            }
            ConnectionEvent::ConnectingTimeout { partner_id } => {
                self.blacklist_partner(*partner_id, now_ds);
                if self.state == DiscoveryState::Handshake {
                    let next = self.discovery_state_for_slots(cm);
                    self.change_state(next, adv, scan);
                }
            }
            ConnectionEvent::ReestablishStarted { .. } => {
                if matches!(
                    self.state,
                    DiscoveryState::DiscoveryHigh
                        | DiscoveryState::DiscoveryLow
                        | DiscoveryState::DiscoveryOff
                ) {
                    self.change_state(DiscoveryState::Reestablishing, adv, scan);
                }
            }
            ConnectionEvent::ReestablishSucceeded { .. } => {
                if self.state == DiscoveryState::Reestablishing {
                    let next = self.discovery_state_for_slots(cm);
                    self.change_state(next, adv, scan);
                }
            }
            ConnectionEvent::ClusterUpdateReceived { conn_id, update } => {
                self.receive_cluster_update(*conn_id, update, cm, adv, errors);
            }
            ConnectionEvent::MeshMessageReceived { .. } | ConnectionEvent::AppDataReceived { .. } => {}
        }
    }

    /// Apply a cluster-state delta that arrived on one of our links
    fn receive_cluster_update(
        &mut self,
        conn_id: u8,
        update: &crate::proto::conn::ClusterInfoUpdate,
        cm: &mut ConnectionManager,
        adv: &mut AdvertisingController,
        errors: &mut ErrorLog,
    ) {
        if update.current_cluster_id != self.cluster_id {
            // The sender disagrees about which cluster this link belongs
            // to; only a fresh handshake can heal that
            warn!(
                node = %self.identity.node_id,
                ours = %self.cluster_id,
                theirs = %update.current_cluster_id,
                "cluster update flow mismatch"
            );
            errors.push_error(ErrorCode::WarnClusterUpdateFlowMismatch, 0, 0);
            return;
        }

        let old_cluster_id = self.cluster_id;
        self.cluster_size += update.cluster_size_change;
        let id_changed = update.new_cluster_id.is_valid() && update.new_cluster_id != self.cluster_id;
        if id_changed {
            self.cluster_id = update.new_cluster_id;
        }
        cm.apply_cluster_delta(conn_id, update.cluster_size_change, update.hops_to_sink);

        // Keep the flood going away from where it came from
        cm.queue_cluster_update(
            Some(conn_id),
            update.cluster_size_change,
            id_changed.then_some(self.cluster_id),
            old_cluster_id,
        );
        self.update_join_me(cm, adv);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{DeviceType, NetworkId, HOPS_UNKNOWN};

    fn make_node(id: u16) -> (Node, ConnectionManager) {
        let identity = NodeIdentity::new(NodeId(id), NetworkId(10));
        let config = MeshConfig::default();
        let cm = ConnectionManager::new(NodeId(id), false, 0x12, config.clone());
        (Node::new(identity, 1, config), cm)
    }

    fn neighbor(sender: u16, cluster_size: ClusterSize, rssi: i8) -> NeighborEntry {
        NeighborEntry {
            payload: JoinMePayload {
                sender: NodeId(sender),
                cluster_id: ClusterId::from_parts(NodeId(sender), 1),
                cluster_size,
                free_mesh_in: 1,
                free_mesh_out: 3,
                battery_runtime: 255,
                tx_power: 0,
                device_type: DeviceType::Static,
                hops_to_sink: HOPS_UNKNOWN,
                mesh_write_handle: 0x12,
                ack_field: ClusterId::INVALID,
            },
            rssi,
            received_time_ds: 0,
            address: BleGapAddr::new([sender as u8, 0, 0, 0, 0, 0]),
        }
    }

    #[test]
    fn test_cluster_id_from_identity_and_restart_counter() {
        let (node, _) = make_node(2);
        assert_eq!(node.cluster_id().raw(), (2 << 16) | 1);
        assert_eq!(node.cluster_size(), 1);
    }

    #[test]
    fn test_score_prefers_bigger_merge() {
        let (mut node, cm) = make_node(1);
        node.cluster_size = 5;
        let small = neighbor(2, 1, -40);
        let large = neighbor(3, 4, -80);
        // Merging four nodes beats merging one, regardless of signal
        assert!(node.score_as_master(&large, &cm, 0) > node.score_as_master(&small, &cm, 0));
    }

    #[test]
    fn test_score_zero_for_same_cluster() {
        let (node, cm) = make_node(1);
        let mut entry = neighbor(2, 3, -40);
        entry.payload.cluster_id = node.cluster_id();
        assert_eq!(node.score_as_master(&entry, &cm, 0), 0);
        assert_eq!(node.score_as_slave(&entry, &cm, 0), 0);
    }

    #[test]
    fn test_score_zero_without_partner_capacity() {
        let (node, cm) = make_node(1);
        let mut entry = neighbor(2, 1, -40);
        entry.payload.free_mesh_in = 0;
        assert_eq!(node.score_as_master(&entry, &cm, 0), 0);
        entry.payload.free_mesh_in = 1;
        entry.payload.free_mesh_out = 0;
        assert_eq!(node.score_as_slave(&entry, &cm, 0), 0);
    }

    #[test]
    fn test_blacklist_suppresses_candidate() {
        let (mut node, cm) = make_node(1);
        let entry = neighbor(2, 1, -40);
        assert!(node.score_as_master(&entry, &cm, 0) > 0);
        node.blacklist_partner(NodeId(2), 0);
        assert_eq!(node.score_as_master(&entry, &cm, 0), 0);
        // Expired blacklist entries stop mattering
        let after = node.config.blacklist_duration_ds + 1;
        assert!(node.score_as_master(&entry, &cm, after) > 0);
    }

    #[test]
    fn test_rssi_breaks_ties() {
        let (node, cm) = make_node(1);
        let weak = neighbor(2, 1, -90);
        let strong = neighbor(3, 1, -40);
        assert!(node.score_as_master(&strong, &cm, 0) > node.score_as_master(&weak, &cm, 0));
    }

    #[test]
    fn test_equal_scores_pick_lexicographically_smaller() {
        let a = neighbor(2, 1, -50);
        let b = neighbor(3, 1, -50);
        let best = Node::better_candidate(None, &b, 700);
        let best = Node::better_candidate(best, &a, 700);
        assert_eq!(best.unwrap().0.sender(), NodeId(2));

        // Insertion order must not matter
        let best = Node::better_candidate(None, &a, 700);
        let best = Node::better_candidate(best, &b, 700);
        assert_eq!(best.unwrap().0.sender(), NodeId(2));
    }

    #[test]
    fn test_cluster_update_mismatch_ignored() {
        let (mut node, mut cm) = make_node(1);
        let mut adv = AdvertisingController::new();
        let mut errors = ErrorLog::new();
        let update = crate::proto::conn::ClusterInfoUpdate {
            sender: NodeId(5),
            receiver: NodeId(1),
            current_cluster_id: ClusterId::from_parts(NodeId(9), 9),
            new_cluster_id: ClusterId::INVALID,
            cluster_size_change: 3,
            hops_to_sink: 2,
        };
        let size_before = node.cluster_size();
        node.receive_cluster_update(1, &update, &mut cm, &mut adv, &mut errors);
        assert_eq!(node.cluster_size(), size_before);
        assert_eq!(errors.occurrences(ErrorCode::WarnClusterUpdateFlowMismatch), 1);
    }

    #[test]
    fn test_cluster_updates_commute() {
        // Two deltas applied in either order end at the same size
        let make = || {
            let (mut node, cm) = make_node(1);
            node.cluster_size = 4;
            (node, cm)
        };
        let update = |delta: i16| crate::proto::conn::ClusterInfoUpdate {
            sender: NodeId(5),
            receiver: NodeId(1),
            current_cluster_id: ClusterId::from_parts(NodeId(1), 1),
            new_cluster_id: ClusterId::INVALID,
            cluster_size_change: delta,
            hops_to_sink: HOPS_UNKNOWN,
        };

        let mut adv = AdvertisingController::new();
        let mut errors = ErrorLog::new();

        let (mut node_a, mut cm_a) = make();
        node_a.receive_cluster_update(1, &update(2), &mut cm_a, &mut adv, &mut errors);
        node_a.receive_cluster_update(1, &update(-1), &mut cm_a, &mut adv, &mut errors);

        let (mut node_b, mut cm_b) = make();
        node_b.receive_cluster_update(1, &update(-1), &mut cm_b, &mut adv, &mut errors);
        node_b.receive_cluster_update(1, &update(2), &mut cm_b, &mut adv, &mut errors);

        assert_eq!(node_a.cluster_size(), node_b.cluster_size());
        assert_eq!(node_a.cluster_size(), 5);
    }
}
