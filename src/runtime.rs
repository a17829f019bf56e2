// Runtime - the composition root
//
// Owns every component of one mesh node and exposes the process-level
// contract: init once, a ~100 ms timer tick, the BLE event feed, the radio
// activity callback and the terminal. All cross-component routing happens
// here; components never hold references to each other.

use crate::advertising::AdvertisingController;
use crate::ble::{BleEvent, BlePlatform};
use crate::config::{ConfigError, MeshConfig};
use crate::conn::{ConnectionEvent, ConnectionManager, DeliveryPriority};
use crate::modules::{CommandResult, ModuleContext, ModuleRegistry, PingModule};
use crate::node::{DiscoveryState, Node};
use crate::proto::conn::{ConnPacket, Data1};
use crate::proto::NodeId;
use crate::scanning::ScanController;
use crate::storage::{BootState, NodeIdentity, RecordError, RecordStore};
use crate::util::{
    DsTime, ErrorLog, GlobalTime, PacketStatKey, PacketStats, RebootReason,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt::Write as _;
use thiserror::Error;
use tracing::{debug, info};

/// GATT handle of the mesh message characteristic
const MESH_WRITE_HANDLE: u16 = 0x0012;

/// Rounds of event routing per entry point; loopback chains converge fast
const MAX_EVENT_ROUNDS: usize = 8;

#[derive(Error, Debug)]
pub enum InitError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Record(#[from] RecordError),

    #[error("module setup failed: {0}")]
    Module(#[from] crate::modules::ModuleError),
}

/// Everything the platform hands over at boot
pub struct BoardConfig {
    pub identity: NodeIdentity,
    pub mesh: MeshConfig,
    /// Seed for the jitter PRNG; fixed seeds make tests deterministic
    pub seed: u64,
}

pub struct MeshNode {
    node: Node,
    cm: ConnectionManager,
    adv: AdvertisingController,
    scan: ScanController,
    modules: ModuleRegistry,
    errors: ErrorLog,
    stats: PacketStats,
    time: GlobalTime,
    store: Box<dyn RecordStore>,
    radio: Box<dyn BlePlatform>,
    app_timer_ds: DsTime,
    radio_active_count: u32,
    fatal_persisted: bool,
    app_messages: Vec<(NodeId, Vec<u8>)>,
}

impl MeshNode {
    /// Boot one node: advance the restart counter, report how the previous
    /// boot ended, load configurations and enter discovery.
    pub fn init(
        board: BoardConfig,
        mut store: Box<dyn RecordStore>,
        radio: Box<dyn BlePlatform>,
    ) -> Result<MeshNode, InitError> {
        board.mesh.validate()?;

        // A stored identity survives any board default
        let identity = match NodeIdentity::load(store.as_ref()) {
            Some(stored) => stored?,
            None => {
                board.identity.save(store.as_mut())?;
                board.identity.clone()
            }
        };

        let (boot_state, previous_reboot) = BootState::next_boot(store.as_mut())?;
        if let Some(reason) = previous_reboot {
            info!(?reason, "previous boot ended abnormally");
        }

        let mut rng = StdRng::seed_from_u64(board.seed);
        let own_is_sink = identity.device_type.is_sink();
        let node = Node::new(identity.clone(), boot_state.restart_counter, board.mesh.clone());
        let cm = ConnectionManager::new(
            identity.node_id,
            own_is_sink,
            MESH_WRITE_HANDLE,
            board.mesh.clone(),
        );
        let mut modules = ModuleRegistry::new();
        modules.register(Box::new(PingModule::new()))?;

        // Stagger the decision clock so symmetric neighbors do not race
        let app_timer_ds = rng.gen_range(0..board.mesh.decision_interval_ds.max(1));

        let mut mesh_node = MeshNode {
            node,
            cm,
            adv: AdvertisingController::new(),
            scan: ScanController::new(),
            modules,
            errors: ErrorLog::new(),
            stats: PacketStats::new(),
            time: GlobalTime::new(),
            store,
            radio,
            app_timer_ds,
            radio_active_count: 0,
            fatal_persisted: false,
            app_messages: Vec::new(),
        };

        let _ = mesh_node.radio.set_tx_power(identity.dbm_tx);
        {
            let mut ctx = ModuleContext {
                own_id: identity.node_id,
                now_ds: mesh_node.app_timer_ds,
                cm: &mut mesh_node.cm,
                errors: &mut mesh_node.errors,
                time: &mesh_node.time,
            };
            mesh_node
                .modules
                .load_configurations(mesh_node.store.as_ref(), &mut ctx);
        }
        mesh_node
            .node
            .start(&mesh_node.cm, &mut mesh_node.adv, &mut mesh_node.scan);
        Ok(mesh_node)
    }

    // ------------------------------------------------------------------
    // Process-level entry points
    // ------------------------------------------------------------------

    /// The ~100 ms application timer
    pub fn timer_event(&mut self, passed_ds: u16) {
        self.app_timer_ds = self.app_timer_ds.saturating_add(passed_ds as DsTime);
        let now = self.app_timer_ds;
        self.time.advance(passed_ds);

        self.node.timer(
            now,
            &mut self.cm,
            &mut self.adv,
            &mut self.scan,
            self.radio.as_mut(),
            &mut self.errors,
        );
        let local = self.node.local_cluster_info(&self.cm);
        self.cm
            .timer(passed_ds, now, local, self.radio.as_mut(), &mut self.errors);
        self.adv.timer(passed_ds, self.radio.as_mut(), &mut self.errors);
        self.scan.timer(passed_ds, self.radio.as_mut(), &mut self.errors);
        {
            let mut ctx = ModuleContext {
                own_id: self.node.node_id(),
                now_ds: now,
                cm: &mut self.cm,
                errors: &mut self.errors,
                time: &self.time,
            };
            self.modules.timer_all(&mut ctx, passed_ds);
        }
        self.route_events();
        self.persist_fatal_if_any();
    }

    /// One BLE upcall from the platform
    pub fn ble_event(&mut self, event: BleEvent) {
        let now = self.app_timer_ds;
        if let BleEvent::AdvReport { addr, rssi, data } = &event {
            let parsed = self.node.handle_adv_report(
                *addr,
                *rssi,
                data,
                now,
                &mut self.cm,
                &mut self.adv,
                &mut self.scan,
                &mut self.errors,
            );
            if let Some(packet) = parsed {
                let mut ctx = ModuleContext {
                    own_id: self.node.node_id(),
                    now_ds: now,
                    cm: &mut self.cm,
                    errors: &mut self.errors,
                    time: &self.time,
                };
                self.modules.adv_report_all(&mut ctx, &packet, *rssi);
            }
        } else {
            let local = self.node.local_cluster_info(&self.cm);
            self.cm
                .handle_ble_event(&event, now, local, self.radio.as_mut(), &mut self.errors);
        }
        self.route_events();
        self.persist_fatal_if_any();
    }

    /// Pre-radio-event notification
    pub fn radio_event(&mut self, radio_active: bool) {
        if radio_active {
            self.radio_active_count = self.radio_active_count.saturating_add(1);
        }
    }

    // ------------------------------------------------------------------
    // Event routing
    // ------------------------------------------------------------------

    fn route_events(&mut self) {
        for _ in 0..MAX_EVENT_ROUNDS {
            let events = self.cm.take_events();
            if events.is_empty() {
                return;
            }
            for event in events {
                self.route_event(event);
            }
        }
    }

    fn route_event(&mut self, event: ConnectionEvent) {
        let now = self.app_timer_ds;
        self.node.handle_connection_event(
            &event,
            now,
            &mut self.cm,
            &mut self.adv,
            &mut self.scan,
            &mut self.errors,
        );

        match &event {
            ConnectionEvent::MeshMessageReceived { packet, .. } => {
                self.dispatch_mesh_message(packet.clone());
                return;
            }
            ConnectionEvent::AppDataReceived { conn_id, data } => {
                debug!(conn = conn_id, len = data.len(), "app connection data");
                return;
            }
            _ => {}
        }

        let mut ctx = ModuleContext {
            own_id: self.node.node_id(),
            now_ds: now,
            cm: &mut self.cm,
            errors: &mut self.errors,
            time: &self.time,
        };
        self.modules.connection_changed_all(&mut ctx, &event);
    }

    fn dispatch_mesh_message(&mut self, packet: ConnPacket) {
        let now = self.app_timer_ds;
        match packet {
            ConnPacket::ModuleAction(action) => {
                self.stats.record(PacketStatKey {
                    message_type: crate::proto::conn::MessageType::ModuleAction as u8,
                    module_id: action.module_id,
                    action_kind: action.action_kind as u8,
                    request_handle: action.request_handle,
                });
                let mut ctx = ModuleContext {
                    own_id: self.node.node_id(),
                    now_ds: now,
                    cm: &mut self.cm,
                    errors: &mut self.errors,
                    time: &self.time,
                };
                self.modules
                    .handle_action(&mut ctx, self.store.as_mut(), &action);
            }
            ConnPacket::Data1(data) => {
                self.stats.record(PacketStatKey::for_message_type(
                    crate::proto::conn::MessageType::Data1 as u8,
                ));
                debug!(from = %data.sender, len = data.data.len(), "app data received");
                self.app_messages.push((data.sender, data.data));
            }
            ConnPacket::AdvInfo(info) => {
                self.stats.record(PacketStatKey::for_message_type(
                    crate::proto::conn::MessageType::AdvInfo as u8,
                ));
                let mut ctx = ModuleContext {
                    own_id: self.node.node_id(),
                    now_ds: now,
                    cm: &mut self.cm,
                    errors: &mut self.errors,
                    time: &self.time,
                };
                self.modules.adv_info_all(&mut ctx, &info);
            }
            other => {
                self.stats
                    .record(PacketStatKey::for_message_type(other.message_type() as u8));
            }
        }
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Send opaque app data to a node, the broadcast address or the sink
    /// group. Returns whether the message was queued.
    pub fn send_app_data(&mut self, destination: NodeId, data: &[u8], reliable: bool) -> bool {
        let packet = ConnPacket::Data1(Data1 {
            sender: self.node.node_id(),
            receiver: destination,
            data: data.to_vec(),
        });
        let queued = self.cm.send_mesh_message(
            &packet.encode(),
            DeliveryPriority::Low,
            reliable,
            &mut self.errors,
        );
        self.route_events();
        queued
    }

    // ------------------------------------------------------------------
    // Terminal
    // ------------------------------------------------------------------

    pub fn terminal_command(&mut self, args: &[&str]) -> CommandResult {
        let Some(&command) = args.first() else {
            return CommandResult::NotEnoughArguments;
        };
        let result = match command {
            "status" => {
                info!("{}", self.status_string());
                CommandResult::Success
            }
            "bufferstat" => {
                let now = self.app_timer_ds;
                for entry in self.node.neighbors().iter() {
                    info!(
                        sender = %entry.sender(),
                        cluster = %entry.payload.cluster_id,
                        size = entry.payload.cluster_size,
                        rssi = entry.rssi,
                        age_ds = entry.age_ds(now),
                        "neighbor"
                    );
                }
                CommandResult::Success
            }
            "update" => {
                self.node.update_join_me(&self.cm, &mut self.adv);
                CommandResult::Success
            }
            "settime" => match args.get(1).map(|s| s.parse::<u32>()) {
                Some(Ok(sec)) => {
                    self.time.set(sec);
                    CommandResult::Success
                }
                Some(Err(_)) => CommandResult::WrongArgument,
                None => CommandResult::NotEnoughArguments,
            },
            "data" => {
                let Some(dest) = args.get(1) else {
                    return CommandResult::NotEnoughArguments;
                };
                let Ok(dest) = dest.parse::<u16>() else {
                    return CommandResult::WrongArgument;
                };
                let payload = args.get(2).map(|s| s.as_bytes()).unwrap_or(b"hello");
                if self.send_app_data(NodeId(dest), payload, false) {
                    CommandResult::Success
                } else {
                    CommandResult::WrongArgument
                }
            }
            "action" => {
                if args.len() < 4 {
                    return CommandResult::NotEnoughArguments;
                }
                let (Ok(dest), Ok(module_id), Ok(action)) = (
                    args[1].parse::<u16>(),
                    args[2].parse::<u16>(),
                    args[3].parse::<u8>(),
                ) else {
                    return CommandResult::WrongArgument;
                };
                let packet = ConnPacket::ModuleAction(crate::proto::conn::ModuleAction {
                    sender: self.node.node_id(),
                    receiver: NodeId(dest),
                    module_id,
                    action_kind: crate::proto::conn::ModuleActionKind::TriggerAction,
                    request_handle: 0,
                    data: vec![action],
                });
                if self.cm.send_mesh_message(
                    &packet.encode(),
                    DeliveryPriority::Low,
                    true,
                    &mut self.errors,
                ) {
                    CommandResult::Success
                } else {
                    CommandResult::WrongArgument
                }
            }
            "disconnect" => {
                let Some(partner) = args.get(1) else {
                    return CommandResult::NotEnoughArguments;
                };
                let Ok(partner) = partner.parse::<u16>() else {
                    return CommandResult::WrongArgument;
                };
                match self.cm.connection_to_partner(NodeId(partner)).map(|c| c.id) {
                    Some(conn_id) => {
                        self.cm.disconnect(conn_id, self.radio.as_mut());
                        CommandResult::Success
                    }
                    None => CommandResult::WrongArgument,
                }
            }
            "discovery" => match args.get(1).copied() {
                Some("high") => {
                    self.node
                        .set_discovery(DiscoveryState::DiscoveryHigh, &mut self.adv, &mut self.scan);
                    CommandResult::Success
                }
                Some("low") => {
                    self.node
                        .set_discovery(DiscoveryState::DiscoveryLow, &mut self.adv, &mut self.scan);
                    CommandResult::Success
                }
                Some("off") => {
                    self.node
                        .set_discovery(DiscoveryState::DiscoveryOff, &mut self.adv, &mut self.scan);
                    CommandResult::Success
                }
                Some(_) => CommandResult::WrongArgument,
                None => CommandResult::NotEnoughArguments,
            },
            "errors" => {
                self.errors
                    .push_count(crate::util::ErrorCode::InfoErrorsRequested, self.time.now_sec());
                while let Some(entry) = self.errors.pop_entry() {
                    info!(code = ?entry.code, extra = entry.extra, "error log entry");
                }
                CommandResult::Success
            }
            _ => {
                let mut ctx = ModuleContext {
                    own_id: self.node.node_id(),
                    now_ds: self.app_timer_ds,
                    cm: &mut self.cm,
                    errors: &mut self.errors,
                    time: &self.time,
                };
                self.modules.terminal_all(&mut ctx, args)
            }
        };
        self.route_events();
        result
    }

    pub fn status_string(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "node {} cluster {} size {} state {:?} hops {}",
            self.node.node_id(),
            self.node.cluster_id(),
            self.node.cluster_size(),
            self.node.state(),
            self.cm.hops_to_shortest_sink(),
        );
        let _ = writeln!(
            out,
            "free slots in {} out {} pending packets {}",
            self.cm.free_mesh_in_connections(),
            self.cm.free_mesh_out_connections(),
            self.cm.pending_packets(),
        );
        for conn in self.cm.mesh_connections() {
            let mesh = conn.mesh().unwrap();
            let _ = writeln!(
                out,
                "  conn {} partner {} state {:?} master {} subtree {} rssi {:?}",
                conn.id,
                conn.partner_id,
                conn.state,
                mesh.master_bit as u8,
                mesh.connected_subtree_size,
                conn.average_rssi(),
            );
        }
        out
    }

    // ------------------------------------------------------------------
    // Fatal path
    // ------------------------------------------------------------------

    /// Persist the pending reboot reason once so the next boot can report
    /// it; the embedder is responsible for the actual reset.
    fn persist_fatal_if_any(&mut self) {
        if self.fatal_persisted || self.errors.pending_reboot().is_none() {
            return;
        }
        let mut state = BootState::load(self.store.as_ref());
        state.reboot_reason = self.errors.pending_reboot();
        if state.save(self.store.as_mut()).is_ok() {
            self.fatal_persisted = true;
        }
    }

    /// Set when a fatal error was recorded; the embedder must reset
    pub fn pending_reboot(&self) -> Option<RebootReason> {
        self.errors.pending_reboot()
    }

    // ------------------------------------------------------------------
    // Observability
    // ------------------------------------------------------------------

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.cm
    }

    pub fn error_log(&self) -> &ErrorLog {
        &self.errors
    }

    pub fn packet_stats(&self) -> &PacketStats {
        &self.stats
    }

    pub fn global_time(&self) -> &GlobalTime {
        &self.time
    }

    pub fn radio_active_count(&self) -> u32 {
        self.radio_active_count
    }

    pub fn app_timer_ds(&self) -> DsTime {
        self.app_timer_ds
    }

    /// Drain the app payloads that arrived since the last call
    pub fn take_app_messages(&mut self) -> Vec<(NodeId, Vec<u8>)> {
        std::mem::take(&mut self.app_messages)
    }
}
