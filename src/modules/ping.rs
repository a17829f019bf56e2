// Ping module - round-trip probe over the mesh
//
// `ping <nodeId>` sends a trigger action to the destination; the peer
// answers with an action response and the round-trip time in deciseconds
// lands in the log and in `last_rtt_ds`. Doubles as the reference module
// implementation.

use super::module::{CommandResult, Module, ModuleContext, ModuleId};
use crate::proto::conn::{ModuleAction, ModuleActionKind};
use crate::proto::NodeId;
use crate::util::DsTime;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

const ACTION_PING: u8 = 0;
const ACTION_PONG: u8 = 1;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct PingConfig {
    active: bool,
}

impl Default for PingConfig {
    fn default() -> Self {
        Self { active: true }
    }
}

struct OutstandingPing {
    request_handle: u8,
    destination: NodeId,
    sent_at_ds: DsTime,
}

pub struct PingModule {
    config: PingConfig,
    outstanding: Option<OutstandingPing>,
    next_handle: u8,
    last_rtt_ds: Option<DsTime>,
}

impl PingModule {
    pub fn new() -> Self {
        Self {
            config: PingConfig::default(),
            outstanding: None,
            next_handle: 1,
            last_rtt_ds: None,
        }
    }

    pub fn last_rtt_ds(&self) -> Option<DsTime> {
        self.last_rtt_ds
    }

    pub fn send_ping(&mut self, ctx: &mut ModuleContext, destination: NodeId) -> bool {
        let handle = self.next_handle;
        self.next_handle = self.next_handle.wrapping_add(1).max(1);
        let queued = ctx.send_module_action(
            destination,
            self.id(),
            ModuleActionKind::TriggerAction,
            handle,
            &[ACTION_PING],
        );
        if queued {
            debug!(dest = %destination, handle, "ping sent");
            self.outstanding = Some(OutstandingPing {
                request_handle: handle,
                destination,
                sent_at_ds: ctx.now_ds,
            });
        }
        queued
    }
}

impl Default for PingModule {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for PingModule {
    fn id(&self) -> ModuleId {
        ModuleId::PING
    }

    fn name(&self) -> &'static str {
        "ping"
    }

    fn is_active(&self) -> bool {
        self.config.active
    }

    fn set_active(&mut self, active: bool) {
        self.config.active = active;
    }

    fn terminal_command(&mut self, ctx: &mut ModuleContext, args: &[&str]) -> CommandResult {
        if args.first() != Some(&"ping") {
            return CommandResult::Unknown;
        }
        let Some(dest) = args.get(1) else {
            return CommandResult::NotEnoughArguments;
        };
        let Ok(dest) = dest.parse::<u16>() else {
            return CommandResult::WrongArgument;
        };
        if self.send_ping(ctx, NodeId(dest)) {
            CommandResult::Success
        } else {
            CommandResult::WrongArgument
        }
    }

    fn mesh_message_received(&mut self, ctx: &mut ModuleContext, action: &ModuleAction) {
        match (action.action_kind, action.data.first().copied()) {
            (ModuleActionKind::TriggerAction, Some(ACTION_PING)) => {
                ctx.send_module_action(
                    action.sender,
                    self.id(),
                    ModuleActionKind::ActionResponse,
                    action.request_handle,
                    &[ACTION_PONG],
                );
            }
            (ModuleActionKind::ActionResponse, Some(ACTION_PONG)) => {
                let matches = self
                    .outstanding
                    .as_ref()
                    .map(|p| p.request_handle == action.request_handle && p.destination == action.sender)
                    .unwrap_or(false);
                if matches {
                    let sent = self.outstanding.take().unwrap();
                    let rtt = ctx.now_ds.saturating_sub(sent.sent_at_ds);
                    info!(dest = %action.sender, rtt_ds = rtt, "ping answered");
                    self.last_rtt_ds = Some(rtt);
                }
            }
            _ => {}
        }
    }

    fn config_blob(&self) -> Option<Vec<u8>> {
        postcard::to_allocvec(&self.config).ok()
    }

    fn load_config_blob(&mut self, blob: &[u8]) {
        if let Ok(config) = postcard::from_bytes(blob) {
            self.config = config;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MeshConfig;
    use crate::conn::ConnectionManager;
    use crate::util::{ErrorLog, GlobalTime};

    fn ctx_parts() -> (ConnectionManager, ErrorLog, GlobalTime) {
        (
            ConnectionManager::new(NodeId(1), false, 0x12, MeshConfig::default()),
            ErrorLog::new(),
            GlobalTime::new(),
        )
    }

    #[test]
    fn test_ping_terminal_arguments() {
        let (mut cm, mut errors, time) = ctx_parts();
        let mut ctx = ModuleContext {
            own_id: NodeId(1),
            now_ds: 0,
            cm: &mut cm,
            errors: &mut errors,
            time: &time,
        };
        let mut module = PingModule::new();

        assert_eq!(module.terminal_command(&mut ctx, &["other"]), CommandResult::Unknown);
        assert_eq!(
            module.terminal_command(&mut ctx, &["ping"]),
            CommandResult::NotEnoughArguments
        );
        assert_eq!(
            module.terminal_command(&mut ctx, &["ping", "abc"]),
            CommandResult::WrongArgument
        );
    }

    #[test]
    fn test_ping_loopback_roundtrip() {
        let (mut cm, mut errors, time) = ctx_parts();
        let mut module = PingModule::new();

        // Ping ourselves: the loopback path answers immediately
        {
            let mut ctx = ModuleContext {
                own_id: NodeId(1),
                now_ds: 5,
                cm: &mut cm,
                errors: &mut errors,
                time: &time,
            };
            assert!(module.send_ping(&mut ctx, NodeId(1)));
        }
        let events = cm.take_events();
        let action = events
            .iter()
            .find_map(|e| match e {
                crate::conn::ConnectionEvent::MeshMessageReceived {
                    packet: crate::proto::conn::ConnPacket::ModuleAction(a),
                    ..
                } => Some(a.clone()),
                _ => None,
            })
            .unwrap();

        // Deliver the ping; the module answers with a pong
        {
            let mut ctx = ModuleContext {
                own_id: NodeId(1),
                now_ds: 7,
                cm: &mut cm,
                errors: &mut errors,
                time: &time,
            };
            module.mesh_message_received(&mut ctx, &action);
        }
        let events = cm.take_events();
        let response = events
            .iter()
            .find_map(|e| match e {
                crate::conn::ConnectionEvent::MeshMessageReceived {
                    packet: crate::proto::conn::ConnPacket::ModuleAction(a),
                    ..
                } => Some(a.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(response.action_kind, ModuleActionKind::ActionResponse);

        {
            let mut ctx = ModuleContext {
                own_id: NodeId(1),
                now_ds: 9,
                cm: &mut cm,
                errors: &mut errors,
                time: &time,
            };
            module.mesh_message_received(&mut ctx, &response);
        }
        assert_eq!(module.last_rtt_ds(), Some(4));
    }

    #[test]
    fn test_config_roundtrip() {
        let mut module = PingModule::new();
        module.set_active(false);
        let blob = module.config_blob().unwrap();

        let mut restored = PingModule::new();
        assert!(restored.is_active());
        restored.load_config_blob(&blob);
        assert!(!restored.is_active());
    }
}
