// Module contract - how application features plug into the core
//
// A module is addressed by a 16-bit id carried in the module envelope.
// Vendor modules use ids with a non-zero high byte as their vendor prefix;
// ids below 0x0100 are reserved for standard modules. Modules receive the
// core's lifecycle hooks and talk to the mesh exclusively through the
// context handed into each hook.

use crate::conn::{ConnectionEvent, ConnectionManager, DeliveryPriority};
use crate::proto::adv::MeshAdvPacket;
use crate::proto::conn::{AdvInfo, ConnPacket, ModuleAction, ModuleActionKind};
use crate::proto::NodeId;
use crate::util::{DsTime, ErrorLog, GlobalTime};

/// 16-bit module address. High byte non-zero = vendor prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ModuleId(pub u16);

impl ModuleId {
    pub const NODE: ModuleId = ModuleId(0);
    pub const PING: ModuleId = ModuleId(10);

    pub fn is_vendor(&self) -> bool {
        self.0 >= 0x0100
    }

    pub fn vendor_prefix(&self) -> Option<u8> {
        self.is_vendor().then(|| (self.0 >> 8) as u8)
    }
}

/// Result of handling a terminal command
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandResult {
    Success,
    Unknown,
    WrongArgument,
    NotEnoughArguments,
}

/// What a module hook may touch while it runs
pub struct ModuleContext<'a> {
    pub own_id: NodeId,
    pub now_ds: DsTime,
    pub cm: &'a mut ConnectionManager,
    pub errors: &'a mut ErrorLog,
    pub time: &'a GlobalTime,
}

impl ModuleContext<'_> {
    /// Send a module envelope through the mesh. Returns whether the
    /// message was queued.
    pub fn send_module_action(
        &mut self,
        receiver: NodeId,
        module_id: ModuleId,
        action_kind: ModuleActionKind,
        request_handle: u8,
        data: &[u8],
    ) -> bool {
        let packet = ConnPacket::ModuleAction(ModuleAction {
            sender: self.own_id,
            receiver,
            module_id: module_id.0,
            action_kind,
            request_handle,
            data: data.to_vec(),
        });
        self.cm.send_mesh_message(
            &packet.encode(),
            DeliveryPriority::Low,
            true,
            self.errors,
        )
    }
}

/// Hooks every module can implement; all of them default to no-ops.
///
/// Hooks must stay side-effect-free for links that have not finished their
/// handshake; the core only dispatches mesh messages from handshaked links,
/// but `mesh_connection_changed` sees every lifecycle event.
pub trait Module {
    fn id(&self) -> ModuleId;

    fn name(&self) -> &'static str;

    fn is_active(&self) -> bool {
        true
    }

    fn set_active(&mut self, _active: bool) {}

    /// Called after the stored configuration was applied (or defaults were
    /// kept when none was stored)
    fn configuration_loaded(&mut self, _ctx: &mut ModuleContext) {}

    fn timer_event(&mut self, _ctx: &mut ModuleContext, _passed_ds: u16) {}

    /// First module returning something other than `Unknown` wins
    fn terminal_command(&mut self, _ctx: &mut ModuleContext, _args: &[&str]) -> CommandResult {
        CommandResult::Unknown
    }

    /// A trigger action or action response addressed to this module
    fn mesh_message_received(&mut self, _ctx: &mut ModuleContext, _action: &ModuleAction) {}

    fn mesh_connection_changed(&mut self, _ctx: &mut ModuleContext, _event: &ConnectionEvent) {}

    fn adv_report_received(&mut self, _ctx: &mut ModuleContext, _packet: &MeshAdvPacket, _rssi: i8) {
    }

    /// A scan result relayed to us through the mesh
    fn adv_info_received(&mut self, _ctx: &mut ModuleContext, _info: &AdvInfo) {}

    /// Serialized configuration for persistence; None = nothing to store
    fn config_blob(&self) -> Option<Vec<u8>> {
        None
    }

    /// Apply a previously stored configuration blob
    fn load_config_blob(&mut self, _blob: &[u8]) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vendor_prefix() {
        assert!(!ModuleId::PING.is_vendor());
        assert_eq!(ModuleId::PING.vendor_prefix(), None);

        let vendor = ModuleId(0xAB01);
        assert!(vendor.is_vendor());
        assert_eq!(vendor.vendor_prefix(), Some(0xAB));
    }
}
