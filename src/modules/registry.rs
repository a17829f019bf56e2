// Module registry - owns the modules and fans the core's events out
//
// Generic envelope handling (config get/set, activation) lives here so
// individual modules only deal with their own trigger actions.

use super::module::{CommandResult, Module, ModuleContext, ModuleId};
use crate::proto::conn::{ModuleAction, ModuleActionKind};
use crate::storage::{RecordId, RecordStore};
use crate::util::ErrorCode;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Status byte of a config response to a SET_CONFIG request
const CONFIG_STORE_OK: u8 = 0;
const CONFIG_STORE_FAILED: u8 = 1;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ModuleError {
    #[error("module id {0:?} already registered")]
    DuplicateId(ModuleId),
}

pub struct ModuleRegistry {
    modules: Vec<Box<dyn Module>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self {
            modules: Vec::new(),
        }
    }

    pub fn register(&mut self, module: Box<dyn Module>) -> Result<(), ModuleError> {
        if self.modules.iter().any(|m| m.id() == module.id()) {
            return Err(ModuleError::DuplicateId(module.id()));
        }
        debug!(module = module.name(), "module registered");
        self.modules.push(module);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn get_mut(&mut self, id: ModuleId) -> Option<&mut Box<dyn Module>> {
        self.modules.iter_mut().find(|m| m.id() == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Box<dyn Module>> {
        self.modules.iter()
    }

    /// Apply stored configurations and fire `configuration_loaded`
    pub fn load_configurations(&mut self, store: &dyn RecordStore, ctx: &mut ModuleContext) {
        for module in self.modules.iter_mut() {
            if let Some(blob) = store.load(RecordId::for_module_config(module.id().0)) {
                module.load_config_blob(&blob);
            }
            module.configuration_loaded(ctx);
        }
    }

    pub fn timer_all(&mut self, ctx: &mut ModuleContext, passed_ds: u16) {
        for module in self.modules.iter_mut() {
            if module.is_active() {
                module.timer_event(ctx, passed_ds);
            }
        }
    }

    pub fn terminal_all(&mut self, ctx: &mut ModuleContext, args: &[&str]) -> CommandResult {
        for module in self.modules.iter_mut() {
            let result = module.terminal_command(ctx, args);
            if result != CommandResult::Unknown {
                return result;
            }
        }
        CommandResult::Unknown
    }

    pub fn connection_changed_all(
        &mut self,
        ctx: &mut ModuleContext,
        event: &crate::conn::ConnectionEvent,
    ) {
        for module in self.modules.iter_mut() {
            if module.is_active() {
                module.mesh_connection_changed(ctx, event);
            }
        }
    }

    pub fn adv_report_all(
        &mut self,
        ctx: &mut ModuleContext,
        packet: &crate::proto::adv::MeshAdvPacket,
        rssi: i8,
    ) {
        for module in self.modules.iter_mut() {
            if module.is_active() {
                module.adv_report_received(ctx, packet, rssi);
            }
        }
    }

    pub fn adv_info_all(&mut self, ctx: &mut ModuleContext, info: &crate::proto::conn::AdvInfo) {
        for module in self.modules.iter_mut() {
            if module.is_active() {
                module.adv_info_received(ctx, info);
            }
        }
    }

    /// Dispatch a received module envelope. Config handling is generic;
    /// actions go to the addressed module.
    pub fn handle_action(
        &mut self,
        ctx: &mut ModuleContext,
        store: &mut dyn RecordStore,
        action: &ModuleAction,
    ) {
        let Some(module) = self.modules.iter_mut().find(|m| m.id().0 == action.module_id) else {
            trace!(module_id = action.module_id, "message for unknown module");
            return;
        };
        match action.action_kind {
            ModuleActionKind::SetConfig => {
                module.load_config_blob(&action.data);
                // The new configuration is active either way; the response
                // status tells the sender whether it survives a reboot
                let mut status = CONFIG_STORE_OK;
                if let Some(blob) = module.config_blob() {
                    if let Err(err) =
                        store.save(RecordId::for_module_config(action.module_id), &blob)
                    {
                        warn!(module = module.name(), %err, "module configuration not persisted");
                        ctx.errors.push_error(
                            ErrorCode::WarnRecordStorageSaveFailed,
                            action.module_id as u32,
                            ctx.time.now_sec(),
                        );
                        status = CONFIG_STORE_FAILED;
                    }
                }
                module.configuration_loaded(ctx);
                let module_id = module.id();
                ctx.send_module_action(
                    action.sender,
                    module_id,
                    ModuleActionKind::ConfigResponse,
                    action.request_handle,
                    &[status],
                );
            }
            ModuleActionKind::GetConfig => {
                let blob = module.config_blob().unwrap_or_default();
                let module_id = module.id();
                ctx.send_module_action(
                    action.sender,
                    module_id,
                    ModuleActionKind::ConfigResponse,
                    action.request_handle,
                    &blob,
                );
            }
            ModuleActionKind::SetActive => {
                let active = action.data.first().copied().unwrap_or(0) != 0;
                module.set_active(active);
            }
            ModuleActionKind::TriggerAction | ModuleActionKind::ActionResponse => {
                if module.is_active() {
                    module.mesh_message_received(ctx, action);
                }
            }
            ModuleActionKind::ConfigResponse => {
                module.mesh_message_received(ctx, action);
            }
        }
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}
