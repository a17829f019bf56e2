// Packet statistics - sparse fixed table observing the traffic mix

/// Identifies one class of packets. Module fields stay zero for
/// non-module messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketStatKey {
    pub message_type: u8,
    pub module_id: u16,
    pub action_kind: u8,
    pub request_handle: u8,
}

impl PacketStatKey {
    pub fn for_message_type(message_type: u8) -> Self {
        Self {
            message_type,
            module_id: 0,
            action_kind: 0,
            request_handle: 0,
        }
    }
}

const PACKET_STAT_SLOTS: usize = 40;

/// Fixed-capacity counter table; once full, new packet classes are ignored
pub struct PacketStats {
    slots: [Option<(PacketStatKey, u32)>; PACKET_STAT_SLOTS],
}

impl PacketStats {
    pub fn new() -> Self {
        Self {
            slots: [None; PACKET_STAT_SLOTS],
        }
    }

    pub fn record(&mut self, key: PacketStatKey) {
        for slot in self.slots.iter_mut() {
            match slot {
                Some((k, count)) if *k == key => {
                    *count = count.saturating_add(1);
                    return;
                }
                None => {
                    *slot = Some((key, 1));
                    return;
                }
                _ => {}
            }
        }
    }

    pub fn count(&self, key: &PacketStatKey) -> u32 {
        self.slots
            .iter()
            .flatten()
            .find(|(k, _)| k == key)
            .map(|(_, c)| *c)
            .unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(PacketStatKey, u32)> {
        self.slots.iter().flatten()
    }

    pub fn distinct_keys(&self) -> usize {
        self.slots.iter().flatten().count()
    }
}

impl Default for PacketStats {
    fn default() -> Self {
        Self::new()
    }
}
