// Neighbor ring - the last JOIN_ME beacon of every candidate partner
//
// Fixed ring of ten entries, one live entry per sender. A newer beacon
// overwrites the older one; entries past the staleness limit are fair game
// for eviction and invisible to the partner selection.

use crate::ble::BleGapAddr;
use crate::proto::adv::JoinMePayload;
use crate::proto::NodeId;
use crate::util::DsTime;

pub const JOIN_ME_BUFFER_SLOTS: usize = 10;

/// One remembered beacon
#[derive(Clone, Copy, Debug)]
pub struct NeighborEntry {
    pub payload: JoinMePayload,
    pub rssi: i8,
    pub received_time_ds: DsTime,
    pub address: BleGapAddr,
}

impl NeighborEntry {
    pub fn sender(&self) -> NodeId {
        self.payload.sender
    }

    pub fn age_ds(&self, now_ds: DsTime) -> DsTime {
        now_ds.saturating_sub(self.received_time_ds)
    }
}

pub struct NeighborRing {
    slots: [Option<NeighborEntry>; JOIN_ME_BUFFER_SLOTS],
    max_age_ds: DsTime,
}

impl NeighborRing {
    pub fn new(max_age_ds: DsTime) -> Self {
        Self {
            slots: [None; JOIN_ME_BUFFER_SLOTS],
            max_age_ds,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_age_ds(&self) -> DsTime {
        self.max_age_ds
    }

    /// Store a received beacon. Returns false when the ring is full of
    /// fresh entries and the beacon had to be dropped.
    pub fn upsert(&mut self, entry: NeighborEntry, now_ds: DsTime) -> bool {
        // Same sender: newer beacon wins
        if let Some(slot) = self
            .slots
            .iter_mut()
            .flatten()
            .find(|e| e.sender() == entry.sender())
        {
            *slot = entry;
            return true;
        }
        if let Some(slot) = self.slots.iter_mut().find(|s| s.is_none()) {
            *slot = Some(entry);
            return true;
        }
        // Evict the stalest entry past the age limit
        let evict = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| {
                s.as_ref()
                    .map(|e| e.age_ds(now_ds) > self.max_age_ds)
                    .unwrap_or(false)
            })
            .max_by_key(|(_, s)| s.as_ref().unwrap().age_ds(now_ds))
            .map(|(i, _)| i);
        match evict {
            Some(i) => {
                self.slots[i] = Some(entry);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, sender: NodeId) -> Option<&NeighborEntry> {
        self.slots.iter().flatten().find(|e| e.sender() == sender)
    }

    /// Entries young enough to be considered by partner selection
    pub fn fresh(&self, now_ds: DsTime) -> impl Iterator<Item = &NeighborEntry> {
        let max_age = self.max_age_ds;
        self.slots
            .iter()
            .flatten()
            .filter(move |e| e.age_ds(now_ds) <= max_age)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NeighborEntry> {
        self.slots.iter().flatten()
    }

    /// Drop every entry past the age limit
    pub fn purge_stale(&mut self, now_ds: DsTime) {
        for slot in self.slots.iter_mut() {
            if let Some(entry) = slot {
                if entry.age_ds(now_ds) > self.max_age_ds {
                    *slot = None;
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.slots = [None; JOIN_ME_BUFFER_SLOTS];
    }
}
