// Packet send queue - byte ring with priority lanes
//
// Each connection owns four lanes, drained vital-first. A lane is a
// circular byte buffer of variable-length records:
//
// ```text
// [len:u16][delivery:u8][priority:u8][characteristicHandle:u16][payload...]
// ```
//
// Records never wrap: when a record would cross the end of the buffer the
// writer drops a skip marker and places the record at the start. Head and
// tail only coincide when the lane is empty.

use thiserror::Error;

/// Record header: len(2) delivery(1) priority(1) characteristicHandle(2)
const RECORD_HEADER_SIZE: usize = 6;

/// Marker telling the reader to wrap to the buffer start
const SKIP_MARKER: u16 = 0xFFFF;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue full")]
    Full,

    #[error("packet of {0} bytes can never fit this queue")]
    TooBig(usize),
}

/// How a record should leave the radio
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum DeliveryOption {
    /// Unacknowledged write command
    WriteCommand = 1,
    /// Acknowledged write request
    WriteRequest = 2,
    Notification = 3,
}

impl DeliveryOption {
    fn from_u8(value: u8) -> DeliveryOption {
        match value {
            2 => DeliveryOption::WriteRequest,
            3 => DeliveryOption::Notification,
            _ => DeliveryOption::WriteCommand,
        }
    }

    pub fn is_reliable(&self) -> bool {
        matches!(self, DeliveryOption::WriteRequest)
    }
}

/// Drain order: vital first, then high, medium, low
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum DeliveryPriority {
    Vital = 0,
    High = 1,
    Medium = 2,
    Low = 3,
}

impl DeliveryPriority {
    pub const ALL: [DeliveryPriority; 4] = [
        DeliveryPriority::Vital,
        DeliveryPriority::High,
        DeliveryPriority::Medium,
        DeliveryPriority::Low,
    ];

    fn index(&self) -> usize {
        *self as usize
    }
}

/// Per-record metadata stored next to the payload
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketMeta {
    pub delivery: DeliveryOption,
    pub priority: DeliveryPriority,
    pub characteristic_handle: u16,
}

/// Borrowed view of the record at the head of a lane
#[derive(Debug, PartialEq, Eq)]
pub struct QueuedPacket<'a> {
    pub meta: PacketMeta,
    pub payload: &'a [u8],
}

/// One circular lane
pub struct PacketQueue {
    buffer: Vec<u8>,
    read: usize,
    write: usize,
    num_elements: usize,
}

impl PacketQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: vec![0; capacity],
            read: 0,
            write: 0,
            num_elements: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.num_elements
    }

    pub fn is_empty(&self) -> bool {
        self.num_elements == 0
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn clean(&mut self) {
        self.read = 0;
        self.write = 0;
        self.num_elements = 0;
    }

    pub fn put(&mut self, meta: PacketMeta, payload: &[u8]) -> Result<(), QueueError> {
        let needed = RECORD_HEADER_SIZE + payload.len();
        if needed > self.buffer.len() {
            return Err(QueueError::TooBig(payload.len()));
        }
        let cap = self.buffer.len();

        let target = if self.is_empty() {
            self.read = 0;
            self.write = 0;
            0
        } else if self.write >= self.read {
            let tail = cap - self.write;
            if tail >= needed {
                self.write
            } else if self.read > needed {
                // Mark the dead tail so the reader wraps with us
                if tail >= 2 {
                    self.buffer[self.write..self.write + 2]
                        .copy_from_slice(&SKIP_MARKER.to_le_bytes());
                }
                0
            } else {
                return Err(QueueError::Full);
            }
        } else {
            // Already wrapped; strict inequality keeps head and tail apart
            if self.read - self.write > needed {
                self.write
            } else {
                return Err(QueueError::Full);
            }
        };

        let len = payload.len() as u16;
        self.buffer[target..target + 2].copy_from_slice(&len.to_le_bytes());
        self.buffer[target + 2] = meta.delivery as u8;
        self.buffer[target + 3] = meta.priority as u8;
        self.buffer[target + 4..target + 6]
            .copy_from_slice(&meta.characteristic_handle.to_le_bytes());
        self.buffer[target + RECORD_HEADER_SIZE..target + needed].copy_from_slice(payload);

        self.write = target + needed;
        self.num_elements += 1;
        Ok(())
    }

    /// Head position with wrap markers resolved
    fn resolved_read(&self) -> usize {
        let cap = self.buffer.len();
        if cap - self.read < 2 {
            return 0;
        }
        let marker = u16::from_le_bytes([self.buffer[self.read], self.buffer[self.read + 1]]);
        if marker == SKIP_MARKER && self.write < self.read {
            0
        } else {
            self.read
        }
    }

    pub fn peek(&self) -> Option<QueuedPacket<'_>> {
        if self.is_empty() {
            return None;
        }
        let pos = self.resolved_read();
        let len = u16::from_le_bytes([self.buffer[pos], self.buffer[pos + 1]]) as usize;
        let meta = PacketMeta {
            delivery: DeliveryOption::from_u8(self.buffer[pos + 2]),
            priority: match self.buffer[pos + 3] {
                0 => DeliveryPriority::Vital,
                1 => DeliveryPriority::High,
                2 => DeliveryPriority::Medium,
                _ => DeliveryPriority::Low,
            },
            characteristic_handle: u16::from_le_bytes([self.buffer[pos + 4], self.buffer[pos + 5]]),
        };
        Some(QueuedPacket {
            meta,
            payload: &self.buffer[pos + RECORD_HEADER_SIZE..pos + RECORD_HEADER_SIZE + len],
        })
    }

    pub fn discard_next(&mut self) {
        if self.is_empty() {
            return;
        }
        let pos = self.resolved_read();
        let len = u16::from_le_bytes([self.buffer[pos], self.buffer[pos + 1]]) as usize;
        self.read = pos + RECORD_HEADER_SIZE + len;
        self.num_elements -= 1;
        if self.num_elements == 0 {
            self.read = 0;
            self.write = 0;
        }
    }
}

/// The four lanes of one connection
pub struct PrioritySendQueue {
    lanes: [PacketQueue; 4],
}

impl PrioritySendQueue {
    pub fn new(bytes_per_lane: usize) -> Self {
        Self {
            lanes: [
                PacketQueue::new(bytes_per_lane),
                PacketQueue::new(bytes_per_lane),
                PacketQueue::new(bytes_per_lane),
                PacketQueue::new(bytes_per_lane),
            ],
        }
    }

    pub fn put(
        &mut self,
        priority: DeliveryPriority,
        delivery: DeliveryOption,
        characteristic_handle: u16,
        payload: &[u8],
    ) -> Result<(), QueueError> {
        let meta = PacketMeta {
            delivery,
            priority,
            characteristic_handle,
        };
        self.lanes[priority.index()].put(meta, payload)
    }

    /// The record that must leave next, observing strict lane order
    pub fn peek(&self) -> Option<QueuedPacket<'_>> {
        for priority in DeliveryPriority::ALL {
            let lane = &self.lanes[priority.index()];
            if !lane.is_empty() {
                return lane.peek();
            }
        }
        None
    }

    pub fn discard_next(&mut self) {
        for priority in DeliveryPriority::ALL {
            let lane = &mut self.lanes[priority.index()];
            if !lane.is_empty() {
                lane.discard_next();
                return;
            }
        }
    }

    pub fn pending_packets(&self) -> usize {
        self.lanes.iter().map(|l| l.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.lanes.iter().all(|l| l.is_empty())
    }

    pub fn lane_len(&self, priority: DeliveryPriority) -> usize {
        self.lanes[priority.index()].len()
    }

    pub fn clean(&mut self) {
        for lane in self.lanes.iter_mut() {
            lane.clean();
        }
    }
}
