//! Payload history for change detection.
//!
//! Every recognized packet type of the saved range owns a fixed region of one
//! shared byte arena. The region is reserved on the first occurrence of the
//! packet and keeps its size until [`HistoryStore::reset`].

use crate::error::{Error, Result};
use crate::protocol::{Packet, Source, TypeRange};

/// Dense index of a history slot.
pub type SlotId = usize;

#[derive(Debug, Clone, Copy)]
struct Slot {
    offset: usize,
    len: usize,
}

#[derive(Debug)]
pub struct HistoryStore {
    range: TypeRange,
    arena: Vec<u8>,
    capacity: usize,
    slots: Vec<Option<Slot>>,
}

impl HistoryStore {
    pub fn new(range: TypeRange, capacity: usize) -> Self {
        Self {
            range,
            arena: Vec::with_capacity(capacity),
            capacity,
            slots: vec![None; 2 * range.width()],
        }
    }

    /// Slot of a packet, `None` for types outside the saved range or foreign sources.
    pub fn index(&self, packet: &Packet) -> Option<SlotId> {
        if !self.range.contains(packet.packet_type) {
            return None;
        }
        let half = match packet.source {
            Source::HeatPump => 0,
            Source::MainController => self.range.width(),
            Source::AuxiliaryController | Source::Unknown(_) => return None,
        };
        Some(usize::from(packet.packet_type - self.range.first) + half)
    }

    /// Stores the payload, reserving arena space on the first occurrence.
    pub fn save(&mut self, packet: &Packet) -> Result<()> {
        let Some(id) = self.index(packet) else {
            return Ok(());
        };
        if packet.payload.is_empty() {
            return Ok(());
        }
        let slot = match self.slots[id] {
            Some(slot) => slot,
            None => {
                let available = self.capacity - self.arena.len();
                if packet.payload.len() > available {
                    return Err(Error::HistoryExhausted {
                        packet_type: packet.packet_type,
                        required: packet.payload.len(),
                        available,
                    });
                }
                let slot = Slot {
                    offset: self.arena.len(),
                    len: packet.payload.len(),
                };
                self.arena.extend_from_slice(&packet.payload);
                self.slots[id] = Some(slot);
                log::debug!(
                    "History slot {} reserved for {:?} type {:#04X}: {} bytes at {}",
                    id,
                    packet.source,
                    packet.packet_type,
                    slot.len,
                    slot.offset
                );
                return Ok(());
            }
        };
        let len = slot.len.min(packet.payload.len());
        self.arena[slot.offset..slot.offset + len].copy_from_slice(&packet.payload[..len]);
        Ok(())
    }

    /// Whether the payload differs from history. Assumes new data whenever
    /// the comparison is not trustworthy.
    pub fn changed(&self, packet: &Packet) -> bool {
        let Some(Some(slot)) = self.index(packet).map(|id| self.slots[id]) else {
            return true;
        };
        if slot.len != packet.payload.len() {
            return true;
        }
        self.arena[slot.offset..slot.offset + slot.len] != packet.payload[..]
    }

    pub fn reset(&mut self) {
        self.arena.clear();
        self.slots.iter_mut().for_each(|slot| *slot = None);
        log::debug!("History cleared");
    }

    /// Arena bytes in use.
    pub fn used(&self) -> usize {
        self.arena.len()
    }

    pub fn slots(&self) -> usize {
        self.slots.len()
    }
}
