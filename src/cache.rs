//! Per-sender packet cache: a 256-slot sliding window over a 32-bit
//! packet-id space (§3, §4.B, I7).
//!
//! Adapted from the teacher's `pool::PacketPool` (capacity-bounded,
//! handle-addressed slab of packets) but reshaped into a ring indexed by
//! `packet_id mod capacity` rather than an open slab: the window here
//! always covers a *contiguous* range of ids starting at `first()`, so a
//! fixed-size ring with wraparound eviction is the natural structure —
//! the same shape gibber's original C receiver uses for its window array.

use crate::timer::TimerHandle;
use crate::wire::{diff, Packet, PacketId};

/// One cache slot: either a held packet, or a known gap with (optionally)
/// an armed repair-request timer.
#[derive(Debug, Default)]
pub struct Slot {
    pub packet: Option<Packet>,
    pub repair_timer: Option<TimerHandle>,
}

impl Slot {
    fn is_gap(&self) -> bool {
        self.packet.is_none()
    }
}

/// A sliding window of `capacity` slots, keyed by packet-id. Ids below
/// `first` are considered already released and no longer retrievable;
/// ids at or beyond `first + capacity` are out of range until the window
/// slides forward.
pub struct PacketCache {
    capacity: usize,
    /// Oldest packet-id still represented in the window.
    first: PacketId,
    slots: Vec<Slot>,
}

/// Where a packet-id falls relative to the cache window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Within `[first, first + capacity)` — insertable.
    InWindow,
    /// Behind `first` — already released, treat as a duplicate.
    Duplicate,
    /// At or beyond `first + capacity` — drop as out of range.
    OutOfRange,
}

impl PacketCache {
    pub fn new(capacity: usize, first: PacketId) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, Slot::default);
        PacketCache {
            capacity,
            first,
            slots,
        }
    }

    pub fn first(&self) -> PacketId {
        self.first
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn index(&self, id: PacketId) -> usize {
        (id as usize) % self.capacity
    }

    pub fn placement(&self, id: PacketId) -> Placement {
        let offset = diff(self.first, id);
        if offset < 0 {
            Placement::Duplicate
        } else if (offset as usize) < self.capacity {
            Placement::InWindow
        } else {
            Placement::OutOfRange
        }
    }

    /// Insert a packet at `id`. Returns `false` (no-op) if `id` is not
    /// currently `InWindow`.
    pub fn insert(&mut self, id: PacketId, packet: Packet) -> bool {
        if self.placement(id) != Placement::InWindow {
            return false;
        }
        let idx = self.index(id);
        self.slots[idx].packet = Some(packet);
        self.slots[idx].repair_timer = None;
        true
    }

    pub fn get(&self, id: PacketId) -> Option<&Packet> {
        if self.placement(id) != Placement::InWindow {
            return None;
        }
        self.slots[self.index(id)].packet.as_ref()
    }

    pub fn contains(&self, id: PacketId) -> bool {
        self.get(id).is_some()
    }

    /// Record a known gap at `id` (nothing received yet) and arm its
    /// repair-request timer handle for later cancellation.
    pub fn mark_gap(&mut self, id: PacketId, timer: TimerHandle) {
        if self.placement(id) != Placement::InWindow {
            return;
        }
        let idx = self.index(id);
        self.slots[idx].packet = None;
        self.slots[idx].repair_timer = Some(timer);
    }

    pub fn repair_timer(&self, id: PacketId) -> Option<TimerHandle> {
        if self.placement(id) != Placement::InWindow {
            return None;
        }
        self.slots[self.index(id)].repair_timer
    }

    pub fn clear_repair_timer(&mut self, id: PacketId) {
        if self.placement(id) == Placement::InWindow {
            self.slots[self.index(id)].repair_timer = None;
        }
    }

    pub fn is_gap(&self, id: PacketId) -> bool {
        match self.placement(id) {
            Placement::InWindow => self.slots[self.index(id)].is_gap(),
            _ => false,
        }
    }

    /// Advance the window's start to `new_first`, wiping every slot that
    /// falls behind it (those packets have been released and are no
    /// longer needed — any armed repair timer on them is returned so the
    /// caller can cancel it on the scheduler).
    pub fn advance_to(&mut self, new_first: PacketId) -> Vec<TimerHandle> {
        let mut cancelled = Vec::new();
        let advance = diff(self.first, new_first);
        if advance <= 0 {
            return cancelled;
        }
        let advance = advance as usize;
        if advance >= self.capacity {
            // Wiping the whole window — collect every armed timer first.
            for slot in &mut self.slots {
                if let Some(h) = slot.repair_timer.take() {
                    cancelled.push(h);
                }
                slot.packet = None;
            }
        } else {
            for offset in 0..advance {
                let id = self.first.wrapping_add(offset as u32);
                let idx = self.index(id);
                if let Some(h) = self.slots[idx].repair_timer.take() {
                    cancelled.push(h);
                }
                self.slots[idx].packet = None;
            }
        }
        self.first = new_first;
        cancelled
    }

    /// Number of occupied (non-gap) slots currently in the window.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.packet.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
