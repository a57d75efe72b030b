//! Ordered packet buffer keyed by sequence number.
//!
//! A session keeps two of these: the send buffer (packets transmitted but
//! not yet cumulatively acknowledged) and the receive buffer (packets
//! received but not yet released to the application, including
//! out-of-order arrivals waiting for a gap to fill).
//!
//! Entries are held in a [`BTreeMap`], so iteration is always in sequence
//! order and the operations the session needs are O(log n).

use std::collections::BTreeMap;
use std::time::Instant;

use crate::packet::DataPacket;

/// One buffered packet.
#[derive(Debug, Clone)]
pub struct BufferEntry {
    pub packet: DataPacket,
    /// When the packet was last put on the wire (or received, for the
    /// receive buffer).
    pub last_retransmit: Instant,
}

/// Sequence-ordered packet store.
#[derive(Debug, Default)]
pub struct PacketBuffer {
    entries: BTreeMap<u32, BufferEntry>,
}

impl PacketBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `packet` stamped with `now`.
    ///
    /// Returns `false` and leaves the existing entry untouched if a packet
    /// with the same sequence number is already buffered.
    pub fn insert(&mut self, packet: DataPacket, now: Instant) -> bool {
        use std::collections::btree_map::Entry;

        match self.entries.entry(packet.seqno) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(BufferEntry {
                    packet,
                    last_retransmit: now,
                });
                true
            }
        }
    }

    /// Drop every entry whose sequence number is strictly below
    /// `threshold`.  Returns how many were dropped.
    pub fn remove_below(&mut self, threshold: u32) -> usize {
        let kept = self.entries.split_off(&threshold);
        let dropped = self.entries.len();
        self.entries = kept;
        dropped
    }

    /// Remove and return the lowest-sequence entry.
    pub fn remove_first(&mut self) -> Option<BufferEntry> {
        self.entries.pop_first().map(|(_, entry)| entry)
    }

    pub fn contains(&self, seqno: u32) -> bool {
        self.entries.contains_key(&seqno)
    }

    /// Lowest-sequence entry, if any.
    pub fn first(&self) -> Option<&BufferEntry> {
        self.entries.values().next()
    }

    /// Entries in ascending sequence order.
    pub fn iter(&self) -> impl Iterator<Item = &BufferEntry> {
        self.entries.values()
    }

    /// Mutable entries in ascending sequence order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut BufferEntry> {
        self.entries.values_mut()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
