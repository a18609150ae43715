//! Presence tracking: who is connected to a room and which color they wear.
//!
//! Colors come from a fixed palette. Slots are handed out from a free-list
//! and returned on leave, so colors only collide once a room holds more
//! members than the palette has entries.
//!
//! ```text
//! join(Alice) ─► slot 0  #ff6b9d
//! join(Bob)   ─► slot 1  #4ecdc4
//! leave(Alice)   slot 0 released
//! join(Carol) ─► slot 0  #ff6b9d   (reused, no clash with Bob)
//! ```

use crate::protocol::ConnectionId;

/// Palette used when none is configured.
pub const DEFAULT_PALETTE: [&str; 6] = [
    "#ff6b9d", "#4ecdc4", "#45b7d1", "#96ceb4", "#ff8a5c", "#6a7dff",
];

/// Display name used when a client joins without one.
pub const ANONYMOUS: &str = "Anonymous";

/// Palette slot allocator.
///
/// Tracks how many members hold each slot. `acquire` picks the least-used
/// slot, lowest index first, which is the free-list head while any slot is
/// free.
#[derive(Debug, Clone)]
pub struct ColorSlots {
    palette: Vec<String>,
    holders: Vec<usize>,
}

impl ColorSlots {
    pub fn new(palette: Vec<String>) -> Self {
        let palette = if palette.is_empty() {
            DEFAULT_PALETTE.iter().map(|c| c.to_string()).collect()
        } else {
            palette
        };
        let holders = vec![0; palette.len()];
        Self { palette, holders }
    }

    /// Take a slot and return its index.
    pub fn acquire(&mut self) -> usize {
        let slot = self
            .holders
            .iter()
            .enumerate()
            .min_by_key(|(idx, count)| (**count, *idx))
            .map(|(idx, _)| idx)
            .unwrap_or(0);
        self.holders[slot] += 1;
        slot
    }

    /// Give a slot back. Releasing an unheld slot is ignored.
    pub fn release(&mut self, slot: usize) {
        if let Some(count) = self.holders.get_mut(slot) {
            *count = count.saturating_sub(1);
        }
    }

    pub fn color(&self, slot: usize) -> &str {
        &self.palette[slot % self.palette.len()]
    }

    /// Number of slots with no holder.
    pub fn free_count(&self) -> usize {
        self.holders.iter().filter(|c| **c == 0).count()
    }

    pub fn len(&self) -> usize {
        self.palette.len()
    }

    pub fn is_empty(&self) -> bool {
        self.palette.is_empty()
    }
}

impl Default for ColorSlots {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

/// One live member of a room. Lives exactly as long as its connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEntry {
    pub connection_id: ConnectionId,
    pub username: String,
    pub color: String,
    slot: usize,
}

impl PresenceEntry {
    pub fn slot(&self) -> usize {
        self.slot
    }
}

/// The set of connections joined to one room, in join order.
#[derive(Debug, Clone, Default)]
pub struct PresenceRoster {
    entries: Vec<PresenceEntry>,
    slots: ColorSlots,
}

impl PresenceRoster {
    pub fn new(palette: Vec<String>) -> Self {
        Self {
            entries: Vec::new(),
            slots: ColorSlots::new(palette),
        }
    }

    /// Add a connection. Joining twice returns the existing entry.
    pub fn join(&mut self, connection_id: ConnectionId, username: &str) -> PresenceEntry {
        if let Some(existing) = self.get(&connection_id) {
            return existing.clone();
        }

        let username = match username.trim() {
            "" => ANONYMOUS.to_string(),
            name => name.to_string(),
        };
        let slot = self.slots.acquire();
        let entry = PresenceEntry {
            connection_id,
            username,
            color: self.slots.color(slot).to_string(),
            slot,
        };
        self.entries.push(entry.clone());
        entry
    }

    /// Remove a connection and release its color. `None` if it was not here.
    pub fn leave(&mut self, connection_id: &ConnectionId) -> Option<PresenceEntry> {
        let idx = self
            .entries
            .iter()
            .position(|e| &e.connection_id == connection_id)?;
        let entry = self.entries.remove(idx);
        self.slots.release(entry.slot);
        Some(entry)
    }

    pub fn get(&self, connection_id: &ConnectionId) -> Option<&PresenceEntry> {
        self.entries.iter().find(|e| &e.connection_id == connection_id)
    }

    pub fn contains(&self, connection_id: &ConnectionId) -> bool {
        self.get(connection_id).is_some()
    }

    /// Display names in join order, as sent in presence updates.
    pub fn usernames(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.username.clone()).collect()
    }

    pub fn entries(&self) -> &[PresenceEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn free_colors(&self) -> usize {
        self.slots.free_count()
    }
}
