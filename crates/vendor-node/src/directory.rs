//! Node directory: a bounded cache of recently seen peers.
//!
//! The directory is a fixed arena of slots allocated once at construction.
//! It is not synchronized; share it as `Arc<parking_lot::Mutex<NodeDirectory>>`.

use crate::error::VendorError;
use serde::Serialize;
use std::time::Duration;
use vendor_protocol::{MeshAddress, NodeRecord, SerialNumber};

/// Default number of slots.
pub const DEFAULT_DIRECTORY_CAPACITY: usize = 10;
/// Default age after which an entry is purged.
pub const DEFAULT_NODE_MAX_AGE: Duration = Duration::from_secs(60 * 60);

/// An occupied directory slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DirectoryEntry {
    /// Last announced identity.
    pub record: NodeRecord,
    /// When the record was last refreshed.
    pub last_seen: Duration,
}

/// What an upsert did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// An existing entry was overwritten.
    Updated,
    /// An empty slot was filled.
    Inserted,
    /// The least recently seen entry was replaced.
    Evicted(DirectoryEntry),
}

/// Bounded key-value cache of peer records keyed by serial number.
#[derive(Debug, Clone)]
pub struct NodeDirectory {
    slots: Vec<Option<DirectoryEntry>>,
}

impl NodeDirectory {
    /// Create a directory with `capacity` empty slots.
    pub fn new(capacity: usize) -> Self {
        NodeDirectory {
            slots: vec![None; capacity],
        }
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Whether every slot is empty.
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    /// Insert or refresh a record.
    ///
    /// A matching serial is overwritten in place; otherwise the first empty
    /// slot is used; otherwise the entry with the smallest `last_seen` is
    /// replaced (the lowest slot index wins ties).
    pub fn upsert(&mut self, record: NodeRecord, now: Duration) -> Result<UpsertOutcome, VendorError> {
        if record.serial_number.is_empty() {
            return Err(VendorError::invalid_argument("serial number 0 is reserved"));
        }

        let entry = DirectoryEntry {
            record,
            last_seen: now,
        };

        let mut empty = None;
        for (idx, slot) in self.slots.iter_mut().enumerate() {
            match slot {
                Some(existing) if existing.record.serial_number == record.serial_number => {
                    *existing = entry;
                    return Ok(UpsertOutcome::Updated);
                }
                None if empty.is_none() => empty = Some(idx),
                _ => {}
            }
        }

        if let Some(idx) = empty {
            self.slots[idx] = Some(entry);
            return Ok(UpsertOutcome::Inserted);
        }

        let idx = self
            .oldest_slot()
            .ok_or_else(|| VendorError::invalid_argument("directory has no slots"))?;
        match self.slots[idx].replace(entry) {
            Some(evicted) => Ok(UpsertOutcome::Evicted(evicted)),
            None => Ok(UpsertOutcome::Inserted),
        }
    }

    /// Remove every entry with `now - last_seen > max_age`. Returns the number removed.
    pub fn purge(&mut self, now: Duration, max_age: Duration) -> usize {
        let mut removed = 0;
        for slot in self.slots.iter_mut() {
            let stale = matches!(slot, Some(entry) if now.saturating_sub(entry.last_seen) > max_age);
            if stale {
                *slot = None;
                removed += 1;
            }
        }
        removed
    }

    /// Address of the node with `serial`, or [`MeshAddress::UNASSIGNED`] when absent.
    pub fn lookup(&self, serial: SerialNumber) -> MeshAddress {
        self.get(serial)
            .map(|entry| entry.record.mesh_address)
            .unwrap_or(MeshAddress::UNASSIGNED)
    }

    /// The entry for `serial`, if present.
    pub fn get(&self, serial: SerialNumber) -> Option<&DirectoryEntry> {
        if serial.is_empty() {
            return None;
        }
        self.entries()
            .find(|entry| entry.record.serial_number == serial)
    }

    /// Occupied entries in slot order.
    pub fn entries(&self) -> impl Iterator<Item = &DirectoryEntry> {
        self.slots.iter().flatten()
    }

    /// Empty every slot.
    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
    }

    fn oldest_slot(&self) -> Option<usize> {
        let mut oldest: Option<(usize, Duration)> = None;
        for (idx, slot) in self.slots.iter().enumerate() {
            if let Some(entry) = slot {
                match oldest {
                    Some((_, seen)) if entry.last_seen >= seen => {}
                    _ => oldest = Some((idx, entry.last_seen)),
                }
            }
        }
        oldest.map(|(idx, _)| idx)
    }
}

impl Default for NodeDirectory {
    fn default() -> Self {
        Self::new(DEFAULT_DIRECTORY_CAPACITY)
    }
}
