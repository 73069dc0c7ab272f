/*!
 * Multi-Lock Types
 */

use crate::core::types::{LockMode, OwnerId};
use crate::shm::LockFileSnapshot;
use serde::{Deserialize, Serialize};

/// What a lock or unlock call targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockTarget {
    /// Any free shared slot (exclusive slot in single mode)
    Any,
    /// The whole composite section
    Exclusive,
    /// One keyed slot
    Partition(usize),
}

/// A single slot of the composite section, for introspection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    Exclusive,
    Partition(usize),
}

/// How a multi-lock is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenSpec {
    /// Create or validate this exact configuration
    Checked { mode: LockMode, count: usize },
    /// Adopt whatever configuration the file already has
    Unchecked,
}

/// Per-slot view in a state dump
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotState {
    pub index: usize,
    pub owner: OwnerId,
    pub count: i32,
}

/// Serializable dump of a multi-lock and its lock file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockStateSnapshot {
    pub mode: LockMode,
    pub base_count: usize,
    pub partitions: usize,
    pub base: Vec<SlotState>,
    pub exclusive: SlotState,
    pub slots: Vec<SlotState>,
    pub local_exclusive: u32,
    pub local_partitions: u32,
    pub file: LockFileSnapshot,
}

impl LockStateSnapshot {
    /// Partition slots with an owner
    pub fn locked_slots(&self) -> usize {
        self.slots.iter().filter(|s| s.owner != 0).count()
    }
}
