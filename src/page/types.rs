/*!
 * Page Lock Types
 */

use crate::core::types::{Access, LockStatus};
use crate::plugin::LockKind;
use serde::{Deserialize, Serialize};

/// Protocol state of one `PageLocker`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolState {
    Unlocked,
    /// A reader slot or one partition is held
    ShareHeld,
    ExclusiveHeld,
    /// A dead owner's lock was recovered without an integrity pass yet
    NeedsIntegrityCheck,
}

impl ProtocolState {
    pub fn is_locked(self) -> bool {
        matches!(self, ProtocolState::ShareHeld | ProtocolState::ExclusiveHeld)
    }
}

/// Successful page lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acquisition {
    /// Backend kind actually held
    pub kind: LockKind,
    /// Partition held, for partitioned locking
    pub partition: Option<usize>,
    /// Page of the key, when a key was given
    pub page: Option<u32>,
    pub status: LockStatus,
    /// An integrity pass ran during this acquisition
    pub integrity_checked: bool,
    /// Lock attempts needed to reach a stable generation
    pub attempts: u32,
}

/// One storage operation's lock request
#[derive(Debug, Clone, Copy)]
pub struct PageRequest<'k> {
    pub access: Access,
    pub key: Option<&'k [u8]>,
    pub blocking: bool,
}

impl<'k> PageRequest<'k> {
    pub fn read(key: Option<&'k [u8]>) -> Self {
        Self {
            access: Access::Read,
            key,
            blocking: true,
        }
    }

    pub fn write(key: Option<&'k [u8]>) -> Self {
        Self {
            access: Access::Write,
            key,
            blocking: true,
        }
    }

    pub fn nonblocking(mut self) -> Self {
        self.blocking = false;
        self
    }
}
