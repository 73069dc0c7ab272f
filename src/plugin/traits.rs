/*!
 * Lock Backend Trait
 * Capability set a locking backend exposes to the page lock protocol
 */

use crate::core::errors::LockResult;
use crate::core::types::{LockMode, LockStatus};
use crate::sync::LockStateSnapshot;
use std::fmt;
use std::path::{Path, PathBuf};

/// Abstract lock kind requested by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockKind {
    /// Bookkeeping lock, independent of the data locks
    Internal,
    /// Whole-resource lock
    Exclusive,
    /// Any reader slot (shared mode)
    Shared,
    /// One keyed slot (partitioned mode)
    Index,
    /// Exclusive while already holding a shared or keyed slot
    Upgrade,
}

impl LockKind {
    /// Lock mode this kind belongs to, for shared/keyed kinds
    pub fn required_mode(self) -> Option<LockMode> {
        match self {
            LockKind::Shared => Some(LockMode::Shared),
            LockKind::Index => Some(LockMode::Partitioned),
            _ => None,
        }
    }
}

/// Options for opening a backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenFlags {
    /// Accept whatever configuration an existing lock file has
    pub any_locks: bool,
    /// Resource has no backing file
    pub memory_only: bool,
    /// Take the exclusive lock as part of opening
    pub lock_now: bool,
}

/// Result of opening a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenReport {
    /// This call created the lock file
    pub created: bool,
    /// `lock_now` recovered a lock from a dead owner
    pub need_check: bool,
}

/// A locking backend
///
/// `lock`/`unlock` take `&self`; reconfiguration (`open`, `close`,
/// `refresh`, `reset`) takes `&mut self`.
pub trait LockBackend: Send + Sync + fmt::Debug {
    /// Registered name of the backend
    fn name(&self) -> &'static str;

    /// Lock file used for `resource`
    fn lock_path(&self, resource: &Path) -> LockResult<PathBuf>;

    fn open(
        &mut self,
        resource: &Path,
        mode: LockMode,
        count: usize,
        flags: OpenFlags,
    ) -> LockResult<OpenReport>;

    /// Release everything held by the calling thread and unmap
    fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Acquire; `partition` is only used by `LockKind::Index`
    fn lock(&self, kind: LockKind, blocking: bool, partition: usize) -> LockResult<LockStatus>;

    fn unlock(&self, kind: LockKind) -> LockResult<()>;

    /// Nesting depth for `kind`, by the calling thread or by anyone
    fn held_count(&self, kind: LockKind, by_self: bool) -> LockResult<usize>;

    /// Nesting depth for one slot of `kind`
    fn held_count_at(&self, kind: LockKind, by_self: bool, index: usize) -> LockResult<usize>;

    /// Number of slots available for `kind`
    fn count(&self, kind: LockKind) -> usize;

    fn mode(&self) -> Option<LockMode>;

    /// Adopt a configuration change published by another process
    fn refresh(&mut self) -> LockResult<()>;

    /// Reinitialize every lock
    fn reset(&mut self) -> LockResult<()>;

    /// Dump of the current lock state
    fn state(&self) -> LockResult<LockStateSnapshot>;
}
