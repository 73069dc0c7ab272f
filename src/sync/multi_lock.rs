/*!
 * Multi-Lock
 *
 * A composite lock carved out of one lock file:
 *
 * ```text
 * index:  0 .. base-1 | base      | base+1 .. base+parts
 *         base locks  | exclusive | shared / partition slots
 * ```
 *
 * SINGLE mode has no partition slots. SHARED and PARTITIONED take the
 * exclusive slot first for whole-resource access, then every partition in
 * index order, so exclusive requesters are totally ordered among
 * themselves and never deadlock against each other.
 *
 * Each thread tracks how many exclusive and partition acquisitions it holds
 * on each instance, plus the partition it locked last, in its thread
 * context (see `thread_ctx`).
 */

use super::thread_ctx::{self, InstanceId, InstanceSlot};
use super::types::{LockStateSnapshot, LockTarget, OpenSpec, Slot, SlotState};
use crate::core::errors::{LockError, LockResult};
use crate::core::limits::{
    CONFIG_READ_DELAY, CONFIG_READ_RETRIES, MAX_PARTITIONS, MULTI_LOCK_REGISTERS, REG_BASE_COUNT,
    REG_LOCK_MODE, REG_SHARE_INDEX, REG_UNPUBLISHED,
};
use crate::core::types::{LockMode, LockStatus, OwnerId};
use crate::shm::{Geometry, LockFile, OpenRetry};
use std::path::Path;
use std::thread;
use tracing::{debug, info, warn};

/// Composite process-shared lock
#[derive(Debug)]
pub struct MultiLock {
    file: LockFile,
    mode: LockMode,
    base: usize,
    parts: usize,
    slot: InstanceSlot,
}

impl MultiLock {
    /// Open or create the lock file at `path`
    ///
    /// `base` reserved slots precede the composite section. Returns the lock
    /// and whether this call created the file.
    pub fn open(
        path: &Path,
        base: usize,
        spec: OpenSpec,
        create_mode: u32,
        retry: OpenRetry,
    ) -> LockResult<(MultiLock, bool)> {
        match spec {
            OpenSpec::Checked { mode, count } => {
                let parts = partition_count(mode, count)?;
                let geometry = Geometry::Exact {
                    registers: MULTI_LOCK_REGISTERS,
                    mutexes: base + 1 + parts,
                };
                let registers = initial_registers(mode, base);
                let (file, created) =
                    LockFile::open_with_registers(path, geometry, &registers, create_mode, retry)?;

                if !created {
                    let found = settled_tag(&file)?;
                    if found != mode.tag() {
                        return Err(LockError::ModeMismatch {
                            path: path.to_path_buf(),
                            found: describe_tag(found),
                            expected: mode.to_string(),
                        });
                    }
                }

                Ok((Self::from_parts(file, mode, base, parts), created))
            }
            OpenSpec::Unchecked => {
                let (mut file, created) =
                    LockFile::open(path, Geometry::Unchecked, create_mode, retry)?;
                let (mode, parts) = read_configuration(&mut file, base)?;
                Ok((Self::from_parts(file, mode, base, parts), created))
            }
        }
    }

    fn from_parts(file: LockFile, mode: LockMode, base: usize, parts: usize) -> Self {
        Self {
            file,
            mode,
            base,
            parts,
            slot: InstanceSlot::allocate(),
        }
    }

    #[inline]
    fn id(&self) -> InstanceId {
        self.slot.id()
    }

    #[inline]
    fn core_index(&self) -> usize {
        self.base
    }

    #[inline]
    fn part_index(&self, partition: usize) -> usize {
        self.base + 1 + partition
    }

    fn check_partition(&self, op: &'static str, partition: usize) -> LockResult<()> {
        if partition >= self.parts {
            return Err(LockError::InvalidIndex {
                path: self.file.path().to_path_buf(),
                op,
                index: partition,
                limit: self.parts,
            });
        }
        Ok(())
    }

    fn check_base(&self, op: &'static str, index: usize) -> LockResult<()> {
        if index >= self.base {
            return Err(LockError::InvalidIndex {
                path: self.file.path().to_path_buf(),
                op,
                index,
                limit: self.base,
            });
        }
        Ok(())
    }

    fn unsupported(&self, op: &'static str) -> LockError {
        LockError::Unsupported {
            path: self.file.path().to_path_buf(),
            op,
            mode: self.mode.to_string(),
        }
    }

    #[inline]
    fn home_partition(&self, tid: OwnerId) -> usize {
        tid as usize % self.parts
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    #[inline]
    pub fn mode(&self) -> LockMode {
        self.mode
    }

    #[inline]
    pub fn base_count(&self) -> usize {
        self.base
    }

    /// Partition (or shared) slot count; zero in single mode
    #[inline]
    pub fn part_count(&self) -> usize {
        self.parts
    }

    #[inline]
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    #[inline]
    pub fn lock_file(&self) -> &LockFile {
        &self.file
    }

    /// Slots after the base locks
    #[inline]
    pub fn num_locks(&self) -> usize {
        self.file.mutex_count() - self.base
    }

    /// Fails with `Stale` if another process resized the lock file
    pub fn check_header(&self) -> LockResult<()> {
        self.file.check_header()
    }

    // =========================================================================
    // Lock / unlock
    // =========================================================================

    /// Acquire `target`
    ///
    /// Returns `OwnerDied` when any slot taken on the way had a dead holder.
    pub fn lock(&self, target: LockTarget, blocking: bool) -> LockResult<LockStatus> {
        self.file.check_header()?;
        let tid = thread_ctx::current_tid();

        if !self.mode.is_split() {
            if let LockTarget::Partition(p) = target {
                self.check_partition("lock", p)?;
            }
            let status = self.file.lock_as(self.core_index(), blocking, tid)?;
            thread_ctx::with_entry(self.id(), |_, e| e.excl_count += 1);
            return Ok(status);
        }

        match target {
            LockTarget::Exclusive => {
                let status = self.lock_exclusive(tid, blocking)?;
                thread_ctx::with_entry(self.id(), |_, e| e.excl_count += 1);
                Ok(status)
            }
            LockTarget::Any => self.lock_any(tid, blocking),
            LockTarget::Partition(p) => {
                self.check_partition("lock", p)?;
                let status = self.file.lock_as(self.part_index(p), blocking, tid)?;
                self.note_partition(p);
                Ok(status)
            }
        }
    }

    fn note_partition(&self, partition: usize) {
        thread_ctx::with_entry(self.id(), |_, e| {
            e.part_count += 1;
            e.last_locked = Some(partition);
        });
    }

    fn lock_exclusive(&self, tid: OwnerId, blocking: bool) -> LockResult<LockStatus> {
        let core = self.core_index();
        let mut status = self.file.lock_as(core, blocking, tid)?;

        for p in 0..self.parts {
            match self.file.lock_as(self.part_index(p), blocking, tid) {
                Ok(s) => status = status.merge(s),
                Err(e) => {
                    for held in (0..p).rev() {
                        let _ = self.file.unlock_as(self.part_index(held), tid);
                    }
                    let _ = self.file.unlock_as(core, tid);
                    return Err(e);
                }
            }
        }

        if status.owner_died() {
            warn!(path = %self.path().display(), "exclusive lock recovered from dead owner");
        }
        Ok(status)
    }

    fn lock_any(&self, tid: OwnerId, blocking: bool) -> LockResult<LockStatus> {
        let core = self.core_index();
        let mut status = LockStatus::Acquired;

        // Let a pending or active exclusive holder go first.
        let core_owner = self.file.owner_id(core)?;
        if core_owner != 0 && core_owner != tid {
            status = self.file.lock_as(core, blocking, tid)?;
            self.file.unlock_as(core, tid)?;
        }

        let home = self.home_partition(tid);
        for step in 1..=self.parts {
            let p = (home + step) % self.parts;
            match self.file.lock_as(self.part_index(p), false, tid) {
                Ok(s) => {
                    self.note_partition(p);
                    return Ok(status.merge(s));
                }
                Err(e) if e.is_would_block() => continue,
                Err(e) => return Err(e),
            }
        }

        debug!(path = %self.path().display(), partition = home, "all shared slots busy");
        let s = self.file.lock_as(self.part_index(home), blocking, tid)?;
        self.note_partition(home);
        Ok(status.merge(s))
    }

    /// Release `target`
    pub fn unlock(&self, target: LockTarget) -> LockResult<()> {
        let tid = thread_ctx::current_tid();

        if !self.mode.is_split() {
            self.file.unlock_as(self.core_index(), tid)?;
            thread_ctx::with_entry(self.id(), |_, e| {
                e.excl_count = e.excl_count.saturating_sub(1)
            });
            return Ok(());
        }

        match target {
            LockTarget::Exclusive => {
                let core = self.core_index();
                if self.file.local_count_as(core, tid)? == 0 {
                    return Err(self.not_owned("unlock exclusive", core, tid));
                }
                for p in 0..self.parts {
                    self.file.unlock_as(self.part_index(p), tid)?;
                }
                self.file.unlock_as(core, tid)?;
                thread_ctx::with_entry(self.id(), |_, e| {
                    e.excl_count = e.excl_count.saturating_sub(1)
                });
                Ok(())
            }
            LockTarget::Partition(p) => {
                self.check_partition("unlock", p)?;
                self.file.unlock_as(self.part_index(p), tid)?;
                self.forget_partition();
                Ok(())
            }
            LockTarget::Any => self.unlock_any(tid),
        }
    }

    fn forget_partition(&self) {
        thread_ctx::with_entry(self.id(), |_, e| {
            e.part_count = e.part_count.saturating_sub(1)
        });
    }

    fn unlock_any(&self, tid: OwnerId) -> LockResult<()> {
        let last = thread_ctx::entry(self.id()).last_locked;
        if let Some(p) = last.filter(|p| *p < self.parts) {
            if self.file.owner_id(self.part_index(p))? == tid {
                self.file.unlock_as(self.part_index(p), tid)?;
                self.forget_partition();
                return Ok(());
            }
        }

        for p in 0..self.parts {
            if self.file.owner_id(self.part_index(p))? == tid {
                self.file.unlock_as(self.part_index(p), tid)?;
                self.forget_partition();
                return Ok(());
            }
        }

        Err(self.not_owned("unlock any", self.part_index(0), tid))
    }

    fn not_owned(&self, op: &'static str, index: usize, tid: OwnerId) -> LockError {
        LockError::NotOwner {
            path: self.path().to_path_buf(),
            op,
            index,
            owner: self.file.owner_id(index).unwrap_or(0),
            caller: tid,
            count: self.file.lock_count(index).unwrap_or(0),
        }
    }

    /// Take the whole composite section while holding a partition
    pub fn upgrade(&self, blocking: bool) -> LockResult<LockStatus> {
        if !self.mode.is_split() {
            return Err(self.unsupported("upgrade"));
        }
        self.lock(LockTarget::Exclusive, blocking)
    }

    /// Trade one level of exclusive hold for partition `partition`
    ///
    /// `None` picks the caller's home slot; only valid in shared mode.
    pub fn downgrade(&self, partition: Option<usize>, blocking: bool) -> LockResult<LockStatus> {
        if !self.mode.is_split() {
            return Err(self.unsupported("downgrade"));
        }
        let tid = thread_ctx::current_tid();
        let partition = match partition {
            Some(p) => {
                self.check_partition("downgrade", p)?;
                p
            }
            None if self.mode == LockMode::Shared => self.home_partition(tid),
            None => return Err(self.unsupported("downgrade without index")),
        };

        let core = self.core_index();
        if self.file.local_count_as(core, tid)? == 0 {
            return Err(self.not_owned("downgrade", core, tid));
        }

        let status = self.file.lock_as(self.part_index(partition), blocking, tid)?;
        self.note_partition(partition);
        self.unlock(LockTarget::Exclusive)?;
        Ok(status)
    }

    // =========================================================================
    // Base locks
    // =========================================================================

    pub fn lock_base(&self, index: usize, blocking: bool) -> LockResult<LockStatus> {
        self.file.check_header()?;
        self.check_base("lock base", index)?;
        self.file.lock(index, blocking)
    }

    pub fn unlock_base(&self, index: usize) -> LockResult<()> {
        self.check_base("unlock base", index)?;
        self.file.unlock(index)
    }

    pub fn base_owner_id(&self, index: usize) -> LockResult<OwnerId> {
        self.check_base("base owner", index)?;
        self.file.owner_id(index)
    }

    pub fn base_lock_count(&self, index: usize) -> LockResult<i32> {
        self.check_base("base lock count", index)?;
        self.file.lock_count(index)
    }

    pub fn base_local_count(&self, index: usize) -> LockResult<i32> {
        self.check_base("base local count", index)?;
        self.file.local_count(index)
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    fn slot_index(&self, op: &'static str, slot: Slot) -> LockResult<usize> {
        match slot {
            Slot::Exclusive => Ok(self.core_index()),
            Slot::Partition(p) => {
                self.check_partition(op, p)?;
                Ok(self.part_index(p))
            }
        }
    }

    pub fn owner_id(&self, slot: Slot) -> LockResult<OwnerId> {
        let index = self.slot_index("owner", slot)?;
        self.file.owner_id(index)
    }

    pub fn lock_count(&self, slot: Slot) -> LockResult<i32> {
        let index = self.slot_index("lock count", slot)?;
        self.file.lock_count(index)
    }

    pub fn local_count(&self, slot: Slot) -> LockResult<i32> {
        let index = self.slot_index("local count", slot)?;
        self.file.local_count(index)
    }

    /// Nesting depth summed over the exclusive slot and every partition
    pub fn lock_count_total(&self) -> i32 {
        (0..=self.parts)
            .filter_map(|i| self.file.lock_count(self.base + i).ok())
            .sum()
    }

    /// Acquisitions the calling thread has not yet released
    pub fn local_count_total(&self) -> u32 {
        if !self.mode.is_split() {
            return self
                .file
                .local_count(self.core_index())
                .map(|n| n.max(0) as u32)
                .unwrap_or(0);
        }
        let entry = thread_ctx::entry(self.id());
        entry.excl_count + entry.part_count
    }

    /// Partitions held by anyone
    pub fn locked_part_count(&self) -> usize {
        (0..self.parts)
            .filter(|p| {
                self.file
                    .lock_count(self.part_index(*p))
                    .map(|n| n > 0)
                    .unwrap_or(false)
            })
            .count()
    }

    /// Partitions held by the calling thread
    pub fn local_part_count(&self) -> usize {
        (0..self.parts)
            .filter(|p| {
                self.file
                    .local_count(self.part_index(*p))
                    .map(|n| n > 0)
                    .unwrap_or(false)
            })
            .count()
    }

    pub fn snapshot(&self) -> LockStateSnapshot {
        let state = |index: usize| SlotState {
            index,
            owner: self.file.owner_id(index).unwrap_or(0),
            count: self.file.lock_count(index).unwrap_or(0),
        };
        let entry = thread_ctx::entry(self.id());
        LockStateSnapshot {
            mode: self.mode,
            base_count: self.base,
            partitions: self.parts,
            base: (0..self.base).map(state).collect(),
            exclusive: state(self.core_index()),
            slots: (0..self.parts).map(|p| state(self.part_index(p))).collect(),
            local_exclusive: entry.excl_count,
            local_partitions: entry.part_count,
            file: self.file.snapshot(),
        }
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Resize to a new configuration, or follow one published by another process
    pub fn expand(&mut self, spec: OpenSpec) -> LockResult<()> {
        match spec {
            OpenSpec::Checked { mode, count } => {
                let parts = partition_count(mode, count)?;
                self.file.expand_publishing(
                    self.base + 1 + parts,
                    &[(REG_LOCK_MODE, mode.tag()), (REG_SHARE_INDEX, 0)],
                )?;
                info!(
                    path = %self.path().display(),
                    from = %self.mode,
                    to = %mode,
                    parts,
                    "lock configuration expanded"
                );
                self.mode = mode;
                self.parts = parts;
            }
            OpenSpec::Unchecked => {
                self.file.expand(None)?;
                let (mode, parts) = read_configuration(&mut self.file, self.base)?;
                self.mode = mode;
                self.parts = parts;
            }
        }
        thread_ctx::reset_entry(self.id());
        Ok(())
    }

    /// Reinitialize every mutex in the file
    pub fn reset_all(&self) -> LockResult<()> {
        self.file.reset_all()?;
        thread_ctx::reset_entry(self.id());
        Ok(())
    }
}

fn partition_count(mode: LockMode, count: usize) -> LockResult<usize> {
    match mode {
        LockMode::Single => Ok(0),
        _ if count == 0 || count > MAX_PARTITIONS => Err(LockError::InvalidArgument(format!(
            "{} lock needs 1..={} slots, got {}",
            mode, MAX_PARTITIONS, count
        ))),
        _ => Ok(count),
    }
}

fn initial_registers(mode: LockMode, base: usize) -> [i32; MULTI_LOCK_REGISTERS] {
    let mut registers = [0; MULTI_LOCK_REGISTERS];
    registers[REG_LOCK_MODE] = mode.tag();
    registers[REG_BASE_COUNT] = base as i32;
    registers[REG_SHARE_INDEX] = 0;
    registers
}

/// Wait out a resize in flight and return the published mode tag
fn settled_tag(file: &LockFile) -> LockResult<i32> {
    for attempt in 0..CONFIG_READ_RETRIES {
        let tag = file.get_register(REG_LOCK_MODE)?;
        if tag != REG_UNPUBLISHED {
            return Ok(tag);
        }
        back_off(attempt);
    }
    Err(LockError::Stale {
        path: file.path().to_path_buf(),
        op: "read lock mode",
    })
}

/// Read a mode and slot count published by the same resize
///
/// The tag is read on both sides of the header counts; a resize clears it
/// before changing the counts, so matching reads bracket one configuration.
/// Follows the published count when it differs from the local mapping.
fn read_configuration(file: &mut LockFile, base: usize) -> LockResult<(LockMode, usize)> {
    for attempt in 0..CONFIG_READ_RETRIES {
        let before = file.get_register(REG_LOCK_MODE)?;
        let (_, slots) = file.header_counts();
        let after = file.get_register(REG_LOCK_MODE)?;

        if before == REG_UNPUBLISHED || before != after {
            back_off(attempt);
            continue;
        }
        let mode = LockMode::from_tag(before).ok_or_else(|| LockError::ModeMismatch {
            path: file.path().to_path_buf(),
            found: describe_tag(before),
            expected: "any".to_string(),
        })?;
        if slots <= base {
            return Err(LockError::MutexCountMismatch {
                path: file.path().to_path_buf(),
                found: slots as u32,
                expected: (base + 1) as u32,
            });
        }
        // a tag from one resize and counts from the next
        if mode.is_split() == (slots == base + 1) {
            back_off(attempt);
            continue;
        }
        if slots != file.mutex_count() {
            file.expand(None)?;
            continue;
        }

        let parts = match mode {
            LockMode::Single => 0,
            _ => slots - base - 1,
        };
        return Ok((mode, parts));
    }
    Err(LockError::Stale {
        path: file.path().to_path_buf(),
        op: "read configuration",
    })
}

fn back_off(attempt: u32) {
    if attempt < CONFIG_READ_RETRIES / 20 {
        thread::yield_now();
    } else {
        thread::sleep(CONFIG_READ_DELAY);
    }
}

fn describe_tag(tag: i32) -> String {
    match LockMode::from_tag(tag) {
        Some(mode) => mode.to_string(),
        None => format!("unknown ({})", tag),
    }
}
