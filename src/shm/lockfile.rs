/*!
 * Lock File
 *
 * A memory-mapped file holding a header, a register array and an array of
 * robust mutex records. Any number of processes may map the same file; the
 * first one to create it initializes every record, later ones validate the
 * header against their own expectations.
 *
 * Create race: plain open, else exclusive create, else a second plain open
 * (someone else won). Losers then poll until the file has reached full size
 * and every record is initialized.
 */

use super::region::MappedRegion;
use super::types::{Geometry, Layout, LockFileHeader, LockFileSnapshot};
use crate::core::errors::{LockError, LockResult};
use crate::core::limits::{LOCK_FILE_VERSION, OPEN_RETRIES, OPEN_RETRY_DELAY, REG_UNPUBLISHED};
use crate::core::types::{LockStatus, OwnerId};
use crate::sync::mutex::{MutexRecord, MutexSnapshot};
use crate::sync::thread_ctx::current_tid;
use nix::sys::stat::{umask, Mode};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long to wait for a concurrent creator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenRetry {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for OpenRetry {
    fn default() -> Self {
        Self {
            attempts: OPEN_RETRIES,
            delay: OPEN_RETRY_DELAY,
        }
    }
}

static UMASK_LOCK: parking_lot::Mutex<()> = parking_lot::const_mutex(());

/// Run `f` with the process umask cleared
///
/// Serialized so concurrent callers restore the original mask.
pub(crate) fn without_umask<R>(f: impl FnOnce() -> R) -> R {
    let _guard = UMASK_LOCK.lock();
    let previous = umask(Mode::empty());
    let out = f();
    umask(previous);
    out
}

/// Mapped lock file
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    file: File,
    region: MappedRegion,
    layout: Layout,
}

impl LockFile {
    /// Open or create the lock file at `path`
    ///
    /// Returns the handle and whether this call created the file. An
    /// unchecked geometry never creates and adopts the counts found in the
    /// header.
    pub fn open(
        path: &Path,
        geometry: Geometry,
        mode: u32,
        retry: OpenRetry,
    ) -> LockResult<(LockFile, bool)> {
        Self::open_with_registers(path, geometry, &[], mode, retry)
    }

    /// Like `open`, seeding the registers of a newly created file
    ///
    /// The values are written together with the header, so no opener can
    /// observe the file before they are in place.
    pub fn open_with_registers(
        path: &Path,
        geometry: Geometry,
        registers: &[i32],
        mode: u32,
        retry: OpenRetry,
    ) -> LockResult<(LockFile, bool)> {
        if path.as_os_str().is_empty() {
            return Err(LockError::InvalidArgument(
                "lock file path is empty".to_string(),
            ));
        }
        if let Geometry::Exact { registers: count, .. } = geometry {
            if registers.len() > count {
                return Err(LockError::InvalidArgument(format!(
                    "{} initial registers for a file with {}",
                    registers.len(),
                    count
                )));
            }
        }

        let (file, created_layout) = open_or_create(path, geometry, registers, mode)?;
        let created = created_layout.is_some();

        let lock_file = match created_layout {
            Some(layout) => Self::initialize(path, file, layout)?,
            None => {
                let size = wait_for_size(&file, path, geometry, retry)?;
                Self::attach(path, file, geometry, size, retry)?
            }
        };

        debug!(
            path = %path.display(),
            created,
            registers = lock_file.layout.registers,
            mutexes = lock_file.layout.mutexes,
            "lock file opened"
        );
        Ok((lock_file, created))
    }

    fn initialize(path: &Path, file: File, layout: Layout) -> LockResult<Self> {
        let region =
            MappedRegion::map(&file, layout.size()).map_err(|e| LockError::io(path, "map", e))?;
        let lock_file = Self {
            path: path.to_path_buf(),
            file,
            region,
            layout,
        };

        for index in 0..layout.mutexes {
            let record = lock_file.record(index, "initialize")?;
            record
                .init()
                .map_err(|e| e.into_lock_error(path, "initialize", index, 0))?;
            lock_file
                .header()
                .mutex_initialized
                .fetch_add(1, Ordering::AcqRel);
        }

        info!(
            path = %path.display(),
            registers = layout.registers,
            mutexes = layout.mutexes,
            record_size = MutexRecord::SIZE,
            "created lock file"
        );
        Ok(lock_file)
    }

    fn attach(
        path: &Path,
        file: File,
        geometry: Geometry,
        size: u64,
        retry: OpenRetry,
    ) -> LockResult<Self> {
        let header_size = LockFileHeader::SIZE as u64;
        if size < header_size {
            return Err(LockError::TooSmall {
                path: path.to_path_buf(),
                size,
                expected: header_size,
            });
        }

        let words = read_header(&file).map_err(|e| LockError::io(path, "read header", e))?;
        let [version, record_size, registers, mutexes, _] = words;

        if version != LOCK_FILE_VERSION {
            return Err(LockError::VersionMismatch {
                path: path.to_path_buf(),
                found: version,
                expected: LOCK_FILE_VERSION,
            });
        }
        if record_size as usize != MutexRecord::SIZE {
            return Err(LockError::RecordSizeMismatch {
                path: path.to_path_buf(),
                found: record_size,
                expected: MutexRecord::SIZE as u32,
            });
        }

        let layout = match geometry {
            Geometry::Exact {
                registers: want_regs,
                mutexes: want_mutexes,
            } => {
                let expected = Layout::new(want_regs, want_mutexes);
                if size < expected.size() as u64 {
                    return Err(LockError::TooSmall {
                        path: path.to_path_buf(),
                        size,
                        expected: expected.size() as u64,
                    });
                }
                if registers as usize != want_regs {
                    return Err(LockError::RegisterCountMismatch {
                        path: path.to_path_buf(),
                        found: registers,
                        expected: want_regs as u32,
                    });
                }
                if mutexes as usize != want_mutexes {
                    return Err(LockError::MutexCountMismatch {
                        path: path.to_path_buf(),
                        found: mutexes,
                        expected: want_mutexes as u32,
                    });
                }
                expected
            }
            Geometry::Unchecked => {
                let found = Layout::new(registers as usize, mutexes as usize);
                if size < found.size() as u64 {
                    return Err(LockError::TooSmall {
                        path: path.to_path_buf(),
                        size,
                        expected: found.size() as u64,
                    });
                }
                found
            }
        };

        let region =
            MappedRegion::map(&file, layout.size()).map_err(|e| LockError::io(path, "map", e))?;
        let lock_file = Self {
            path: path.to_path_buf(),
            file,
            region,
            layout,
        };
        lock_file.wait_initialized(retry)?;
        Ok(lock_file)
    }

    fn wait_initialized(&self, retry: OpenRetry) -> LockResult<()> {
        let header = self.header();
        let mut attempts = 0;
        loop {
            let count = header.mutex_count.load(Ordering::Acquire);
            let initialized = header.mutex_initialized.load(Ordering::Acquire);
            if initialized >= count {
                return Ok(());
            }
            if attempts >= retry.attempts {
                return Err(LockError::NotInitialized {
                    path: self.path.clone(),
                    initialized,
                    count,
                });
            }
            attempts += 1;
            std::thread::sleep(retry.delay);
        }
    }

    #[inline]
    fn header(&self) -> &LockFileHeader {
        // SAFETY: every mapping is at least one header long (checked at open
        // and expand), mmap returns page-aligned memory, and the header is
        // made of atomics valid for any bit pattern.
        unsafe { &*(self.region.as_ptr() as *const LockFileHeader) }
    }

    fn record(&self, index: usize, op: &'static str) -> LockResult<&MutexRecord> {
        if index >= self.layout.mutexes {
            return Err(self.invalid_index(op, index, self.layout.mutexes));
        }
        // SAFETY: records are only touched through the pthread API and atomics
        unsafe { self.region.get::<MutexRecord>(self.layout.mutex_offset(index)) }
            .ok_or_else(|| self.invalid_index(op, index, self.layout.mutexes))
    }

    fn register(&self, index: usize, op: &'static str) -> LockResult<&AtomicI32> {
        if index >= self.layout.registers {
            return Err(self.invalid_index(op, index, self.layout.registers));
        }
        // SAFETY: AtomicI32 is valid for any bit pattern
        unsafe { self.region.get::<AtomicI32>(self.layout.register_offset(index)) }
            .ok_or_else(|| self.invalid_index(op, index, self.layout.registers))
    }

    fn invalid_index(&self, op: &'static str, index: usize, limit: usize) -> LockError {
        LockError::InvalidIndex {
            path: self.path.clone(),
            op,
            index,
            limit,
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub fn file(&self) -> &File {
        &self.file
    }

    #[inline]
    pub fn mutex_count(&self) -> usize {
        self.layout.mutexes
    }

    #[inline]
    pub fn register_count(&self) -> usize {
        self.layout.registers
    }

    /// Counts currently published in the header
    pub fn header_counts(&self) -> (usize, usize) {
        let header = self.header();
        (
            header.register_count.load(Ordering::Acquire) as usize,
            header.mutex_count.load(Ordering::Acquire) as usize,
        )
    }

    /// Verify cached counts still match the header
    ///
    /// Fails with `Stale` when another process expanded the file; the
    /// caller should follow with `expand(None)`.
    pub fn check_header(&self) -> LockResult<()> {
        let (registers, mutexes) = self.header_counts();
        if registers != self.layout.registers || mutexes != self.layout.mutexes {
            return Err(LockError::Stale {
                path: self.path.clone(),
                op: "check header",
            });
        }
        Ok(())
    }

    // =========================================================================
    // Mutex operations
    // =========================================================================

    pub fn lock(&self, index: usize, blocking: bool) -> LockResult<LockStatus> {
        self.lock_as(index, blocking, current_tid())
    }

    pub(crate) fn lock_as(
        &self,
        index: usize,
        blocking: bool,
        tid: OwnerId,
    ) -> LockResult<LockStatus> {
        let record = self.record(index, "lock")?;
        record
            .lock(blocking, tid)
            .map_err(|e| e.into_lock_error(&self.path, "lock", index, tid))
    }

    pub fn unlock(&self, index: usize) -> LockResult<()> {
        self.unlock_as(index, current_tid())
    }

    pub(crate) fn unlock_as(&self, index: usize, tid: OwnerId) -> LockResult<()> {
        let record = self.record(index, "unlock")?;
        record
            .unlock(tid)
            .map_err(|e| e.into_lock_error(&self.path, "unlock", index, tid))
    }

    pub fn owner_id(&self, index: usize) -> LockResult<OwnerId> {
        Ok(self.record(index, "owner")?.owner_id())
    }

    pub fn lock_count(&self, index: usize) -> LockResult<i32> {
        Ok(self.record(index, "lock count")?.lock_count())
    }

    pub fn local_count(&self, index: usize) -> LockResult<i32> {
        self.local_count_as(index, current_tid())
    }

    pub(crate) fn local_count_as(&self, index: usize, tid: OwnerId) -> LockResult<i32> {
        Ok(self.record(index, "local count")?.local_count(tid))
    }

    /// Reinitialize every record, discarding all holders
    ///
    /// Only safe when no process is using the file.
    pub fn reset_all(&self) -> LockResult<()> {
        for index in 0..self.layout.mutexes {
            let record = self.record(index, "reset")?;
            record
                .init()
                .map_err(|e| e.into_lock_error(&self.path, "reset", index, 0))?;
        }
        warn!(
            path = %self.path.display(),
            mutexes = self.layout.mutexes,
            "reset every lock in lock file"
        );
        Ok(())
    }

    // =========================================================================
    // Registers
    // =========================================================================

    pub fn get_register(&self, index: usize) -> LockResult<i32> {
        Ok(self.register(index, "get register")?.load(Ordering::Acquire))
    }

    pub fn set_register(&self, index: usize, value: i32) -> LockResult<()> {
        self.register(index, "set register")?
            .store(value, Ordering::Release);
        Ok(())
    }

    /// Increment; returns the new value
    pub fn inc_register(&self, index: usize) -> LockResult<i32> {
        self.add_register(index, 1)
    }

    /// Decrement; returns the new value
    pub fn dec_register(&self, index: usize) -> LockResult<i32> {
        self.add_register(index, -1)
    }

    /// Add `delta`; returns the new value
    pub fn add_register(&self, index: usize, delta: i32) -> LockResult<i32> {
        let register = self.register(index, "add register")?;
        Ok(register.fetch_add(delta, Ordering::AcqRel).wrapping_add(delta))
    }

    /// Compare-and-swap; true when `current` matched and was replaced
    pub fn cas_register(&self, index: usize, current: i32, new: i32) -> LockResult<bool> {
        let register = self.register(index, "cas register")?;
        Ok(register
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok())
    }

    // =========================================================================
    // Expansion
    // =========================================================================

    /// Resize the mutex array
    ///
    /// `Some(n)`: take every existing lock, grow (or shrink) to `n` records,
    /// initialize only records not initialized before, publish the new
    /// counts, release. `None`: adopt the count another process published.
    /// Refused while the calling thread holds any lock in this file. On
    /// failure the previous mapping stays in place.
    pub fn expand(&mut self, new_count: Option<usize>) -> LockResult<()> {
        match new_count {
            Some(target) => self.expand_publishing(target, &[]),
            None => {
                self.check_not_held("expand")?;
                self.follow_expansion()
            }
        }
    }

    /// Resize to `target` records and publish `registers` with the new counts
    ///
    /// Every listed register reads `REG_UNPUBLISHED` from before the counts
    /// change until its new value is stored, and both happen while every
    /// record is held. A reader that sees the same non-zero value before and
    /// after loading the header counts has a consistent pair.
    pub fn expand_publishing(
        &mut self,
        target: usize,
        registers: &[(usize, i32)],
    ) -> LockResult<()> {
        self.check_not_held("expand")?;
        let tid = current_tid();

        let old_count = self.layout.mutexes;
        let mut owner_died = false;
        for index in 0..old_count {
            match self.lock_as(index, true, tid) {
                Ok(status) => owner_died |= status.owner_died(),
                Err(e) => {
                    for held in (0..index).rev() {
                        let _ = self.unlock_as(held, tid);
                    }
                    return Err(e);
                }
            }
        }

        let grown = self.resize_held(target, registers);

        for index in (0..old_count).rev() {
            if let Err(e) = self.unlock_as(index, tid) {
                warn!(path = %self.path.display(), index, error = %e, "unlock after expand failed");
            }
        }

        let (region, layout) = grown?;
        self.region = region;
        self.layout = layout;

        if owner_died {
            warn!(path = %self.path.display(), "previous lock owner died during expand");
        }
        info!(
            path = %self.path.display(),
            from = old_count,
            to = target,
            "expanded lock file"
        );
        Ok(())
    }

    fn check_not_held(&self, op: &'static str) -> LockResult<()> {
        let tid = current_tid();
        for index in 0..self.layout.mutexes {
            if self.record(index, op)?.local_count(tid) > 0 {
                return Err(LockError::Busy {
                    path: self.path.clone(),
                    op,
                });
            }
        }
        Ok(())
    }

    /// Caller holds every record
    fn resize_held(
        &self,
        target: usize,
        registers: &[(usize, i32)],
    ) -> LockResult<(MappedRegion, Layout)> {
        let previous = registers
            .iter()
            .map(|&(index, _)| self.get_register(index))
            .collect::<LockResult<Vec<_>>>()?;
        for &(index, _) in registers {
            self.set_register(index, REG_UNPUBLISHED)?;
        }

        match self.remap_locked(target) {
            Ok(grown) => {
                for &(index, value) in registers {
                    self.set_register(index, value)?;
                }
                Ok(grown)
            }
            Err(e) => {
                for (&(index, _), value) in registers.iter().zip(previous) {
                    let _ = self.set_register(index, value);
                }
                Err(e)
            }
        }
    }

    fn remap_locked(&self, target: usize) -> LockResult<(MappedRegion, Layout)> {
        let layout = Layout::new(self.layout.registers, target);
        let len = self
            .file
            .metadata()
            .map_err(|e| LockError::io(&self.path, "expand", e))?
            .len();
        if (layout.size() as u64) > len {
            self.file
                .set_len(layout.size() as u64)
                .map_err(|e| LockError::io(&self.path, "expand", e))?;
        }

        let region = MappedRegion::map(&self.file, layout.size())
            .map_err(|e| LockError::io(&self.path, "expand", e))?;

        let header = self.header();
        let initialized = header.mutex_initialized.load(Ordering::Acquire) as usize;
        for index in initialized.min(target)..target {
            // SAFETY: offset lies within the new mapping by construction of `layout`
            let record = unsafe { region.get::<MutexRecord>(layout.mutex_offset(index)) }
                .ok_or_else(|| self.invalid_index("expand", index, target))?;
            record
                .init()
                .map_err(|e| e.into_lock_error(&self.path, "expand", index, 0))?;
        }

        header.mutex_count.store(target as u32, Ordering::Release);
        header
            .mutex_initialized
            .store(target as u32, Ordering::Release);
        Ok((region, layout))
    }

    fn follow_expansion(&mut self) -> LockResult<()> {
        let (registers, mutexes) = self.header_counts();
        let layout = Layout::new(registers, mutexes);
        let region = MappedRegion::map(&self.file, layout.size())
            .map_err(|e| LockError::io(&self.path, "follow expand", e))?;
        debug!(
            path = %self.path.display(),
            from = self.layout.mutexes,
            to = mutexes,
            "followed lock file expansion"
        );
        self.region = region;
        self.layout = layout;
        Ok(())
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub fn snapshot(&self) -> LockFileSnapshot {
        let header = self.header();
        let registers = (0..self.layout.registers)
            .filter_map(|i| self.get_register(i).ok())
            .collect();
        let mutexes: Vec<MutexSnapshot> = (0..self.layout.mutexes)
            .filter_map(|i| self.record(i, "snapshot").ok().map(|r| r.snapshot(i)))
            .collect();
        LockFileSnapshot {
            path: self.path.clone(),
            version: header.version.load(Ordering::Acquire),
            record_size: header.record_size.load(Ordering::Acquire),
            register_count: header.register_count.load(Ordering::Acquire),
            mutex_count: header.mutex_count.load(Ordering::Acquire),
            mutex_initialized: header.mutex_initialized.load(Ordering::Acquire),
            registers,
            mutexes,
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let tid = current_tid();
        for index in 0..self.layout.mutexes {
            let Ok(record) = self.record(index, "close") else {
                continue;
            };
            while record.local_count(tid) > 0 {
                if record.unlock(tid).is_err() {
                    break;
                }
            }
        }
    }
}

fn open_rw(path: &Path) -> io::Result<File> {
    OpenOptions::new().read(true).write(true).open(path)
}

/// Returns the file and, when this call created it, its layout
fn open_or_create(
    path: &Path,
    geometry: Geometry,
    initial: &[i32],
    mode: u32,
) -> LockResult<(File, Option<Layout>)> {
    if let Ok(file) = open_rw(path) {
        return Ok((file, None));
    }

    if let Geometry::Exact { registers, mutexes } = geometry {
        let created = without_umask(|| {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .mode(mode)
                .open(path)
        });
        if let Ok(mut file) = created {
            let layout = Layout::new(registers, mutexes);
            let mut image = LockFileHeader::encode(registers, mutexes).to_vec();
            for value in initial {
                image.extend_from_slice(&value.to_ne_bytes());
            }
            file.write_all(&image)
                .and_then(|()| file.set_len(layout.size() as u64))
                .map_err(|e| LockError::io(path, "create", e))?;
            return Ok((file, Some(layout)));
        }
    }

    // someone else created it while we tried
    open_rw(path)
        .map(|file| (file, None))
        .map_err(|e| LockError::io(path, "open", e))
}

fn read_header(file: &File) -> io::Result<[u32; 5]> {
    let mut bytes = [0u8; LockFileHeader::SIZE];
    file.read_exact_at(&mut bytes, 0)?;
    let mut words = [0u32; 5];
    for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
        *word = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    Ok(words)
}

/// Poll until the file reaches the size its geometry implies
fn wait_for_size(file: &File, path: &Path, geometry: Geometry, retry: OpenRetry) -> LockResult<u64> {
    let mut attempts = 0;
    loop {
        let size = file
            .metadata()
            .map_err(|e| LockError::io(path, "stat", e))?
            .len();
        let wanted = match geometry {
            Geometry::Exact { registers, mutexes } => Layout::new(registers, mutexes).size() as u64,
            Geometry::Unchecked if size >= LockFileHeader::SIZE as u64 => {
                let [_, _, registers, mutexes, _] =
                    read_header(file).map_err(|e| LockError::io(path, "read header", e))?;
                Layout::new(registers as usize, mutexes as usize).size() as u64
            }
            Geometry::Unchecked => u64::MAX,
        };
        if size >= wanted || attempts >= retry.attempts {
            return Ok(size);
        }
        attempts += 1;
        std::thread::sleep(retry.delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn exact(registers: usize, mutexes: usize) -> Geometry {
        Geometry::Exact { registers, mutexes }
    }

    fn quick() -> OpenRetry {
        OpenRetry {
            attempts: 2,
            delay: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_create_then_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");

        let (first, created) = LockFile::open(&path, exact(3, 4), 0o666, quick()).unwrap();
        assert!(created);
        let (second, created) = LockFile::open(&path, exact(3, 4), 0o666, quick()).unwrap();
        assert!(!created);

        assert_eq!(second.mutex_count(), 4);
        assert_eq!(second.register_count(), 3);
        assert_eq!(first.snapshot().mutex_initialized, 4);
    }

    #[test]
    fn test_count_mismatches_are_distinct() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");
        let _owner = LockFile::open(&path, exact(3, 4), 0o666, quick()).unwrap();

        let err = LockFile::open(&path, exact(2, 4), 0o666, quick()).unwrap_err();
        assert!(matches!(err, LockError::RegisterCountMismatch { found: 3, expected: 2, .. }));

        let err = LockFile::open(&path, exact(3, 2), 0o666, quick()).unwrap_err();
        assert!(matches!(err, LockError::MutexCountMismatch { found: 4, expected: 2, .. }));

        let err = LockFile::open(&path, exact(3, 9), 0o666, quick()).unwrap_err();
        assert!(matches!(err, LockError::TooSmall { .. }));
    }

    #[test]
    fn test_version_and_abi_skew() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");
        drop(LockFile::open(&path, exact(1, 1), 0o666, quick()).unwrap());

        let file = open_rw(&path).unwrap();
        file.write_all_at(&(LOCK_FILE_VERSION + 1).to_ne_bytes(), 0)
            .unwrap();
        let err = LockFile::open(&path, exact(1, 1), 0o666, quick()).unwrap_err();
        assert!(matches!(err, LockError::VersionMismatch { .. }));

        file.write_all_at(&LOCK_FILE_VERSION.to_ne_bytes(), 0).unwrap();
        file.write_all_at(&7u32.to_ne_bytes(), 4).unwrap();
        let err = LockFile::open(&path, exact(1, 1), 0o666, quick()).unwrap_err();
        assert!(matches!(err, LockError::RecordSizeMismatch { found: 7, .. }));
    }

    #[test]
    fn test_unchecked_adopts_existing_counts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");

        assert!(LockFile::open(&path, Geometry::Unchecked, 0o666, quick()).is_err());

        let _owner = LockFile::open(&path, exact(3, 6), 0o666, quick()).unwrap();
        let (lf, created) = LockFile::open(&path, Geometry::Unchecked, 0o666, quick()).unwrap();
        assert!(!created);
        assert_eq!(lf.mutex_count(), 6);
        assert_eq!(lf.register_count(), 3);
    }

    #[test]
    fn test_registers() {
        let dir = tempfile::tempdir().unwrap();
        let (lf, _) =
            LockFile::open(&dir.path().join("lock"), exact(2, 1), 0o666, quick()).unwrap();

        assert_eq!(lf.get_register(0).unwrap(), 0);
        lf.set_register(0, 41).unwrap();
        assert_eq!(lf.inc_register(0).unwrap(), 42);
        assert_eq!(lf.dec_register(0).unwrap(), 41);
        assert_eq!(lf.add_register(1, -5).unwrap(), -5);
        assert!(lf.cas_register(1, -5, 9).unwrap());
        assert!(!lf.cas_register(1, -5, 10).unwrap());
        assert_eq!(lf.get_register(1).unwrap(), 9);

        let err = lf.get_register(2).unwrap_err();
        assert!(matches!(err, LockError::InvalidIndex { index: 2, limit: 2, .. }));
    }

    #[test]
    fn test_lock_unlock_and_close_releases() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");
        let (lf, _) = LockFile::open(&path, exact(0, 2), 0o666, quick()).unwrap();

        assert_eq!(lf.lock(1, true).unwrap(), LockStatus::Acquired);
        assert_eq!(lf.lock(1, false).unwrap(), LockStatus::Acquired);
        assert_eq!(lf.local_count(1).unwrap(), 2);
        assert!(lf.unlock(0).unwrap_err().is_not_owner());
        drop(lf);

        let (lf, _) = LockFile::open(&path, exact(0, 2), 0o666, quick()).unwrap();
        assert_eq!(lf.owner_id(1).unwrap(), 0);
        assert_eq!(lf.lock_count(1).unwrap(), 0);
    }

    #[test]
    fn test_expand_and_follow() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");
        let (mut grower, _) = LockFile::open(&path, exact(3, 2), 0o666, quick()).unwrap();
        let (mut follower, _) = LockFile::open(&path, exact(3, 2), 0o666, quick()).unwrap();

        grower.expand(Some(5)).unwrap();
        assert_eq!(grower.mutex_count(), 5);
        assert!(matches!(
            follower.check_header(),
            Err(LockError::Stale { .. })
        ));

        follower.expand(None).unwrap();
        follower.check_header().unwrap();
        assert_eq!(follower.mutex_count(), 5);
        assert_eq!(follower.lock(4, false).unwrap(), LockStatus::Acquired);
        follower.unlock(4).unwrap();

        let (fresh, created) = LockFile::open(&path, exact(3, 5), 0o666, quick()).unwrap();
        assert!(!created);
        assert_eq!(fresh.snapshot().mutex_initialized, 5);
    }

    #[test]
    fn test_expand_refused_while_holding() {
        let dir = tempfile::tempdir().unwrap();
        let (mut lf, _) =
            LockFile::open(&dir.path().join("lock"), exact(0, 2), 0o666, quick()).unwrap();
        lf.lock(0, true).unwrap();
        assert!(matches!(lf.expand(Some(4)), Err(LockError::Busy { .. })));
        lf.unlock(0).unwrap();
        lf.expand(Some(4)).unwrap();
        assert_eq!(lf.mutex_count(), 4);
    }

    #[test]
    fn test_expand_publishes_registers_with_counts() {
        let dir = tempfile::tempdir().unwrap();
        let (mut lf, _) =
            LockFile::open(&dir.path().join("lock"), exact(3, 2), 0o666, quick()).unwrap();
        lf.set_register(0, -1).unwrap();
        lf.set_register(1, 9).unwrap();

        lf.expand_publishing(6, &[(0, 2), (2, 0)]).unwrap();
        assert_eq!(lf.mutex_count(), 6);
        assert_eq!(lf.header_counts(), (3, 6));
        assert_eq!(lf.get_register(0).unwrap(), 2);
        assert_eq!(lf.get_register(1).unwrap(), 9);

        // an unknown register leaves counts and values untouched
        assert!(lf.expand_publishing(8, &[(0, -1), (3, 1)]).is_err());
        assert_eq!(lf.header_counts(), (3, 6));
        assert_eq!(lf.get_register(0).unwrap(), 2);
        assert_eq!(lf.lock_count(0).unwrap(), 0);
    }
}
