/*!
 * Robust Shared Mutex
 *
 * A process-shared, owner-tracked, recursive mutex record that lives inside
 * a mapped lock file. The kernel object is a robust pthread mutex, so the
 * death of a holder is reported to the next acquirer instead of leaving the
 * lock wedged.
 *
 * Ownership and nesting are tracked in the record itself: `owner` holds the
 * kernel thread id of the holder and `count` the nesting depth. Both fields
 * are only written by the thread that holds the kernel object.
 */

use crate::core::errors::LockError;
use crate::core::types::{LockStatus, OwnerId};
use serde::{Deserialize, Serialize};
use std::cell::UnsafeCell;
use std::path::Path;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use thiserror::Error;

/// Failure of a single mutex operation, lifted into `LockError` by callers
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexError {
    #[error("would block")]
    WouldBlock,

    #[error("caller is not the owner (owner {owner}, count {count})")]
    NotOwner { owner: OwnerId, count: i32 },

    #[error("pthread error {0}")]
    Os(i32),
}

impl MutexError {
    /// Attach lock-file context
    pub fn into_lock_error(
        self,
        path: &Path,
        op: &'static str,
        index: usize,
        caller: OwnerId,
    ) -> LockError {
        match self {
            MutexError::WouldBlock => LockError::WouldBlock {
                path: path.to_path_buf(),
                op,
            },
            MutexError::NotOwner { owner, count } => LockError::NotOwner {
                path: path.to_path_buf(),
                op,
                index,
                owner,
                caller,
                count,
            },
            MutexError::Os(errno) => LockError::os(path, op, errno),
        }
    }
}

/// Mutex record as laid out in the lock file
#[repr(C)]
pub struct MutexRecord {
    mutex: UnsafeCell<libc::pthread_mutex_t>,
    owner: AtomicU32,
    count: AtomicI32,
}

// SAFETY: the pthread mutex is process-shared and designed for concurrent
// access through shared references; owner/count are atomics.
unsafe impl Sync for MutexRecord {}
unsafe impl Send for MutexRecord {}

/// Point-in-time view of a record, for dumps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutexSnapshot {
    pub index: usize,
    pub owner: OwnerId,
    pub count: i32,
}

impl MutexRecord {
    /// Bytes occupied by one record; persisted in the header to detect ABI skew
    pub const SIZE: usize = std::mem::size_of::<MutexRecord>();

    /// Required alignment of the record array inside the lock file
    pub const ALIGN: usize = std::mem::align_of::<MutexRecord>();

    #[inline]
    fn raw(&self) -> *mut libc::pthread_mutex_t {
        self.mutex.get()
    }

    /// Initialize the kernel object as process-shared and robust, unowned
    ///
    /// Must only be called on a record no other thread can be using.
    pub fn init(&self) -> Result<(), MutexError> {
        // SAFETY: attr is initialized before use and destroyed on every path;
        // the record is not in use per this function's contract.
        unsafe {
            let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
            check(libc::pthread_mutexattr_init(&mut attr))?;
            let rc = configure_attr(&mut attr)
                .and_then(|()| check(libc::pthread_mutex_init(self.raw(), &attr)));
            libc::pthread_mutexattr_destroy(&mut attr);
            rc?;
        }
        self.owner.store(0, Ordering::Release);
        self.count.store(0, Ordering::Release);
        Ok(())
    }

    /// Acquire for `tid`, nesting if `tid` already owns the record
    pub fn lock(&self, blocking: bool, tid: OwnerId) -> Result<LockStatus, MutexError> {
        if tid != 0 && self.owner.load(Ordering::Acquire) == tid {
            self.count.fetch_add(1, Ordering::AcqRel);
            return Ok(LockStatus::Acquired);
        }

        // SAFETY: the mutex was initialized when the lock file was created
        let rc = unsafe {
            if blocking {
                libc::pthread_mutex_lock(self.raw())
            } else {
                libc::pthread_mutex_trylock(self.raw())
            }
        };

        match rc {
            0 => {
                self.owner.store(tid, Ordering::Release);
                self.count.store(1, Ordering::Release);
                Ok(LockStatus::Acquired)
            }
            libc::EBUSY => Err(MutexError::WouldBlock),
            rc if is_owner_dead(rc) => self.adopt(tid, mark_consistent),
            rc => Err(MutexError::Os(rc)),
        }
    }

    /// Take over a mutex the kernel handed back from a dead holder
    fn adopt(
        &self,
        tid: OwnerId,
        consistent: fn(*mut libc::pthread_mutex_t) -> Result<(), MutexError>,
    ) -> Result<LockStatus, MutexError> {
        if let Err(e) = consistent(self.raw()) {
            // SAFETY: the calling thread holds the kernel mutex at this point
            unsafe { libc::pthread_mutex_unlock(self.raw()) };
            return Err(e);
        }
        self.owner.store(tid, Ordering::Release);
        self.count.store(1, Ordering::Release);
        Ok(LockStatus::OwnerDied)
    }

    /// Release one nesting level held by `tid`
    pub fn unlock(&self, tid: OwnerId) -> Result<(), MutexError> {
        let owner = self.owner.load(Ordering::Acquire);
        let count = self.count.load(Ordering::Acquire);
        if owner != tid || count <= 0 {
            return Err(MutexError::NotOwner { owner, count });
        }

        if count > 1 {
            self.count.store(count - 1, Ordering::Release);
            return Ok(());
        }

        self.count.store(0, Ordering::Release);
        self.owner.store(0, Ordering::Release);
        // SAFETY: this thread holds the kernel object (owner == tid, count == 1)
        check(unsafe { libc::pthread_mutex_unlock(self.raw()) })
    }

    /// Current owner, zero when free
    #[inline]
    pub fn owner_id(&self) -> OwnerId {
        self.owner.load(Ordering::Acquire)
    }

    /// Nesting depth of the current owner
    #[inline]
    pub fn lock_count(&self) -> i32 {
        self.count.load(Ordering::Acquire)
    }

    /// Nesting depth held by `tid`, zero if `tid` is not the owner
    #[inline]
    pub fn local_count(&self, tid: OwnerId) -> i32 {
        if tid != 0 && self.owner_id() == tid {
            self.lock_count()
        } else {
            0
        }
    }

    pub fn snapshot(&self, index: usize) -> MutexSnapshot {
        MutexSnapshot {
            index,
            owner: self.owner_id(),
            count: self.lock_count(),
        }
    }
}

#[inline]
fn check(rc: libc::c_int) -> Result<(), MutexError> {
    if rc == 0 {
        Ok(())
    } else {
        Err(MutexError::Os(rc))
    }
}

#[cfg(target_os = "linux")]
unsafe fn configure_attr(attr: *mut libc::pthread_mutexattr_t) -> Result<(), MutexError> {
    check(libc::pthread_mutexattr_setpshared(
        attr,
        libc::PTHREAD_PROCESS_SHARED,
    ))?;
    check(libc::pthread_mutexattr_setrobust(
        attr,
        libc::PTHREAD_MUTEX_ROBUST,
    ))
}

#[cfg(not(target_os = "linux"))]
unsafe fn configure_attr(attr: *mut libc::pthread_mutexattr_t) -> Result<(), MutexError> {
    check(libc::pthread_mutexattr_setpshared(
        attr,
        libc::PTHREAD_PROCESS_SHARED,
    ))
}

#[cfg(target_os = "linux")]
#[inline]
fn is_owner_dead(rc: libc::c_int) -> bool {
    rc == libc::EOWNERDEAD
}

#[cfg(not(target_os = "linux"))]
#[inline]
fn is_owner_dead(_rc: libc::c_int) -> bool {
    false
}

#[cfg(target_os = "linux")]
fn mark_consistent(mutex: *mut libc::pthread_mutex_t) -> Result<(), MutexError> {
    // SAFETY: called only right after the kernel handed us the mutex with EOWNERDEAD
    check(unsafe { libc::pthread_mutex_consistent(mutex) })
}

#[cfg(not(target_os = "linux"))]
fn mark_consistent(_mutex: *mut libc::pthread_mutex_t) -> Result<(), MutexError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::thread_ctx::current_tid;
    use std::mem::MaybeUninit;
    use std::sync::Arc;

    fn fresh() -> Arc<MutexRecord> {
        // SAFETY: all-zero bytes are a valid record image; init() sets it up
        // in place so the kernel object never moves afterwards.
        let record: Arc<MutexRecord> = Arc::new(unsafe { MaybeUninit::zeroed().assume_init() });
        record.init().unwrap();
        record
    }

    #[test]
    fn test_recursive_lock_and_unlock() {
        let record = fresh();
        let tid = current_tid();

        assert_eq!(record.lock(true, tid), Ok(LockStatus::Acquired));
        assert_eq!(record.lock(false, tid), Ok(LockStatus::Acquired));
        assert_eq!(record.local_count(tid), 2);
        assert_eq!(record.owner_id(), tid);

        record.unlock(tid).unwrap();
        assert_eq!(record.local_count(tid), 1);
        record.unlock(tid).unwrap();
        assert_eq!(record.owner_id(), 0);
        assert_eq!(record.lock_count(), 0);
    }

    #[test]
    fn test_unlock_without_hold_is_rejected() {
        let record = fresh();
        let tid = current_tid();
        assert_eq!(
            record.unlock(tid),
            Err(MutexError::NotOwner { owner: 0, count: 0 })
        );
    }

    #[test]
    fn test_try_lock_contended() {
        let record = fresh();
        let tid = current_tid();
        record.lock(true, tid).unwrap();

        let other = record.clone();
        let res = std::thread::spawn(move || other.lock(false, current_tid()))
            .join()
            .unwrap();
        assert_eq!(res, Err(MutexError::WouldBlock));

        record.unlock(tid).unwrap();
    }

    #[test]
    fn test_other_thread_cannot_unlock() {
        let record = fresh();
        let tid = current_tid();
        record.lock(true, tid).unwrap();

        let other = record.clone();
        let res = std::thread::spawn(move || other.unlock(current_tid()))
            .join()
            .unwrap();
        assert!(matches!(res, Err(MutexError::NotOwner { owner, count: 1 }) if owner == tid));

        record.unlock(tid).unwrap();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_thread_death_reports_owner_died_once() {
        let record = fresh();

        let holder = record.clone();
        std::thread::spawn(move || {
            holder.lock(true, current_tid()).unwrap();
        })
        .join()
        .unwrap();

        let tid = current_tid();
        assert_eq!(record.lock(true, tid), Ok(LockStatus::OwnerDied));
        assert_eq!(record.lock_count(), 1);
        record.unlock(tid).unwrap();

        assert_eq!(record.lock(true, tid), Ok(LockStatus::Acquired));
        record.unlock(tid).unwrap();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_failed_recovery_releases_kernel_mutex() {
        let record = fresh();
        let tid = current_tid();
        // SAFETY: the record was initialized by fresh()
        assert_eq!(unsafe { libc::pthread_mutex_lock(record.raw()) }, 0);

        let res = record.adopt(tid, |_| Err(MutexError::Os(libc::ENOTRECOVERABLE)));
        assert_eq!(res, Err(MutexError::Os(libc::ENOTRECOVERABLE)));
        assert_eq!(record.owner_id(), 0);

        let other = record.clone();
        let res = std::thread::spawn(move || {
            let tid = current_tid();
            let status = other.lock(false, tid);
            other.unlock(tid).map(|_| status)
        })
        .join()
        .unwrap();
        assert_eq!(res, Ok(Ok(LockStatus::Acquired)));
    }
}
