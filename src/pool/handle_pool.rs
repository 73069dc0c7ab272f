/*!
 * Handle Pool
 *
 * Fixed set of duplicated handles lent to worker threads. Lending is the
 * read side of a read-write lock over the original handle; exclusive
 * access to the original is the write side, so it waits for every lent
 * handle to come back and holds off new loans until it is dropped.
 *
 * Do not request exclusive access while holding a pooled handle on the
 * same thread: the write side waits for that very loan.
 */

use super::types::{PoolError, PoolResult, PoolStats};
use crate::core::limits::POOL_WAIT_SLICE;
use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::fmt;
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// A handle that can open an independent copy of itself
pub trait DuplicateHandle: Sized + Send {
    type Error: fmt::Display;

    fn duplicate(&self) -> Result<Self, Self::Error>;
}

/// Pool of duplicated handles
pub struct HandlePool<H> {
    original: RwLock<H>,
    available: Mutex<Vec<H>>,
    cond: Condvar,
    size: usize,
    requested: usize,
}

impl<H> fmt::Debug for HandlePool<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlePool")
            .field("size", &self.size)
            .field("requested", &self.requested)
            .finish()
    }
}

impl<H: DuplicateHandle> HandlePool<H> {
    /// Duplicate `original` `size` times
    ///
    /// When a duplication fails after some succeeded, half of the handles
    /// opened so far are closed again to leave resources for the rest of
    /// the process. Fails only when no handle could be duplicated.
    pub fn new(original: H, size: usize) -> PoolResult<Self> {
        if size == 0 {
            return Err(PoolError::InvalidSize(size));
        }

        let mut handles = Vec::with_capacity(size);
        let mut failure = None;
        while handles.len() < size {
            match original.duplicate() {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    failure = Some(e.to_string());
                    break;
                }
            }
        }

        if let Some(reason) = failure {
            let opened = handles.len();
            if opened > 1 {
                handles.truncate(opened - opened / 2);
            }
            warn!(
                requested = size,
                opened,
                kept = handles.len(),
                reason = %reason,
                "handle duplication failed; backing off pool size"
            );
            if handles.is_empty() {
                return Err(PoolError::DuplicationFailed {
                    requested: size,
                    reason,
                });
            }
        }

        let pool_size = handles.len();
        info!(size = pool_size, requested = size, "handle pool created");
        Ok(Self {
            original: RwLock::new(original),
            available: Mutex::new(handles),
            cond: Condvar::new(),
            size: pool_size,
            requested: size,
        })
    }
}

impl<H> HandlePool<H> {
    /// Handles owned by the pool
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            size: self.size,
            requested: self.requested,
            available: self.available.lock().len(),
        }
    }

    /// Borrow a handle, waiting as long as it takes
    pub fn acquire(&self) -> PooledHandle<'_, H> {
        let loan = self.original.read();
        let mut available = self.available.lock();
        loop {
            if let Some(handle) = available.pop() {
                return PooledHandle {
                    pool: self,
                    handle: ManuallyDrop::new(handle),
                    _loan: loan,
                };
            }
            // timed slices so a missed wakeup only costs one slice
            self.cond.wait_for(&mut available, POOL_WAIT_SLICE);
        }
    }

    /// Borrow a handle, giving up after `timeout`
    pub fn acquire_timeout(&self, timeout: Duration) -> PoolResult<PooledHandle<'_, H>> {
        let deadline = Instant::now() + timeout;
        let loan = self
            .original
            .try_read_until(deadline)
            .ok_or(PoolError::Timeout(timeout))?;
        let mut available = self.available.lock();
        loop {
            if let Some(handle) = available.pop() {
                return Ok(PooledHandle {
                    pool: self,
                    handle: ManuallyDrop::new(handle),
                    _loan: loan,
                });
            }
            if Instant::now() >= deadline {
                debug!(?timeout, "handle pool acquire timed out");
                return Err(PoolError::Timeout(timeout));
            }
            self.cond.wait_until(&mut available, deadline);
        }
    }

    /// Borrow a handle only if one is free right now
    pub fn try_acquire(&self) -> PoolResult<PooledHandle<'_, H>> {
        let loan = self.original.try_read().ok_or(PoolError::EmptyPool)?;
        let handle = self.available.lock().pop().ok_or(PoolError::EmptyPool)?;
        Ok(PooledHandle {
            pool: self,
            handle: ManuallyDrop::new(handle),
            _loan: loan,
        })
    }

    /// Sole access to the original handle
    ///
    /// Waits until every lent handle is returned; ordinary acquires block
    /// until the returned guard is dropped.
    pub fn acquire_exclusive(&self) -> ExclusiveHandle<'_, H> {
        debug!("waiting for exclusive handle");
        ExclusiveHandle {
            guard: self.original.write(),
        }
    }

    fn give_back(&self, handle: H) {
        self.available.lock().push(handle);
        self.cond.notify_one();
    }
}

/// A handle lent from the pool; returned on drop
pub struct PooledHandle<'a, H> {
    pool: &'a HandlePool<H>,
    handle: ManuallyDrop<H>,
    _loan: RwLockReadGuard<'a, H>,
}

impl<H> Deref for PooledHandle<'_, H> {
    type Target = H;

    fn deref(&self) -> &H {
        &self.handle
    }
}

impl<H> DerefMut for PooledHandle<'_, H> {
    fn deref_mut(&mut self) -> &mut H {
        &mut self.handle
    }
}

impl<H> Drop for PooledHandle<'_, H> {
    fn drop(&mut self) {
        // SAFETY: the handle is taken exactly once, here
        let handle = unsafe { ManuallyDrop::take(&mut self.handle) };
        self.pool.give_back(handle);
    }
}

/// Sole access to the pool's original handle
pub struct ExclusiveHandle<'a, H> {
    guard: RwLockWriteGuard<'a, H>,
}

impl<H> Deref for ExclusiveHandle<'_, H> {
    type Target = H;

    fn deref(&self) -> &H {
        &self.guard
    }
}

impl<H> DerefMut for ExclusiveHandle<'_, H> {
    fn deref_mut(&mut self) -> &mut H {
        &mut self.guard
    }
}
