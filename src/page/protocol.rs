/*!
 * Page Lock Protocol
 *
 * Wraps each storage operation's page access:
 *
 * 1. pick the lock kind from the lock mode, the access and the key
 * 2. acquire it, non-blocking first and then blocking if permitted
 * 3. after a dead owner's lock is recovered, run the integrity pass when the
 *    lock is exclusive (otherwise defer it to the next exclusive hold)
 * 4. if the resource was replaced or resized, upgrade and replace/remap
 * 5. resynchronize a stale directory; partitioned locks re-derive their
 *    partition afterwards
 * 6. take the backing-store lock, unwinding the local lock on failure
 *
 * Steps 2-5 run in a bounded loop until the resource generation is stable.
 * Release order is always backing store first, then the local lock.
 */

use super::traits::PageStore;
use super::types::{Acquisition, PageRequest, ProtocolState};
use crate::core::config::LockConfig;
use crate::core::errors::{LockError, LockResult};
use crate::core::types::{Access, LockMode, LockStatus};
use crate::monitoring::span_lock_wait;
use crate::plugin::{resolve_resource, LockBackend, LockKind, LockRegistry, OpenFlags, OpenReport};
use crate::sync::current_tid;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Progress carried across protocol attempts
#[derive(Debug, Clone, Copy)]
struct Progress {
    status: LockStatus,
    integrity_checked: bool,
}

/// Page lock protocol driver for one open resource
///
/// Lock ownership is per thread, so a `PageLocker` is used by the thread
/// that acquires through it.
#[derive(Debug)]
pub struct PageLocker {
    backend: Box<dyn LockBackend>,
    resource: PathBuf,
    lock_path: PathBuf,
    config: LockConfig,
    pending_check: bool,
}

impl PageLocker {
    /// Open `resource` through the backend registered as `backend`
    pub fn open(
        registry: &LockRegistry,
        backend: &str,
        resource: &Path,
        mode: LockMode,
        flags: OpenFlags,
    ) -> LockResult<(Self, OpenReport)> {
        let resource = resolve_resource(resource)?;
        let mut lock_backend = registry.create(backend)?;
        let report = lock_backend.open(&resource, mode, 0, flags)?;
        let mut locker = Self::new(lock_backend, resource, registry.config().clone())?;
        locker.pending_check = report.need_check;
        Ok((locker, report))
    }

    /// Wrap a backend that is already open on `resource`
    pub fn new(
        backend: Box<dyn LockBackend>,
        resource: PathBuf,
        config: LockConfig,
    ) -> LockResult<Self> {
        if !backend.is_open() {
            return Err(LockError::NotOpen { op: "page locker" });
        }
        let lock_path = backend.lock_path(&resource)?;
        Ok(Self {
            backend,
            resource,
            lock_path,
            config,
            pending_check: false,
        })
    }

    pub fn resource(&self) -> &Path {
        &self.resource
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    pub fn backend(&self) -> &dyn LockBackend {
        self.backend.as_ref()
    }

    pub fn mode(&self) -> Option<LockMode> {
        self.backend.mode()
    }

    /// Protocol state as seen by the calling thread
    pub fn state(&self) -> ProtocolState {
        if self.pending_check {
            return ProtocolState::NeedsIntegrityCheck;
        }
        if self.held(LockKind::Exclusive) > 0 {
            ProtocolState::ExclusiveHeld
        } else if self.held(LockKind::Index) > 0 || self.held(LockKind::Shared) > 0 {
            ProtocolState::ShareHeld
        } else {
            ProtocolState::Unlocked
        }
    }

    /// Nesting depth of `kind`, by this thread or by anyone
    pub fn is_held(&self, kind: LockKind, by_self: bool) -> LockResult<usize> {
        self.backend.held_count(kind, by_self)
    }

    fn held(&self, kind: LockKind) -> usize {
        self.backend.held_count(kind, true).unwrap_or(0)
    }

    /// Acquire the lock protecting the page `req.key` lives on
    pub fn acquire<S: PageStore + ?Sized>(
        &mut self,
        store: &mut S,
        req: PageRequest<'_>,
    ) -> LockResult<Acquisition> {
        let mode = self.backend.mode().ok_or(LockError::NotOpen { op: "acquire" })?;
        if req.access == Access::Write && store.is_read_only() {
            return Err(LockError::ReadOnly {
                path: self.lock_path.clone(),
            });
        }

        let hash = req.key.map(|key| store.hash(key));
        let retries = self.config.protocol_retries.max(1);
        let mut progress = Progress {
            status: LockStatus::Acquired,
            integrity_checked: false,
        };

        for attempt in 1..=retries {
            let acquired = match (mode, hash) {
                (LockMode::Partitioned, Some(hash)) => {
                    self.attempt_partition(store, req, hash, &mut progress)?
                }
                _ => self.attempt_whole(store, req, mode, hash, &mut progress)?,
            };
            let Some((kind, partition, page)) = acquired else {
                debug!(
                    path = %self.lock_path.display(),
                    attempt,
                    "resource generation changed; retrying page lock"
                );
                continue;
            };

            if let Err(e) = store.backing_lock(req.key, req.access) {
                error!(
                    path = %self.lock_path.display(),
                    error = %e,
                    "backing store lock failed"
                );
                self.unlock_quietly(kind);
                return Err(e);
            }

            return Ok(Acquisition {
                kind,
                partition,
                page,
                status: progress.status,
                integrity_checked: progress.integrity_checked,
                attempts: attempt,
            });
        }

        error!(
            path = %self.lock_path.display(),
            attempts = retries,
            "resource generation never stabilized"
        );
        Err(LockError::GenerationUnstable {
            path: self.lock_path.clone(),
            attempts: retries,
        })
    }

    /// Release the most significant lock this thread holds
    pub fn release<S: PageStore + ?Sized>(
        &mut self,
        store: &mut S,
        key: Option<&[u8]>,
    ) -> LockResult<()> {
        let kind = if self.held(LockKind::Exclusive) > 0 {
            LockKind::Exclusive
        } else if self.held(LockKind::Index) > 0 {
            LockKind::Index
        } else if self.held(LockKind::Shared) > 0 {
            LockKind::Shared
        } else {
            error!(path = %self.lock_path.display(), "release of a page lock that is not held");
            return Err(LockError::NotOwner {
                path: self.lock_path.clone(),
                op: "release",
                index: 0,
                owner: 0,
                caller: current_tid(),
                count: 0,
            });
        };
        store.backing_unlock(key);
        self.backend.unlock(kind)
    }

    /// Reinitialize every lock of the resource
    pub fn reset(&mut self) -> LockResult<()> {
        self.pending_check = false;
        self.backend.reset()
    }

    pub fn close(&mut self) {
        self.backend.close();
    }

    /// Single or shared locking: one whole-resource slot
    fn attempt_whole<S: PageStore + ?Sized>(
        &mut self,
        store: &mut S,
        req: PageRequest<'_>,
        mode: LockMode,
        hash: Option<u32>,
        progress: &mut Progress,
    ) -> LockResult<Option<(LockKind, Option<usize>, Option<u32>)>> {
        let mut kind = if req.access == Access::Read && mode == LockMode::Shared {
            LockKind::Shared
        } else {
            LockKind::Exclusive
        };
        self.lock_checked(store, kind, 0, req.blocking, progress)?;

        if generation_changed(store) {
            if kind != LockKind::Exclusive {
                // a reader cannot replace; trade the reader slot for exclusive
                self.backend.unlock(kind)?;
                kind = LockKind::Exclusive;
                self.lock_checked(store, kind, 0, req.blocking, progress)?;
            }
            if let Err(e) = self.apply_generation(store) {
                self.unlock_quietly(kind);
                return Err(e);
            }
            if generation_changed(store) {
                self.backend.unlock(kind)?;
                return Ok(None);
            }
        }

        if store.dir_generation_changed() {
            store.sync_dir();
        }
        Ok(Some((kind, None, hash.map(|hash| store.page_of(hash)))))
    }

    /// Partitioned locking: the slot selected by the key's page
    fn attempt_partition<S: PageStore + ?Sized>(
        &mut self,
        store: &mut S,
        req: PageRequest<'_>,
        hash: u32,
        progress: &mut Progress,
    ) -> LockResult<Option<(LockKind, Option<usize>, Option<u32>)>> {
        let parts = self.backend.count(LockKind::Index).max(1);
        let page = store.page_of(hash);
        let partition = page as usize % parts;

        let kind = if self.held(LockKind::Exclusive) > 0 {
            LockKind::Exclusive
        } else {
            if self.held(LockKind::Index) > 0
                && self.backend.held_count_at(LockKind::Index, true, partition)? == 0
            {
                warn!(
                    path = %self.lock_path.display(),
                    wanted = partition,
                    "partition locking conflict"
                );
                return Err(LockError::PartitionConflict {
                    path: self.lock_path.clone(),
                    wanted: partition,
                });
            }
            LockKind::Index
        };
        self.lock_checked(store, kind, partition, req.blocking, progress)?;

        if generation_changed(store) {
            // drop the partition before waiting on exclusive
            self.backend.unlock(kind)?;
            self.lock_checked(store, LockKind::Exclusive, 0, req.blocking, progress)?;
            let applied = self.apply_generation(store);
            self.backend.unlock(LockKind::Exclusive)?;
            applied?;
            return Ok(None);
        }

        if store.dir_generation_changed() {
            store.sync_dir();
            // page to partition mapping may have moved
            self.backend.unlock(kind)?;
            return Ok(None);
        }
        Ok(Some((kind, Some(partition), Some(page))))
    }

    /// Lock, following expansions and handling owner death
    fn lock_checked<S: PageStore + ?Sized>(
        &mut self,
        store: &mut S,
        kind: LockKind,
        partition: usize,
        blocking: bool,
        progress: &mut Progress,
    ) -> LockResult<()> {
        let status = self.lock_step(kind, partition, blocking)?;
        progress.status = progress.status.merge(status);
        if status.owner_died() {
            warn!(
                path = %self.lock_path.display(),
                resource = %self.resource.display(),
                ?kind,
                "previous lock owner died"
            );
            self.pending_check = true;
        }
        if self.pending_check && self.recover(store, kind)? {
            progress.integrity_checked = true;
        }
        Ok(())
    }

    /// Try without blocking, then block if the caller allows it
    fn lock_step(&mut self, kind: LockKind, partition: usize, blocking: bool) -> LockResult<LockStatus> {
        let retries = self.config.protocol_retries.max(1);
        let mut refreshed = 0;
        loop {
            let result = match self.backend.lock(kind, false, partition) {
                Err(e) if e.is_would_block() && blocking => {
                    let span = span_lock_wait("page lock", &self.lock_path, self.config.slow_wait);
                    let result = self.backend.lock(kind, true, partition);
                    span.record_result(result.is_ok());
                    result
                }
                other => other,
            };
            match result {
                Err(LockError::Stale { .. }) if refreshed < retries => {
                    refreshed += 1;
                    debug!(path = %self.lock_path.display(), "lock file resized; following");
                    self.backend.refresh()?;
                }
                other => return other,
            }
        }
    }

    /// Integrity pass after owner death
    ///
    /// Runs only with the exclusive lock held; a reader tries a non-blocking
    /// upgrade and otherwise leaves the check pending. Returns whether the
    /// pass ran.
    fn recover<S: PageStore + ?Sized>(&mut self, store: &mut S, kind: LockKind) -> LockResult<bool> {
        let upgraded = if self.held(LockKind::Exclusive) > 0 {
            false
        } else {
            match self.backend.lock(LockKind::Upgrade, false, 0) {
                Ok(_) => true,
                Err(e) if e.is_would_block() => {
                    info!(
                        path = %self.lock_path.display(),
                        "integrity check deferred until the exclusive lock is available"
                    );
                    return Ok(false);
                }
                Err(e) => {
                    self.unlock_quietly(kind);
                    return Err(e);
                }
            }
        };

        info!(resource = %self.resource.display(), "integrity check after lock owner death");
        let errors = store.check_integrity();
        if upgraded {
            self.backend.unlock(LockKind::Upgrade)?;
        }

        if errors > 0 {
            error!(
                resource = %self.resource.display(),
                errors,
                "integrity check failed"
            );
            self.unlock_quietly(kind);
            return Err(LockError::IntegrityCheckFailed {
                path: self.lock_path.clone(),
                errors,
            });
        }
        info!(resource = %self.resource.display(), "integrity check passed");
        self.pending_check = false;
        Ok(true)
    }

    fn apply_generation<S: PageStore + ?Sized>(&self, store: &mut S) -> LockResult<()> {
        if store.is_replaced() {
            info!(resource = %self.resource.display(), "resource replaced; reopening");
            store.replace()?;
        }
        if store.size_changed() {
            debug!(resource = %self.resource.display(), "resource resized; remapping");
            store.remap()?;
        }
        Ok(())
    }

    fn unlock_quietly(&self, kind: LockKind) {
        if let Err(e) = self.backend.unlock(kind) {
            warn!(
                path = %self.lock_path.display(),
                error = %e,
                ?kind,
                "unlock during unwind failed"
            );
        }
    }
}

fn generation_changed<S: PageStore + ?Sized>(store: &S) -> bool {
    store.is_replaced() || store.size_changed()
}
