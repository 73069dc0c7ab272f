/*!
 * Pthread Lock Backend
 *
 * Multi-lock over robust pthread mutexes, one lock file per resource. Base
 * slot 0 serves `LockKind::Internal`; the composite section serves every
 * other kind.
 */

use super::paths::{ensure_lock_dirs, lock_file_path, LockFileOwnership};
use super::registry::PTHREAD_BACKEND;
use super::traits::{LockBackend, LockKind, OpenFlags, OpenReport};
use crate::core::config::LockConfig;
use crate::core::errors::{LockError, LockResult};
use crate::core::limits::BACKEND_BASE_LOCKS;
use crate::core::types::{LockMode, LockStatus};
use crate::pool::DuplicateHandle;
use crate::shm::OpenRetry;
use crate::sync::{LockStateSnapshot, LockTarget, MultiLock, OpenSpec, Slot};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Mode used when opening a lock file that already exists
const EXISTING_FILE_MODE: u32 = 0o666;

#[derive(Debug)]
pub struct PthreadBackend {
    config: LockConfig,
    lock: Option<MultiLock>,
    resource: Option<(PathBuf, OpenFlags)>,
}

impl PthreadBackend {
    pub fn new(config: LockConfig) -> Self {
        Self {
            config,
            lock: None,
            resource: None,
        }
    }

    /// Resource this backend is open on
    pub fn resource(&self) -> Option<&Path> {
        self.resource.as_ref().map(|(path, _)| path.as_path())
    }

    fn multi(&self, op: &'static str) -> LockResult<&MultiLock> {
        self.lock.as_ref().ok_or(LockError::NotOpen { op })
    }

    fn retry(&self) -> OpenRetry {
        OpenRetry {
            attempts: self.config.open_retries,
            delay: self.config.open_retry_delay,
        }
    }

    fn open_multi(
        &self,
        lock_path: &Path,
        spec: OpenSpec,
        create_mode: u32,
    ) -> LockResult<(MultiLock, bool)> {
        MultiLock::open(lock_path, BACKEND_BASE_LOCKS, spec, create_mode, self.retry())
    }

    fn create(
        &self,
        resource: &Path,
        lock_path: &Path,
        spec: OpenSpec,
        flags: OpenFlags,
    ) -> LockResult<(MultiLock, bool)> {
        ensure_lock_dirs(lock_path)?;
        let ownership = LockFileOwnership::for_resource(resource, flags.memory_only)?;
        let (lock, created) = self.open_multi(lock_path, spec, ownership.mode)?;
        if created {
            let file = lock.lock_file().file();
            if let Err(e) = std::os::unix::fs::fchown(file, Some(ownership.uid), Some(ownership.gid))
            {
                debug!(
                    path = %lock_path.display(),
                    uid = ownership.uid,
                    gid = ownership.gid,
                    error = %e,
                    "could not hand lock file to resource owner"
                );
            }
        }
        Ok((lock, created))
    }

    /// Second chance after a configuration mismatch
    fn reconcile(
        &self,
        lock_path: &Path,
        spec: OpenSpec,
        flags: OpenFlags,
        mismatch: LockError,
    ) -> LockResult<(MultiLock, bool)> {
        let (mut lock, created) = self.open_multi(lock_path, OpenSpec::Unchecked, EXISTING_FILE_MODE)?;
        if flags.any_locks {
            return Ok((lock, created));
        }

        let OpenSpec::Checked { mode, .. } = spec else {
            return Err(mismatch);
        };
        if lock.mode() == LockMode::Single && mode.is_split() {
            info!(
                path = %lock_path.display(),
                to = %mode,
                "expanding single lock to finer-grained mode"
            );
            lock.expand(spec)?;
            return Ok((lock, created));
        }
        Err(mismatch)
    }

    fn check_kind(&self, multi: &MultiLock, kind: LockKind, op: &'static str) -> LockResult<()> {
        match kind.required_mode() {
            Some(mode) if mode != multi.mode() => Err(LockError::Unsupported {
                path: multi.path().to_path_buf(),
                op,
                mode: multi.mode().to_string(),
            }),
            _ => Ok(()),
        }
    }

    fn kind_matches(multi: &MultiLock, kind: LockKind) -> bool {
        kind.required_mode() == Some(multi.mode())
    }
}

impl LockBackend for PthreadBackend {
    fn name(&self) -> &'static str {
        PTHREAD_BACKEND
    }

    fn lock_path(&self, resource: &Path) -> LockResult<PathBuf> {
        lock_file_path(&self.config, resource)
    }

    fn open(
        &mut self,
        resource: &Path,
        mode: LockMode,
        count: usize,
        flags: OpenFlags,
    ) -> LockResult<OpenReport> {
        self.close();

        let lock_path = self.lock_path(resource)?;
        let count = if count == 0 {
            self.config.default_count(mode)
        } else {
            count
        };
        let spec = OpenSpec::Checked { mode, count };

        let opened = if lock_path.exists() {
            let spec = if flags.any_locks {
                OpenSpec::Unchecked
            } else {
                spec
            };
            self.open_multi(&lock_path, spec, EXISTING_FILE_MODE)
        } else {
            self.create(resource, &lock_path, spec, flags)
        };

        let (lock, created) = match opened {
            Ok(opened) => opened,
            Err(e) if e.is_config_mismatch() => self.reconcile(&lock_path, spec, flags, e)?,
            Err(e) => return Err(e),
        };

        let mut need_check = false;
        if flags.lock_now {
            let status = lock.lock(LockTarget::Exclusive, true)?;
            if status.owner_died() {
                warn!(
                    resource = %resource.display(),
                    "integrity check needed: previous lock owner died"
                );
                need_check = true;
            }
        }

        debug!(
            resource = %resource.display(),
            path = %lock_path.display(),
            mode = %lock.mode(),
            parts = lock.part_count(),
            created,
            "lock backend opened"
        );
        self.lock = Some(lock);
        self.resource = Some((resource.to_path_buf(), flags));
        Ok(OpenReport {
            created,
            need_check,
        })
    }

    fn close(&mut self) {
        self.lock = None;
        self.resource = None;
    }

    fn is_open(&self) -> bool {
        self.lock.is_some()
    }

    fn lock(&self, kind: LockKind, blocking: bool, partition: usize) -> LockResult<LockStatus> {
        let multi = self.multi("lock")?;
        match kind {
            LockKind::Internal => multi.lock_base(0, blocking),
            LockKind::Exclusive | LockKind::Upgrade => multi.lock(LockTarget::Exclusive, blocking),
            LockKind::Shared => {
                self.check_kind(multi, kind, "lock shared")?;
                multi.lock(LockTarget::Any, blocking)
            }
            LockKind::Index => {
                self.check_kind(multi, kind, "lock index")?;
                multi.lock(LockTarget::Partition(partition), blocking)
            }
        }
    }

    fn unlock(&self, kind: LockKind) -> LockResult<()> {
        let multi = self.multi("unlock")?;
        match kind {
            LockKind::Internal => multi.unlock_base(0),
            LockKind::Exclusive | LockKind::Upgrade => multi.unlock(LockTarget::Exclusive),
            LockKind::Shared | LockKind::Index => {
                self.check_kind(multi, kind, "unlock")?;
                multi.unlock(LockTarget::Any)
            }
        }
    }

    fn held_count(&self, kind: LockKind, by_self: bool) -> LockResult<usize> {
        let multi = self.multi("held count")?;
        let count = match (kind, by_self) {
            (LockKind::Internal, true) => multi.base_local_count(0)?,
            (LockKind::Internal, false) => multi.base_lock_count(0)?,
            (LockKind::Exclusive | LockKind::Upgrade, true) => multi.local_count(Slot::Exclusive)?,
            (LockKind::Exclusive | LockKind::Upgrade, false) => multi.lock_count(Slot::Exclusive)?,
            (LockKind::Shared | LockKind::Index, _) if !Self::kind_matches(multi, kind) => 0,
            (LockKind::Shared | LockKind::Index, true) => {
                multi.local_count_total() as i32 - multi.local_count(Slot::Exclusive)?
            }
            (LockKind::Shared | LockKind::Index, false) => {
                multi.lock_count_total() - multi.lock_count(Slot::Exclusive)?
            }
        };
        Ok(count.max(0) as usize)
    }

    fn held_count_at(&self, kind: LockKind, by_self: bool, index: usize) -> LockResult<usize> {
        let multi = self.multi("held count")?;
        let count = match (kind, by_self) {
            (LockKind::Shared | LockKind::Index, _) if !Self::kind_matches(multi, kind) => 0,
            (LockKind::Shared | LockKind::Index, true) => {
                multi.local_count(Slot::Partition(index))?
            }
            (LockKind::Shared | LockKind::Index, false) => {
                multi.lock_count(Slot::Partition(index))?
            }
            _ => return self.held_count(kind, by_self),
        };
        Ok(count.max(0) as usize)
    }

    fn count(&self, kind: LockKind) -> usize {
        let Some(multi) = self.lock.as_ref() else {
            return 0;
        };
        match kind {
            LockKind::Internal | LockKind::Exclusive | LockKind::Upgrade => 1,
            LockKind::Shared | LockKind::Index if Self::kind_matches(multi, kind) => {
                multi.part_count()
            }
            LockKind::Shared | LockKind::Index => 0,
        }
    }

    fn mode(&self) -> Option<LockMode> {
        self.lock.as_ref().map(MultiLock::mode)
    }

    fn refresh(&mut self) -> LockResult<()> {
        let multi = self.lock.as_mut().ok_or(LockError::NotOpen { op: "refresh" })?;
        multi.expand(OpenSpec::Unchecked)
    }

    fn reset(&mut self) -> LockResult<()> {
        self.multi("reset")?.reset_all()
    }

    fn state(&self) -> LockResult<LockStateSnapshot> {
        Ok(self.multi("state")?.snapshot())
    }
}

/// Opens a second, independent instance on the same lock file
impl DuplicateHandle for PthreadBackend {
    type Error = LockError;

    fn duplicate(&self) -> LockResult<Self> {
        let (Some(multi), Some((resource, flags))) = (self.lock.as_ref(), self.resource.as_ref())
        else {
            return Err(LockError::NotOpen { op: "duplicate" });
        };
        let mut dup = PthreadBackend::new(self.config.clone());
        let flags = OpenFlags {
            any_locks: true,
            lock_now: false,
            ..*flags
        };
        dup.open(resource, multi.mode(), multi.part_count(), flags)?;
        Ok(dup)
    }
}
