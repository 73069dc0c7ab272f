/*!
 * Lock File Paths
 *
 * The lock file for resource `/a/b/db` lives at
 * `<lock_root>/a/b/db<suffix>`, e.g. `/tmp/.mlock-named/a/b/db._int_`.
 * Every directory on the way is created sticky and world-writable so
 * unrelated users can share lock files for shared resources.
 */

use crate::core::config::LockConfig;
use crate::core::errors::{LockError, LockResult};
use crate::core::limits::{ACCESS_PERMS, LOCK_DIR_MODE};
use crate::shm::lockfile::without_umask;
use path_clean::PathClean;
use std::ffi::OsString;
use std::fs::DirBuilder;
use std::io;
use std::os::unix::fs::{DirBuilderExt, MetadataExt};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Lock file path for an absolute resource path
pub fn lock_file_path(config: &LockConfig, resource: &Path) -> LockResult<PathBuf> {
    if !resource.is_absolute() {
        return Err(LockError::InvalidArgument(format!(
            "resource path must be absolute: {}",
            resource.display()
        )));
    }
    let mut name = OsString::from(config.lock_root.as_os_str());
    name.push(resource.as_os_str());
    name.push(&config.lock_suffix);
    Ok(PathBuf::from(name))
}

/// Absolute, symlink-free path of `resource`
///
/// Falls back to joining the working directory when the resource does not
/// exist (memory-only resources).
pub fn resolve_resource(resource: &Path) -> LockResult<PathBuf> {
    if let Ok(real) = resource.canonicalize() {
        return Ok(real);
    }
    let absolute = if resource.is_absolute() {
        resource.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|e| LockError::io(resource, "resolve", e))?
            .join(resource)
    };
    Ok(absolute.clean())
}

/// Create every missing parent directory of `lock_path`
pub fn ensure_lock_dirs(lock_path: &Path) -> LockResult<()> {
    let Some(parent) = lock_path.parent() else {
        return Ok(());
    };

    let missing: Vec<&Path> = parent
        .ancestors()
        .take_while(|dir| !dir.as_os_str().is_empty() && !dir.is_dir())
        .collect();

    for dir in missing.into_iter().rev() {
        let created = without_umask(|| DirBuilder::new().mode(LOCK_DIR_MODE).create(dir));
        match created {
            Ok(()) => debug!(dir = %dir.display(), "created lock directory"),
            // another process won the race
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists && dir.is_dir() => {}
            Err(e) => return Err(LockError::io(dir, "create lock directory", e)),
        }
    }
    Ok(())
}

/// Permissions and ownership for a new lock file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockFileOwnership {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

impl LockFileOwnership {
    /// Mirror the resource's owner, group and mode
    ///
    /// Read access implies write access: taking even a read lock modifies
    /// a mutex record.
    pub fn for_resource(resource: &Path, memory_only: bool) -> LockResult<Self> {
        let (mode, uid, gid) = if memory_only {
            (
                ACCESS_PERMS,
                nix::unistd::getuid().as_raw(),
                nix::unistd::getgid().as_raw(),
            )
        } else {
            let meta = std::fs::metadata(resource)
                .map_err(|e| LockError::io(resource, "stat resource", e))?;
            (meta.mode() & ACCESS_PERMS, meta.uid(), meta.gid())
        };
        Ok(Self {
            mode: writable_if_readable(mode),
            uid,
            gid,
        })
    }
}

/// Add the write bit for every class that has the read bit
pub fn writable_if_readable(mode: u32) -> u32 {
    let mut mode = mode;
    for (read, write) in [(0o400, 0o200), (0o040, 0o020), (0o004, 0o002)] {
        if mode & read != 0 {
            mode |= write;
        }
    }
    mode
}

/// Delete the lock file belonging to `resource`
///
/// Returns whether a file was removed.
pub fn remove_lock_file(config: &LockConfig, resource: &Path) -> LockResult<bool> {
    let resource = resolve_resource(resource)?;
    let lock_path = lock_file_path(config, &resource)?;
    match std::fs::remove_file(&lock_path) {
        Ok(()) => {
            info!(path = %lock_path.display(), "removed lock file");
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(LockError::io(lock_path, "remove lock file", e)),
    }
}
