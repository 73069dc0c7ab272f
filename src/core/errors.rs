/*!
 * Error Types
 * Centralized error handling with thiserror and miette
 */

use miette::Diagnostic;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

// Re-export PoolError from pool module
pub use crate::pool::PoolError;

/// Result type for lock operations
pub type LockResult<T> = Result<T, LockError>;

/// Lock subsystem errors
///
/// Every variant that can surface to a caller names the lock file and the
/// operation that failed. Owner death is not represented here: it is a
/// successful acquisition reported through `LockStatus::OwnerDied`.
#[derive(Error, Debug, Diagnostic)]
pub enum LockError {
    #[error("{path}: {op} would block")]
    #[diagnostic(
        code(lock::would_block),
        help("The lock is held elsewhere. Retry, or call with blocking enabled.")
    )]
    WouldBlock { path: PathBuf, op: &'static str },

    #[error("{path}: {op} of slot {index} not permitted (owner {owner}, caller {caller}, count {count})")]
    #[diagnostic(
        code(lock::not_owner),
        help("Only the owning thread may release a lock, and only while it is held.")
    )]
    NotOwner {
        path: PathBuf,
        op: &'static str,
        index: usize,
        owner: u32,
        caller: u32,
        count: i32,
    },

    #[error("{path}: {op} with index {index} out of range (limit {limit})")]
    #[diagnostic(code(lock::invalid_index), help("Valid indices are 0..limit."))]
    InvalidIndex {
        path: PathBuf,
        op: &'static str,
        index: usize,
        limit: usize,
    },

    #[error("{path}: lock file version {found}, expected {expected}")]
    #[diagnostic(
        code(lock::version_mismatch),
        help("The lock file was created by an incompatible release. Delete it while no process uses it.")
    )]
    VersionMismatch {
        path: PathBuf,
        found: u32,
        expected: u32,
    },

    #[error("{path}: mutex record size {found}, expected {expected}")]
    #[diagnostic(
        code(lock::record_size_mismatch),
        help("Processes sharing this lock file disagree on the mutex ABI (32/64-bit or libc mismatch).")
    )]
    RecordSizeMismatch {
        path: PathBuf,
        found: u32,
        expected: u32,
    },

    #[error("{path}: register count {found}, expected {expected}")]
    #[diagnostic(
        code(lock::register_count_mismatch),
        help("The lock file was created with a different configuration.")
    )]
    RegisterCountMismatch {
        path: PathBuf,
        found: u32,
        expected: u32,
    },

    #[error("{path}: mutex count {found}, expected {expected}")]
    #[diagnostic(
        code(lock::mutex_count_mismatch),
        help("The lock file was created with a different partition count. Open with any-locks to accept it.")
    )]
    MutexCountMismatch {
        path: PathBuf,
        found: u32,
        expected: u32,
    },

    #[error("{path}: lock mode {found}, expected {expected}")]
    #[diagnostic(
        code(lock::mode_mismatch),
        help("Another process uses a different lock mode for this resource.")
    )]
    ModeMismatch {
        path: PathBuf,
        found: String,
        expected: String,
    },

    #[error("{path}: lock file is {size} bytes, expected at least {expected}")]
    #[diagnostic(
        code(lock::too_small),
        help("The creating process may have died during initialization. Remove the lock file.")
    )]
    TooSmall {
        path: PathBuf,
        size: u64,
        expected: u64,
    },

    #[error("{path}: only {initialized} of {count} mutexes initialized")]
    #[diagnostic(
        code(lock::not_initialized),
        help("The creating process did not finish initialization. Remove the lock file.")
    )]
    NotInitialized {
        path: PathBuf,
        initialized: u32,
        count: u32,
    },

    #[error("{path}: header changed under {op}")]
    #[diagnostic(
        code(lock::stale),
        help("Another process resized the lock file. Follow the expansion before retrying.")
    )]
    Stale { path: PathBuf, op: &'static str },

    #[error("{path}: {op} refused while locks are held by this thread")]
    #[diagnostic(code(lock::busy), help("Release every lock on this file first."))]
    Busy { path: PathBuf, op: &'static str },

    #[error("{path}: {op} is not supported in {mode} mode")]
    #[diagnostic(code(lock::unsupported))]
    Unsupported {
        path: PathBuf,
        op: &'static str,
        mode: String,
    },

    #[error("{path}: cannot lock partition {wanted} while holding another partition")]
    #[diagnostic(
        code(lock::partition_conflict),
        help("Release the held partition, or take the exclusive lock for multi-key work.")
    )]
    PartitionConflict { path: PathBuf, wanted: usize },

    #[error("{path}: write lock requested on a read-only resource")]
    #[diagnostic(code(lock::read_only))]
    ReadOnly { path: PathBuf },

    #[error("Invalid argument: {0}")]
    #[diagnostic(code(lock::invalid_argument))]
    InvalidArgument(String),

    #[error("No lock backend registered for '{0}'")]
    #[diagnostic(
        code(lock::no_such_backend),
        help("Backends are looked up by the first character of their name.")
    )]
    NoSuchBackend(String),

    #[error("{op}: no lock file is open")]
    #[diagnostic(code(lock::not_open))]
    NotOpen { op: &'static str },

    #[error("{path}: {op} failed: {source}")]
    #[diagnostic(code(lock::io))]
    Io {
        path: PathBuf,
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{path}: integrity check found {errors} errors after owner death")]
    #[diagnostic(
        code(lock::integrity_check_failed),
        help("A process died mid-update. Restore the resource before using it.")
    )]
    IntegrityCheckFailed { path: PathBuf, errors: usize },

    #[error("{path}: backing store {op} failed: {reason}")]
    #[diagnostic(code(lock::backing_store))]
    BackingStore {
        path: PathBuf,
        op: &'static str,
        reason: String,
    },

    #[error("{path}: resource generation still changing after {attempts} attempts")]
    #[diagnostic(
        code(lock::generation_unstable),
        help("The resource is being replaced or resized continuously.")
    )]
    GenerationUnstable { path: PathBuf, attempts: u32 },
}

impl LockError {
    /// Build an I/O error with lock-file context
    pub fn io(path: impl Into<PathBuf>, op: &'static str, source: io::Error) -> Self {
        LockError::Io {
            path: path.into(),
            op,
            source,
        }
    }

    /// Build an I/O error from a raw errno value
    pub fn os(path: impl Into<PathBuf>, op: &'static str, errno: i32) -> Self {
        Self::io(path, op, io::Error::from_raw_os_error(errno))
    }

    /// Transient contention; the caller may retry or block
    pub fn is_would_block(&self) -> bool {
        matches!(self, LockError::WouldBlock { .. })
    }

    /// Cross-process disagreement about the lock file configuration
    pub fn is_config_mismatch(&self) -> bool {
        matches!(
            self,
            LockError::RegisterCountMismatch { .. }
                | LockError::MutexCountMismatch { .. }
                | LockError::ModeMismatch { .. }
                | LockError::TooSmall { .. }
        )
    }

    /// Permission violation: unlocking something the caller does not hold
    pub fn is_not_owner(&self) -> bool {
        matches!(self, LockError::NotOwner { .. })
    }

    /// Lock file path this error refers to, if any
    pub fn path(&self) -> Option<&std::path::Path> {
        match self {
            LockError::WouldBlock { path, .. }
            | LockError::NotOwner { path, .. }
            | LockError::InvalidIndex { path, .. }
            | LockError::VersionMismatch { path, .. }
            | LockError::RecordSizeMismatch { path, .. }
            | LockError::RegisterCountMismatch { path, .. }
            | LockError::MutexCountMismatch { path, .. }
            | LockError::ModeMismatch { path, .. }
            | LockError::TooSmall { path, .. }
            | LockError::NotInitialized { path, .. }
            | LockError::Stale { path, .. }
            | LockError::Busy { path, .. }
            | LockError::Unsupported { path, .. }
            | LockError::PartitionConflict { path, .. }
            | LockError::ReadOnly { path }
            | LockError::Io { path, .. }
            | LockError::IntegrityCheckFailed { path, .. }
            | LockError::BackingStore { path, .. }
            | LockError::GenerationUnstable { path, .. } => Some(path),
            LockError::InvalidArgument(_)
            | LockError::NoSuchBackend(_)
            | LockError::NotOpen { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_file_and_operation() {
        let err = LockError::WouldBlock {
            path: PathBuf::from("/tmp/.mlock-named/db._int_"),
            op: "lock",
        };
        let msg = err.to_string();
        assert!(msg.contains("/tmp/.mlock-named/db._int_"));
        assert!(msg.contains("lock"));
        assert!(err.is_would_block());
        assert!(!err.is_config_mismatch());
    }

    #[test]
    fn test_mismatch_classification() {
        let err = LockError::MutexCountMismatch {
            path: PathBuf::from("x"),
            found: 3,
            expected: 5,
        };
        assert!(err.is_config_mismatch());

        let abi = LockError::RecordSizeMismatch {
            path: PathBuf::from("x"),
            found: 40,
            expected: 48,
        };
        assert!(!abi.is_config_mismatch());
        assert_eq!(abi.path(), Some(std::path::Path::new("x")));
    }
}
