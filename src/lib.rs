/*!
 * kvlock
 *
 * Cross-process locking for memory-mapped key-value stores: robust
 * process-shared mutexes in a lock file next to the protected resource,
 * composed into single, shared (readers/writer) and partitioned locks.
 */

pub mod core;
pub mod monitoring;
pub mod page;
pub mod plugin;
pub mod pool;
pub mod shm;
pub mod sync;

// Re-exports
pub use crate::core::{
    Access, LockConfig, LockError, LockMode, LockResult, LockStatus, OwnerId, PoolError,
};
pub use monitoring::{init_tracing, LockSpan};
pub use page::{Acquisition, PageLocker, PageRequest, PageStore, ProtocolState};
pub use plugin::{
    remove_lock_file, LockBackend, LockKind, LockRegistry, OpenFlags, OpenReport, PthreadBackend,
    PTHREAD_BACKEND,
};
pub use pool::{DuplicateHandle, HandlePool, PooledHandle};
pub use shm::{Geometry, LockFile, LockFileSnapshot, OpenRetry};
pub use sync::{LockStateSnapshot, LockTarget, MultiLock, MutexRecord, OpenSpec, Slot};
