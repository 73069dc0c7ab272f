/*!
 * Lock Backends
 *
 * Pluggable locking behind `LockBackend`, selected by name through a
 * `LockRegistry`. The pthread backend is the only built-in one.
 */

pub mod paths;
pub mod pthread;
pub mod registry;
pub mod traits;

pub use paths::{
    ensure_lock_dirs, lock_file_path, remove_lock_file, resolve_resource, LockFileOwnership,
};
pub use pthread::PthreadBackend;
pub use registry::{BackendFactory, LockRegistry, RegistryBuilder, PTHREAD_BACKEND};
pub use traits::{LockBackend, LockKind, OpenFlags, OpenReport};
