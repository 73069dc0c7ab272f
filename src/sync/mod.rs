/*!
 * Synchronization Primitives
 *
 * Process-shared locking built from robust pthread mutexes placed in a
 * mapped lock file:
 * - `MutexRecord`: recursive, owner-tracked, detects a dead holder
 * - `MultiLock`: base slots + an exclusive slot + shared/partition slots
 * - per-thread nesting bookkeeping keyed by instance id
 *
 * # Owner death
 *
 * When a holder dies the next acquirer gets the lock together with
 * `LockStatus::OwnerDied`. It is a status, not an error: the caller decides
 * whether the protected data needs an integrity pass.
 */

pub mod multi_lock;
pub mod mutex;
pub mod thread_ctx;
mod types;

pub use multi_lock::MultiLock;
pub use mutex::{MutexError, MutexRecord, MutexSnapshot};
pub use thread_ctx::{current_tid, InstanceId};
pub use types::{LockStateSnapshot, LockTarget, OpenSpec, Slot, SlotState};
