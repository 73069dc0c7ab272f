/*!
 * Lock Limits and Constants
 *
 * Centralized location for on-disk layout constants, retry budgets and
 * default lock geometry. Grouped by the layer that consumes them.
 */

use std::time::Duration;

// =============================================================================
// LOCK FILE LAYOUT
// =============================================================================

/// Lock file format version written into every header
pub const LOCK_FILE_VERSION: u32 = 1;

/// Registers reserved by the multi-lock layer
pub const MULTI_LOCK_REGISTERS: usize = 3;

/// Register holding the lock mode tag
pub const REG_LOCK_MODE: usize = 0;

/// Register holding the base (reserved) lock count
pub const REG_BASE_COUNT: usize = 1;

/// Register holding the shared-index hint
pub const REG_SHARE_INDEX: usize = 2;

/// Value a published register holds while a resize is in flight
pub const REG_UNPUBLISHED: i32 = 0;

/// Attempts to read a settled configuration while a resize is in flight
pub const CONFIG_READ_RETRIES: u32 = 2_000;

/// Delay between configuration reads once yielding was not enough
pub const CONFIG_READ_DELAY: Duration = Duration::from_micros(100);

/// Reserved base locks created by the lock backend
/// Slot 0 serves internal bookkeeping locks
pub const BACKEND_BASE_LOCKS: usize = 1;

// =============================================================================
// OPEN / CREATE RACE
// =============================================================================

/// Attempts to observe a fully initialized file after losing the create race
pub const OPEN_RETRIES: u32 = 10;

/// Delay between open attempts
pub const OPEN_RETRY_DELAY: Duration = Duration::from_millis(100);

// =============================================================================
// LOCK GEOMETRY
// =============================================================================

/// Default partition count for partitioned locking
pub const DEFAULT_PARTITIONS: usize = 128;

/// Shared reader slots per available CPU
pub const SHARED_SLOTS_PER_CPU: usize = 2;

/// Upper bound on partitions for a single lock file
/// [SECURITY] Caps the mapping size requested from untrusted counts
pub const MAX_PARTITIONS: usize = 65_536;

// =============================================================================
// FILESYSTEM CONVENTION
// =============================================================================

/// Directory holding all lock files
pub const LOCK_ROOT: &str = "/tmp/.mlock-named";

/// Suffix appended to every lock file name
pub const LOCK_SUFFIX: &str = "._int_";

/// Mode for lock directories: sticky, world read/write/execute
pub const LOCK_DIR_MODE: u32 = 0o1777;

/// Full access permissions, for resources that have no backing file
pub const ACCESS_PERMS: u32 = 0o777;

// =============================================================================
// PAGE LOCK PROTOCOL
// =============================================================================

/// Attempts to reach a stable resource generation before giving up
pub const PROTOCOL_RETRIES: u32 = 16;

/// Waits longer than this are reported by lock spans
pub const SLOW_WAIT_THRESHOLD: Duration = Duration::from_millis(10);

// =============================================================================
// HANDLE POOL
// =============================================================================

/// Condition variable timeout between availability checks
pub const POOL_WAIT_SLICE: Duration = Duration::from_millis(50);
