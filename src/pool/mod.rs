/*!
 * Handle Pools
 * Bounded pools of duplicated handles lent to worker threads
 */

pub mod handle_pool;
pub mod sizing;
mod types;

pub use handle_pool::{DuplicateHandle, ExclusiveHandle, HandlePool, PooledHandle};
pub use sizing::{clamp_pool_size, parse_pool_size, parse_pool_size_for, verify_pool_size};
pub use types::{PoolError, PoolResult, PoolStats};
