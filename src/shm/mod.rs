/*!
 * Shared Lock Files
 * Memory-mapped lock files shared by every process locking a resource
 */

pub mod lockfile;
pub mod region;
pub mod types;

// Re-export public API
pub use lockfile::{LockFile, OpenRetry};
pub use region::MappedRegion;
pub use types::{Geometry, Layout, LockFileHeader, LockFileSnapshot};
