/*!
 * Pool Types
 * Errors and statistics for handle pools
 */

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Pool operation result
pub type PoolResult<T> = Result<T, PoolError>;

/// Handle pool errors
#[derive(Error, Debug, Clone, Diagnostic)]
pub enum PoolError {
    #[error("No handle available")]
    #[diagnostic(code(pool::empty), help("Every pooled handle is lent out."))]
    EmptyPool,

    #[error("Could not duplicate any of {requested} handles: {reason}")]
    #[diagnostic(
        code(pool::duplication_failed),
        help("Check the open-file and thread limits of the process.")
    )]
    DuplicationFailed { requested: usize, reason: String },

    #[error("No handle became available within {0:?}")]
    #[diagnostic(code(pool::timeout))]
    Timeout(Duration),

    #[error("Invalid pool size: {0}")]
    #[diagnostic(code(pool::invalid_size), help("Pool size must be positive."))]
    InvalidSize(usize),
}

/// Point-in-time pool occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub size: usize,
    pub requested: usize,
    pub available: usize,
}

impl PoolStats {
    pub fn in_use(&self) -> usize {
        self.size - self.available
    }
}
