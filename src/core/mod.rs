/*!
 * Core Module
 * Fundamental lock types, configuration and error handling
 */

pub mod config;
pub mod errors;
pub mod limits;
pub mod types;

// Re-export for convenience
pub use config::LockConfig;
pub use errors::*;
pub use types::*;
