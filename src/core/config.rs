/*!
 * Lock Configuration
 *
 * Runtime configuration for lock-file placement, default geometry and
 * retry budgets
 */

use super::limits::{
    DEFAULT_PARTITIONS, LOCK_ROOT, LOCK_SUFFIX, OPEN_RETRIES, OPEN_RETRY_DELAY, PROTOCOL_RETRIES,
    SHARED_SLOTS_PER_CPU, SLOW_WAIT_THRESHOLD,
};
use super::types::LockMode;
use std::path::PathBuf;
use std::time::Duration;

/// Lock subsystem configuration
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Directory under which lock files are created
    pub lock_root: PathBuf,
    /// Appended to the resource path to form the lock file name
    pub lock_suffix: String,
    /// Reader slots for shared mode
    pub shared_slots: usize,
    /// Keyed slots for partitioned mode
    pub partitions: usize,
    /// Attempts to observe a fully created lock file
    pub open_retries: u32,
    /// Delay between open attempts
    pub open_retry_delay: Duration,
    /// Page-lock protocol retries before the generation is declared unstable
    pub protocol_retries: u32,
    /// Lock waits longer than this are logged
    pub slow_wait: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lock_root: PathBuf::from(LOCK_ROOT),
            lock_suffix: LOCK_SUFFIX.to_string(),
            shared_slots: default_shared_slots(),
            partitions: DEFAULT_PARTITIONS,
            open_retries: OPEN_RETRIES,
            open_retry_delay: OPEN_RETRY_DELAY,
            protocol_retries: PROTOCOL_RETRIES,
            slow_wait: SLOW_WAIT_THRESHOLD,
        }
    }
}

impl LockConfig {
    /// Defaults overridden from the environment
    ///
    /// Environment variables:
    /// - KVLOCK_LOCK_ROOT: lock directory (default: /tmp/.mlock-named)
    /// - KVLOCK_PARTITIONS: partition count (default: 128)
    /// - KVLOCK_SHARED_SLOTS: reader slots (default: 2 per CPU)
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(root) = std::env::var("KVLOCK_LOCK_ROOT") {
            if !root.is_empty() {
                config.lock_root = PathBuf::from(root);
            }
        }
        if let Some(n) = env_count("KVLOCK_PARTITIONS") {
            config.partitions = n;
        }
        if let Some(n) = env_count("KVLOCK_SHARED_SLOTS") {
            config.shared_slots = n;
        }
        config
    }

    pub fn with_lock_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.lock_root = root.into();
        self
    }

    pub fn with_partitions(mut self, partitions: usize) -> Self {
        self.partitions = partitions;
        self
    }

    pub fn with_shared_slots(mut self, slots: usize) -> Self {
        self.shared_slots = slots;
        self
    }

    pub fn with_open_retries(mut self, retries: u32, delay: Duration) -> Self {
        self.open_retries = retries;
        self.open_retry_delay = delay;
        self
    }

    pub fn with_protocol_retries(mut self, retries: u32) -> Self {
        self.protocol_retries = retries;
        self
    }

    /// Slot count used for a mode when the caller does not give one
    pub fn default_count(&self, mode: LockMode) -> usize {
        match mode {
            LockMode::Single => 1,
            LockMode::Shared => self.shared_slots,
            LockMode::Partitioned => self.partitions,
        }
    }
}

fn default_shared_slots() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    cpus * SHARED_SLOTS_PER_CPU
}

fn env_count(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|n| *n > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LockConfig::default();
        assert_eq!(config.lock_root, PathBuf::from("/tmp/.mlock-named"));
        assert_eq!(config.lock_suffix, "._int_");
        assert_eq!(config.partitions, 128);
        assert!(config.shared_slots >= 2);
        assert_eq!(config.shared_slots % 2, 0);
    }

    #[test]
    fn test_default_count_per_mode() {
        let config = LockConfig::default().with_partitions(16).with_shared_slots(4);
        assert_eq!(config.default_count(LockMode::Single), 1);
        assert_eq!(config.default_count(LockMode::Shared), 4);
        assert_eq!(config.default_count(LockMode::Partitioned), 16);
    }
}
