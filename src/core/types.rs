/*!
 * Core Types
 * Common types used across the lock layers
 */

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kernel thread id of a lock owner; zero means unowned
pub type OwnerId = u32;

/// Outcome of a successful acquisition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockStatus {
    /// Acquired normally (or nested)
    Acquired,
    /// Acquired from a holder that died; protected data may be inconsistent
    OwnerDied,
}

impl LockStatus {
    #[inline]
    pub fn owner_died(self) -> bool {
        matches!(self, LockStatus::OwnerDied)
    }

    /// Combine statuses from several slots
    #[inline]
    pub fn merge(self, other: LockStatus) -> LockStatus {
        if self.owner_died() || other.owner_died() {
            LockStatus::OwnerDied
        } else {
            LockStatus::Acquired
        }
    }
}

/// Composite lock layout persisted in the mode register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    /// One exclusive slot
    Single,
    /// Interchangeable reader slots plus the exclusive slot
    Shared,
    /// Keyed slots plus the exclusive slot
    Partitioned,
}

impl LockMode {
    /// Value stored in the mode register
    pub const fn tag(self) -> i32 {
        match self {
            LockMode::Single => -1,
            LockMode::Shared => 1,
            LockMode::Partitioned => 2,
        }
    }

    pub const fn from_tag(tag: i32) -> Option<LockMode> {
        match tag {
            -1 => Some(LockMode::Single),
            1 => Some(LockMode::Shared),
            2 => Some(LockMode::Partitioned),
            _ => None,
        }
    }

    /// Whether the composite section has more than one slot
    #[inline]
    pub const fn is_split(self) -> bool {
        !matches!(self, LockMode::Single)
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Single => write!(f, "single"),
            LockMode::Shared => write!(f, "shared"),
            LockMode::Partitioned => write!(f, "partitioned"),
        }
    }
}

impl std::str::FromStr for LockMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "single" | "exclusive" => Ok(LockMode::Single),
            "shared" => Ok(LockMode::Shared),
            "partitioned" | "partition" | "index" => Ok(LockMode::Partitioned),
            other => Err(format!("unknown lock mode '{}'", other)),
        }
    }
}

/// Read or write intent of a storage operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Access {
    Read,
    Write,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_tag_round_trip() {
        for mode in [LockMode::Single, LockMode::Shared, LockMode::Partitioned] {
            assert_eq!(LockMode::from_tag(mode.tag()), Some(mode));
        }
        assert_eq!(LockMode::from_tag(0), None);
    }

    #[test]
    fn test_status_merge() {
        assert_eq!(
            LockStatus::Acquired.merge(LockStatus::OwnerDied),
            LockStatus::OwnerDied
        );
        assert_eq!(
            LockStatus::Acquired.merge(LockStatus::Acquired),
            LockStatus::Acquired
        );
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("Partitioned".parse::<LockMode>(), Ok(LockMode::Partitioned));
        assert!("bogus".parse::<LockMode>().is_err());
    }
}
