/*!
 * Lock File Layout
 *
 * Header, register array and mutex record array, all in host byte order:
 *
 * ```text
 * +---------+---------------------+------+--------------------------+
 * | header  | registers (i32 x R) | pad  | mutex records (rec x M)  |
 * +---------+---------------------+------+--------------------------+
 * ```
 *
 * Padding only appears when the register array does not end on the record
 * alignment. The multi-lock register count always ends on it, so multi-lock
 * files place the records immediately after the registers at
 * `header + 4 * R`. Other register counts are padded rather than mapping
 * misaligned kernel mutexes.
 */

use crate::core::limits::{LOCK_FILE_VERSION, MULTI_LOCK_REGISTERS};
use crate::sync::mutex::{MutexRecord, MutexSnapshot};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::AtomicU32;

const _: () = assert!(
    Layout::new(MULTI_LOCK_REGISTERS, 0).mutex_base()
        == Layout::new(MULTI_LOCK_REGISTERS, 0).register_offset(MULTI_LOCK_REGISTERS)
);

/// Lock file header as mapped
#[repr(C)]
pub struct LockFileHeader {
    pub version: AtomicU32,
    pub record_size: AtomicU32,
    pub register_count: AtomicU32,
    pub mutex_count: AtomicU32,
    pub mutex_initialized: AtomicU32,
}

impl LockFileHeader {
    pub const SIZE: usize = std::mem::size_of::<LockFileHeader>();

    /// Header image written before the file is extended to full size
    pub fn encode(registers: usize, mutexes: usize) -> [u8; Self::SIZE] {
        let fields = [
            LOCK_FILE_VERSION,
            MutexRecord::SIZE as u32,
            registers as u32,
            mutexes as u32,
            0,
        ];
        let mut out = [0u8; Self::SIZE];
        for (chunk, value) in out.chunks_exact_mut(4).zip(fields) {
            chunk.copy_from_slice(&value.to_ne_bytes());
        }
        out
    }
}

/// Requested geometry when opening a lock file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Geometry {
    /// Counts must match the header exactly; used to create the file
    Exact { registers: usize, mutexes: usize },
    /// Accept whatever the existing header says
    Unchecked,
}

/// Byte offsets for a given register and mutex count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub registers: usize,
    pub mutexes: usize,
}

impl Layout {
    pub const fn new(registers: usize, mutexes: usize) -> Self {
        Self {
            registers,
            mutexes,
        }
    }

    #[inline]
    pub const fn register_offset(&self, index: usize) -> usize {
        LockFileHeader::SIZE + index * std::mem::size_of::<i32>()
    }

    /// Start of the record array, rounded up to record alignment
    #[inline]
    pub const fn mutex_base(&self) -> usize {
        let end = self.register_offset(self.registers);
        let align = MutexRecord::ALIGN;
        (end + align - 1) / align * align
    }

    #[inline]
    pub const fn mutex_offset(&self, index: usize) -> usize {
        self.mutex_base() + index * MutexRecord::SIZE
    }

    /// Total file size
    #[inline]
    pub const fn size(&self) -> usize {
        self.mutex_offset(self.mutexes)
    }
}

/// Serializable dump of a lock file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockFileSnapshot {
    pub path: PathBuf,
    pub version: u32,
    pub record_size: u32,
    pub register_count: u32,
    pub mutex_count: u32,
    pub mutex_initialized: u32,
    pub registers: Vec<i32>,
    pub mutexes: Vec<MutexSnapshot>,
}

impl LockFileSnapshot {
    /// Records that currently have an owner
    pub fn held(&self) -> impl Iterator<Item = &MutexSnapshot> {
        self.mutexes.iter().filter(|m| m.owner != 0)
    }
}
