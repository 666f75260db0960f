//! Accounting snapshot for memory reporting.

use crate::Bytes;
use core::fmt;

/// Point-in-time accounting of one [`RegionMap`](crate::RegionMap).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MemoryInfo {
    pub page_size: Bytes,
    /// Size of the whole managed space.
    pub total: Bytes,
    /// Allocated bytes, excluding reserved memory.
    pub used: Bytes,
    pub reserved: Bytes,
    pub free: Bytes,
    pub regions: usize,
    pub free_regions: usize,
    /// Largest free extent. An unaligned tail counts with its real size even
    /// though `allocate` only hands out whole pages.
    pub largest_free: Bytes,
}

impl MemoryInfo {
    /// Whether the snapshot accounts for every byte of the space.
    #[must_use]
    pub const fn is_consistent(&self) -> bool {
        self.used + self.reserved + self.free == self.total
    }
}

impl fmt::Display for MemoryInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} KiB total, {} KiB used, {} KiB reserved, {} KiB free in {} of {} regions \
             (largest {} KiB)",
            self.total / 1024,
            self.used / 1024,
            self.reserved / 1024,
            self.free / 1024,
            self.free_regions,
            self.regions,
            self.largest_free / 1024
        )
    }
}
