//! # Boot memory map to initial chain
//!
//! The arch layer decodes the firmware's memory map (UEFI, multiboot, ...)
//! into [`BootMemoryDescriptor`]s. This module turns that list into the
//! gapless chain [`RegionMap::new`] expects:
//!
//! 1. Descriptors are sorted by start address.
//! 2. Each start is rounded **up** and each length **down** to the page
//!    size; descriptors that shrink to nothing are dropped.
//! 3. Holes between descriptors are covered by reserved regions.
//!
//! Overlapping descriptors are rejected.

use crate::error::RegionError;
use crate::region::Region;
use crate::{Address, Bytes, RegionMap};
use alloc::vec::Vec;
use log::{debug, info};

/// Kind of a boot memory range, as reported by firmware.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BootMemoryKind {
    /// Usable RAM.
    Available,
    /// Firmware-reserved, MMIO, kernel image.
    Reserved,
    /// ACPI tables that may be reclaimed later.
    AcpiReclaimable,
    /// RAM that failed testing.
    Defective,
    /// Anything else the firmware would rather we did not touch.
    Unusable,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BootMemoryDescriptor {
    pub start: Address,
    pub len: Bytes,
    pub kind: BootMemoryKind,
}

impl BootMemoryDescriptor {
    #[must_use]
    pub const fn new(start: Address, len: Bytes, kind: BootMemoryKind) -> Self {
        Self { start, len, kind }
    }
}

/// Byte counts of a boot memory map after page alignment.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct BootMemorySummary {
    pub total: Bytes,
    pub usable: Bytes,
    pub reserved: Bytes,
    pub unusable: Bytes,
}

/// Build the initial chain for a physical map from boot descriptors.
pub fn initial_chain(
    page_size: Bytes,
    descriptors: &[BootMemoryDescriptor],
) -> Result<(Vec<Region>, BootMemorySummary), RegionError> {
    if page_size == 0 {
        return Err(RegionError::InvalidPageSize);
    }

    let mut sorted: Vec<BootMemoryDescriptor> = descriptors.to_vec();
    sorted.sort_unstable_by_key(|d| d.start);

    let mut chain: Vec<Region> = Vec::with_capacity(sorted.len() * 2);
    let mut summary = BootMemorySummary::default();
    // Unaligned end of everything seen so far; overlaps are judged on the
    // firmware's ranges, before alignment trims them apart.
    let mut raw_end: Address = 0;
    for desc in sorted {
        let invalid = RegionError::InvalidRange {
            start: desc.start,
            size: desc.len,
        };
        let end = desc.start.checked_add(desc.len).ok_or(invalid)?;
        if desc.start < raw_end {
            return Err(invalid);
        }
        raw_end = raw_end.max(end);

        let start = desc.start.div_ceil(page_size).saturating_mul(page_size);
        let len = end.saturating_sub(start) / page_size * page_size;
        if len == 0 {
            debug!("ignoring too-small memory range at {:#x}", desc.start);
            continue;
        }

        if let Some(prev) = chain.last() {
            if prev.end() < start {
                let hole = Region::reserved(prev.end(), start - prev.end());
                summary.reserved += hole.size;
                chain.push(hole);
            }
        }

        let region = match desc.kind {
            BootMemoryKind::Available => {
                summary.usable += len;
                Region::free(start, len)
            }
            BootMemoryKind::Reserved => {
                summary.reserved += len;
                Region::reserved(start, len)
            }
            BootMemoryKind::AcpiReclaimable
            | BootMemoryKind::Defective
            | BootMemoryKind::Unusable => {
                summary.unusable += len;
                Region::used(start, len)
            }
        };
        debug!("adding memory range {region}");
        chain.push(region);
    }

    summary.total = summary.usable + summary.reserved + summary.unusable;
    Ok((chain, summary))
}

impl RegionMap {
    /// Build a physical memory map from boot descriptors.
    pub fn from_boot_memory(
        page_size: Bytes,
        descriptors: &[BootMemoryDescriptor],
    ) -> Result<Self, RegionError> {
        let (chain, summary) = initial_chain(page_size, descriptors)?;
        info!(
            "boot memory: {} KiB usable, {} KiB reserved, {} KiB unusable",
            summary.usable / 1024,
            summary.reserved / 1024,
            summary.unusable / 1024
        );
        Self::new(page_size, chain)
    }
}
