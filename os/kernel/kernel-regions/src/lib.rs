//! # Kernel Address-Space Region Allocator
//!
//! Bookkeeping for one address space (physical RAM, a process' virtual
//! space, the kernel heap window) as an address-ordered chain of
//! [`Region`]s. A [`RegionMap`] owns the chain and hands out page-granular
//! extents from it:
//!
//! ```text
//!  first                                                         last
//!  ┌──────────┬───────────────┬──────────┬────────────────────────┐
//!  │ reserved │     used      │   free   │          used          │
//!  └──────────┴───────────────┴──────────┴────────────────────────┘
//!  ◄─────────────────────── managed space ─────────────────────────►
//! ```
//!
//! * **First-fit** allocation ([`RegionMap::allocate`]) and allocation at a
//!   fixed address ([`RegionMap::allocate_at`]).
//! * **Coalescing** release ([`RegionMap::free`]); the chain never holds two
//!   free neighbours.
//! * **Copy-on-write** and **shared-memory** reference counts on allocated
//!   extents, mutated under the same lock as `free`.
//! * **Running totals** of used and reserved bytes.
//!
//! Regions are addressed through generational [`RegionId`] handles instead of
//! pointers; a handle to a region that was merged away is rejected with
//! [`RegionError::UnknownRegion`].
//!
//! ## Boot
//!
//! The physical map is usually built from the firmware memory map, decoded
//! by the arch layer into [`BootMemoryDescriptor`]s:
//!
//! ```
//! use kernel_regions::{BootMemoryDescriptor, BootMemoryKind, RegionMap, DEFAULT_PAGE_SIZE};
//!
//! let map = RegionMap::from_boot_memory(
//!     DEFAULT_PAGE_SIZE,
//!     &[
//!         BootMemoryDescriptor::new(0x0, 0x9_f000, BootMemoryKind::Available),
//!         BootMemoryDescriptor::new(0x10_0000, 0x100_0000, BootMemoryKind::Available),
//!     ],
//! )?;
//! let frame = map.allocate(1)?;
//! assert_eq!(map.region(frame).unwrap().size, DEFAULT_PAGE_SIZE);
//! # Ok::<(), kernel_regions::RegionError>(())
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod arena;
mod boot;
mod error;
mod info;
mod lock;
mod map;
mod region;
mod shared;

pub use arena::{MapId, RegionId, RegionSlot};
pub use boot::{BootMemoryDescriptor, BootMemoryKind, BootMemorySummary, initial_chain};
pub use error::{InvariantViolation, RegionError};
pub use info::MemoryInfo;
pub use lock::{MapLock, MapLockGuard};
pub use map::RegionMap;
pub use region::{
    ProcessId, RefDrop, Region, RegionState, RelatedRegion, SharedMemory, ShmGrant, ShmId,
};

/// A position inside a managed space.
pub type Address = u64;

/// A length inside a managed space.
pub type Bytes = u64;

/// Page size of the x86-64 kernel's physical and virtual maps.
pub const DEFAULT_PAGE_SIZE: Bytes = 4096;

const _: () = {
    assert!(DEFAULT_PAGE_SIZE.is_power_of_two());
    assert!(DEFAULT_PAGE_SIZE >= 4096);
};
