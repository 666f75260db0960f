use crate::region::{ProcessId, ShmId};
use crate::{Address, Bytes, RegionId};

/// Recoverable failures of region map operations.
///
/// None of these leave the chain in a modified state: every operation
/// validates its request before the first link is touched.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegionError {
    #[error("zero-sized request")]
    ZeroSize,
    #[error("no free region of {requested:#x} bytes")]
    NoSpace { requested: Bytes },
    #[error("address {address:#x} is not available")]
    AddressUnavailable { address: Address },
    #[error("invalid range {start:#x}+{size:#x}")]
    InvalidRange { start: Address, size: Bytes },
    #[error("page size must be non-zero")]
    InvalidPageSize,
    #[error("unknown or stale region {0}")]
    UnknownRegion(RegionId),
    #[error("region {0} is reserved")]
    Reserved(RegionId),
    #[error("region {0} is not allocated")]
    NotAllocated(RegionId),
    #[error("region {0} is not copy-on-write")]
    NotCopyOnWrite(RegionId),
    #[error("region {0} is not shared memory")]
    NotShared(RegionId),
    #[error("region {0} is shared memory and cannot be split")]
    SharedExtent(RegionId),
    #[error("no shared memory with id {0}")]
    SharedNotFound(ShmId),
    #[error("process {pid} may not access shared memory {id}")]
    PermissionDenied { id: ShmId, pid: ProcessId },
    #[error("slot belongs to another map")]
    ForeignSlot,
}

/// A broken chain invariant found by [`RegionMap::verify`](crate::RegionMap::verify).
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvariantViolation {
    #[error("chain is empty")]
    Empty,
    #[error("head {0} has a predecessor")]
    HeadHasPredecessor(RegionId),
    #[error("link between {0} and {1} is not symmetric")]
    AsymmetricLink(RegionId, RegionId),
    #[error("gap or overlap between {0} and {1}")]
    Gap(RegionId, RegionId),
    #[error("adjacent free regions {0} and {1}")]
    AdjacentFree(RegionId, RegionId),
    #[error("region {0} is empty")]
    EmptyRegion(RegionId),
    #[error("used total {tracked:#x} does not match recount {counted:#x}")]
    UsedTotal { tracked: Bytes, counted: Bytes },
    #[error("reserved total {tracked:#x} does not match recount {counted:#x}")]
    ReservedTotal { tracked: Bytes, counted: Bytes },
}

/// Halt on chain corruption; continuing would hand out overlapping memory.
#[cold]
#[track_caller]
pub(crate) fn chain_corrupted(what: core::fmt::Arguments<'_>) -> ! {
    log::error!("region chain corrupted: {what}");
    panic!("region chain corrupted: {what}");
}
