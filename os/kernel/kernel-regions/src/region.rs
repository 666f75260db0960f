//! # Region descriptors
//!
//! A [`Region`] describes one contiguous extent `[start, start + size)` of a
//! managed space together with its allocation tag. Regions are plain data:
//! chain links live in the owning map's arena, so nothing here can reach or
//! mutate a neighbour.
//!
//! The tag-dependent payload is a [`RegionState`]:
//!
//! | State | Meaning |
//! |-------|---------|
//! | [`RegionState::Exclusive`] | Free, reserved, or used by exactly one mapping. |
//! | [`RegionState::CopyOnWrite`] | Physical extent referenced by `refs` virtual mappings. |
//! | [`RegionState::Shared`] | Extent shared across processes by id and grant list. |

use crate::error::RegionError;
use crate::{Address, Bytes, MapId, RegionId};
use alloc::vec::Vec;
use core::fmt;

/// Identity of a process owning or accessing shared memory.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Ord, PartialOrd, Hash)]
pub struct ProcessId(pub u32);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Id of a shared-memory extent, unique within its map.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Ord, PartialOrd, Hash)]
pub struct ShmId(pub u32);

impl fmt::Display for ShmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Weak reference to the counterpart of a region in another map,
/// e.g. the physical extent backing a virtual one.
///
/// It never keeps the counterpart alive; resolve it through the named map
/// and expect [`RegionError::UnknownRegion`] if it went away.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct RelatedRegion {
    pub map: MapId,
    pub region: RegionId,
}

/// Per-process access entry of a shared-memory extent.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ShmGrant {
    pub pid: ProcessId,
    pub may_write: bool,
}

/// Outcome of dropping one reference.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RefDrop {
    /// References are left; the region stays allocated.
    Remaining(usize),
    /// That was the last reference; the region has to be freed.
    Released,
}

/// Bookkeeping of a shared-memory extent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedMemory {
    id: ShmId,
    /// `None` once the owner exited while references remained.
    owner: Option<ProcessId>,
    refs: usize,
    grants: Vec<ShmGrant>,
}

impl SharedMemory {
    #[must_use]
    pub const fn id(&self) -> ShmId {
        self.id
    }

    #[must_use]
    pub const fn owner(&self) -> Option<ProcessId> {
        self.owner
    }

    #[must_use]
    pub const fn refs(&self) -> usize {
        self.refs
    }

    #[must_use]
    pub fn grants(&self) -> &[ShmGrant] {
        &self.grants
    }

    #[must_use]
    pub const fn is_orphaned(&self) -> bool {
        self.owner.is_none()
    }
}

/// Tag-dependent payload of a [`Region`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RegionState {
    #[default]
    Exclusive,
    CopyOnWrite {
        refs: usize,
    },
    Shared(SharedMemory),
}

/// One contiguous extent of a managed space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub start: Address,
    pub size: Bytes,
    /// Allocated, whether exclusively, copy-on-write, shared or reserved.
    pub used: bool,
    /// Permanently unavailable (kernel image, MMIO). Implies `used`.
    pub reserved: bool,
    pub state: RegionState,
    pub related: Option<RelatedRegion>,
}

impl Region {
    /// A free extent.
    #[must_use]
    pub const fn free(start: Address, size: Bytes) -> Self {
        Self {
            start,
            size,
            used: false,
            reserved: false,
            state: RegionState::Exclusive,
            related: None,
        }
    }

    /// A reserved extent; never allocated, never freed.
    #[must_use]
    pub const fn reserved(start: Address, size: Bytes) -> Self {
        Self {
            start,
            size,
            used: true,
            reserved: true,
            state: RegionState::Exclusive,
            related: None,
        }
    }

    /// An allocated extent that is not reserved (e.g. firmware tables, bad RAM).
    #[must_use]
    pub const fn used(start: Address, size: Bytes) -> Self {
        Self {
            start,
            size,
            used: true,
            reserved: false,
            state: RegionState::Exclusive,
            related: None,
        }
    }

    /// First address past the region.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> Address {
        self.start + self.size
    }

    /// Last address inside the region.
    #[inline]
    #[must_use]
    pub const fn last(&self) -> Address {
        self.start + self.size - 1
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, address: Address) -> bool {
        address >= self.start && address - self.start < self.size
    }

    #[inline]
    #[must_use]
    pub const fn is_free(&self) -> bool {
        !self.used
    }

    #[must_use]
    pub const fn is_cow(&self) -> bool {
        matches!(self.state, RegionState::CopyOnWrite { .. })
    }

    #[must_use]
    pub const fn shared(&self) -> Option<&SharedMemory> {
        match &self.state {
            RegionState::Shared(shm) => Some(shm),
            _ => None,
        }
    }

    /// Clear every allocation tag. The extent itself is kept.
    pub fn reset_to_free(&mut self) {
        self.used = false;
        self.reserved = false;
        self.state = RegionState::Exclusive;
        self.related = None;
    }

    /// Count one more mapping of this extent.
    ///
    /// An exclusive extent becomes copy-on-write with two references: the
    /// existing mapping and the new one.
    pub fn cow_ref(&mut self, id: RegionId) -> Result<usize, RegionError> {
        if !self.used || self.reserved {
            return Err(RegionError::NotAllocated(id));
        }
        let refs = match &self.state {
            RegionState::Exclusive => 2,
            RegionState::CopyOnWrite { refs } => refs + 1,
            RegionState::Shared(_) => return Err(RegionError::NotCopyOnWrite(id)),
        };
        self.state = RegionState::CopyOnWrite { refs };
        Ok(refs)
    }

    /// Drop one copy-on-write reference.
    pub fn cow_deref(&mut self, id: RegionId) -> Result<RefDrop, RegionError> {
        match &mut self.state {
            RegionState::CopyOnWrite { refs } if *refs > 0 => {
                *refs -= 1;
                Ok(if *refs == 0 {
                    RefDrop::Released
                } else {
                    RefDrop::Remaining(*refs)
                })
            }
            _ => Err(RegionError::NotCopyOnWrite(id)),
        }
    }

    /// Turn an allocated exclusive extent into shared memory owned by `owner`.
    ///
    /// The owner holds the first reference and may write.
    pub fn make_shared(
        &mut self,
        region: RegionId,
        id: ShmId,
        owner: ProcessId,
    ) -> Result<(), RegionError> {
        if !self.used || self.reserved {
            return Err(RegionError::NotAllocated(region));
        }
        if self.state != RegionState::Exclusive {
            return Err(RegionError::NotShared(region));
        }
        let mut grants = Vec::new();
        grants.push(ShmGrant {
            pid: owner,
            may_write: true,
        });
        self.state = RegionState::Shared(SharedMemory {
            id,
            owner: Some(owner),
            refs: 1,
            grants,
        });
        Ok(())
    }

    fn shared_mut(&mut self, id: RegionId) -> Result<&mut SharedMemory, RegionError> {
        match &mut self.state {
            RegionState::Shared(shm) => Ok(shm),
            _ => Err(RegionError::NotShared(id)),
        }
    }

    pub fn shm_ref(&mut self, id: RegionId) -> Result<usize, RegionError> {
        let shm = self.shared_mut(id)?;
        shm.refs += 1;
        Ok(shm.refs)
    }

    pub fn shm_deref(&mut self, id: RegionId) -> Result<RefDrop, RegionError> {
        let shm = self.shared_mut(id)?;
        if shm.refs == 0 {
            return Err(RegionError::NotShared(id));
        }
        shm.refs -= 1;
        Ok(if shm.refs == 0 {
            RefDrop::Released
        } else {
            RefDrop::Remaining(shm.refs)
        })
    }

    /// Detach the owner. The extent lives on until its last reference drops.
    pub fn orphan(&mut self, id: RegionId) -> Result<(), RegionError> {
        self.shared_mut(id)?.owner = None;
        Ok(())
    }

    /// Add or update the grant for `pid`.
    pub fn grant(
        &mut self,
        id: RegionId,
        pid: ProcessId,
        may_write: bool,
    ) -> Result<(), RegionError> {
        let shm = self.shared_mut(id)?;
        match shm.grants.iter_mut().find(|g| g.pid == pid) {
            Some(g) => g.may_write = may_write,
            None => shm.grants.push(ShmGrant { pid, may_write }),
        }
        Ok(())
    }

    /// Access rights of `pid`: `None` if not granted, `Some(may_write)` otherwise.
    #[must_use]
    pub fn permission(&self, pid: ProcessId) -> Option<bool> {
        let shm = self.shared()?;
        if shm.owner == Some(pid) {
            return Some(true);
        }
        shm.grants.iter().find(|g| g.pid == pid).map(|g| g.may_write)
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{{:#x} -> {:#x}}}({}",
            self.start,
            self.last(),
            if self.used { "Used" } else { "Free" }
        )?;
        if self.reserved {
            f.write_str(", Reserved")?;
        }
        match &self.state {
            RegionState::Exclusive => {}
            RegionState::CopyOnWrite { refs } => write!(f, ", CoW[{refs}]")?,
            RegionState::Shared(shm) => match shm.owner {
                Some(owner) => write!(f, ", Shared[{}:{owner}]", shm.id)?,
                None => write!(f, ", Shared[{}:orphan]", shm.id)?,
            },
        }
        f.write_str(")")?;
        if let Some(related) = self.related {
            write!(f, " => {}@{}", related.region, related.map)?;
        }
        Ok(())
    }
}
