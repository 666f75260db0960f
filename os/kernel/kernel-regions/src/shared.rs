//! # Shared-memory bookkeeping
//!
//! Shared extents are ordinary used regions tagged with a
//! [`SharedMemory`] state. They are created by one process, which may grant
//! read or read-write access to others. Processes attach by id; the extent
//! is released when the last attachment goes away, not when its owner exits.

use crate::error::RegionError;
use crate::map::MapInner;
use crate::region::{ProcessId, RefDrop, SharedMemory, ShmId};
use crate::{Bytes, RegionId, RegionMap};
use alloc::vec::Vec;
use log::{debug, trace};

impl RegionMap {
    /// Allocate a shared extent owned by `owner`, who holds the first reference.
    pub fn allocate_shared(
        &self,
        minimum_size: Bytes,
        owner: ProcessId,
    ) -> Result<(RegionId, ShmId), RegionError> {
        let mut inner = self.lock();
        let id = inner.allocate(minimum_size, &mut None)?;
        let shm = ShmId(inner.next_shm);
        inner.next_shm = inner.next_shm.wrapping_add(1).max(1);
        inner.resolve_mut(id)?.region.make_shared(id, shm, owner)?;
        debug!("{}: shared memory {shm} at {id} for process {owner}", self.id());
        Ok((id, shm))
    }

    /// The region carrying shared-memory id `shm`.
    #[must_use]
    pub fn find_shared(&self, shm: ShmId) -> Option<RegionId> {
        self.lock().find_shared(shm)
    }

    /// Let `pid` access `shm`. Only the live owner may grant.
    pub fn shm_allow(
        &self,
        shm: ShmId,
        granter: ProcessId,
        pid: ProcessId,
        may_write: bool,
    ) -> Result<(), RegionError> {
        let mut inner = self.lock();
        let id = inner
            .find_shared(shm)
            .ok_or(RegionError::SharedNotFound(shm))?;
        let region = &mut inner.resolve_mut(id)?.region;
        if region.shared().and_then(SharedMemory::owner) != Some(granter) {
            return Err(RegionError::PermissionDenied {
                id: shm,
                pid: granter,
            });
        }
        region.grant(id, pid, may_write)
    }

    /// Attach `pid` to `shm`, taking one reference.
    ///
    /// Returns the region and whether `pid` may write to it.
    pub fn shm_attach(
        &self,
        shm: ShmId,
        pid: ProcessId,
    ) -> Result<(RegionId, bool), RegionError> {
        let mut inner = self.lock();
        let id = inner
            .find_shared(shm)
            .ok_or(RegionError::SharedNotFound(shm))?;
        let region = &mut inner.resolve_mut(id)?.region;
        let writable = region
            .permission(pid)
            .ok_or(RegionError::PermissionDenied { id: shm, pid })?;
        let refs = region.shm_ref(id)?;
        trace!("process {pid} attached to {shm} ({refs} references)");
        Ok((id, writable))
    }

    pub fn shm_ref(&self, id: RegionId) -> Result<usize, RegionError> {
        self.lock().resolve_mut(id)?.region.shm_ref(id)
    }

    /// Drop one reference; the last one frees the extent.
    pub fn shm_deref(&self, id: RegionId) -> Result<RefDrop, RegionError> {
        let mut inner = self.lock();
        let dropped = inner.resolve_mut(id)?.region.shm_deref(id)?;
        if dropped == RefDrop::Released {
            trace!("{}: last shared reference to {id} dropped", self.id());
            inner.free(id)?;
        }
        Ok(dropped)
    }

    /// Detach exiting process `pid` as owner of its shared extents.
    ///
    /// The extents stay allocated for as long as they are referenced.
    /// Returns how many were orphaned.
    pub fn orphan_shared(&self, pid: ProcessId) -> usize {
        let mut inner = self.lock();
        let owned: Vec<RegionId> = inner
            .chain()
            .filter(|(_, node)| {
                node.region.shared().and_then(SharedMemory::owner) == Some(pid)
            })
            .map(|(id, _)| id)
            .collect();
        let orphaned = owned
            .into_iter()
            .filter(|&id| {
                inner
                    .resolve_mut(id)
                    .and_then(|node| node.region.orphan(id))
                    .is_ok()
            })
            .count();
        if orphaned > 0 {
            debug!("{}: orphaned {orphaned} shared extents of process {pid}", self.id());
        }
        orphaned
    }
}

impl MapInner {
    pub fn find_shared(&self, shm: ShmId) -> Option<RegionId> {
        self.chain()
            .find(|(_, node)| node.region.shared().map(SharedMemory::id) == Some(shm))
            .map(|(id, _)| id)
    }
}
