//! # Region map
//!
//! [`RegionMap`] owns the address-ordered chain of [`Region`]s covering one
//! managed space and implements first-fit allocation, address-specific
//! allocation, release with coalescing and geometric splitting on top of it.
//!
//! ## Chain invariants
//!
//! - The chain starts at the lower bound of the space and ends at its upper
//!   bound; for every region `r` with successor `n`, `r.end() == n.start`.
//! - No two neighbouring regions are both free.
//! - `used_memory() + free_memory() + reserved_memory() == total_memory()`.
//!
//! ## Locking
//!
//! Every operation takes the map's [`MapLock`] once through a scoped guard
//! and holds it for the whole traverse-and-mutate sequence, so each early
//! return releases it exactly once. Nothing blocks while the lock is held.

use crate::arena::{Arena, Node, NodeStorage, RegionSlot};
use crate::error::{InvariantViolation, RegionError, chain_corrupted};
use crate::info::MemoryInfo;
use crate::lock::{MapLock, MapLockGuard};
use crate::region::{RefDrop, Region, RegionState, RelatedRegion};
use crate::{Address, Bytes, MapId, RegionId};
use alloc::vec::Vec;
use log::{debug, trace, warn};

/// The chain of regions covering one address space.
pub struct RegionMap {
    id: MapId,
    page_size: Bytes,
    inner: MapLock<MapInner>,
}

pub(crate) struct MapInner {
    pub arena: Arena,
    pub first: RegionId,
    pub page_size: Bytes,
    pub bytes_used: Bytes,
    pub bytes_reserved: Bytes,
    pub bytes_total: Bytes,
    pub next_shm: u32,
}

/// Walks the chain from a starting node.
pub(crate) struct Chain<'a> {
    arena: &'a Arena,
    cursor: Option<RegionId>,
    budget: usize,
}

impl<'a> Iterator for Chain<'a> {
    type Item = (RegionId, &'a Node);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.cursor?;
        if self.budget == 0 {
            chain_corrupted(format_args!("cycle through {id}"));
        }
        self.budget -= 1;
        let Some(node) = self.arena.get(id) else {
            chain_corrupted(format_args!("link to vacant node {id}"));
        };
        self.cursor = node.next;
        Some((id, node))
    }
}

impl RegionMap {
    /// Build a map over a ready-made chain of extents.
    ///
    /// The extents must be ordered, non-empty and gapless. Neighbouring free
    /// extents are merged; reserved extents are forced to `used`.
    pub fn new(
        page_size: Bytes,
        initial: impl IntoIterator<Item = Region>,
    ) -> Result<Self, RegionError> {
        if page_size == 0 {
            return Err(RegionError::InvalidPageSize);
        }

        let mut arena = Arena::new();
        let mut first = None;
        let mut last: Option<RegionId> = None;
        for mut region in initial {
            if region.size == 0 || region.start.checked_add(region.size).is_none() {
                return Err(RegionError::InvalidRange {
                    start: region.start,
                    size: region.size,
                });
            }
            if region.reserved {
                region.used = true;
            }

            if let Some(prev_id) = last {
                let Some(prev) = arena.get_mut(prev_id) else {
                    chain_corrupted(format_args!("lost tail {prev_id} while building"));
                };
                if prev.region.end() != region.start {
                    return Err(RegionError::InvalidRange {
                        start: region.start,
                        size: region.size,
                    });
                }
                if prev.region.is_free() && region.is_free() {
                    prev.region.size += region.size;
                    continue;
                }
            }

            let id = arena.insert(Node::unlinked(region));
            if let Some(prev_id) = last {
                if let Some(prev) = arena.get_mut(prev_id) {
                    prev.next = Some(id);
                }
                if let Some(node) = arena.get_mut(id) {
                    node.prev = Some(prev_id);
                }
            } else {
                first = Some(id);
            }
            last = Some(id);
        }

        let Some(first) = first else {
            return Err(RegionError::InvalidRange { start: 0, size: 0 });
        };

        let mut inner = MapInner {
            arena,
            first,
            page_size,
            bytes_used: 0,
            bytes_reserved: 0,
            bytes_total: 0,
            next_shm: 1,
        };
        inner.recalculate_totals();
        inner.bytes_total = inner.chain().map(|(_, n)| n.region.size).sum();

        let map = Self {
            id: MapId::next(),
            page_size,
            inner: MapLock::new(inner),
        };
        debug!(
            "{}: {} regions, {:#x} bytes, page size {:#x}",
            map.id,
            map.inner.with_lock(|i| i.arena.len()),
            map.total_memory(),
            page_size
        );
        Ok(map)
    }

    /// Build a map over a single free extent.
    pub fn with_extent(
        page_size: Bytes,
        start: Address,
        size: Bytes,
    ) -> Result<Self, RegionError> {
        Self::new(page_size, [Region::free(start, size)])
    }

    #[must_use]
    pub const fn id(&self) -> MapId {
        self.id
    }

    #[must_use]
    pub const fn page_size(&self) -> Bytes {
        self.page_size
    }

    pub(crate) fn lock(&self) -> MapLockGuard<'_, MapInner> {
        self.inner.lock()
    }

    /// Allocate at least `minimum_size` bytes, first-fit.
    ///
    /// The request is rounded up to whole pages. The allocation takes the low
    /// end of the first free region large enough; the rest stays free.
    ///
    /// # Errors
    ///
    /// [`RegionError::ZeroSize`] for an empty request and
    /// [`RegionError::NoSpace`] if no free region is large enough. The chain
    /// is left untouched in both cases.
    pub fn allocate(&self, minimum_size: Bytes) -> Result<RegionId, RegionError> {
        self.allocate_in(minimum_size, &mut None)
    }

    /// Like [`allocate`](Self::allocate), placing a split-off remainder into
    /// `storage` instead of a map-owned node. The slot is taken only if a
    /// remainder is produced.
    pub fn allocate_in(
        &self,
        minimum_size: Bytes,
        storage: &mut Option<RegionSlot>,
    ) -> Result<RegionId, RegionError> {
        let mut inner = self.lock();
        self.check_slots(&inner, core::slice::from_ref(storage))?;
        inner.allocate(minimum_size, storage)
    }

    /// Allocate the extent covering `[address, address + minimum_size)`.
    ///
    /// `address` is aligned down to its page, the size is extended to cover
    /// the requested end and rounded up to whole pages.
    ///
    /// # Errors
    ///
    /// [`RegionError::AddressUnavailable`] if that extent is not entirely
    /// inside one free region.
    pub fn allocate_at(
        &self,
        address: Address,
        minimum_size: Bytes,
    ) -> Result<RegionId, RegionError> {
        self.allocate_at_in(address, minimum_size, &mut [None, None])
    }

    /// Like [`allocate_at`](Self::allocate_at); `storage[0]` receives a
    /// trailing remainder, `storage[1]` a leading one.
    pub fn allocate_at_in(
        &self,
        address: Address,
        minimum_size: Bytes,
        storage: &mut [Option<RegionSlot>; 2],
    ) -> Result<RegionId, RegionError> {
        let mut inner = self.lock();
        self.check_slots(&inner, storage)?;
        inner.allocate_at(address, minimum_size, storage)
    }

    /// Release a region and merge it with free neighbours.
    ///
    /// Freeing a free region is a no-op. The handle stays valid and names the
    /// merged extent afterwards.
    ///
    /// # Errors
    ///
    /// [`RegionError::Reserved`] for reserved regions,
    /// [`RegionError::UnknownRegion`] for a stale handle.
    pub fn free(&self, id: RegionId) -> Result<(), RegionError> {
        self.lock().free(id)
    }

    /// Shrink `id` to `[split_start, split_start + split_size)`, inserting new
    /// neighbours for whatever lies before and after.
    ///
    /// # Errors
    ///
    /// [`RegionError::InvalidRange`] unless the sub-range is non-empty and
    /// inside `id`, [`RegionError::NotAllocated`] for a free region and
    /// [`RegionError::SharedExtent`] for shared memory.
    pub fn split(
        &self,
        id: RegionId,
        split_start: Address,
        split_size: Bytes,
    ) -> Result<RegionId, RegionError> {
        self.lock().split(id, split_start, split_size)
    }

    /// The region containing `address`.
    #[must_use]
    pub fn find(&self, address: Address) -> Option<RegionId> {
        self.lock().find(address)
    }

    /// Swap the descriptor of `old` for `replacement`, keeping its place in
    /// the chain.
    ///
    /// The replacement lives in a fresh map-owned node and must cover the
    /// same extent. If it carries no `related` link it inherits the old one.
    /// A `related` back-reference to `old`, held either in this map or in
    /// `counterpart`, is redirected to the new node. Returns the new handle;
    /// `old` becomes stale.
    pub fn replace_entry(
        &self,
        old: RegionId,
        replacement: Region,
        counterpart: Option<&Self>,
    ) -> Result<RegionId, RegionError> {
        match counterpart.filter(|other| other.id != self.id) {
            None => {
                let mut inner = self.lock();
                let (new, related) = inner.replace_entry(old, replacement)?;
                if let Some(rel) = related.filter(|r| r.map == self.id) {
                    inner.redirect_related(rel.region, self.id, old, new);
                }
                Ok(new)
            }
            Some(other) => {
                // Both maps are locked in id order so two concurrent
                // replacements across the same pair cannot deadlock.
                let (mut mine, mut theirs) = if self.id < other.id {
                    let mine = self.lock();
                    (mine, other.lock())
                } else {
                    let theirs = other.lock();
                    (self.lock(), theirs)
                };
                let (new, related) = mine.replace_entry(old, replacement)?;
                match related {
                    Some(rel) if rel.map == other.id => {
                        theirs.redirect_related(rel.region, self.id, old, new);
                    }
                    Some(rel) if rel.map == self.id => {
                        mine.redirect_related(rel.region, self.id, old, new);
                    }
                    _ => {}
                }
                Ok(new)
            }
        }
    }

    /// Recount used and reserved bytes from the chain.
    ///
    /// Needed after regions were modified through
    /// [`update_region`](Self::update_region).
    pub fn recalculate_totals(&self) {
        self.lock().recalculate_totals();
    }

    /// Bytes allocated, excluding reserved memory.
    #[must_use]
    pub fn used_memory(&self) -> Bytes {
        self.lock().bytes_used
    }

    #[must_use]
    pub fn reserved_memory(&self) -> Bytes {
        self.lock().bytes_reserved
    }

    /// Size of the whole managed space.
    #[must_use]
    pub fn total_memory(&self) -> Bytes {
        self.lock().bytes_total
    }

    #[must_use]
    pub fn free_memory(&self) -> Bytes {
        let inner = self.lock();
        inner
            .bytes_total
            .saturating_sub(inner.bytes_used + inner.bytes_reserved)
    }

    #[must_use]
    pub fn first_region(&self) -> RegionId {
        self.lock().first
    }

    pub fn next_region(&self, id: RegionId) -> Result<Option<RegionId>, RegionError> {
        Ok(self.lock().resolve(id)?.next)
    }

    pub fn prev_region(&self, id: RegionId) -> Result<Option<RegionId>, RegionError> {
        Ok(self.lock().resolve(id)?.prev)
    }

    /// Snapshot of one region.
    #[must_use]
    pub fn region(&self, id: RegionId) -> Option<Region> {
        self.lock().arena.get(id).map(|n| n.region.clone())
    }

    /// Run `f` on a region while the chain is locked.
    pub fn with_region<R>(
        &self,
        id: RegionId,
        f: impl FnOnce(&Region) -> R,
    ) -> Result<R, RegionError> {
        Ok(f(&self.lock().resolve(id)?.region))
    }

    /// Mutate a region's tags directly.
    ///
    /// Geometry edits are discarded since they would break the chain. Totals
    /// are not adjusted; call [`recalculate_totals`](Self::recalculate_totals)
    /// afterwards.
    pub fn update_region<R>(
        &self,
        id: RegionId,
        f: impl FnOnce(&mut Region) -> R,
    ) -> Result<R, RegionError> {
        let mut inner = self.lock();
        let region = &mut inner.resolve_mut(id)?.region;
        let (start, size) = (region.start, region.size);
        let out = f(region);
        if region.start != start || region.size != size {
            warn!("{}: ignoring geometry change of {id}", self.id);
            region.start = start;
            region.size = size;
        }
        if region.reserved {
            region.used = true;
        }
        Ok(out)
    }

    /// Snapshot of the whole chain in address order.
    #[must_use]
    pub fn regions(&self) -> Vec<(RegionId, Region)> {
        let inner = self.lock();
        inner
            .chain()
            .map(|(id, node)| (id, node.region.clone()))
            .collect()
    }

    pub fn set_related(
        &self,
        id: RegionId,
        related: Option<RelatedRegion>,
    ) -> Result<(), RegionError> {
        self.lock().resolve_mut(id)?.region.related = related;
        Ok(())
    }

    pub fn related(&self, id: RegionId) -> Result<Option<RelatedRegion>, RegionError> {
        Ok(self.lock().resolve(id)?.region.related)
    }

    /// Count one more copy-on-write mapping of `id`.
    pub fn cow_ref(&self, id: RegionId) -> Result<usize, RegionError> {
        self.lock().resolve_mut(id)?.region.cow_ref(id)
    }

    /// Drop one copy-on-write mapping; the last one frees the region.
    pub fn cow_deref(&self, id: RegionId) -> Result<RefDrop, RegionError> {
        let mut inner = self.lock();
        let dropped = inner.resolve_mut(id)?.region.cow_deref(id)?;
        if dropped == RefDrop::Released {
            trace!("{}: last CoW reference to {id} dropped", self.id);
            inner.free(id)?;
        }
        Ok(dropped)
    }

    /// Reserve caller storage for one future split result.
    ///
    /// Entries released by [`release_slot`](Self::release_slot) or left behind
    /// by coalesced caller nodes are reused before the arena grows.
    pub fn reserve_slot(&self) -> RegionSlot {
        RegionSlot {
            map: self.id,
            id: self.lock().arena.reserve(),
        }
    }

    /// Hand back a slot that was never consumed.
    pub fn release_slot(&self, slot: RegionSlot) -> Result<(), RegionError> {
        if slot.map != self.id || !self.lock().arena.release(slot.id) {
            return Err(RegionError::ForeignSlot);
        }
        Ok(())
    }

    fn check_slots(
        &self,
        inner: &MapInner,
        storage: &[Option<RegionSlot>],
    ) -> Result<(), RegionError> {
        for slot in storage.iter().flatten() {
            if slot.map != self.id || !inner.arena.is_reserved(slot.id) {
                return Err(RegionError::ForeignSlot);
            }
        }
        Ok(())
    }

    /// Check every chain invariant and the running totals.
    pub fn verify(&self) -> Result<(), InvariantViolation> {
        self.lock().verify()
    }

    /// Snapshot of the map's accounting.
    #[must_use]
    pub fn info(&self) -> MemoryInfo {
        let inner = self.lock();
        let mut info = MemoryInfo {
            page_size: inner.page_size,
            total: inner.bytes_total,
            used: inner.bytes_used,
            reserved: inner.bytes_reserved,
            free: 0,
            regions: 0,
            free_regions: 0,
            largest_free: 0,
        };
        for (_, node) in inner.chain() {
            info.regions += 1;
            if node.region.is_free() {
                info.free_regions += 1;
                info.free += node.region.size;
                info.largest_free = info.largest_free.max(node.region.size);
            }
        }
        info
    }

    /// Dump the chain through the logger.
    pub fn log_chain(&self, level: log::Level) {
        let inner = self.lock();
        for (id, node) in inner.chain() {
            log::log!(level, "{} {id}: {}", self.id, node.region);
        }
    }
}

impl MapInner {
    pub fn chain(&self) -> Chain<'_> {
        Chain {
            arena: &self.arena,
            cursor: Some(self.first),
            budget: self.arena.len(),
        }
    }

    /// Follow an internal link; a dangling one means the chain is corrupt.
    fn node(&self, id: RegionId) -> &Node {
        self.arena
            .get(id)
            .unwrap_or_else(|| chain_corrupted(format_args!("link to vacant node {id}")))
    }

    fn node_mut(&mut self, id: RegionId) -> &mut Node {
        self.arena
            .get_mut(id)
            .unwrap_or_else(|| chain_corrupted(format_args!("link to vacant node {id}")))
    }

    /// Look up a caller-supplied handle.
    pub fn resolve(&self, id: RegionId) -> Result<&Node, RegionError> {
        self.arena.get(id).ok_or(RegionError::UnknownRegion(id))
    }

    pub fn resolve_mut(&mut self, id: RegionId) -> Result<&mut Node, RegionError> {
        self.arena.get_mut(id).ok_or(RegionError::UnknownRegion(id))
    }

    /// Round up to a multiple of the page size.
    fn round_up(&self, size: Bytes) -> Option<Bytes> {
        size.div_ceil(self.page_size).checked_mul(self.page_size)
    }

    fn new_node(&mut self, region: Region, slot: Option<RegionSlot>) -> RegionId {
        let node = Node::unlinked(region);
        match slot {
            Some(slot) => self.arena.fill(slot.id, node),
            None => self.arena.insert(node),
        }
    }

    fn link_after(&mut self, anchor: RegionId, new: RegionId) {
        let next = self.node(anchor).next;
        {
            let node = self.node_mut(new);
            node.prev = Some(anchor);
            node.next = next;
        }
        if let Some(next) = next {
            self.node_mut(next).prev = Some(new);
        }
        self.node_mut(anchor).next = Some(new);
    }

    fn link_before(&mut self, anchor: RegionId, new: RegionId) {
        let prev = self.node(anchor).prev;
        {
            let node = self.node_mut(new);
            node.prev = prev;
            node.next = Some(anchor);
        }
        match prev {
            Some(prev) => self.node_mut(prev).next = Some(new),
            None => self.first = new,
        }
        self.node_mut(anchor).prev = Some(new);
    }

    /// Remove `id` from the chain and the arena.
    fn unlink(&mut self, id: RegionId) -> Node {
        let (prev, next) = {
            let node = self.node(id);
            (node.prev, node.next)
        };
        match prev {
            Some(prev) => self.node_mut(prev).next = next,
            None => match next {
                Some(next) => self.first = next,
                None => chain_corrupted(format_args!("unlinking the only node {id}")),
            },
        }
        if let Some(next) = next {
            self.node_mut(next).prev = prev;
        }
        self.arena
            .remove(id)
            .unwrap_or_else(|| chain_corrupted(format_args!("link to vacant node {id}")))
    }

    pub fn allocate(
        &mut self,
        minimum_size: Bytes,
        storage: &mut Option<RegionSlot>,
    ) -> Result<RegionId, RegionError> {
        if minimum_size == 0 {
            return Err(RegionError::ZeroSize);
        }
        let Some(size) = self.round_up(minimum_size) else {
            return Err(RegionError::NoSpace {
                requested: minimum_size,
            });
        };

        let Some(id) = self
            .chain()
            .find(|(_, node)| node.region.is_free() && node.region.size >= size)
            .map(|(id, _)| id)
        else {
            debug!("no free region of {size:#x} bytes");
            return Err(RegionError::NoSpace { requested: size });
        };

        let region = &self.node(id).region;
        if region.size != size {
            let remainder = Region::free(region.start + size, region.size - size);
            let new = self.new_node(remainder, storage.take());
            self.link_after(id, new);
        }
        let region = &mut self.node_mut(id).region;
        region.size = size;
        region.used = true;
        self.bytes_used += size;

        trace!("allocated {id} at {:#x}+{size:#x}", self.node(id).region.start);
        Ok(id)
    }

    pub fn allocate_at(
        &mut self,
        address: Address,
        minimum_size: Bytes,
        storage: &mut [Option<RegionSlot>; 2],
    ) -> Result<RegionId, RegionError> {
        if minimum_size == 0 {
            return Err(RegionError::ZeroSize);
        }
        let unavailable = RegionError::AddressUnavailable { address };
        let aligned = address - address % self.page_size;
        let size = (address - aligned)
            .checked_add(minimum_size)
            .and_then(|span| self.round_up(span))
            .ok_or(unavailable)?;
        let end = aligned.checked_add(size).ok_or(unavailable)?;

        let Some(id) = self.find(aligned) else {
            debug!("{address:#x} lies outside the map");
            return Err(unavailable);
        };
        let region = &self.node(id).region;
        if region.used || region.end() < end {
            debug!("{address:#x}+{minimum_size:#x} is not available in {region}");
            return Err(unavailable);
        }

        let (region_start, region_end) = (region.start, region.end());
        if region_end != end {
            let trailing = Region::free(end, region_end - end);
            let new = self.new_node(trailing, storage[0].take());
            self.link_after(id, new);
        }
        if region_start != aligned {
            let leading = Region::free(region_start, aligned - region_start);
            let new = self.new_node(leading, storage[1].take());
            self.link_before(id, new);
        }

        let region = &mut self.node_mut(id).region;
        region.start = aligned;
        region.size = size;
        region.used = true;
        self.bytes_used += size;

        trace!("allocated {id} at {aligned:#x}+{size:#x}");
        Ok(id)
    }

    pub fn free(&mut self, id: RegionId) -> Result<(), RegionError> {
        let node = self.resolve_mut(id)?;
        if node.region.reserved {
            return Err(RegionError::Reserved(id));
        }
        if node.region.is_free() {
            return Ok(());
        }

        let size = node.region.size;
        node.region.reset_to_free();
        let (prev, next) = (node.prev, node.next);
        self.bytes_used = self.bytes_used.saturating_sub(size);

        if let Some(prev) = prev.filter(|&p| self.node(p).region.is_free()) {
            let absorbed = self.unlink(prev);
            let region = &mut self.node_mut(id).region;
            if absorbed.region.end() != region.start {
                chain_corrupted(format_args!("{prev} does not end where {id} starts"));
            }
            region.start = absorbed.region.start;
            region.size += absorbed.region.size;
        }

        if let Some(next) = next.filter(|&n| self.node(n).region.is_free()) {
            let absorbed = self.unlink(next);
            let region = &mut self.node_mut(id).region;
            if region.end() != absorbed.region.start {
                chain_corrupted(format_args!("{id} does not end where {next} starts"));
            }
            region.size += absorbed.region.size;
        }

        trace!("freed {id}, now {}", self.node(id).region);
        Ok(())
    }

    pub fn split(
        &mut self,
        id: RegionId,
        split_start: Address,
        split_size: Bytes,
    ) -> Result<RegionId, RegionError> {
        let invalid = RegionError::InvalidRange {
            start: split_start,
            size: split_size,
        };
        let region = &self.resolve(id)?.region;
        let split_end = split_start.checked_add(split_size).ok_or(invalid)?;
        if split_size == 0 || split_start < region.start || split_end > region.end() {
            return Err(invalid);
        }
        if region.is_free() {
            return Err(RegionError::NotAllocated(id));
        }
        // Pieces cut off a shared extent would outlive its last reference.
        if region.shared().is_some() {
            return Err(RegionError::SharedExtent(id));
        }

        let (start, end) = (region.start, region.end());
        let leading = (split_start != start).then(|| piece_of(region, start, split_start - start));
        let trailing = (split_end != end).then(|| piece_of(region, split_end, end - split_end));

        if let Some(leading) = leading {
            let new = self.new_node(leading, None);
            self.link_before(id, new);
        }
        if let Some(trailing) = trailing {
            let new = self.new_node(trailing, None);
            self.link_after(id, new);
        }

        let region = &mut self.node_mut(id).region;
        region.start = split_start;
        region.size = split_size;

        trace!("split {id} to {split_start:#x}+{split_size:#x}");
        Ok(id)
    }

    pub fn find(&self, address: Address) -> Option<RegionId> {
        self.chain()
            .find(|(_, node)| node.region.contains(address))
            .map(|(id, _)| id)
    }

    /// Install `replacement` in place of `old`. Returns the new handle and
    /// the `related` link whose back-reference needs redirecting.
    pub fn replace_entry(
        &mut self,
        old: RegionId,
        mut replacement: Region,
    ) -> Result<(RegionId, Option<RelatedRegion>), RegionError> {
        let node = self.resolve(old)?;
        if replacement.start != node.region.start || replacement.size != node.region.size {
            return Err(RegionError::InvalidRange {
                start: replacement.start,
                size: replacement.size,
            });
        }
        if replacement.reserved {
            replacement.used = true;
        }
        let free_neighbour = [node.prev, node.next]
            .into_iter()
            .flatten()
            .any(|n| self.node(n).region.is_free());
        if replacement.is_free() && free_neighbour {
            return Err(RegionError::InvalidRange {
                start: replacement.start,
                size: replacement.size,
            });
        }

        let (prev, next) = (node.prev, node.next);
        let related = node.region.related;
        if replacement.related.is_none() {
            replacement.related = related;
        }

        let new = self.arena.insert(Node {
            region: replacement,
            prev,
            next,
            storage: NodeStorage::Map,
        });
        match prev {
            Some(prev) => self.node_mut(prev).next = Some(new),
            None => self.first = new,
        }
        if let Some(next) = next {
            self.node_mut(next).prev = Some(new);
        }
        let retired = self
            .arena
            .remove(old)
            .unwrap_or_else(|| chain_corrupted(format_args!("lost {old} while replacing")));

        let (old_used, old_reserved) = contribution(&retired.region);
        let (new_used, new_reserved) = contribution(&self.node(new).region);
        self.bytes_used = self.bytes_used.saturating_sub(old_used) + new_used;
        self.bytes_reserved = self.bytes_reserved.saturating_sub(old_reserved) + new_reserved;

        trace!("replaced {old} with {new}");
        Ok((new, related))
    }

    /// Point `target.related` at `new` if it currently names `old` in `map`.
    pub fn redirect_related(
        &mut self,
        target: RegionId,
        map: MapId,
        old: RegionId,
        new: RegionId,
    ) {
        let Some(node) = self.arena.get_mut(target) else {
            return;
        };
        if node.region.related == Some(RelatedRegion { map, region: old }) {
            node.region.related = Some(RelatedRegion { map, region: new });
        }
    }

    pub fn recalculate_totals(&mut self) {
        let (used, reserved) = self.count_totals();
        self.bytes_used = used;
        self.bytes_reserved = reserved;
    }

    fn count_totals(&self) -> (Bytes, Bytes) {
        self.chain().fold((0, 0), |(used, reserved), (_, node)| {
            let (u, r) = contribution(&node.region);
            (used + u, reserved + r)
        })
    }

    pub fn verify(&self) -> Result<(), InvariantViolation> {
        let head = self.node(self.first);
        if head.prev.is_some() {
            return Err(InvariantViolation::HeadHasPredecessor(self.first));
        }

        let mut prev: Option<(RegionId, &Node)> = None;
        for (id, node) in self.chain() {
            if node.region.size == 0 {
                return Err(InvariantViolation::EmptyRegion(id));
            }
            if let Some((prev_id, prev_node)) = prev {
                if prev_node.next != Some(id) || node.prev != Some(prev_id) {
                    return Err(InvariantViolation::AsymmetricLink(prev_id, id));
                }
                if prev_node.region.end() != node.region.start {
                    return Err(InvariantViolation::Gap(prev_id, id));
                }
                if prev_node.region.is_free() && node.region.is_free() {
                    return Err(InvariantViolation::AdjacentFree(prev_id, id));
                }
            }
            prev = Some((id, node));
        }

        let (used, reserved) = self.count_totals();
        if used != self.bytes_used {
            return Err(InvariantViolation::UsedTotal {
                tracked: self.bytes_used,
                counted: used,
            });
        }
        if reserved != self.bytes_reserved {
            return Err(InvariantViolation::ReservedTotal {
                tracked: self.bytes_reserved,
                counted: reserved,
            });
        }
        Ok(())
    }
}

/// `(used, reserved)` bytes a region adds to the totals.
const fn contribution(region: &Region) -> (Bytes, Bytes) {
    match (region.used, region.reserved) {
        (_, true) => (0, region.size),
        (true, false) => (region.size, 0),
        (false, false) => (0, 0),
    }
}

/// A piece cut off an allocated region by [`MapInner::split`].
///
/// It keeps the allocation flags and the CoW count; the `related` link stays
/// with the region that was split. Shared extents are never split.
fn piece_of(region: &Region, start: Address, size: Bytes) -> Region {
    let state = match region.state {
        RegionState::CopyOnWrite { refs } => RegionState::CopyOnWrite { refs },
        RegionState::Exclusive | RegionState::Shared(_) => RegionState::Exclusive,
    };
    Region {
        start,
        size,
        used: region.used,
        reserved: region.reserved,
        state,
        related: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: Bytes = 0x1000;

    fn shape(map: &RegionMap) -> Vec<(Address, Bytes, bool)> {
        map.regions()
            .into_iter()
            .map(|(_, r)| (r.start, r.size, r.used))
            .collect()
    }

    #[test]
    fn construction_merges_free_neighbours() {
        let map = RegionMap::new(
            PAGE,
            [
                Region::free(0, 0x1000),
                Region::free(0x1000, 0x1000),
                Region::reserved(0x2000, 0x1000),
                Region::free(0x3000, 0x1000),
            ],
        )
        .unwrap();
        assert_eq!(
            shape(&map),
            [(0, 0x2000, false), (0x2000, 0x1000, true), (0x3000, 0x1000, false)]
        );
        assert_eq!(map.reserved_memory(), 0x1000);
        assert_eq!(map.used_memory(), 0);
        assert_eq!(map.total_memory(), 0x4000);
        map.verify().unwrap();
    }

    #[test]
    fn construction_rejects_gaps_and_bad_input() {
        assert_eq!(
            RegionMap::new(PAGE, [Region::free(0, 0x1000), Region::free(0x2000, 0x1000)]).err(),
            Some(RegionError::InvalidRange {
                start: 0x2000,
                size: 0x1000
            })
        );
        assert_eq!(
            RegionMap::with_extent(0, 0, 0x1000).err(),
            Some(RegionError::InvalidPageSize)
        );
        assert!(RegionMap::new(PAGE, Vec::new()).is_err());
        assert!(RegionMap::with_extent(PAGE, 0, 0).is_err());
    }

    #[test]
    fn unaligned_tail_is_never_allocated_as_a_full_page() {
        let map = RegionMap::with_extent(PAGE, 0, 0x1800).unwrap();
        let a = map.allocate(1).unwrap();
        assert_eq!(map.region(a).unwrap().size, PAGE);
        assert_eq!(
            map.allocate(1),
            Err(RegionError::NoSpace { requested: PAGE })
        );
        // The tail is reported as free, just not as an allocatable page.
        assert_eq!(map.info().largest_free, 0x800);
        assert_eq!(
            map.allocate(0x800),
            Err(RegionError::NoSpace { requested: PAGE })
        );
        map.verify().unwrap();
    }

    #[test]
    fn split_keeps_flags_and_cow_count() {
        let map = RegionMap::with_extent(PAGE, 0, 0x10000).unwrap();
        let r = map.allocate(0x4000).unwrap();
        map.cow_ref(r).unwrap();
        map.split(r, 0x1000, 0x2000).unwrap();

        let regions = map.regions();
        assert_eq!(regions.len(), 4);
        for (_, region) in &regions[..3] {
            assert!(region.used);
            assert_eq!(region.state, RegionState::CopyOnWrite { refs: 2 });
        }
        assert_eq!(map.region(r).unwrap().start, 0x1000);
        assert_eq!(map.region(r).unwrap().size, 0x2000);
        assert_eq!(map.used_memory(), 0x4000);
        map.verify().unwrap();
    }

    #[test]
    fn split_rejects_free_and_out_of_range() {
        let map = RegionMap::with_extent(PAGE, 0, 0x4000).unwrap();
        let first = map.first_region();
        assert_eq!(
            map.split(first, 0x1000, 0x1000),
            Err(RegionError::NotAllocated(first))
        );

        let r = map.allocate(0x2000).unwrap();
        assert!(matches!(
            map.split(r, 0x1000, 0x2000),
            Err(RegionError::InvalidRange { .. })
        ));
        assert!(matches!(
            map.split(r, 0, 0),
            Err(RegionError::InvalidRange { .. })
        ));
        // Whole-region split is a no-op.
        assert_eq!(map.split(r, 0, 0x2000), Ok(r));
        assert_eq!(map.regions().len(), 2);
    }

    #[test]
    fn update_region_ignores_geometry() {
        let map = RegionMap::with_extent(PAGE, 0, 0x4000).unwrap();
        let r = map.allocate(0x1000).unwrap();
        map.update_region(r, |region| {
            region.size = 0x3000;
            region.reserved = true;
        })
        .unwrap();
        assert_eq!(map.region(r).unwrap().size, 0x1000);
        assert!(map.verify().is_err());
        map.recalculate_totals();
        map.verify().unwrap();
        assert_eq!(map.reserved_memory(), 0x1000);
        assert_eq!(map.used_memory(), 0);
    }
}
