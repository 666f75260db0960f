//! # Node arena
//!
//! The chain is stored as an arena of generational entries instead of raw
//! back-pointers. A [`RegionId`] names an entry *and* the generation it was
//! issued for, so a handle to a node that was coalesced away is detected
//! rather than followed.
//!
//! ## Storage authority
//!
//! Every live node records who provided its entry ([`NodeStorage`]):
//!
//! - [`NodeStorage::Map`] entries were created by the map on demand. When such
//!   a node leaves the chain the map destroys it and recycles the entry for its
//!   own use.
//! - [`NodeStorage::Caller`] entries were reserved up front by a caller (see
//!   [`RegionSlot`]) so that an allocation-sensitive path never grows the
//!   arena. When such a node leaves the chain its entry goes back to the spare
//!   pool that only [`Arena::reserve`] draws from.

use crate::region::Region;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

/// Generational handle of one node in a map's chain.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct RegionId {
    index: u32,
    generation: u32,
}

impl RegionId {
    #[must_use]
    pub const fn from_raw_parts(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    #[must_use]
    pub const fn index(self) -> u32 {
        self.index
    }

    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

/// Unique identity of one [`RegionMap`](crate::RegionMap).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Ord, PartialOrd, Hash)]
pub struct MapId(pub(crate) u32);

impl MapId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU32 = AtomicU32::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for MapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "map{}", self.0)
    }
}

/// Caller-owned storage for one region descriptor.
///
/// Obtained from [`RegionMap::reserve_slot`](crate::RegionMap::reserve_slot)
/// ahead of time and handed to the `*_in` allocation variants, which take it
/// only if they actually need a new node.
///
/// A slot that was not consumed must go back through
/// [`RegionMap::release_slot`](crate::RegionMap::release_slot). Dropping it
/// keeps its entry reserved for the lifetime of the map.
#[derive(Debug)]
#[must_use = "unused slots must be handed back with `RegionMap::release_slot`"]
pub struct RegionSlot {
    pub(crate) map: MapId,
    pub(crate) id: RegionId,
}

impl RegionSlot {
    #[must_use]
    pub const fn map(&self) -> MapId {
        self.map
    }

    /// Handle the region placed into this slot will carry.
    #[must_use]
    pub const fn region(&self) -> RegionId {
        self.id
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum NodeStorage {
    Map,
    Caller,
}

/// A chain node: descriptor plus links.
#[derive(Debug)]
pub(crate) struct Node {
    pub region: Region,
    pub prev: Option<RegionId>,
    pub next: Option<RegionId>,
    pub storage: NodeStorage,
}

impl Node {
    pub const fn unlinked(region: Region) -> Self {
        Self {
            region,
            prev: None,
            next: None,
            storage: NodeStorage::Map,
        }
    }
}

#[derive(Debug)]
enum Entry {
    Vacant,
    /// Handed out as a [`RegionSlot`], not yet filled.
    Reserved,
    Occupied(Node),
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    entry: Entry,
}

#[derive(Debug, Default)]
pub(crate) struct Arena {
    slots: Vec<Slot>,
    /// Vacant entries the map may reuse for its own nodes.
    free: Vec<u32>,
    /// Vacant entries that held caller storage; reserved for callers.
    spare: Vec<u32>,
    live: usize,
}

impl Arena {
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            spare: Vec::new(),
            live: 0,
        }
    }

    /// Number of nodes currently in the chain.
    pub const fn len(&self) -> usize {
        self.live
    }

    pub fn get(&self, id: RegionId) -> Option<&Node> {
        match self.slots.get(id.index as usize)? {
            Slot {
                generation,
                entry: Entry::Occupied(node),
            } if *generation == id.generation => Some(node),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, id: RegionId) -> Option<&mut Node> {
        match self.slots.get_mut(id.index as usize)? {
            Slot {
                generation,
                entry: Entry::Occupied(node),
            } if *generation == id.generation => Some(node),
            _ => None,
        }
    }

    fn vacant_index(&mut self, pool_first: bool) -> u32 {
        let reused = if pool_first {
            self.spare.pop().or_else(|| self.free.pop())
        } else {
            self.free.pop()
        };
        reused.unwrap_or_else(|| {
            let index = u32::try_from(self.slots.len()).unwrap_or_else(|_| {
                crate::error::chain_corrupted(format_args!("arena index space exhausted"))
            });
            self.slots.push(Slot {
                generation: 0,
                entry: Entry::Vacant,
            });
            index
        })
    }

    /// Store a map-owned node.
    pub fn insert(&mut self, mut node: Node) -> RegionId {
        node.storage = NodeStorage::Map;
        let index = self.vacant_index(false);
        let slot = &mut self.slots[index as usize];
        slot.entry = Entry::Occupied(node);
        self.live += 1;
        RegionId {
            index,
            generation: slot.generation,
        }
    }

    /// Set aside an entry for a caller.
    pub fn reserve(&mut self) -> RegionId {
        let index = self.vacant_index(true);
        let slot = &mut self.slots[index as usize];
        slot.entry = Entry::Reserved;
        RegionId {
            index,
            generation: slot.generation,
        }
    }

    pub fn is_reserved(&self, id: RegionId) -> bool {
        matches!(
            self.slots.get(id.index as usize),
            Some(Slot { generation, entry: Entry::Reserved }) if *generation == id.generation
        )
    }

    /// Place a caller-owned node into the reserved entry `id`.
    pub fn fill(&mut self, id: RegionId, mut node: Node) -> RegionId {
        if !self.is_reserved(id) {
            crate::error::chain_corrupted(format_args!("slot {id} is not reserved"));
        }
        node.storage = NodeStorage::Caller;
        self.slots[id.index as usize].entry = Entry::Occupied(node);
        self.live += 1;
        id
    }

    /// Return an unused reserved entry.
    pub fn release(&mut self, id: RegionId) -> bool {
        if !self.is_reserved(id) {
            return false;
        }
        let slot = &mut self.slots[id.index as usize];
        slot.entry = Entry::Vacant;
        slot.generation = slot.generation.wrapping_add(1);
        self.spare.push(id.index);
        true
    }

    /// Take a node out of the arena, invalidating every handle to it.
    pub fn remove(&mut self, id: RegionId) -> Option<Node> {
        self.get(id)?;
        let slot = &mut self.slots[id.index as usize];
        let Entry::Occupied(node) = core::mem::replace(&mut slot.entry, Entry::Vacant) else {
            return None;
        };
        slot.generation = slot.generation.wrapping_add(1);
        self.live -= 1;
        match node.storage {
            NodeStorage::Map => self.free.push(id.index),
            NodeStorage::Caller => self.spare.push(id.index),
        }
        Some(node)
    }

    /// Entries that will serve [`Arena::reserve`] without growing the arena.
    #[cfg(test)]
    pub fn spare_len(&self) -> usize {
        self.spare.len()
    }
}
