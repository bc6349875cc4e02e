//! Object table and inode lifecycle.
//!
//! Every live object occupies one arena slot together with its reference
//! counts. All count changes and the destruction decision happen under the
//! single arena lock, so a racing open either finds the object alive and
//! takes a reference, or finds the slot already vacated.
//!
//! Lock order: a directory entry lock may be held while taking the arena
//! lock, never the reverse.

use std::sync::{Arc, Mutex};

use nsvfs_config::{log_lifecycle_debug, log_lifecycle_trace};
use serde::{Deserialize, Serialize};

use crate::error::{Result, VfsError};
use crate::object::{Inode, ObjectId};
use crate::sync;

/// Link and open-handle counts of one object
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefCounts {
    /// Directory entries naming the object
    pub links: u32,
    /// Live open handles
    pub opens: u32,
}

impl RefCounts {
    /// Unlinked but still held open
    pub fn is_orphaned(&self) -> bool {
        self.links == 0 && self.opens > 0
    }

    fn is_dead(&self) -> bool {
        self.links == 0 && self.opens == 0
    }
}

/// What became of an object after a count was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Still reachable by at least one name
    Linked,
    /// Nameless, kept alive by open handles
    Orphaned,
    /// Both counts reached zero; storage released
    Reclaimed,
}

/// Live object counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableStats {
    pub live: usize,
    pub orphaned: usize,
}

struct Live {
    inode: Arc<Inode>,
    counts: RefCounts,
}

struct Slot {
    generation: u32,
    live: Option<Live>,
}

#[derive(Default)]
struct Arena {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl Arena {
    fn live(&self, id: ObjectId) -> Option<&Live> {
        let slot = self.slots.get(id.index() as usize)?;
        if slot.generation != id.generation() {
            return None;
        }
        slot.live.as_ref()
    }

    fn live_mut(&mut self, id: ObjectId) -> Option<&mut Live> {
        let slot = self.slots.get_mut(id.index() as usize)?;
        if slot.generation != id.generation() {
            return None;
        }
        slot.live.as_mut()
    }

    /// Make sure slot `index` exists, registering new slots as free
    fn grow_to(&mut self, index: usize) {
        while self.slots.len() <= index {
            let fresh = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                live: None,
            });
            self.free.push(fresh);
        }
    }

    /// Vacate a slot. The generation bump makes every outstanding id stale.
    fn reclaim(&mut self, id: ObjectId) -> Option<Arc<Inode>> {
        let slot = self.slots.get_mut(id.index() as usize)?;
        let live = slot.live.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index());
        Some(live.inode)
    }
}

/// Arena of filesystem objects with explicit free-on-both-zero.
pub struct ObjectTable {
    arena: Mutex<Arena>,
}

impl Default for ObjectTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectTable {
    pub fn new() -> Self {
        Self {
            arena: Mutex::new(Arena::default()),
        }
    }

    /// Allocate a fresh slot and build the object for the id it receives.
    pub(crate) fn allocate(
        &self,
        counts: RefCounts,
        build: impl FnOnce(ObjectId) -> Inode,
    ) -> Arc<Inode> {
        let mut arena = sync::lock(&self.arena);
        let index = match arena.free.pop() {
            Some(index) => index,
            None => {
                arena.slots.push(Slot {
                    generation: 0,
                    live: None,
                });
                (arena.slots.len() - 1) as u32
            }
        };
        let slot = &mut arena.slots[index as usize];
        let id = ObjectId::new(index, slot.generation);
        let inode = Arc::new(build(id));
        slot.live = Some(Live {
            inode: inode.clone(),
            counts,
        });
        log_lifecycle_trace!("Object allocated", id = %id, links = counts.links, opens = counts.opens);
        inode
    }

    /// Place an object at exactly `inode.id()`. Used when rebuilding a table
    /// from a checkpoint; fails if the slot is occupied.
    pub(crate) fn install(&self, inode: Inode, counts: RefCounts) -> Result<Arc<Inode>> {
        let id = inode.id();
        let index = id.index() as usize;
        let mut arena = sync::lock(&self.arena);
        arena.grow_to(index);
        if arena.slots[index].live.is_some() {
            return Err(VfsError::AlreadyExists);
        }
        arena.free.retain(|&free| free as usize != index);
        let inode = Arc::new(inode);
        let slot = &mut arena.slots[index];
        slot.generation = id.generation();
        slot.live = Some(Live {
            inode: inode.clone(),
            counts,
        });
        Ok(inode)
    }

    pub fn get(&self, id: ObjectId) -> Option<Arc<Inode>> {
        sync::lock(&self.arena)
            .live(id)
            .map(|live| live.inode.clone())
    }

    pub fn counts(&self, id: ObjectId) -> Option<RefCounts> {
        sync::lock(&self.arena).live(id).map(|live| live.counts)
    }

    /// Take an open reference. Fails if the object was already destroyed.
    pub(crate) fn acquire_open(&self, id: ObjectId) -> Result<Arc<Inode>> {
        let mut arena = sync::lock(&self.arena);
        let live = arena.live_mut(id).ok_or(VfsError::NoSuchEntry)?;
        live.counts.opens += 1;
        log_lifecycle_trace!("Open reference taken", id = %id, opens = live.counts.opens);
        Ok(live.inode.clone())
    }

    /// Drop an open reference, reclaiming the object if it was the last
    /// reference of an unlinked object.
    pub(crate) fn release_open(&self, id: ObjectId) -> Disposition {
        let mut arena = sync::lock(&self.arena);
        let Some(live) = arena.live_mut(id) else {
            return Disposition::Reclaimed;
        };
        live.counts.opens = live.counts.opens.saturating_sub(1);
        let counts = live.counts;
        Self::settle(&mut arena, id, counts)
    }

    /// Drop a link. Called by the removal engine with the parent's entry
    /// lock held, so the detach and the decrement are one step.
    pub(crate) fn release_link(&self, id: ObjectId) -> Disposition {
        let mut arena = sync::lock(&self.arena);
        let Some(live) = arena.live_mut(id) else {
            return Disposition::Reclaimed;
        };
        live.counts.links = live.counts.links.saturating_sub(1);
        let counts = live.counts;
        Self::settle(&mut arena, id, counts)
    }

    pub(crate) fn set_links(&self, id: ObjectId, links: u32) {
        if let Some(live) = sync::lock(&self.arena).live_mut(id) {
            live.counts.links = links;
        }
    }

    /// Guarantee that no later occupant of `id`'s slot is ever named by
    /// `id`. Used for back-references that outlived their target.
    pub(crate) fn retire(&self, id: ObjectId) {
        let index = id.index() as usize;
        let mut arena = sync::lock(&self.arena);
        arena.grow_to(index);
        let slot = &mut arena.slots[index];
        if slot.live.is_none() && slot.generation <= id.generation() {
            slot.generation = id.generation().wrapping_add(1);
        }
    }

    /// Reclaim every object with neither links nor open handles.
    /// Returns how many were dropped.
    pub(crate) fn reclaim_unreferenced(&self) -> usize {
        let mut arena = sync::lock(&self.arena);
        let dead: Vec<ObjectId> = arena
            .slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                let live = slot.live.as_ref()?;
                live.counts
                    .is_dead()
                    .then(|| ObjectId::new(index as u32, slot.generation))
            })
            .collect();
        for id in &dead {
            arena.reclaim(*id);
        }
        dead.len()
    }

    fn settle(arena: &mut Arena, id: ObjectId, counts: RefCounts) -> Disposition {
        if counts.is_dead() {
            // The inode itself is freed once the last Arc (held by a closing
            // handle or the caller) goes away.
            arena.reclaim(id);
            log_lifecycle_debug!("Object reclaimed", id = %id);
            Disposition::Reclaimed
        } else if counts.links == 0 {
            log_lifecycle_debug!("Object orphaned", id = %id, opens = counts.opens);
            Disposition::Orphaned
        } else {
            Disposition::Linked
        }
    }

    /// Ids of all live objects with their counts, in slot order
    pub fn live_objects(&self) -> Vec<(ObjectId, RefCounts)> {
        let arena = sync::lock(&self.arena);
        arena
            .slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                slot.live
                    .as_ref()
                    .map(|live| (ObjectId::new(index as u32, slot.generation), live.counts))
            })
            .collect()
    }

    pub fn stats(&self) -> TableStats {
        let objects = self.live_objects();
        TableStats {
            live: objects.len(),
            orphaned: objects.iter().filter(|(_, c)| c.is_orphaned()).count(),
        }
    }

    pub fn len(&self) -> usize {
        self.stats().live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Attributes;

    fn alloc_file(table: &ObjectTable, links: u32, opens: u32) -> Arc<Inode> {
        table.allocate(RefCounts { links, opens }, |id| {
            Inode::new_file(id, Attributes::new(0o644, 0, 0), Vec::new())
        })
    }

    #[test]
    fn test_unlink_without_opens_reclaims() {
        let table = ObjectTable::new();
        let inode = alloc_file(&table, 1, 0);
        assert_eq!(table.release_link(inode.id()), Disposition::Reclaimed);
        assert!(table.get(inode.id()).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_unlink_with_open_orphans_then_close_reclaims() {
        let table = ObjectTable::new();
        let inode = alloc_file(&table, 1, 0);
        let id = inode.id();
        table.acquire_open(id).unwrap();

        assert_eq!(table.release_link(id), Disposition::Orphaned);
        assert!(table.counts(id).unwrap().is_orphaned());
        assert_eq!(table.stats().orphaned, 1);

        assert_eq!(table.release_open(id), Disposition::Reclaimed);
        assert!(table.get(id).is_none());
    }

    #[test]
    fn test_reused_slot_gets_new_generation() {
        let table = ObjectTable::new();
        let first = alloc_file(&table, 1, 0).id();
        table.release_link(first);

        let second = alloc_file(&table, 1, 0).id();
        assert_eq!(first.index(), second.index());
        assert_ne!(first.generation(), second.generation());
        // The stale id must not reach the new occupant
        assert!(table.get(first).is_none());
        assert_eq!(table.acquire_open(first).unwrap_err(), VfsError::NoSuchEntry);
    }

    #[test]
    fn test_install_at_exact_id() {
        let table = ObjectTable::new();
        let id = ObjectId::new(5, 2);
        let inode = Inode::new_file(id, Attributes::new(0o600, 0, 0), b"x".to_vec());
        table
            .install(inode, RefCounts { links: 0, opens: 1 })
            .unwrap();
        assert_eq!(table.get(id).unwrap().content().unwrap(), b"x");

        let clash = Inode::new_file(id, Attributes::new(0o600, 0, 0), Vec::new());
        assert_eq!(
            table.install(clash, RefCounts::default()).unwrap_err(),
            VfsError::AlreadyExists
        );

        // Lower slots were left free for later allocations
        let fresh = alloc_file(&table, 1, 0).id();
        assert!(fresh.index() < 5);
    }

    #[test]
    fn test_retired_id_never_reused() {
        let table = ObjectTable::new();
        let stale = ObjectId::new(0, 0);
        table.retire(stale);
        let fresh = alloc_file(&table, 1, 0).id();
        assert_eq!(fresh.index(), 0);
        assert_ne!(fresh, stale);
    }

    #[test]
    fn test_reclaim_unreferenced() {
        let table = ObjectTable::new();
        alloc_file(&table, 0, 0);
        let kept = alloc_file(&table, 0, 1).id();
        assert_eq!(table.reclaim_unreferenced(), 1);
        assert_eq!(table.live_objects(), vec![(kept, RefCounts { links: 0, opens: 1 })]);
    }
}
