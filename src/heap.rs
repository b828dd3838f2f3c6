//! Private module for selective re-export.

use crate::fingerprint::Fingerprint;
use crate::program::HeapElement;
use ahash::AHashMap;
use std::fmt;

/// An opaque heap handle. Zero is null.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Pointer(u32);

impl Pointer {
    pub const NULL: Pointer = Pointer(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub(crate) fn from_index(index: u32) -> Pointer {
        Pointer(index + 1)
    }

    /// The slot index behind a non-null pointer.
    pub(crate) fn index(self) -> u32 {
        debug_assert!(self.0 != 0);
        self.0 - 1
    }

    pub(crate) fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "null")
        } else {
            write!(f, "ptr:{}", self.0)
        }
    }
}

/// Transient canonical-traversal results cached on a heap object. Never part
/// of the undo discipline: caches are advisory and are invalidated on any
/// mutation or restore.
#[derive(Clone, Debug, Default)]
pub(crate) struct CanonCache {
    /// Canonical id assigned by the most recently committed traversal.
    pub id: u32,
    /// Fingerprint of the object's canonical serialization, if still valid.
    pub fingerprint: Option<Fingerprint>,
    /// Canonical ids of the object's reference fields at cache time.
    pub children: Vec<u32>,
}

/// One allocated aggregate plus its traversal caches.
#[derive(Clone, Debug)]
pub(crate) struct HeapObject {
    pub elem: Box<dyn HeapElement>,
    pub canon: CanonCache,
}

impl HeapObject {
    fn new(elem: Box<dyn HeapElement>) -> Self {
        Self {
            elem,
            canon: CanonCache::default(),
        }
    }
}

/// The saved prior contents of a heap slot for one checkpoint interval.
///
/// A slot carries at most one pending shadow (the interval since the last
/// checkpoint); older shadows live in the snapshot's history entries. Rollback
/// only moves saved objects around, it never allocates chain nodes.
#[derive(Clone, Debug)]
pub(crate) enum SlotShadow {
    /// The slot was free at the last checkpoint.
    Free,
    /// The slot held this object at the last checkpoint.
    Occupied(HeapObject),
}

/// Per-pointer undo logs drained at checkpoint time.
pub(crate) type HeapLog = AHashMap<u32, SlotShadow>;

/// The heap table: an arena of copy-on-write slots indexed by pointer.
#[derive(Debug, Default)]
pub(crate) struct Heap {
    slots: Vec<Option<HeapObject>>,
    /// Rolling allocation cursor; checkpointed as a snapshot scalar.
    cursor: u32,
    /// Live object count.
    live: usize,
    /// Shadows for slots dirtied, allocated, or freed since the last
    /// checkpoint.
    pending: HeapLog,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn live_count(&self) -> usize {
        self.live
    }

    pub fn cursor(&self) -> u32 {
        self.cursor
    }

    pub fn set_cursor(&mut self, cursor: u32) {
        self.cursor = cursor;
    }

    /// Allocates a slot by linear scan from the rolling cursor, wrapping past
    /// garbage, doubling the table when no slot is free.
    pub fn alloc(&mut self, elem: Box<dyn HeapElement>) -> Pointer {
        let len = self.slots.len();
        let index = (0..len)
            .map(|i| (self.cursor as usize + i) % len.max(1))
            .find(|&i| len > 0 && self.slots[i].is_none())
            .unwrap_or_else(|| {
                let grown = (len * 2).max(16);
                self.slots.resize_with(grown, || None);
                len
            });
        self.cursor = (index as u32).wrapping_add(1);
        self.slots[index] = Some(HeapObject::new(elem));
        self.live += 1;
        let ptr = Pointer::from_index(index as u32);
        // An undone allocation frees the slot again.
        self.pending.entry(ptr.raw()).or_insert(SlotShadow::Free);
        ptr
    }

    pub fn get(&self, ptr: Pointer) -> Option<&dyn HeapElement> {
        self.object(ptr).map(|o| o.elem.as_ref())
    }

    /// Mutable access; saves the slot's shadow on the first mutation after a
    /// checkpoint and drops the object's fingerprint cache.
    pub fn get_mut(&mut self, ptr: Pointer) -> Option<&mut dyn HeapElement> {
        if ptr.is_null() {
            return None;
        }
        let slot = self.slots.get_mut(ptr.index() as usize)?;
        let object = slot.as_mut()?;
        self.pending
            .entry(ptr.raw())
            .or_insert_with(|| SlotShadow::Occupied(object.clone()));
        object.canon.fingerprint = None;
        Some(object.elem.as_mut())
    }

    /// Removes an object unreachable from the roots. Recorded in the pending
    /// log so rollback resurrects it.
    pub fn free(&mut self, ptr: Pointer) {
        if ptr.is_null() {
            return;
        }
        if let Some(slot) = self.slots.get_mut(ptr.index() as usize) {
            if let Some(object) = slot.take() {
                self.live -= 1;
                self.pending
                    .entry(ptr.raw())
                    .or_insert(SlotShadow::Occupied(object));
            }
        }
    }

    pub(crate) fn object(&self, ptr: Pointer) -> Option<&HeapObject> {
        if ptr.is_null() {
            return None;
        }
        self.slots.get(ptr.index() as usize)?.as_ref()
    }

    /// Cache-only access for committing traversal results. Does not touch the
    /// undo discipline.
    pub(crate) fn cache_mut(&mut self, ptr: Pointer) -> Option<&mut CanonCache> {
        if ptr.is_null() {
            return None;
        }
        let object = self.slots.get_mut(ptr.index() as usize)?.as_mut()?;
        Some(&mut object.canon)
    }

    pub(crate) fn live_pointers(&self) -> impl Iterator<Item = Pointer> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_some())
            .map(|(i, _)| Pointer::from_index(i as u32))
    }

    /// Drains the pending per-pointer logs for the interval that ends now.
    pub fn check_in(&mut self) -> HeapLog {
        std::mem::take(&mut self.pending)
    }

    /// Discards uncommitted work by restoring every pending shadow.
    pub fn revert(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        for (raw, shadow) in pending {
            self.restore(Pointer(raw), shadow);
        }
    }

    /// Applies one checkpoint interval's log. Called newest-first during
    /// rollback so the oldest interval's shadows land last.
    pub(crate) fn apply_log(&mut self, log: HeapLog) {
        for (raw, shadow) in log {
            self.restore(Pointer(raw), shadow);
        }
    }

    fn restore(&mut self, ptr: Pointer, shadow: SlotShadow) {
        let index = ptr.index() as usize;
        if index >= self.slots.len() {
            self.slots.resize_with(index + 1, || None);
        }
        let slot = &mut self.slots[index];
        match (slot.is_some(), shadow) {
            (true, SlotShadow::Free) => {
                *slot = None;
                self.live -= 1;
            }
            (false, SlotShadow::Free) => {}
            (was_live, SlotShadow::Occupied(mut object)) => {
                // The cache may describe a traversal that never happened on
                // this timeline.
                object.canon.fingerprint = None;
                if !was_live {
                    self.live += 1;
                }
                *slot = Some(object);
            }
        }
    }

    /// A clean deep copy with no pending shadows.
    pub fn fork(&self) -> Self {
        Self {
            slots: self.slots.clone(),
            cursor: self.cursor,
            live: self.live,
            pending: HeapLog::default(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_util::cell::cell;

    #[test]
    fn alloc_reuses_freed_slots_before_growing() {
        let mut heap = Heap::new();
        let a = heap.alloc(cell(1, Pointer::NULL));
        let b = heap.alloc(cell(2, Pointer::NULL));
        assert_ne!(a, b);
        let capacity = heap.capacity();
        heap.free(a);
        let c = heap.alloc(cell(3, Pointer::NULL));
        assert_eq!(heap.capacity(), capacity);
        assert_eq!(c, a);
        assert_eq!(heap.live_count(), 2);
    }

    #[test]
    fn table_doubles_when_full() {
        let mut heap = Heap::new();
        for i in 0..17 {
            heap.alloc(cell(i, Pointer::NULL));
        }
        assert_eq!(heap.live_count(), 17);
        assert!(heap.capacity() >= 17);
    }

    #[test]
    fn revert_undoes_alloc_mutation_and_free() {
        let mut heap = Heap::new();
        let a = heap.alloc(cell(1, Pointer::NULL));
        heap.check_in();

        let b = heap.alloc(cell(2, a));
        heap.get_mut(a); // dirty a
        heap.free(a);
        heap.revert();

        assert!(heap.object(a).is_some());
        assert!(heap.object(b).is_none());
        assert_eq!(heap.live_count(), 1);
    }

    #[test]
    fn apply_log_resurrects_freed_objects() {
        let mut heap = Heap::new();
        let a = heap.alloc(cell(9, Pointer::NULL));
        let log = heap.check_in();
        assert_eq!(log.len(), 1);

        heap.free(a);
        heap.check_in();
        assert_eq!(heap.live_count(), 0);

        let mut log = HeapLog::default();
        log.insert(
            a.raw(),
            SlotShadow::Occupied(HeapObject::new(cell(9, Pointer::NULL))),
        );
        heap.apply_log(log);
        assert_eq!(heap.live_count(), 1);
        assert!(heap.object(a).is_some());
    }
}
