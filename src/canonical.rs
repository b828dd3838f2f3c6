//! Heap canonicalization.
//!
//! A traversal assigns every reachable heap object an order-independent
//! canonical id, serializes each fragment of the state with references
//! replaced by those ids, and drives the fingerprint engine over the result.
//! Two heaps that are isomorphic up to object identity canonicalize to the
//! same ids and therefore the same fingerprint; that is the core correctness
//! property of duplicate detection.
//!
//! Instances are per worker and never shared, keeping the hot path free of
//! synchronization.

use crate::fingerprint::{hash_bytes, Fingerprint};
use crate::heap::Pointer;
use crate::program::StateWriter;
use crate::state::{ProcessStatus, StateSnapshot};
use ahash::{AHashMap, AHashSet};
use std::collections::VecDeque;

/// Fragment offsets into the logical state bitstream. Fragments are hashed
/// independently and XOR-combined, so each kind gets its own offset region to
/// keep equal byte patterns in different roles from colliding.
const GLOBALS_OFFSET: u64 = 0;
const CONTROL_OFFSET: u64 = 1 << 16;
const PROCESS_OFFSET_BASE: u64 = 1 << 20;
const PROCESS_OFFSET_STRIDE: u64 = 1 << 12;
const HEAP_OFFSET_BASE: u64 = 1 << 32;
const HEAP_OFFSET_STRIDE: u64 = 1 << 12;

/// Synthetic parent keys for references reachable directly from the roots.
/// Heap parents use their canonical id, which stays below this range.
const GLOBALS_PARENT: u32 = 0x8000_0000;
const PROCESS_PARENT_BASE: u32 = 0x8000_0001;

/// How canonical ids are assigned across consecutive traversals.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CanonicalAlgorithm {
    /// The canonical id is the rank of first visitation in breadth-first
    /// order from the roots. Always correct and simplest, but every traversal
    /// renumbers everything, so object fingerprints can never be cached.
    Nonincremental,
    /// Reuses the id previously assigned to the same (parent id, field) slot
    /// when it is not already taken this traversal, minting a fresh id on a
    /// mutation. Unchanged subgraphs keep stable ids across consecutive
    /// states, which enables the per-object fingerprint cache.
    Incremental,
}

pub struct HeapCanonicalizer {
    algorithm: CanonicalAlgorithm,

    // Persistent across traversals (incremental only).
    reuse: AHashMap<(u32, u32), u32>,
    next_fresh: u32,

    // Reset at every traversal start.
    seen: Vec<u64>,
    assigned: AHashMap<u32, u32>,
    used: AHashSet<u32>,
    queue: VecDeque<Pointer>,
    rank: u32,
}

impl HeapCanonicalizer {
    pub fn new(algorithm: CanonicalAlgorithm) -> Self {
        Self {
            algorithm,
            reuse: AHashMap::new(),
            next_fresh: 0,
            seen: Vec::new(),
            assigned: AHashMap::new(),
            used: AHashSet::new(),
            queue: VecDeque::new(),
            rank: 0,
        }
    }

    fn begin(&mut self, heap_capacity: usize) {
        self.seen.clear();
        self.seen.resize((heap_capacity + 63) / 64, 0);
        self.assigned.clear();
        self.used.clear();
        self.queue.clear();
        self.rank = 0;
    }

    fn mark_seen(&mut self, ptr: Pointer) {
        let index = ptr.index() as usize;
        self.seen[index / 64] |= 1 << (index % 64);
    }

    fn is_seen(&self, ptr: Pointer) -> bool {
        let index = ptr.index() as usize;
        self.seen[index / 64] & (1 << (index % 64)) != 0
    }

    /// Resolves a reference to its canonical id. The first visit of a target
    /// assigns an id and enqueues it for fragment processing; later visits
    /// reuse the assignment.
    fn canonical_id(&mut self, parent: u32, field: u32, target: Pointer) -> u32 {
        if target.is_null() {
            return 0;
        }
        if let Some(&id) = self.assigned.get(&target.raw()) {
            return id;
        }
        let id = match self.algorithm {
            CanonicalAlgorithm::Nonincremental => {
                self.rank += 1;
                self.rank
            }
            CanonicalAlgorithm::Incremental => {
                match self.reuse.get(&(parent, field)) {
                    // Reusing the prior id for this slot keeps the subgraph's
                    // fingerprints stable.
                    Some(&prior) if !self.used.contains(&prior) => prior,
                    // The slot moved or the id is taken elsewhere: a
                    // mutation. Mint a fresh id.
                    _ => {
                        self.next_fresh += 1;
                        self.next_fresh
                    }
                }
            }
        };
        self.reuse.insert((parent, field), id);
        self.used.insert(id);
        self.assigned.insert(target.raw(), id);
        self.mark_seen(target);
        self.queue.push_back(target);
        id
    }

    /// Canonicalizes and fingerprints one complete state.
    ///
    /// Also the garbage collection point: any heap object not reached from
    /// the globals or a process stack is removed at traversal end. Canonical
    /// ids and object fingerprints computed along the way are committed back
    /// onto the heap only then, so the caches never describe a traversal
    /// that did not complete.
    ///
    /// The logical step counter is deliberately not hashed; it counts
    /// transitions taken, not program state.
    pub fn state_fingerprint(
        &mut self,
        state: &mut StateSnapshot,
        buf: &mut Vec<u8>,
    ) -> Fingerprint {
        self.begin(state.heap.capacity());

        // Globals fragment.
        buf.clear();
        {
            let mut field = 0u32;
            let mut resolve = |p: Pointer| {
                let id = self.canonical_id(GLOBALS_PARENT, field, p);
                field += 1;
                id
            };
            let mut w = StateWriter::new(buf, &mut resolve);
            state.globals.get().write_to(&mut w);
        }
        let mut fp = hash_bytes(buf, GLOBALS_OFFSET);

        // Control fragment: pending choice and terminal markers.
        buf.clear();
        if let Some(pending) = state.pending_choice() {
            buf.push(1);
            buf.extend_from_slice(&(pending.pid as u32).to_le_bytes());
            buf.extend_from_slice(&(pending.count as u32).to_le_bytes());
        }
        if state.pruned() {
            buf.push(2);
        }
        if let Some(fault) = state.fault() {
            buf.push(3);
            buf.extend_from_slice(format!("{}", fault).as_bytes());
        }
        fp = fp.concat(hash_bytes(buf, CONTROL_OFFSET));

        // One fragment per process stack.
        for pid in 0..state.processes.len() {
            buf.clear();
            let parent = PROCESS_PARENT_BASE + pid as u32;
            let mut field = 0u32;
            let mut resolve = |p: Pointer| {
                let id = self.canonical_id(parent, field, p);
                field += 1;
                id
            };
            let process = &state.processes[pid];
            let mut w = StateWriter::new(buf, &mut resolve);
            w.write_u8(match process.status {
                ProcessStatus::Runnable => 1,
                ProcessStatus::Blocked => 2,
                ProcessStatus::Completed => 3,
            });
            w.write_u32(process.frames.len() as u32);
            for frame in &process.frames {
                w.write_str(frame.code.name());
                w.write_u32(frame.block());
                frame.data().locals.write_to(&mut w);
            }
            fp = fp.concat(hash_bytes(
                buf,
                PROCESS_OFFSET_BASE + pid as u64 * PROCESS_OFFSET_STRIDE,
            ));
        }

        // Breadth-first drain of the discovered heap objects. The queue may
        // grow mid-drain as new references turn up.
        let mut commits: Vec<(Pointer, u32, Fingerprint, Vec<u32>)> = Vec::new();
        while let Some(ptr) = self.queue.pop_front() {
            let id = self.assigned[&ptr.raw()];

            let mut children = Vec::new();
            {
                let object = state.heap.object(ptr).expect("queued pointer is live");
                let mut visit = |field: usize, child: Pointer| {
                    children.push(self.canonical_id(id, field as u32, child));
                };
                object.elem.traverse(&mut visit);
            }

            let object = state.heap.object(ptr).expect("queued pointer is live");
            let cached = match (self.algorithm, object.canon.fingerprint) {
                (CanonicalAlgorithm::Incremental, Some(cached))
                    if object.canon.id == id && object.canon.children == children =>
                {
                    Some(cached)
                }
                _ => None,
            };
            let object_fp = cached.unwrap_or_else(|| {
                buf.clear();
                let mut field = 0u32;
                let mut resolve = |p: Pointer| {
                    let child = self.canonical_id(id, field, p);
                    field += 1;
                    child
                };
                let mut w = StateWriter::new(buf, &mut resolve);
                w.write_u8(object.elem.kind().tag());
                object.elem.write_to(&mut w);
                hash_bytes(buf, HEAP_OFFSET_BASE + id as u64 * HEAP_OFFSET_STRIDE)
            });
            fp = fp.concat(object_fp);
            commits.push((ptr, id, object_fp, children));
        }

        // Unseen objects are unreachable from the roots: garbage.
        let garbage: Vec<Pointer> = state
            .heap
            .live_pointers()
            .filter(|p| !self.is_seen(*p))
            .collect();
        for ptr in garbage {
            state.heap.free(ptr);
        }

        if self.algorithm == CanonicalAlgorithm::Incremental {
            for (ptr, id, object_fp, children) in commits {
                if let Some(cache) = state.heap.cache_mut(ptr) {
                    cache.id = id;
                    cache.fingerprint = Some(object_fp);
                    cache.children = children;
                }
            }
        }

        fp
    }
}
