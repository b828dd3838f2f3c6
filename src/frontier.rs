//! Private module for selective re-export.

use std::collections::VecDeque;
use std::fs::File;
use std::hash::BuildHasherDefault;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use ahash::AHashSet;
use dashmap::DashMap;
use nohash_hasher::NoHashHasher;
use parking_lot::{Condvar, Mutex};

use crate::node::{TraceStep, TraversalNode};
use crate::sched::SearchBounds;

/// A state admitted to a BFS layer, stored as the work needed to rebuild it
/// rather than the state itself: search-cost bounds, the scheduler snapshot,
/// and a (possibly compact) trace from the root. Cost is proportional to
/// trace length, not state size.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FrontierRecord {
    pub bounds: SearchBounds,
    pub sched_blob: Vec<u8>,
    pub trace: Vec<TraceStep>,
}

impl FrontierRecord {
    pub fn from_node(node: &Rc<TraversalNode>, compact: bool, with_scheduler: bool) -> Self {
        Self {
            bounds: node.bounds(),
            sched_blob: if with_scheduler {
                node.scheduler_blob()
            } else {
                Vec::new()
            },
            trace: node.trace(compact),
        }
    }

    /// Approximate resident size, used against the memory budget.
    fn resident_size(&self) -> u64 {
        16 + 4 * self.trace.len() as u64 + self.sched_blob.len() as u64
    }

    /// Writes one record in the frontier file format: little-endian
    /// `execution:i32, choice:i32, [delays:i32, blobLen:i32, blob]?,
    /// stepCount:i32, stepCount x u32` with the choice flag in each step
    /// word's low bit. The scheduler section is present only when the active
    /// bounding policy carries scheduler state; both sides must agree.
    pub fn encode<W: Write>(&self, w: &mut W, with_scheduler: bool) -> io::Result<()> {
        w.write_all(&(self.bounds.execution as i32).to_le_bytes())?;
        w.write_all(&(self.bounds.choice as i32).to_le_bytes())?;
        if with_scheduler {
            w.write_all(&(self.bounds.delays as i32).to_le_bytes())?;
            w.write_all(&(self.sched_blob.len() as i32).to_le_bytes())?;
            w.write_all(&self.sched_blob)?;
        }
        w.write_all(&(self.trace.len() as i32).to_le_bytes())?;
        for step in &self.trace {
            w.write_all(&step.pack().to_le_bytes())?;
        }
        Ok(())
    }

    /// Reads one record, or `None` at a clean end of stream.
    pub fn decode<R: Read>(r: &mut R, with_scheduler: bool) -> io::Result<Option<Self>> {
        let execution = match read_i32(r) {
            Ok(n) => n as u32,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        };
        let choice = read_i32(r)? as u32;
        let mut delays = 0;
        let mut sched_blob = Vec::new();
        if with_scheduler {
            delays = read_i32(r)? as u32;
            let len = read_i32(r)? as usize;
            sched_blob = vec![0u8; len];
            r.read_exact(&mut sched_blob)?;
        }
        let count = read_i32(r)? as usize;
        let mut trace = Vec::with_capacity(count);
        for _ in 0..count {
            let mut word = [0u8; 4];
            r.read_exact(&mut word)?;
            trace.push(TraceStep::unpack(u32::from_le_bytes(word)));
        }
        Ok(Some(Self {
            bounds: SearchBounds {
                execution,
                choice,
                delays,
                preemptions: 0,
            },
            sched_blob,
            trace,
        }))
    }
}

fn read_i32<R: Read>(r: &mut R) -> io::Result<i32> {
    let mut word = [0u8; 4];
    r.read_exact(&mut word)?;
    Ok(i32::from_le_bytes(word))
}

#[derive(Clone, Debug)]
pub struct FrontierConfig {
    /// Whether records carry the optional scheduler section.
    pub with_scheduler: bool,
    /// Records whose choice cost exceeds this are dropped at insertion.
    pub choice_cutoff: Option<u32>,
    /// Directory for disk spillover. Without one, layers stay in memory
    /// regardless of budget.
    pub spill_dir: Option<PathBuf>,
    /// Approximate bytes the pending layer may occupy before subsequent
    /// layers spill to disk.
    pub memory_budget: Option<u64>,
    /// File shards per layer; one background reader or writer each.
    pub shards: usize,
    /// Capacity of each bounded producer/consumer queue.
    pub queue_capacity: usize,
}

impl Default for FrontierConfig {
    fn default() -> Self {
        Self {
            with_scheduler: false,
            choice_cutoff: None,
            spill_dir: None,
            memory_budget: None,
            shards: 4,
            queue_capacity: 1024,
        }
    }
}

/// A bounded blocking queue on a mutex and condvar. `push` blocks while the
/// queue is full, `pop` while it is empty; closing wakes everyone, after
/// which pushes are dropped and pops drain the remainder.
struct BoundedQueue<T> {
    inner: Mutex<QueueState<T>>,
    cond: Condvar,
}

struct QueueState<T> {
    items: VecDeque<T>,
    capacity: usize,
    closed: bool,
}

impl<T> BoundedQueue<T> {
    fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueState {
                items: VecDeque::new(),
                capacity: capacity.max(1),
                closed: false,
            }),
            cond: Condvar::new(),
        }
    }

    fn push(&self, item: T) -> bool {
        let mut q = self.inner.lock();
        while q.items.len() >= q.capacity && !q.closed {
            self.cond.wait(&mut q);
        }
        if q.closed {
            return false;
        }
        q.items.push_back(item);
        self.cond.notify_all();
        true
    }

    fn pop(&self) -> Option<T> {
        let mut q = self.inner.lock();
        loop {
            if let Some(item) = q.items.pop_front() {
                self.cond.notify_all();
                return Some(item);
            }
            if q.closed {
                return None;
            }
            self.cond.wait(&mut q);
        }
    }

    fn close(&self) {
        self.inner.lock().closed = true;
        self.cond.notify_all();
    }
}

type NextLayerMap = DashMap<u64, FrontierRecord, BuildHasherDefault<NoHashHasher<u64>>>;

enum Mode {
    Memory {
        current: Mutex<VecDeque<FrontierRecord>>,
        next: NextLayerMap,
        resident: AtomicU64,
    },
    Disk(DiskFrontier),
}

/// Holds one BFS layer of discovered states and accumulates the next,
/// deduplicated by fingerprint (first writer wins). Starts in memory;
/// once the pending layer's estimated size crosses the memory budget and a
/// spill directory is configured, later layers move through sharded files
/// with background reader and writer threads.
pub struct FrontierSet {
    config: FrontierConfig,
    cancel: Arc<AtomicBool>,
    mode: Mode,
}

impl FrontierSet {
    pub fn new(config: FrontierConfig) -> Self {
        Self {
            config,
            cancel: Arc::new(AtomicBool::new(false)),
            mode: Mode::Memory {
                current: Mutex::new(VecDeque::new()),
                next: NextLayerMap::default(),
                resident: AtomicU64::new(0),
            },
        }
    }

    /// Admits a record to the pending layer. Returns false when the record
    /// was dropped: already seen this layer, over the final choice cutoff, or
    /// the run is canceled.
    pub fn add(&self, fingerprint: u64, record: FrontierRecord) -> bool {
        if self.cancel.load(Ordering::Relaxed) {
            return false;
        }
        if let Some(cutoff) = self.config.choice_cutoff {
            if record.bounds.choice > cutoff {
                return false;
            }
        }
        match &self.mode {
            Mode::Memory { next, resident, .. } => match next.entry(fingerprint) {
                dashmap::mapref::entry::Entry::Occupied(_) => false,
                dashmap::mapref::entry::Entry::Vacant(slot) => {
                    resident.fetch_add(record.resident_size(), Ordering::Relaxed);
                    slot.insert(record);
                    true
                }
            },
            Mode::Disk(disk) => disk.add(fingerprint, record),
        }
    }

    /// Pulls the next record of the current layer. `None` means the layer is
    /// exhausted (in disk mode this may block on the reader pool first).
    pub fn pop(&self) -> Option<FrontierRecord> {
        match &self.mode {
            Mode::Memory { current, .. } => current.lock().pop_front(),
            Mode::Disk(disk) => disk.read_queue.pop(),
        }
    }

    /// Records admitted to the pending layer so far.
    pub fn pending(&self) -> u64 {
        match &self.mode {
            Mode::Memory { next, .. } => next.len() as u64,
            Mode::Disk(disk) => disk.pending.load(Ordering::Relaxed),
        }
    }

    /// Promotes the pending layer to current. Must be called from a single
    /// thread with all workers quiesced. Returns the size of the new current
    /// layer.
    pub fn advance(&mut self) -> io::Result<u64> {
        if let Mode::Memory { next, resident, .. } = &self.mode {
            let over_budget = self
                .config
                .memory_budget
                .is_some_and(|budget| resident.load(Ordering::Relaxed) > budget);
            if over_budget && self.config.spill_dir.is_some() {
                log::debug!(
                    "frontier exceeded memory budget ({} records pending); spilling to disk",
                    next.len()
                );
                self.spill()?;
            }
        }
        match &mut self.mode {
            Mode::Memory {
                current,
                next,
                resident,
            } => {
                let drained = std::mem::take(next);
                resident.store(0, Ordering::Relaxed);
                let mut queue = current.lock();
                debug_assert!(queue.is_empty(), "advance with current layer unconsumed");
                queue.clear();
                queue.extend(drained.into_iter().map(|(_, record)| record));
                Ok(queue.len() as u64)
            }
            Mode::Disk(disk) => disk.advance(),
        }
    }

    /// Moves the pending layer into a freshly opened disk frontier.
    fn spill(&mut self) -> io::Result<()> {
        let dir = self
            .config
            .spill_dir
            .clone()
            .expect("spill requires a directory");
        let disk = DiskFrontier::open(
            dir,
            self.config.shards,
            self.config.queue_capacity,
            self.config.with_scheduler,
            Arc::clone(&self.cancel),
        )?;
        let old = std::mem::replace(&mut self.mode, Mode::Disk(disk));
        if let (Mode::Memory { next, .. }, Mode::Disk(disk)) = (old, &self.mode) {
            for (fingerprint, record) in next {
                disk.add(fingerprint, record);
            }
        }
        Ok(())
    }

    /// Cooperative cancellation: pending additions are dropped and queued
    /// work drains without being replaced.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
        if let Mode::Disk(disk) = &self.mode {
            for queue in &disk.write_queues {
                queue.close();
            }
            disk.read_queue.close();
        }
    }
}

struct DiskFrontier {
    dir: PathBuf,
    shards: usize,
    capacity: usize,
    with_scheduler: bool,
    cancel: Arc<AtomicBool>,
    /// Layer the writer pool is currently producing.
    generation: usize,
    seen: Mutex<AHashSet<u64>>,
    pending: AtomicU64,
    write_queues: Vec<Arc<BoundedQueue<FrontierRecord>>>,
    writers: Vec<JoinHandle<io::Result<()>>>,
    read_queue: Arc<BoundedQueue<FrontierRecord>>,
    readers: Vec<JoinHandle<io::Result<()>>>,
}

impl DiskFrontier {
    fn open(
        dir: PathBuf,
        shards: usize,
        capacity: usize,
        with_scheduler: bool,
        cancel: Arc<AtomicBool>,
    ) -> io::Result<Self> {
        let shards = shards.max(1);
        let mut disk = Self {
            dir,
            shards,
            capacity,
            with_scheduler,
            cancel,
            generation: 0,
            seen: Mutex::new(AHashSet::new()),
            pending: AtomicU64::new(0),
            write_queues: Vec::new(),
            writers: Vec::new(),
            // Replaced by `advance`; closed so pops return None until then.
            read_queue: Arc::new(BoundedQueue::new(1)),
            readers: Vec::new(),
        };
        disk.read_queue.close();
        disk.spawn_writers()?;
        Ok(disk)
    }

    fn shard_path(&self, generation: usize, shard: usize) -> PathBuf {
        self.dir.join(format!("layer{generation}-shard{shard}.frontier"))
    }

    fn spawn_writers(&mut self) -> io::Result<()> {
        for shard in 0..self.shards {
            let queue = Arc::new(BoundedQueue::<FrontierRecord>::new(self.capacity));
            let path = self.shard_path(self.generation, shard);
            let with_scheduler = self.with_scheduler;
            let handle = std::thread::Builder::new()
                .name(format!("frontier-writer-{shard}"))
                .spawn({
                    let queue = Arc::clone(&queue);
                    move || -> io::Result<()> {
                        let mut file = BufWriter::new(File::create(&path)?);
                        while let Some(record) = queue.pop() {
                            record.encode(&mut file, with_scheduler)?;
                        }
                        file.flush()
                    }
                })?;
            self.write_queues.push(queue);
            self.writers.push(handle);
        }
        Ok(())
    }

    fn spawn_readers(&mut self, generation: usize) -> io::Result<()> {
        let queue = Arc::new(BoundedQueue::new(self.capacity));
        let remaining = Arc::new(AtomicUsize::new(self.shards));
        for shard in 0..self.shards {
            let path = self.shard_path(generation, shard);
            let with_scheduler = self.with_scheduler;
            let cancel = Arc::clone(&self.cancel);
            let handle = std::thread::Builder::new()
                .name(format!("frontier-reader-{shard}"))
                .spawn({
                    let queue = Arc::clone(&queue);
                    let remaining = Arc::clone(&remaining);
                    move || -> io::Result<()> {
                        let result = (|| -> io::Result<()> {
                            let mut file = BufReader::new(File::open(&path)?);
                            while let Some(record) =
                                FrontierRecord::decode(&mut file, with_scheduler)?
                            {
                                if cancel.load(Ordering::Relaxed) || !queue.push(record) {
                                    break;
                                }
                            }
                            Ok(())
                        })();
                        // Last reader out closes the consumer side.
                        if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                            queue.close();
                        }
                        result
                    }
                })?;
            self.readers.push(handle);
        }
        self.read_queue = queue;
        Ok(())
    }

    fn add(&self, fingerprint: u64, record: FrontierRecord) -> bool {
        if !self.seen.lock().insert(fingerprint) {
            return false;
        }
        let shard = fingerprint as usize % self.shards;
        if self.write_queues[shard].push(record) {
            self.pending.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    fn join_io(handles: &mut Vec<JoinHandle<io::Result<()>>>) -> io::Result<()> {
        let mut first_err = None;
        for handle in handles.drain(..) {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => first_err = first_err.or(Some(e)),
                Err(_) => {
                    first_err = first_err.or_else(|| {
                        Some(io::Error::new(
                            io::ErrorKind::Other,
                            "frontier io thread panicked",
                        ))
                    });
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn advance(&mut self) -> io::Result<u64> {
        // WaitForAllWriters: the pending layer's shards must be complete
        // before readers open them.
        for queue in &self.write_queues {
            queue.close();
        }
        self.write_queues.clear();
        Self::join_io(&mut self.writers)?;

        // WaitForAllReaders of the layer just consumed.
        self.read_queue.close();
        let mut readers = std::mem::take(&mut self.readers);
        Self::join_io(&mut readers)?;

        let finished = self.generation;
        if finished > 0 {
            for shard in 0..self.shards {
                let _ = std::fs::remove_file(self.shard_path(finished - 1, shard));
            }
        }
        let count = self.pending.swap(0, Ordering::Relaxed);
        self.seen.lock().clear();
        self.generation += 1;
        self.spawn_readers(finished)?;
        self.spawn_writers()?;
        Ok(count)
    }
}

impl Drop for DiskFrontier {
    fn drop(&mut self) {
        for queue in &self.write_queues {
            queue.close();
        }
        self.read_queue.close();
        let _ = Self::join_io(&mut self.writers);
        let mut readers = std::mem::take(&mut self.readers);
        let _ = Self::join_io(&mut readers);
        // `advance` only deletes layers two generations back; the last two
        // are still on disk here.
        for generation in self.generation.saturating_sub(1)..=self.generation {
            for shard in 0..self.shards {
                let _ = std::fs::remove_file(self.shard_path(generation, shard));
            }
        }
    }
}
