//! Private module for selective re-export.

use std::hash::BuildHasherDefault;
use std::io::Write;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Barrier;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use nohash_hasher::NoHashHasher;
use parking_lot::{Mutex, RwLock};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::canonical::CanonicalAlgorithm;
use crate::fingerprint::Fingerprint;
use crate::frontier::{FrontierConfig, FrontierRecord, FrontierSet};
use crate::node::{NodePolicy, TraceStep, TraversalNode, WorkerContext};
use crate::program::{CompiledProgram, Fault};
use crate::report::{Discovery, ReportData, Reporter, RunReport, RunStatus, WriteReporter};
use crate::sched::BoundingPolicy;
use crate::state::{StateKind, StateSnapshot};

/// Fingerprint to predecessor fingerprint, `None` for roots. Fingerprints are
/// already pre-hashed, so identity hashing suffices.
type GeneratedMap = DashMap<u64, Option<u64>, BuildHasherDefault<NoHashHasher<u64>>>;

/// Configures and launches exploration runs over a compiled program.
///
/// ```ignore
/// let report = ExplorerBuilder::new(program)
///     .thread_count(4)
///     .stop_on_first_error(true)
///     .run_bfs();
/// ```
pub struct ExplorerBuilder<P> {
    program: P,
    thread_count: usize,
    algorithm: CanonicalAlgorithm,
    bounding: BoundingPolicy,
    execution_cutoff: Option<u32>,
    choice_cutoff: Option<u32>,
    iterative_execution: Option<(u32, u32)>,
    iterative_choice: Option<(u32, u32)>,
    spill_dir: Option<PathBuf>,
    memory_budget: Option<u64>,
    io_shards: usize,
    queue_capacity: usize,
    fingerprint_single_transition: bool,
    single_transition_probability: f64,
    compact_traces: bool,
    stop_on_first_error: bool,
    timeout: Option<Duration>,
    seed: u64,
    stack_limit: usize,
}

impl<P: CompiledProgram + Sync> ExplorerBuilder<P> {
    pub fn new(program: P) -> Self {
        Self {
            program,
            thread_count: num_cpus::get(),
            algorithm: CanonicalAlgorithm::Incremental,
            bounding: BoundingPolicy::None,
            execution_cutoff: None,
            choice_cutoff: None,
            iterative_execution: None,
            iterative_choice: None,
            spill_dir: None,
            memory_budget: None,
            io_shards: 4,
            queue_capacity: 1024,
            fingerprint_single_transition: true,
            single_transition_probability: 0.0,
            compact_traces: true,
            stop_on_first_error: false,
            timeout: None,
            seed: 0,
            stack_limit: 100_000,
        }
    }

    /// Sets the degree of parallelism. Defaults to the number of CPUs.
    pub fn thread_count(mut self, thread_count: usize) -> Self {
        self.thread_count = thread_count;
        self
    }

    pub fn algorithm(mut self, algorithm: CanonicalAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn bounding(mut self, bounding: BoundingPolicy) -> Self {
        self.bounding = bounding;
        self
    }

    /// Final execution-cost cutoff; states at or past it are not expanded.
    pub fn execution_cutoff(mut self, cutoff: u32) -> Self {
        self.execution_cutoff = Some(cutoff);
        self
    }

    /// Final choice-cost cutoff, applied when states enter the frontier.
    pub fn choice_cutoff(mut self, cutoff: u32) -> Self {
        self.choice_cutoff = Some(cutoff);
        self
    }

    /// Iterative deepening of the execution cutoff: start bounded at `start`
    /// and raise the bound by `step` after every search that pruned
    /// something, until the space closes or the final cutoff is reached.
    pub fn iterative_execution_cutoff(mut self, start: u32, step: u32) -> Self {
        self.iterative_execution = Some((start, step));
        self
    }

    /// Iterative deepening of the choice cutoff.
    pub fn iterative_choice_cutoff(mut self, start: u32, step: u32) -> Self {
        self.iterative_choice = Some((start, step));
        self
    }

    /// Directory for frontier disk spillover.
    pub fn spill_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.spill_dir = Some(dir.into());
        self
    }

    /// Approximate bytes a pending frontier layer may hold before spilling.
    pub fn memory_budget(mut self, bytes: u64) -> Self {
        self.memory_budget = Some(bytes);
        self
    }

    pub fn io_shards(mut self, shards: usize) -> Self {
        self.io_shards = shards;
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Whether states with exactly one outgoing transition are fingerprinted.
    /// When disabled they stay with the discovering worker and never enter
    /// the dedup table or the frontier.
    pub fn fingerprint_single_transition(mut self, enabled: bool) -> Self {
        self.fingerprint_single_transition = enabled;
        self
    }

    /// When single-transition fingerprinting is disabled, still fingerprint
    /// such states with this probability.
    pub fn single_transition_probability(mut self, probability: f64) -> Self {
        self.single_transition_probability = probability;
        self
    }

    /// Whether frontier records elide steps from single-transition states.
    pub fn compact_traces(mut self, enabled: bool) -> Self {
        self.compact_traces = enabled;
        self
    }

    pub fn stop_on_first_error(mut self, enabled: bool) -> Self {
        self.stop_on_first_error = enabled;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Depth cutoff for each worker's intra-layer search stack.
    pub fn stack_limit(mut self, limit: usize) -> Self {
        self.stack_limit = limit;
        self
    }

    fn policy(&self) -> NodePolicy {
        NodePolicy {
            bounding: self.bounding,
            fingerprint_single_transition: self.fingerprint_single_transition,
            single_transition_probability: self.single_transition_probability,
        }
    }

    fn invalid(&self) -> Option<&'static str> {
        if self.thread_count == 0 {
            return Some("thread count must be nonzero");
        }
        if !(0.0..=1.0).contains(&self.single_transition_probability) {
            return Some("single-transition probability must be within 0..=1");
        }
        if self.stack_limit == 0 {
            return Some("stack limit must be nonzero");
        }
        if matches!(self.iterative_execution, Some((_, 0)))
            || matches!(self.iterative_choice, Some((_, 0)))
        {
            return Some("iterative cutoff step must be nonzero");
        }
        None
    }

    fn rejected(problem: &'static str, started: Instant) -> RunReport {
        log::warn!("rejecting run: {}", problem);
        RunReport {
            status: RunStatus::InvalidParameters,
            states_generated: 0,
            layers: 0,
            discoveries: Vec::new(),
            elapsed: started.elapsed(),
        }
    }

    /// Explores every reachable state breadth-first, one frontier layer per
    /// execution step. Workers rebuild each frontier record by replaying its
    /// trace from a fresh initial state, expand it, and feed newly discovered
    /// states into the next layer.
    pub fn run_bfs(self) -> RunReport {
        self.run_bfs_reporting(&mut ())
    }

    /// Like [`ExplorerBuilder::run_bfs`], delivering a progress snapshot to
    /// `reporter` after every completed layer. With iterative cutoffs
    /// configured, bounded searches repeat at rising cutoffs until the state
    /// space closes or the final cutoffs are reached.
    pub fn run_bfs_reporting(self, reporter: &mut (dyn Reporter + Send)) -> RunReport {
        let started = Instant::now();
        if let Some(problem) = self.invalid() {
            return Self::rejected(problem, started);
        }
        let deadline = self.timeout.map(|t| started + t);
        let reporter = Mutex::new(reporter);

        let mut execution_cutoff =
            Self::starting_cutoff(self.iterative_execution, self.execution_cutoff);
        let mut choice_cutoff = Self::starting_cutoff(self.iterative_choice, self.choice_cutoff);
        loop {
            let (mut report, cutoff_hit) =
                self.bfs_iteration(execution_cutoff, choice_cutoff, started, deadline, &reporter);
            report.elapsed = started.elapsed();

            let mut deepen = false;
            if report.status == RunStatus::Success && cutoff_hit {
                let raised_execution = Self::raise_cutoff(
                    &mut execution_cutoff,
                    self.iterative_execution,
                    self.execution_cutoff,
                );
                let raised_choice = Self::raise_cutoff(
                    &mut choice_cutoff,
                    self.iterative_choice,
                    self.choice_cutoff,
                );
                deepen = raised_execution || raised_choice;
            }
            if !deepen {
                reporter.lock().report_progress(ReportData {
                    states_generated: report.states_generated,
                    layers: report.layers,
                    layer_size: 0,
                    elapsed: report.elapsed,
                    done: true,
                });
                return report;
            }
            log::debug!(
                "deepening cutoffs: execution={:?}, choice={:?}",
                execution_cutoff,
                choice_cutoff
            );
        }
    }

    fn starting_cutoff(iterative: Option<(u32, u32)>, final_cutoff: Option<u32>) -> Option<u32> {
        match (iterative, final_cutoff) {
            (Some((start, _)), Some(fin)) => Some(start.min(fin)),
            (Some((start, _)), None) => Some(start),
            (None, fin) => fin,
        }
    }

    /// Raises an iterative cutoff by its step, capped at the final cutoff.
    /// False when there is nothing left to raise.
    fn raise_cutoff(
        current: &mut Option<u32>,
        iterative: Option<(u32, u32)>,
        final_cutoff: Option<u32>,
    ) -> bool {
        let Some((_, step)) = iterative else {
            return false;
        };
        let Some(cur) = *current else {
            return false;
        };
        let mut next = cur.saturating_add(step);
        if let Some(fin) = final_cutoff {
            next = next.min(fin);
        }
        if next == cur {
            return false;
        }
        *current = Some(next);
        true
    }

    /// One full breadth-first search under the given cutoffs. The second
    /// return value reports whether any successor was pruned by a cutoff.
    fn bfs_iteration(
        &self,
        execution_cutoff: Option<u32>,
        choice_cutoff: Option<u32>,
        started: Instant,
        deadline: Option<Instant>,
        reporter: &Mutex<&mut (dyn Reporter + Send)>,
    ) -> (RunReport, bool) {
        let policy = self.policy();
        let with_scheduler = !matches!(self.bounding, BoundingPolicy::None);
        let thread_count = self.thread_count;

        let generated = GeneratedMap::default();
        let discoveries: DashMap<u64, Discovery> = DashMap::new();
        let frontier = RwLock::new(FrontierSet::new(FrontierConfig {
            with_scheduler,
            choice_cutoff,
            spill_dir: self.spill_dir.clone(),
            memory_budget: self.memory_budget,
            shards: self.io_shards,
            queue_capacity: self.queue_capacity,
        }));
        let io_failed = AtomicBool::new(false);

        // Seed the first layer with the root state.
        {
            let mut ctx = WorkerContext::new(self.algorithm, self.seed);
            let root =
                TraversalNode::root(StateSnapshot::initial(&self.program), &policy, &mut ctx);
            let fp = root.fingerprint().expect("roots are always fingerprinted");
            generated.insert(fp.to_u64(), None);
            match root.kind() {
                StateKind::Error(fault) => {
                    discoveries.insert(
                        fp.to_u64(),
                        Discovery {
                            fault: fault.clone(),
                            trace: Vec::new(),
                            fingerprint: Some(fp),
                        },
                    );
                }
                StateKind::FailedAssumption | StateKind::NormalTermination => {}
                _ => {
                    frontier.read().add(
                        fp.to_u64(),
                        FrontierRecord::from_node(&root, self.compact_traces, with_scheduler),
                    );
                }
            }
        }
        let seeded = match frontier.write().advance() {
            Ok(count) => count,
            Err(e) => {
                log::warn!("frontier i/o failure: {}", e);
                io_failed.store(true, Ordering::Relaxed);
                0
            }
        };

        let stop = AtomicBool::new(false);
        let canceled = AtomicBool::new(false);
        let done = AtomicBool::new(false);
        let cutoff_hit = AtomicBool::new(false);
        let layers = AtomicU32::new(if seeded > 0 { 1 } else { 0 });
        let barrier = Barrier::new(thread_count);
        if seeded > 0 {
            reporter.lock().report_progress(ReportData {
                states_generated: generated.len() as u64,
                layers: 1,
                layer_size: seeded,
                elapsed: started.elapsed(),
                done: false,
            });
        }

        let shared = BfsShared {
            program: &self.program,
            policy: &policy,
            frontier: &frontier,
            generated: &generated,
            discoveries: &discoveries,
            stop: &stop,
            execution_cutoff,
            choice_cutoff,
            cutoff_hit: &cutoff_hit,
            compact_traces: self.compact_traces,
            with_scheduler,
            stack_limit: self.stack_limit,
            stop_on_first_error: self.stop_on_first_error,
        };

        if seeded > 0 {
            crossbeam_utils::thread::scope(|scope| {
                for t in 0..thread_count {
                    let shared = &shared;
                    let barrier = &barrier;
                    let done = &done;
                    let layers = &layers;
                    let canceled = &canceled;
                    let io_failed = &io_failed;
                    let algorithm = self.algorithm;
                    let seed = self.seed;
                    scope
                        .builder()
                        .name(format!("explorer-{}", t))
                        .spawn(move |_| {
                            log::debug!("{}: worker started", t);
                            let mut ctx = WorkerContext::new(algorithm, seed ^ (t as u64 + 1));
                            loop {
                                while let Some(record) = shared.frontier.read().pop() {
                                    if let Some(deadline) = deadline {
                                        if Instant::now() >= deadline
                                            && !shared.stop.load(Ordering::Relaxed)
                                        {
                                            log::debug!("{}: timeout reached, canceling", t);
                                            canceled.store(true, Ordering::Relaxed);
                                            shared.stop.store(true, Ordering::Relaxed);
                                            shared.frontier.read().cancel();
                                        }
                                    }
                                    if shared.stop.load(Ordering::Relaxed) {
                                        continue; // drain the layer
                                    }
                                    shared.explore_record(record, &mut ctx);
                                }
                                if barrier.wait().is_leader() {
                                    let count = if shared.stop.load(Ordering::Relaxed) {
                                        0
                                    } else {
                                        match shared.frontier.write().advance() {
                                            Ok(count) => count,
                                            Err(e) => {
                                                log::warn!("frontier i/o failure: {}", e);
                                                io_failed.store(true, Ordering::Relaxed);
                                                0
                                            }
                                        }
                                    };
                                    if count > 0 {
                                        log::trace!("layer advanced: {} records", count);
                                        layers.fetch_add(1, Ordering::Relaxed);
                                        reporter.lock().report_progress(ReportData {
                                            states_generated: shared.generated.len() as u64,
                                            layers: layers.load(Ordering::Relaxed),
                                            layer_size: count,
                                            elapsed: started.elapsed(),
                                            done: false,
                                        });
                                    }
                                    done.store(count == 0, Ordering::SeqCst);
                                }
                                barrier.wait();
                                if done.load(Ordering::SeqCst) {
                                    log::debug!(
                                        "{}: no more work, shutting down. gen={}",
                                        t,
                                        shared.generated.len()
                                    );
                                    return;
                                }
                            }
                        })
                        .expect("failed to spawn a worker");
                }
            })
            .expect("a worker panicked");
        }

        let mut found: Vec<Discovery> = discoveries.into_iter().map(|(_, d)| d).collect();
        found.sort_by_key(|d| d.trace.len());
        let status = Self::overall_status(
            &found,
            canceled.load(Ordering::Relaxed),
            io_failed.load(Ordering::Relaxed),
        );
        (
            RunReport {
                status,
                states_generated: generated.len() as u64,
                layers: layers.load(Ordering::Relaxed),
                discoveries: found,
                elapsed: started.elapsed(),
            },
            cutoff_hit.load(Ordering::Relaxed),
        )
    }

    /// Runs `trials` random walks per worker from the initial state, taking
    /// uniformly random transitions up to the execution cutoff. Much cheaper
    /// than exhaustive search and no undo machinery, but finds defects only
    /// by luck.
    pub fn run_walk(self, trials: usize) -> RunReport {
        let started = Instant::now();
        if let Some(problem) = self.invalid() {
            return Self::rejected(problem, started);
        }
        let limit = self.execution_cutoff.unwrap_or(10_000) as usize;
        let discoveries: DashMap<u64, Discovery> = DashMap::new();
        let transitions = AtomicU64::new(0);
        let stop = AtomicBool::new(false);
        let canceled = AtomicBool::new(false);
        let deadline = self.timeout.map(|t| started + t);

        crossbeam_utils::thread::scope(|scope| {
            for t in 0..self.thread_count {
                let program = &self.program;
                let discoveries = &discoveries;
                let transitions = &transitions;
                let stop = &stop;
                let canceled = &canceled;
                let stop_on_first_error = self.stop_on_first_error;
                // Distinct per-worker seeds so the walks wander different
                // parts of the space.
                let mut rng = SmallRng::seed_from_u64(self.seed.wrapping_add(t as u64));
                let mut ctx = WorkerContext::new(self.algorithm, self.seed ^ (t as u64 + 1));
                scope
                    .builder()
                    .name(format!("explorer-{}", t))
                    .spawn(move |_| {
                        for _ in 0..trials {
                            if stop.load(Ordering::Relaxed) {
                                return;
                            }
                            if let Some(deadline) = deadline {
                                if Instant::now() >= deadline {
                                    canceled.store(true, Ordering::Relaxed);
                                    stop.store(true, Ordering::Relaxed);
                                    return;
                                }
                            }
                            walk_once(
                                program,
                                &mut rng,
                                &mut ctx,
                                limit,
                                transitions,
                                discoveries,
                                stop_on_first_error,
                                stop,
                            );
                        }
                    })
                    .expect("failed to spawn a worker");
            }
        })
        .expect("a worker panicked");

        let mut found: Vec<Discovery> = discoveries.into_iter().map(|(_, d)| d).collect();
        found.sort_by_key(|d| d.trace.len());
        let status = Self::overall_status(
            &found,
            canceled.load(Ordering::Relaxed),
            false,
        );
        RunReport {
            status,
            states_generated: transitions.load(Ordering::Relaxed),
            layers: 0,
            discoveries: found,
            elapsed: started.elapsed(),
        }
    }

    /// Runs the BFS driver, writing per-layer progress and the final result
    /// to `w`.
    pub fn check_and_report(self, w: &mut (impl Write + Send)) -> RunReport {
        let mut reporter = WriteReporter::new(w);
        let report = self.run_bfs_reporting(&mut reporter);
        report.report(&mut reporter);
        report
    }

    fn overall_status(found: &[Discovery], canceled: bool, io_failed: bool) -> RunStatus {
        if let Some(status) = found
            .iter()
            .map(|d| RunStatus::for_fault(&d.fault))
            .max_by_key(|s| s.severity())
        {
            status
        } else if canceled {
            RunStatus::Canceled
        } else if io_failed {
            RunStatus::CheckerError
        } else {
            RunStatus::Success
        }
    }
}

/// Everything the BFS workers share by reference.
struct BfsShared<'a, P> {
    program: &'a P,
    policy: &'a NodePolicy,
    frontier: &'a RwLock<FrontierSet>,
    generated: &'a GeneratedMap,
    discoveries: &'a DashMap<u64, Discovery>,
    stop: &'a AtomicBool,
    execution_cutoff: Option<u32>,
    choice_cutoff: Option<u32>,
    cutoff_hit: &'a AtomicBool,
    compact_traces: bool,
    with_scheduler: bool,
    stack_limit: usize,
    stop_on_first_error: bool,
}

impl<'a, P: CompiledProgram> BfsShared<'a, P> {
    /// Rebuilds a frontier record from the root and expands it. Choice
    /// successors and unfingerprinted single-transition states are explored
    /// within this worker; fingerprinted execution successors go to the next
    /// layer.
    fn explore_record(&self, record: FrontierRecord, ctx: &mut WorkerContext) {
        let state = StateSnapshot::initial(self.program);
        let node =
            TraversalNode::replay_trace(state, &record.trace, self.compact_traces, self.policy, ctx);
        if self.with_scheduler && !record.sched_blob.is_empty() {
            if let Err(e) = node.restore_scheduler(&record.sched_blob) {
                self.record_discovery(
                    node.fingerprint().map_or(0, |f| f.to_u64()),
                    Fault::Internal(format!("corrupt scheduler blob in frontier record: {}", e)),
                    node.trace(false),
                    node.fingerprint(),
                );
                self.stop.store(true, Ordering::Relaxed);
                return;
            }
        }
        // Replay recomputed execution and choice costs step by step (compact
        // replay may auto-advance past the recorded state); only the delay
        // spend has to come from the record.
        let mut bounds = node.bounds();
        bounds.delays = record.bounds.delays;
        node.set_bounds(bounds);

        // States reached only by compact auto-advance enter the dedup table
        // here rather than through successor handling.
        self.note_state(node.fingerprint().map(|f| f.to_u64()), None);

        if let StateKind::Error(fault) = node.kind() {
            let fp = node.fingerprint();
            self.record_discovery(
                fp.map_or(0, |f| f.to_u64()),
                fault.clone(),
                node.trace(false),
                fp,
            );
            return;
        }
        if node.is_terminal() {
            return;
        }

        let mut stack = vec![node];
        while let Some(n) = stack.pop() {
            if self.stop.load(Ordering::Relaxed) {
                return;
            }
            if stack.len() >= self.stack_limit {
                self.record_discovery(
                    n.fingerprint().map_or(0, |f| f.to_u64()),
                    Fault::DfsStackOverflow,
                    n.trace(false),
                    n.fingerprint(),
                );
                self.stop.store(true, Ordering::Relaxed);
                return;
            }
            let pred = n.fingerprint().map(|f| f.to_u64());
            while let Some(s) = n.next_successor(self.policy, ctx) {
                self.handle_successor(s, pred, &mut stack);
                if self.stop.load(Ordering::Relaxed) {
                    return;
                }
            }
        }
    }

    fn handle_successor(
        &self,
        s: Rc<TraversalNode>,
        pred: Option<u64>,
        stack: &mut Vec<Rc<TraversalNode>>,
    ) {
        let fp = s.fingerprint().map(|f| f.to_u64());
        match s.kind() {
            StateKind::Error(fault) => {
                let fault = fault.clone();
                self.note_state(fp, pred);
                self.record_discovery(fp.unwrap_or(0), fault, s.trace(false), s.fingerprint());
            }
            StateKind::FailedAssumption => {}
            StateKind::NormalTermination => {
                self.note_state(fp, pred);
            }
            StateKind::Choice { .. } => {
                if self
                    .choice_cutoff
                    .is_some_and(|cutoff| s.bounds().choice > cutoff)
                {
                    self.cutoff_hit.store(true, Ordering::Relaxed);
                    return;
                }
                if self.note_state(fp, pred) {
                    stack.push(s);
                }
            }
            StateKind::Execution => {
                let fresh = self.note_state(fp, pred);
                if self
                    .execution_cutoff
                    .is_some_and(|cutoff| s.bounds().execution >= cutoff)
                {
                    self.cutoff_hit.store(true, Ordering::Relaxed);
                    return;
                }
                match fp {
                    // Unfingerprinted single-transition states never enter
                    // the frontier; this worker carries them forward.
                    None => stack.push(s),
                    Some(fp) => {
                        if fresh {
                            self.frontier.read().add(
                                fp,
                                FrontierRecord::from_node(
                                    &s,
                                    self.compact_traces,
                                    self.with_scheduler,
                                ),
                            );
                        }
                    }
                }
            }
        }
    }

    /// Inserts a fingerprint into the dedup table; true when first seen.
    /// Unfingerprinted states always count as fresh.
    fn note_state(&self, fp: Option<u64>, pred: Option<u64>) -> bool {
        let Some(fp) = fp else { return true };
        match self.generated.entry(fp) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(pred);
                true
            }
        }
    }

    fn record_discovery(
        &self,
        key: u64,
        fault: Fault,
        trace: Vec<TraceStep>,
        fingerprint: Option<Fingerprint>,
    ) {
        self.discoveries.entry(key).or_insert_with(|| {
            log::debug!("discovered defect: {}", fault);
            Discovery {
                fault,
                trace,
                fingerprint,
            }
        });
        if self.stop_on_first_error {
            self.stop.store(true, Ordering::Relaxed);
            self.frontier.read().cancel();
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn walk_once<P: CompiledProgram>(
    program: &P,
    rng: &mut SmallRng,
    ctx: &mut WorkerContext,
    limit: usize,
    transitions: &AtomicU64,
    discoveries: &DashMap<u64, Discovery>,
    stop_on_first_error: bool,
    stop: &AtomicBool,
) {
    let mut state = StateSnapshot::initial(program);
    let mut trace: Vec<TraceStep> = Vec::new();
    let mut steps = 0;
    loop {
        match state.classify() {
            StateKind::Error(fault) => {
                let fp = ctx.fingerprint(&mut state);
                discoveries.entry(fp.to_u64()).or_insert_with(|| Discovery {
                    fault,
                    trace: trace.clone(),
                    fingerprint: Some(fp),
                });
                if stop_on_first_error {
                    stop.store(true, Ordering::Relaxed);
                }
                return;
            }
            StateKind::FailedAssumption | StateKind::NormalTermination => return,
            StateKind::Execution => {
                if steps == limit {
                    return;
                }
                steps += 1;
                let runnable = state.runnable_processes();
                let pid = runnable[rng.gen_range(0..runnable.len())];
                trace.push(TraceStep {
                    choice: false,
                    index: pid as u32,
                });
                state.run_process(pid);
                transitions.fetch_add(1, Ordering::Relaxed);
            }
            StateKind::Choice { count } => {
                if steps == limit {
                    return;
                }
                steps += 1;
                let n = rng.gen_range(0..count);
                trace.push(TraceStep {
                    choice: true,
                    index: n as u32,
                });
                state.run_choice(n);
                transitions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_util::counter;

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn exploration_is_complete_and_deterministic_across_thread_counts() {
        init_logging();
        let single = ExplorerBuilder::new(counter::two_increments())
            .thread_count(1)
            .run_bfs();
        let multi = ExplorerBuilder::new(counter::two_increments())
            .thread_count(2)
            .run_bfs();
        assert_eq!(single.status, RunStatus::Success);
        assert!(single.discoveries.is_empty());
        assert_eq!(single.states_generated, multi.states_generated);
        assert!(single.states_generated >= 5);
        assert!(single.layers >= 3);
    }

    #[test]
    fn infinite_loop_is_a_runtime_error() {
        let report = ExplorerBuilder::new(counter::spinner())
            .thread_count(1)
            .run_bfs();
        assert_eq!(report.status, RunStatus::ProgramRuntimeError);
        assert_eq!(report.discoveries.len(), 1);
        assert_eq!(
            report.discoveries[0].trace,
            vec![TraceStep {
                choice: false,
                index: 0
            }]
        );
    }

    #[test]
    fn deadlock_is_reported() {
        let report = ExplorerBuilder::new(counter::forever_blocked())
            .thread_count(1)
            .run_bfs();
        assert_eq!(report.status, RunStatus::Deadlock);
        assert_eq!(report.discoveries.len(), 1);
    }

    #[test]
    fn valid_end_blocks_terminate_normally() {
        let report = ExplorerBuilder::new(counter::blocked_at_end_state())
            .thread_count(1)
            .run_bfs();
        assert_eq!(report.status, RunStatus::Success);
        assert_eq!(report.states_generated, 2);
    }

    #[test]
    fn nondeterministic_choices_are_enumerated() {
        let report = ExplorerBuilder::new(counter::chooser())
            .thread_count(1)
            .run_bfs();
        assert_eq!(report.status, RunStatus::Success);
        // Initial, the choice state, and three distinct outcomes.
        assert_eq!(report.states_generated, 5);
    }

    #[test]
    fn execution_cutoff_bounds_the_search() {
        let report = ExplorerBuilder::new(counter::two_increments())
            .thread_count(1)
            .execution_cutoff(1)
            .run_bfs();
        assert_eq!(report.status, RunStatus::Success);
        // The root and its two depth-one successors.
        assert_eq!(report.states_generated, 3);
        assert_eq!(report.layers, 1);
    }

    #[derive(Default)]
    struct RecordingReporter {
        progress: Vec<ReportData>,
        runs: usize,
    }

    impl Reporter for RecordingReporter {
        fn report_progress(&mut self, data: ReportData) {
            self.progress.push(data);
        }
        fn report_run(&mut self, _report: &RunReport) {
            self.runs += 1;
        }
    }

    #[test]
    fn progress_is_reported_per_layer() {
        let mut reporter = RecordingReporter::default();
        let report = ExplorerBuilder::new(counter::two_increments())
            .thread_count(1)
            .run_bfs_reporting(&mut reporter);
        assert_eq!(report.status, RunStatus::Success);
        // One snapshot per layer plus the closing one.
        assert!(reporter.progress.len() as u32 > report.layers);
        let last = reporter.progress.last().unwrap();
        assert!(last.done);
        assert_eq!(last.states_generated, report.states_generated);
        assert!(reporter
            .progress
            .iter()
            .rev()
            .skip(1)
            .all(|data| !data.done && data.layer_size > 0));
    }

    #[test]
    fn iterative_deepening_explores_the_full_space() {
        let full = ExplorerBuilder::new(counter::two_increments())
            .thread_count(1)
            .run_bfs();
        let deepened = ExplorerBuilder::new(counter::two_increments())
            .thread_count(1)
            .iterative_execution_cutoff(1, 1)
            .run_bfs();
        assert_eq!(deepened.status, RunStatus::Success);
        assert_eq!(deepened.states_generated, full.states_generated);
    }

    #[test]
    fn iterative_deepening_honors_the_final_cutoff() {
        let full = ExplorerBuilder::new(counter::two_increments())
            .thread_count(1)
            .run_bfs();
        let bounded = ExplorerBuilder::new(counter::two_increments())
            .thread_count(1)
            .iterative_execution_cutoff(1, 1)
            .execution_cutoff(2)
            .run_bfs();
        assert_eq!(bounded.status, RunStatus::Success);
        assert!(bounded.states_generated < full.states_generated);
    }

    #[test]
    fn zero_step_iterative_cutoffs_are_invalid() {
        let report = ExplorerBuilder::new(counter::two_increments())
            .thread_count(1)
            .iterative_execution_cutoff(1, 0)
            .run_bfs();
        assert_eq!(report.status, RunStatus::InvalidParameters);
    }

    #[test]
    fn delay_bounding_prunes_interleavings() {
        let full = ExplorerBuilder::new(counter::two_increments())
            .thread_count(1)
            .run_bfs();
        let bounded = ExplorerBuilder::new(counter::two_increments())
            .thread_count(1)
            .bounding(BoundingPolicy::Delay { budget: 0 })
            .run_bfs();
        assert_eq!(bounded.status, RunStatus::Success);
        assert!(bounded.states_generated < full.states_generated);
    }

    #[test]
    fn disk_spillover_preserves_completeness() {
        init_logging();
        let dir = tempfile::tempdir().unwrap();
        let in_memory = ExplorerBuilder::new(counter::two_increments())
            .thread_count(2)
            .run_bfs();
        let spilled = ExplorerBuilder::new(counter::two_increments())
            .thread_count(2)
            .spill_dir(dir.path())
            .memory_budget(0)
            .io_shards(2)
            .run_bfs();
        assert_eq!(spilled.status, RunStatus::Success);
        assert_eq!(spilled.states_generated, in_memory.states_generated);
    }

    #[test]
    fn zero_timeout_cancels_the_run() {
        let report = ExplorerBuilder::new(counter::two_increments())
            .thread_count(1)
            .timeout(Duration::ZERO)
            .run_bfs();
        assert_eq!(report.status, RunStatus::Canceled);
    }

    #[test]
    fn zero_threads_are_invalid_parameters() {
        let report = ExplorerBuilder::new(counter::two_increments())
            .thread_count(0)
            .run_bfs();
        assert_eq!(report.status, RunStatus::InvalidParameters);
    }

    #[test]
    fn random_walk_finds_the_spin_fault() {
        let report = ExplorerBuilder::new(counter::spinner())
            .thread_count(1)
            .run_walk(3);
        assert_eq!(report.status, RunStatus::ProgramRuntimeError);
        assert_eq!(report.discoveries.len(), 1);
    }

    #[test]
    fn check_and_report_writes_a_summary() {
        let mut out = Vec::new();
        let report = ExplorerBuilder::new(counter::atomic_increments())
            .thread_count(1)
            .check_and_report(&mut out);
        assert_eq!(report.status, RunStatus::Success);
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("Exploring."));
        assert!(text.contains("Result: success."));
    }
}
