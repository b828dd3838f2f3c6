//! Private module for selective re-export.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use ahash::AHashSet;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::canonical::{CanonicalAlgorithm, HeapCanonicalizer};
use crate::fingerprint::Fingerprint;
use crate::sched::{BoundingPolicy, Scheduler, SearchBounds};
use crate::state::{Receipt, StateKind, StateSnapshot};

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

fn next_serial() -> u64 {
    NEXT_SERIAL.fetch_add(1, Ordering::Relaxed)
}

/// Per-worker scratch shared by every node of that worker's traversal: the
/// canonicalizer, the serialization buffer, and the RNG consulted when
/// fingerprinting of single-transition states is probabilistic.
pub struct WorkerContext {
    pub canon: HeapCanonicalizer,
    buf: Vec<u8>,
    rng: SmallRng,
}

impl WorkerContext {
    pub fn new(algorithm: CanonicalAlgorithm, seed: u64) -> Self {
        Self {
            canon: HeapCanonicalizer::new(algorithm),
            buf: Vec::new(),
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    pub(crate) fn fingerprint(&mut self, state: &mut StateSnapshot) -> Fingerprint {
        self.canon.state_fingerprint(state, &mut self.buf)
    }

    fn coin(&mut self, probability: f64) -> bool {
        probability > 0.0 && self.rng.gen::<f64>() < probability
    }
}

/// Successor-enumeration policy shared by every node of a traversal.
#[derive(Clone, Debug)]
pub struct NodePolicy {
    pub bounding: BoundingPolicy,
    /// Fingerprint states with exactly one outgoing transition. Skipping them
    /// trades table space against re-exploration of linear runs.
    pub fingerprint_single_transition: bool,
    /// When the flag above is off, still fingerprint such states with this
    /// probability.
    pub single_transition_probability: f64,
}

impl Default for NodePolicy {
    fn default() -> Self {
        Self {
            bounding: BoundingPolicy::None,
            fingerprint_single_transition: true,
            single_transition_probability: 0.0,
        }
    }
}

/// The transition that produced a node from its predecessor.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Via {
    /// Executed one atomic step of this process.
    Execute(usize),
    /// Resolved the pending choice with this alternative.
    Choose(usize),
}

impl Via {
    fn to_step(self) -> TraceStep {
        match self {
            Via::Execute(pid) => TraceStep {
                choice: false,
                index: pid as u32,
            },
            Via::Choose(n) => TraceStep {
                choice: true,
                index: n as u32,
            },
        }
    }
}

/// One step of a trace, packable into a `u32` with the selection index in the
/// high bits and the choice flag in the low bit.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TraceStep {
    pub choice: bool,
    pub index: u32,
}

impl TraceStep {
    pub fn pack(self) -> u32 {
        (self.index << 1) | self.choice as u32
    }

    pub fn unpack(word: u32) -> Self {
        Self {
            choice: word & 1 == 1,
            index: word >> 1,
        }
    }

    fn to_via(self) -> Via {
        if self.choice {
            Via::Choose(self.index as usize)
        } else {
            Via::Execute(self.index as usize)
        }
    }
}

/// Where successor enumeration stands for one node.
enum Cursor {
    /// Next position in the runnable list (no bounding).
    Index(usize),
    /// Scheduler-driven enumeration under delay or preemption bounding.
    Sched {
        working: Box<dyn Scheduler>,
        tried: AHashSet<usize>,
        preferred: Option<usize>,
        delays: u32,
    },
    /// Next alternative of a pending choice.
    Choice(usize),
    Done,
}

struct Enumeration {
    /// Handle into the shared machine's undo history. Valid only while this
    /// node is in favor; `reclaim` re-establishes it otherwise.
    receipt: Receipt,
    /// Serial of the child whose receipt currently sits above ours on the
    /// undo history, if any.
    successor: Option<u64>,
    cursor: Cursor,
}

/// A node of the traversal tree. All nodes of one traversal share a single
/// [`StateSnapshot`]; at any moment the machine is configured for exactly one
/// path, and every node off that path holds only its predecessor link and the
/// transition that produced it. Touching an off-path (orphaned) node replays
/// it from its nearest still-valid ancestor.
pub struct TraversalNode {
    serial: u64,
    pred: Option<Rc<TraversalNode>>,
    via: Option<Via>,
    kind: StateKind,
    runnable: Vec<usize>,
    fingerprint: Option<Fingerprint>,
    bounds: Cell<SearchBounds>,
    sched: RefCell<Box<dyn Scheduler>>,
    machine: Rc<RefCell<StateSnapshot>>,
    inner: RefCell<Enumeration>,
}

impl TraversalNode {
    pub fn root(
        mut state: StateSnapshot,
        policy: &NodePolicy,
        ctx: &mut WorkerContext,
    ) -> Rc<Self> {
        let kind = state.classify();
        let runnable = state.runnable_processes();
        let fingerprint = Some(ctx.fingerprint(&mut state));
        let receipt = state.check_in();
        let sched = policy.bounding.make_scheduler();
        let cursor = Self::cursor_for(&kind, &policy.bounding, &sched);
        Rc::new(Self {
            serial: next_serial(),
            pred: None,
            via: None,
            kind,
            runnable,
            fingerprint,
            bounds: Cell::new(SearchBounds::default()),
            sched: RefCell::new(sched),
            machine: Rc::new(RefCell::new(state)),
            inner: RefCell::new(Enumeration {
                receipt,
                successor: None,
                cursor,
            }),
        })
    }

    fn cursor_for(
        kind: &StateKind,
        bounding: &BoundingPolicy,
        sched: &Box<dyn Scheduler>,
    ) -> Cursor {
        match kind {
            StateKind::Choice { .. } => Cursor::Choice(0),
            StateKind::Execution => match bounding {
                BoundingPolicy::None => Cursor::Index(0),
                _ => Cursor::Sched {
                    working: sched.clone(),
                    tried: AHashSet::new(),
                    preferred: None,
                    delays: 0,
                },
            },
            _ => Cursor::Done,
        }
    }

    pub fn kind(&self) -> &StateKind {
        &self.kind
    }

    pub fn fingerprint(&self) -> Option<Fingerprint> {
        self.fingerprint
    }

    pub fn bounds(&self) -> SearchBounds {
        self.bounds.get()
    }

    /// Overwrites the search-cost accounting, used when a node resumes work
    /// recorded in a frontier record.
    pub fn set_bounds(&self, bounds: SearchBounds) {
        self.bounds.set(bounds);
    }

    pub fn scheduler_blob(&self) -> Vec<u8> {
        self.sched.borrow().save_blob()
    }

    pub fn restore_scheduler(&self, blob: &[u8]) -> Result<(), serde_json::Error> {
        self.sched.borrow_mut().restore_blob(blob)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            StateKind::Error(_) | StateKind::FailedAssumption | StateKind::NormalTermination
        )
    }

    /// Whether this node has exactly one outgoing transition.
    pub fn is_single_transition(&self) -> bool {
        match self.kind {
            StateKind::Execution => self.runnable.len() == 1,
            StateKind::Choice { count } => count == 1,
            _ => false,
        }
    }

    fn in_favor_of(&self, pred: &TraversalNode) -> bool {
        pred.inner.borrow().successor == Some(self.serial)
    }

    /// Re-establishes this node's receipt on the shared machine. Walks up to
    /// the deepest ancestor whose whole chain is still held by the undo
    /// history, rolls the machine back to it, and replays the recorded
    /// transitions down to this node. Iterative: orphan chains can be long.
    fn reclaim(self: &Rc<Self>) {
        let mut chain: Vec<Rc<TraversalNode>> = vec![Rc::clone(self)];
        while let Some(pred) = &chain.last().unwrap().pred {
            chain.push(Rc::clone(pred));
        }
        chain.reverse();

        // The root's receipt is the bottom history entry and never pops.
        let mut base = 0;
        for i in 1..chain.len() {
            if chain[i].in_favor_of(&chain[i - 1]) {
                base = i;
            } else {
                break;
            }
        }
        if base == chain.len() - 1 {
            return;
        }

        log::trace!(
            "reclaiming orphaned node: replaying {} transition(s)",
            chain.len() - 1 - base
        );
        let machine = Rc::clone(&self.machine);
        let mut state = machine.borrow_mut();
        state.rollback(chain[base].inner.borrow().receipt);
        for i in base + 1..chain.len() {
            let node = &chain[i];
            match node.via.expect("non-root node has a via") {
                Via::Execute(pid) => state.run_process(pid),
                Via::Choose(n) => state.run_choice(n),
            }
            node.inner.borrow_mut().receipt = state.check_in();
            chain[i - 1].inner.borrow_mut().successor = Some(node.serial);
        }
    }

    /// Runs `f` against the machine configured for this node.
    pub fn with_state<R>(self: &Rc<Self>, f: impl FnOnce(&StateSnapshot) -> R) -> R {
        self.reclaim();
        let machine = Rc::clone(&self.machine);
        let mut state = machine.borrow_mut();
        {
            let mut inner = self.inner.borrow_mut();
            state.rollback(inner.receipt);
            inner.successor = None;
        }
        f(&state)
    }

    /// Produces the next unexplored successor under the enumeration policy,
    /// or `None` once the node is exhausted. Calling this on an orphaned node
    /// first replays it.
    pub fn next_successor(
        self: &Rc<Self>,
        policy: &NodePolicy,
        ctx: &mut WorkerContext,
    ) -> Option<Rc<Self>> {
        if self.is_terminal() {
            return None;
        }
        self.reclaim();
        let (via, delay_cost, preempted) = {
            let machine = Rc::clone(&self.machine);
            let mut state = machine.borrow_mut();
            {
                let mut inner = self.inner.borrow_mut();
                state.rollback(inner.receipt);
                inner.successor = None;
            }
            self.pick_via(&state)?
        };
        Some(self.apply_via(via, delay_cost, preempted, policy, ctx))
    }

    fn pick_via(&self, state: &StateSnapshot) -> Option<(Via, u32, bool)> {
        let mut inner = self.inner.borrow_mut();
        let mut exhausted = false;
        let picked = match &mut inner.cursor {
            Cursor::Done => None,
            Cursor::Index(i) => {
                if *i < self.runnable.len() {
                    let pid = self.runnable[*i];
                    *i += 1;
                    Some((Via::Execute(pid), 0, false))
                } else {
                    exhausted = true;
                    None
                }
            }
            Cursor::Choice(i) => {
                let count = match self.kind {
                    StateKind::Choice { count } => count,
                    _ => 0,
                };
                if *i < count {
                    let n = *i;
                    *i += 1;
                    Some((Via::Choose(n), 0, false))
                } else {
                    exhausted = true;
                    None
                }
            }
            Cursor::Sched {
                working,
                tried,
                preferred,
                delays,
            } => loop {
                if tried.len() >= self.runnable.len() {
                    exhausted = true;
                    break None;
                }
                if !tried.is_empty() {
                    if working.max_delay_reached(state) {
                        exhausted = true;
                        break None;
                    }
                    working.delay(state);
                    *delays += 1;
                }
                let Some(pid) = working.next(state) else {
                    exhausted = true;
                    break None;
                };
                if !tried.insert(pid) {
                    continue;
                }
                let first = preferred.get_or_insert(pid);
                let preempted = *first != pid && state.is_runnable(*first);
                let cost = if tried.len() == 1 { 0 } else { *delays };
                break Some((Via::Execute(pid), cost, preempted));
            },
        };
        if exhausted {
            inner.cursor = Cursor::Done;
        }
        picked
    }

    /// Applies one transition to the machine (assumed configured for this
    /// node or reclaimable to it) and wraps the outcome in a child node.
    fn apply_via(
        self: &Rc<Self>,
        via: Via,
        delay_cost: u32,
        preempted: bool,
        policy: &NodePolicy,
        ctx: &mut WorkerContext,
    ) -> Rc<Self> {
        self.reclaim();
        let machine = Rc::clone(&self.machine);
        let mut state = machine.borrow_mut();
        {
            let mut inner = self.inner.borrow_mut();
            state.rollback(inner.receipt);
            inner.successor = None;
        }

        let mut sched = self.sched.borrow().clone();
        match via {
            Via::Execute(pid) => {
                sched.start(&state, pid);
                state.run_process_with(pid, &mut *sched);
                sched.finish(&state, pid);
            }
            Via::Choose(n) => state.run_choice_with(n, &mut *sched),
        }

        let kind = state.classify();
        let runnable = state.runnable_processes();
        let mut bounds = self.bounds.get();
        match via {
            Via::Execute(_) => bounds.execution += 1,
            Via::Choose(_) => bounds.choice += 1,
        }
        bounds.delays += delay_cost;
        bounds.preemptions += preempted as u32;

        let single = match kind {
            StateKind::Execution => runnable.len() == 1,
            StateKind::Choice { count } => count == 1,
            _ => false,
        };
        let fingerprint = if !single
            || policy.fingerprint_single_transition
            || ctx.coin(policy.single_transition_probability)
        {
            Some(ctx.fingerprint(&mut state))
        } else {
            None
        };
        let receipt = state.check_in();
        drop(state);

        let cursor = Self::cursor_for(&kind, &policy.bounding, &sched);
        let child = Rc::new(Self {
            serial: next_serial(),
            pred: Some(Rc::clone(self)),
            via: Some(via),
            kind,
            runnable,
            fingerprint,
            bounds: Cell::new(bounds),
            sched: RefCell::new(sched),
            machine,
            inner: RefCell::new(Enumeration {
                receipt,
                successor: None,
                cursor,
            }),
        });
        self.inner.borrow_mut().successor = Some(child.serial);
        child
    }

    /// The transitions from the root to this node. A compact trace elides
    /// steps taken from single-transition states; replay re-inserts them by
    /// auto-advancing such states.
    pub fn trace(&self, compact: bool) -> Vec<TraceStep> {
        let mut steps = Vec::new();
        let mut node = self;
        while let (Some(via), Some(pred)) = (node.via, &node.pred) {
            if !compact || !pred.is_single_transition() {
                steps.push(via.to_step());
            }
            node = pred;
        }
        steps.reverse();
        steps
    }

    /// Reconstructs the node a trace leads to, starting from a fresh initial
    /// state. With `compact`, single-transition states are auto-advanced
    /// before each recorded step and after the last one.
    pub fn replay_trace(
        state: StateSnapshot,
        steps: &[TraceStep],
        compact: bool,
        policy: &NodePolicy,
        ctx: &mut WorkerContext,
    ) -> Rc<Self> {
        let mut node = Self::root(state, policy, ctx);
        for step in steps {
            if compact {
                node = Self::advance_singles(node, policy, ctx);
            }
            node = node.apply_via(step.to_via(), 0, false, policy, ctx);
        }
        if compact {
            node = Self::advance_singles(node, policy, ctx);
        }
        node
    }

    fn advance_singles(
        mut node: Rc<Self>,
        policy: &NodePolicy,
        ctx: &mut WorkerContext,
    ) -> Rc<Self> {
        while node.is_single_transition() {
            let via = match node.kind {
                StateKind::Execution => Via::Execute(node.runnable[0]),
                StateKind::Choice { .. } => Via::Choose(0),
                _ => unreachable!("single-transition implies execution or choice"),
            };
            node = node.apply_via(via, 0, false, policy, ctx);
        }
        node
    }
}
