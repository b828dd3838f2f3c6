//! Private module for selective re-export.

use crate::heap::{Heap, HeapLog, Pointer};
use crate::program::{
    BlockResult, CompiledProgram, Fault, GlobalsRecord, HeapElement, MethodCode,
};
use crate::sched::Scheduler;
use crate::store::UndoableStore;
use std::sync::Arc;

/// Upper bound on basic blocks executed within one atomic step. Exceeding it
/// means the modeled program has a runaway atomic region.
pub(crate) const MAX_ATOMIC_BLOCKS: usize = 100_000;

/// An opaque checkpoint token. Monotonically increasing within one snapshot;
/// valid until its history entry is rolled past.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct Receipt(u64);

/// How a snapshot is classified for the traversal state machine. Checks are
/// ordered cheapest first.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StateKind {
    /// A fault is attached; terminal for this path.
    Error(Fault),
    /// A pruning condition failed; silently terminal for this path.
    FailedAssumption,
    /// A nondeterministic choice over `count` alternatives is pending.
    Choice { count: usize },
    /// At least one process is runnable.
    Execution,
    /// Nothing runnable, nothing pending, every blocked process in a valid
    /// end state.
    NormalTermination,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProcessStatus {
    Runnable,
    Blocked,
    Completed,
}

/// The resumable data of one method activation: the program counter and the
/// compiled locals/inputs/outputs record.
#[derive(Clone, Debug)]
pub struct FrameData {
    pub block: u32,
    pub locals: Box<dyn crate::program::LocalsRecord>,
}

impl FrameData {
    /// Downcast helper for generated code.
    pub fn locals<T: 'static>(&self) -> &T {
        self.locals
            .as_any()
            .downcast_ref()
            .expect("locals record of the wrong concrete type")
    }

    pub fn locals_mut<T: 'static>(&mut self) -> &mut T {
        self.locals
            .as_any_mut()
            .downcast_mut()
            .expect("locals record of the wrong concrete type")
    }
}

/// One stack frame: method code plus its undo-logged activation data.
#[derive(Debug)]
pub struct Frame {
    pub(crate) code: Arc<dyn MethodCode>,
    pub(crate) store: UndoableStore<FrameData>,
}

impl Frame {
    pub fn new(code: Arc<dyn MethodCode>, locals: Box<dyn crate::program::LocalsRecord>) -> Self {
        Self {
            code,
            store: UndoableStore::new(FrameData { block: 0, locals }),
        }
    }

    pub(crate) fn block(&self) -> u32 {
        self.store.get().block
    }

    pub(crate) fn data(&self) -> &FrameData {
        self.store.get()
    }

    fn fork(&self) -> Frame {
        Frame {
            code: Arc::clone(&self.code),
            store: self.store.fork(),
        }
    }

    /// A clean copy holding the frame's value as of the last checkpoint.
    fn checkpoint_copy(&self) -> Frame {
        Frame {
            code: Arc::clone(&self.code),
            store: UndoableStore::new(self.store.checkpoint_value().clone()),
        }
    }
}

/// Undo record for one process over one checkpoint interval.
#[derive(Debug)]
struct ProcessUndo {
    status: Option<ProcessStatus>,
    /// Full stack as of the interval start, saved at the first push/pop.
    /// When present it supersedes the per-frame logs.
    stack: Option<Vec<Frame>>,
    /// Per-frame undo logs, one per frame alive at the interval end.
    frames: Vec<Option<FrameData>>,
}

#[derive(Debug)]
pub(crate) struct Process {
    pub status: ProcessStatus,
    pub frames: Vec<Frame>,

    saved_status: Option<ProcessStatus>,
    stack_shadow: Option<Vec<Frame>>,
}

impl Process {
    fn new(entry: Frame) -> Self {
        Self {
            status: ProcessStatus::Runnable,
            frames: vec![entry],
            saved_status: None,
            stack_shadow: None,
        }
    }

    fn set_status(&mut self, status: ProcessStatus) {
        if self.saved_status.is_none() {
            self.saved_status = Some(self.status);
        }
        self.status = status;
    }

    /// Saves the structural shadow before the first push/pop of an interval.
    fn before_stack_change(&mut self) {
        if self.stack_shadow.is_none() {
            self.stack_shadow = Some(self.frames.iter().map(Frame::checkpoint_copy).collect());
        }
    }

    fn check_in(&mut self) -> ProcessUndo {
        let stack = self.stack_shadow.take();
        let frames = if stack.is_some() {
            for frame in &mut self.frames {
                let _ = frame.store.check_in();
            }
            Vec::new()
        } else {
            self.frames.iter_mut().map(|f| f.store.check_in()).collect()
        };
        ProcessUndo {
            status: self.saved_status.take(),
            stack,
            frames,
        }
    }

    fn revert(&mut self) {
        if let Some(stack) = self.stack_shadow.take() {
            self.frames = stack;
        } else {
            for frame in &mut self.frames {
                frame.store.revert();
            }
        }
        if let Some(status) = self.saved_status.take() {
            self.status = status;
        }
    }

    fn apply_undo(&mut self, undo: ProcessUndo) {
        if let Some(status) = undo.status {
            self.status = status;
        }
        if let Some(stack) = undo.stack {
            self.frames = stack;
        } else {
            for (frame, log) in self.frames.iter_mut().zip(undo.frames) {
                if let Some(data) = log {
                    frame.store.restore(data);
                }
            }
        }
    }

    fn fork(&self) -> Process {
        Process {
            status: self.status,
            frames: self.frames.iter().map(Frame::fork).collect(),
            saved_status: None,
            stack_shadow: None,
        }
    }
}

/// A pending nondeterministic choice.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct PendingChoice {
    pub pid: usize,
    pub count: usize,
}

/// The cloneable scalar fields saved whole at every checkpoint.
#[derive(Clone, Debug)]
struct ScalarFrame {
    pending_choice: Option<PendingChoice>,
    process_count: usize,
    step_count: u64,
    heap_cursor: u32,
    fault: Option<Fault>,
    pruned: bool,
}

#[derive(Debug)]
struct HistoryEntry {
    receipt: Receipt,
    /// Scalar values as of this checkpoint.
    scalars: ScalarFrame,
    /// Undo logs for the interval that *ended* at this checkpoint.
    globals_log: Option<Box<dyn GlobalsRecord>>,
    process_logs: Vec<ProcessUndo>,
    heap_log: HeapLog,
}

/// One complete program state: process list, globals, heap, plus the
/// checkpoint history that makes it cheaply advance-and-retractable.
#[derive(Debug)]
pub struct StateSnapshot {
    pub(crate) processes: Vec<Process>,
    pub(crate) globals: UndoableStore<Box<dyn GlobalsRecord>>,
    pub(crate) heap: Heap,
    pending_choice: Option<PendingChoice>,
    step_count: u64,
    fault: Option<Fault>,
    pruned: bool,
    history: Vec<HistoryEntry>,
    receipt_nonce: u64,
}

impl StateSnapshot {
    /// Instantiates the initial state of a compiled program.
    pub fn initial(program: &dyn CompiledProgram) -> StateSnapshot {
        let mut state = StateSnapshot {
            processes: program.entry_points().into_iter().map(Process::new).collect(),
            globals: UndoableStore::new(program.globals()),
            heap: Heap::new(),
            pending_choice: None,
            step_count: 0,
            fault: None,
            pruned: false,
            history: Vec::new(),
            receipt_nonce: 0,
        };
        // A program can be stuck before its first transition.
        state.check_for_deadlock();
        state
    }

    pub fn process_count(&self) -> usize {
        self.processes.len()
    }

    pub fn step_count(&self) -> u64 {
        self.step_count
    }

    pub fn fault(&self) -> Option<&Fault> {
        self.fault.as_ref()
    }

    pub(crate) fn pruned(&self) -> bool {
        self.pruned
    }

    pub(crate) fn pending_choice(&self) -> Option<&PendingChoice> {
        self.pending_choice.as_ref()
    }

    /// Read access to the globals record, with a downcast helper shape
    /// matching [`FrameData::locals`].
    pub fn globals<T: 'static>(&self) -> &T {
        self.globals
            .get()
            .as_any()
            .downcast_ref()
            .expect("globals record of the wrong concrete type")
    }

    fn scalars_now(&self) -> ScalarFrame {
        ScalarFrame {
            pending_choice: self.pending_choice.clone(),
            process_count: self.processes.len(),
            step_count: self.step_count,
            heap_cursor: self.heap.cursor(),
            fault: self.fault.clone(),
            pruned: self.pruned,
        }
    }

    fn restore_scalars(&mut self, scalars: &ScalarFrame) {
        self.pending_choice = scalars.pending_choice.clone();
        self.processes.truncate(scalars.process_count);
        self.step_count = scalars.step_count;
        self.heap.set_cursor(scalars.heap_cursor);
        self.fault = scalars.fault.clone();
        self.pruned = scalars.pruned;
    }

    /// Pushes a history entry capturing the interval since the previous
    /// checkpoint and the scalar values as of now.
    pub fn check_in(&mut self) -> Receipt {
        self.receipt_nonce += 1;
        let receipt = Receipt(self.receipt_nonce);
        let entry = HistoryEntry {
            receipt,
            scalars: self.scalars_now(),
            globals_log: self.globals.check_in(),
            process_logs: self.processes.iter_mut().map(Process::check_in).collect(),
            heap_log: self.heap.check_in(),
        };
        self.history.push(entry);
        receipt
    }

    /// Discards all mutations since the last checkpoint.
    fn revert_pending(&mut self) {
        self.globals.revert();
        for process in &mut self.processes {
            process.revert();
        }
        self.heap.revert();
        if let Some(top) = self.history.last() {
            let scalars = top.scalars.clone();
            self.restore_scalars(&scalars);
        }
    }

    /// Rolls back to a prior checkpoint, possibly jumping across several
    /// intervening checkpoints in one pass. The target entry stays on the
    /// history stack, so the same receipt can be rolled back to repeatedly.
    ///
    /// Panics if the receipt was already rolled past.
    pub fn rollback(&mut self, receipt: Receipt) {
        self.revert_pending();
        let mut globals_logs = Vec::new();
        loop {
            match self.history.last() {
                None => panic!("rollback to an unknown receipt {:?}", receipt),
                Some(top) if top.receipt == receipt => break,
                Some(top) => {
                    assert!(
                        top.receipt > receipt,
                        "rollback to an unknown receipt {:?}",
                        receipt
                    );
                }
            }
            // Applied newest-first, so the oldest interval's shadows land
            // last and win.
            let entry = self.history.pop().unwrap();
            globals_logs.push(entry.globals_log);
            for (process, undo) in self.processes.iter_mut().zip(entry.process_logs) {
                process.apply_undo(undo);
            }
            self.heap.apply_log(entry.heap_log);
        }
        self.globals.rollback(&globals_logs);
        let scalars = self.history.last().unwrap().scalars.clone();
        self.restore_scalars(&scalars);
    }

    /// A deep copy with dirty flags cleared and no history. Required before
    /// handing a snapshot to a second, independently explorable successor.
    pub fn fork(&self) -> StateSnapshot {
        StateSnapshot {
            processes: self.processes.iter().map(Process::fork).collect(),
            globals: self.globals.fork(),
            heap: self.heap.fork(),
            pending_choice: self.pending_choice.clone(),
            step_count: self.step_count,
            fault: self.fault.clone(),
            pruned: self.pruned,
            history: Vec::new(),
            receipt_nonce: 0,
        }
    }

    /// Whether process `pid` can take a step right now.
    pub fn is_runnable(&self, pid: usize) -> bool {
        if self.pending_choice.is_some() || self.fault.is_some() || self.pruned {
            return false;
        }
        self.process_enabled(pid)
    }

    /// Process-level runnability, ignoring pending choices, faults, and
    /// pruning: whether the process itself could take a step.
    fn process_enabled(&self, pid: usize) -> bool {
        let Some(process) = self.processes.get(pid) else {
            return false;
        };
        match process.status {
            ProcessStatus::Runnable => true,
            ProcessStatus::Completed => false,
            ProcessStatus::Blocked => {
                let Some(frame) = process.frames.last() else {
                    return false;
                };
                let view = MachineView {
                    globals: self.globals.get().as_ref(),
                    heap: &self.heap,
                };
                frame.code.can_run(frame.block(), frame.data(), &view)
            }
        }
    }

    pub fn runnable_processes(&self) -> Vec<usize> {
        (0..self.processes.len())
            .filter(|&pid| self.is_runnable(pid))
            .collect()
    }

    /// Executes one maximal atomic step of process `pid`: a run of basic
    /// blocks up to the next preemption point, block, choice, return of the
    /// last frame, or fault. Bounded to catch runaway atomic regions.
    pub fn run_process(&mut self, pid: usize) {
        debug_assert!(self.is_runnable(pid), "run_process on a non-runnable process");
        self.run(pid, None, None);
    }

    /// Like [`StateSnapshot::run_process`], with a scheduler attached: the
    /// program can reach it through [`Machine::invoke_scheduler`], and it is
    /// notified of every process whose runnability the step changed.
    pub fn run_process_with(&mut self, pid: usize, sched: &mut (dyn Scheduler + 'static)) {
        debug_assert!(self.is_runnable(pid), "run_process on a non-runnable process");
        self.run(pid, None, Some(sched));
    }

    /// Resolves the pending nondeterministic choice with alternative `n` and
    /// continues the choosing process's atomic step.
    pub fn run_choice(&mut self, n: usize) {
        if let Some(pid) = self.resolve_choice(n) {
            self.run(pid, Some(n), None);
        }
    }

    /// Like [`StateSnapshot::run_choice`], with a scheduler attached.
    pub fn run_choice_with(&mut self, n: usize, sched: &mut (dyn Scheduler + 'static)) {
        if let Some(pid) = self.resolve_choice(n) {
            self.run(pid, Some(n), Some(sched));
        }
    }

    fn resolve_choice(&mut self, n: usize) -> Option<usize> {
        let Some(pending) = self.pending_choice.take() else {
            self.fault = Some(Fault::Internal("run_choice without a pending choice".into()));
            return None;
        };
        if n >= pending.count {
            self.fault = Some(Fault::Internal(format!(
                "choice {} out of range 0..{}",
                n, pending.count
            )));
            return None;
        }
        Some(pending.pid)
    }

    fn run(
        &mut self,
        pid: usize,
        mut chosen: Option<usize>,
        mut sched: Option<&mut (dyn Scheduler + 'static)>,
    ) {
        let enabled_before: Vec<bool> = if sched.is_some() {
            (0..self.processes.len())
                .map(|p| self.process_enabled(p))
                .collect()
        } else {
            Vec::new()
        };
        let mut blocks = 0usize;
        loop {
            blocks += 1;
            if blocks > MAX_ATOMIC_BLOCKS {
                self.fault = Some(Fault::InfiniteLoop);
                break;
            }

            let (result, spawned) = {
                let process = &mut self.processes[pid];
                let Some(frame) = process.frames.last_mut() else {
                    process.set_status(ProcessStatus::Completed);
                    break;
                };
                let code = Arc::clone(&frame.code);
                let mut machine = Machine {
                    globals: &mut self.globals,
                    heap: &mut self.heap,
                    chosen: chosen.take(),
                    spawned: Vec::new(),
                    sched: sched.as_deref_mut(),
                };
                let result = code.dispatch(frame.store.get_mut(), &mut machine);
                (result, machine.spawned)
            };
            for entry in spawned {
                self.processes.push(Process::new(entry));
            }

            let process = &mut self.processes[pid];
            match result {
                BlockResult::Goto(next) => {
                    process.frames.last_mut().unwrap().store.get_mut().block = next;
                }
                BlockResult::Yield(next) => {
                    process.frames.last_mut().unwrap().store.get_mut().block = next;
                    process.set_status(ProcessStatus::Runnable);
                    break;
                }
                BlockResult::Blocked => {
                    process.set_status(ProcessStatus::Blocked);
                    break;
                }
                BlockResult::Call { callee, resume } => {
                    process.frames.last_mut().unwrap().store.get_mut().block = resume;
                    process.before_stack_change();
                    process.frames.push(callee);
                }
                BlockResult::Return => {
                    process.before_stack_change();
                    process.frames.pop();
                    if process.frames.is_empty() {
                        process.set_status(ProcessStatus::Completed);
                        break;
                    }
                }
                BlockResult::Choose { count, resume } => {
                    process.frames.last_mut().unwrap().store.get_mut().block = resume;
                    if count == 0 {
                        self.fault = Some(Fault::InvalidChoose);
                    } else {
                        self.pending_choice = Some(PendingChoice { pid, count });
                    }
                    break;
                }
                BlockResult::Raise(fault) => {
                    self.fault = Some(fault);
                    break;
                }
                BlockResult::Prune => {
                    self.pruned = true;
                    break;
                }
            }
        }

        if let Some(sched) = sched {
            for p in 0..self.processes.len() {
                let before = enabled_before.get(p).copied().unwrap_or(false);
                match (before, self.process_enabled(p)) {
                    (false, true) => sched.on_enabled(p),
                    (true, false) => sched.on_blocked(p),
                    _ => {}
                }
            }
        }

        self.step_count += 1;
        self.check_for_deadlock();
    }

    /// When nothing remains runnable and no choice is pending, every blocked
    /// process must sit at a valid end block; otherwise the state deadlocked.
    fn check_for_deadlock(&mut self) {
        if self.fault.is_some() || self.pruned || self.pending_choice.is_some() {
            return;
        }
        if (0..self.processes.len()).any(|pid| self.is_runnable(pid)) {
            return;
        }
        let deadlocked = self.processes.iter().any(|p| {
            p.status == ProcessStatus::Blocked
                && p.frames
                    .last()
                    .is_some_and(|f| !f.code.is_valid_end_block(f.block()))
        });
        if deadlocked {
            self.fault = Some(Fault::InvalidEndState);
        }
    }

    /// Classifies the state for the traversal state machine.
    pub fn classify(&self) -> StateKind {
        if let Some(fault) = &self.fault {
            return StateKind::Error(fault.clone());
        }
        if self.pruned {
            return StateKind::FailedAssumption;
        }
        if let Some(pending) = &self.pending_choice {
            return StateKind::Choice {
                count: pending.count,
            };
        }
        if (0..self.processes.len()).any(|pid| self.is_runnable(pid)) {
            return StateKind::Execution;
        }
        StateKind::NormalTermination
    }
}

/// Read-only view handed to join-condition checks.
pub struct MachineView<'a> {
    pub(crate) globals: &'a dyn GlobalsRecord,
    pub(crate) heap: &'a Heap,
}

impl<'a> MachineView<'a> {
    pub fn globals<T: 'static>(&self) -> &T {
        self.globals
            .as_any()
            .downcast_ref()
            .expect("globals record of the wrong concrete type")
    }

    pub fn load(&self, ptr: Pointer) -> Result<&dyn HeapElement, Fault> {
        self.heap.get(ptr).ok_or(Fault::NullReference)
    }
}

/// The mutable machine view handed to one basic-block dispatch. Mutations
/// flow through the undo discipline automatically.
pub struct Machine<'a> {
    globals: &'a mut UndoableStore<Box<dyn GlobalsRecord>>,
    heap: &'a mut Heap,
    chosen: Option<usize>,
    spawned: Vec<Frame>,
    sched: Option<&'a mut (dyn Scheduler + 'static)>,
}

impl<'a> Machine<'a> {
    pub fn globals<T: 'static>(&self) -> &T {
        self.globals
            .get()
            .as_any()
            .downcast_ref()
            .expect("globals record of the wrong concrete type")
    }

    /// Write access to the globals; saves the undo shadow on first use within
    /// a checkpoint interval.
    pub fn globals_mut<T: 'static>(&mut self) -> &mut T {
        self.globals
            .get_mut()
            .as_any_mut()
            .downcast_mut()
            .expect("globals record of the wrong concrete type")
    }

    pub fn alloc(&mut self, elem: Box<dyn HeapElement>) -> Pointer {
        self.heap.alloc(elem)
    }

    pub fn load(&self, ptr: Pointer) -> Result<&dyn HeapElement, Fault> {
        self.heap.get(ptr).ok_or(Fault::NullReference)
    }

    pub fn load_mut(&mut self, ptr: Pointer) -> Result<&mut dyn HeapElement, Fault> {
        self.heap.get_mut(ptr).ok_or(Fault::NullReference)
    }

    /// The resolved alternative, present exactly once after a
    /// [`BlockResult::Choose`] was answered.
    pub fn chosen(&mut self) -> Option<usize> {
        self.chosen.take()
    }

    /// Starts a new process at `entry` once the current step commits.
    pub fn spawn(&mut self, entry: Frame) {
        self.spawned.push(entry);
    }

    /// Forwards a model-specific operation to the scheduler driving this
    /// step, if any. See [`Scheduler::invoke`].
    pub fn invoke_scheduler(&mut self, op: &str, args: &[i64]) -> Option<i64> {
        self.sched.as_mut().and_then(|s| s.invoke(op, args))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_util::counter::{self, CounterGlobals};
    use crate::test_util::list;

    #[test]
    fn initial_state_is_execution() {
        let program = counter::two_increments();
        let state = StateSnapshot::initial(&program);
        assert_eq!(state.process_count(), 2);
        assert_eq!(state.classify(), StateKind::Execution);
    }

    #[test]
    fn interleavings_commute_to_the_same_counter() {
        let program = counter::two_increments();
        for order in [[0usize, 1], [1, 0]] {
            let mut state = StateSnapshot::initial(&program);
            state.check_in();
            for &pid in &order {
                // Each process yields once mid-increment.
                while state.is_runnable(pid) {
                    state.run_process(pid);
                }
            }
            assert_eq!(state.classify(), StateKind::NormalTermination);
            assert_eq!(state.globals::<CounterGlobals>().count, 2);
        }
    }

    #[test]
    fn rollback_round_trip_restores_globals_and_status() {
        let program = counter::two_increments();
        let mut state = StateSnapshot::initial(&program);
        let receipt = state.check_in();

        while state.is_runnable(0) {
            state.run_process(0);
        }
        assert_eq!(state.globals::<CounterGlobals>().count, 1);

        state.rollback(receipt);
        assert_eq!(state.globals::<CounterGlobals>().count, 0);
        assert_eq!(state.classify(), StateKind::Execution);
        assert!(state.is_runnable(0));
    }

    #[test]
    fn multi_level_rollback_skips_intermediate_checkpoints() {
        let program = counter::two_increments();
        let mut state = StateSnapshot::initial(&program);
        let r1 = state.check_in();
        state.run_process(0);
        let _r2 = state.check_in();
        state.run_process(1);
        state.check_in();
        state.run_process(0);

        state.rollback(r1);
        assert_eq!(state.globals::<CounterGlobals>().count, 0);
        assert_eq!(state.step_count(), 0);

        // The same receipt remains rollback-able for sibling exploration.
        state.run_process(1);
        state.rollback(r1);
        assert_eq!(state.globals::<CounterGlobals>().count, 0);
    }

    #[test]
    fn rollback_undoes_heap_allocation() {
        let program = list::ListProgram;
        let mut state = StateSnapshot::initial(&program);
        // Step 1 allocates A, step 2 allocates B -> A.
        state.run_process(0);
        state.run_process(0);
        let receipt = state.check_in();
        let live_before = state.heap.live_count();

        // Step 3 allocates C and points B at C instead of A.
        state.run_process(0);
        assert_eq!(state.heap.live_count(), live_before + 1);

        state.rollback(receipt);
        assert_eq!(state.heap.live_count(), live_before);
    }

    #[test]
    fn choice_states_pend_and_resolve() {
        let program = counter::chooser();
        let mut state = StateSnapshot::initial(&program);
        state.check_in();
        state.run_process(0);
        assert_eq!(state.classify(), StateKind::Choice { count: 3 });

        state.run_choice(2);
        assert_eq!(state.classify(), StateKind::NormalTermination);
        assert_eq!(state.globals::<CounterGlobals>().count, 2);
    }

    #[test]
    fn out_of_range_choice_is_an_internal_fault() {
        let program = counter::chooser();
        let mut state = StateSnapshot::initial(&program);
        state.check_in();
        state.run_process(0);
        state.run_choice(7);
        assert!(matches!(state.classify(), StateKind::Error(Fault::Internal(_))));
    }

    #[test]
    fn runaway_atomic_region_faults_as_infinite_loop() {
        let program = counter::spinner();
        let mut state = StateSnapshot::initial(&program);
        state.check_in();
        state.run_process(0);
        assert_eq!(
            state.classify(),
            StateKind::Error(Fault::InfiniteLoop)
        );
    }

    #[test]
    fn blocked_process_outside_end_state_is_a_deadlock() {
        let program = counter::forever_blocked();
        let mut state = StateSnapshot::initial(&program);
        state.check_in();
        state.run_process(0);
        assert_eq!(
            state.classify(),
            StateKind::Error(Fault::InvalidEndState)
        );
    }

    #[test]
    fn blocked_at_a_valid_end_state_terminates_normally() {
        let program = counter::blocked_at_end_state();
        let mut state = StateSnapshot::initial(&program);
        state.check_in();
        state.run_process(0);
        assert_eq!(state.classify(), StateKind::NormalTermination);
    }

    #[test]
    fn spawned_processes_join_the_process_list() {
        let program = counter::spawner();
        let mut state = StateSnapshot::initial(&program);
        let receipt = state.check_in();
        state.run_process(0);
        assert_eq!(state.process_count(), 2);
        assert!(state.is_runnable(1));

        state.run_process(1);
        assert_eq!(state.globals::<CounterGlobals>().count, 1);
        assert_eq!(state.classify(), StateKind::NormalTermination);

        // Rollback truncates the spawned process away.
        state.rollback(receipt);
        assert_eq!(state.process_count(), 1);
        assert_eq!(state.globals::<CounterGlobals>().count, 0);
    }

    #[test]
    fn fork_is_independent() {
        let program = counter::two_increments();
        let mut state = StateSnapshot::initial(&program);
        state.check_in();
        state.run_process(0);

        let fork = state.fork();
        while state.is_runnable(0) {
            state.run_process(0);
        }
        assert_eq!(state.globals::<CounterGlobals>().count, 1);
        assert_eq!(fork.globals::<CounterGlobals>().count, 0);
        assert_eq!(fork.step_count(), state.step_count() - 1);
    }

    #[derive(Debug, Default)]
    struct SchedLog {
        enabled: Vec<usize>,
        blocked: Vec<usize>,
        invoked: Vec<(String, Vec<i64>)>,
    }

    /// Records every hook call; shared across clones so the log survives the
    /// per-successor scheduler cloning.
    #[derive(Clone, Default)]
    struct RecordingScheduler {
        log: std::sync::Arc<parking_lot::Mutex<SchedLog>>,
    }

    impl Scheduler for RecordingScheduler {
        fn boxed_clone(&self) -> Box<dyn Scheduler> {
            Box::new(self.clone())
        }
        fn start(&mut self, _state: &StateSnapshot, _pid: usize) {}
        fn next(&self, state: &StateSnapshot) -> Option<usize> {
            state.runnable_processes().first().copied()
        }
        fn delay(&mut self, _state: &StateSnapshot) {}
        fn max_delay_reached(&self, _state: &StateSnapshot) -> bool {
            false
        }
        fn on_enabled(&mut self, pid: usize) {
            self.log.lock().enabled.push(pid);
        }
        fn on_blocked(&mut self, pid: usize) {
            self.log.lock().blocked.push(pid);
        }
        fn invoke(&mut self, op: &str, args: &[i64]) -> Option<i64> {
            self.log.lock().invoked.push((op.to_string(), args.to_vec()));
            Some(args.iter().sum())
        }
        fn save_blob(&self) -> Vec<u8> {
            b"{}".to_vec()
        }
        fn restore_blob(&mut self, _blob: &[u8]) -> Result<(), serde_json::Error> {
            Ok(())
        }
    }

    #[test]
    fn blocking_steps_notify_the_scheduler() {
        let program = counter::forever_blocked();
        let mut state = StateSnapshot::initial(&program);
        let mut sched = RecordingScheduler::default();
        state.run_process_with(0, &mut sched);
        assert_eq!(sched.log.lock().blocked, vec![0]);
        assert!(sched.log.lock().enabled.is_empty());
    }

    #[test]
    fn spawned_processes_are_reported_enabled() {
        let program = counter::spawner();
        let mut state = StateSnapshot::initial(&program);
        let mut sched = RecordingScheduler::default();
        state.run_process_with(0, &mut sched);
        // The spawner completes (reported no longer runnable) and its child
        // appears runnable.
        assert_eq!(sched.log.lock().enabled, vec![1]);
        assert_eq!(sched.log.lock().blocked, vec![0]);
    }

    /// A method that asks the scheduler for a credit and records the answer.
    struct AskScheduler;

    impl MethodCode for AskScheduler {
        fn name(&self) -> &'static str {
            "ask_scheduler"
        }
        fn dispatch(&self, _data: &mut FrameData, m: &mut Machine<'_>) -> BlockResult {
            let credit = m.invoke_scheduler("credit", &[2, 3]).unwrap_or(-1);
            m.globals_mut::<CounterGlobals>().count = credit as i32;
            BlockResult::Return
        }
    }

    struct AskProgram;

    impl CompiledProgram for AskProgram {
        fn globals(&self) -> Box<dyn GlobalsRecord> {
            Box::new(CounterGlobals { count: 0 })
        }
        fn entry_points(&self) -> Vec<Frame> {
            vec![Frame::new(
                Arc::new(AskScheduler),
                Box::new(crate::test_util::Unit),
            )]
        }
    }

    #[test]
    fn programs_reach_the_scheduler_through_the_machine() {
        let mut state = StateSnapshot::initial(&AskProgram);
        let mut sched = RecordingScheduler::default();
        state.run_process_with(0, &mut sched);
        assert_eq!(state.globals::<CounterGlobals>().count, 5);
        assert_eq!(
            sched.log.lock().invoked,
            vec![("credit".to_string(), vec![2, 3])]
        );

        // Without a scheduler attached the escape hatch answers None.
        let mut bare = StateSnapshot::initial(&AskProgram);
        bare.run_process(0);
        assert_eq!(bare.globals::<CounterGlobals>().count, -1);
    }
}
