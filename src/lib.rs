//! An explicit-state model checker for concurrent heap programs.
//!
//! A compiled model exposes its processes as resumable [`MethodCode`] blocks
//! over shared [`GlobalsRecord`] globals and a garbage-collected object heap.
//! The engine enumerates every reachable interleaving of those processes,
//! detecting assertion failures, deadlocks, and runtime faults, and reports
//! each defect with a replayable trace from the initial state.
//!
//! State storage is built for exhaustive search rather than generality:
//! mutations accumulate in undo logs ([`UndoableStore`]) so that exploring a
//! sibling transition is a rollback instead of a deep copy, heap shapes are
//! canonicalized so allocation order never splits equivalent states
//! ([`HeapCanonicalizer`]), and visited states are remembered only as
//! compacted [`Fingerprint`]s. Search strategies include exhaustive
//! breadth-first search with optional disk spillover ([`FrontierSet`]),
//! delay and preemption bounding ([`BoundingPolicy`]), and random walks.
//!
//! ```ignore
//! use vigil::{ExplorerBuilder, RunStatus};
//!
//! let report = ExplorerBuilder::new(program)
//!     .thread_count(4)
//!     .stop_on_first_error(true)
//!     .run_bfs();
//! assert_eq!(report.status, RunStatus::Success);
//! ```

mod canonical;
mod explorer;
mod fingerprint;
mod frontier;
mod heap;
mod node;
mod program;
mod report;
mod sched;
mod state;
mod store;
#[cfg(test)]
pub mod test_util;

pub use canonical::{CanonicalAlgorithm, HeapCanonicalizer};
pub use explorer::ExplorerBuilder;
pub use fingerprint::Fingerprint;
pub use frontier::{FrontierConfig, FrontierRecord, FrontierSet};
pub use heap::Pointer;
pub use node::{NodePolicy, TraceStep, TraversalNode, Via, WorkerContext};
pub use program::{
    BlockResult, CompiledProgram, ElementKind, Fault, FieldVisitor, GlobalsRecord, HeapElement,
    LocalsRecord, MethodCode, StateWriter,
};
pub use report::{Discovery, ReportData, Reporter, RunReport, RunStatus, WriteReporter};
pub use sched::{
    BoundingPolicy, DelayBounding, PreemptionBounding, RoundRobin, Scheduler, SearchBounds,
};
pub use state::{
    Frame, FrameData, Machine, MachineView, ProcessStatus, Receipt, StateKind, StateSnapshot,
};
pub use store::UndoableStore;
