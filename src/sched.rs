//! Private module for selective re-export.

use crate::state::StateSnapshot;
use serde::{Deserialize, Serialize};

/// Search-cost accounting carried per explored transition. Which fields move
/// depends on the active bounding policy.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct SearchBounds {
    /// Execution transitions taken from the root.
    pub execution: u32,
    /// Choice transitions taken from the root.
    pub choice: u32,
    /// Scheduler deferrals spent (delay bounding).
    pub delays: u32,
    /// Context switches away from a still-runnable process (preemption
    /// bounding).
    pub preemptions: u32,
}

/// The bounding policy in force for successor enumeration.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BoundingPolicy {
    /// Enumerate every runnable process in index order.
    None,
    /// Consult the scheduler; spend one delay per deferred alternative, at
    /// most `budget` per state.
    Delay { budget: u32 },
    /// Keep executing the same process; switching away from a runnable
    /// process costs one preemption, at most `budget` per path.
    Preemption { budget: u32 },
}

impl BoundingPolicy {
    pub(crate) fn make_scheduler(&self) -> Box<dyn Scheduler> {
        match *self {
            BoundingPolicy::None => Box::new(RoundRobin::default()),
            BoundingPolicy::Delay { budget } => Box::new(DelayBounding::new(budget)),
            BoundingPolicy::Preemption { budget } => Box::new(PreemptionBounding::new(budget)),
        }
    }
}

/// The pluggable strategy consulted when choosing which runnable process to
/// execute next. Scheduler state travels with its state snapshot: it is
/// cloned per successor and serialized into frontier records.
pub trait Scheduler: Send {
    fn boxed_clone(&self) -> Box<dyn Scheduler>;

    /// The process about to execute was selected. Resets per-state
    /// accounting.
    fn start(&mut self, state: &StateSnapshot, pid: usize);

    /// The selected process finished its step.
    fn finish(&mut self, state: &StateSnapshot, pid: usize) {
        let _ = (state, pid);
    }

    /// The process to try next, or `None` when nothing is runnable.
    fn next(&self, state: &StateSnapshot) -> Option<usize>;

    /// Defers the current proposal and moves to the next alternative.
    fn delay(&mut self, state: &StateSnapshot);

    /// Whether this state's delay budget is exhausted.
    fn max_delay_reached(&self, state: &StateSnapshot) -> bool;

    fn on_enabled(&mut self, _pid: usize) {}

    fn on_blocked(&mut self, _pid: usize) {}

    /// Escape hatch for model-specific scheduling operations (map logical to
    /// physical ids, seal/unseal, ...). Unrecognized operations return
    /// `None`.
    fn invoke(&mut self, _op: &str, _args: &[i64]) -> Option<i64> {
        None
    }

    /// Serializes the scheduler state for embedding in frontier records.
    fn save_blob(&self) -> Vec<u8>;

    fn restore_blob(&mut self, blob: &[u8]) -> Result<(), serde_json::Error>;
}

impl Clone for Box<dyn Scheduler> {
    fn clone(&self) -> Self {
        self.boxed_clone()
    }
}

/// Plain round-robin proposal order with no budget. Used when bounding is
/// disabled and a scheduler is still wanted for its ordering.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct RoundRobin {
    cursor: usize,
}

impl RoundRobin {
    fn propose(&self, state: &StateSnapshot, from: usize) -> Option<usize> {
        let n = state.process_count();
        (0..n)
            .map(|i| (from + i) % n.max(1))
            .find(|&pid| state.is_runnable(pid))
    }
}

impl Scheduler for RoundRobin {
    fn boxed_clone(&self) -> Box<dyn Scheduler> {
        Box::new(self.clone())
    }

    fn start(&mut self, _state: &StateSnapshot, pid: usize) {
        self.cursor = pid;
    }

    fn next(&self, state: &StateSnapshot) -> Option<usize> {
        self.propose(state, self.cursor)
    }

    fn delay(&mut self, state: &StateSnapshot) {
        if let Some(pid) = self.propose(state, self.cursor) {
            self.cursor = (pid + 1) % state.process_count().max(1);
        }
    }

    fn max_delay_reached(&self, _state: &StateSnapshot) -> bool {
        false
    }

    fn save_blob(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("scheduler state serializes")
    }

    fn restore_blob(&mut self, blob: &[u8]) -> Result<(), serde_json::Error> {
        *self = serde_json::from_slice(blob)?;
        Ok(())
    }
}

/// Delay bounding: the scheduler proposes deterministically; each deferral of
/// its proposal costs one delay, with at most `budget` delays per state.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DelayBounding {
    budget: u32,
    cursor: usize,
    delays: u32,
}

impl DelayBounding {
    pub fn new(budget: u32) -> Self {
        Self {
            budget,
            cursor: 0,
            delays: 0,
        }
    }
}

impl Scheduler for DelayBounding {
    fn boxed_clone(&self) -> Box<dyn Scheduler> {
        Box::new(self.clone())
    }

    fn start(&mut self, _state: &StateSnapshot, pid: usize) {
        self.cursor = pid;
        self.delays = 0;
    }

    fn next(&self, state: &StateSnapshot) -> Option<usize> {
        let n = state.process_count();
        (0..n)
            .map(|i| (self.cursor + i) % n.max(1))
            .find(|&pid| state.is_runnable(pid))
    }

    fn delay(&mut self, state: &StateSnapshot) {
        if let Some(pid) = self.next(state) {
            self.cursor = (pid + 1) % state.process_count().max(1);
        }
        self.delays += 1;
    }

    fn max_delay_reached(&self, _state: &StateSnapshot) -> bool {
        self.delays >= self.budget
    }

    fn save_blob(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("scheduler state serializes")
    }

    fn restore_blob(&mut self, blob: &[u8]) -> Result<(), serde_json::Error> {
        *self = serde_json::from_slice(blob)?;
        Ok(())
    }
}

/// Preemption bounding: keep executing the current process until it yields
/// the processor; switching away from it while it is still runnable costs one
/// preemption, with at most `budget` preemptions per path.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PreemptionBounding {
    budget: u32,
    current: usize,
    cursor: usize,
    /// Preemptions charged along this path so far.
    used: u32,
}

impl PreemptionBounding {
    pub fn new(budget: u32) -> Self {
        Self {
            budget,
            current: 0,
            cursor: 0,
            used: 0,
        }
    }
}

impl Scheduler for PreemptionBounding {
    fn boxed_clone(&self) -> Box<dyn Scheduler> {
        Box::new(self.clone())
    }

    fn start(&mut self, state: &StateSnapshot, pid: usize) {
        if pid != self.current && state.is_runnable(self.current) {
            self.used += 1;
        }
        self.current = pid;
        self.cursor = pid;
    }

    fn next(&self, state: &StateSnapshot) -> Option<usize> {
        let n = state.process_count();
        (0..n)
            .map(|i| (self.cursor + i) % n.max(1))
            .find(|&pid| state.is_runnable(pid))
    }

    fn delay(&mut self, state: &StateSnapshot) {
        if let Some(pid) = self.next(state) {
            self.cursor = (pid + 1) % state.process_count().max(1);
        }
    }

    fn max_delay_reached(&self, state: &StateSnapshot) -> bool {
        // Further alternatives all preempt the current process; they are
        // admissible only while budget remains.
        self.used >= self.budget && state.is_runnable(self.current)
    }

    fn save_blob(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("scheduler state serializes")
    }

    fn restore_blob(&mut self, blob: &[u8]) -> Result<(), serde_json::Error> {
        *self = serde_json::from_slice(blob)?;
        Ok(())
    }
}
