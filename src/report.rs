//! Private module for selective re-export.

use std::fmt;
use std::io::Write;
use std::time::Duration;

use crate::fingerprint::Fingerprint;
use crate::node::TraceStep;
use crate::program::Fault;

/// The discriminated outcome of one exploration run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RunStatus {
    /// Every reachable state under the policy was visited without a defect.
    Success,
    /// The run was canceled or timed out before completing.
    Canceled,
    /// A state was reached where no process can run and some blocked process
    /// is not at a valid end state.
    Deadlock,
    /// A modeled assertion failed.
    Assertion,
    /// The modeled program faulted at runtime (null dereference, overflow,
    /// runaway atomic region, ...).
    ProgramRuntimeError,
    /// The engine itself failed; a bug or an I/O error, not a model defect.
    CheckerError,
    /// A liveness acceptance cycle was found.
    AcceptanceCycleFound,
    /// The run configuration was rejected before exploration began.
    InvalidParameters,
    /// The search stack exceeded its depth cutoff.
    StackOverflow,
}

impl RunStatus {
    pub(crate) fn for_fault(fault: &Fault) -> Self {
        match fault {
            Fault::Assertion(_) => RunStatus::Assertion,
            Fault::InvalidEndState => RunStatus::Deadlock,
            Fault::Internal(_) => RunStatus::CheckerError,
            Fault::DfsStackOverflow => RunStatus::StackOverflow,
            _ => RunStatus::ProgramRuntimeError,
        }
    }

    /// Severity rank used to pick the run's single status when several kinds
    /// of defect were discovered.
    pub(crate) fn severity(&self) -> u8 {
        match self {
            RunStatus::CheckerError => 7,
            RunStatus::StackOverflow => 6,
            RunStatus::Assertion => 5,
            RunStatus::Deadlock => 4,
            RunStatus::ProgramRuntimeError => 3,
            RunStatus::AcceptanceCycleFound => 2,
            _ => 0,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunStatus::Success => "success",
            RunStatus::Canceled => "canceled",
            RunStatus::Deadlock => "deadlock",
            RunStatus::Assertion => "assertion failure",
            RunStatus::ProgramRuntimeError => "program runtime error",
            RunStatus::CheckerError => "checker error",
            RunStatus::AcceptanceCycleFound => "acceptance cycle found",
            RunStatus::InvalidParameters => "invalid parameters",
            RunStatus::StackOverflow => "search stack overflow",
        };
        f.write_str(name)
    }
}

/// One defective terminal state, with the trace that reaches it from the
/// initial state.
#[derive(Clone, Debug)]
pub struct Discovery {
    pub fault: Fault,
    pub trace: Vec<TraceStep>,
    pub fingerprint: Option<Fingerprint>,
}

impl fmt::Display for Discovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, trace=", self.fault)?;
        if self.trace.is_empty() {
            f.write_str("(initial state)")?;
        }
        for (i, step) in self.trace.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            if step.choice {
                write!(f, "c{}", step.index)?;
            } else {
                write!(f, "p{}", step.index)?;
            }
        }
        Ok(())
    }
}

/// The summary of one exploration run.
#[derive(Clone, Debug)]
pub struct RunReport {
    pub status: RunStatus,
    /// Unique states inserted into the dedup table.
    pub states_generated: u64,
    /// BFS layers completed (0 for random walks).
    pub layers: u32,
    pub discoveries: Vec<Discovery>,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn report(&self, reporter: &mut dyn Reporter) {
        reporter.report_run(self);
    }
}

/// A progress snapshot delivered while an exploration is still running.
#[derive(Clone, Copy, Debug)]
pub struct ReportData {
    /// Unique states inserted into the dedup table so far.
    pub states_generated: u64,
    /// BFS layers completed so far.
    pub layers: u32,
    /// Records in the layer just promoted, 0 on the final report.
    pub layer_size: u64,
    pub elapsed: Duration,
    /// Set on the last progress report of the run.
    pub done: bool,
}

/// A sink for run progress and results.
pub trait Reporter {
    /// Called once per completed BFS layer, and once more with `done` set
    /// before the run summary.
    fn report_progress(&mut self, _data: ReportData) {}

    fn report_run(&mut self, report: &RunReport);
}

/// Discards everything; used when no reporting was requested.
impl Reporter for () {
    fn report_run(&mut self, _report: &RunReport) {}
}

/// Writes run results as plain text.
pub struct WriteReporter<'a, W> {
    writer: &'a mut W,
}

impl<'a, W> WriteReporter<'a, W> {
    pub fn new(writer: &'a mut W) -> Self {
        Self { writer }
    }
}

impl<'a, W: Write> Reporter for WriteReporter<'a, W> {
    fn report_progress(&mut self, data: ReportData) {
        let _ = writeln!(
            self.writer,
            "{}. states={}, layers={}, frontier={}, sec={}",
            if data.done { "Explored" } else { "Exploring" },
            data.states_generated,
            data.layers,
            data.layer_size,
            data.elapsed.as_secs(),
        );
    }

    fn report_run(&mut self, report: &RunReport) {
        let _ = writeln!(
            self.writer,
            "Result: {}. states={}, layers={}, sec={}",
            report.status,
            report.states_generated,
            report.layers,
            report.elapsed.as_secs(),
        );
        for discovery in &report.discoveries {
            let _ = writeln!(self.writer, "Discovered {}", discovery);
        }
    }
}
