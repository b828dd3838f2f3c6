//! The capability contract between the engine and a compiled program.
//!
//! The engine never compiles anything. A modeled program arrives as a set of
//! trait objects: a globals record, method bodies compiled into resumable
//! dispatch blocks, and heap element variants. The engine only calls the
//! capabilities below: dispatch one basic block, clone, serialize through a
//! [`StateWriter`], and walk reference fields through a [`FieldVisitor`].

use crate::heap::Pointer;
use crate::state::{Frame, FrameData, Machine, MachineView};
use std::any::Any;
use std::fmt;

/// The closed set of heap element shapes.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ElementKind {
    Record,
    Array,
    Set,
    Channel,
}

impl ElementKind {
    pub(crate) fn tag(self) -> u8 {
        match self {
            ElementKind::Record => 1,
            ElementKind::Array => 2,
            ElementKind::Set => 3,
            ElementKind::Channel => 4,
        }
    }
}

/// Walks the reference fields of a record, in field order. Scalar fields are
/// not reported; they flow through [`StateWriter`] during serialization.
pub trait FieldVisitor {
    fn visit_ref(&mut self, field: usize, target: Pointer);
}

impl<F: FnMut(usize, Pointer)> FieldVisitor for F {
    fn visit_ref(&mut self, field: usize, target: Pointer) {
        self(field, target)
    }
}

/// A byte sink for canonical serialization. Heap references are substituted
/// with canonical ids by the traversal driving the writer, so two isomorphic
/// states serialize identically.
pub struct StateWriter<'a> {
    buf: &'a mut Vec<u8>,
    resolve: &'a mut dyn FnMut(Pointer) -> u32,
}

impl<'a> StateWriter<'a> {
    pub(crate) fn new(buf: &'a mut Vec<u8>, resolve: &'a mut dyn FnMut(Pointer) -> u32) -> Self {
        Self { buf, resolve }
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.push(v as u8);
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_str(&mut self, v: &str) {
        self.write_u32(v.len() as u32);
        self.buf.extend_from_slice(v.as_bytes());
    }

    /// Writes a heap reference as its canonical id.
    pub fn write_ref(&mut self, target: Pointer) {
        let id = (self.resolve)(target);
        self.write_u32(id);
    }
}

macro_rules! record_capability {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        pub trait $name: Send {
            fn boxed_clone(&self) -> Box<dyn $name>;
            fn write_to(&self, w: &mut StateWriter<'_>);
            fn traverse(&self, v: &mut dyn FieldVisitor);
            fn as_any(&self) -> &dyn Any;
            fn as_any_mut(&mut self) -> &mut dyn Any;
        }

        impl Clone for Box<dyn $name> {
            fn clone(&self) -> Self {
                self.boxed_clone()
            }
        }

        impl fmt::Debug for Box<dyn $name> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(concat!("Box<dyn ", stringify!($name), ">"))
            }
        }
    };
}

record_capability! {
    /// The program's shared globals, compiled into one record.
    GlobalsRecord
}

record_capability! {
    /// The locals/inputs/outputs of one method activation, compiled into one
    /// record. Generated code downcasts through `as_any` to its concrete type.
    LocalsRecord
}

/// One allocated heap aggregate: a record, array, set, or channel.
pub trait HeapElement: Send {
    fn kind(&self) -> ElementKind;
    fn boxed_clone(&self) -> Box<dyn HeapElement>;
    fn write_to(&self, w: &mut StateWriter<'_>);
    fn traverse(&self, v: &mut dyn FieldVisitor);
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl Clone for Box<dyn HeapElement> {
    fn clone(&self) -> Self {
        self.boxed_clone()
    }
}

impl fmt::Debug for Box<dyn HeapElement> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Box<dyn HeapElement: {:?}>", self.kind())
    }
}

/// A modeled-program runtime fault. Terminal for the path that raised it.
///
/// A failed `assume` is *not* a fault; it is [`BlockResult::Prune`] and only
/// silently terminates its own path.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum Fault {
    /// A user-level assertion predicate was false.
    Assertion(&'static str),
    /// Some process was blocked outside a valid end state while none was
    /// runnable.
    InvalidEndState,
    NullReference,
    DivideByZero,
    Overflow,
    IndexOutOfRange,
    InvalidChoose,
    InvalidBlockingSelect,
    /// One atomic step exceeded the basic-block bound; the modeled program
    /// has a runaway atomic region.
    InfiniteLoop,
    /// The search stack depth cutoff was exceeded. A limit of the search
    /// infrastructure, not a defect in the model.
    DfsStackOverflow,
    /// An uncaught internal failure. Always surfaced; indicates a defect in
    /// the checker itself.
    Internal(String),
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::Assertion(msg) => write!(f, "assertion failed: {}", msg),
            Fault::InvalidEndState => write!(f, "deadlock: process blocked outside an end state"),
            Fault::NullReference => write!(f, "null reference"),
            Fault::DivideByZero => write!(f, "division by zero"),
            Fault::Overflow => write!(f, "arithmetic overflow"),
            Fault::IndexOutOfRange => write!(f, "index out of range"),
            Fault::InvalidChoose => write!(f, "choose over an empty collection"),
            Fault::InvalidBlockingSelect => write!(f, "blocking select in an atomic region"),
            Fault::InfiniteLoop => write!(f, "basic-block bound exceeded in one atomic step"),
            Fault::DfsStackOverflow => write!(f, "search stack depth cutoff exceeded"),
            Fault::Internal(msg) => write!(f, "internal checker error: {}", msg),
        }
    }
}

/// The typed outcome of dispatching one basic block. Control flow and error
/// reporting share this one channel; pruning and faulting are distinct
/// variants so an `assume` can never be mistaken for an `assert`.
pub enum BlockResult {
    /// Fall through to `next` within the same atomic step.
    Goto(u32),
    /// End the atomic step at a preemption point; resume at `next` when the
    /// process is rescheduled.
    Yield(u32),
    /// The block's join condition does not hold. The frame stays at the same
    /// block and is retried when the process is runnable again.
    Blocked,
    /// Push an activation for a callee and resume at `resume` after it
    /// returns.
    Call { callee: Frame, resume: u32 },
    /// Pop this activation. Popping the last frame completes the process.
    Return,
    /// Introduce a nondeterministic choice over `count` alternatives. The
    /// block at `resume` is dispatched once the choice is resolved and reads
    /// it via [`Machine::chosen`].
    Choose { count: usize, resume: u32 },
    /// Raise a program fault, terminal for this path.
    Raise(Fault),
    /// A pruning condition (`assume`) was false. Terminates this path only;
    /// never reported as an error.
    Prune,
}

/// One compiled method: a bag of numbered, resumable basic blocks.
pub trait MethodCode: Send + Sync {
    /// Stable method name, part of the canonical serialization of a frame.
    fn name(&self) -> &'static str;

    /// Executes the basic block `data.block` and reports how control leaves
    /// it.
    fn dispatch(&self, data: &mut FrameData, m: &mut Machine<'_>) -> BlockResult;

    /// Whether a process blocked at `block` is in a valid end state. Consulted
    /// by deadlock detection when no process is runnable.
    fn is_valid_end_block(&self, _block: u32) -> bool {
        false
    }

    /// Whether the join condition at `block` currently holds. Blocked
    /// processes are re-enabled when this turns true.
    fn can_run(&self, _block: u32, _data: &FrameData, _m: &MachineView<'_>) -> bool {
        true
    }
}

impl fmt::Debug for dyn MethodCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dyn MethodCode: {}", self.name())
    }
}

/// A compiled program, ready to be instantiated into an initial state.
pub trait CompiledProgram: Send + Sync + 'static {
    /// The initial globals record.
    fn globals(&self) -> Box<dyn GlobalsRecord>;

    /// The entry activation of each initially running process, in process
    /// order.
    fn entry_points(&self) -> Vec<Frame>;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn writer_substitutes_canonical_ids() {
        let mut buf = Vec::new();
        let mut resolve = |p: Pointer| p.index() * 10;
        let mut w = StateWriter::new(&mut buf, &mut resolve);
        w.write_u8(0xab);
        w.write_ref(Pointer::from_index(3));
        w.write_str("hi");
        assert_eq!(
            buf,
            vec![0xab, 30, 0, 0, 0, 2, 0, 0, 0, b'h', b'i']
        );
    }

    #[test]
    fn element_kind_tags_are_distinct() {
        let kinds = [
            ElementKind::Record,
            ElementKind::Array,
            ElementKind::Set,
            ElementKind::Channel,
        ];
        for a in kinds {
            for b in kinds {
                assert_eq!(a.tag() == b.tag(), a == b);
            }
        }
    }
}
