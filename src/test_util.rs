//! Utilities for tests: small programs compiled by hand against the
//! capability contract.

use crate::heap::Pointer;
use crate::program::{
    BlockResult, CompiledProgram, ElementKind, FieldVisitor, Fault, GlobalsRecord, HeapElement,
    LocalsRecord, MethodCode, StateWriter,
};
use crate::state::{Frame, FrameData, Machine, MachineView};
use std::any::Any;
use std::sync::Arc;

/// A locals record with no fields.
#[derive(Clone, Debug)]
pub struct Unit;

impl LocalsRecord for Unit {
    fn boxed_clone(&self) -> Box<dyn LocalsRecord> {
        Box::new(self.clone())
    }
    fn write_to(&self, _w: &mut StateWriter<'_>) {}
    fn traverse(&self, _v: &mut dyn FieldVisitor) {}
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A heap record holding one integer and one reference.
pub mod cell {
    use super::*;

    #[derive(Clone, Debug)]
    pub struct Cell {
        pub value: i32,
        pub next: Pointer,
    }

    impl HeapElement for Cell {
        fn kind(&self) -> ElementKind {
            ElementKind::Record
        }
        fn boxed_clone(&self) -> Box<dyn HeapElement> {
            Box::new(self.clone())
        }
        fn write_to(&self, w: &mut StateWriter<'_>) {
            w.write_i32(self.value);
            w.write_ref(self.next);
        }
        fn traverse(&self, v: &mut dyn FieldVisitor) {
            v.visit_ref(0, self.next);
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    pub fn cell(value: i32, next: Pointer) -> Box<dyn HeapElement> {
        Box::new(Cell { value, next })
    }
}

/// Programs over a single shared integer counter.
pub mod counter {
    use super::*;

    #[derive(Clone, Debug)]
    pub struct CounterGlobals {
        pub count: i32,
    }

    impl GlobalsRecord for CounterGlobals {
        fn boxed_clone(&self) -> Box<dyn GlobalsRecord> {
            Box::new(self.clone())
        }
        fn write_to(&self, w: &mut StateWriter<'_>) {
            w.write_i32(self.count);
        }
        fn traverse(&self, _v: &mut dyn FieldVisitor) {}
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    #[derive(Clone, Debug)]
    pub struct IncLocals {
        pub tmp: i32,
    }

    impl LocalsRecord for IncLocals {
        fn boxed_clone(&self) -> Box<dyn LocalsRecord> {
            Box::new(self.clone())
        }
        fn write_to(&self, w: &mut StateWriter<'_>) {
            w.write_i32(self.tmp);
        }
        fn traverse(&self, _v: &mut dyn FieldVisitor) {}
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    /// Read the counter, yield at a preemption point, then write it back
    /// incremented. The classic lost-update race.
    struct RacyIncrement;

    impl MethodCode for RacyIncrement {
        fn name(&self) -> &'static str {
            "racy_increment"
        }
        fn dispatch(&self, data: &mut FrameData, m: &mut Machine<'_>) -> BlockResult {
            match data.block {
                0 => {
                    data.locals_mut::<IncLocals>().tmp = m.globals::<CounterGlobals>().count;
                    BlockResult::Yield(1)
                }
                1 => {
                    m.globals_mut::<CounterGlobals>().count = data.locals::<IncLocals>().tmp + 1;
                    BlockResult::Return
                }
                _ => BlockResult::Raise(Fault::Internal("bad block".into())),
            }
        }
    }

    /// Increment the counter in one atomic step.
    struct AtomicIncrement;

    impl MethodCode for AtomicIncrement {
        fn name(&self) -> &'static str {
            "atomic_increment"
        }
        fn dispatch(&self, _data: &mut FrameData, m: &mut Machine<'_>) -> BlockResult {
            m.globals_mut::<CounterGlobals>().count += 1;
            BlockResult::Return
        }
    }

    /// Choose k in 0..3 and add it to the counter.
    struct ChooseAdd;

    impl MethodCode for ChooseAdd {
        fn name(&self) -> &'static str {
            "choose_add"
        }
        fn dispatch(&self, data: &mut FrameData, m: &mut Machine<'_>) -> BlockResult {
            match data.block {
                0 => BlockResult::Choose { count: 3, resume: 1 },
                1 => {
                    let k = m.chosen().expect("resumed without a choice") as i32;
                    m.globals_mut::<CounterGlobals>().count += k;
                    BlockResult::Return
                }
                _ => BlockResult::Raise(Fault::Internal("bad block".into())),
            }
        }
    }

    /// Loop forever without leaving the atomic region.
    struct Spin;

    impl MethodCode for Spin {
        fn name(&self) -> &'static str {
            "spin"
        }
        fn dispatch(&self, _data: &mut FrameData, _m: &mut Machine<'_>) -> BlockResult {
            BlockResult::Goto(0)
        }
    }

    /// Block on a join condition that never holds.
    struct WaitForever {
        valid_end: bool,
    }

    impl MethodCode for WaitForever {
        fn name(&self) -> &'static str {
            "wait_forever"
        }
        fn dispatch(&self, _data: &mut FrameData, _m: &mut Machine<'_>) -> BlockResult {
            BlockResult::Blocked
        }
        fn can_run(&self, _block: u32, _data: &FrameData, _m: &MachineView<'_>) -> bool {
            false
        }
        fn is_valid_end_block(&self, _block: u32) -> bool {
            self.valid_end
        }
    }

    /// Spawn one atomic incrementer, then return.
    struct SpawnOne;

    impl MethodCode for SpawnOne {
        fn name(&self) -> &'static str {
            "spawn_one"
        }
        fn dispatch(&self, _data: &mut FrameData, m: &mut Machine<'_>) -> BlockResult {
            m.spawn(Frame::new(Arc::new(AtomicIncrement), Box::new(Unit)));
            BlockResult::Return
        }
    }

    pub struct CounterProgram {
        entries: Vec<fn() -> Frame>,
    }

    impl CompiledProgram for CounterProgram {
        fn globals(&self) -> Box<dyn GlobalsRecord> {
            Box::new(CounterGlobals { count: 0 })
        }
        fn entry_points(&self) -> Vec<Frame> {
            self.entries.iter().map(|make| make()).collect()
        }
    }

    fn racy_entry() -> Frame {
        Frame::new(Arc::new(RacyIncrement), Box::new(IncLocals { tmp: 0 }))
    }

    fn atomic_entry() -> Frame {
        Frame::new(Arc::new(AtomicIncrement), Box::new(Unit))
    }

    /// Two processes each doing a read/yield/write increment.
    pub fn two_increments() -> CounterProgram {
        CounterProgram {
            entries: vec![racy_entry, racy_entry],
        }
    }

    /// Two processes each doing one atomic increment. Both interleavings end
    /// in the same state.
    pub fn atomic_increments() -> CounterProgram {
        CounterProgram {
            entries: vec![atomic_entry, atomic_entry],
        }
    }

    pub fn chooser() -> CounterProgram {
        CounterProgram {
            entries: vec![|| Frame::new(Arc::new(ChooseAdd), Box::new(Unit))],
        }
    }

    pub fn spinner() -> CounterProgram {
        CounterProgram {
            entries: vec![|| Frame::new(Arc::new(Spin), Box::new(Unit))],
        }
    }

    pub fn forever_blocked() -> CounterProgram {
        CounterProgram {
            entries: vec![|| {
                Frame::new(Arc::new(WaitForever { valid_end: false }), Box::new(Unit))
            }],
        }
    }

    pub fn blocked_at_end_state() -> CounterProgram {
        CounterProgram {
            entries: vec![|| {
                Frame::new(Arc::new(WaitForever { valid_end: true }), Box::new(Unit))
            }],
        }
    }

    pub fn spawner() -> CounterProgram {
        CounterProgram {
            entries: vec![|| Frame::new(Arc::new(SpawnOne), Box::new(Unit))],
        }
    }
}

/// A program that builds and rewires a small linked structure on the heap.
pub mod list {
    use super::cell::Cell;
    use super::*;

    #[derive(Clone, Debug)]
    pub struct ListGlobals {
        pub head: Pointer,
    }

    impl GlobalsRecord for ListGlobals {
        fn boxed_clone(&self) -> Box<dyn GlobalsRecord> {
            Box::new(self.clone())
        }
        fn write_to(&self, w: &mut StateWriter<'_>) {
            w.write_ref(self.head);
        }
        fn traverse(&self, v: &mut dyn FieldVisitor) {
            v.visit_ref(0, self.head);
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    /// Block 0 allocates A as the head. Block 1 allocates B pointing at A and
    /// makes it the head. Block 2 allocates C and points B at it instead,
    /// leaving A garbage. Block 3 returns.
    struct BuildRewire;

    impl MethodCode for BuildRewire {
        fn name(&self) -> &'static str {
            "build_rewire"
        }
        fn dispatch(&self, data: &mut FrameData, m: &mut Machine<'_>) -> BlockResult {
            match data.block {
                0 => {
                    let a = m.alloc(Box::new(Cell {
                        value: 1,
                        next: Pointer::NULL,
                    }));
                    m.globals_mut::<ListGlobals>().head = a;
                    BlockResult::Yield(1)
                }
                1 => {
                    let a = m.globals::<ListGlobals>().head;
                    let b = m.alloc(Box::new(Cell { value: 2, next: a }));
                    m.globals_mut::<ListGlobals>().head = b;
                    BlockResult::Yield(2)
                }
                2 => {
                    let c = m.alloc(Box::new(Cell {
                        value: 3,
                        next: Pointer::NULL,
                    }));
                    let b = m.globals::<ListGlobals>().head;
                    match m.load_mut(b) {
                        Ok(elem) => {
                            elem.as_any_mut().downcast_mut::<Cell>().unwrap().next = c;
                            BlockResult::Yield(3)
                        }
                        Err(fault) => BlockResult::Raise(fault),
                    }
                }
                _ => BlockResult::Return,
            }
        }
    }

    pub struct ListProgram;

    impl CompiledProgram for ListProgram {
        fn globals(&self) -> Box<dyn GlobalsRecord> {
            Box::new(ListGlobals {
                head: Pointer::NULL,
            })
        }
        fn entry_points(&self) -> Vec<Frame> {
            vec![Frame::new(Arc::new(BuildRewire), Box::new(Unit))]
        }
    }
}

/// Builds the same two-cell structure with either allocation order, so two
/// runs differ in raw pointer values but not in heap shape.
pub mod alloc_order {
    use super::cell::Cell;
    use super::list::ListGlobals;
    use super::*;

    struct PairAlloc {
        reversed: bool,
    }

    impl MethodCode for PairAlloc {
        fn name(&self) -> &'static str {
            "pair_alloc"
        }
        fn dispatch(&self, _data: &mut FrameData, m: &mut Machine<'_>) -> BlockResult {
            let (x, y);
            if self.reversed {
                // Burn a slot so the pair lands at different raw indices.
                let scratch = m.alloc(Box::new(Cell {
                    value: 0,
                    next: Pointer::NULL,
                }));
                y = m.alloc(Box::new(Cell {
                    value: 2,
                    next: Pointer::NULL,
                }));
                x = m.alloc(Box::new(Cell { value: 1, next: y }));
                let _ = scratch; // freed by the next traversal: unreachable
            } else {
                x = m.alloc(Box::new(Cell {
                    value: 1,
                    next: Pointer::NULL,
                }));
                y = m.alloc(Box::new(Cell {
                    value: 2,
                    next: Pointer::NULL,
                }));
                match m.load_mut(x) {
                    Ok(elem) => elem.as_any_mut().downcast_mut::<Cell>().unwrap().next = y,
                    Err(fault) => return BlockResult::Raise(fault),
                }
            }
            m.globals_mut::<ListGlobals>().head = x;
            BlockResult::Return
        }
    }

    pub struct PairProgram {
        pub reversed: bool,
    }

    impl CompiledProgram for PairProgram {
        fn globals(&self) -> Box<dyn GlobalsRecord> {
            Box::new(ListGlobals {
                head: Pointer::NULL,
            })
        }
        fn entry_points(&self) -> Vec<Frame> {
            vec![Frame::new(
                Arc::new(PairAlloc {
                    reversed: self.reversed,
                }),
                Box::new(Unit),
            )]
        }
    }
}
