//! The virtual machine: ties the heap and scheduler together and drives
//! stacklets through the interrupt-aware run loop.
//!
//! A stacklet is the schedulable unit: a context chain plus the runner that
//! advances it. Runners are stepped between safe points; collection only
//! happens at the outer loop, so a runner never sees the heap shift under
//! its feet mid-step.
use crate::arch::InterruptLine;
use crate::context::Context;
use crate::heap::Heap;
use crate::object::{HeapObj, ObjRef, Tracer};
use crate::scheduler::Scheduler;
use crate::tagged::Value;

/// Advances a stacklet by one bounded slice of work. Returning false means
/// the stacklet is finished. Runners live outside the arena and must not
/// hold unpinned object references across steps.
pub trait Runner: 'static {
    fn step(&mut self, vm: &mut Vm, me: ObjRef) -> bool;
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StackletState {
    Ready,
    Running,
    Blocked,
    Done,
}

pub struct Stacklet {
    /// Innermost active context; swapped on generator resume.
    pub ctx: Value,
    pub state: StackletState,
    runner: Option<Box<dyn Runner>>,
}

impl HeapObj for Stacklet {
    fn visit_edges(&self, t: &mut Tracer<'_>) {
        t.visit(self.ctx);
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

pub struct Vm {
    pub heap: Heap,
    pub sched: Scheduler,
    roots: Vec<Value>,
}

impl Vm {
    pub fn new(units: u32, line: InterruptLine) -> Self {
        Self {
            heap: Heap::new(units),
            sched: Scheduler::new(line),
            roots: Vec::new(),
        }
    }

    /// Create a stacklet with an initial frame for `callee` and queue it.
    pub fn spawn(&mut self, callee: ObjRef, runner: Box<dyn Runner>) -> ObjRef {
        let ctx = self.heap.alloc(Context::new());
        if !Context::enter(&mut self.heap, ctx, callee) {
            panic!("arena out of memory");
        }
        let s = self.heap.alloc(Stacklet {
            ctx: Value::obj(ctx),
            state: StackletState::Ready,
            runner: Some(runner),
        });
        self.sched.ready_push(Value::obj(s));
        log::debug!("spawned stacklet #{}", s.index());
        s
    }

    /// Keep a value alive across collections, independent of the scheduler.
    pub fn pin(&mut self, v: Value) {
        self.roots.push(v);
    }

    pub fn unpin(&mut self, v: Value) {
        if let Some(i) = self.roots.iter().position(|r| *r == v) {
            self.roots.swap_remove(i);
        }
    }

    /// Mark from every root the machine knows about, then sweep and compact.
    pub fn gc_all(&mut self) {
        log::debug!("gc: full collection");
        self.sched.mark_roots(&mut self.heap);
        for v in &self.roots {
            self.heap.mark(*v);
        }
        self.heap.sweep();
        self.heap.compact();
    }

    pub fn is_alive(&self) -> bool {
        self.sched.is_alive()
    }

    /// The context the current stacklet is executing, if any.
    pub fn current_context(&self) -> Option<ObjRef> {
        let s = self.sched.current().as_obj()?;
        self.heap.get::<Stacklet>(s)?.ctx.as_obj()
    }

    /// Block the current stacklet on `ev` unless it is already set.
    pub fn wait_on(&mut self, ev: ObjRef) {
        let cur = self.sched.current();
        if self.sched.event_wait(&mut self.heap, ev) {
            if let Some(s) = cur.as_obj() {
                if let Some(st) = self.heap.get_mut::<Stacklet>(s) {
                    st.state = StackletState::Blocked;
                }
            }
        }
    }

    /// Signal `ev`, waking its waiters ahead of everything else queued.
    pub fn notify(&mut self, ev: ObjRef) {
        let n = self.sched.event_set(&mut self.heap, ev);
        self.woke(n);
    }

    fn woke(&mut self, n: u32) {
        for i in 0..n as usize {
            if let Some(s) = self.sched.ready_peek(i).as_obj() {
                if let Some(st) = self.heap.get_mut::<Stacklet>(s) {
                    st.state = StackletState::Ready;
                }
            }
        }
    }

    /// Switch the current stacklet into `target`, so the suspended context
    /// becomes its caller and receives control back at `resume_caller`.
    pub fn resume(&mut self, target: ObjRef) {
        let cur = self.sched.current().as_obj().expect("resume outside a running stacklet");
        let prev = self.heap.get::<Stacklet>(cur).expect("not a stacklet").ctx;
        debug_assert!(Context::caller(&self.heap, target).is_nil(), "already resumed");
        Context::set_caller(&mut self.heap, target, prev);
        self.heap.get_mut::<Stacklet>(cur).expect("not a stacklet").ctx = Value::obj(target);
        self.sched.line().raise(0);
    }

    /// Hand `v` back to the caller context and make it current again. With
    /// no caller the value is dropped and the stacklet ends.
    pub fn resume_caller(&mut self, v: Value) {
        let cur = self.sched.current().as_obj().expect("no running stacklet");
        let ctx = self.heap.get::<Stacklet>(cur).expect("not a stacklet").ctx;
        let ctx = ctx.as_obj().expect("stacklet without a context");
        let caller = Context::caller(&self.heap, ctx);
        Context::set_caller(&mut self.heap, ctx, Value::NIL);
        if let Some(cr) = caller.as_obj() {
            Context::set_transfer(&mut self.heap, cr, v);
            self.heap.get_mut::<Stacklet>(cur).expect("not a stacklet").ctx = caller;
        } else {
            if !v.is_nil() {
                log::debug!("result lost: {:?}", v);
            }
            let s = self.heap.get_mut::<Stacklet>(cur).expect("not a stacklet");
            s.ctx = Value::NIL;
            s.state = StackletState::Done;
            self.sched.take_current();
        }
        self.sched.line().raise(0);
    }

    fn step(&mut self, me: ObjRef) -> bool {
        // take the runner out so it may borrow the vm freely
        let runner = self
            .heap
            .get_mut::<Stacklet>(me)
            .and_then(|s| s.runner.take());
        let Some(mut runner) = runner else {
            self.sched.take_current();
            return false;
        };
        let more = runner.step(self, me);
        if let Some(s) = self.heap.get_mut::<Stacklet>(me) {
            s.runner = Some(runner);
            if !more {
                s.state = StackletState::Done;
            }
        }
        if !more && self.sched.current().as_obj() == Some(me) {
            self.sched.take_current();
        }
        more
    }

    /// Run until nothing is ready. Each pass drains the interrupt word,
    /// dispatches trigger-bound events, then steps the next stacklet until
    /// it yields, blocks, or finishes. Returns true when parked work could
    /// still arrive through an interrupt.
    pub fn run_loop(&mut self) -> bool {
        loop {
            let released = self.sched.poll(&mut self.heap);
            self.woke(released);

            let cur = self.sched.ready_pull();
            if cur.is_nil() {
                break;
            }
            self.sched.set_current(cur);
            if let Some(s) = cur.as_obj() {
                if let Some(st) = self.heap.get_mut::<Stacklet>(s) {
                    st.state = StackletState::Running;
                }
            }

            loop {
                let Some(me) = self.sched.current().as_obj() else { break };
                if !self.step(me) || self.sched.line().peek() != 0 {
                    break;
                }
            }

            let cur = self.sched.take_current();
            if !cur.is_nil() {
                if let Some(s) = cur.as_obj() {
                    if let Some(st) = self.heap.get_mut::<Stacklet>(s) {
                        st.state = StackletState::Ready;
                    }
                }
                self.sched.ready_push(cur);
            }

            if self.heap.gc_check() {
                self.gc_all();
            }
        }
        self.sched.is_alive()
    }
}

#[cfg(test)]
mod vm_tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::object::Callable;
    use crate::scheduler::Event;

    type Log = Arc<Mutex<Vec<(u32, u32)>>>;

    fn vm() -> Vm {
        Vm::new(2048, InterruptLine::new())
    }

    fn callee(vm: &mut Vm) -> ObjRef {
        vm.heap.alloc(Callable::new(2, 1))
    }

    struct Count {
        id: u32,
        left: u32,
        yields: bool,
        log: Log,
    }

    impl Runner for Count {
        fn step(&mut self, vm: &mut Vm, _me: ObjRef) -> bool {
            if self.left == 0 {
                return false;
            }
            self.left -= 1;
            self.log.lock().push((self.id, self.left));
            if self.yields {
                vm.sched.line().raise(0);
            }
            true
        }
    }

    #[test]
    fn spawn_enters_the_initial_frame() {
        let mut vm = vm();
        let cb = callee(&mut vm);
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let s = vm.spawn(cb, Box::new(Count { id: 1, left: 0, yields: false, log }));
        let ctx = vm.heap.get::<Stacklet>(s).unwrap().ctx.as_obj().unwrap();
        assert!(Context::is_active(&vm.heap, ctx));
        assert_eq!(vm.heap.get::<Stacklet>(s).unwrap().state, StackletState::Ready);
    }

    #[test]
    fn run_loop_drives_a_stacklet_to_completion() {
        let mut vm = vm();
        let cb = callee(&mut vm);
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let s = vm.spawn(cb, Box::new(Count { id: 1, left: 3, yields: false, log: log.clone() }));

        assert!(!vm.run_loop(), "nothing left once the stacklet finishes");
        assert_eq!(log.lock().len(), 3);
        assert_eq!(vm.heap.get::<Stacklet>(s).unwrap().state, StackletState::Done);
        assert!(!vm.is_alive());
    }

    #[test]
    fn yielding_stacklets_round_robin() {
        let mut vm = vm();
        let cb = callee(&mut vm);
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        vm.spawn(cb, Box::new(Count { id: 1, left: 3, yields: true, log: log.clone() }));
        vm.spawn(cb, Box::new(Count { id: 2, left: 3, yields: true, log: log.clone() }));

        vm.run_loop();
        let ids: Vec<u32> = log.lock().iter().map(|e| e.0).collect();
        assert_eq!(ids, [1, 2, 1, 2, 1, 2], "yield after every step alternates");
    }

    #[test]
    fn non_yielding_stacklet_keeps_the_processor() {
        let mut vm = vm();
        let cb = callee(&mut vm);
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        vm.spawn(cb, Box::new(Count { id: 1, left: 3, yields: false, log: log.clone() }));
        vm.spawn(cb, Box::new(Count { id: 2, left: 3, yields: false, log: log.clone() }));

        vm.run_loop();
        let ids: Vec<u32> = log.lock().iter().map(|e| e.0).collect();
        assert_eq!(ids, [1, 1, 1, 2, 2, 2], "no pending bit, no preemption");
    }

    struct Consumer {
        ev: ObjRef,
        started: bool,
        log: Log,
    }

    impl Runner for Consumer {
        fn step(&mut self, vm: &mut Vm, _me: ObjRef) -> bool {
            if !self.started {
                self.started = true;
                if !vm.heap.get::<Event>(self.ev).unwrap().is_set() {
                    vm.wait_on(self.ev);
                    return true; // parked, stepped again after the signal
                }
            }
            self.log.lock().push((2, 0));
            false
        }
    }

    struct Producer {
        ev: ObjRef,
        log: Log,
    }

    impl Runner for Producer {
        fn step(&mut self, vm: &mut Vm, _me: ObjRef) -> bool {
            self.log.lock().push((1, 0));
            vm.notify(self.ev);
            false
        }
    }

    #[test]
    fn blocked_stacklet_wakes_on_notify() {
        let mut vm = vm();
        let cb = callee(&mut vm);
        let ev = vm.heap.alloc(Event::new());
        vm.pin(Value::obj(ev));
        let log: Log = Arc::new(Mutex::new(Vec::new()));

        let consumer = vm.spawn(cb, Box::new(Consumer { ev, started: false, log: log.clone() }));
        vm.spawn(cb, Box::new(Producer { ev, log: log.clone() }));

        assert!(!vm.run_loop());
        let ids: Vec<u32> = log.lock().iter().map(|e| e.0).collect();
        assert_eq!(ids, [1, 2], "consumer runs only after the producer signals");
        assert_eq!(
            vm.heap.get::<Stacklet>(consumer).unwrap().state,
            StackletState::Done
        );
    }

    #[test]
    fn trigger_wait_keeps_the_machine_alive() {
        let mut vm = vm();
        let cb = callee(&mut vm);
        let ev = vm.heap.alloc(Event::new());
        vm.pin(Value::obj(ev));
        let id = vm.sched.event_reg(&mut vm.heap, ev).unwrap();
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        vm.spawn(cb, Box::new(Consumer { ev, started: false, log: log.clone() }));

        assert!(vm.run_loop(), "parked on a trigger, an interrupt may deliver");
        assert!(log.lock().is_empty());

        // the interrupt arrives, as if from another thread
        vm.sched.line().raise(id);
        assert!(!vm.run_loop());
        assert_eq!(log.lock().len(), 1);
    }

    struct GenDance {
        target: ObjRef,
        phase: u32,
        log: Log,
    }

    impl Runner for GenDance {
        fn step(&mut self, vm: &mut Vm, me: ObjRef) -> bool {
            let ctx = vm.heap.get::<Stacklet>(me).unwrap().ctx.as_obj().unwrap();
            self.phase += 1;
            match self.phase {
                1 => {
                    vm.resume(self.target);
                    true
                }
                2 => {
                    // now running inside the generator context
                    assert_eq!(ctx, self.target);
                    vm.resume_caller(Value::int(42));
                    true
                }
                _ => {
                    let got = Context::take_transfer(&mut vm.heap, ctx);
                    self.log.lock().push((got.as_int() as u32, 0));
                    false
                }
            }
        }
    }

    #[test]
    fn generator_handoff_delivers_the_transfer_value() {
        let mut vm = vm();
        let cb = callee(&mut vm);
        let gen_ctx = vm.heap.alloc(Context::new());
        assert!(Context::enter(&mut vm.heap, gen_ctx, cb));
        vm.pin(Value::obj(gen_ctx));
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        vm.spawn(cb, Box::new(GenDance { target: gen_ctx, phase: 0, log: log.clone() }));

        assert!(!vm.run_loop());
        assert_eq!(log.lock().as_slice(), [(42, 0)]);
    }

    struct Churn {
        rounds: u32,
    }

    impl Runner for Churn {
        fn step(&mut self, vm: &mut Vm, me: ObjRef) -> bool {
            if self.rounds == 0 {
                return false;
            }
            self.rounds -= 1;
            // garbage that only the next collection can take back
            for _ in 0..8 {
                vm.heap.alloc(Callable::new(4, 0));
            }
            let ctx = vm.heap.get::<Stacklet>(me).unwrap().ctx.as_obj().unwrap();
            let ok = Context::push(&mut vm.heap, ctx, Value::int(self.rounds as i32));
            assert!(ok);
            vm.sched.line().raise(0); // reach the safe point every step
            true
        }
    }

    #[test]
    fn collection_runs_under_allocation_pressure() {
        let mut vm = Vm::new(256, InterruptLine::new());
        let cb = callee(&mut vm);
        let s = vm.spawn(cb, Box::new(Churn { rounds: 40 }));

        assert!(!vm.run_loop());
        assert!(vm.heap.stats().sweeps > 0, "pressure forced a collection");
        let ctx = vm.heap.get::<Stacklet>(s).unwrap().ctx.as_obj().unwrap();
        for n in 0..40 {
            assert_eq!(Context::pop(&mut vm.heap, ctx).as_int(), n);
        }
    }

    #[test]
    fn gc_all_spares_pins_and_queues_only() {
        let mut vm = vm();
        let cb = callee(&mut vm);
        let pinned = vm.heap.alloc(Callable::new(1, 0));
        vm.pin(Value::obj(pinned));
        let junk = vm.heap.alloc(Callable::new(1, 0));
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let s = vm.spawn(cb, Box::new(Count { id: 1, left: 1, yields: false, log }));

        vm.gc_all();
        assert!(vm.heap.is_live(pinned));
        assert!(vm.heap.is_live(s), "queued stacklet is a root");
        assert!(!vm.heap.is_live(junk));

        vm.unpin(Value::obj(pinned));
        vm.gc_all();
        assert!(!vm.heap.is_live(pinned));
    }
}
