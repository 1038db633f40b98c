//! Cooperative scheduling: events, the ready queue, and trigger dispatch.
//!
//! The scheduler owns who runs next; it never touches how a task runs. Tasks
//! are plain heap values, so the queues survive collection by marking. An
//! event may be bound to an interrupt line, in which case raising that line
//! signals the event at the next poll, from wherever the interrupt came.
use std::collections::VecDeque;

use crate::arch::{InterruptLine, MAX_LINES};
use crate::heap::Heap;
use crate::object::{HeapObj, ObjRef, Tracer};
use crate::tagged::Value;
use crate::vector::{ValueVec, VecId};

/// A one-shot wait flag with a queue of blocked tasks. Setting it releases
/// every waiter; once set, later waits pass straight through until cleared.
#[derive(Clone, Copy)]
pub struct Event {
    signalled: bool,
    queue: ValueVec,
    trigger: i32,
}

impl Event {
    pub fn new() -> Self {
        Self {
            signalled: false,
            queue: ValueVec::unallocated(),
            trigger: -1,
        }
    }

    pub fn is_set(&self) -> bool {
        self.signalled
    }

    /// The interrupt line bound to this event, if any.
    pub fn trigger(&self) -> Option<u32> {
        if self.trigger < 0 { None } else { Some(self.trigger as u32) }
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

impl HeapObj for Event {
    fn visit_edges(&self, t: &mut Tracer<'_>) {
        t.visit_vec(self.queue);
    }

    fn owned_vec(&self) -> Option<VecId> {
        self.queue.id()
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

pub struct Scheduler {
    ready: VecDeque<Value>,
    triggers: [Value; MAX_LINES as usize],
    current: Value,
    line: InterruptLine,
    /// Tasks blocked on trigger-bound events; keeps the loop alive while
    /// nothing is runnable but an interrupt may still deliver work.
    blocked: u32,
}

impl Scheduler {
    pub fn new(line: InterruptLine) -> Self {
        Self {
            ready: VecDeque::new(),
            triggers: [Value::NIL; MAX_LINES as usize],
            current: Value::NIL,
            line,
            blocked: 0,
        }
    }

    pub fn line(&self) -> &InterruptLine {
        &self.line
    }

    pub fn current(&self) -> Value {
        self.current
    }

    pub fn set_current(&mut self, v: Value) {
        self.current = v;
    }

    pub fn take_current(&mut self) -> Value {
        self.current.take()
    }

    pub fn ready_push(&mut self, v: Value) {
        debug_assert!(!v.is_nil());
        self.ready.push_back(v);
    }

    pub fn ready_pull(&mut self) -> Value {
        self.ready.pop_front().unwrap_or(Value::NIL)
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    pub fn ready_peek(&self, i: usize) -> Value {
        self.ready.get(i).copied().unwrap_or(Value::NIL)
    }

    pub fn blocked(&self) -> u32 {
        self.blocked
    }

    /// Bind an event to a free interrupt line. Line 0 stays reserved for
    /// plain inner loop exits.
    pub fn event_reg(&mut self, heap: &mut Heap, ev: ObjRef) -> Option<u32> {
        for id in 1..MAX_LINES as usize {
            if self.triggers[id].is_nil() {
                self.triggers[id] = Value::obj(ev);
                let e = heap.get_mut::<Event>(ev).expect("not an event");
                e.trigger = id as i32;
                // waiters parked before the binding count from now on
                self.blocked += e.queue.fill();
                return Some(id as u32);
            }
        }
        log::warn!("no free interrupt line for event #{}", ev.index());
        None
    }

    /// Unbind and signal, so nothing stays parked on a dead line.
    pub fn event_dereg(&mut self, heap: &mut Heap, ev: ObjRef) {
        let e = *heap.get::<Event>(ev).expect("not an event");
        if let Some(id) = e.trigger() {
            debug_assert_eq!(self.triggers[id as usize].as_obj(), Some(ev));
            self.triggers[id as usize] = Value::NIL;
            // still bound while signalling, so the blocked count is repaid
            self.event_set(heap, ev);
            heap.get_mut::<Event>(ev).expect("not an event").trigger = -1;
        }
    }

    /// Signal the event, moving its waiters to the head of the ready queue
    /// in their waiting order. Returns how many were released.
    pub fn event_set(&mut self, heap: &mut Heap, ev: ObjRef) -> u32 {
        let mut e = *heap.get::<Event>(ev).expect("not an event");
        e.signalled = true;
        let n = e.queue.fill();
        for i in (0..n).rev() {
            self.ready.push_front(heap.vec_get(e.queue, i));
        }
        if e.trigger >= 0 {
            debug_assert!(self.blocked >= n);
            self.blocked -= n;
        }
        heap.vec_truncate(&mut e.queue, 0);
        *heap.get_mut::<Event>(ev).expect("not an event") = e;
        n
    }

    pub fn event_clear(&mut self, heap: &mut Heap, ev: ObjRef) {
        heap.get_mut::<Event>(ev).expect("not an event").signalled = false;
    }

    /// Park the current task on the event, unless it is already set. The
    /// caller loses the processor either way once this returns true.
    pub fn event_wait(&mut self, heap: &mut Heap, ev: ObjRef) -> bool {
        let mut e = *heap.get::<Event>(ev).expect("not an event");
        if e.signalled {
            return false; // nothing to wait for
        }
        debug_assert!(!self.current.is_nil(), "wait outside a running task");
        let cur = self.current.take();
        if !heap.vec_push(&mut e.queue, cur) {
            // the queue could not grow; the task keeps the processor
            self.current = cur;
            return false;
        }
        if e.trigger >= 0 {
            self.blocked += 1;
        }
        *heap.get_mut::<Event>(ev).expect("not an event") = e;
        self.line.raise(0);
        true
    }

    /// Drain the interrupt word and signal every event bound to a raised
    /// line. Returns how many tasks were released to the ready queue.
    pub fn poll(&mut self, heap: &mut Heap) -> u32 {
        let mut flags = self.line.take_all();
        if flags == 0 {
            return 0;
        }
        let mut released = 0;
        for id in 1..MAX_LINES as usize {
            if flags >> id == 0 {
                break;
            }
            if flags & (1 << id) != 0 {
                flags &= !(1 << id);
                if let Some(ev) = self.triggers[id].as_obj() {
                    released += self.event_set(heap, ev);
                }
            }
        }
        released
    }

    /// Anything left to do, now or after a future interrupt.
    pub fn is_alive(&self) -> bool {
        !self.current.is_nil()
            || self.line.peek() != 0
            || !self.ready.is_empty()
            || self.blocked > 0
    }

    /// Hand every scheduling root to the collector.
    pub fn mark_roots(&self, heap: &mut Heap) {
        heap.mark(self.current);
        for v in &self.ready {
            heap.mark(*v);
        }
        for v in &self.triggers {
            heap.mark(*v);
        }
    }
}
