//! Execution contexts: call frames living entirely inside one heap vector.
//!
//! A context owns a single value vector holding every active frame. Each
//! frame starts with a fixed header, then the callee's fast slots, then room
//! for its exception records, and the value stack grows above that. Because
//! all of it is ordinary heap data, a context survives collection while
//! suspended and costs nothing on the host stack.
//!
//! Frame layout, cell offsets relative to the frame base:
//!
//! ```text
//! 0 prev    base of the caller's frame, -1 in the outermost frame
//! 1 sp      caller's saved stack index
//! 2 ip      caller's saved instruction index
//! 3 callee  caller's callable
//! 4 ep      number of active exception records
//! 5 result  pending return value, nil unless set
//! 6 ..      fast slots, then exception records, then the value stack
//! ```
use crate::arch::InterruptLine;
use crate::heap::Heap;
use crate::object::{Callable, HeapObj, ObjRef, Tracer};
use crate::tagged::Value;
use crate::vector::{ValueVec, VecId};

pub const FRAME_HDR: u32 = 6;
/// Cells per exception record: tagged ip, saved sp, spare, default value.
pub const EXC_STEP: u32 = 4;
/// Marks an exception record as a finally handler.
pub const FINALLY: i32 = 1 << 24;

const F_PREV: u32 = 0;
const F_SP: u32 = 1;
const F_IP: u32 = 2;
const F_CALLEE: u32 = 3;
const F_EP: u32 = 4;
const F_RESULT: u32 = 5;

#[derive(Clone, Copy)]
pub struct Context {
    vv: ValueVec,
    base: i32,
    sp_off: i32,
    ip_off: u32,
    callee: Value,
    event: Value,
    caller: Value,
    transfer: Value,
}

impl Context {
    pub fn new() -> Self {
        Self {
            vv: ValueVec::unallocated(),
            base: -1,
            sp_off: -1,
            ip_off: 0,
            callee: Value::NIL,
            event: Value::NIL,
            caller: Value::NIL,
            transfer: Value::NIL,
        }
    }

    fn of(heap: &Heap, me: ObjRef) -> Context {
        *heap.get::<Context>(me).expect("not a context")
    }

    fn store(heap: &mut Heap, me: ObjRef, c: Context) {
        *heap.get_mut::<Context>(me).expect("not a context") = c;
    }

    fn shape(heap: &Heap, callee: Value) -> (u32, u32) {
        let r = callee.as_obj().expect("callee is not an object");
        let cb = heap.get::<Callable>(r).expect("callee is not callable");
        (cb.frame_size as u32, cb.exc_level as u32)
    }

    /// True while at least one frame is active.
    pub fn is_active(heap: &Heap, me: ObjRef) -> bool {
        Self::of(heap, me).base >= 0
    }

    /// Push a new frame for `callee`. Fails only when the arena cannot hold
    /// the frame, leaving the context unchanged.
    pub fn enter(heap: &mut Heap, me: ObjRef, callee: ObjRef) -> bool {
        let cb = heap.get::<Callable>(callee).expect("not a callable");
        let (fs, el) = (cb.frame_size as u32, cb.exc_level as u32);
        let mut c = Self::of(heap, me);
        let span = FRAME_HDR + fs + EXC_STEP * el;
        let b = c.vv.fill();
        if !heap.vec_resize(&mut c.vv, (b + span) * 4) {
            return false;
        }
        c.vv.set_fill(b + span);
        heap.vec_set(c.vv, b + F_PREV, Value::int(c.base));
        heap.vec_set(c.vv, b + F_SP, Value::int(c.sp_off));
        heap.vec_set(c.vv, b + F_IP, Value::int(c.ip_off as i32));
        heap.vec_set(c.vv, b + F_CALLEE, c.callee);
        heap.vec_set(c.vv, b + F_EP, Value::int(0));
        heap.vec_set(c.vv, b + F_RESULT, Value::NIL);
        c.base = b as i32;
        c.sp_off = (b + span) as i32 - 1; // stack starts out empty
        c.ip_off = 0;
        c.callee = Value::obj(callee);
        Self::store(heap, me, c);
        true
    }

    /// Pop the current frame. The stored result cell wins over `v` when set.
    /// The second return is true when this was the outermost frame.
    pub fn leave(heap: &mut Heap, me: ObjRef, v: Value) -> (Value, bool) {
        let mut c = Self::of(heap, me);
        debug_assert!(c.base >= 0, "leave without an active frame");
        let b = c.base as u32;
        let mut r = heap.vec_get(c.vv, b + F_RESULT);
        if r.is_nil() {
            r = v;
        }
        let prev = heap.vec_get(c.vv, b + F_PREV).as_int();
        let finished = prev < 0;
        if finished {
            heap.vec_truncate(&mut c.vv, 0);
            c.base = -1;
            c.sp_off = -1;
            c.ip_off = 0;
            c.callee = Value::NIL;
        } else {
            c.sp_off = heap.vec_get(c.vv, b + F_SP).as_int();
            c.ip_off = heap.vec_get(c.vv, b + F_IP).as_int() as u32;
            c.callee = heap.vec_get(c.vv, b + F_CALLEE);
            heap.vec_truncate(&mut c.vv, b);
            c.base = prev;
        }
        Self::store(heap, me, c);
        (r, finished)
    }

    pub fn fast_slot(heap: &Heap, me: ObjRef, i: u32) -> Value {
        let c = Self::of(heap, me);
        heap.vec_get(c.vv, c.base as u32 + FRAME_HDR + i)
    }

    pub fn set_fast_slot(heap: &mut Heap, me: ObjRef, i: u32, v: Value) {
        let c = Self::of(heap, me);
        heap.vec_set(c.vv, c.base as u32 + FRAME_HDR + i, v);
    }

    pub fn push(heap: &mut Heap, me: ObjRef, v: Value) -> bool {
        let mut c = Self::of(heap, me);
        c.sp_off += 1;
        let at = c.sp_off as u32;
        if at < c.vv.fill() {
            heap.vec_set(c.vv, at, v);
        } else if !heap.vec_push(&mut c.vv, v) {
            return false;
        }
        Self::store(heap, me, c);
        true
    }

    pub fn pop(heap: &mut Heap, me: ObjRef) -> Value {
        let mut c = Self::of(heap, me);
        debug_assert!(c.sp_off >= 0, "pop from empty stack");
        let at = c.sp_off as u32;
        let v = heap.vec_get(c.vv, at);
        heap.vec_set(c.vv, at, Value::NIL); // don't retain popped values
        c.sp_off -= 1;
        Self::store(heap, me, c);
        v
    }

    pub fn sp(heap: &Heap, me: ObjRef) -> i32 {
        Self::of(heap, me).sp_off
    }

    pub fn ip(heap: &Heap, me: ObjRef) -> u32 {
        Self::of(heap, me).ip_off
    }

    pub fn set_ip(heap: &mut Heap, me: ObjRef, ip: u32) {
        heap.get_mut::<Context>(me).expect("not a context").ip_off = ip;
    }

    /// Stash a return value in the frame, to be delivered at `leave`.
    pub fn set_result(heap: &mut Heap, me: ObjRef, v: Value) {
        let c = Self::of(heap, me);
        heap.vec_set(c.vv, c.base as u32 + F_RESULT, v);
    }

    /// Cell index of an exception record, bumping the record count by
    /// `incr`. With `incr <= 0` the record below the count is addressed.
    fn exc_base(heap: &mut Heap, me: ObjRef, incr: i32) -> u32 {
        let c = Self::of(heap, me);
        let (fs, el) = Self::shape(heap, c.callee);
        let b = c.base as u32;
        let mut ep = heap.vec_get(c.vv, b + F_EP).as_int();
        debug_assert!(0 <= ep + incr && ep + incr <= el as i32, "exception depth out of range");
        heap.vec_set(c.vv, b + F_EP, Value::int(ep + incr));
        if incr <= 0 {
            ep -= 1;
        }
        b + FRAME_HDR + fs + EXC_STEP * ep as u32
    }

    /// Arm an exception handler: control resumes at `catch_ip` with the
    /// stack cut back to its current height.
    pub fn exc_enter(heap: &mut Heap, me: ObjRef, catch_ip: u32, finally: bool) {
        let rec = Self::exc_base(heap, me, 1);
        let c = Self::of(heap, me);
        let mut tag = catch_ip as i32;
        if finally {
            tag |= FINALLY;
        }
        heap.vec_set(c.vv, rec, Value::int(tag));
        heap.vec_set(c.vv, rec + 1, Value::int(c.sp_off));
    }

    /// Disarm the innermost handler.
    pub fn exc_leave(heap: &mut Heap, me: ObjRef) {
        Self::exc_base(heap, me, -1);
    }

    /// Raise on this context. A small-int value triggers the matching soft
    /// interrupt and is safe from interrupt handlers; anything else becomes
    /// the pending event and forces an inner loop exit through line 0.
    pub fn raise(heap: &mut Heap, me: ObjRef, v: Value, line: &InterruptLine) {
        if v.is_int() {
            line.raise(v.as_int() as u32);
        } else {
            heap.get_mut::<Context>(me).expect("not a context").event = v;
            line.raise(0);
        }
    }

    /// The event raised on this context, nil if none.
    pub fn pending_event(heap: &Heap, me: ObjRef) -> Value {
        Self::of(heap, me).event
    }

    /// Dispatch the pending event to the innermost armed handler: restore
    /// ip and sp from its record and push the event. Returns false when
    /// there was no event, or no handler, leaving the event pending in the
    /// latter case so an outer frame can deal with it.
    pub fn caught(heap: &mut Heap, me: ObjRef) -> bool {
        let mut c = Self::of(heap, me);
        let e = c.event.take();
        if e.is_nil() {
            return false; // just an inner loop exit
        }
        let b = c.base as u32;
        let ep = heap.vec_get(c.vv, b + F_EP).as_int();
        if ep <= 0 {
            c.event = e; // no handler armed, keep it pending
            Self::store(heap, me, c);
            return false;
        }
        let (fs, _) = Self::shape(heap, c.callee);
        let rec = b + FRAME_HDR + fs + EXC_STEP * (ep as u32 - 1);
        c.ip_off = (heap.vec_get(c.vv, rec).as_int() & !FINALLY) as u32;
        let sp = heap.vec_get(c.vv, rec + 1).as_int();
        heap.vec_truncate(&mut c.vv, (sp + 1) as u32);
        c.sp_off = sp;
        Self::store(heap, me, c);
        let ok = Self::push(heap, me, e);
        debug_assert!(ok);
        true
    }

    pub fn caller(heap: &Heap, me: ObjRef) -> Value {
        Self::of(heap, me).caller
    }

    pub fn set_caller(heap: &mut Heap, me: ObjRef, v: Value) {
        heap.get_mut::<Context>(me).expect("not a context").caller = v;
    }

    /// Value handed over when this context is resumed.
    pub fn take_transfer(heap: &mut Heap, me: ObjRef) -> Value {
        heap.get_mut::<Context>(me).expect("not a context").transfer.take()
    }

    pub fn set_transfer(heap: &mut Heap, me: ObjRef, v: Value) {
        heap.get_mut::<Context>(me).expect("not a context").transfer = v;
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl HeapObj for Context {
    fn visit_edges(&self, t: &mut Tracer<'_>) {
        t.visit_vec(self.vv);
        t.visit(self.callee);
        t.visit(self.event);
        t.visit(self.caller);
        t.visit(self.transfer);
    }

    fn owned_vec(&self) -> Option<VecId> {
        self.vv.id()
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod context_tests {
    use super::*;

    fn fixture(fs: u16, el: u8) -> (Heap, ObjRef, ObjRef) {
        let mut h = Heap::new(512);
        let cb = h.alloc(Callable::new(fs, el));
        let ctx = h.alloc(Context::new());
        (h, ctx, cb)
    }

    #[test]
    fn enter_sets_up_an_empty_frame() {
        let (mut h, ctx, cb) = fixture(3, 1);
        assert!(!Context::is_active(&h, ctx));
        assert!(Context::enter(&mut h, ctx, cb));
        assert!(Context::is_active(&h, ctx));
        assert_eq!(Context::ip(&h, ctx), 0);
        for i in 0..3 {
            assert!(Context::fast_slot(&h, ctx, i).is_nil());
        }
        // stack is empty: sp sits just below the first stack cell
        let span = FRAME_HDR + 3 + EXC_STEP;
        assert_eq!(Context::sp(&h, ctx), span as i32 - 1);
    }

    #[test]
    fn nested_leave_restores_the_caller_frame() {
        let (mut h, ctx, cb) = fixture(2, 0);
        assert!(Context::enter(&mut h, ctx, cb));
        assert!(Context::push(&mut h, ctx, Value::int(11)));
        assert!(Context::push(&mut h, ctx, Value::int(22)));
        Context::set_ip(&mut h, ctx, 7);
        let outer_sp = Context::sp(&h, ctx);

        let inner = h.alloc(Callable::new(4, 0));
        assert!(Context::enter(&mut h, ctx, inner));
        assert_eq!(Context::ip(&h, ctx), 0);
        assert!(Context::push(&mut h, ctx, Value::int(99)));

        let (r, finished) = Context::leave(&mut h, ctx, Value::int(5));
        assert!(!finished);
        assert_eq!(r.as_int(), 5);
        assert_eq!(Context::ip(&h, ctx), 7);
        assert_eq!(Context::sp(&h, ctx), outer_sp);
        assert_eq!(Context::pop(&mut h, ctx).as_int(), 22);
        assert_eq!(Context::pop(&mut h, ctx).as_int(), 11);

        let (_, finished) = Context::leave(&mut h, ctx, Value::NIL);
        assert!(finished);
        assert!(!Context::is_active(&h, ctx));
    }

    #[test]
    fn result_cell_overrides_the_return_argument() {
        let (mut h, ctx, cb) = fixture(0, 0);
        assert!(Context::enter(&mut h, ctx, cb));
        Context::set_result(&mut h, ctx, Value::int(42));
        let (r, finished) = Context::leave(&mut h, ctx, Value::int(9));
        assert!(finished);
        assert_eq!(r.as_int(), 42, "frame result wins");
    }

    #[test]
    fn armed_handler_catches_a_raised_event() {
        let (mut h, ctx, cb) = fixture(1, 2);
        let line = InterruptLine::new();
        assert!(Context::enter(&mut h, ctx, cb));
        assert!(Context::push(&mut h, ctx, Value::int(1)));
        let sp = Context::sp(&h, ctx);
        Context::exc_enter(&mut h, ctx, 99, false);
        assert!(Context::push(&mut h, ctx, Value::int(2))); // clutter above the handler

        Context::raise(&mut h, ctx, Value::sym(7), &line);
        assert_eq!(line.take_all(), 1, "line 0 forces an inner loop exit");
        assert!(Context::caught(&mut h, ctx));
        assert_eq!(Context::ip(&h, ctx), 99);
        assert_eq!(Context::sp(&h, ctx), sp + 1, "stack cut back, event on top");
        assert_eq!(Context::pop(&mut h, ctx).as_sym(), Some(7));
        assert_eq!(Context::pop(&mut h, ctx).as_int(), 1, "cells below survive");
        assert!(Context::pending_event(&h, ctx).is_nil());
    }

    #[test]
    fn raising_an_int_is_a_soft_interrupt() {
        let (mut h, ctx, cb) = fixture(0, 1);
        let line = InterruptLine::new();
        assert!(Context::enter(&mut h, ctx, cb));
        Context::raise(&mut h, ctx, Value::int(3), &line);
        assert_eq!(line.take_all(), 1 << 3);
        assert!(Context::pending_event(&h, ctx).is_nil());
        assert!(!Context::caught(&mut h, ctx), "no event, just a loop exit");
    }

    #[test]
    fn event_stays_pending_without_a_handler() {
        let (mut h, ctx, cb) = fixture(0, 1);
        let line = InterruptLine::new();
        assert!(Context::enter(&mut h, ctx, cb));
        Context::raise(&mut h, ctx, Value::sym(5), &line);
        assert!(!Context::caught(&mut h, ctx));
        assert_eq!(Context::pending_event(&h, ctx).as_sym(), Some(5));
    }

    #[test]
    fn finally_tag_is_masked_off_the_resume_ip() {
        let (mut h, ctx, cb) = fixture(0, 1);
        let line = InterruptLine::new();
        assert!(Context::enter(&mut h, ctx, cb));
        Context::exc_enter(&mut h, ctx, 12, true);
        Context::raise(&mut h, ctx, Value::sym(1), &line);
        assert!(Context::caught(&mut h, ctx));
        assert_eq!(Context::ip(&h, ctx), 12);
    }

    #[test]
    fn disarmed_handler_no_longer_catches() {
        let (mut h, ctx, cb) = fixture(0, 1);
        let line = InterruptLine::new();
        assert!(Context::enter(&mut h, ctx, cb));
        Context::exc_enter(&mut h, ctx, 50, false);
        Context::exc_leave(&mut h, ctx);
        Context::raise(&mut h, ctx, Value::sym(2), &line);
        assert!(!Context::caught(&mut h, ctx));
    }

    #[test]
    fn stack_and_callee_survive_collection() {
        let (mut h, ctx, cb) = fixture(2, 0);
        assert!(Context::enter(&mut h, ctx, cb));
        let extra = h.alloc(Callable::new(1, 0));
        assert!(Context::push(&mut h, ctx, Value::obj(extra)));

        h.mark(Value::obj(ctx));
        h.sweep();
        h.compact();

        assert!(h.is_live(cb), "callee reached through the frame header");
        assert!(h.is_live(extra), "stack cell reached through the vector");
        assert_eq!(Context::pop(&mut h, ctx).as_obj(), Some(extra));
    }

    #[test]
    fn finished_context_releases_its_vector() {
        let (mut h, ctx, cb) = fixture(4, 2);
        assert!(Context::enter(&mut h, ctx, cb));
        assert!(h.stats().curr_vecs >= 1);
        let (_, finished) = Context::leave(&mut h, ctx, Value::NIL);
        assert!(finished);
        assert_eq!(h.stats().curr_vecs, 0);
    }
}
