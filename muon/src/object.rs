//! Heap object protocol.
//!
//! Everything stored in an object slot is a `Box<dyn HeapObj>`. The trait has
//! exactly two runtime duties: report outgoing references during marking and
//! report an owned vector so its payload can be reclaimed with the object.
//! Typed access goes through `as_any`, keyed on the concrete type.
use std::any::Any;

use crate::tagged::Value;
use crate::vector::{ValueVec, VecId, VecRegion};

/// Index of an object slot in the object region. Stable for the lifetime of
/// the object: compaction moves vector payloads, never object slots.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct ObjRef(pub(crate) u32);

impl ObjRef {
    #[inline]
    pub fn index(self) -> u32 {
        self.0
    }
}

/// Collects the reference edges of one object during marking. Pushes onto the
/// shared worklist instead of recursing, so arbitrarily deep object graphs
/// mark in constant stack space.
pub struct Tracer<'a> {
    vecs: &'a VecRegion,
    stack: &'a mut Vec<Value>,
}

impl<'a> Tracer<'a> {
    pub(crate) fn new(vecs: &'a VecRegion, stack: &'a mut Vec<Value>) -> Self {
        Self { vecs, stack }
    }

    #[inline]
    pub fn visit(&mut self, v: Value) {
        if v.is_obj() {
            self.stack.push(v);
        }
    }

    /// Visit every filled cell of a value vector.
    pub fn visit_vec(&mut self, vv: ValueVec) {
        let vecs = self.vecs;
        for i in 0..vv.fill() {
            let v = vecs.get(vv, i);
            if v.is_obj() {
                self.stack.push(v);
            }
        }
    }
}

pub trait HeapObj: Any {
    /// Report every object reference held by this object.
    fn visit_edges(&self, t: &mut Tracer<'_>);

    /// The vector whose payload this object owns, if any. Freed together
    /// with the object and relocated on its behalf during compaction.
    fn owned_vec(&self) -> Option<VecId> {
        None
    }

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Shape of an invocable: how many fast slots its frame carries and how many
/// nested exception handlers it may enter.
pub struct Callable {
    pub frame_size: u16,
    pub exc_level: u8,
}

impl Callable {
    pub fn new(frame_size: u16, exc_level: u8) -> Self {
        Self { frame_size, exc_level }
    }
}

impl HeapObj for Callable {
    fn visit_edges(&self, _t: &mut Tracer<'_>) {}

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Growable sequence of values, payload in the vector region.
pub struct Array {
    pub(crate) vv: ValueVec,
}

impl Array {
    pub fn new() -> Self {
        Self { vv: ValueVec::unallocated() }
    }

    pub fn len(&self) -> u32 {
        self.vv.fill()
    }

    pub fn is_empty(&self) -> bool {
        self.vv.fill() == 0
    }
}

impl Default for Array {
    fn default() -> Self {
        Self::new()
    }
}

impl HeapObj for Array {
    fn visit_edges(&self, t: &mut Tracer<'_>) {
        t.visit_vec(self.vv);
    }

    fn owned_vec(&self) -> Option<VecId> {
        self.vv.id()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
