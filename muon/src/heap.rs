//! Object region and the heap facade.
//!
//! Objects live in fixed slots at the high end of the arena, chained from the
//! low watermark up to a sentinel at the top. Slots never move; reclaimed
//! runs are recycled by a first-fit scan that coalesces neighbours lazily,
//! carving new objects from the high end of the first fitting run. When no
//! run fits, the watermark moves down toward the vector region; the two
//! watermarks meeting is the only out-of-memory condition.
use std::any::Any;

use bitflags::bitflags;

use crate::object::{HeapObj, ObjRef, Tracer};
use crate::tagged::Value;
use crate::vector::{ELEM, NONE, UNIT, ValueVec, VecRegion};

/// Called on any allocation failure in either region, with the size in bytes
/// of the failed request. The default panics; embedders replace it to count,
/// recover, or fall over their own way.
pub type OomHook = Box<dyn FnMut(u32)>;

bitflags! {
    #[derive(Copy, Clone, Default)]
    struct SlotFlags: u8 {
        const MARKED = 1;
    }
}

/// Allocation and collection counters, in the spirit of a malloc stats page:
/// totals since startup, current levels, and high watermarks.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GcStats {
    pub checks: u32,
    pub sweeps: u32,
    pub compacts: u32,
    pub total_objs: u32,
    pub curr_objs: u32,
    pub max_objs: u32,
    pub total_obj_bytes: u32,
    pub curr_obj_bytes: u32,
    pub max_obj_bytes: u32,
    pub total_vecs: u32,
    pub curr_vecs: u32,
    pub max_vecs: u32,
    pub total_vec_bytes: u32,
    pub curr_vec_bytes: u32,
    pub max_vec_bytes: u32,
}

impl GcStats {
    fn note_obj_alloc(&mut self, units: u32) {
        self.total_objs += 1;
        self.curr_objs += 1;
        if self.max_objs < self.curr_objs {
            self.max_objs = self.curr_objs;
        }
        self.total_obj_bytes += units * UNIT;
        self.curr_obj_bytes += units * UNIT;
        if self.max_obj_bytes < self.curr_obj_bytes {
            self.max_obj_bytes = self.curr_obj_bytes;
        }
    }

    fn note_obj_free(&mut self, units: u32) {
        self.curr_objs -= 1;
        self.curr_obj_bytes -= units * UNIT;
    }

    pub(crate) fn note_vec_alloc(&mut self) {
        self.total_vecs += 1;
        self.curr_vecs += 1;
        if self.max_vecs < self.curr_vecs {
            self.max_vecs = self.curr_vecs;
        }
    }

    pub(crate) fn note_vec_free(&mut self) {
        self.curr_vecs -= 1;
    }

    pub(crate) fn note_vec_bytes(&mut self, capas: u32, needs: u32) {
        if needs > capas {
            self.total_vec_bytes += (needs - capas) * UNIT;
            self.curr_vec_bytes += (needs - capas) * UNIT;
            if self.max_vec_bytes < self.curr_vec_bytes {
                self.max_vec_bytes = self.curr_vec_bytes;
            }
        } else {
            self.curr_vec_bytes -= (capas - needs) * UNIT;
        }
    }

    pub fn report(&self, free_bytes: u32) {
        log::info!(
            "gc: max {} b, {} checks, {} sweeps, {} compacts",
            free_bytes, self.checks, self.sweeps, self.compacts
        );
        log::info!(
            "gc: total {:6} objs {:8} b, {:6} vecs {:8} b",
            self.total_objs, self.total_obj_bytes, self.total_vecs, self.total_vec_bytes
        );
        log::info!(
            "gc:  curr {:6} objs {:8} b, {:6} vecs {:8} b",
            self.curr_objs, self.curr_obj_bytes, self.curr_vecs, self.curr_vec_bytes
        );
        log::info!(
            "gc:   max {:6} objs {:8} b, {:6} vecs {:8} b",
            self.max_objs, self.max_obj_bytes, self.max_vecs, self.max_vec_bytes
        );
    }
}

enum ObjCell {
    /// Interior of a run, or space below the watermark.
    Gap,
    /// Head of a free run; `chain` is the next run head, `NONE` only in the
    /// sentinel at the top of the arena.
    Free { chain: u32 },
    Used {
        chain: u32,
        flags: SlotFlags,
        body: Box<dyn HeapObj>,
    },
}

/// Slots needed for an object body of `sz` bytes, header included.
fn units_for(sz: usize) -> u32 {
    (sz as u32 + 4).div_ceil(UNIT)
}

struct ObjRegion {
    cells: Vec<ObjCell>,
    low: u32,
}

impl ObjRegion {
    fn new(units: u32) -> Self {
        assert!(units >= 2, "arena too small");
        let mut cells: Vec<ObjCell> = (0..units).map(|_| ObjCell::Gap).collect();
        cells[units as usize - 1] = ObjCell::Free { chain: NONE };
        Self { cells, low: units - 1 }
    }

    #[inline]
    fn low(&self) -> u32 {
        self.low
    }

    fn chain_of(&self, slot: u32) -> u32 {
        match self.cells[slot as usize] {
            ObjCell::Free { chain } => chain,
            ObjCell::Used { chain, .. } => chain,
            ObjCell::Gap => unreachable!("gap at run boundary {slot}"),
        }
    }

    fn set_chain(&mut self, slot: u32, to: u32) {
        match &mut self.cells[slot as usize] {
            ObjCell::Free { chain } => *chain = to,
            ObjCell::Used { chain, .. } => *chain = to,
            ObjCell::Gap => unreachable!(),
        }
    }

    fn is_free(&self, slot: u32) -> bool {
        matches!(self.cells[slot as usize], ObjCell::Free { .. })
    }

    /// Absorb every following free run into this one. Stops at the sentinel.
    fn merge_free(&mut self, slot: u32) {
        loop {
            let next = self.chain_of(slot);
            debug_assert!(next != NONE);
            match self.cells[next as usize] {
                ObjCell::Free { chain } if chain != NONE => {
                    self.cells[next as usize] = ObjCell::Gap;
                    self.set_chain(slot, chain);
                }
                _ => break,
            }
        }
    }

    /// First-fit scan with lazy coalescing, placing the object at the high
    /// end of the chosen run so the remaining free space keeps its head.
    fn alloc(
        &mut self,
        body: Box<dyn HeapObj>,
        needs: u32,
        vec_high: u32,
        stats: &mut GcStats,
    ) -> Option<ObjRef> {
        let mut slot = self.low;
        while self.chain_of(slot) != NONE {
            if self.is_free(slot) {
                self.merge_free(slot);
                let chain = self.chain_of(slot);
                let run = chain - slot;
                if run >= needs {
                    let at = chain - needs;
                    if run > needs {
                        self.set_chain(slot, at);
                    }
                    self.cells[at as usize] = ObjCell::Used {
                        chain,
                        flags: SlotFlags::empty(),
                        body,
                    };
                    stats.note_obj_alloc(needs);
                    return Some(ObjRef(at));
                }
            }
            slot = self.chain_of(slot);
        }
        if self.low - vec_high < needs {
            return None;
        }
        let at = self.low - needs;
        self.cells[at as usize] = ObjCell::Used {
            chain: self.low,
            flags: SlotFlags::empty(),
            body,
        };
        self.low = at;
        stats.note_obj_alloc(needs);
        Some(ObjRef(at))
    }

    /// Free the slot and hand back the body. Raises the watermark when the
    /// freed run sits at the bottom, cascading over merged neighbours.
    fn release(&mut self, r: ObjRef, stats: &mut GcStats) -> Box<dyn HeapObj> {
        let chain = self.chain_of(r.0);
        let old = std::mem::replace(&mut self.cells[r.0 as usize], ObjCell::Free { chain });
        let ObjCell::Used { body, .. } = old else {
            unreachable!("release of non-live slot {}", r.0);
        };
        stats.note_obj_free(chain - r.0);
        self.merge_free(r.0);
        if r.0 == self.low {
            self.low = self.chain_of(self.low);
        }
        body
    }

    fn body(&self, r: ObjRef) -> &dyn HeapObj {
        match &self.cells[r.0 as usize] {
            ObjCell::Used { body, .. } => body.as_ref(),
            _ => panic!("dead object #{}", r.0),
        }
    }

    fn body_mut(&mut self, r: ObjRef) -> &mut dyn HeapObj {
        match &mut self.cells[r.0 as usize] {
            ObjCell::Used { body, .. } => body.as_mut(),
            _ => panic!("dead object #{}", r.0),
        }
    }

    fn is_marked(&self, r: ObjRef) -> bool {
        match &self.cells[r.0 as usize] {
            ObjCell::Used { flags, .. } => flags.contains(SlotFlags::MARKED),
            _ => false,
        }
    }

    fn set_mark(&mut self, r: ObjRef) {
        if let ObjCell::Used { flags, .. } = &mut self.cells[r.0 as usize] {
            flags.insert(SlotFlags::MARKED);
        }
    }

    fn clear_mark(&mut self, slot: u32) {
        if let ObjCell::Used { flags, .. } = &mut self.cells[slot as usize] {
            flags.remove(SlotFlags::MARKED);
        }
    }
}

/// Both regions plus the marking worklist, behind one interface. All
/// allocation, typed access, and collection goes through here.
pub struct Heap {
    objs: ObjRegion,
    vecs: VecRegion,
    mark_stack: Vec<Value>,
    stats: GcStats,
    units: u32,
    oom: OomHook,
}

impl Heap {
    pub fn new(units: u32) -> Self {
        Self {
            objs: ObjRegion::new(units),
            vecs: VecRegion::new(units),
            mark_stack: Vec::new(),
            stats: GcStats::default(),
            units,
            oom: Box::new(|bytes| panic!("arena out of memory, {bytes} b requested")),
        }
    }

    /// Replace the out-of-memory callback. Failures in both regions report
    /// through it before the failing call returns.
    pub fn set_oom_hook(&mut self, hook: OomHook) {
        self.oom = hook;
    }

    /// Free bytes between the two watermarks.
    pub fn gc_max(&self) -> u32 {
        (self.objs.low() - self.vecs.high()) * UNIT
    }

    /// True when less than a quarter of the arena remains free.
    pub fn gc_check(&mut self) -> bool {
        self.stats.checks += 1;
        self.gc_max() < self.units * UNIT / 4
    }

    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    pub fn report(&self) {
        self.stats.report(self.gc_max());
    }

    /// Allocate, reporting failure through the out-of-memory hook and then
    /// returning `None` if the hook comes back.
    pub fn try_alloc<T: HeapObj>(&mut self, body: T) -> Option<ObjRef> {
        let needs = units_for(std::mem::size_of::<T>());
        let r = self
            .objs
            .alloc(Box::new(body), needs, self.vecs.high(), &mut self.stats);
        if r.is_none() {
            self.out_of_memory(needs * UNIT);
        }
        r
    }

    pub fn alloc<T: HeapObj>(&mut self, body: T) -> ObjRef {
        match self.try_alloc(body) {
            Some(r) => r,
            None => panic!("arena out of memory"),
        }
    }

    fn out_of_memory(&mut self, bytes: u32) {
        log::error!("arena exhausted, {} b requested, {} b free", bytes, self.gc_max());
        (self.oom)(bytes);
    }

    /// Free an object now, reclaiming any vector it owns.
    pub fn free(&mut self, r: ObjRef) {
        let body = self.objs.release(r, &mut self.stats);
        if let Some(id) = body.owned_vec() {
            self.vecs.release_id(id, &mut self.stats);
        }
    }

    pub fn is_live(&self, r: ObjRef) -> bool {
        matches!(self.objs.cells[r.0 as usize], ObjCell::Used { .. })
    }

    pub fn get<T: Any>(&self, r: ObjRef) -> Option<&T> {
        self.objs.body(r).as_any().downcast_ref()
    }

    pub fn get_mut<T: Any>(&mut self, r: ObjRef) -> Option<&mut T> {
        self.objs.body_mut(r).as_any_mut().downcast_mut()
    }

    /// Mark everything reachable from `root`. Iterative over the shared
    /// worklist; safe to call with already-marked or non-object roots.
    pub fn mark(&mut self, root: Value) {
        if root.is_obj() {
            self.mark_stack.push(root);
        }
        while let Some(v) = self.mark_stack.pop() {
            let Some(r) = v.as_obj() else { continue };
            if self.objs.is_marked(r) {
                continue;
            }
            self.objs.set_mark(r);
            let body = self.objs.body(r);
            let mut t = Tracer::new(&self.vecs, &mut self.mark_stack);
            body.visit_edges(&mut t);
        }
    }

    /// Walk the object chain, clearing marks on survivors and freeing the
    /// rest. The chain is re-read after each step, so freshly merged runs
    /// are skipped in the same pass.
    pub fn sweep(&mut self) {
        self.stats.sweeps += 1;
        let mut slot = self.objs.low();
        while slot != NONE {
            let marked = match &self.objs.cells[slot as usize] {
                ObjCell::Used { flags, .. } => Some(flags.contains(SlotFlags::MARKED)),
                ObjCell::Free { .. } => None,
                ObjCell::Gap => unreachable!("gap at run boundary {slot}"),
            };
            match marked {
                Some(true) => self.objs.clear_mark(slot),
                Some(false) => self.free(ObjRef(slot)),
                None => {}
            }
            slot = self.objs.chain_of(slot);
        }
    }

    pub fn compact(&mut self) {
        self.vecs.compact(&mut self.stats);
    }

    pub fn dump(&self) {
        log::debug!("objects: {} .. {}", self.objs.low(), self.units);
        let mut slot = self.objs.low();
        while slot != NONE && self.objs.chain_of(slot) != NONE {
            let chain = self.objs.chain_of(slot);
            let state = if self.objs.is_free(slot) { "free" } else { "used" };
            log::debug!("od: {slot:5} {:6} b : {state}", (chain - slot) * UNIT);
            slot = chain;
        }
        self.vecs.dump();
    }

    // vector operations, routed through the heap so the object watermark
    // bounds every growth

    pub fn vec_resize(&mut self, vv: &mut ValueVec, bytes: u32) -> bool {
        let ok = self.vecs.resize(vv, bytes, self.objs.low(), &mut self.stats);
        if !ok {
            self.out_of_memory(bytes);
        }
        ok
    }

    pub fn vec_push(&mut self, vv: &mut ValueVec, v: Value) -> bool {
        let ok = self.vecs.push(vv, v, self.objs.low(), &mut self.stats);
        if !ok {
            self.out_of_memory((vv.fill() + 1) * ELEM);
        }
        ok
    }

    pub fn vec_pop(&mut self, vv: &mut ValueVec) -> Value {
        self.vecs.pop(vv)
    }

    pub fn vec_get(&self, vv: ValueVec, i: u32) -> Value {
        self.vecs.get(vv, i)
    }

    pub fn vec_set(&mut self, vv: ValueVec, i: u32, v: Value) {
        self.vecs.set(vv, i, v)
    }

    pub fn vec_remove(&mut self, vv: &mut ValueVec, i: u32) -> Value {
        self.vecs.remove(vv, i)
    }

    pub fn vec_truncate(&mut self, vv: &mut ValueVec, n: u32) {
        self.vecs.truncate(vv, n, &mut self.stats)
    }

    pub fn vec_release(&mut self, vv: &mut ValueVec) {
        self.vecs.release(vv, &mut self.stats)
    }

    pub fn vec_capacity(&self, vv: ValueVec) -> u32 {
        self.vecs.capacity(vv)
    }
}
