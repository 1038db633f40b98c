//! Vector region: movable payload storage at the low end of the arena.
//!
//! The arena's slot indices are shared with the object region. Vectors grow
//! up from index 0 to the `high` watermark, objects grow down from the top,
//! and the gap between the two watermarks is the only free reserve. Payloads
//! relocate during compaction; the descriptor table gives every vector a
//! stable id, so holders never see a move.
//!
//! A slot covers [`UNIT`] bytes. A vector spanning `n` slots carries
//! `n * UNIT - HDR` bytes of payload, so requested sizes bucket to those
//! capacities and a resize within the same bucket is a no-op.
use crate::heap::GcStats;
use crate::tagged::Value;

/// Bytes per arena slot.
pub const UNIT: u32 = 8;
/// Per-vector header bytes, reserved at the front of each used run.
pub const HDR: u32 = 4;
/// Bytes per element of a value vector.
pub(crate) const ELEM: u32 = 4;

pub(crate) const NONE: u32 = u32::MAX;

/// Stable handle into the descriptor table.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct VecId(pub(crate) u32);

/// Slots needed to hold `sz` payload bytes.
#[inline]
fn slots_for(sz: u32) -> u32 {
    (sz + HDR).div_ceil(UNIT)
}

#[derive(Copy, Clone, Debug)]
enum VecCell {
    /// Interior of a run, or space beyond the watermark.
    Gap,
    /// Head of a free run covering `[slot, end)`.
    Free { end: u32 },
    /// Head of a used run; its length follows from the owner's capacity.
    Used { owner: VecId },
}

struct VecDesc {
    /// Head slot of the payload run, `NONE` while the descriptor is free.
    data: u32,
    /// Payload bytes, always of the form `n * UNIT - HDR`.
    capa: u32,
}

/// Typed view of one vector: stable id plus element fill count. Held by
/// value inside heap objects; all storage access goes through the region.
#[derive(Copy, Clone, Debug)]
pub struct ValueVec {
    id: u32,
    fill: u32,
}

impl ValueVec {
    pub const fn unallocated() -> Self {
        Self { id: NONE, fill: 0 }
    }

    #[inline]
    pub fn id(&self) -> Option<VecId> {
        if self.id == NONE { None } else { Some(VecId(self.id)) }
    }

    #[inline]
    pub fn fill(&self) -> u32 {
        self.fill
    }

    pub(crate) fn set_fill(&mut self, n: u32) {
        self.fill = n;
    }
}

pub struct VecRegion {
    bytes: Vec<u8>,
    cells: Vec<VecCell>,
    high: u32,
    descs: Vec<VecDesc>,
    free_descs: Vec<u32>,
}

impl VecRegion {
    pub fn new(units: u32) -> Self {
        Self {
            bytes: vec![0; (units * UNIT) as usize],
            cells: vec![VecCell::Gap; units as usize],
            high: 0,
            descs: Vec::new(),
            free_descs: Vec::new(),
        }
    }

    /// Current watermark, in slots.
    #[inline]
    pub fn high(&self) -> u32 {
        self.high
    }

    fn capa_of(&self, id: VecId) -> u32 {
        self.descs[id.0 as usize].capa
    }

    fn run_len(&self, owner: VecId) -> u32 {
        self.capa_of(owner).div_ceil(UNIT)
    }

    fn free_end(&self, slot: u32) -> u32 {
        match self.cells[slot as usize] {
            VecCell::Free { end } => end,
            other => unreachable!("expected free run head at {slot}, found {other:?}"),
        }
    }

    /// Coalesce the free run at `slot` with every free run after it. Returns
    /// true when the merged run reaches the watermark, which then drops to
    /// `slot` and the run disappears entirely.
    fn merge_free(&mut self, slot: u32) -> bool {
        let mut end = self.free_end(slot);
        while end < self.high {
            match self.cells[end as usize] {
                VecCell::Free { end: e } => {
                    self.cells[end as usize] = VecCell::Gap;
                    end = e;
                }
                _ => break,
            }
        }
        if end < self.high {
            self.cells[slot as usize] = VecCell::Free { end };
            false
        } else {
            self.cells[slot as usize] = VecCell::Gap;
            self.high = slot;
            true
        }
    }

    /// Mark `[slot, end)` as a free run, if it is non-empty.
    fn split_free(&mut self, slot: u32, end: u32) {
        if end > slot {
            self.cells[slot as usize] = VecCell::Free { end };
        }
    }

    /// First-fit scan for `needs` slots, bumping the watermark when no free
    /// run is large enough. `obj_low` bounds the bump. The returned slot is
    /// left as a gap; the caller claims it.
    fn find_space(&mut self, needs: u32, obj_low: u32) -> Option<u32> {
        let mut slot = 0u32;
        while slot < self.high {
            match self.cells[slot as usize] {
                VecCell::Used { owner } => slot += self.run_len(owner),
                VecCell::Free { .. } => {
                    if self.merge_free(slot) {
                        break; // no free runs left below the watermark
                    }
                    let end = self.free_end(slot);
                    if slot + needs > end {
                        slot = end;
                    } else {
                        self.cells[slot as usize] = VecCell::Gap;
                        self.split_free(slot + needs, end);
                        return Some(slot);
                    }
                }
                VecCell::Gap => unreachable!("gap at run boundary {slot}"),
            }
        }
        debug_assert_eq!(slot, self.high);
        if slot + needs > obj_low {
            return None;
        }
        self.high = slot + needs;
        Some(slot)
    }

    fn payload(&self, id: VecId) -> usize {
        (self.descs[id.0 as usize].data * UNIT + HDR) as usize
    }

    fn alloc_desc(&mut self, data: u32, capa: u32) -> VecId {
        if let Some(i) = self.free_descs.pop() {
            self.descs[i as usize] = VecDesc { data, capa };
            VecId(i)
        } else {
            self.descs.push(VecDesc { data, capa });
            VecId(self.descs.len() as u32 - 1)
        }
    }

    /// Resize a vector to hold `sz` payload bytes; `sz == 0` releases it.
    /// Returns false when the arena cannot satisfy the request, leaving the
    /// vector with its old storage. Newly gained bytes read as zero.
    pub fn resize(
        &mut self,
        vv: &mut ValueVec,
        sz: u32,
        obj_low: u32,
        stats: &mut GcStats,
    ) -> bool {
        let capas = if vv.id == NONE { 0 } else { self.run_len(VecId(vv.id)) };
        let needs = if sz > 0 { slots_for(sz) } else { 0 };
        if capas == needs {
            return true;
        }

        if vv.id == NONE {
            // new allocation
            let Some(slot) = self.find_space(needs, obj_low) else {
                return false;
            };
            stats.note_vec_alloc();
            stats.note_vec_bytes(capas, needs);
            let capa = needs * UNIT - HDR;
            let id = self.alloc_desc(slot, capa);
            self.cells[slot as usize] = VecCell::Used { owner: id };
            vv.id = id.0;
            let off = self.payload(id);
            self.bytes[off..off + capa as usize].fill(0);
            return true;
        }

        let id = VecId(vv.id);
        let slot = self.descs[id.0 as usize].data;

        if needs == 0 {
            // release
            stats.note_vec_free();
            stats.note_vec_bytes(capas, needs);
            self.cells[slot as usize] = VecCell::Free { end: slot + capas };
            self.merge_free(slot);
            self.descs[id.0 as usize] = VecDesc { data: NONE, capa: 0 };
            self.free_descs.push(id.0);
            vv.id = NONE;
            vv.fill = 0;
            return true;
        }

        // resize in place when possible, else relocate
        let mut tail = slot + capas;
        if tail < self.high && matches!(self.cells[tail as usize], VecCell::Free { .. }) {
            if self.merge_free(tail) {
                tail = self.high; // merged run reached the watermark
            }
        }
        let obytes = self.descs[id.0 as usize].capa;
        if tail == self.high {
            // the run ends at the watermark, just move the watermark
            if slot + needs > obj_low {
                return false;
            }
            for i in slot + needs..self.high {
                self.cells[i as usize] = VecCell::Gap;
            }
            self.high = slot + needs;
        } else if needs < capas {
            // shrink, free the tail
            self.split_free(slot + needs, slot + capas);
        } else {
            let fits_next = matches!(self.cells[tail as usize], VecCell::Free { .. })
                && slot + needs <= self.free_end(tail);
            if fits_next {
                // grow into the adjacent free run
                let end = self.free_end(tail);
                self.cells[tail as usize] = VecCell::Gap;
                self.split_free(slot + needs, end);
            } else {
                // relocate, copying the payload over
                let Some(nslot) = self.find_space(needs, obj_low) else {
                    return false;
                };
                let src = (slot * UNIT + HDR) as usize;
                let dst = (nslot * UNIT + HDR) as usize;
                self.bytes.copy_within(src..src + obytes as usize, dst);
                self.cells[nslot as usize] = VecCell::Used { owner: id };
                self.cells[slot as usize] = VecCell::Free { end: slot + capas };
                self.descs[id.0 as usize].data = nslot;
            }
        }
        stats.note_vec_bytes(capas, needs);
        let capa = needs * UNIT - HDR;
        self.descs[id.0 as usize].capa = capa;
        if capa > obytes {
            let off = self.payload(id);
            self.bytes[off + obytes as usize..off + capa as usize].fill(0);
        }
        true
    }

    /// Slide every used run down over the free gaps, in one pass. Payloads
    /// move, descriptors are patched, ids stay valid.
    pub fn compact(&mut self, stats: &mut GcStats) {
        stats.compacts += 1;
        let mut new_high = 0u32;
        let mut slot = 0u32;
        while slot < self.high {
            match self.cells[slot as usize] {
                VecCell::Free { end } => {
                    self.cells[slot as usize] = VecCell::Gap;
                    slot = end;
                }
                VecCell::Used { owner } => {
                    let n = self.run_len(owner);
                    if new_high < slot {
                        let src = (slot * UNIT) as usize;
                        let dst = (new_high * UNIT) as usize;
                        self.bytes.copy_within(src..src + (n * UNIT) as usize, dst);
                        self.cells[slot as usize] = VecCell::Gap;
                        self.cells[new_high as usize] = VecCell::Used { owner };
                        self.descs[owner.0 as usize].data = new_high;
                    }
                    new_high += n;
                    slot += n;
                }
                VecCell::Gap => unreachable!("gap at run boundary {slot}"),
            }
        }
        log::trace!("compact: high {} -> {}", self.high, new_high);
        self.high = new_high;
    }

    /// Element capacity of a value vector.
    pub fn capacity(&self, vv: ValueVec) -> u32 {
        if vv.id == NONE { 0 } else { self.capa_of(VecId(vv.id)) / ELEM }
    }

    #[inline]
    fn cell_off(&self, vv: ValueVec, i: u32) -> usize {
        debug_assert!(i < self.capacity(vv), "cell index {i} out of capacity");
        self.payload(VecId(vv.id)) + (i * ELEM) as usize
    }

    /// Read a cell. Cells between fill and capacity read as nil.
    pub fn get(&self, vv: ValueVec, i: u32) -> Value {
        let off = self.cell_off(vv, i);
        let raw = u32::from_ne_bytes(self.bytes[off..off + 4].try_into().unwrap());
        Value::from_raw(raw)
    }

    pub fn set(&mut self, vv: ValueVec, i: u32, v: Value) {
        let off = self.cell_off(vv, i);
        self.bytes[off..off + 4].copy_from_slice(&v.raw().to_ne_bytes());
    }

    /// Append, growing the underlying storage as needed.
    pub fn push(
        &mut self,
        vv: &mut ValueVec,
        v: Value,
        obj_low: u32,
        stats: &mut GcStats,
    ) -> bool {
        if vv.fill >= self.capacity(*vv) {
            if !self.resize(vv, (vv.fill + 1) * ELEM, obj_low, stats) {
                return false;
            }
        }
        let i = vv.fill;
        vv.fill += 1;
        self.set(*vv, i, v);
        true
    }

    pub fn pop(&mut self, vv: &mut ValueVec) -> Value {
        debug_assert!(vv.fill > 0, "pop from empty vector");
        vv.fill -= 1;
        let v = self.get(*vv, vv.fill);
        self.set(*vv, vv.fill, Value::NIL);
        v
    }

    /// Remove the element at `i`, shifting the tail left.
    pub fn remove(&mut self, vv: &mut ValueVec, i: u32) -> Value {
        debug_assert!(i < vv.fill);
        let v = self.get(*vv, i);
        let off = self.payload(VecId(vv.id));
        let from = off + ((i + 1) * ELEM) as usize;
        let to = off + (vv.fill * ELEM) as usize;
        self.bytes.copy_within(from..to, off + (i * ELEM) as usize);
        vv.fill -= 1;
        self.set(*vv, vv.fill, Value::NIL);
        v
    }

    /// Drop elements above `n` and give the freed buckets back.
    pub fn truncate(&mut self, vv: &mut ValueVec, n: u32, stats: &mut GcStats) {
        debug_assert!(n <= vv.fill);
        for i in n..vv.fill {
            self.set(*vv, i, Value::NIL);
        }
        vv.fill = n;
        let ok = self.resize(vv, n * ELEM, u32::MAX, stats);
        debug_assert!(ok, "shrinking cannot fail");
    }

    /// Release a vector's storage and reset its fill count.
    pub fn release(&mut self, vv: &mut ValueVec, stats: &mut GcStats) {
        if vv.id != NONE {
            let ok = self.resize(vv, 0, u32::MAX, stats);
            debug_assert!(ok);
        }
        vv.fill = 0;
    }

    /// Release by id, for reclaiming a dead object's storage when the typed
    /// view is no longer reachable.
    pub(crate) fn release_id(&mut self, id: VecId, stats: &mut GcStats) {
        let mut vv = ValueVec { id: id.0, fill: 0 };
        self.release(&mut vv, stats);
    }

    pub fn dump(&self) {
        log::debug!("vectors: 0 .. {}", self.high);
        let mut slot = 0u32;
        while slot < self.high {
            match self.cells[slot as usize] {
                VecCell::Free { end } => {
                    log::debug!("vd: {slot:5} {:6} b : free", (end - slot) * UNIT);
                    slot = end;
                }
                VecCell::Used { owner } => {
                    let n = self.run_len(owner);
                    log::debug!("vd: {slot:5} {:6} b : vec #{}", n * UNIT, owner.0);
                    slot += n;
                }
                VecCell::Gap => unreachable!(),
            }
        }
    }
}
