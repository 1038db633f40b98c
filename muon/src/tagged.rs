//! Value: the universal one-word cell used throughout the runtime.
//!
//! Every container payload (frame stacks, arrays, event queues) is a sequence
//! of these. The two low bits discriminate the variant:
//!
//! - nil: all bits zero
//! - small integer: bit 0 set, payload in the upper 31 bits (arithmetic shift)
//! - object reference: low bits `10`, slot index in the upper bits
//! - symbol id: low bits `00` and nonzero; interned ids start at 1, so the
//!   zero pattern stays reserved for nil
use std::fmt;

use crate::ObjRef;

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Tag {
    Nil,
    Int,
    Sym,
    Obj,
}

#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Value(u32);

impl Value {
    pub const NIL: Value = Value(0);

    #[inline]
    pub fn int(n: i32) -> Self {
        debug_assert!((-(1 << 30)..1 << 30).contains(&n), "int out of 31-bit range");
        Self(((n as u32) << 1) | 1)
    }

    #[inline]
    pub fn sym(id: u32) -> Self {
        debug_assert!(id > 0, "symbol ids start at 1");
        debug_assert!(id < 1 << 30);
        Self(id << 2)
    }

    #[inline]
    pub fn obj(r: ObjRef) -> Self {
        debug_assert!(r.0 < 1 << 30);
        Self((r.0 << 2) | 0b10)
    }

    #[inline]
    pub fn tag(self) -> Tag {
        if self.0 == 0 {
            Tag::Nil
        } else if self.0 & 1 != 0 {
            Tag::Int
        } else if self.0 & 0b10 != 0 {
            Tag::Obj
        } else {
            Tag::Sym
        }
    }

    #[inline]
    pub fn is_nil(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn is_int(self) -> bool {
        self.0 & 1 != 0
    }

    #[inline]
    pub fn is_obj(self) -> bool {
        self.0 & 0b11 == 0b10
    }

    #[inline]
    pub fn is_sym(self) -> bool {
        self.0 & 0b11 == 0 && self.0 != 0
    }

    #[inline]
    pub fn as_int(self) -> i32 {
        debug_assert!(self.is_int());
        (self.0 as i32) >> 1
    }

    #[inline]
    pub fn as_obj(self) -> Option<ObjRef> {
        if self.is_obj() { Some(ObjRef(self.0 >> 2)) } else { None }
    }

    #[inline]
    pub fn as_sym(self) -> Option<u32> {
        if self.is_sym() { Some(self.0 >> 2) } else { None }
    }

    /// Read and clear, like moving out of the cell.
    #[inline]
    pub fn take(&mut self) -> Value {
        std::mem::replace(self, Value::NIL)
    }

    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }

    pub(crate) fn from_raw(raw: u32) -> Self {
        Self(raw)
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::NIL
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::int(n)
    }
}

impl From<ObjRef> for Value {
    fn from(r: ObjRef) -> Self {
        Value::obj(r)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.tag() {
            Tag::Nil => write!(f, "nil"),
            Tag::Int => write!(f, "int({})", self.as_int()),
            Tag::Sym => write!(f, "sym({})", self.0 >> 2),
            Tag::Obj => write!(f, "obj(#{})", self.0 >> 2),
        }
    }
}

#[cfg(test)]
mod value_tests {
    use super::*;

    #[test]
    fn nil_is_all_zero_and_exclusive() {
        let v = Value::NIL;
        assert_eq!(v.raw(), 0);
        assert!(v.is_nil());
        assert!(!v.is_int());
        assert!(!v.is_obj());
        assert!(!v.is_sym());
        assert_eq!(v.tag(), Tag::Nil);
    }

    #[test]
    fn int_roundtrip_including_negative() {
        for n in [0, 1, -1, 42, -12345, (1 << 30) - 1, -(1 << 30)] {
            let v = Value::int(n);
            assert!(v.is_int(), "expected int tag for {n}");
            assert_eq!(v.as_int(), n);
        }
    }

    #[test]
    fn int_zero_is_not_nil() {
        let v = Value::int(0);
        assert!(!v.is_nil());
        assert_eq!(v.as_int(), 0);
    }

    #[test]
    fn obj_roundtrip_and_exclusivity() {
        let v = Value::obj(ObjRef(0));
        assert!(v.is_obj());
        assert!(!v.is_nil(), "slot index 0 must still be representable");
        assert_eq!(v.as_obj(), Some(ObjRef(0)));

        let v = Value::obj(ObjRef(123));
        assert_eq!(v.tag(), Tag::Obj);
        assert_eq!(v.as_obj(), Some(ObjRef(123)));
        assert!(!v.is_int());
        assert!(!v.is_sym());
    }

    #[test]
    fn sym_roundtrip() {
        let v = Value::sym(1);
        assert!(v.is_sym());
        assert_eq!(v.as_sym(), Some(1));
        assert_eq!(Value::sym(500).as_sym(), Some(500));
        assert_eq!(Value::int(7).as_sym(), None);
    }

    #[test]
    fn take_clears_the_cell() {
        let mut v = Value::int(9);
        let t = v.take();
        assert_eq!(t.as_int(), 9);
        assert!(v.is_nil());
    }
}
