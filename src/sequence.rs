use std::fmt::{Display, Formatter};
use crate::safe_converter::SafeCast;

/// Per-sender slice sequence number. Sequences are assigned once at send time, start at 1 for a
///  fresh connection and wrap at the 32-bit boundary. Control datagrams (NACK) carry `0` in their
///  header, which is told apart from data by the data type.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct Sequence(u32);

impl Display for Sequence {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Sequence {
    pub const ZERO: Sequence = Sequence(0);
    pub const FIRST: Sequence = Sequence(1);

    pub const SERIALIZED_LEN: usize = size_of::<u32>();

    pub fn from_raw(value: u32) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }

    pub fn next(&self) -> Sequence {
        self.plus(1)
    }

    pub fn plus(&self, delta: u32) -> Sequence {
        Sequence(self.0.wrapping_add(delta))
    }

    /// Distance from `self` forward to `other`, with wrap-around semantics
    pub fn distance_to(&self, other: Sequence) -> u32 {
        other.0.wrapping_sub(self.0)
    }

    /// `true` if `self` lies strictly before `other` in the (wrapping) sequence space, i.e. less
    ///  than half the number space behind it
    pub fn is_before(&self, other: Sequence) -> bool {
        let d = self.distance_to(other);
        d != 0 && d < 0x8000_0000
    }

    /// The index of this sequence in a ring of `capacity` slots. `capacity` is a power of two,
    ///  so this is a simple mask.
    pub fn slot(&self, capacity: usize) -> usize {
        debug_assert!(capacity.is_power_of_two());
        let raw: usize = self.0.safe_cast();
        raw & (capacity - 1)
    }
}
