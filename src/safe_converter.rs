//! Integer conversions between sequence arithmetic (`u32`) and ring indexing (`usize`).

/// Widening conversions that can not fail on the supported platforms
pub trait SafeCast<T> {
    fn safe_cast(self) -> T;
}

#[cfg(not(target_pointer_width = "16"))]
impl SafeCast<usize> for u32 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}

/// Narrowing conversions for values whose range is guaranteed by validated configuration, e.g.
///  offsets into a ring whose size was checked to fit into the sequence number space.
///
/// NB: The implementations panic if that guarantee is violated
pub trait PrecheckedCast<T> {
    fn prechecked_cast(self) -> T;
}

impl PrecheckedCast<u32> for usize {
    fn prechecked_cast(self) -> u32 {
        self.try_into().expect("ring sizes are validated to fit into a sequence number")
    }
}
