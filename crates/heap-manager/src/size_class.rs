//! Power-of-two size classes.
//!
//! A size class is the base-2 logarithm of a block size. Class `k` holds
//! blocks of exactly `1 << k` bytes, and doubles as the index of the bucket
//! free list for that size.

use core::fmt;

/// Number of size classes, and therefore of bucket free lists.
pub const NUM_CLASSES: usize = 32;

/// Returns `ceil(log2(n))`, with `ceil_log2(0) == ceil_log2(1) == 0`.
#[must_use]
pub const fn ceil_log2(n: u64) -> u32 {
    if n <= 1 {
        0
    } else {
        u64::BITS - (n - 1).leading_zeros()
    }
}

/// A validated size class in `0..NUM_CLASSES`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SizeClass(u8);

impl SizeClass {
    pub const MIN: Self = Self(0);
    #[expect(clippy::cast_possible_truncation)]
    pub const MAX: Self = Self((NUM_CLASSES - 1) as u8);

    /// Returns the class for `log2`, or `None` if it is out of range.
    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub const fn new(log2: u32) -> Option<Self> {
        if (log2 as usize) < NUM_CLASSES {
            Some(Self(log2 as u8))
        } else {
            None
        }
    }

    /// Returns the smallest class whose blocks can hold `size` bytes.
    #[must_use]
    pub const fn fitting(size: u64) -> Option<Self> {
        Self::new(ceil_log2(size))
    }

    /// Returns the class of a block of `size` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `size` is not a power of two or its class is out of range.
    /// Block sizes are computed internally, so either case means the heap
    /// metadata is corrupted.
    #[must_use]
    #[track_caller]
    pub fn of_block(size: u64) -> Self {
        assert!(size.is_power_of_two(), "block size {size:#x} is not a power of two");
        match Self::fitting(size) {
            Some(class) => class,
            None => panic!("block size {size:#x} is beyond the largest size class"),
        }
    }

    #[must_use]
    pub const fn log2(self) -> u32 {
        self.0 as u32
    }

    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Block size in bytes.
    #[must_use]
    pub const fn size(self) -> u64 {
        1 << self.0
    }

    /// Iterates over this class and every larger one.
    pub fn and_larger(self) -> impl DoubleEndedIterator<Item = Self> {
        (self.0..=Self::MAX.0).map(Self)
    }
}

impl fmt::Debug for SizeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SizeClass({}: {:#x})", self.0, self.size())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ceil_log2() {
        assert_eq!(ceil_log2(0), 0);
        assert_eq!(ceil_log2(1), 0);
        assert_eq!(ceil_log2(2), 1);
        assert_eq!(ceil_log2(3), 2);
        assert_eq!(ceil_log2(4), 2);
        assert_eq!(ceil_log2(5), 3);
        assert_eq!(ceil_log2(4096), 12);
        assert_eq!(ceil_log2(4097), 13);
        assert_eq!(ceil_log2(1 << 31), 31);
        assert_eq!(ceil_log2((1 << 31) + 1), 32);
    }

    #[test]
    fn test_fitting() {
        assert_eq!(SizeClass::fitting(64).map(SizeClass::log2), Some(6));
        assert_eq!(SizeClass::fitting(65).map(SizeClass::log2), Some(7));
        assert_eq!(SizeClass::fitting(1 << 31), Some(SizeClass::MAX));
        assert_eq!(SizeClass::fitting((1 << 31) + 1), None);
    }

    #[test]
    fn test_size_and_index() {
        let class = SizeClass::new(10).unwrap();
        assert_eq!(class.size(), 1024);
        assert_eq!(class.index(), 10);
        assert_eq!(SizeClass::of_block(1024), class);
        assert!(SizeClass::new(32).is_none());
    }

    #[test]
    fn test_and_larger() {
        let classes: Vec<_> = SizeClass::new(29).unwrap().and_larger().map(SizeClass::log2).collect();
        assert_eq!(classes, vec![29, 30, 31]);
    }

    #[test]
    #[should_panic(expected = "not a power of two")]
    fn test_of_block_rejects_odd_size() {
        let _ = SizeClass::of_block(96);
    }
}
