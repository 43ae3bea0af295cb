//! Physical memory ranges and the overflow-aware arithmetic shared by the
//! range table and the memory map reconciler.
//!
//! A range is `[base, base + length)`. The sum may wrap to exactly zero,
//! which means the range extends to the top of the 64-bit address space.
//! Any other wrap is an overflow and never describes real memory.

use crate::arch::ADDRESS_SPACE;

/// A contiguous range of physical memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryRange {
    base: u64,
    length: u64,
}

impl MemoryRange {
    /// A zero-length range at address zero.
    pub const EMPTY: MemoryRange = MemoryRange::new(0, 0);

    /// Creates a new memory range.
    pub const fn new(base: u64, length: u64) -> Self {
        Self { base, length }
    }

    /// Returns the base address of this range.
    pub const fn base(&self) -> u64 {
        self.base
    }

    /// Returns the length of this range in bytes.
    pub const fn length(&self) -> u64 {
        self.length
    }

    /// Returns the exclusive end address, or `None` if the range reaches (or
    /// runs past) the top of the address space.
    pub const fn end(&self) -> Option<u64> {
        self.base.checked_add(self.length)
    }

    /// Returns the exclusive end address widened so it never wraps.
    pub const fn exclusive_end(&self) -> u128 {
        self.base as u128 + self.length as u128
    }

    /// Returns the address of the last byte in the range.
    ///
    /// Only meaningful for non-empty ranges.
    pub const fn limit(&self) -> u64 {
        self.base.wrapping_add(self.length).wrapping_sub(1)
    }

    /// Returns true if the range ends exactly at the top of the address space.
    pub const fn reaches_top(&self) -> bool {
        self.length != 0 && self.base.wrapping_add(self.length) == 0
    }

    /// Returns true if the range runs past the top of the address space.
    pub const fn overflows(&self) -> bool {
        self.exclusive_end() > ADDRESS_SPACE
    }

    /// Returns true if this range and `other` share at least one byte.
    pub const fn overlaps(&self, other: &MemoryRange) -> bool {
        overlap(self.base, self.length, other.base, other.length)
    }

    /// Returns true if this range overlaps or touches `other`.
    pub const fn mergeable(&self, other: &MemoryRange) -> bool {
        mergeable(self.base, self.length, other.base, other.length)
    }

    /// Returns true if every byte of `other` lies within this range.
    pub const fn contains(&self, other: &MemoryRange) -> bool {
        other.base >= self.base && other.exclusive_end() <= self.exclusive_end()
    }

    /// Returns the smallest range covering both `self` and `other`.
    ///
    /// Runs past the top of the address space are clipped to it. Returns
    /// `None` when the result would span all 2^64 bytes, which a `u64` length
    /// cannot express.
    pub fn union(&self, other: &MemoryRange) -> Option<MemoryRange> {
        let base = self.base.min(other.base);
        let end = self
            .exclusive_end()
            .max(other.exclusive_end())
            .min(ADDRESS_SPACE);

        let length = u64::try_from(end - u128::from(base)).ok()?;
        Some(MemoryRange::new(base, length))
    }
}

/// Orders two ranges by base address, returning `(lower base, lower length,
/// higher base)`.
const fn by_base(a1: u64, l1: u64, a2: u64, l2: u64) -> (u64, u64, u64) {
    if a2 < a1 { (a2, l2, a1) } else { (a1, l1, a2) }
}

/// Checks whether `[a1, a1 + l1)` and `[a2, a2 + l2)` can be merged into one
/// range, that is whether they overlap or are exactly contiguous.
///
/// A range whose end wraps is treated as extending to the top of the address
/// space. The result does not depend on argument order.
pub const fn mergeable(a1: u64, l1: u64, a2: u64, l2: u64) -> bool {
    let (low, low_length, high) = by_base(a1, l1, a2, l2);

    match low.checked_add(low_length) {
        Some(end) => high <= end,
        None => true,
    }
}

/// Checks whether `[a1, a1 + l1)` and `[a2, a2 + l2)` share at least one
/// byte. Touching endpoints do not count, and an empty range overlaps
/// nothing.
///
/// A range whose end wraps is treated as extending to the top of the address
/// space. The result does not depend on argument order.
pub const fn overlap(a1: u64, l1: u64, a2: u64, l2: u64) -> bool {
    if l1 == 0 || l2 == 0 {
        return false;
    }

    let (low, low_length, high) = by_base(a1, l1, a2, l2);

    match low.checked_add(low_length) {
        Some(end) => high < end,
        None => true,
    }
}

/// Rounds `value` up to a multiple of `align`, or `None` if that overflows.
///
/// `align` need not be a power of two but must not be zero.
pub const fn align_up(value: u64, align: u64) -> Option<u64> {
    let remainder = value % align;
    if remainder == 0 {
        Some(value)
    } else {
        value.checked_add(align - remainder)
    }
}

/// Rounds `value` down to a multiple of `align`, which must not be zero.
pub const fn align_down(value: u64, align: u64) -> u64 {
    value - value % align
}
