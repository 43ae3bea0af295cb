//! Architecture-specific constants for physical memory bookkeeping.
//!
//! Only the page size differs between targets. Platforms whose firmware
//! hands out a different granule pass it to
//! [`RangeAllocator::with_page_size`](crate::RangeAllocator::with_page_size)
//! instead of relying on [`PAGE_SIZE`].

#[cfg(target_arch = "x86_64")]
mod x86_64;
#[cfg(target_arch = "x86_64")]
pub use self::x86_64::*;

#[cfg(not(target_arch = "x86_64"))]
mod generic;
#[cfg(not(target_arch = "x86_64"))]
pub use self::generic::*;

/// Exclusive end of the memory reachable with 32-bit physical addresses.
///
/// A claim below 4 GiB may end exactly here: only its last byte, at most
/// `0xFFFF_FFFF`, has to be 32-bit addressable.
pub const FOUR_GIB: u64 = 0x1_0000_0000;

/// Size of the 64-bit physical address space, as an exclusive end.
///
/// Kept as `u128` so `base + length` of any range can be computed without
/// wrapping.
pub const ADDRESS_SPACE: u128 = 1 << 64;
