//! Error kinds reported by the allocator and the memory map reconciler.

use core::fmt;

use crate::{HumanRange, MemoryRange};

/// Errors returned by claim and reconciliation operations.
///
/// Callers are expected to propagate these; nothing in this crate retries,
/// since repeating a failed request against an unchanged table cannot succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Malformed input: zero alignment, unknown option code, unsupported page
    /// size, or a memory map that is unsorted or overflows.
    InvalidParameter,
    /// No hole satisfies the request, the claim would pass the top of the
    /// address space, or the range table has no room left.
    OutOfResources,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidParameter => f.write_str("invalid parameter"),
            Error::OutOfResources => f.write_str("out of resources"),
        }
    }
}

impl core::error::Error for Error {}

/// The invariant a corrupted range table entry breaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorruptionKind {
    /// The entry covers no memory.
    ZeroLength,
    /// The entry runs past the top of the address space, or reaches the top
    /// without being the last entry.
    Overflow,
    /// The entry does not start after the end of its predecessor.
    Unsorted,
    /// The entry touches its predecessor and should have been merged into it.
    Unmerged,
}

impl CorruptionKind {
    /// Short description used in diagnostics.
    pub const fn describe(self) -> &'static str {
        match self {
            CorruptionKind::ZeroLength => "zero-length range",
            CorruptionKind::Overflow => "range overflows the address space",
            CorruptionKind::Unsorted => "range table is not sorted",
            CorruptionKind::Unmerged => "adjacent ranges were not merged",
        }
    }
}

/// Diagnostic for the first broken invariant found in a range table.
///
/// This is never returned from a claim: a table that fails its self-check
/// cannot be trusted, so [`RangeAllocator::sanity_check`](crate::RangeAllocator::sanity_check)
/// turns it into a panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Corruption {
    /// Position of the offending entry.
    pub index: usize,
    /// The offending entry itself.
    pub range: MemoryRange,
    /// Which invariant it breaks.
    pub kind: CorruptionKind,
}

impl fmt::Display for Corruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "entry {} {}: {}",
            self.index,
            HumanRange(self.range),
            self.kind.describe()
        )
    }
}
