//! x86_64 page geometry.
//!
//! The loader only ever reserves in units of the base page; large pages are
//! a concern of whoever builds page tables after hand-off.

use ::x86_64::structures::paging::{PageSize, Size4KiB};

/// Smallest page the platform maps, in bytes.
pub const PAGE_SIZE: u64 = Size4KiB::SIZE;
