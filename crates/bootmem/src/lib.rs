#![cfg_attr(not(test), no_std)]

//! # Boot Memory (bootmem)
//!
//! Physical memory bookkeeping for a boot loader, before any heap or
//! operating system exists. It provides:
//!
//! - A fixed-capacity table of claimed physical ranges, kept sorted and
//!   merged, with first-fit allocation and forced reservations.
//! - Reconciliation of the firmware memory map into that table, so that
//!   holes, reserved firmware regions and the space above installed memory
//!   are never handed out.
//! - A self-check that halts the boot when the table is corrupted.
//!
//! Everything works on caller-provided or fixed-size storage and never
//! allocates. Diagnostics go through the [`log`] facade; the platform
//! installs the logger.

mod allocator;
pub mod arch;
mod error;
mod human;
mod memmap;
mod range;
mod sort;
mod table;

pub use allocator::{
    ALIGN_ANY, ALIGN_FUNC, ALIGN_PAGE, ALIGN_PTR, ALIGN_STR, AllocOption, RangeAllocator,
    SharedAllocator,
};
pub use error::{Corruption, CorruptionKind, Error};
pub use human::{HumanAddress, HumanRange, HumanSize};
pub use memmap::{
    ATTR_ENABLED, BootMemoryRegion, FirmwareDescriptor, MemoryMap, MemoryType, blacklist_bootloader,
    derive_blacklist, dump as dump_memory_map, merge, reconcile, validate,
};
pub use range::{MemoryRange, align_down, align_up, mergeable, overlap};
pub use sort::stable_sort;
pub use table::{MAX_RANGES, RangeTable};

pub use arch::PAGE_SIZE;
