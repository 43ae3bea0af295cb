//! Physical range allocator for the boot stage.
//!
//! The allocator hands out physical ranges the loader will later relocate
//! into, and stakes out ranges that must never be handed out. It only tracks
//! what has been claimed: free memory is whatever the [`RangeTable`] does not
//! contain, and nothing is ever released.
//!
//! Memory claimed before the boot-loader's own memory has been blacklisted
//! (see [`blacklist_bootloader`](crate::blacklist_bootloader)) may still be
//! in use by the loader and is only safe to fill during the final
//! relocation. Claims made afterwards can be written immediately. The
//! allocator does not enforce that ordering; the boot pipeline does.

use core::fmt;

use crate::arch::{self, ADDRESS_SPACE, FOUR_GIB};
use crate::error::Error;
use crate::table::{MAX_RANGES, RangeTable};
use crate::{HumanAddress, HumanRange, HumanSize, MemoryRange, align_down};

/// Alignment for memory with no placement constraint.
pub const ALIGN_ANY: u64 = 1;
/// Alignment for strings.
pub const ALIGN_STR: u64 = 1;
/// Alignment for code entry points.
pub const ALIGN_FUNC: u64 = 16;
/// Alignment for pointer-sized data.
pub const ALIGN_PTR: u64 = core::mem::size_of::<usize>() as u64;
/// Alignment for page-granular data.
pub const ALIGN_PAGE: u64 = arch::PAGE_SIZE;

/// Placement policy for [`RangeAllocator::alloc`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AllocOption {
    /// Search for a hole that ends at or below 4 GiB.
    Below4GiB = 0,
    /// Claim exactly the requested address; fail if any of it is taken.
    Fixed = 1,
    /// Claim exactly the requested address even if some of it is taken.
    Force = 2,
    /// Search for a hole anywhere in the address space.
    Any = 3,
}

impl AllocOption {
    const fn name(self) -> &'static str {
        match self {
            AllocOption::Below4GiB => "below 4GiB",
            AllocOption::Fixed => "fixed",
            AllocOption::Force => "forced",
            AllocOption::Any => "anywhere",
        }
    }
}

impl fmt::Display for AllocOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<u32> for AllocOption {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(AllocOption::Below4GiB),
            1 => Ok(AllocOption::Fixed),
            2 => Ok(AllocOption::Force),
            3 => Ok(AllocOption::Any),
            _ => {
                log::error!("unknown allocation option {}", value);
                Err(Error::InvalidParameter)
            }
        }
    }
}

/// The boot stage's claim table together with the page size used by
/// [`reserve`](Self::reserve).
///
/// One instance exists per boot; every loader component that needs physical
/// memory goes through it. Tests construct as many independent instances as
/// they like.
#[derive(Debug, Clone)]
pub struct RangeAllocator<const N: usize = MAX_RANGES> {
    table: RangeTable<N>,
    page_size: u64,
}

impl<const N: usize> RangeAllocator<N> {
    /// Creates an empty allocator using the architecture's page size.
    pub const fn new() -> Self {
        Self {
            table: RangeTable::new(),
            page_size: arch::PAGE_SIZE,
        }
    }

    /// Creates an empty allocator that reserves in units of `page_size`.
    ///
    /// The page size must be a power of two.
    pub fn with_page_size(page_size: u64) -> Result<Self, Error> {
        if !page_size.is_power_of_two() {
            log::error!("page size {} is not a power of two", page_size);
            return Err(Error::InvalidParameter);
        }

        Ok(Self {
            table: RangeTable::new(),
            page_size,
        })
    }

    /// Returns the page size used to round reservations.
    pub const fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Returns the underlying claim table.
    pub const fn table(&self) -> &RangeTable<N> {
        &self.table
    }

    /// Returns every claimed range in ascending address order.
    pub fn ranges(&self) -> &[MemoryRange] {
        self.table.as_slice()
    }

    /// Returns the number of disjoint claimed ranges.
    pub const fn len(&self) -> usize {
        self.table.len()
    }

    /// Returns true if nothing has been claimed yet.
    pub const fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Returns the maximum number of disjoint ranges the table can hold.
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Returns the total number of claimed bytes.
    pub fn claimed_bytes(&self) -> u128 {
        self.table.claimed_bytes()
    }

    /// Returns true if no byte of `[base, base + size)` has been claimed.
    pub fn is_free(&self, base: u64, size: u64) -> bool {
        self.table.is_free(base, size)
    }

    /// Claims `size` bytes of physical memory and returns their address.
    ///
    /// With [`AllocOption::Fixed`] or [`AllocOption::Force`] the claim starts
    /// at `addr` and `align` is ignored. The searching options ignore `addr`
    /// and return the lowest `align`-aligned hole that fits (first fit).
    ///
    /// A zero `size` always succeeds, returns 0 and claims nothing.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidParameter`] if a search is requested with `align == 0`.
    /// - [`Error::OutOfResources`] if a fixed claim overlaps an existing one,
    ///   if a claim would run past the top of the address space, if no hole
    ///   fits, or if the table has no room left.
    pub fn alloc(
        &mut self,
        addr: u64,
        size: u64,
        align: u64,
        option: AllocOption,
    ) -> Result<u64, Error> {
        if size == 0 {
            return Ok(0);
        }

        let base = match option {
            AllocOption::Fixed | AllocOption::Force => {
                let claim = MemoryRange::new(addr, size);
                if claim.overflows() {
                    log::error!(
                        "{} claim of {} at {} runs past the top of memory",
                        option,
                        HumanSize(size),
                        HumanAddress(addr)
                    );
                    return Err(Error::OutOfResources);
                }

                if option == AllocOption::Fixed && !self.table.is_free(addr, size) {
                    log::debug!("{} is already claimed", HumanRange(claim));
                    return Err(Error::OutOfResources);
                }

                addr
            }
            AllocOption::Below4GiB | AllocOption::Any => {
                if align == 0 {
                    log::error!("zero alignment requested");
                    return Err(Error::InvalidParameter);
                }

                let ceiling = match option {
                    AllocOption::Below4GiB => u128::from(FOUR_GIB),
                    _ => ADDRESS_SPACE,
                };

                match self.table.find_free(size, align, ceiling) {
                    Some(base) => base,
                    None => {
                        log::error!(
                            "no free memory for {} aligned to {} ({})",
                            HumanSize(size),
                            align,
                            option
                        );
                        return Err(Error::OutOfResources);
                    }
                }
            }
        };

        self.table.insert(MemoryRange::new(base, size))?;
        log::trace!("claimed {} ({})", HumanRange(MemoryRange::new(base, size)), option);

        if cfg!(any(test, feature = "paranoid")) {
            self.sanity_check();
        }

        Ok(base)
    }

    /// Claims exactly `[addr, addr + size)`, failing if any of it is taken.
    pub fn alloc_fixed(&mut self, addr: u64, size: u64) -> Result<u64, Error> {
        self.alloc(addr, size, ALIGN_ANY, AllocOption::Fixed)
    }

    /// Marks `[addr, addr + size)` as never available for allocation.
    ///
    /// The range is widened to whole pages (start rounded down, end rounded
    /// up) and claimed with [`AllocOption::Force`], so it merges with
    /// whatever is already claimed there. A zero `size` does nothing.
    pub fn reserve(&mut self, addr: u64, size: u64) -> Result<(), Error> {
        if size == 0 {
            return Ok(());
        }

        let requested = MemoryRange::new(addr, size);
        if requested.overflows() {
            log::error!(
                "reservation of {} at {} runs past the top of memory",
                HumanSize(size),
                HumanAddress(addr)
            );
            return Err(Error::OutOfResources);
        }

        let start = align_down(addr, self.page_size);
        let end = requested
            .exclusive_end()
            .next_multiple_of(u128::from(self.page_size));

        let length = match u64::try_from(end - u128::from(start)) {
            Ok(length) => length,
            Err(_) => {
                log::error!("cannot reserve the whole address space");
                return Err(Error::OutOfResources);
            }
        };

        self.alloc(start, length, ALIGN_ANY, AllocOption::Force)
            .map(|_| ())
    }

    /// Verifies the claim table and halts the boot if it is corrupted.
    ///
    /// An empty table is not treated as corruption: it is logged as a
    /// warning and the check returns, even though a boot that has already
    /// reconciled its memory map should never see one.
    ///
    /// # Panics
    ///
    /// Panics when any table invariant is broken. A corrupted claim table
    /// means no later memory operation can be trusted, including reporting
    /// the failure to a caller, so this is never returned as an error. The
    /// platform's panic handler decides whether to halt, reset or report.
    pub fn sanity_check(&self) {
        if self.table.is_empty() {
            log::warn!("range table is empty");
            return;
        }

        if let Err(corruption) = self.table.check() {
            log::error!("{}", corruption);
            self.dump();
            log::error!("range table is corrupted");
            panic!("range table is corrupted: {}", corruption);
        }
    }

    /// Logs every claimed range at debug level.
    pub fn dump(&self) {
        log::debug!(
            "range table: {} of {} entries, {} claimed",
            self.table.len(),
            N,
            HumanSize(u64::try_from(self.claimed_bytes()).unwrap_or(u64::MAX))
        );

        for (index, range) in self.table.iter().enumerate() {
            log::debug!("  [{}] {}", index, HumanRange(*range));
        }
    }

    /// Wraps an existing table, for tests that need a corrupted one.
    #[cfg(test)]
    pub(crate) fn from_table(table: RangeTable<N>) -> Self {
        Self {
            table,
            page_size: arch::PAGE_SIZE,
        }
    }
}

impl<const N: usize> Default for RangeAllocator<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// A [`RangeAllocator`] behind a spin lock, so the single boot-wide table can
/// live in a `static`.
///
/// The merge-insert is not safe under concurrent mutation; anything that
/// claims memory from more than one context must go through this wrapper.
pub struct SharedAllocator<const N: usize = MAX_RANGES> {
    inner: spin::Mutex<RangeAllocator<N>>,
}

impl<const N: usize> SharedAllocator<N> {
    /// Creates an empty shared allocator using the architecture's page size.
    pub const fn new() -> Self {
        Self {
            inner: spin::Mutex::new(RangeAllocator::new()),
        }
    }

    /// Wraps an already configured allocator.
    pub const fn from_allocator(allocator: RangeAllocator<N>) -> Self {
        Self {
            inner: spin::Mutex::new(allocator),
        }
    }

    /// See [`RangeAllocator::alloc`].
    pub fn alloc(
        &self,
        addr: u64,
        size: u64,
        align: u64,
        option: AllocOption,
    ) -> Result<u64, Error> {
        self.inner.lock().alloc(addr, size, align, option)
    }

    /// See [`RangeAllocator::reserve`].
    pub fn reserve(&self, addr: u64, size: u64) -> Result<(), Error> {
        self.inner.lock().reserve(addr, size)
    }

    /// See [`RangeAllocator::sanity_check`].
    pub fn sanity_check(&self) {
        self.inner.lock().sanity_check();
    }

    /// Locks the allocator for a sequence of operations, such as reconciling
    /// the firmware memory map.
    pub fn lock(&self) -> spin::MutexGuard<'_, RangeAllocator<N>> {
        self.inner.lock()
    }
}

impl<const N: usize> Default for SharedAllocator<N> {
    fn default() -> Self {
        Self::new()
    }
}
