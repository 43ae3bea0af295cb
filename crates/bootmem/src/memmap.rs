//! Firmware memory map reconciliation.
//!
//! Firmware reports physical memory as a list of typed descriptors that may
//! arrive unsorted, overlapping, or split into many small pieces of the same
//! type. This module turns that list into a canonical map (sorted by base
//! with same-kind neighbours merged) and pushes everything that must never
//! be handed out into a [`RangeAllocator`]: the space above the highest
//! descriptor, every hole no descriptor covers, and every descriptor whose
//! type is not allocatable.
//!
//! # Reconciling a Boot Map
//!
//! Implement [`BootMemoryRegion`] on the platform's memory map entry type,
//! copy the entries into caller-provided storage with
//! [`MemoryMap::from_boot_map`] (or wrap [`FirmwareDescriptor`]s directly),
//! then reconcile into the boot allocator:
//!
//! ```
//! use bootmem::{FirmwareDescriptor, MemoryMap, MemoryType, RangeAllocator};
//!
//! let mut storage = [
//!     FirmwareDescriptor::new(0x10_0000, 0x7FF0_0000, MemoryType::AVAILABLE),
//!     FirmwareDescriptor::new(0x0, 0x9_F000, MemoryType::AVAILABLE),
//!     FirmwareDescriptor::new(0x9_F000, 0x1000, MemoryType::RESERVED),
//! ];
//!
//! let mut allocator = RangeAllocator::<64>::new();
//! let mut map = MemoryMap::new(&mut storage);
//! map.reconcile_into(&mut allocator)?;
//!
//! assert!(allocator.is_free(0x10_0000, 0x1000));
//! assert!(!allocator.is_free(0xA_0000, 1));
//! assert!(!allocator.is_free(0x8000_0000, 1));
//! # Ok::<(), bootmem::Error>(())
//! ```
//!
//! Boot-loader memory (type [`MemoryType::BOOTLOADER`]) is treated as free by
//! [`derive_blacklist`], since the loader's own code and data become garbage
//! once the OS runs. Until [`blacklist_bootloader`] has been called, anything
//! claimed inside it may still be live and must only be filled during the
//! final relocation.

use core::fmt;

use crate::allocator::RangeAllocator;
use crate::arch::ADDRESS_SPACE;
use crate::error::Error;
use crate::sort::stable_sort;
use crate::{HumanAddress, HumanRange, HumanSize, MemoryRange};

/// Extended attribute bit marking a descriptor as enabled.
pub const ATTR_ENABLED: u32 = 0x1;

/// Firmware memory type, using the ACPI address range type numbering.
///
/// Unknown values are kept as-is and treated as not allocatable.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct MemoryType(pub u32);

impl MemoryType {
    /// Usable RAM.
    pub const AVAILABLE: MemoryType = MemoryType(1);
    /// Reserved by the firmware or the platform.
    pub const RESERVED: MemoryType = MemoryType(2);
    /// ACPI tables, reclaimable once the OS has read them.
    pub const ACPI: MemoryType = MemoryType(3);
    /// ACPI non-volatile storage, preserved across sleep states.
    pub const ACPI_NVS: MemoryType = MemoryType(4);
    /// Memory with detected errors.
    pub const UNUSABLE: MemoryType = MemoryType(5);
    /// Memory that is present but not enabled.
    pub const DISABLED: MemoryType = MemoryType(6);
    /// Persistent (non-volatile) memory.
    pub const PMEM: MemoryType = MemoryType(7);
    /// UEFI runtime services code.
    pub const RTS_CODE: MemoryType = MemoryType(100);
    /// UEFI runtime services data.
    pub const RTS_DATA: MemoryType = MemoryType(101);
    /// Memory-mapped I/O used by UEFI runtime services.
    pub const RTS_MMIO: MemoryType = MemoryType(102);
    /// Memory owned by the boot loader itself.
    pub const BOOTLOADER: MemoryType = MemoryType(0xFFFF_FFFF);

    /// Returns a short name for known types, or `None`.
    pub const fn name(self) -> Option<&'static str> {
        let name = match self.0 {
            1 => "available",
            2 => "reserved",
            3 => "ACPI",
            4 => "ACPI NVS",
            5 => "unusable",
            6 => "disabled",
            7 => "persistent",
            100 => "runtime code",
            101 => "runtime data",
            102 => "runtime MMIO",
            0xFFFF_FFFF => "boot loader",
            _ => return None,
        };
        Some(name)
    }

    /// Returns true if memory of this type may be handed out by the allocator.
    pub const fn is_allocatable(self) -> bool {
        self.0 == Self::AVAILABLE.0 || self.0 == Self::BOOTLOADER.0
    }
}

impl fmt::Debug for MemoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "MemoryType({:#x})", self.0),
        }
    }
}

/// One entry of a firmware memory map, laid out like an E820 entry with
/// extended attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct FirmwareDescriptor {
    pub base: u64,
    pub length: u64,
    pub memory_type: MemoryType,
    pub attributes: u32,
}

impl FirmwareDescriptor {
    /// Creates an enabled descriptor.
    pub const fn new(base: u64, length: u64, memory_type: MemoryType) -> Self {
        Self::with_attributes(base, length, memory_type, ATTR_ENABLED)
    }

    /// Creates a descriptor with explicit extended attributes.
    pub const fn with_attributes(
        base: u64,
        length: u64,
        memory_type: MemoryType,
        attributes: u32,
    ) -> Self {
        Self {
            base,
            length,
            memory_type,
            attributes,
        }
    }

    /// Returns the physical range this descriptor covers.
    pub const fn range(&self) -> MemoryRange {
        MemoryRange::new(self.base, self.length)
    }

    /// Returns true if both descriptors have the same type and attributes.
    pub fn same_kind(&self, other: &FirmwareDescriptor) -> bool {
        self.memory_type == other.memory_type && self.attributes == other.attributes
    }
}

/// An entry of a platform-specific boot memory map.
///
/// Implement this on whatever the firmware hands over so that
/// [`MemoryMap::from_boot_map`] can ingest it.
pub trait BootMemoryRegion {
    /// Returns the base physical address of this region.
    fn base(&self) -> u64;

    /// Returns the size of this region in bytes.
    fn length(&self) -> u64;

    /// Returns the firmware type of this region.
    fn memory_type(&self) -> MemoryType;

    /// Returns the extended attributes of this region.
    fn attributes(&self) -> u32 {
        ATTR_ENABLED
    }
}

impl BootMemoryRegion for FirmwareDescriptor {
    fn base(&self) -> u64 {
        self.base
    }

    fn length(&self) -> u64 {
        self.length
    }

    fn memory_type(&self) -> MemoryType {
        self.memory_type
    }

    fn attributes(&self) -> u32 {
        self.attributes
    }
}

/// Sorts `entries` by base address and collapses every run of overlapping or
/// touching descriptors of the same kind into one.
///
/// Descriptors sharing a base keep their firmware order. Returns the number
/// of descriptors in the canonical map, which occupies the front of
/// `entries`; whatever lies past it is unspecified. Running it again on the
/// result changes nothing.
pub fn merge(entries: &mut [FirmwareDescriptor]) -> usize {
    if entries.is_empty() {
        return 0;
    }

    stable_sort(entries, |a, b| a.base.cmp(&b.base));

    let mut last = 0;
    for index in 1..entries.len() {
        let next = entries[index];
        let current = entries[last];

        // Overflowing descriptors never merge; `validate` must still see them.
        let overflows = current.range().overflows() || next.range().overflows();
        if !overflows && current.same_kind(&next) && current.range().mergeable(&next.range()) {
            // A union covering all 2^64 bytes has no u64 length.
            if let Some(span) = current.range().union(&next.range()) {
                entries[last].base = span.base();
                entries[last].length = span.length();
                continue;
            }
        }

        last += 1;
        entries[last] = next;
    }

    let count = last + 1;
    log::trace!("merged {} memory map entries into {}", entries.len(), count);
    count
}

/// Checks that a canonical memory map is sorted and stays within the address
/// space.
///
/// Overlapping descriptors are logged as a warning but accepted. Whenever
/// anything is found, the whole map is dumped at debug level.
///
/// # Errors
///
/// [`Error::InvalidParameter`] if a descriptor starts below its predecessor,
/// runs past the top of the address space, or reaches the top without being
/// the last descriptor.
pub fn validate(entries: &[FirmwareDescriptor]) -> Result<(), Error> {
    let mut result = Ok(());
    let mut overlapping = false;
    let mut covered: u128 = 0;

    for (index, entry) in entries.iter().enumerate() {
        let range = entry.range();

        if index > 0 {
            let previous = &entries[index - 1];
            if entry.base < previous.base {
                log::error!(
                    "memory map entry {} {} starts below entry {} {}",
                    index,
                    HumanRange(range),
                    index - 1,
                    HumanRange(previous.range())
                );
                result = Err(Error::InvalidParameter);
            } else if range.length() != 0 && u128::from(entry.base) < covered {
                log::warn!(
                    "memory map entry {} {} ({:?}) overlaps an earlier entry",
                    index,
                    HumanRange(range),
                    entry.memory_type
                );
                overlapping = true;
            }
        }

        if range.overflows() || (range.reaches_top() && index + 1 != entries.len()) {
            log::error!(
                "memory map entry {} at {:#x} with length {:#x} overflows",
                index,
                entry.base,
                entry.length
            );
            result = Err(Error::InvalidParameter);
        }

        covered = covered.max(range.exclusive_end());
    }

    if result.is_err() || overlapping {
        dump(entries);
    }

    result
}

/// Logs every descriptor at debug level.
pub fn dump(entries: &[FirmwareDescriptor]) {
    log::debug!("memory map: {} entries", entries.len());
    for (index, entry) in entries.iter().enumerate() {
        log::debug!(
            "  [{}] {} {:?} attributes {:#x}",
            index,
            HumanRange(entry.range()),
            entry.memory_type,
            entry.attributes
        );
    }
}

/// Reserves every part of the address space a canonical memory map does not
/// describe as allocatable.
///
/// That is the space above the highest descriptor, every gap between
/// descriptors, and every descriptor whose type is neither available nor
/// boot loader memory. Zero-length descriptors are ignored, and descriptors
/// covered by an earlier, longer one never open a gap.
///
/// # Errors
///
/// - [`Error::InvalidParameter`] if [`validate`] rejects the map, or it
///   describes no memory at all.
/// - Any error from [`RangeAllocator::reserve`].
pub fn derive_blacklist<const N: usize>(
    entries: &[FirmwareDescriptor],
    allocator: &mut RangeAllocator<N>,
) -> Result<(), Error> {
    validate(entries)?;

    let top = entries
        .iter()
        .map(FirmwareDescriptor::range)
        .filter(|range| range.length() != 0)
        .map(|range| range.exclusive_end())
        .max();

    let Some(top) = top else {
        log::error!("memory map describes no memory");
        return Err(Error::InvalidParameter);
    };

    if top < ADDRESS_SPACE {
        log::trace!("blacklisting everything above {}", HumanAddress(top as u64));
        allocator.reserve(top as u64, (ADDRESS_SPACE - top) as u64)?;
    }

    let mut covered: u128 = 0;
    for entry in entries.iter().filter(|entry| entry.length != 0) {
        let range = entry.range();

        if u128::from(entry.base) > covered {
            let gap = MemoryRange::new(covered as u64, entry.base - covered as u64);
            log::trace!("blacklisting gap {}", HumanRange(gap));
            allocator.reserve(gap.base(), gap.length())?;
        }

        if !entry.memory_type.is_allocatable() {
            log::trace!("blacklisting {} ({:?})", HumanRange(range), entry.memory_type);
            allocator.reserve(entry.base, entry.length)?;
        }

        covered = covered.max(range.exclusive_end());
    }

    log::debug!(
        "memory map blacklisted into {} ranges, {} claimed",
        allocator.len(),
        HumanSize(u64::try_from(allocator.claimed_bytes()).unwrap_or(u64::MAX))
    );

    Ok(())
}

/// Reserves every boot loader descriptor.
///
/// After this returns, memory claimed from the allocator no longer aliases
/// anything the loader is using and may be written immediately.
pub fn blacklist_bootloader<const N: usize>(
    entries: &[FirmwareDescriptor],
    allocator: &mut RangeAllocator<N>,
) -> Result<(), Error> {
    for entry in entries
        .iter()
        .filter(|entry| entry.memory_type == MemoryType::BOOTLOADER && entry.length != 0)
    {
        log::trace!("blacklisting boot loader memory {}", HumanRange(entry.range()));
        allocator.reserve(entry.base, entry.length)?;
    }

    Ok(())
}

/// Merges a raw firmware map in place and blacklists it into `allocator`.
///
/// Returns the length of the canonical map at the front of `entries`.
pub fn reconcile<const N: usize>(
    entries: &mut [FirmwareDescriptor],
    allocator: &mut RangeAllocator<N>,
) -> Result<usize, Error> {
    let count = merge(entries);
    derive_blacklist(&entries[..count], allocator)?;
    Ok(count)
}

/// A firmware memory map held in caller-provided storage.
pub struct MemoryMap<'a> {
    entries: &'a mut [FirmwareDescriptor],
    len: usize,
}

impl<'a> MemoryMap<'a> {
    /// Wraps a raw descriptor list; every element is an entry.
    pub fn new(entries: &'a mut [FirmwareDescriptor]) -> Self {
        let len = entries.len();
        Self { entries, len }
    }

    /// Copies a platform boot map into `storage`.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfResources`] if `storage` is shorter than `boot_map`.
    pub fn from_boot_map<R: BootMemoryRegion>(
        boot_map: &[R],
        storage: &'a mut [FirmwareDescriptor],
    ) -> Result<Self, Error> {
        if boot_map.len() > storage.len() {
            log::error!(
                "boot map has {} entries but only {} fit",
                boot_map.len(),
                storage.len()
            );
            return Err(Error::OutOfResources);
        }

        for (slot, region) in storage.iter_mut().zip(boot_map) {
            *slot = FirmwareDescriptor::with_attributes(
                region.base(),
                region.length(),
                region.memory_type(),
                region.attributes(),
            );
        }

        log::trace!("copied {} boot map entries", boot_map.len());

        Ok(Self {
            entries: storage,
            len: boot_map.len(),
        })
    }

    /// Returns the current entries, canonical once [`merge`](Self::merge) ran.
    pub fn entries(&self) -> &[FirmwareDescriptor] {
        &self.entries[..self.len]
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the map has no entries.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// See [`merge`]. Returns the new entry count.
    pub fn merge(&mut self) -> usize {
        self.len = merge(&mut self.entries[..self.len]);
        self.len
    }

    /// See [`validate`].
    pub fn validate(&self) -> Result<(), Error> {
        validate(self.entries())
    }

    /// See [`derive_blacklist`].
    pub fn blacklist_into<const N: usize>(
        &self,
        allocator: &mut RangeAllocator<N>,
    ) -> Result<(), Error> {
        derive_blacklist(self.entries(), allocator)
    }

    /// See [`blacklist_bootloader`].
    pub fn blacklist_bootloader_into<const N: usize>(
        &self,
        allocator: &mut RangeAllocator<N>,
    ) -> Result<(), Error> {
        blacklist_bootloader(self.entries(), allocator)
    }

    /// Merges the map and blacklists it into `allocator`.
    pub fn reconcile_into<const N: usize>(
        &mut self,
        allocator: &mut RangeAllocator<N>,
    ) -> Result<usize, Error> {
        self.merge();
        self.blacklist_into(allocator)?;
        Ok(self.len)
    }

    /// Returns the number of bytes described with the given type.
    pub fn bytes_of(&self, memory_type: MemoryType) -> u128 {
        self.entries()
            .iter()
            .filter(|entry| entry.memory_type == memory_type)
            .map(|entry| u128::from(entry.length))
            .sum()
    }
}
