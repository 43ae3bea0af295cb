//! The range table: every physical range claimed so far during boot.
//!
//! Entries live in a fixed-capacity array because the table is needed before
//! any heap exists. The table only grows; claims are never released. Between
//! operations it upholds:
//!
//! 1. strictly increasing base addresses,
//! 2. no overlapping entries,
//! 3. no touching entries (touching claims are merged into one),
//! 4. no zero-length entries,
//! 5. no entry passes the top of the address space, and only the last entry
//!    may end exactly at it.

use crate::arch::ADDRESS_SPACE;
use crate::error::{Corruption, CorruptionKind, Error};
use crate::{HumanAddress, HumanRange, HumanSize, MemoryRange, align_up};

/// Default capacity of a range table.
pub const MAX_RANGES: usize = 4096;

/// Sorted, maximally merged set of claimed physical ranges.
#[derive(Debug, Clone)]
pub struct RangeTable<const N: usize = MAX_RANGES> {
    ranges: [MemoryRange; N],
    count: usize,
}

impl<const N: usize> RangeTable<N> {
    /// Creates an empty table.
    pub const fn new() -> Self {
        Self {
            ranges: [MemoryRange::EMPTY; N],
            count: 0,
        }
    }

    /// Returns the number of entries.
    pub const fn len(&self) -> usize {
        self.count
    }

    /// Returns true if nothing has been claimed yet.
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Returns true if no further disjoint range can be inserted.
    pub const fn is_full(&self) -> bool {
        self.count >= N
    }

    /// Returns the maximum number of entries.
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Returns the entries in ascending address order.
    pub fn as_slice(&self) -> &[MemoryRange] {
        &self.ranges[..self.count]
    }

    /// Returns an iterator over the entries in ascending address order.
    pub fn iter(&self) -> impl Iterator<Item = &MemoryRange> {
        self.as_slice().iter()
    }

    /// Returns the total number of claimed bytes.
    pub fn claimed_bytes(&self) -> u128 {
        self.iter().map(|range| u128::from(range.length())).sum()
    }

    /// Returns true if no byte of `[base, base + length)` has been claimed.
    pub fn is_free(&self, base: u64, length: u64) -> bool {
        let candidate = MemoryRange::new(base, length);
        !self.iter().any(|range| range.overlaps(&candidate))
    }

    /// Claims `range`, merging it with every entry it overlaps or touches.
    ///
    /// A single insert can swallow any number of existing entries. Fails with
    /// [`Error::OutOfResources`] if the range needs a new slot and the table
    /// is full, or if the merged range would cover the entire address space.
    /// A range running past the top of the address space is rejected with
    /// the same error. The table is unchanged on failure.
    pub fn insert(&mut self, range: MemoryRange) -> Result<(), Error> {
        if range.length() == 0 {
            return Ok(());
        }

        if range.overflows() {
            log::error!(
                "{} at {} runs past the top of memory",
                HumanSize(range.length()),
                HumanAddress(range.base())
            );
            return Err(Error::OutOfResources);
        }

        let entries = self.as_slice();
        let first = entries
            .iter()
            .position(|entry| range.base() <= entry.base() || range.mergeable(entry))
            .unwrap_or(self.count);
        let run = entries[first..]
            .iter()
            .take_while(|entry| range.mergeable(entry))
            .count();

        if run == 0 {
            if self.is_full() {
                log::error!(
                    "range table is full ({} entries), cannot claim {}",
                    N,
                    HumanRange(range)
                );
                return Err(Error::OutOfResources);
            }

            self.ranges.copy_within(first..self.count, first + 1);
            self.ranges[first] = range;
            self.count += 1;
            return Ok(());
        }

        let mut merged = range;
        for entry in &entries[first..first + run] {
            merged = match merged.union(entry) {
                Some(union) => union,
                None => {
                    log::error!(
                        "claiming {} would cover the whole address space",
                        HumanRange(range)
                    );
                    return Err(Error::OutOfResources);
                }
            };
        }

        if run > 1 {
            log::trace!("{} merges {} claimed ranges", HumanRange(range), run);
        }

        self.ranges.copy_within(first + run..self.count, first + 1);
        self.ranges[first] = merged;
        self.count -= run - 1;
        Ok(())
    }

    /// Finds the lowest `align`-aligned address where `size` unclaimed bytes
    /// fit and end at or below `ceiling` (an exclusive bound).
    ///
    /// Holes are visited in ascending order: before the first entry, between
    /// entries, then after the last entry. The first one that fits wins.
    /// Does not claim anything. `align` must not be zero.
    pub fn find_free(&self, size: u64, align: u64, ceiling: u128) -> Option<u64> {
        let mut hole_base = 0u128;

        for entry in self.iter() {
            if hole_base >= ceiling {
                return None;
            }
            let hole_end = u128::from(entry.base());
            if let Some(address) = fit(hole_base, hole_end, size, align, ceiling) {
                return Some(address);
            }
            hole_base = entry.exclusive_end();
        }

        fit(hole_base, ADDRESS_SPACE, size, align, ceiling)
    }

    /// Verifies every table invariant, reporting the first violation.
    pub fn check(&self) -> Result<(), Corruption> {
        let mut previous: Option<&MemoryRange> = None;

        for (index, range) in self.iter().enumerate() {
            let is_last = index + 1 == self.count;

            let kind = if range.length() == 0 {
                Some(CorruptionKind::ZeroLength)
            } else if range.overflows() || (range.reaches_top() && !is_last) {
                Some(CorruptionKind::Overflow)
            } else {
                match previous {
                    Some(previous)
                        if range.base() <= previous.base() || previous.overlaps(range) =>
                    {
                        Some(CorruptionKind::Unsorted)
                    }
                    Some(previous) if previous.mergeable(range) => Some(CorruptionKind::Unmerged),
                    _ => None,
                }
            };

            if let Some(kind) = kind {
                return Err(Corruption {
                    index,
                    range: *range,
                    kind,
                });
            }

            previous = Some(range);
        }

        Ok(())
    }

    /// Builds a table from raw entries without checking them, so tests can
    /// exercise the corruption paths.
    #[cfg(test)]
    pub(crate) fn from_raw(entries: &[MemoryRange]) -> Self {
        let mut table = Self::new();
        table.ranges[..entries.len()].copy_from_slice(entries);
        table.count = entries.len();
        table
    }
}

impl<const N: usize> Default for RangeTable<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Places `size` bytes at the first `align` boundary inside the hole
/// `[hole_base, hole_end)`, if they fit below `ceiling`.
fn fit(hole_base: u128, hole_end: u128, size: u64, align: u64, ceiling: u128) -> Option<u64> {
    if hole_base >= hole_end {
        return None;
    }

    let base = u64::try_from(hole_base).ok()?;
    let address = align_up(base, align)?;
    let end = u128::from(address) + u128::from(size);

    (end <= hole_end && end <= ceiling).then_some(address)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOP: u128 = ADDRESS_SPACE;

    fn table_of(claims: &[(u64, u64)]) -> RangeTable<16> {
        let mut table = RangeTable::new();
        for &(base, length) in claims {
            table.insert(MemoryRange::new(base, length)).unwrap();
        }
        table
    }

    fn entries(table: &RangeTable<16>) -> Vec<(u64, u64)> {
        table
            .iter()
            .map(|range| (range.base(), range.length()))
            .collect()
    }

    #[test]
    fn starts_empty() {
        let table = RangeTable::<16>::new();
        assert!(table.is_empty());
        assert_eq!(table.capacity(), 16);
        assert_eq!(table.claimed_bytes(), 0);
        assert!(table.check().is_ok());
    }

    #[test]
    fn inserts_keep_base_order() {
        let table = table_of(&[(0x5000, 0x1000), (0x1000, 0x1000), (0x3000, 0x1000)]);
        assert_eq!(
            entries(&table),
            [(0x1000, 0x1000), (0x3000, 0x1000), (0x5000, 0x1000)]
        );
        assert!(table.check().is_ok());
    }

    #[test]
    fn zero_length_insert_is_ignored() {
        let table = table_of(&[(0x1000, 0)]);
        assert!(table.is_empty());
    }

    #[test]
    fn touching_claims_merge() {
        let table = table_of(&[(0x1000, 0x1000), (0x2000, 0x1000)]);
        assert_eq!(entries(&table), [(0x1000, 0x2000)]);

        let table = table_of(&[(0x2000, 0x1000), (0x1000, 0x1000)]);
        assert_eq!(entries(&table), [(0x1000, 0x2000)]);
    }

    #[test]
    fn one_insert_merges_many_entries() {
        let mut table = table_of(&[
            (0x1000, 0x1000),
            (0x3000, 0x1000),
            (0x5000, 0x1000),
            (0x7000, 0x1000),
            (0x9000, 0x1000),
        ]);

        table.insert(MemoryRange::new(0x2800, 0x5000)).unwrap();

        assert_eq!(
            entries(&table),
            [(0x1000, 0x1000), (0x2800, 0x5800), (0x9000, 0x1000)]
        );
        assert!(table.check().is_ok());
    }

    #[test]
    fn insert_inside_existing_entry() {
        let table = table_of(&[(0x1000, 0x4000), (0x2000, 0x10)]);
        assert_eq!(entries(&table), [(0x1000, 0x4000)]);
    }

    #[test]
    fn claim_to_top_of_space() {
        let table = table_of(&[(0x1000, 0x1000), (0x4000, 0u64.wrapping_sub(0x4000))]);
        assert_eq!(table.len(), 2);
        assert!(table.as_slice()[1].reaches_top());
        assert!(table.check().is_ok());
    }

    #[test]
    fn merge_into_top_of_space() {
        let table = table_of(&[(0x4000, 0u64.wrapping_sub(0x4000)), (0x3000, 0x1000)]);
        assert_eq!(entries(&table), [(0x3000, 0u64.wrapping_sub(0x3000))]);
    }

    #[test]
    fn whole_address_space_is_rejected() {
        let mut table = table_of(&[(0x1000, 0u64.wrapping_sub(0x1000))]);
        assert_eq!(
            table.insert(MemoryRange::new(0, 0x1000)),
            Err(Error::OutOfResources)
        );
        assert_eq!(entries(&table), [(0x1000, 0u64.wrapping_sub(0x1000))]);
    }

    #[test]
    fn insert_past_the_top_is_rejected() {
        let mut table = RangeTable::<16>::new();
        assert_eq!(
            table.insert(MemoryRange::new(u64::MAX, 2)),
            Err(Error::OutOfResources)
        );
        assert!(table.is_empty());

        table.insert(MemoryRange::new(u64::MAX, 1)).unwrap();
        assert!(table.check().is_ok());
    }

    #[test]
    fn full_table_rejects_new_slot_but_still_merges() {
        let mut table = RangeTable::<2>::new();
        table.insert(MemoryRange::new(0x1000, 0x1000)).unwrap();
        table.insert(MemoryRange::new(0x3000, 0x1000)).unwrap();
        assert!(table.is_full());

        assert_eq!(
            table.insert(MemoryRange::new(0x6000, 0x1000)),
            Err(Error::OutOfResources)
        );
        assert_eq!(table.len(), 2);

        table.insert(MemoryRange::new(0x2000, 0x1000)).unwrap();
        assert_eq!(table.as_slice(), [MemoryRange::new(0x1000, 0x3000)]);

        table.insert(MemoryRange::new(0x6000, 0x1000)).unwrap();
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn is_free_detects_overlap() {
        let table = table_of(&[(0x1000, 0x1000)]);
        assert!(table.is_free(0x0, 0x1000));
        assert!(table.is_free(0x2000, 0x1000));
        assert!(!table.is_free(0x1FFF, 0x2));
        assert!(!table.is_free(0x0, 0x10_0000));
    }

    #[test]
    fn find_free_in_empty_table() {
        let table = RangeTable::<16>::new();
        assert_eq!(table.find_free(0x1000, 0x1000, TOP), Some(0));
    }

    #[test]
    fn find_free_is_first_fit() {
        // Holes of 0x10, 0x100 and 0x10 bytes.
        let table = table_of(&[
            (0x0, 0x100),
            (0x110, 0xF0),
            (0x300, 0x100),
            (0x410, 0u64.wrapping_sub(0x410)),
        ]);

        assert_eq!(table.find_free(0x10, 1, TOP), Some(0x100));
        assert_eq!(table.find_free(0x20, 1, TOP), Some(0x200));
        assert_eq!(table.find_free(0x101, 1, TOP), None);
    }

    #[test]
    fn find_free_pads_for_alignment() {
        let table = table_of(&[(0x0, 0x1010), (0x3000, 0x1000)]);
        assert_eq!(table.find_free(0x1000, 0x1000, TOP), Some(0x2000));
        assert_eq!(table.find_free(0x1800, 0x1000, TOP), Some(0x4000));
        assert_eq!(table.find_free(0x10, 0x18, TOP), Some(0x1020));
    }

    #[test]
    fn find_free_uses_hole_after_last_entry() {
        let table = table_of(&[(0x0, 0x1000)]);
        assert_eq!(table.find_free(0x1000, 1, TOP), Some(0x1000));
    }

    #[test]
    fn find_free_up_to_the_last_byte() {
        let table = table_of(&[(0x0, u64::MAX - 0xFFF)]);
        assert_eq!(table.find_free(0x1000, 1, TOP), Some(u64::MAX - 0xFFF));
        assert_eq!(table.find_free(0x1001, 1, TOP), None);
    }

    #[test]
    fn find_free_respects_ceiling() {
        let table = table_of(&[(0x0, 0x1000)]);
        assert_eq!(table.find_free(0x1000, 1, 0x2000), Some(0x1000));
        assert_eq!(table.find_free(0x1001, 1, 0x2000), None);
    }

    #[test]
    fn find_free_alignment_overflow_does_not_fit() {
        let table = table_of(&[(0x0, u64::MAX - 0x10)]);
        assert_eq!(table.find_free(1, 0x1000, TOP), None);
    }

    #[test]
    fn check_reports_zero_length() {
        let table = RangeTable::<4>::from_raw(&[MemoryRange::new(0x1000, 0)]);
        let corruption = table.check().unwrap_err();
        assert_eq!(corruption.index, 0);
        assert_eq!(corruption.kind, CorruptionKind::ZeroLength);
    }

    #[test]
    fn check_reports_unsorted() {
        let table = RangeTable::<4>::from_raw(&[
            MemoryRange::new(0x3000, 0x1000),
            MemoryRange::new(0x1000, 0x1000),
        ]);
        let corruption = table.check().unwrap_err();
        assert_eq!(corruption.index, 1);
        assert_eq!(corruption.kind, CorruptionKind::Unsorted);
    }

    #[test]
    fn check_reports_overlap_as_unsorted() {
        let table = RangeTable::<4>::from_raw(&[
            MemoryRange::new(0x1000, 0x2000),
            MemoryRange::new(0x2000, 0x2000),
        ]);
        assert_eq!(table.check().unwrap_err().kind, CorruptionKind::Unsorted);
    }

    #[test]
    fn check_reports_unmerged_neighbours() {
        let table = RangeTable::<4>::from_raw(&[
            MemoryRange::new(0x1000, 0x1000),
            MemoryRange::new(0x2000, 0x1000),
        ]);
        assert_eq!(table.check().unwrap_err().kind, CorruptionKind::Unmerged);
    }

    #[test]
    fn check_reports_overflow() {
        let table = RangeTable::<4>::from_raw(&[MemoryRange::new(u64::MAX, 2)]);
        assert_eq!(table.check().unwrap_err().kind, CorruptionKind::Overflow);

        let table = RangeTable::<4>::from_raw(&[
            MemoryRange::new(0x1000, 0u64.wrapping_sub(0x1000)),
            MemoryRange::new(0x10, 0x10),
        ]);
        let corruption = table.check().unwrap_err();
        assert_eq!(corruption.index, 0);
        assert_eq!(corruption.kind, CorruptionKind::Overflow);
    }
}
