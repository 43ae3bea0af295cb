//! In-place stable sorting for fixed-size records.
//!
//! `core` only offers unstable sorts without an allocator, and the memory map
//! reconciler relies on descriptors that share a base address keeping their
//! firmware order.

use core::cmp::Ordering;

/// Sorts `records` in place by `compare`, keeping records that compare equal
/// in their original relative order.
///
/// Binary insertion sort: each record is moved behind the last already-sorted
/// record that does not compare greater than it. Linear on sorted input and
/// quadratic in moves at worst, which is fine for firmware memory maps of a
/// few hundred entries. Never allocates.
pub fn stable_sort<T, F>(records: &mut [T], mut compare: F)
where
    F: FnMut(&T, &T) -> Ordering,
{
    for index in 1..records.len() {
        let (sorted, unsorted) = records.split_at(index);
        let record = &unsorted[0];
        let slot = sorted.partition_point(|probe| compare(probe, record) != Ordering::Greater);

        if slot < index {
            records[slot..=index].rotate_right(1);
        }
    }
}
