#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `measure` tracks which byte ranges of an image a transfer ticket has
//! actually accessed. The daemon merges every completed request's range into
//! the ticket's [`RangeList`]; the list's [`RangeList::sum`] is the ticket's
//! `transferred` counter, so re-reading the same bytes never inflates the
//! number reported to the controller.
//!
//! # Design
//!
//! A [`Range`] is a half-open `[start, end)` interval ordered by
//! `(start, end)`. [`RangeList`] keeps its ranges sorted and disjoint:
//! insertion places the new range in sorted position and a single linear pass
//! merges overlapping or touching neighbours. Zero-length ranges carry no
//! information and are dropped on insertion.
//!
//! # Invariants
//!
//! - After any mutation the list contains no duplicates, no overlaps, and no
//!   contiguous touches (`a.end == b.start` never survives a merge).
//! - `sum()` equals the size of the union of every range ever added.
//!
//! # Examples
//!
//! ```
//! use measure::{Range, RangeList};
//!
//! let mut ranges = RangeList::new();
//! ranges.add(Range::new(0, 100));
//! ranges.add(Range::new(100, 200));
//! ranges.add(Range::new(50, 150));
//! assert_eq!(ranges.sum(), 200);
//! ```

use std::fmt;

/// A half-open byte interval `[start, end)`.
///
/// Ranges are ordered by `(start, end)` so a sorted sequence can be merged in
/// one linear pass.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct Range {
    /// First byte covered by the range.
    pub start: u64,
    /// First byte past the range.
    pub end: u64,
}

impl Range {
    /// Creates a range covering `[start, end)`.
    ///
    /// # Panics
    ///
    /// Panics if `end < start`; callers construct ranges from validated
    /// request offsets.
    #[must_use]
    pub fn new(start: u64, end: u64) -> Self {
        assert!(end >= start, "invalid range: end {end} < start {start}");
        Self { start, end }
    }

    /// Number of bytes covered by the range.
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Whether the range covers no bytes.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// A sorted list of disjoint ranges with overlap merging.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RangeList {
    ranges: Vec<Range>,
}

impl RangeList {
    /// Creates an empty list.
    #[must_use]
    pub const fn new() -> Self {
        Self { ranges: Vec::new() }
    }

    /// Adds a single range, keeping the list sorted and merged.
    pub fn add(&mut self, r: Range) {
        if r.is_empty() {
            return;
        }
        let at = self.ranges.partition_point(|other| *other < r);
        self.ranges.insert(at, r);
        self.merge();
    }

    /// Extends the list from unsorted ranges, then sorts and merges once.
    pub fn update<I: IntoIterator<Item = Range>>(&mut self, ranges: I) {
        self.ranges.extend(ranges.into_iter().filter(|r| !r.is_empty()));
        self.ranges.sort_unstable();
        self.merge();
    }

    /// Total number of bytes covered by the merged ranges.
    #[must_use]
    pub fn sum(&self) -> u64 {
        self.ranges.iter().map(Range::len).sum()
    }

    /// The merged ranges, sorted and disjoint.
    #[must_use]
    pub fn as_slice(&self) -> &[Range] {
        &self.ranges
    }

    // Merge a sorted list in place. The input may contain consecutive ranges
    // (very likely), duplicates, and ranges overlapping other ranges.
    fn merge(&mut self) {
        let mut merged: usize = 0;
        for i in 1..self.ranges.len() {
            let r = self.ranges[i];
            let current = &mut self.ranges[merged];
            if current.end >= r.start {
                current.end = current.end.max(r.end);
            } else {
                merged += 1;
                self.ranges[merged] = r;
            }
        }
        self.ranges.truncate(if self.ranges.is_empty() { 0 } else { merged + 1 });
    }
}

#[cfg(test)]
mod tests {
    use super::{Range, RangeList};
    use proptest::prelude::*;

    #[test]
    fn empty_list_sums_to_zero() {
        assert_eq!(RangeList::new().sum(), 0);
        assert!(RangeList::new().as_slice().is_empty());
    }

    #[test]
    fn add_keeps_disjoint_ranges() {
        let mut list = RangeList::new();
        list.add(Range::new(200, 300));
        list.add(Range::new(0, 100));
        assert_eq!(list.as_slice(), &[Range::new(0, 100), Range::new(200, 300)]);
        assert_eq!(list.sum(), 200);
    }

    #[test]
    fn add_merges_consecutive_ranges() {
        let mut list = RangeList::new();
        list.add(Range::new(0, 100));
        list.add(Range::new(100, 200));
        assert_eq!(list.as_slice(), &[Range::new(0, 200)]);
    }

    #[test]
    fn add_merges_duplicate_ranges() {
        let mut list = RangeList::new();
        list.add(Range::new(0, 100));
        list.add(Range::new(0, 100));
        assert_eq!(list.as_slice(), &[Range::new(0, 100)]);
        assert_eq!(list.sum(), 100);
    }

    #[test]
    fn add_merges_overlapping_ranges() {
        let mut list = RangeList::new();
        list.add(Range::new(0, 100));
        list.add(Range::new(50, 200));
        assert_eq!(list.as_slice(), &[Range::new(0, 200)]);
    }

    #[test]
    fn add_merges_contained_range() {
        let mut list = RangeList::new();
        list.add(Range::new(0, 200));
        list.add(Range::new(50, 100));
        assert_eq!(list.as_slice(), &[Range::new(0, 200)]);
    }

    #[test]
    fn add_drops_zero_length_ranges() {
        let mut list = RangeList::new();
        list.add(Range::new(50, 50));
        assert!(list.as_slice().is_empty());
    }

    #[test]
    fn update_from_unsorted_iterator() {
        let mut list = RangeList::new();
        list.update([
            Range::new(300, 400),
            Range::new(0, 100),
            Range::new(90, 310),
        ]);
        assert_eq!(list.as_slice(), &[Range::new(0, 400)]);
    }

    #[test]
    fn rereading_same_bytes_does_not_inflate_sum() {
        let mut list = RangeList::new();
        for _ in 0..3 {
            list.add(Range::new(0, 12));
        }
        assert_eq!(list.sum(), 12);
    }

    fn arbitrary_ranges() -> impl Strategy<Value = Vec<Range>> {
        prop::collection::vec((0u64..1000, 0u64..100), 0..50)
            .prop_map(|pairs| {
                pairs
                    .into_iter()
                    .map(|(start, len)| Range::new(start, start + len))
                    .collect()
            })
    }

    proptest! {
        // For all finite multisets of ranges, the merged list is pairwise
        // disjoint and non-contiguous, and sums to the size of the union.
        #[test]
        fn merge_is_disjoint_and_preserves_union(ranges in arbitrary_ranges()) {
            let mut list = RangeList::new();
            list.update(ranges.iter().copied());

            for pair in list.as_slice().windows(2) {
                prop_assert!(pair[0].end < pair[1].start);
            }

            let mut union = vec![false; 1100];
            for r in &ranges {
                for slot in &mut union[r.start as usize..r.end as usize] {
                    *slot = true;
                }
            }
            let expected = union.iter().filter(|covered| **covered).count() as u64;
            prop_assert_eq!(list.sum(), expected);
        }

        // add() one at a time must agree with update() in bulk.
        #[test]
        fn add_and_update_agree(ranges in arbitrary_ranges()) {
            let mut one_by_one = RangeList::new();
            for r in ranges.iter().copied() {
                one_by_one.add(r);
            }
            let mut bulk = RangeList::new();
            bulk.update(ranges.iter().copied());
            prop_assert_eq!(one_by_one, bulk);
        }
    }
}
