//! Interval-keyed containers over the 64-bit address space.
//!
//! [`IntervalMap`] stores non-overlapping `(range, value)` entries.
//! Assigning a value over a range replaces whatever was there for exactly
//! that sub-interval; the non-overlapped parts of prior entries survive as
//! split pieces.  Adjacent entries are never merged.
//!
//! [`IntervalSet`] is a plain set of addresses stored as maximal disjoint
//! ranges (adjacent and overlapping inserts are joined).

use pmcheck_protocol::AddressRange;
use std::collections::BTreeMap;

// ═══════════════════════════════════════════════════════════════════════
//  IntervalMap
// ═══════════════════════════════════════════════════════════════════════

/// Map from disjoint address ranges to values, keyed by range start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntervalMap<V> {
    // start -> (end, value)
    entries: BTreeMap<u64, (u64, V)>,
}

impl<V> Default for IntervalMap<V> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<V: Clone> IntervalMap<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `range` to `value`, overwriting any overlapped sub-intervals.
    pub fn assign(&mut self, range: AddressRange, value: V) {
        if range.is_empty() {
            return;
        }
        self.remove(range);
        self.entries.insert(range.base, (range.end(), value));
    }

    /// Remove `range` from the map, trimming entries that straddle its edges.
    pub fn remove(&mut self, range: AddressRange) {
        if range.is_empty() {
            return;
        }
        let (start, end) = (range.base, range.end());

        // An entry starting before `start` may reach into the range.
        let straddling = self
            .entries
            .range(..start)
            .next_back()
            .filter(|(_, (e, _))| *e > start)
            .map(|(&s, _)| s);
        if let Some(s) = straddling {
            if let Some((e, v)) = self.entries.remove(&s) {
                if e > end {
                    self.entries.insert(end, (e, v.clone()));
                }
                self.entries.insert(s, (start, v));
            }
        }

        let inside: Vec<u64> = self.entries.range(start..end).map(|(&s, _)| s).collect();
        for s in inside {
            if let Some((e, v)) = self.entries.remove(&s) {
                if e > end {
                    self.entries.insert(end, (e, v));
                }
            }
        }
    }
}

impl<V> IntervalMap<V> {
    /// Pieces of the map overlapping `range`, clipped to it, in address order.
    pub fn overlapping(&self, range: AddressRange) -> impl Iterator<Item = (AddressRange, &V)> + '_ {
        let (start, end) = (range.base, range.end());
        let head = self
            .entries
            .range(..start)
            .next_back()
            .filter(move |(_, (e, _))| *e > start);
        let body = self.entries.range(start..end);
        head.into_iter()
            .chain(body)
            .filter(move |_| start < end)
            .map(move |(&s, (e, v))| (AddressRange::from_bounds(s.max(start), (*e).min(end)), v))
    }

    /// Whether any part of `range` is mapped.
    pub fn intersects(&self, range: AddressRange) -> bool {
        self.overlapping(range).next().is_some()
    }

    /// Whether every byte of a non-empty `range` is mapped.
    pub fn covers(&self, range: AddressRange) -> bool {
        if range.is_empty() {
            return false;
        }
        let mut cursor = range.base;
        for (piece, _) in self.overlapping(range) {
            if piece.base != cursor {
                return false;
            }
            cursor = piece.end();
        }
        cursor == range.end()
    }

    /// All entries in address order.
    pub fn iter(&self) -> impl Iterator<Item = (AddressRange, &V)> + '_ {
        self.entries
            .iter()
            .map(|(&s, (e, v))| (AddressRange::from_bounds(s, *e), v))
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut V> + '_ {
        self.entries.values_mut().map(|(_, v)| v)
    }

    /// Number of stored pieces.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  IntervalSet
// ═══════════════════════════════════════════════════════════════════════

/// Set of addresses stored as maximal disjoint ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntervalSet {
    // start -> end
    ranges: BTreeMap<u64, u64>,
}

impl IntervalSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add every address in `range`, joining with touching neighbours.
    pub fn insert(&mut self, range: AddressRange) {
        if range.is_empty() {
            return;
        }
        let mut start = range.base;
        let mut end = range.end();

        if let Some((&s, &e)) = self.ranges.range(..=start).next_back() {
            if e >= start {
                start = s;
                end = end.max(e);
            }
        }
        let absorbed: Vec<(u64, u64)> = self
            .ranges
            .range(start..=end)
            .map(|(&s, &e)| (s, e))
            .collect();
        for (s, e) in absorbed {
            self.ranges.remove(&s);
            end = end.max(e);
        }
        self.ranges.insert(start, end);
    }

    /// Whether every address of a non-empty `range` is in the set.
    pub fn contains(&self, range: AddressRange) -> bool {
        if range.is_empty() {
            return false;
        }
        // Ranges are maximal, so one entry must hold all of it.
        self.ranges
            .range(..=range.base)
            .next_back()
            .is_some_and(|(_, &e)| e >= range.end())
    }

    /// Whether any address of `range` is in the set.
    pub fn intersects(&self, range: AddressRange) -> bool {
        if range.is_empty() {
            return false;
        }
        let head = self
            .ranges
            .range(..=range.base)
            .next_back()
            .is_some_and(|(_, &e)| e > range.base);
        head || self.ranges.range(range.base..range.end()).next().is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = AddressRange> + '_ {
        self.ranges
            .iter()
            .map(|(&s, &e)| AddressRange::from_bounds(s, e))
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn r(start: u64, end: u64) -> AddressRange {
        AddressRange::from_bounds(start, end)
    }

    fn pieces<V: Clone>(map: &IntervalMap<V>) -> Vec<(AddressRange, V)> {
        map.iter().map(|(range, v)| (range, v.clone())).collect()
    }

    #[test]
    fn assign_splits_enclosing_entry() {
        let mut map = IntervalMap::new();
        map.assign(r(0, 100), 'a');
        map.assign(r(40, 60), 'b');
        assert_eq!(
            pieces(&map),
            vec![(r(0, 40), 'a'), (r(40, 60), 'b'), (r(60, 100), 'a')]
        );
    }

    #[test]
    fn assign_replaces_several_entries() {
        let mut map = IntervalMap::new();
        map.assign(r(0, 10), 1);
        map.assign(r(10, 20), 2);
        map.assign(r(20, 30), 3);
        map.assign(r(5, 25), 9);
        assert_eq!(pieces(&map), vec![(r(0, 5), 1), (r(5, 25), 9), (r(25, 30), 3)]);
    }

    #[test]
    fn remove_leaves_outer_pieces() {
        let mut map = IntervalMap::new();
        map.assign(r(0, 100), ());
        map.remove(r(10, 20));
        assert!(map.covers(r(0, 10)));
        assert!(!map.intersects(r(10, 20)));
        assert!(map.covers(r(20, 100)));
        assert!(!map.covers(r(0, 100)));
    }

    #[test]
    fn overlapping_clips_to_query() {
        let mut map = IntervalMap::new();
        map.assign(r(0, 10), 'x');
        map.assign(r(20, 30), 'y');
        let got: Vec<_> = map.overlapping(r(5, 25)).map(|(rg, v)| (rg, *v)).collect();
        assert_eq!(got, vec![(r(5, 10), 'x'), (r(20, 25), 'y')]);
        assert!(map.overlapping(r(5, 5)).next().is_none());
    }

    #[test]
    fn covers_detects_gaps() {
        let mut map = IntervalMap::new();
        map.assign(r(0, 10), 0);
        map.assign(r(12, 20), 0);
        assert!(!map.covers(r(0, 20)));
        map.assign(r(10, 12), 1);
        assert!(map.covers(r(0, 20)));
    }

    #[test]
    fn set_joins_adjacent_ranges() {
        let mut set = IntervalSet::new();
        set.insert(r(0, 8));
        set.insert(r(8, 16));
        set.insert(r(32, 40));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![r(0, 16), r(32, 40)]);
        assert!(set.contains(r(4, 12)));
        assert!(!set.contains(r(12, 34)));
        assert!(set.intersects(r(12, 34)));
        assert!(!set.intersects(r(16, 32)));

        set.insert(r(10, 36));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![r(0, 40)]);
    }

    proptest! {
        /// Writing S over [a,b) partially overlapping [c,d)->T (c<a<d<b)
        /// leaves exactly [c,a)->T and [a,b)->S.
        #[test]
        fn partial_overlap_splits_cleanly(
            c in 0u64..1_000_000,
            gaps in (1u64..10_000, 1u64..10_000, 1u64..10_000),
        ) {
            let a = c + gaps.0;
            let d = a + gaps.1;
            let b = d + gaps.2;

            let mut map = IntervalMap::new();
            map.assign(r(c, d), "T");
            map.assign(r(a, b), "S");

            prop_assert_eq!(pieces(&map), vec![(r(c, a), "T"), (r(a, b), "S")]);
            prop_assert!(map.covers(r(c, b)));
        }

        /// Pieces stay sorted and disjoint under arbitrary assignments.
        #[test]
        fn entries_stay_disjoint(ops in proptest::collection::vec((0u64..500, 1u64..100, 0u8..4), 1..40)) {
            let mut map = IntervalMap::new();
            for (base, size, v) in ops {
                map.assign(AddressRange::new(base, size), v);
            }
            let all: Vec<_> = map.iter().map(|(rg, _)| rg).collect();
            for w in all.windows(2) {
                prop_assert!(w[0].end() <= w[1].base);
            }
        }
    }
}
