//! Disjoint byte-range bookkeeping for offset-addressed reassembly.
//!
//! Pull contexts and medium reassembly both accept data in any order. Each
//! accepted piece is recorded here; a piece overlapping anything already
//! recorded is refused, which is what keeps duplicated or replayed packets from
//! advancing a byte counter twice.

use std::collections::BTreeMap;
use std::ops::Range;

#[derive(Debug, Clone, Default)]
pub struct IntervalSet {
    /// start -> end, non-overlapping, adjacent runs merged.
    runs: BTreeMap<u64, u64>,
    covered: u64,
}

impl IntervalSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total bytes recorded.
    pub fn covered(&self) -> u64 {
        self.covered
    }

    /// True if `range` touches no recorded byte.
    pub fn is_disjoint(&self, range: &Range<u64>) -> bool {
        if range.is_empty() {
            return true;
        }
        // Closest run starting before the end of `range`.
        match self.runs.range(..range.end).next_back() {
            Some((_, &end)) => end <= range.start,
            None => true,
        }
    }

    /// Record `range` if it is disjoint from everything recorded so far.
    pub fn insert(&mut self, range: Range<u64>) -> bool {
        if range.is_empty() || !self.is_disjoint(&range) {
            return false;
        }
        let mut start = range.start;
        let mut end = range.end;

        if let Some((&s, &e)) = self.runs.range(..=start).next_back() {
            if e == start {
                start = s;
                self.runs.remove(&s);
            }
        }
        if let Some(e) = self.runs.remove(&end) {
            end = e;
        }
        self.runs.insert(start, end);
        self.covered += range.end - range.start;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reverse_insertion_merges() {
        let mut set = IntervalSet::new();
        assert!(set.insert(8192..12288));
        assert!(set.insert(4096..8192));
        assert!(set.insert(0..4096));
        assert_eq!(set.covered(), 12288);
        assert_eq!(set.runs.len(), 1);
        assert!(!set.is_disjoint(&(100..12000)));
        assert!(set.is_disjoint(&(12288..12289)));
    }

    #[test]
    fn test_overlap_refused() {
        let mut set = IntervalSet::new();
        assert!(set.insert(100..200));
        assert!(!set.insert(100..200));
        assert!(!set.insert(150..250));
        assert!(!set.insert(50..101));
        assert!(!set.insert(0..1000));
        assert!(set.insert(200..300));
        assert!(set.insert(0..100));
        assert_eq!(set.covered(), 300);
    }

    #[test]
    fn test_gaps_are_kept() {
        let mut set = IntervalSet::new();
        set.insert(0..10);
        set.insert(20..30);
        assert_eq!(set.runs.len(), 2);
        assert_eq!(set.covered(), 20);
        assert!(set.is_disjoint(&(10..20)));
        assert!(set.insert(10..20));
        assert_eq!(set.runs.len(), 1);
        assert_eq!(set.covered(), 30);
    }

    #[test]
    fn test_empty_range_is_noop() {
        let mut set = IntervalSet::new();
        assert!(!set.insert(5..5));
        assert_eq!(set.covered(), 0);
    }
}
