use std::collections::BTreeMap;

/// Disjoint union of half-open intervals the caller has finished with.
///
/// Overlapping and adjacent intervals are merged on insertion, so the map
/// always holds sorted, pairwise-disjoint, non-touching intervals.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushTracker {
    intervals: BTreeMap<i64, i64>,
}

impl FlushTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `[start, end)` as flushed. Empty intervals are ignored.
    pub fn add(&mut self, start: i64, end: i64) {
        if start >= end {
            return;
        }
        let mut merged_start = start;
        let mut merged_end = end;
        let touching: Vec<i64> = self
            .intervals
            .range(..=end)
            .rev()
            .take_while(|(_, &existing_end)| existing_end >= start)
            .map(|(&existing_start, _)| existing_start)
            .collect();
        for key in touching {
            if let Some(existing_end) = self.intervals.remove(&key) {
                merged_start = merged_start.min(key);
                merged_end = merged_end.max(existing_end);
            }
        }
        self.intervals.insert(merged_start, merged_end);
    }

    /// End of the contiguous flushed run containing `from`, if any.
    pub fn covered_prefix(&self, from: i64) -> Option<i64> {
        self.intervals
            .range(..=from)
            .next_back()
            .filter(|(_, &end)| end >= from)
            .map(|(_, &end)| end)
    }

    /// Forget everything left of `position`, trimming a straddling interval.
    pub fn discard_before(&mut self, position: i64) {
        let stale: Vec<i64> = self
            .intervals
            .range(..position)
            .map(|(&start, _)| start)
            .collect();
        for start in stale {
            if let Some(end) = self.intervals.remove(&start) {
                if end > position {
                    self.intervals.insert(position, end);
                }
            }
        }
    }

    /// Remove every interval.
    pub fn clear(&mut self) {
        self.intervals.clear();
    }

    /// Intervals in ascending order.
    pub fn intervals(&self) -> impl Iterator<Item = (i64, i64)> + '_ {
        self.intervals.iter().map(|(&start, &end)| (start, end))
    }

    /// Number of disjoint intervals held.
    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    /// Whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn intervals(tracker: &FlushTracker) -> Vec<(i64, i64)> {
        tracker.intervals().collect()
    }

    #[test]
    fn adjacent_and_overlapping_intervals_merge() {
        let mut tracker = FlushTracker::new();
        tracker.add(20, 30);
        tracker.add(0, 10);
        assert_eq!(intervals(&tracker), vec![(0, 10), (20, 30)]);

        tracker.add(10, 12);
        assert_eq!(intervals(&tracker), vec![(0, 12), (20, 30)]);

        tracker.add(11, 25);
        assert_eq!(intervals(&tracker), vec![(0, 30)]);

        tracker.add(5, 5);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn covered_prefix_requires_contiguity() {
        let mut tracker = FlushTracker::new();
        tracker.add(5, 10);
        assert_eq!(tracker.covered_prefix(0), None);
        assert_eq!(tracker.covered_prefix(5), Some(10));
        assert_eq!(tracker.covered_prefix(10), Some(10));
        assert_eq!(tracker.covered_prefix(11), None);
    }

    #[test]
    fn discard_trims_straddling_interval() {
        let mut tracker = FlushTracker::new();
        tracker.add(0, 4);
        tracker.add(6, 12);
        tracker.add(20, 22);
        tracker.discard_before(8);
        assert_eq!(intervals(&tracker), vec![(8, 12), (20, 22)]);
        tracker.discard_before(30);
        assert!(tracker.is_empty());
    }

    proptest! {
        #[test]
        fn union_matches_point_coverage(spans in prop::collection::vec((0i64..200, 0i64..40), 1..30)) {
            let mut tracker = FlushTracker::new();
            let mut covered = vec![false; 240];
            for &(start, len) in &spans {
                tracker.add(start, start + len);
                for pos in start..start + len {
                    covered[pos as usize] = true;
                }
            }

            let list = intervals(&tracker);
            for pair in list.windows(2) {
                prop_assert!(pair[0].1 < pair[1].0, "intervals must be disjoint and non-touching");
            }
            for (pos, &flag) in covered.iter().enumerate() {
                let pos = pos as i64;
                let inside = list.iter().any(|&(s, e)| s <= pos && pos < e);
                prop_assert_eq!(inside, flag);
            }
        }
    }
}
