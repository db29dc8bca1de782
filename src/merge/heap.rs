use std::cmp::Ordering;

use crate::record::{Locus, Record};

/// Head of one merge input, ordered by (locus, input index).
///
/// The index breaks ties between inputs so equal loci always come out in
/// input order and the merge is deterministic.
#[derive(Debug)]
pub(crate) struct HeapEntry {
    pub(crate) locus: Locus,
    pub(crate) index: usize,
    pub(crate) record: Record,
}

impl HeapEntry {
    pub(crate) fn new(index: usize, record: Record) -> Self {
        Self {
            locus: record.locus(),
            index,
            record,
        }
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.locus
            .cmp(&other.locus)
            .then(self.index.cmp(&other.index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Reverse;
    use std::collections::BinaryHeap;

    #[test]
    fn ties_break_on_input_index() {
        let mut heap = BinaryHeap::new();
        heap.push(Reverse(HeapEntry::new(2, Record::new(0, 10, 2))));
        heap.push(Reverse(HeapEntry::new(1, Record::new(0, 15, 10))));
        heap.push(Reverse(HeapEntry::new(0, Record::new(0, 10, 10))));
        heap.push(Reverse(HeapEntry::new(3, Record::new(-1, 0, 1))));

        let order: Vec<(usize, i64)> = std::iter::from_fn(|| heap.pop())
            .map(|Reverse(entry)| (entry.index, entry.locus.position))
            .collect();
        assert_eq!(order, vec![(0, 10), (2, 10), (1, 15), (3, 0)]);
    }
}
