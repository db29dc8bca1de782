//! Arena-backed singly linked chains, one per window slot.
//!
//! Links live in the arena, never in the records themselves. Releasing a
//! chain clears every forward link before its nodes go back on the free list.

use crate::record::Record;

/// Handle to one chain inside a [`ChainArena`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Chain {
    head: Option<usize>,
    tail: Option<usize>,
    len: u32,
}

impl Chain {
    pub(crate) fn len(&self) -> u32 {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[derive(Debug)]
struct Node {
    record: Option<Record>,
    next: Option<usize>,
}

/// Node storage shared by every chain of one cache.
#[derive(Debug, Default)]
pub(crate) struct ChainArena {
    nodes: Vec<Node>,
    free: Vec<usize>,
}

impl ChainArena {
    /// Append a record to the end of `chain`.
    pub(crate) fn push(&mut self, chain: &mut Chain, record: Record) {
        let node = Node {
            record: Some(record),
            next: None,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = node;
                idx
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        };
        match chain.tail {
            Some(tail) => self.nodes[tail].next = Some(idx),
            None => chain.head = Some(idx),
        }
        chain.tail = Some(idx);
        chain.len += 1;
    }

    /// Records of `chain` in insertion order.
    pub(crate) fn iter<'a>(&'a self, chain: &Chain) -> impl Iterator<Item = &'a Record> + 'a {
        let mut cursor = chain.head;
        std::iter::from_fn(move || {
            let idx = cursor?;
            let node = &self.nodes[idx];
            cursor = node.next;
            node.record.as_ref()
        })
    }

    /// Drop every record of `chain`, returning how many were held.
    pub(crate) fn release(&mut self, chain: &mut Chain) -> u32 {
        let mut cursor = chain.head;
        while let Some(idx) = cursor {
            let node = &mut self.nodes[idx];
            cursor = node.next.take();
            node.record = None;
            self.free.push(idx);
        }
        let released = chain.len;
        *chain = Chain::default();
        released
    }

    /// Number of nodes currently holding a record.
    pub(crate) fn live(&self) -> usize {
        self.nodes.len() - self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chains_share_one_arena() {
        let mut arena = ChainArena::default();
        let mut a = Chain::default();
        let mut b = Chain::default();
        arena.push(&mut a, Record::new(0, 1, 1));
        arena.push(&mut b, Record::new(0, 2, 1));
        arena.push(&mut a, Record::new(0, 1, 5));

        let lengths: Vec<u32> = arena.iter(&a).map(|r| r.length).collect();
        assert_eq!(lengths, vec![1, 5]);
        assert_eq!(arena.iter(&b).count(), 1);
        assert_eq!(arena.live(), 3);

        assert_eq!(arena.release(&mut a), 2);
        assert!(a.is_empty());
        assert_eq!(arena.iter(&a).count(), 0);
        assert_eq!(arena.live(), 1);
    }

    #[test]
    fn released_nodes_are_reused_without_stale_links() {
        let mut arena = ChainArena::default();
        let mut a = Chain::default();
        for start in 0..4 {
            arena.push(&mut a, Record::new(0, start, 1));
        }
        arena.release(&mut a);

        let mut b = Chain::default();
        arena.push(&mut b, Record::new(0, 9, 1));
        arena.push(&mut b, Record::new(0, 9, 2));
        let starts: Vec<(i64, u32)> = arena.iter(&b).map(|r| (r.start, r.length)).collect();
        assert_eq!(starts, vec![(9, 1), (9, 2)]);
        assert_eq!(b.len(), 2);
        assert_eq!(arena.live(), 2);
    }
}
