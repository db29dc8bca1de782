//! Sliding-window cache answering overlap queries over a sorted record stream.
//!
//! The cache covers one sequence at a time. Records are chained into a
//! circular array of slots indexed by `start mod capacity`; every slot also
//! keeps the chain depth, the longest record seen there and the minimum start
//! offset of any record overlapping that position. The offset lets a query
//! for `[s, e)` begin its scan at `s + offset(s)` instead of re-reading the
//! stream.
//!
//! Callers walk along the sequence with three operations:
//! - [`advance`](WindowCache::advance) pulls records from upstream
//! - [`records_overlap`](WindowCache::records_overlap) answers queries
//! - [`flush`](WindowCache::flush) declares intervals done so the window can
//!   drop everything that can no longer be queried
//!
//! A slot whose chain reaches the depth limit collapses into a single
//! overflow marker spanning the longest record observed there.

mod chain;
mod flush;
mod shared;

pub use flush::FlushTracker;
pub use shared::SyncWindowCache;

use bitvec::prelude::*;
use tracing::trace;

use self::chain::{Chain, ChainArena};
use crate::record::{sequence_rank, Locus, Record};
use crate::source::RecordStream;
use crate::{Result, StreamError};

/// Slots added on every growth beyond the 1.5x factor.
const GROWTH_PADDING: usize = 64;

/// Configuration for a [`WindowCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "stats-serde", derive(serde::Serialize, serde::Deserialize))]
pub struct WindowConfig {
    /// Number of slots allocated up front.
    pub initial_capacity: usize,
    /// Chain depth at which a slot collapses into an overflow marker.
    pub depth_limit: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            initial_capacity: 1024,
            depth_limit: 1000,
        }
    }
}

impl WindowConfig {
    /// Set the initial slot count.
    pub fn with_initial_capacity(mut self, initial_capacity: usize) -> Self {
        self.initial_capacity = initial_capacity;
        self
    }

    /// Set the depth limit.
    pub fn with_depth_limit(mut self, depth_limit: usize) -> Self {
        self.depth_limit = depth_limit;
        self
    }

    /// Check every parameter is usable.
    pub fn validate(&self) -> Result<()> {
        if self.initial_capacity == 0 {
            return Err(StreamError::InvalidConfiguration(
                "initial capacity must be > 0".to_string(),
            ));
        }
        if self.depth_limit == 0 {
            return Err(StreamError::InvalidConfiguration(
                "depth limit must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Snapshot of a cache's size and counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "stats-serde", derive(serde::Serialize, serde::Deserialize))]
pub struct WindowStats {
    /// Current slot count.
    pub capacity: usize,
    /// Chained entries held, overflow markers included.
    pub stored: usize,
    /// Records dropped because their slot overflowed.
    pub dropped_overflow: u64,
    /// Records that ended before the window and were never stored.
    pub discarded: u64,
    /// Entries released by flushing or sequence resets.
    pub evicted: u64,
    /// Records skipped because they belong to an earlier sequence.
    pub skipped: u64,
    /// Leftmost queryable position.
    pub first_position: i64,
    /// Rightmost position advanced to.
    pub last_position: i64,
    /// End of the contiguous flushed prefix.
    pub flushed_to: i64,
}

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    chain: Chain,
    max_length: u32,
    min_offset: i64,
}

/// Circular record cache over one sequence of a sorted stream.
#[derive(Debug)]
pub struct WindowCache<S> {
    upstream: S,
    config: WindowConfig,
    sequence_id: i32,
    slots: Vec<Slot>,
    overflowed: BitVec,
    arena: ChainArena,
    tracker: FlushTracker,
    stash: Option<Record>,
    exhausted: bool,
    last_start: Option<Locus>,
    first_start: i64,
    first_position: i64,
    last_position: i64,
    flushed_to: i64,
    stored: usize,
    dropped_overflow: u64,
    discarded: u64,
    evicted: u64,
    skipped: u64,
}

impl<S: RecordStream> WindowCache<S> {
    /// Cache records of `sequence_id` read from `upstream`, starting at position 0.
    pub fn new(upstream: S, sequence_id: i32, config: WindowConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            upstream,
            config,
            sequence_id,
            slots: vec![Slot::default(); config.initial_capacity],
            overflowed: bitvec![0; config.initial_capacity],
            arena: ChainArena::default(),
            tracker: FlushTracker::new(),
            stash: None,
            exhausted: false,
            last_start: None,
            first_start: 0,
            first_position: 0,
            last_position: 0,
            flushed_to: 0,
            stored: 0,
            dropped_overflow: 0,
            discarded: 0,
            evicted: 0,
            skipped: 0,
        })
    }

    /// Sequence currently cached.
    pub fn sequence_id(&self) -> i32 {
        self.sequence_id
    }

    /// Leftmost position a query may start at.
    pub fn first_position(&self) -> i64 {
        self.first_position
    }

    /// Rightmost position advanced to.
    pub fn last_position(&self) -> i64 {
        self.last_position
    }

    /// End of the contiguous flushed prefix.
    pub fn flushed_to(&self) -> i64 {
        self.flushed_to
    }

    /// Current slot count.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Whether upstream may still yield records (including a stashed one).
    pub fn has_pending(&self) -> bool {
        self.stash.is_some() || !self.exhausted
    }

    /// Counters and positions.
    pub fn stats(&self) -> WindowStats {
        WindowStats {
            capacity: self.slots.len(),
            stored: self.stored,
            dropped_overflow: self.dropped_overflow,
            discarded: self.discarded,
            evicted: self.evicted,
            skipped: self.skipped,
            first_position: self.first_position,
            last_position: self.last_position,
            flushed_to: self.flushed_to,
        }
    }

    /// Borrow the upstream stream.
    pub fn upstream(&self) -> &S {
        &self.upstream
    }

    /// Unwrap into the upstream stream; cached and stashed records are lost.
    pub fn into_inner(self) -> S {
        self.upstream
    }

    /// Pull upstream records starting before `end` on the current sequence.
    ///
    /// A record starting at or beyond `end`, or on a later sequence, is kept
    /// for the next call. Records of earlier sequences are skipped.
    pub fn advance(&mut self, end: i64) -> Result<()> {
        while let Some(record) = self.next_upstream()? {
            let rank = sequence_rank(record.sequence_id);
            let current = sequence_rank(self.sequence_id);
            if rank < current {
                self.skipped += 1;
                continue;
            }
            if rank > current || record.start >= end {
                self.stash = Some(record);
                break;
            }

            let locus = record.locus();
            if let Some(previous) = self.last_start {
                if locus < previous {
                    return Err(StreamError::NotSorted {
                        previous,
                        current: locus,
                    });
                }
            }
            self.last_start = Some(locus);

            if record.extent_end() <= self.first_position {
                self.discarded += 1;
                continue;
            }
            if record.start < self.first_start {
                return Err(StreamError::NotSorted {
                    previous: Locus::new(self.sequence_id, self.first_start),
                    current: locus,
                });
            }
            self.insert(record);
        }
        self.last_position = self.last_position.max(end);
        Ok(())
    }

    /// Every cached record whose extent intersects `[start, end)`.
    ///
    /// A point query (`start == end`) returns records covering `start`.
    /// Overflow markers are returned in place of the records they replaced.
    pub fn records_overlap(&mut self, start: i64, end: i64) -> Result<Vec<Record>> {
        if start < self.first_position {
            return Err(StreamError::contract(format!(
                "query start {} precedes first queryable position {}",
                start, self.first_position
            )));
        }
        if end < start {
            return Err(StreamError::contract(format!(
                "query end {} precedes start {}",
                end, start
            )));
        }
        let scan_end = if start == end { end + 1 } else { end };
        self.advance(scan_end)?;

        let window_end = self.first_start + self.slots.len() as i64;
        let from = (start + self.min_offset(start)).max(self.first_start);
        let to = scan_end.min(window_end);

        let mut hits = Vec::new();
        for position in from..to {
            let slot = &self.slots[self.slot_of(position)];
            hits.extend(
                self.arena
                    .iter(&slot.chain)
                    .filter(|record| record.extent_end() > start)
                    .cloned(),
            );
        }
        Ok(hits)
    }

    /// Declare `[start, end)` finished and evict whatever can no longer be queried.
    ///
    /// Only the contiguous flushed run starting at the flushed prefix counts.
    /// The eviction boundary is pulled left until no retained position is
    /// overlapped by a record starting before it.
    pub fn flush(&mut self, start: i64, end: i64) -> Result<()> {
        if start < self.first_position {
            return Err(StreamError::contract(format!(
                "flush start {} precedes first queryable position {}",
                start, self.first_position
            )));
        }
        if end > self.last_position {
            return Err(StreamError::contract(format!(
                "flush end {} beyond advanced position {}",
                end, self.last_position
            )));
        }
        if start > end {
            return Err(StreamError::contract(format!(
                "flush end {} precedes start {}",
                end, start
            )));
        }

        self.tracker.add(start, end);
        let Some(covered) = self.tracker.covered_prefix(self.flushed_to) else {
            return Ok(());
        };
        if covered <= self.flushed_to {
            return Ok(());
        }
        self.flushed_to = covered;

        let mut boundary = covered;
        loop {
            let offset = self.min_offset(boundary);
            if offset == 0 {
                break;
            }
            boundary += offset;
        }
        if boundary > self.first_position {
            self.evict_before(boundary);
        }
        self.tracker.discard_before(self.first_position);
        Ok(())
    }

    /// Drop every cached record and restart at position 0 of another sequence.
    ///
    /// A record already stashed from upstream is kept.
    pub fn reset_sequence(&mut self, sequence_id: i32) {
        for slot in self.slots.iter_mut() {
            self.evicted += u64::from(self.arena.release(&mut slot.chain));
            *slot = Slot::default();
        }
        self.overflowed.fill(false);
        self.tracker.clear();
        self.sequence_id = sequence_id;
        self.last_start = None;
        self.first_start = 0;
        self.first_position = 0;
        self.last_position = 0;
        self.flushed_to = 0;
        self.stored = 0;
    }

    fn next_upstream(&mut self) -> Result<Option<Record>> {
        if let Some(record) = self.stash.take() {
            return Ok(Some(record));
        }
        if self.exhausted {
            return Ok(None);
        }
        let record = self.upstream.next_record()?;
        if record.is_none() {
            self.exhausted = true;
        }
        Ok(record)
    }

    fn slot_of(&self, position: i64) -> usize {
        position.rem_euclid(self.slots.len() as i64) as usize
    }

    /// Offset (zero or negative) from `position` to the leftmost start of any
    /// record overlapping it.
    fn min_offset(&self, position: i64) -> i64 {
        let window_end = self.first_start + self.slots.len() as i64;
        if position < self.first_start || position >= window_end {
            return 0;
        }
        self.slots[self.slot_of(position)].min_offset
    }

    fn insert(&mut self, record: Record) {
        let needed = (record.extent_end() - self.first_start) as usize;
        if needed > self.slots.len() {
            self.grow(needed);
        }

        let extent_end = record.extent_end();
        let start = record.start;
        for position in start + 1..extent_end {
            let idx = self.slot_of(position);
            let slot = &mut self.slots[idx];
            slot.min_offset = slot.min_offset.min(start - position);
        }

        let idx = self.slot_of(start);
        let slot = &mut self.slots[idx];
        slot.max_length = slot.max_length.max(record.length.max(1));
        if self.overflowed[idx] {
            self.dropped_overflow += 1;
            let max_length = slot.max_length;
            let marker_length = self
                .arena
                .iter(&slot.chain)
                .next()
                .map_or(0, |marker| marker.length);
            if max_length > marker_length {
                self.arena.release(&mut slot.chain);
                self.arena.push(
                    &mut slot.chain,
                    Record::overflow_marker(self.sequence_id, start, max_length),
                );
            }
            return;
        }

        self.arena.push(&mut slot.chain, record);
        self.stored += 1;
        if slot.chain.len() as usize >= self.config.depth_limit {
            let dropped = self.arena.release(&mut slot.chain);
            self.arena.push(
                &mut slot.chain,
                Record::overflow_marker(self.sequence_id, start, slot.max_length),
            );
            self.stored = self.stored + 1 - dropped as usize;
            self.dropped_overflow += u64::from(dropped);
            self.overflowed.set(idx, true);
            trace!(
                sequence = self.sequence_id,
                position = start,
                dropped,
                "slot overflowed"
            );
        }
    }

    fn grow(&mut self, needed: usize) {
        let old_capacity = self.slots.len();
        let new_capacity = needed.max(old_capacity + old_capacity / 2 + GROWTH_PADDING);
        let mut slots = vec![Slot::default(); new_capacity];
        let mut overflowed = bitvec![0; new_capacity];
        for position in self.first_start..self.first_start + old_capacity as i64 {
            let old = position.rem_euclid(old_capacity as i64) as usize;
            let new = position.rem_euclid(new_capacity as i64) as usize;
            slots[new] = self.slots[old];
            overflowed.set(new, self.overflowed[old]);
        }
        self.slots = slots;
        self.overflowed = overflowed;
        trace!(old_capacity, new_capacity, "window grown");
    }

    fn evict_before(&mut self, boundary: i64) {
        let window_end = self.first_start + self.slots.len() as i64;
        let mut released = 0u64;
        for position in self.first_start..boundary.min(window_end) {
            let idx = self.slot_of(position);
            let slot = &mut self.slots[idx];
            released += u64::from(self.arena.release(&mut slot.chain));
            *slot = Slot::default();
            self.overflowed.set(idx, false);
        }
        self.stored -= released as usize;
        self.evicted += released;
        self.first_start = self.first_start.max(boundary);
        self.first_position = self.first_position.max(boundary);
        trace!(
            sequence = self.sequence_id,
            boundary,
            released,
            "window evicted"
        );
    }
}
