//! Removal of mated records observed more than once.
//!
//! Two mated records are duplicates when they agree on origin, sequence,
//! start, mate sequence and mate fragment end. The input is consumed in runs
//! of records sharing one (sequence, start); duplicates can only occur within
//! a run, so only the current run is ever held in memory.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, VecDeque};

use tracing::trace;

use crate::record::{sequence_rank, Locus, Record};
use crate::source::{RecordCounts, RecordStream};
use crate::{Result, StreamError};

/// Which of two duplicate records survives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retain {
    /// Keep the record already in the run.
    Existing,
    /// Replace it with the newly read record.
    Candidate,
}

/// Tie-break between two records that compare equal as duplicates.
pub trait DuplicateResolver {
    /// Decide which record represents the pair.
    fn disambiguate_duplicate(&mut self, existing: &Record, candidate: &Record) -> Retain;
}

/// Prefers the higher mapping quality, then the lower name hash, then the
/// record seen first.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultResolver;

impl DuplicateResolver for DefaultResolver {
    fn disambiguate_duplicate(&mut self, existing: &Record, candidate: &Record) -> Retain {
        let better = candidate
            .mapping_quality
            .cmp(&existing.mapping_quality)
            .then(existing.name_hash.cmp(&candidate.name_hash));
        if better.is_gt() {
            Retain::Candidate
        } else {
            Retain::Existing
        }
    }
}

impl<F> DuplicateResolver for F
where
    F: FnMut(&Record, &Record) -> Retain,
{
    fn disambiguate_duplicate(&mut self, existing: &Record, candidate: &Record) -> Retain {
        self(existing, candidate)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct DuplicateKey {
    genome_origin: u32,
    mate_rank: u32,
    mate_fragment_end: i64,
}

impl DuplicateKey {
    /// Key within a run; sequence and start are shared by every run member.
    fn of(record: &Record) -> Option<Self> {
        let mate = record.mate?;
        Some(Self {
            genome_origin: record.genome_origin,
            mate_rank: sequence_rank(mate.sequence_id),
            mate_fragment_end: record.start + mate.fragment_length,
        })
    }
}

/// Stream adapter dropping duplicate mated records.
#[derive(Debug)]
pub struct Deduplicator<S, D = DefaultResolver> {
    upstream: S,
    resolver: D,
    ready: VecDeque<Record>,
    overrun: Option<Record>,
    last: Option<Locus>,
    duplicates: u64,
}

impl<S: RecordStream> Deduplicator<S> {
    /// Deduplicate `upstream` with the default tie-break.
    pub fn new(upstream: S) -> Self {
        Self::with_resolver(upstream, DefaultResolver)
    }
}

impl<S: RecordStream, D: DuplicateResolver> Deduplicator<S, D> {
    /// Deduplicate `upstream` with a custom tie-break.
    pub fn with_resolver(upstream: S, resolver: D) -> Self {
        Self {
            upstream,
            resolver,
            ready: VecDeque::new(),
            overrun: None,
            last: None,
            duplicates: 0,
        }
    }

    /// Number of records removed so far.
    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    /// Borrow the wrapped stream.
    pub fn get_ref(&self) -> &S {
        &self.upstream
    }

    /// Unwrap into the upstream stream, discarding any buffered records.
    pub fn into_inner(self) -> S {
        self.upstream
    }

    fn fill_run(&mut self) -> Result<()> {
        let first = match self.overrun.take() {
            Some(record) => record,
            None => match self.upstream.next_record()? {
                Some(record) => record,
                None => return Ok(()),
            },
        };
        let locus = first.locus();
        if let Some(previous) = self.last {
            if locus < previous {
                return Err(StreamError::NotSorted {
                    previous,
                    current: locus,
                });
            }
        }
        self.last = Some(locus);

        let mut run = Vec::new();
        let mut seen = BTreeMap::new();
        self.insert(&mut run, &mut seen, first);
        while let Some(record) = self.upstream.next_record()? {
            let next = record.locus();
            if next != locus {
                if next < locus {
                    return Err(StreamError::NotSorted {
                        previous: locus,
                        current: next,
                    });
                }
                self.overrun = Some(record);
                break;
            }
            self.insert(&mut run, &mut seen, record);
        }
        self.ready = run.into();
        Ok(())
    }

    fn insert(
        &mut self,
        run: &mut Vec<Record>,
        seen: &mut BTreeMap<DuplicateKey, usize>,
        record: Record,
    ) {
        let key = match DuplicateKey::of(&record) {
            Some(key) if !record.is_overflow() => key,
            _ => {
                run.push(record);
                return;
            }
        };
        match seen.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(run.len());
                run.push(record);
            }
            Entry::Occupied(slot) => {
                self.duplicates += 1;
                let idx = *slot.get();
                trace!(existing = %run[idx], candidate = %record, "duplicate");
                if self.resolver.disambiguate_duplicate(&run[idx], &record) == Retain::Candidate {
                    run[idx] = record;
                }
            }
        }
    }
}

impl<S: RecordStream, D: DuplicateResolver> RecordStream for Deduplicator<S, D> {
    fn next_record(&mut self) -> Result<Option<Record>> {
        if self.ready.is_empty() {
            self.fill_run()?;
        }
        Ok(self.ready.pop_front())
    }

    fn counts(&self) -> RecordCounts {
        let mut counts = self.upstream.counts();
        counts.duplicate += self.duplicates;
        counts.output = counts.output.saturating_sub(self.duplicates);
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::VecStream;

    fn drain<S: RecordStream>(stream: &mut S) -> Vec<Record> {
        let mut out = Vec::new();
        while let Some(record) = stream.next_record().unwrap() {
            out.push(record);
        }
        out
    }

    #[test]
    fn mated_pair_seen_twice_is_collapsed() {
        let a = Record::new(0, 100, 50).with_mate(0, 300).with_mapping_quality(20);
        let b = Record::new(0, 100, 50).with_mate(0, 300).with_mapping_quality(40);
        let other = Record::new(0, 100, 50).with_mate(0, 310);
        let next = Record::new(0, 120, 50).with_mate(0, 300);
        let mut dedup = Deduplicator::new(VecStream::new(vec![a, other.clone(), b.clone(), next]));

        let out = drain(&mut dedup);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0], b);
        assert_eq!(out[1], other);
        assert_eq!(dedup.duplicates(), 1);

        let counts = dedup.counts();
        assert_eq!(counts.duplicate, 1);
        assert_eq!(counts.output, 3);
    }

    #[test]
    fn unmated_records_are_never_duplicates() {
        let records = vec![Record::new(0, 5, 10), Record::new(0, 5, 10), Record::new(0, 5, 10)];
        let mut dedup = Deduplicator::new(VecStream::new(records));
        assert_eq!(drain(&mut dedup).len(), 3);
        assert_eq!(dedup.duplicates(), 0);
    }

    #[test]
    fn origin_separates_otherwise_equal_pairs() {
        let a = Record::new(0, 5, 10).with_mate(1, 40).with_genome_origin(0);
        let b = Record::new(0, 5, 10).with_mate(1, 40).with_genome_origin(1);
        let mut dedup = Deduplicator::new(VecStream::new(vec![a, b]));
        assert_eq!(drain(&mut dedup).len(), 2);
    }

    #[test]
    fn default_tie_break_prefers_lower_name_hash_then_first_seen() {
        let mut resolver = DefaultResolver;
        let first = Record::new(0, 1, 1).with_mate(0, 10).with_name_hash(9);
        let lower = first.clone().with_name_hash(3);
        assert_eq!(resolver.disambiguate_duplicate(&first, &lower), Retain::Candidate);
        assert_eq!(resolver.disambiguate_duplicate(&lower, &first), Retain::Existing);
        assert_eq!(resolver.disambiguate_duplicate(&first, &first.clone()), Retain::Existing);
    }

    #[test]
    fn custom_resolver_is_consulted() {
        let a = Record::new(0, 1, 1).with_mate(0, 10).with_mapping_quality(60);
        let b = Record::new(0, 1, 1).with_mate(0, 10).with_mapping_quality(1);
        let always_new = |_: &Record, _: &Record| Retain::Candidate;
        let mut dedup = Deduplicator::with_resolver(VecStream::new(vec![a, b.clone()]), always_new);
        assert_eq!(drain(&mut dedup), vec![b]);
    }

    #[test]
    fn decreasing_input_is_rejected() {
        let records = vec![Record::new(0, 10, 1), Record::new(0, 4, 1)];
        let mut dedup = Deduplicator::new(VecStream::new(records));
        let err = dedup.next_record().unwrap_err();
        assert!(matches!(err, StreamError::NotSorted { .. }));
    }
}
