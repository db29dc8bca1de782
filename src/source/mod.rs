//! Interfaces through which records enter the pipeline, plus concrete readers.
//!
//! The core only depends on three small capabilities:
//! - [`RecordSource`]: yields raw records in coordinate order and exposes a header
//! - [`Populator`]: converts a raw record into the working [`Record`]
//! - [`RecordFilter`]: drops populated records without counting them as output
//!
//! Downstream stages consume the merged result through [`RecordStream`].

mod bam;
mod header;
mod text;

pub use bam::{BamFilterParams, BamPopulator, BamSource};
pub use header::{SequenceDictionary, SequenceEntry};
pub use text::{render_records, write_records, TextLine, TextPopulator, TextSource};

use std::collections::VecDeque;
use std::iter::Sum;

use thiserror::Error;

use crate::record::Record;
use crate::Result;

/// Skippable problem with a single raw record.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid record: {0}")]
pub struct InvalidRecord(pub String);

impl InvalidRecord {
    /// Construct from any message.
    pub fn new(msg: impl Into<String>) -> Self {
        InvalidRecord(msg.into())
    }
}

/// Running record counters reported by sources, runners and streams.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "stats-serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RecordCounts {
    /// Raw records read.
    pub total: u64,
    /// Records rejected by the populator.
    pub invalid: u64,
    /// Records rejected by filters or region restriction.
    pub filtered: u64,
    /// Records removed as duplicates.
    pub duplicate: u64,
    /// Records handed downstream.
    pub output: u64,
    /// Reference bases covered by output records.
    pub total_bases: u64,
}

impl RecordCounts {
    /// Add another set of counters into this one.
    pub fn merge(&mut self, other: &RecordCounts) {
        self.total += other.total;
        self.invalid += other.invalid;
        self.filtered += other.filtered;
        self.duplicate += other.duplicate;
        self.output += other.output;
        self.total_bases += other.total_bases;
    }
}

impl Sum for RecordCounts {
    fn sum<I: Iterator<Item = RecordCounts>>(iter: I) -> Self {
        iter.fold(RecordCounts::default(), |mut acc, counts| {
            acc.merge(&counts);
            acc
        })
    }
}

/// A reader of raw records sorted by (sequence, start).
///
/// Sources are owned one-to-one by a source runner and closed exactly once.
pub trait RecordSource: Send {
    /// Source-specific raw record type.
    type Raw: Send;

    /// Next raw record, or `None` when exhausted.
    fn next_raw(&mut self) -> Result<Option<Self::Raw>>;

    /// Metadata describing the sequences records refer to.
    fn header(&self) -> &SequenceDictionary;

    /// Counts of records the source itself dropped or observed before hand-off.
    fn counts(&self) -> RecordCounts {
        RecordCounts::default()
    }

    /// Release underlying resources.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Converts a raw record into the working record type.
pub trait Populator<Raw> {
    /// Populate a record, or explain why the raw record is unusable.
    fn populate(&mut self, raw: Raw) -> std::result::Result<Record, InvalidRecord>;
}

impl<Raw, F> Populator<Raw> for F
where
    F: FnMut(Raw) -> std::result::Result<Record, InvalidRecord>,
{
    fn populate(&mut self, raw: Raw) -> std::result::Result<Record, InvalidRecord> {
        self(raw)
    }
}

/// Predicate deciding whether a populated record continues downstream.
pub trait RecordFilter: Send + Sync {
    /// Return `true` to keep the record.
    fn accept(&self, record: &Record) -> bool;
}

impl<F> RecordFilter for F
where
    F: Fn(&Record) -> bool + Send + Sync,
{
    fn accept(&self, record: &Record) -> bool {
        self(record)
    }
}

/// Keeps records at or above a mapping-quality threshold.
#[derive(Debug, Clone, Copy)]
pub struct MappingQualityFilter {
    /// Minimum accepted mapping quality.
    pub min_mapping_quality: u8,
}

impl RecordFilter for MappingQualityFilter {
    fn accept(&self, record: &Record) -> bool {
        record.mapping_quality >= self.min_mapping_quality
    }
}

/// An ordered stream of populated records.
pub trait RecordStream {
    /// Next record, or `None` when the stream is exhausted.
    fn next_record(&mut self) -> Result<Option<Record>>;

    /// Aggregate counters for everything seen so far.
    fn counts(&self) -> RecordCounts {
        RecordCounts::default()
    }
}

impl<S: RecordStream + ?Sized> RecordStream for Box<S> {
    fn next_record(&mut self) -> Result<Option<Record>> {
        (**self).next_record()
    }

    fn counts(&self) -> RecordCounts {
        (**self).counts()
    }
}

/// In-memory source over pre-sorted raw records.
#[derive(Debug, Clone)]
pub struct VecSource<Raw> {
    items: VecDeque<Raw>,
    header: SequenceDictionary,
}

impl<Raw> VecSource<Raw> {
    /// Create a source yielding `items` in order.
    pub fn new(header: SequenceDictionary, items: Vec<Raw>) -> Self {
        Self {
            items: items.into(),
            header,
        }
    }
}

impl<Raw: Send> RecordSource for VecSource<Raw> {
    type Raw = Raw;

    fn next_raw(&mut self) -> Result<Option<Raw>> {
        Ok(self.items.pop_front())
    }

    fn header(&self) -> &SequenceDictionary {
        &self.header
    }
}

/// In-memory stream over already populated, sorted records.
#[derive(Debug, Clone, Default)]
pub struct VecStream {
    records: VecDeque<Record>,
    emitted: u64,
}

impl VecStream {
    /// Create a stream yielding `records` in order.
    pub fn new(records: Vec<Record>) -> Self {
        Self {
            records: records.into(),
            emitted: 0,
        }
    }
}

impl RecordStream for VecStream {
    fn next_record(&mut self) -> Result<Option<Record>> {
        let record = self.records.pop_front();
        if record.is_some() {
            self.emitted += 1;
        }
        Ok(record)
    }

    fn counts(&self) -> RecordCounts {
        RecordCounts {
            total: self.emitted,
            output: self.emitted,
            ..RecordCounts::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_sum_field_by_field() {
        let a = RecordCounts {
            total: 3,
            invalid: 1,
            output: 2,
            total_bases: 20,
            ..RecordCounts::default()
        };
        let b = RecordCounts {
            total: 5,
            filtered: 2,
            duplicate: 1,
            output: 2,
            total_bases: 30,
            ..RecordCounts::default()
        };
        let sum: RecordCounts = [a, b].into_iter().sum();
        assert_eq!(sum.total, 8);
        assert_eq!(sum.invalid, 1);
        assert_eq!(sum.filtered, 2);
        assert_eq!(sum.duplicate, 1);
        assert_eq!(sum.output, 4);
        assert_eq!(sum.total_bases, 50);
    }

    #[test]
    fn closures_act_as_populators_and_filters() {
        let mut populate = |raw: (i64, u32)| {
            if raw.1 == 0 {
                Err(InvalidRecord::new("empty"))
            } else {
                Ok(Record::new(0, raw.0, raw.1))
            }
        };
        assert_eq!(populate.populate((5, 3)).unwrap().end(), 8);
        assert!(populate.populate((5, 0)).is_err());

        let keep_long = |record: &Record| record.length >= 10;
        assert!(keep_long.accept(&Record::new(0, 0, 12)));
        assert!(!keep_long.accept(&Record::new(0, 0, 2)));

        let mapq = MappingQualityFilter {
            min_mapping_quality: 20,
        };
        assert!(mapq.accept(&Record::new(0, 0, 1).with_mapping_quality(30)));
        assert!(!mapq.accept(&Record::new(0, 0, 1).with_mapping_quality(5)));
    }

    #[test]
    fn vec_stream_counts_emitted_records() {
        let mut stream = VecStream::new(vec![Record::new(0, 1, 1), Record::new(0, 2, 1)]);
        while stream.next_record().unwrap().is_some() {}
        assert_eq!(stream.counts().output, 2);
    }
}
