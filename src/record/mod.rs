//! Working record type shared by every stage of the pipeline.
//!
//! Records are produced once by a [`Populator`](crate::source::Populator) and
//! never mutated afterwards. Ordering follows coordinate sort: sequence
//! identifier first, then 0-based start. Records with a negative sequence
//! identifier are unplaced and sort after every placed sequence.

use std::cmp::Ordering;
use std::fmt;

/// Coordinate of a record start: sequence identifier plus 0-based position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Locus {
    /// Sequence identifier (index into the sequence dictionary, negative when unplaced).
    pub sequence_id: i32,
    /// 0-based position on the sequence.
    pub position: i64,
}

impl Locus {
    /// Construct a new locus.
    pub fn new(sequence_id: i32, position: i64) -> Self {
        Self {
            sequence_id,
            position,
        }
    }

    /// Rank used for ordering sequences; unplaced records sort last.
    pub fn sequence_rank(&self) -> u32 {
        sequence_rank(self.sequence_id)
    }
}

impl Ord for Locus {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sequence_rank()
            .cmp(&other.sequence_rank())
            .then(self.position.cmp(&other.position))
    }
}

impl PartialOrd for Locus {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Locus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.sequence_id, self.position)
    }
}

/// Sort rank of a sequence identifier. Negative identifiers map past every placed sequence.
pub fn sequence_rank(sequence_id: i32) -> u32 {
    if sequence_id < 0 {
        u32::MAX
    } else {
        sequence_id as u32
    }
}

/// Half-open region `[start, end)` on one sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "stats-serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GenomeRegion {
    /// Sequence identifier.
    pub sequence_id: i32,
    /// Inclusive 0-based start.
    pub start: i64,
    /// Exclusive end.
    pub end: i64,
}

impl GenomeRegion {
    /// Construct a region.
    pub fn new(sequence_id: i32, start: i64, end: i64) -> Self {
        Self {
            sequence_id,
            start,
            end,
        }
    }

    /// Whether the record's extent intersects this region.
    pub fn overlaps(&self, record: &Record) -> bool {
        record.sequence_id == self.sequence_id
            && record.start < self.end
            && record.extent_end() > self.start
    }

    /// Whether the record starts past the end of this region in coordinate order.
    pub fn is_passed_by(&self, record: &Record) -> bool {
        record.locus() >= Locus::new(self.sequence_id, self.end)
    }
}

/// Mate information carried by one end of a paired fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MateInfo {
    /// Sequence identifier the mate is placed on.
    pub sequence_id: i32,
    /// Signed fragment (template) length.
    pub fragment_length: i64,
}

/// Distinguishes genuine records from cache-generated placeholders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// Record produced by parsing an input.
    Read,
    /// Synthetic placeholder standing in for a chain that exceeded the depth limit.
    Overflow,
}

/// Genomic record handed through merge, deduplication and windowing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Sequence identifier (negative when unplaced).
    pub sequence_id: i32,
    /// 0-based leftmost reference coordinate.
    pub start: i64,
    /// Number of reference bases covered.
    pub length: u32,
    /// Logical input dataset the record came from.
    pub genome_origin: u32,
    /// Mate placement, present only for mated records.
    pub mate: Option<MateInfo>,
    /// Mapping quality (Phred-scaled).
    pub mapping_quality: u8,
    /// Deterministic fingerprint of the read name, used to break duplicate ties.
    pub name_hash: u64,
    kind: RecordKind,
}

impl Record {
    /// Construct an unmated record.
    pub fn new(sequence_id: i32, start: i64, length: u32) -> Self {
        Self {
            sequence_id,
            start,
            length,
            genome_origin: 0,
            mate: None,
            mapping_quality: 0,
            name_hash: 0,
            kind: RecordKind::Read,
        }
    }

    /// Construct the placeholder substituted for an overflowing chain.
    pub fn overflow_marker(sequence_id: i32, start: i64, length: u32) -> Self {
        Self {
            kind: RecordKind::Overflow,
            ..Self::new(sequence_id, start, length)
        }
    }

    /// Attach mate placement.
    pub fn with_mate(mut self, sequence_id: i32, fragment_length: i64) -> Self {
        self.mate = Some(MateInfo {
            sequence_id,
            fragment_length,
        });
        self
    }

    /// Set the originating dataset.
    pub fn with_genome_origin(mut self, genome_origin: u32) -> Self {
        self.genome_origin = genome_origin;
        self
    }

    /// Set the mapping quality.
    pub fn with_mapping_quality(mut self, mapping_quality: u8) -> Self {
        self.mapping_quality = mapping_quality;
        self
    }

    /// Set the read-name fingerprint.
    pub fn with_name_hash(mut self, name_hash: u64) -> Self {
        self.name_hash = name_hash;
        self
    }

    /// Coordinate of the record start.
    pub fn locus(&self) -> Locus {
        Locus::new(self.sequence_id, self.start)
    }

    /// End position (half-open) on the reference.
    pub fn end(&self) -> i64 {
        self.start + i64::from(self.length)
    }

    /// End of the extent used for overlap tests; zero-length records occupy their start.
    pub fn extent_end(&self) -> i64 {
        self.start + i64::from(self.length.max(1))
    }

    /// Whether this record is one end of a mated pair.
    pub fn is_mated(&self) -> bool {
        self.mate.is_some()
    }

    /// Whether this record is an overflow placeholder.
    pub fn is_overflow(&self) -> bool {
        self.kind == RecordKind::Overflow
    }

    /// Record kind.
    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    /// Sequence identifier of the mate, if mated.
    pub fn mate_sequence_id(&self) -> Option<i32> {
        self.mate.map(|mate| mate.sequence_id)
    }

    /// End of the fragment implied by the mate, if mated.
    pub fn mate_fragment_end(&self) -> Option<i64> {
        self.mate.map(|mate| self.start + mate.fragment_length)
    }

    /// Deterministic 64-bit fingerprint of a read name.
    pub fn hash_name(name: &[u8]) -> u64 {
        let digest = blake3::hash(name);
        let mut word = [0u8; 8];
        word.copy_from_slice(&digest.as_bytes()[..8]);
        u64::from_le_bytes(word)
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}+{}", self.sequence_id, self.start, self.length)?;
        if self.is_overflow() {
            write!(f, " (overflow)")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unplaced_sequences_sort_last() {
        let placed = Locus::new(5, 1_000_000);
        let unplaced = Locus::new(-1, 0);
        assert!(placed < unplaced);
        assert!(Locus::new(0, 10) < Locus::new(0, 11));
        assert!(Locus::new(0, 99) < Locus::new(1, 0));
    }

    #[test]
    fn mate_fragment_end_uses_signed_length() {
        let record = Record::new(0, 100, 50).with_mate(0, 250);
        assert!(record.is_mated());
        assert_eq!(record.mate_fragment_end(), Some(350));

        let reverse = Record::new(0, 300, 50).with_mate(0, -250);
        assert_eq!(reverse.mate_fragment_end(), Some(50));
        assert_eq!(Record::new(0, 1, 1).mate_fragment_end(), None);
    }

    #[test]
    fn zero_length_records_occupy_their_start() {
        let record = Record::new(0, 42, 0);
        assert_eq!(record.end(), 42);
        assert_eq!(record.extent_end(), 43);
        assert!(GenomeRegion::new(0, 42, 43).overlaps(&record));
    }

    #[test]
    fn overflow_markers_are_distinguishable() {
        let marker = Record::overflow_marker(2, 10, 7);
        assert!(marker.is_overflow());
        assert!(!marker.is_mated());
        assert_eq!(marker.to_string(), "2:10+7 (overflow)");
        assert!(!Record::new(2, 10, 7).is_overflow());
    }

    #[test]
    fn name_hash_is_stable() {
        assert_eq!(Record::hash_name(b"read/1"), Record::hash_name(b"read/1"));
        assert_ne!(Record::hash_name(b"read/1"), Record::hash_name(b"read/2"));
    }
}
