//! BAM/SAM/CRAM input through htslib.

use std::fmt;
use std::path::{Path, PathBuf};

use rust_htslib::bam::{self, HeaderView, Read};

use crate::record::{GenomeRegion, Record};
use crate::source::{InvalidRecord, Populator, RecordCounts, RecordSource, SequenceDictionary};
use crate::{Result, StreamError};

/// Flag and quality criteria applied while reading, before population.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BamFilterParams {
    /// Minimum mapping quality.
    pub min_mapping_quality: u8,
    /// Drop reads flagged unmapped.
    pub exclude_unmapped: bool,
    /// Drop secondary alignments.
    pub exclude_secondary: bool,
    /// Drop supplementary alignments.
    pub exclude_supplementary: bool,
    /// Drop reads failing platform QC.
    pub exclude_qc_fail: bool,
    /// Drop reads already flagged as duplicates.
    pub exclude_duplicates: bool,
}

impl Default for BamFilterParams {
    fn default() -> Self {
        Self {
            min_mapping_quality: 0,
            exclude_unmapped: true,
            exclude_secondary: true,
            exclude_supplementary: true,
            exclude_qc_fail: true,
            exclude_duplicates: false,
        }
    }
}

impl BamFilterParams {
    /// Whether a raw alignment passes every criterion.
    pub fn accepts(&self, record: &bam::Record) -> bool {
        !(record.mapq() < self.min_mapping_quality
            || (self.exclude_unmapped && record.is_unmapped())
            || (self.exclude_secondary && record.is_secondary())
            || (self.exclude_supplementary && record.is_supplementary())
            || (self.exclude_qc_fail && record.is_quality_check_failed())
            || (self.exclude_duplicates && record.is_duplicate()))
    }
}

enum BamReader {
    Plain(bam::Reader),
    Indexed(bam::IndexedReader),
}

impl BamReader {
    fn read(&mut self, record: &mut bam::Record) -> Option<rust_htslib::errors::Result<()>> {
        match self {
            BamReader::Plain(reader) => reader.read(record),
            BamReader::Indexed(reader) => reader.read(record),
        }
    }
}

/// Alignment file reader yielding raw htslib records.
pub struct BamSource {
    reader: BamReader,
    header: SequenceDictionary,
    params: BamFilterParams,
    path: PathBuf,
    filtered: u64,
}

impl BamSource {
    /// Open a whole file for sequential reading.
    pub fn open(path: impl AsRef<Path>, params: BamFilterParams) -> Result<Self> {
        let path = path.as_ref();
        let reader = bam::Reader::from_path(path).map_err(|err| hts_error(path, err))?;
        let header = dictionary_from_view(reader.header());
        Ok(Self {
            reader: BamReader::Plain(reader),
            header,
            params,
            path: path.to_path_buf(),
            filtered: 0,
        })
    }

    /// Open an indexed file and read only records overlapping `region`.
    pub fn open_region(
        path: impl AsRef<Path>,
        region: GenomeRegion,
        params: BamFilterParams,
    ) -> Result<Self> {
        let path = path.as_ref();
        let mut reader = bam::IndexedReader::from_path(path).map_err(|err| hts_error(path, err))?;
        let header = dictionary_from_view(reader.header());
        reader
            .fetch((region.sequence_id, region.start, region.end))
            .map_err(|err| hts_error(path, err))?;
        Ok(Self {
            reader: BamReader::Indexed(reader),
            header,
            params,
            path: path.to_path_buf(),
            filtered: 0,
        })
    }
}

impl RecordSource for BamSource {
    type Raw = bam::Record;

    fn next_raw(&mut self) -> Result<Option<bam::Record>> {
        loop {
            let mut record = bam::Record::new();
            match self.reader.read(&mut record) {
                None => return Ok(None),
                Some(Err(err)) => return Err(hts_error(&self.path, err)),
                Some(Ok(())) if self.params.accepts(&record) => return Ok(Some(record)),
                Some(Ok(())) => self.filtered += 1,
            }
        }
    }

    fn header(&self) -> &SequenceDictionary {
        &self.header
    }

    fn counts(&self) -> RecordCounts {
        RecordCounts {
            total: self.filtered,
            filtered: self.filtered,
            ..RecordCounts::default()
        }
    }
}

impl fmt::Debug for BamSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BamSource")
            .field("path", &self.path)
            .field("sequences", &self.header.len())
            .field("params", &self.params)
            .field("filtered", &self.filtered)
            .finish()
    }
}

/// Converts htslib records into [`Record`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct BamPopulator {
    genome_origin: u32,
}

impl BamPopulator {
    /// Populator tagging every record with `genome_origin`.
    pub fn new(genome_origin: u32) -> Self {
        Self { genome_origin }
    }
}

impl Populator<bam::Record> for BamPopulator {
    fn populate(&mut self, raw: bam::Record) -> std::result::Result<Record, InvalidRecord> {
        let sequence_id = raw.tid();
        let start = raw.pos();
        if sequence_id >= 0 && start < 0 {
            return Err(InvalidRecord::new(format!(
                "{}: placed record without a position",
                String::from_utf8_lossy(raw.qname())
            )));
        }

        let length = if raw.is_unmapped() {
            0
        } else {
            let end = raw.cigar().end_pos();
            u32::try_from(end - start).map_err(|_| {
                InvalidRecord::new(format!(
                    "{}: alignment end {} precedes start {}",
                    String::from_utf8_lossy(raw.qname()),
                    end,
                    start
                ))
            })?
        };

        let mut record = Record::new(sequence_id, start.max(0), length)
            .with_genome_origin(self.genome_origin)
            .with_mapping_quality(raw.mapq())
            .with_name_hash(Record::hash_name(raw.qname()));
        if raw.is_paired() && !raw.is_mate_unmapped() {
            record = record.with_mate(raw.mtid(), raw.insert_size());
        }
        Ok(record)
    }
}

fn dictionary_from_view(view: &HeaderView) -> SequenceDictionary {
    let mut dict = SequenceDictionary::new();
    for tid in 0..view.target_count() {
        let name = String::from_utf8_lossy(view.tid2name(tid)).into_owned();
        dict = dict.with_sequence(name, view.target_len(tid).unwrap_or(0));
    }
    let text = String::from_utf8_lossy(view.as_bytes()).into_owned();
    for line in text.lines().filter(|line| line.starts_with("@RG")) {
        if let Some(id) = line.split('\t').find_map(|field| field.strip_prefix("ID:")) {
            dict = dict.with_read_group(id);
        }
    }
    dict
}

fn hts_error(path: &Path, err: rust_htslib::errors::Error) -> StreamError {
    StreamError::source_failure(format!("{}: {}", path.display(), err))
}
