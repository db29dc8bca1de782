//! Tab-separated record files.
//!
//! Header lines come first:
//!
//! ```text
//! @SQ	chr1	248956422
//! @RG	sample-a
//! # comment
//! ```
//!
//! followed by one record per line, sorted by (sequence, start):
//!
//! ```text
//! chr1	10	100	60	read-1	chr1	250
//! ```
//!
//! Columns are sequence name, 0-based start, reference length, then optional
//! mapping quality, read name, mate sequence and fragment length. `*` marks an
//! unplaced sequence or an absent name or mate; `=` names the record's own
//! sequence as the mate sequence.

use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use crate::record::Record;
use crate::source::{InvalidRecord, Populator, RecordSource, SequenceDictionary};
use crate::{Result, StreamError};

/// One unparsed record line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextLine {
    /// 1-based line number in the input.
    pub number: usize,
    /// Line contents without the trailing newline.
    pub text: String,
    /// Dataset identifier assigned to the file.
    pub genome_origin: u32,
}

/// Reader over a text record file.
#[derive(Debug)]
pub struct TextSource<R> {
    reader: R,
    header: SequenceDictionary,
    pending: Option<TextLine>,
    line_number: usize,
    genome_origin: u32,
    name: String,
}

impl TextSource<BufReader<File>> {
    /// Open a file on disk.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        Self::new(BufReader::new(file), path.display().to_string())
    }
}

impl<R: BufRead> TextSource<R> {
    /// Read the header block eagerly and position at the first record line.
    pub fn new(reader: R, name: impl Into<String>) -> Result<Self> {
        let mut source = Self {
            reader,
            header: SequenceDictionary::new(),
            pending: None,
            line_number: 0,
            genome_origin: 0,
            name: name.into(),
        };
        source.read_header()?;
        Ok(source)
    }

    /// Tag every record from this file with a dataset identifier.
    pub fn with_genome_origin(mut self, genome_origin: u32) -> Self {
        self.genome_origin = genome_origin;
        if let Some(line) = self.pending.as_mut() {
            line.genome_origin = genome_origin;
        }
        self
    }

    fn read_header(&mut self) -> Result<()> {
        while let Some(text) = self.read_line()? {
            if text.is_empty() || text.starts_with('#') {
                continue;
            }
            if let Some(rest) = text.strip_prefix("@SQ\t") {
                let (name, length) = rest.split_once('\t').ok_or_else(|| {
                    self.header_error("@SQ line needs a name and a length")
                })?;
                let length = length
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| self.header_error("@SQ length is not a number"))?;
                self.header = std::mem::take(&mut self.header).with_sequence(name, length);
            } else if let Some(id) = text.strip_prefix("@RG\t") {
                self.header = std::mem::take(&mut self.header).with_read_group(id.trim());
            } else if text.starts_with('@') {
                continue;
            } else {
                self.pending = Some(TextLine {
                    number: self.line_number,
                    text,
                    genome_origin: self.genome_origin,
                });
                break;
            }
        }
        Ok(())
    }

    fn read_line(&mut self) -> Result<Option<String>> {
        let mut buf = String::new();
        if self.reader.read_line(&mut buf)? == 0 {
            return Ok(None);
        }
        self.line_number += 1;
        let trimmed = buf.trim_end_matches(['\n', '\r']).len();
        buf.truncate(trimmed);
        Ok(Some(buf))
    }

    fn header_error(&self, msg: &str) -> StreamError {
        StreamError::source_failure(format!("{}:{}: {}", self.name, self.line_number, msg))
    }
}

impl<R: BufRead + Send> RecordSource for TextSource<R> {
    type Raw = TextLine;

    fn next_raw(&mut self) -> Result<Option<TextLine>> {
        if let Some(line) = self.pending.take() {
            return Ok(Some(line));
        }
        while let Some(text) = self.read_line()? {
            if text.is_empty() || text.starts_with('#') {
                continue;
            }
            return Ok(Some(TextLine {
                number: self.line_number,
                text,
                genome_origin: self.genome_origin,
            }));
        }
        Ok(None)
    }

    fn header(&self) -> &SequenceDictionary {
        &self.header
    }
}

/// Parses [`TextLine`]s against a sequence dictionary.
#[derive(Debug, Clone)]
pub struct TextPopulator {
    header: SequenceDictionary,
}

impl TextPopulator {
    /// Resolve sequence names against `header`.
    pub fn new(header: SequenceDictionary) -> Self {
        Self { header }
    }

    fn resolve(&self, name: &str, own: i32) -> std::result::Result<i32, InvalidRecord> {
        match name {
            "*" => Ok(-1),
            "=" => Ok(own),
            _ => self
                .header
                .sequence_id(name)
                .ok_or_else(|| InvalidRecord::new(format!("unknown sequence '{}'", name))),
        }
    }
}

impl Populator<TextLine> for TextPopulator {
    fn populate(&mut self, raw: TextLine) -> std::result::Result<Record, InvalidRecord> {
        let fields: Vec<&str> = raw.text.split('\t').collect();
        if fields.len() < 3 {
            return Err(InvalidRecord::new(format!(
                "line {}: expected at least 3 columns, found {}",
                raw.number,
                fields.len()
            )));
        }
        let bad = |what: &str| InvalidRecord::new(format!("line {}: {}", raw.number, what));

        let sequence_id = self.resolve(fields[0], -1)?;
        let start: i64 = fields[1].parse().map_err(|_| bad("start is not a number"))?;
        if start < 0 {
            return Err(bad("negative start"));
        }
        let length: u32 = fields[2].parse().map_err(|_| bad("length is not a number"))?;

        let mut record = Record::new(sequence_id, start, length).with_genome_origin(raw.genome_origin);
        if let Some(mapq) = fields.get(3) {
            let mapq: u8 = mapq.parse().map_err(|_| bad("mapping quality out of range"))?;
            record = record.with_mapping_quality(mapq);
        }
        if let Some(name) = fields.get(4).filter(|name| **name != "*") {
            record = record.with_name_hash(Record::hash_name(name.as_bytes()));
        }
        match (fields.get(5), fields.get(6)) {
            (Some(&"*"), _) | (None, _) => {}
            (Some(mate_seq), Some(fragment)) => {
                let mate_seq = self.resolve(mate_seq, sequence_id)?;
                let fragment: i64 = fragment
                    .parse()
                    .map_err(|_| bad("fragment length is not a number"))?;
                record = record.with_mate(mate_seq, fragment);
            }
            (Some(_), None) => return Err(bad("mate sequence without fragment length")),
        }
        Ok(record)
    }
}

/// Write records as tab-separated lines: sequence, start, end, mapping
/// quality, origin and mate placement (`*` when unmated).
///
/// Overflow placeholders are written with `overflow` in the mate column.
pub fn write_records<W: Write>(
    writer: &mut W,
    header: &SequenceDictionary,
    records: &[Record],
) -> Result<()> {
    for record in records {
        let sequence = sequence_name(header, record.sequence_id);
        let mate = if record.is_overflow() {
            "overflow".to_string()
        } else {
            match record.mate {
                Some(mate) => format!(
                    "{}:{}",
                    sequence_name(header, mate.sequence_id),
                    mate.fragment_length
                ),
                None => "*".to_string(),
            }
        };
        writeln!(
            writer,
            "{}\t{}\t{}\t{}\t{}\t{}",
            sequence,
            record.start,
            record.end(),
            record.mapping_quality,
            record.genome_origin,
            mate
        )?;
    }
    writer.flush()?;
    Ok(())
}

/// Render records into a string (useful for tests and snapshots).
pub fn render_records(header: &SequenceDictionary, records: &[Record]) -> Result<String> {
    let mut buffer = Vec::new();
    write_records(&mut buffer, header, records)?;
    String::from_utf8(buffer)
        .map_err(|_| StreamError::source_failure("rendered records are not valid UTF-8"))
}

fn sequence_name(header: &SequenceDictionary, sequence_id: i32) -> String {
    header
        .sequence(sequence_id)
        .map(|entry| entry.name.clone())
        .unwrap_or_else(|| {
            if sequence_id < 0 {
                "*".to_string()
            } else {
                sequence_id.to_string()
            }
        })
}
