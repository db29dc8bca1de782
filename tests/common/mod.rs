#![allow(dead_code)]

use std::collections::VecDeque;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rosalind_stream::source::TextSource;
use rosalind_stream::{InvalidRecord, Record, RecordSource, RecordStream, SequenceDictionary, StreamError};

fn snapshot_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("snapshots")
}

pub fn assert_snapshot(name: &str, actual: &str) {
    let path = snapshot_root().join(name);
    if std::env::var("ROSALIND_UPDATE_SNAPSHOTS").is_ok() {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create snapshot directory");
        }
        fs::write(&path, actual).expect("write snapshot");
        return;
    }

    let expected =
        fs::read_to_string(&path).unwrap_or_else(|_| panic!("snapshot {:?} not found", path));
    if normalize(&expected) != normalize(actual) {
        panic!(
            "Snapshot mismatch for {:?}. Set ROSALIND_UPDATE_SNAPSHOTS=1 to regenerate.\nExpected:\n{}\nActual:\n{}",
            path,
            expected,
            actual
        );
    }
}

fn normalize(input: &str) -> String {
    input.replace("\r\n", "\n")
}

pub fn header() -> SequenceDictionary {
    SequenceDictionary::new()
        .with_sequence("chr1", 1_000)
        .with_sequence("chr2", 1_000)
}

/// Text source over an in-memory body, prefixed with the shared header.
pub fn text_source(body: &str) -> TextSource<Cursor<String>> {
    let text = format!("@SQ\tchr1\t1000\n@SQ\tchr2\t1000\n{}", body);
    TextSource::new(Cursor::new(text), "inline").expect("valid header")
}

pub fn identity(record: Record) -> Result<Record, InvalidRecord> {
    Ok(record)
}

pub fn drain<S: RecordStream>(stream: &mut S) -> Vec<Record> {
    let mut out = Vec::new();
    while let Some(record) = stream.next_record().expect("stream yields") {
        out.push(record);
    }
    out
}

/// What a [`ScriptedSource`] does after its records run out.
#[derive(Debug, Clone)]
pub enum Ending {
    Finish,
    Fail(String),
    Panic,
}

/// Source replaying records, optionally slowly, then ending as scripted.
#[derive(Debug)]
pub struct ScriptedSource {
    records: VecDeque<Record>,
    ending: Ending,
    delay: Option<Duration>,
    header: SequenceDictionary,
    closes: Arc<AtomicUsize>,
}

impl ScriptedSource {
    pub fn new(records: Vec<Record>) -> Self {
        Self {
            records: records.into(),
            ending: Ending::Finish,
            delay: None,
            header: header(),
            closes: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn ending(mut self, ending: Ending) -> Self {
        self.ending = ending;
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn close_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.closes)
    }
}

impl RecordSource for ScriptedSource {
    type Raw = Record;

    fn next_raw(&mut self) -> Result<Option<Record>, StreamError> {
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        if let Some(record) = self.records.pop_front() {
            return Ok(Some(record));
        }
        match &self.ending {
            Ending::Finish => Ok(None),
            Ending::Fail(msg) => Err(StreamError::source_failure(msg.clone())),
            Ending::Panic => panic!("scripted source exploded"),
        }
    }

    fn header(&self) -> &SequenceDictionary {
        &self.header
    }

    fn close(&mut self) -> Result<(), StreamError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Records at evenly spaced starts on one sequence.
pub fn ladder(sequence_id: i32, first: i64, step: i64, count: usize, length: u32) -> Vec<Record> {
    (0..count as i64)
        .map(|i| Record::new(sequence_id, first + i * step, length))
        .collect()
}
