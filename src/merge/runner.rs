use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use super::heap::HeapEntry;
use crate::queue::{BoundedRecordQueue, CancellationToken};
use crate::record::{GenomeRegion, Locus, Record};
use crate::source::{Populator, RecordCounts, RecordFilter, RecordSource};
use crate::{Result, StreamError};

/// Batch of records handed from a runner to the coordinator.
pub type Packet = Vec<Record>;

/// Counters a runner updates while the coordinator reads them.
#[derive(Debug, Default)]
pub struct RunnerStats {
    total: AtomicU64,
    invalid: AtomicU64,
    filtered: AtomicU64,
    duplicate: AtomicU64,
    output: AtomicU64,
    total_bases: AtomicU64,
}

impl RunnerStats {
    /// Current values.
    pub fn snapshot(&self) -> RecordCounts {
        RecordCounts {
            total: self.total.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            duplicate: self.duplicate.load(Ordering::Relaxed),
            output: self.output.load(Ordering::Relaxed),
            total_bases: self.total_bases.load(Ordering::Relaxed),
        }
    }

    fn add(&self, counts: &RecordCounts) {
        self.total.fetch_add(counts.total, Ordering::Relaxed);
        self.invalid.fetch_add(counts.invalid, Ordering::Relaxed);
        self.filtered.fetch_add(counts.filtered, Ordering::Relaxed);
        self.duplicate.fetch_add(counts.duplicate, Ordering::Relaxed);
        self.output.fetch_add(counts.output, Ordering::Relaxed);
        self.total_bases.fetch_add(counts.total_bases, Ordering::Relaxed);
    }
}

/// Settings a runner takes from the merge configuration.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RunnerSettings {
    pub(crate) packet_size: usize,
    pub(crate) invalid_warning_cap: u64,
    pub(crate) region: Option<GenomeRegion>,
}

/// Reads one partition of sources and publishes merged packets.
///
/// Sources within the partition are merged by (locus, source index) so the
/// runner's output is itself sorted.
pub struct SourceRunner<S: RecordSource, P> {
    id: usize,
    sources: Vec<S>,
    last: Vec<Option<Locus>>,
    exhausted: Vec<bool>,
    populator: P,
    filter: Option<Arc<dyn RecordFilter>>,
    settings: RunnerSettings,
    queue: Arc<BoundedRecordQueue<Packet>>,
    token: CancellationToken,
    stats: Arc<RunnerStats>,
}

impl<S, P> SourceRunner<S, P>
where
    S: RecordSource,
    P: Populator<S::Raw>,
{
    pub(crate) fn new(
        id: usize,
        sources: Vec<S>,
        populator: P,
        filter: Option<Arc<dyn RecordFilter>>,
        settings: RunnerSettings,
        queue: Arc<BoundedRecordQueue<Packet>>,
        token: CancellationToken,
    ) -> Self {
        let count = sources.len();
        Self {
            id,
            sources,
            last: vec![None; count],
            exhausted: vec![false; count],
            populator,
            filter,
            settings,
            queue,
            token,
            stats: Arc::new(RunnerStats::default()),
        }
    }

    /// Partition identifier, used as the merge tie-break.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Shared handle to this runner's counters.
    pub fn stats(&self) -> Arc<RunnerStats> {
        Arc::clone(&self.stats)
    }

    /// Read every source to completion, then close them.
    ///
    /// Failures are handed to the cancellation token and the queue is closed
    /// so the consumer never waits on a runner that has stopped.
    pub fn run(mut self) {
        let _guard = PanicGuard {
            id: self.id,
            queue: Arc::clone(&self.queue),
            token: self.token.clone(),
        };

        let outcome = self.publish();
        let closed = self.close_sources();
        match outcome.and(closed) {
            Ok(()) => debug!(
                runner = self.id,
                counts = ?self.stats.snapshot(),
                "source runner finished"
            ),
            Err(err) => {
                debug!(runner = self.id, error = %err, "source runner failed");
                self.token.cancel_with(err);
                self.queue.close();
            }
        }
    }

    /// Run on a dedicated named thread.
    pub fn spawn(self) -> io::Result<JoinHandle<()>>
    where
        S: 'static,
        P: Send + 'static,
    {
        thread::Builder::new()
            .name(format!("source-runner-{}", self.id))
            .spawn(move || self.run())
    }

    fn publish(&mut self) -> Result<()> {
        let mut heap = BinaryHeap::with_capacity(self.sources.len());
        for idx in 0..self.sources.len() {
            if let Some(record) = self.next_accepted(idx)? {
                heap.push(Reverse(HeapEntry::new(idx, record)));
            }
        }

        let packet_size = self.settings.packet_size;
        let mut packet = Packet::with_capacity(packet_size);
        while let Some(Reverse(entry)) = heap.pop() {
            if let Some(record) = self.next_accepted(entry.index)? {
                heap.push(Reverse(HeapEntry::new(entry.index, record)));
            }
            packet.push(entry.record);

            if packet.len() >= packet_size {
                self.token.check()?;
                let full = std::mem::replace(&mut packet, Packet::with_capacity(packet_size));
                let has_more = !heap.is_empty();
                if !self.queue.put(full, has_more)? {
                    debug!(runner = self.id, "queue closed, stopping early");
                    return Ok(());
                }
                if !has_more {
                    return Ok(());
                }
            }
        }

        if packet.is_empty() {
            self.queue.finish();
        } else {
            self.queue.put(packet, false)?;
        }
        Ok(())
    }

    /// Next record from one source that survives population, region and filter.
    fn next_accepted(&mut self, idx: usize) -> Result<Option<Record>> {
        if self.exhausted[idx] {
            return Ok(None);
        }
        loop {
            let Some(raw) = self.sources[idx].next_raw()? else {
                self.exhausted[idx] = true;
                return Ok(None);
            };
            self.stats.total.fetch_add(1, Ordering::Relaxed);

            let record = match self.populator.populate(raw) {
                Ok(record) => record,
                Err(err) => {
                    self.note_invalid(&err.to_string());
                    continue;
                }
            };

            let locus = record.locus();
            if let Some(previous) = self.last[idx] {
                if locus < previous {
                    return Err(StreamError::NotSorted {
                        previous,
                        current: locus,
                    });
                }
            }
            self.last[idx] = Some(locus);

            if let Some(region) = self.settings.region {
                if region.is_passed_by(&record) {
                    self.stats.filtered.fetch_add(1, Ordering::Relaxed);
                    self.exhausted[idx] = true;
                    return Ok(None);
                }
                if !region.overlaps(&record) {
                    self.stats.filtered.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            }
            if let Some(filter) = &self.filter {
                if !filter.accept(&record) {
                    self.stats.filtered.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            }

            self.stats.output.fetch_add(1, Ordering::Relaxed);
            self.stats
                .total_bases
                .fetch_add(u64::from(record.length), Ordering::Relaxed);
            return Ok(Some(record));
        }
    }

    fn note_invalid(&self, message: &str) {
        let seen = self.stats.invalid.fetch_add(1, Ordering::Relaxed) + 1;
        let cap = self.settings.invalid_warning_cap;
        if seen <= cap {
            warn!(runner = self.id, "skipping {}", message);
        } else if seen == cap + 1 {
            warn!(
                runner = self.id,
                "more than {} invalid records, further warnings suppressed", cap
            );
        }
    }

    fn close_sources(&mut self) -> Result<()> {
        let mut first = None;
        for mut source in self.sources.drain(..) {
            self.stats.add(&source.counts());
            if let Err(err) = source.close() {
                first.get_or_insert(err);
            }
        }
        first.map_or(Ok(()), Err)
    }
}

impl<S: RecordSource, P> std::fmt::Debug for SourceRunner<S, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceRunner")
            .field("id", &self.id)
            .field("sources", &self.sources.len())
            .field("settings", &self.settings)
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}

/// Releases the consumer if the runner thread unwinds.
struct PanicGuard {
    id: usize,
    queue: Arc<BoundedRecordQueue<Packet>>,
    token: CancellationToken,
}

impl Drop for PanicGuard {
    fn drop(&mut self) {
        if thread::panicking() {
            self.token
                .cancel(format!("source runner {} panicked", self.id));
            self.queue.close();
        }
    }
}
