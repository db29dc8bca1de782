//! Multi-threaded k-way merge of sorted record sources.
//!
//! Sources are partitioned round-robin across a fixed pool of
//! [`SourceRunner`]s. Each runner merges its own partition on a dedicated
//! thread and hands packets to the [`MergeCoordinator`] through a
//! [`BoundedRecordQueue`]. The coordinator keeps one head record per runner in
//! a binary heap ordered by (sequence, start, runner id), so the merged stream
//! is totally ordered and identical from run to run.

mod heap;
mod runner;

pub use runner::{Packet, RunnerStats, SourceRunner};

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info};

use self::heap::HeapEntry;
use self::runner::RunnerSettings;
use crate::queue::{BoundedRecordQueue, CancellationToken, DEFAULT_WAIT_TIMEOUT};
use crate::record::{GenomeRegion, Locus, Record};
use crate::source::{
    Populator, RecordCounts, RecordFilter, RecordSource, RecordStream, SequenceDictionary,
};
use crate::{Result, StreamError};

/// Configuration for a merge session.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "stats-serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MergeConfig {
    /// Number of runner threads (capped by the number of sources).
    pub threads: usize,
    /// Records per packet.
    pub packet_size: usize,
    /// Packets buffered per runner queue.
    pub queue_capacity: usize,
    /// Interval between cancellation checks while blocked.
    pub wait_timeout: Duration,
    /// Downgrade incompatible source headers to a warning.
    pub ignore_incompatible: bool,
    /// Invalid records logged individually per runner before suppression.
    pub invalid_warning_cap: u64,
    /// Restrict every source to one region.
    pub region: Option<GenomeRegion>,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            packet_size: 100,
            queue_capacity: 4,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            ignore_incompatible: false,
            invalid_warning_cap: 5,
            region: None,
        }
    }
}

impl MergeConfig {
    /// Set the number of runner threads.
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Set the packet size.
    pub fn with_packet_size(mut self, packet_size: usize) -> Self {
        self.packet_size = packet_size;
        self
    }

    /// Set the per-runner queue capacity.
    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    /// Set the wait timeout.
    pub fn with_wait_timeout(mut self, wait_timeout: Duration) -> Self {
        self.wait_timeout = wait_timeout;
        self
    }

    /// Accept sources whose headers disagree.
    pub fn with_ignore_incompatible(mut self, ignore: bool) -> Self {
        self.ignore_incompatible = ignore;
        self
    }

    /// Set the invalid-record warning cap.
    pub fn with_invalid_warning_cap(mut self, cap: u64) -> Self {
        self.invalid_warning_cap = cap;
        self
    }

    /// Restrict reading to one region.
    pub fn with_region(mut self, region: GenomeRegion) -> Self {
        self.region = Some(region);
        self
    }

    /// Check every parameter is usable.
    pub fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            return Err(StreamError::InvalidConfiguration(
                "thread count must be > 0".to_string(),
            ));
        }
        if self.packet_size == 0 {
            return Err(StreamError::InvalidConfiguration(
                "packet size must be > 0".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(StreamError::InvalidConfiguration(
                "queue capacity must be > 0".to_string(),
            ));
        }
        if self.wait_timeout.is_zero() {
            return Err(StreamError::InvalidConfiguration(
                "wait timeout must be > 0".to_string(),
            ));
        }
        if let Some(region) = self.region {
            if region.start > region.end {
                return Err(StreamError::InvalidConfiguration(format!(
                    "region start {} exceeds end {}",
                    region.start, region.end
                )));
            }
        }
        Ok(())
    }
}

/// Coordinator-side view of one runner.
struct Lane {
    queue: Arc<BoundedRecordQueue<Packet>>,
    packet: VecDeque<Record>,
    done: bool,
    stats: Arc<RunnerStats>,
    handle: Option<JoinHandle<()>>,
}

/// Merges every runner's output into one globally ordered stream.
pub struct MergeCoordinator {
    lanes: Vec<Lane>,
    heads: BinaryHeap<Reverse<HeapEntry>>,
    header: SequenceDictionary,
    token: CancellationToken,
    last: Option<Locus>,
    closed: bool,
}

impl MergeCoordinator {
    /// Start merging `sources`, converting raw records with `populator`.
    pub fn new<S, P>(sources: Vec<S>, populator: P, config: MergeConfig) -> Result<Self>
    where
        S: RecordSource + 'static,
        P: Populator<S::Raw> + Clone + Send + 'static,
    {
        Self::start(sources, populator, None, config)
    }

    /// Like [`new`](Self::new) with a record filter applied inside every runner.
    pub fn with_filter<S, P>(
        sources: Vec<S>,
        populator: P,
        filter: Arc<dyn RecordFilter>,
        config: MergeConfig,
    ) -> Result<Self>
    where
        S: RecordSource + 'static,
        P: Populator<S::Raw> + Clone + Send + 'static,
    {
        Self::start(sources, populator, Some(filter), config)
    }

    fn start<S, P>(
        sources: Vec<S>,
        populator: P,
        filter: Option<Arc<dyn RecordFilter>>,
        config: MergeConfig,
    ) -> Result<Self>
    where
        S: RecordSource + 'static,
        P: Populator<S::Raw> + Clone + Send + 'static,
    {
        config.validate()?;
        let headers: Vec<SequenceDictionary> =
            sources.iter().map(|source| source.header().clone()).collect();
        let header = SequenceDictionary::reconcile(&headers, config.ignore_incompatible)?;

        let threads = config.threads.min(sources.len());
        let mut partitions: Vec<Vec<S>> = (0..threads).map(|_| Vec::new()).collect();
        for (idx, source) in sources.into_iter().enumerate() {
            partitions[idx % threads].push(source);
        }

        let token = CancellationToken::new();
        let settings = RunnerSettings {
            packet_size: config.packet_size,
            invalid_warning_cap: config.invalid_warning_cap,
            region: config.region,
        };

        let mut coordinator = Self {
            lanes: Vec::with_capacity(threads),
            heads: BinaryHeap::with_capacity(threads),
            header,
            token: token.clone(),
            last: None,
            closed: false,
        };

        for (id, partition) in partitions.into_iter().enumerate() {
            let queue = Arc::new(
                BoundedRecordQueue::new(config.queue_capacity, token.clone())
                    .with_timeout(config.wait_timeout),
            );
            let runner = SourceRunner::new(
                id,
                partition,
                populator.clone(),
                filter.clone(),
                settings,
                Arc::clone(&queue),
                token.clone(),
            );
            let stats = runner.stats();
            let handle = match runner.spawn() {
                Ok(handle) => handle,
                Err(err) => {
                    coordinator.abort();
                    return Err(err.into());
                }
            };
            coordinator.lanes.push(Lane {
                queue,
                packet: VecDeque::new(),
                done: false,
                stats,
                handle: Some(handle),
            });
        }
        debug!(runners = threads, "merge started");

        for idx in 0..coordinator.lanes.len() {
            if let Err(err) = coordinator.refill(idx) {
                // A panicked runner only shows up as cancellation until joined.
                return Err(match coordinator.close() {
                    Err(cause) if err.is_cancellation() => cause,
                    _ => err,
                });
            }
        }
        Ok(coordinator)
    }

    /// Reconciled header of all sources.
    pub fn header(&self) -> &SequenceDictionary {
        &self.header
    }

    /// Handle that cancels this merge when raised.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Whether another record is available.
    pub fn has_next(&self) -> bool {
        !self.heads.is_empty()
    }

    /// Emit the globally next record, or `None` once every runner is exhausted.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<Option<Record>> {
        let Some(Reverse(entry)) = self.heads.pop() else {
            return Ok(None);
        };
        self.refill(entry.index)?;

        if let Some(previous) = self.last {
            if entry.locus < previous {
                return Err(StreamError::NotSorted {
                    previous,
                    current: entry.locus,
                });
            }
        }
        self.last = Some(entry.locus);
        Ok(Some(entry.record))
    }

    /// Counters summed across runners.
    pub fn counts(&self) -> RecordCounts {
        self.lanes.iter().map(|lane| lane.stats.snapshot()).sum()
    }

    /// Push the next head of one lane, pulling a packet if needed.
    fn refill(&mut self, idx: usize) -> Result<()> {
        let lane = &mut self.lanes[idx];
        loop {
            if let Some(record) = lane.packet.pop_front() {
                self.heads.push(Reverse(HeapEntry::new(idx, record)));
                return Ok(());
            }
            if lane.done {
                return Ok(());
            }
            match lane.queue.take() {
                Ok(Some(packet)) => lane.packet = packet.into(),
                Ok(None) if lane.queue.is_closed() || self.token.is_cancelled() => {
                    return Err(self.failure());
                }
                Ok(None) => lane.done = true,
                Err(err) if err.is_cancellation() => return Err(self.failure()),
                Err(err) => return Err(err),
            }
        }
    }

    /// The originating error of a cancelled session.
    ///
    /// The stored error stays in the token so [`close`](Self::close) reports it too.
    fn failure(&self) -> StreamError {
        self.token.error().unwrap_or_else(|| StreamError::Cancelled {
            reason: self
                .token
                .reason()
                .unwrap_or_else(|| "merge input closed early".to_string()),
        })
    }

    fn abort(&mut self) {
        for lane in &self.lanes {
            lane.queue.close();
        }
        for lane in &mut self.lanes {
            if let Some(handle) = lane.handle.take() {
                let _ = handle.join();
            }
        }
        self.closed = true;
    }

    /// Stop every runner, join their threads and report the first failure.
    ///
    /// Runners still producing are released by closing their queues. A
    /// runner that panicked is reported as [`StreamError::RunnerPanicked`].
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        for lane in &self.lanes {
            lane.queue.close();
        }

        let mut first: Option<StreamError> = None;
        for (runner, lane) in self.lanes.iter_mut().enumerate() {
            let Some(handle) = lane.handle.take() else {
                continue;
            };
            if let Err(payload) = handle.join() {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                first.get_or_insert(StreamError::RunnerPanicked { runner, message });
            }
        }
        if let Some(err) = self.token.take_error() {
            first.get_or_insert(err);
        }

        let counts = self.counts();
        info!(
            total = counts.total,
            invalid = counts.invalid,
            filtered = counts.filtered,
            output = counts.output,
            "merge closed"
        );
        first.map_or(Ok(()), Err)
    }
}

impl RecordStream for MergeCoordinator {
    fn next_record(&mut self) -> Result<Option<Record>> {
        self.next()
    }

    fn counts(&self) -> RecordCounts {
        MergeCoordinator::counts(self)
    }
}

impl Drop for MergeCoordinator {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl std::fmt::Debug for MergeCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeCoordinator")
            .field("runners", &self.lanes.len())
            .field("pending_heads", &self.heads.len())
            .field("last", &self.last)
            .field("closed", &self.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{InvalidRecord, VecSource};
    use test_case::test_case;

    fn populate(record: Record) -> std::result::Result<Record, InvalidRecord> {
        Ok(record)
    }

    fn header() -> SequenceDictionary {
        SequenceDictionary::new()
            .with_sequence("chr1", 1_000)
            .with_sequence("chr2", 1_000)
    }

    fn source(records: Vec<Record>) -> VecSource<Record> {
        VecSource::new(header(), records)
    }

    fn config(threads: usize) -> MergeConfig {
        MergeConfig::default()
            .with_threads(threads)
            .with_packet_size(2)
            .with_queue_capacity(1)
            .with_wait_timeout(Duration::from_millis(20))
    }

    fn collect(merge: &mut MergeCoordinator) -> Vec<Record> {
        let mut out = Vec::new();
        while let Some(record) = merge.next().unwrap() {
            out.push(record);
        }
        out
    }

    #[test_case(1 ; "single runner")]
    #[test_case(2 ; "two runners")]
    #[test_case(3 ; "runner per source")]
    fn output_is_sorted_regardless_of_thread_count(threads: usize) {
        let sources = vec![
            source(vec![Record::new(0, 1, 5), Record::new(0, 7, 5), Record::new(1, 3, 5)]),
            source(vec![Record::new(0, 2, 5), Record::new(0, 7, 9)]),
            source(vec![Record::new(0, 0, 1), Record::new(1, 0, 1), Record::new(-1, 0, 1)]),
        ];
        let mut merge = MergeCoordinator::new(sources, populate, config(threads)).unwrap();
        let records = collect(&mut merge);
        merge.close().unwrap();

        let loci: Vec<Locus> = records.iter().map(Record::locus).collect();
        let mut sorted = loci.clone();
        sorted.sort();
        assert_eq!(loci, sorted);
        assert_eq!(records.len(), 8);
        assert_eq!(merge.counts().output, 8);
        assert!(!merge.has_next());
    }

    #[test]
    fn equal_loci_follow_runner_id() {
        let sources = vec![
            source(vec![Record::new(0, 10, 10)]),
            source(vec![Record::new(0, 15, 10)]),
            source(vec![Record::new(0, 10, 2)]),
        ];
        let mut merge = MergeCoordinator::new(sources, populate, config(3)).unwrap();
        let lengths: Vec<u32> = collect(&mut merge).iter().map(|r| r.length).collect();
        assert_eq!(lengths, vec![10, 2, 10]);
    }

    #[test]
    fn filtered_records_are_counted_not_emitted() {
        let sources = vec![
            source(vec![Record::new(0, 1, 5), Record::new(0, 4, 20)]),
            source(vec![Record::new(0, 2, 12), Record::new(1, 0, 3)]),
        ];
        let keep_long = Arc::new(|record: &Record| record.length >= 10);
        let mut merge =
            MergeCoordinator::with_filter(sources, populate, keep_long, config(2)).unwrap();
        let kept: Vec<(i64, u32)> = collect(&mut merge).iter().map(|r| (r.start, r.length)).collect();
        merge.close().unwrap();

        assert_eq!(kept, vec![(2, 12), (4, 20)]);
        let counts = merge.counts();
        assert_eq!(counts.total, 4);
        assert_eq!(counts.filtered, 2);
        assert_eq!(counts.output, 2);
        assert_eq!(counts.total_bases, 32);
    }

    #[test]
    fn incompatible_headers_fail_unless_ignored() {
        let other = SequenceDictionary::new().with_sequence("chrX", 10);
        let make = || {
            vec![
                source(vec![Record::new(0, 1, 1)]),
                VecSource::new(other.clone(), vec![Record::new(0, 2, 1)]),
            ]
        };
        let err = MergeCoordinator::new(make(), populate, config(2)).unwrap_err();
        assert!(matches!(err, StreamError::IncompatibleSources(_)));

        let mut merge =
            MergeCoordinator::new(make(), populate, config(2).with_ignore_incompatible(true))
                .unwrap();
        assert_eq!(collect(&mut merge).len(), 2);
        assert_eq!(merge.header(), &header());
    }

    #[test]
    fn zero_packet_size_is_rejected() {
        let err = MergeCoordinator::new(
            vec![source(vec![])],
            populate,
            config(1).with_packet_size(0),
        )
        .unwrap_err();
        assert!(matches!(err, StreamError::InvalidConfiguration(_)));
    }

    #[test]
    fn no_sources_gives_empty_stream() {
        let mut merge =
            MergeCoordinator::new(Vec::<VecSource<Record>>::new(), populate, config(4)).unwrap();
        assert!(!merge.has_next());
        assert!(merge.next().unwrap().is_none());
        merge.close().unwrap();
    }
}
