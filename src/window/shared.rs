use parking_lot::Mutex;

use super::{WindowCache, WindowConfig, WindowStats};
use crate::record::Record;
use crate::source::RecordStream;
use crate::Result;

/// [`WindowCache`] shared between threads.
///
/// Every operation takes one lock for its whole duration, so an advance
/// triggered by a query never interleaves with a flush from another thread.
#[derive(Debug)]
pub struct SyncWindowCache<S> {
    inner: Mutex<WindowCache<S>>,
}

impl<S: RecordStream> SyncWindowCache<S> {
    /// Wrap a new cache over `upstream`.
    pub fn new(upstream: S, sequence_id: i32, config: WindowConfig) -> Result<Self> {
        Ok(Self::from_cache(WindowCache::new(upstream, sequence_id, config)?))
    }

    /// Wrap an existing cache.
    pub fn from_cache(cache: WindowCache<S>) -> Self {
        Self {
            inner: Mutex::new(cache),
        }
    }

    /// See [`WindowCache::advance`].
    pub fn advance(&self, end: i64) -> Result<()> {
        self.inner.lock().advance(end)
    }

    /// See [`WindowCache::records_overlap`].
    pub fn records_overlap(&self, start: i64, end: i64) -> Result<Vec<Record>> {
        self.inner.lock().records_overlap(start, end)
    }

    /// See [`WindowCache::flush`].
    pub fn flush(&self, start: i64, end: i64) -> Result<()> {
        self.inner.lock().flush(start, end)
    }

    /// See [`WindowCache::reset_sequence`].
    pub fn reset_sequence(&self, sequence_id: i32) {
        self.inner.lock().reset_sequence(sequence_id)
    }

    /// See [`WindowCache::stats`].
    pub fn stats(&self) -> WindowStats {
        self.inner.lock().stats()
    }

    /// Recover the unsynchronized cache.
    pub fn into_inner(self) -> WindowCache<S> {
        self.inner.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::VecStream;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn concurrent_queries_see_every_record() {
        let records: Vec<Record> = (0..400).map(|i| Record::new(0, i * 5, 8)).collect();
        let cache = Arc::new(
            SyncWindowCache::new(VecStream::new(records), 0, WindowConfig::default()).unwrap(),
        );

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    let mut total = 0;
                    for chunk in 0..50 {
                        let start = (t * 500) + chunk * 10;
                        total += cache.records_overlap(start, start + 10).unwrap().len();
                    }
                    total
                })
            })
            .collect();
        let totals: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        // Every chunk overlaps three records except the first, which has no left neighbour.
        assert_eq!(totals, vec![149, 150, 150, 150]);
        assert_eq!(cache.stats().stored, 400);
    }

    #[test]
    fn flushing_thread_evicts_behind_concurrent_queries() {
        let records: Vec<Record> = (0..200).map(|i| Record::new(0, i * 10, 6)).collect();
        let cache = Arc::new(
            SyncWindowCache::new(
                VecStream::new(records),
                0,
                WindowConfig::default().with_initial_capacity(64),
            )
            .unwrap(),
        );

        let flusher = {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                for step in 0..10 {
                    let end = (step + 1) * 100;
                    cache.advance(end).unwrap();
                    cache.flush(step * 100, end).unwrap();
                }
            })
        };
        let queries: Vec<_> = (0..2)
            .map(|t| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    let mut total = 0;
                    for chunk in 0..50 {
                        let start = 1000 + t * 500 + chunk * 10;
                        let hits = cache.records_overlap(start, start + 10).unwrap();
                        assert!(hits.iter().all(|r| r.start == start));
                        total += hits.len();
                    }
                    total
                })
            })
            .collect();

        flusher.join().unwrap();
        let totals: Vec<usize> = queries.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(totals, vec![50, 50]);

        let stats = cache.stats();
        assert_eq!(stats.evicted, 100);
        assert_eq!(stats.stored, 100);
    }
}
