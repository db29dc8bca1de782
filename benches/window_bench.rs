//! Window cache sweep and merge throughput benchmarks

use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rosalind_stream::source::{VecSource, VecStream};
use rosalind_stream::{
    InvalidRecord, MergeConfig, MergeCoordinator, Record, RecordStream, SequenceDictionary,
    WindowCache, WindowConfig,
};

fn records(count: i64, step: i64, length: u32) -> Vec<Record> {
    (0..count)
        .map(|i| Record::new(0, i * step, length).with_name_hash(i as u64))
        .collect()
}

fn benchmark_window_sweep(c: &mut Criterion) {
    let mut group = c.benchmark_group("window_sweep");
    for chunk in [10i64, 100, 1_000] {
        let input = records(50_000, 2, 150);
        group.bench_with_input(BenchmarkId::from_parameter(chunk), &chunk, |b, &chunk| {
            b.iter(|| {
                let mut window =
                    WindowCache::new(VecStream::new(input.clone()), 0, WindowConfig::default())
                        .unwrap();
                let mut hits = 0usize;
                let mut start = 0;
                while start < 100_000 {
                    hits += window.records_overlap(start, start + chunk).unwrap().len();
                    window.flush(start, start + chunk).unwrap();
                    start += chunk;
                }
                black_box(hits)
            });
        });
    }
    group.finish();
}

fn benchmark_merge(c: &mut Criterion) {
    let header = SequenceDictionary::new().with_sequence("chr1", 1_000_000);
    let mut group = c.benchmark_group("merge");
    group.sample_size(20);
    for threads in [1usize, 4] {
        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, &threads| {
            b.iter(|| {
                let sources: Vec<VecSource<Record>> = (0..8)
                    .map(|_| VecSource::new(header.clone(), records(10_000, 3, 100)))
                    .collect();
                let config = MergeConfig::default()
                    .with_threads(threads)
                    .with_wait_timeout(Duration::from_millis(50));
                let populate = |record: Record| Ok::<_, InvalidRecord>(record);
                let mut merge = MergeCoordinator::new(sources, populate, config).unwrap();
                let mut total = 0usize;
                while merge.next_record().unwrap().is_some() {
                    total += 1;
                }
                merge.close().unwrap();
                black_box(total)
            });
        });
    }
    group.finish();
}

criterion_group!(benches, benchmark_window_sweep, benchmark_merge);
criterion_main!(benches);
