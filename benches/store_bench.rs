use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use sitecap::store::{CrawlStore, QueueEntry, WorkerId};

fn bench_enqueue(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("enqueue");

    for count in [1_000usize, 10_000] {
        group.bench_with_input(BenchmarkId::new("add_to_queue", count), &count, |b, &count| {
            b.iter(|| {
                rt.block_on(async {
                    let store =
                        CrawlStore::in_memory("bench", 1, Duration::from_secs(60), None);
                    for i in 0..count {
                        let entry = QueueEntry::new(
                            format!("https://bench.local/page/{}", i),
                            0,
                            (i % 4) as u32,
                            0,
                        );
                        black_box(store.add_to_queue(entry).await.unwrap());
                    }
                })
            });
        });
    }
    group.finish();
}

fn bench_claim_and_finish(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("claim_finish");

    for count in [1_000usize, 10_000] {
        group.bench_with_input(BenchmarkId::new("drain", count), &count, |b, &count| {
            b.iter(|| {
                rt.block_on(async {
                    let store =
                        CrawlStore::in_memory("bench", 1, Duration::from_secs(60), None);
                    for i in 0..count {
                        let entry = QueueEntry::new(
                            format!("https://bench.local/page/{}", i),
                            0,
                            (i % 4) as u32,
                            0,
                        );
                        store.add_to_queue(entry).await.unwrap();
                    }
                    let worker = WorkerId::new("bench-host", 0);
                    while let Some(entry) = store.next_from_queue(&worker).await.unwrap() {
                        black_box(store.mark_finished(&worker, &entry.url).await.unwrap());
                    }
                })
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_enqueue, bench_claim_and_finish);
criterion_main!(benches);
