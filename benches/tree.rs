//! Directory tree benchmarks: bulk insert and full in-order scans.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tempfile::tempdir;

use dsstore::{FourCC, Record, Store, Tree, Value};

fn record(i: usize) -> Record {
    Record::new(format!("file{:06}.txt", i), FourCC(*b"vSrn"), Value::Long(i as u32))
}

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("tree_insert");

    for count in [100usize, 1000].iter() {
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::new("sequential", count), count, |b, &count| {
            b.iter_with_setup(
                || {
                    let dir = tempdir().unwrap();
                    let store = Store::create(dir.path().join("bench.store")).unwrap();
                    (dir, Tree::open(store).unwrap())
                },
                |(dir, mut tree)| {
                    for i in 0..count {
                        tree.insert(record(i)).unwrap();
                    }
                    (dir, tree)
                },
            );
        });
    }
    group.finish();
}

fn bench_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("tree_scan");

    let dir = tempdir().unwrap();
    let store = Store::create(dir.path().join("bench.store")).unwrap();
    let mut tree = Tree::open(store).unwrap();
    for i in 0..1000 {
        tree.insert(record(i)).unwrap();
    }

    group.throughput(Throughput::Elements(1000));
    group.bench_function("in_order_1000", |b| {
        b.iter(|| {
            let n = tree.iter().unwrap().count();
            black_box(n)
        })
    });
    group.finish();
}

criterion_group!(benches, bench_insert, bench_scan);
criterion_main!(benches);
