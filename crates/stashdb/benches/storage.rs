use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use stashdb::FileStore;
use tempfile::TempDir;

fn bench_set(c: &mut Criterion) {
    let mut group = c.benchmark_group("set");
    group.sample_size(50);
    group.throughput(Throughput::Elements(1));

    group.bench_function("set_1kb", |b| {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let value = "x".repeat(1024);

        let mut counter = 0u64;
        b.iter(|| {
            black_box(store.set(&format!("key{}", counter % 100), &value).unwrap());
            counter += 1;
        });
    });
    group.finish();
}

fn bench_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("get");
    group.sample_size(50);
    group.throughput(Throughput::Elements(1));

    group.bench_function("get_1kb", |b| {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let value = "x".repeat(1024);

        for i in 0..100 {
            store.set(&format!("key{}", i), &value).unwrap();
        }

        b.iter(|| {
            black_box(store.get("key50").unwrap());
        });
    });
    group.finish();
}

fn bench_reopen(c: &mut Criterion) {
    let mut group = c.benchmark_group("reopen");
    group.sample_size(20);

    group.bench_function("replay_1000_records", |b| {
        let dir = TempDir::new().unwrap();
        {
            let store = FileStore::open(dir.path()).unwrap();
            let value = "x".repeat(256);
            for i in 0..1000 {
                store.set(&format!("key{}", i % 200), &value).unwrap();
            }
        }

        b.iter(|| {
            black_box(FileStore::open(dir.path()).unwrap().len());
        });
    });
    group.finish();
}

criterion_group!(benches, bench_set, bench_get, bench_reopen);
criterion_main!(benches);
