use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use memtable::MemTable;
use sstable::SsTableReader;
use tempfile::tempdir;

const N_KEYS: usize = 10_000;
const VALUE_SIZE: usize = 100;

fn build_memtable() -> MemTable {
    let mem = MemTable::unlogged();
    for i in 0..N_KEYS {
        mem.insert(format!("key{:06}", i).as_bytes(), &vec![b'x'; VALUE_SIZE])
            .unwrap();
    }
    mem
}

fn sstable_write_benchmark(c: &mut Criterion) {
    c.bench_function("sstable_flush_10k", |b| {
        b.iter_batched(
            || {
                let dir = tempdir().unwrap();
                let path = dir.path().join("sst_0000.db");
                let mem = build_memtable();
                (dir, path, mem)
            },
            |(_dir, path, mem)| {
                mem.flush(&path).unwrap();
            },
            BatchSize::SmallInput,
        );
    });
}

fn sstable_get_hit_benchmark(c: &mut Criterion) {
    c.bench_function("sstable_get_hit_10k", |b| {
        b.iter_batched(
            || {
                let dir = tempdir().unwrap();
                let path = dir.path().join("sst_0000.db");

                build_memtable().flush(&path).unwrap();

                let reader = SsTableReader::open(&path).unwrap();
                (dir, reader)
            },
            |(_dir, reader)| {
                for i in 0..N_KEYS {
                    let key = format!("key{:06}", i);
                    let v = reader.get(key.as_bytes()).unwrap();
                    assert!(v.is_some());
                }
            },
            BatchSize::LargeInput,
        );
    });
}

fn sstable_get_miss_benchmark(c: &mut Criterion) {
    c.bench_function("sstable_get_miss_10k", |b| {
        b.iter_batched(
            || {
                let dir = tempdir().unwrap();
                let path = dir.path().join("sst_0000.db");

                build_memtable().flush(&path).unwrap();

                let reader = SsTableReader::open(&path).unwrap();
                (dir, reader)
            },
            |(_dir, reader)| {
                for i in 0..N_KEYS {
                    let key = format!("missing{:06}", i);
                    let v = reader.get(key.as_bytes()).unwrap();
                    assert!(v.is_none());
                }
            },
            BatchSize::LargeInput,
        );
    });
}

criterion_group!(
    benches,
    sstable_write_benchmark,
    sstable_get_hit_benchmark,
    sstable_get_miss_benchmark
);
criterion_main!(benches);
