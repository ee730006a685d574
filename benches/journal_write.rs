use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use std::hint::black_box;

use flashlog::journal::{Journal, SimpleVariableJournalFormat};
use flashlog::storage::MemStorage;

const MAGIC: u32 = u32::from_le_bytes(*b"BNCH");
const SIZE: u32 = 64 * 1024;
const SECTOR: u32 = 4096;
const RECORD_SIZE: usize = 64;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime")
}

/// Sustained appends, ring wraps included.
fn bench_write(c: &mut Criterion) {
    let rt = runtime();

    let mut group = c.benchmark_group("journal");
    group.throughput(Throughput::Bytes(RECORD_SIZE as u64));

    let store = MemStorage::new(SIZE, SECTOR);
    let format = SimpleVariableJournalFormat::new(MAGIC);
    let mut journal = Journal::new(&store, &format);
    rt.block_on(journal.scan());

    let payload = [0x5Au8; RECORD_SIZE];
    group.bench_function("write_64b", |b| {
        b.iter(|| {
            assert!(rt.block_on(journal.write(black_box(&payload))));
        });
    });
    group.finish();
}

/// Recovery scan over a fully written medium.
fn bench_scan(c: &mut Criterion) {
    let rt = runtime();

    let store = MemStorage::new(SIZE, SECTOR);
    let format = SimpleVariableJournalFormat::new(MAGIC);
    rt.block_on(async {
        let mut journal = Journal::new(&store, &format);
        journal.scan().await;
        // Wrap the ring twice so every sector carries data.
        let payload = [0xA5u8; RECORD_SIZE];
        let writes = 2 * (SIZE as usize / RECORD_SIZE);
        for _ in 0..writes {
            assert!(journal.write(&payload).await);
        }
    });

    c.bench_function("journal/scan_full", |b| {
        b.iter(|| {
            rt.block_on(async {
                let mut journal = Journal::new(&store, &format);
                journal.scan().await;
                black_box(journal.last_sector_address());
            });
        });
    });
}

criterion_group!(benches, bench_write, bench_scan);
criterion_main!(benches);
