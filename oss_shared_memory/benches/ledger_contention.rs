//! Ledger request/release throughput, alone and under contention

use criterion::{Criterion, criterion_group, criterion_main};
use oss_common::consts::MAX_RESOURCES;
use oss_shared_memory::{Ledger, RESOURCE_TABLE_SIZE, Segment};
use std::hint::black_box;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use tempfile::NamedTempFile;

fn ledger(path: &Path) -> Ledger {
    let segment = Segment::acquire("bench ledger", path, 4, RESOURCE_TABLE_SIZE).unwrap();
    Ledger::attach(segment).unwrap()
}

/// Benchmark an uncontended request/release pair
fn bench_uncontended(c: &mut Criterion) {
    let anchor = NamedTempFile::new().unwrap();
    let segment = Segment::acquire("bench ledger", anchor.path(), 4, RESOURCE_TABLE_SIZE).unwrap();
    let ledger = Ledger::initialize(segment, [20; MAX_RESOURCES]).unwrap();
    ledger.segment().mark_for_removal().unwrap();

    c.bench_function("ledger_request_release", |b| {
        b.iter(|| {
            let grant = ledger.request(black_box(3), black_box(2), 0).unwrap();
            if grant.is_granted() {
                ledger.release(3, 2, 0).unwrap();
            }
        });
    });
}

/// Benchmark request/release while three other mappings hammer the lock
fn bench_contended(c: &mut Criterion) {
    let anchor = NamedTempFile::new().unwrap();
    let segment = Segment::acquire("bench ledger", anchor.path(), 4, RESOURCE_TABLE_SIZE).unwrap();
    let main = Ledger::initialize(segment, [20; MAX_RESOURCES]).unwrap();

    // Removal detaches the key, so every mapping attaches first.
    let mappings: Vec<_> = (1..4).map(|slot| (slot, ledger(anchor.path()))).collect();
    main.segment().mark_for_removal().unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let background: Vec<_> = mappings
        .into_iter()
        .map(|(slot, mapping)| {
            let stop = stop.clone();
            thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    if mapping.request(slot % MAX_RESOURCES, 1, slot).unwrap().is_granted() {
                        mapping.release(slot % MAX_RESOURCES, 1, slot).unwrap();
                    }
                }
            })
        })
        .collect();

    c.bench_function("ledger_request_release_contended", |b| {
        b.iter(|| {
            if main.request(black_box(1), 1, 0).unwrap().is_granted() {
                main.release(1, 1, 0).unwrap();
            }
        });
    });

    stop.store(true, Ordering::Relaxed);
    for handle in background {
        handle.join().unwrap();
    }
}

criterion_group!(benches, bench_uncontended, bench_contended);
criterion_main!(benches);
