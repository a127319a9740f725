//! Throughput of the three operations on the hot path of a transaction's
//! undo: opening/appending a chunk, inserting records into it, and closing
//! it out. Mirrors the teacher's `benches/perf.rs` shape (one `Criterion`
//! group per workload) but drives `UndoEngine` directly instead of a
//! network round trip, since the undo engine has no server front end of
//! its own.

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use tempfile::tempdir;
use undo_urs::engine::UndoEngine;
use undo_urs::types::{Persistence, UndoRecordSetType};
use undo_urs::xact_undo::RecordingXactUndoSink;

fn bench_insert(c: &mut Criterion) {
    c.bench_function("prepare_insert + insert (16B record)", |b| {
        b.iter_batched(
            || {
                let dir = tempdir().unwrap();
                let engine =
                    UndoEngine::open(dir.path(), Box::new(RecordingXactUndoSink::default())).unwrap();
                (dir, engine)
            },
            |(_dir, mut engine)| {
                let handle = engine.create(UndoRecordSetType::Foo, Persistence::Permanent, 0);
                let record = [0xABu8; 16];
                for _ in 0..32 {
                    let prepared = engine.prepare_insert(handle, record.len() as u64).unwrap();
                    engine.commit_insert(prepared, &record).unwrap();
                }
            },
            BatchSize::SmallInput,
        );
    });
}

fn bench_close(c: &mut Criterion) {
    c.bench_function("prepare_close + mark_closed", |b| {
        b.iter_batched(
            || {
                let dir = tempdir().unwrap();
                let mut engine =
                    UndoEngine::open(dir.path(), Box::new(RecordingXactUndoSink::default())).unwrap();
                let handle = engine.create(UndoRecordSetType::Foo, Persistence::Permanent, 0);
                let record = [0xCDu8; 16];
                let prepared = engine.prepare_insert(handle, record.len() as u64).unwrap();
                engine.commit_insert(prepared, &record).unwrap();
                (dir, engine, handle)
            },
            |(_dir, mut engine, handle)| {
                let close = engine.prepare_close(handle).unwrap().unwrap();
                engine.commit_close(close).unwrap();
            },
            BatchSize::SmallInput,
        );
    });
}

fn bench_multi_chunk_wrap(c: &mut Criterion) {
    c.bench_function("insert across 64 chunk opens", |b| {
        b.iter_batched(
            || {
                let dir = tempdir().unwrap();
                let engine =
                    UndoEngine::open(dir.path(), Box::new(RecordingXactUndoSink::default())).unwrap();
                (dir, engine)
            },
            |(_dir, mut engine)| {
                let record = [0x11u8; 8];
                for _ in 0..64 {
                    let handle = engine.create(UndoRecordSetType::Foo, Persistence::Permanent, 0);
                    let prepared = engine.prepare_insert(handle, record.len() as u64).unwrap();
                    engine.commit_insert(prepared, &record).unwrap();
                    let close = engine.prepare_close(handle).unwrap().unwrap();
                    engine.commit_close(close).unwrap();
                }
            },
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, bench_insert, bench_close, bench_multi_chunk_wrap);
criterion_main!(benches);
