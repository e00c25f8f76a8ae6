// Concurrent writers racing drain passes and chunk rotations.
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

use ckpool::api::{
    BufferKind, CheckpointManager, ChunkSummary, ConstantTable, LocalHost, MemorySink,
    RecorderOptions, RelationWriter, SpaceOptions, TYPE_STACK_FRAME, TYPE_SYMBOL,
};

const WRITERS: u64 = 8;
const CHECKPOINTS: u64 = 400;

fn options() -> RecorderOptions {
    let space = SpaceOptions {
        buffer_size: 256,
        max_buffer_size: 1 << 20,
        cache_count: 16,
        prealloc_count: 2,
        limit: 8192,
    };
    RecorderOptions {
        global: space,
        thread_local: space,
        virtual_thread_local: space,
        growth_factor: 2,
    }
}

fn recorder() -> (Arc<CheckpointManager>, MemorySink) {
    let manager =
        CheckpointManager::create(options(), Arc::new(LocalHost::new())).expect("create");
    let sink = MemorySink::new();
    manager.initialize(Box::new(sink.clone())).expect("initialize");
    (Arc::new(manager), sink)
}

/// Writes one checkpoint whose stack-frame payload varies in size so that
/// some checkpoints renew and some flush.
fn write_one(manager: &CheckpointManager, thread: u64, seq: u64) -> usize {
    let key = thread * 1_000_000 + seq;
    let mut writer = manager.writer(thread, BufferKind::ThreadLocal);
    let mut frames = RelationWriter::new(TYPE_STACK_FRAME);
    frames.add(key, &vec![thread as u8; ((seq * 37) % 300) as usize]);
    writer.write_relation(frames).expect("frames");
    let mut symbols = RelationWriter::new(TYPE_SYMBOL);
    symbols.add(key, format!("sym-{key}").as_bytes());
    writer.write_relation(symbols).expect("symbols");
    writer.end().expect("end")
}

fn spawn_writers(
    manager: &Arc<CheckpointManager>,
    written: &Arc<AtomicUsize>,
) -> Vec<thread::JoinHandle<()>> {
    (1..=WRITERS)
        .map(|thread| {
            let manager = Arc::clone(manager);
            let written = Arc::clone(written);
            thread::spawn(move || {
                for seq in 0..CHECKPOINTS {
                    written.fetch_add(write_one(&manager, thread, seq), Ordering::SeqCst);
                }
                manager.release_thread(thread).expect("release thread");
            })
        })
        .collect()
}

#[test]
fn drained_bytes_equal_committed_bytes_under_concurrent_drains() {
    let (manager, sink) = recorder();
    let written = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicBool::new(false));

    let drainer = {
        let manager = Arc::clone(&manager);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut drained = 0;
            while !done.load(Ordering::SeqCst) {
                drained += manager.write().expect("drain");
                thread::yield_now();
            }
            drained
        })
    };
    for handle in spawn_writers(&manager, &written) {
        handle.join().expect("writer");
    }
    done.store(true, Ordering::SeqCst);
    let drained = drainer.join().expect("drainer") + manager.write().expect("final drain");

    assert_eq!(drained, written.load(Ordering::SeqCst));
    assert_eq!(sink.bytes().len(), drained);
    assert_eq!(manager.stats().checkpoints_dropped, 0);

    let summary = ChunkSummary::scan(&sink.bytes()).expect("scan");
    assert_eq!(summary.checkpoints, WRITERS * CHECKPOINTS);
    assert_eq!(
        summary.types[&TYPE_SYMBOL].constants,
        WRITERS * CHECKPOINTS
    );
}

#[test]
fn rotations_never_lose_or_split_checkpoints() {
    let (manager, sink) = recorder();
    let written = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicBool::new(false));

    let rotator = {
        let manager = Arc::clone(&manager);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut rotations = 0u64;
            while !done.load(Ordering::SeqCst) {
                manager.on_rotation().expect("rotate");
                rotations += 1;
                thread::yield_now();
            }
            rotations
        })
    };
    for handle in spawn_writers(&manager, &written) {
        handle.join().expect("writer");
    }
    done.store(true, Ordering::SeqCst);
    let rotations = rotator.join().expect("rotator");
    manager.on_rotation().expect("final rotation");

    assert!(!manager.is_aborted());
    assert_eq!(manager.epoch().shifts(), rotations + 1);

    let bytes = sink.bytes();
    let summary = ChunkSummary::scan(&bytes).expect("scan");
    assert_eq!(
        summary.types[&TYPE_SYMBOL].constants,
        WRITERS * CHECKPOINTS
    );
    let table = ConstantTable::from_chunk(&bytes).expect("table");
    assert_eq!(table.of_type(TYPE_SYMBOL).count() as u64, WRITERS * CHECKPOINTS);
    assert_eq!(
        table.of_type(TYPE_STACK_FRAME).count() as u64,
        WRITERS * CHECKPOINTS
    );
}
