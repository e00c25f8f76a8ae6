// Synthetic recording workload for ckpool.
//
// Purpose:
// - Drive the checkpoint manager the way a tracing runtime would: concurrent carrier
//   threads, virtual threads mounted on them, pending type sets, class unloading, and
//   chunk rotations into `DIR/chunk-NNNN.ckp`.
// - Emit a machine-readable JSON summary to stdout.
//
// Design notes:
// - Uses scoped std threads; every worker releases its binding before it exits.
// - Payload sizes are chosen by the caller so buffer renewal and flushing can be exercised.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use serde_json::{Value, json};

use ckpool::api::{
    BufferKind, CheckpointManager, ChunkFile, Error, ErrorKind, FIRST_USER_TYPE, LocalHost,
    RecorderOptions, RelationWriter, TYPE_CLASS, TYPE_STACK_FRAME, TYPE_SYMBOL, ThreadInfo,
    TraceId, ValueWriter,
};

const WORKER_GROUP_ID: u64 = 10;
const FIRST_CARRIER_ID: TraceId = 1;
const FIRST_VIRTUAL_ID: TraceId = 1_000_000;

#[derive(Clone, Debug)]
pub struct RecordArgs {
    pub out: PathBuf,
    pub config: Option<PathBuf>,
    pub threads: usize,
    pub virtual_threads: usize,
    pub checkpoints_per_thread: u64,
    pub payload_bytes: usize,
    pub chunks: usize,
    pub thread_buffer_size: Option<usize>,
}

impl RecordArgs {
    fn validate(&self) -> Result<(), Error> {
        if self.threads == 0 {
            return Err(Error::new(ErrorKind::Usage).with_message("--threads must be positive"));
        }
        if self.chunks == 0 {
            return Err(Error::new(ErrorKind::Usage).with_message("--chunks must be positive"));
        }
        Ok(())
    }

    fn options(&self) -> Result<RecorderOptions, Error> {
        let mut options = match &self.config {
            Some(path) => RecorderOptions::from_json_file(path)?,
            None => RecorderOptions::default(),
        };
        if let Some(size) = self.thread_buffer_size {
            options.thread_local.buffer_size = size;
            options.virtual_thread_local.buffer_size = size;
        }
        options.validate()?;
        Ok(options)
    }
}

fn chunk_path(dir: &Path, index: usize) -> PathBuf {
    dir.join(format!("chunk-{index:04}.ckp"))
}

fn carrier_info(index: usize) -> ThreadInfo {
    let id = FIRST_CARRIER_ID + index as TraceId;
    ThreadInfo::carrier(id, format!("worker-{index}"), WORKER_GROUP_ID, "workers")
}

pub fn run_record(args: &RecordArgs) -> Result<Value, Error> {
    args.validate()?;
    let options = args.options()?;
    fs::create_dir_all(&args.out).map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to create output directory")
            .with_path(&args.out)
            .with_source(err)
    })?;

    let host = Arc::new(LocalHost::new());
    let carriers: Vec<ThreadInfo> = (0..args.threads).map(carrier_info).collect();
    for info in &carriers {
        host.attach(info.clone());
    }
    let manager = CheckpointManager::create(options, host.clone())?;
    manager.initialize(Box::new(ChunkFile::create(chunk_path(&args.out, 1))?))?;

    let started = Instant::now();
    let mut chunks = Vec::with_capacity(args.chunks);
    for index in 1..=args.chunks {
        register_type_set(&manager, index)?;
        run_workers(&manager, &carriers, args, index)?;

        // A few of this chunk's classes unload before it rotates.
        host.mark_unloading(unloading_classes(index));
        manager.on_unloading_classes()?;
        host.finish_unloading();

        let drained = manager.on_rotation()?;
        let path = chunk_path(&args.out, index);
        let finished = if index < args.chunks {
            let next = ChunkFile::create(chunk_path(&args.out, index + 1))?;
            manager.replace_sink(Box::new(next))?
        } else {
            None
        };
        let bytes = finished.as_ref().map(|sink| sink.committed());
        drop(finished);
        chunks.push((path, drained, bytes));
    }

    let stats = manager.stats();
    let epoch = manager.current_epoch();
    let last = manager.destroy()?;
    let last_bytes = last.as_ref().map(|sink| sink.committed());
    drop(last);

    let elapsed_ms = started.elapsed().as_millis() as u64;
    let chunks: Vec<Value> = chunks
        .into_iter()
        .map(|(path, drained, bytes)| {
            json!({
                "path": path.display().to_string(),
                "drained_bytes": drained,
                "file_bytes": bytes.or(last_bytes),
            })
        })
        .collect();
    tracing::info!(chunks = chunks.len(), elapsed_ms, "recording finished");
    Ok(json!({
        "out": args.out.display().to_string(),
        "threads": args.threads,
        "virtual_threads": args.virtual_threads,
        "epoch": epoch,
        "elapsed_ms": elapsed_ms,
        "chunks": chunks,
        "stats": stats,
    }))
}

fn class_id(chunk: usize, n: u64) -> u64 {
    ((chunk as u64) << 32) | n
}

fn register_type_set(manager: &CheckpointManager, chunk: usize) -> Result<(), Error> {
    for n in 0..8u64 {
        let class = class_id(chunk, n);
        let name = format!("com/example/Class{chunk}_{n}");
        manager.register_constant(
            TYPE_CLASS,
            class,
            ValueWriter::new().str(&name).finish(),
            Some(class),
        )?;
    }
    Ok(())
}

fn unloading_classes(chunk: usize) -> Vec<u64> {
    (0..2u64).map(|n| class_id(chunk, n)).collect()
}

fn run_workers(
    manager: &CheckpointManager,
    carriers: &[ThreadInfo],
    args: &RecordArgs,
    chunk: usize,
) -> Result<(), Error> {
    thread::scope(|scope| {
        let handles: Vec<_> = carriers
            .iter()
            .enumerate()
            .map(|(index, carrier)| {
                scope.spawn(move || run_worker(manager, carrier, index, args, chunk))
            })
            .collect();
        let mut first_err = None;
        for handle in handles {
            let result = handle.join().unwrap_or_else(|_| {
                Err(Error::new(ErrorKind::Internal).with_message("record worker panicked"))
            });
            if let Err(err) = result {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    })
}

fn run_worker(
    manager: &CheckpointManager,
    carrier: &ThreadInfo,
    index: usize,
    args: &RecordArgs,
    chunk: usize,
) -> Result<(), Error> {
    manager.write_checkpoint(carrier, None, None)?;
    let payload = vec![index as u8; args.payload_bytes];
    for seq in 0..args.checkpoints_per_thread {
        let mut writer = manager.writer(carrier.id, BufferKind::ThreadLocal);
        let mut frames = RelationWriter::new(TYPE_STACK_FRAME);
        frames.add(seq, &payload);
        writer.write_relation(frames)?;
        let mut symbols = RelationWriter::new(TYPE_SYMBOL);
        symbols.add(seq, format!("frame-{chunk}-{seq}").as_bytes());
        writer.write_relation(symbols)?;
        writer.end()?;
    }
    for n in 0..args.virtual_threads {
        let vtid = FIRST_VIRTUAL_ID + (index * args.virtual_threads + n) as TraceId;
        if n % 2 == 0 {
            let vthread = ThreadInfo::virtual_thread(vtid, format!("vthread-{vtid}"));
            manager.write_checkpoint(carrier, None, Some(&vthread))?;
        } else {
            manager.write_simplified_vthread_checkpoint(vtid)?;
        }
        let mut writer = manager.writer(vtid, BufferKind::VirtualThreadLocal);
        let mut events = RelationWriter::new(FIRST_USER_TYPE);
        events.add(vtid, &payload);
        writer.write_relation(events)?;
        writer.end()?;
    }
    manager.release_thread(carrier.id)
}
