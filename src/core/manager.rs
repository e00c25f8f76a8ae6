//! Purpose: Own the checkpoint memory spaces and run the lease, drain, and rotation protocol.
//! Exports: `CheckpointManager`, `RECORDER_THREAD`.
//! Role: Coordinator between writers, the epoch controller, pending type sets, and the chunk sink.
//! Invariants: A drain pass emits only committed bytes of the retiring generation.
//! Invariants: The epoch flips only after every retiring buffer has been detached for draining.
//! Invariants: Sink I/O runs outside the quiescence barrier; writers never wait on it.
//! Invariants: An epoch violation aborts the recorder; later drains and shifts fail fast.
//! Notes: Callers must not invoke drain or rotation operations while holding a `CheckpointWriter`.
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use crate::core::buffer::{Buffer, BufferKind, Owner, TraceId};
use crate::core::entry::ENTRY_HEADER_LEN;
use crate::core::epoch::{Epoch, EpochController, Quiescence};
use crate::core::error::{Error, ErrorKind, poisoned};
use crate::core::mspace::{Acquired, MemorySpace, SpaceCounts};
use crate::core::notify::{EpochNotifier, WaitOutcome};
use crate::core::options::RecorderOptions;
use crate::core::relation::{RelationWriter, SEGMENT_HEADER_LEN, TypeId};
use crate::core::serializer::{Serializer, ThreadStateSerializer, VirtualThreadGroupSerializer};
use crate::core::sink::ChunkSink;
use crate::core::stats::{Stats, StatsSnapshot};
use crate::core::thread::{
    Host, ThreadInfo, identity_relations, simplified_vthread_relation, thread_table_relations,
};
use crate::core::typeset::{ClassId, TypeSetRegistry};
use crate::core::writer::{CheckpointWriter, ThreadBlob};

/// Trace id used for checkpoints the recorder writes on its own behalf.
pub const RECORDER_THREAD: TraceId = 0;

/// Bound buffers with less room than this are handed to the full list on release.
const KEEP_BOUND_MIN_FREE: usize = ENTRY_HEADER_LEN + SEGMENT_HEADER_LEN;

pub struct CheckpointManager {
    options: RecorderOptions,
    global: MemorySpace,
    thread_local: MemorySpace,
    virtual_thread_local: MemorySpace,
    epoch: EpochController,
    type_set: TypeSetRegistry,
    serializers: RwLock<Vec<Arc<dyn Serializer>>>,
    host: Arc<dyn Host>,
    sink: Mutex<Option<Box<dyn ChunkSink>>>,
    notifier: EpochNotifier,
    stats: Stats,
    aborted: AtomicBool,
    rotation: Mutex<()>,
}

impl CheckpointManager {
    pub fn create(options: RecorderOptions, host: Arc<dyn Host>) -> Result<Self, Error> {
        options.validate()?;
        let manager = Self {
            global: MemorySpace::new(BufferKind::Global, options.global),
            thread_local: MemorySpace::new(BufferKind::ThreadLocal, options.thread_local),
            virtual_thread_local: MemorySpace::new(
                BufferKind::VirtualThreadLocal,
                options.virtual_thread_local,
            ),
            options,
            epoch: EpochController::new(),
            type_set: TypeSetRegistry::new(),
            serializers: RwLock::new(Vec::new()),
            host,
            sink: Mutex::new(None),
            notifier: EpochNotifier::new(),
            stats: Stats::default(),
            aborted: AtomicBool::new(false),
            rotation: Mutex::new(()),
        };
        let preallocated = options.global.prealloc_count
            + options.thread_local.prealloc_count
            + options.virtual_thread_local.prealloc_count;
        Stats::add(&manager.stats.buffers_allocated, preallocated);
        manager.register_serializer(Arc::new(ThreadStateSerializer))?;
        manager.register_serializer(Arc::new(VirtualThreadGroupSerializer))?;
        tracing::debug!(preallocated, "checkpoint manager created");
        Ok(manager)
    }

    /// Installs the chunk sink drain passes write to.
    pub fn initialize(&self, sink: Box<dyn ChunkSink>) -> Result<(), Error> {
        let mut slot = self.sink()?;
        if slot.is_some() {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("checkpoint manager is already initialized")
                .with_hint("use replace_sink to switch chunks"));
        }
        *slot = Some(sink);
        Ok(())
    }

    /// Swaps in the next chunk, returning the previous one flushed.
    pub fn replace_sink(
        &self,
        sink: Box<dyn ChunkSink>,
    ) -> Result<Option<Box<dyn ChunkSink>>, Error> {
        let _rotation = self.rotation()?;
        let mut slot = self.sink()?;
        if let Some(current) = slot.as_mut() {
            current.flush()?;
        }
        Ok(slot.replace(sink))
    }

    /// Discards everything still buffered and hands back the sink.
    pub fn destroy(self) -> Result<Option<Box<dyn ChunkSink>>, Error> {
        let discarded = self.clear()?;
        let mut sink = self.sink.into_inner().map_err(|_| poisoned("chunk sink"))?;
        if let Some(sink) = sink.as_mut() {
            sink.flush()?;
        }
        tracing::debug!(discarded, "checkpoint manager destroyed");
        Ok(sink)
    }

    pub fn options(&self) -> &RecorderOptions {
        &self.options
    }

    pub fn epoch(&self) -> &EpochController {
        &self.epoch
    }

    pub fn current_epoch(&self) -> Epoch {
        self.epoch.current()
    }

    pub fn type_set(&self) -> &TypeSetRegistry {
        &self.type_set
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn space_counts(&self, kind: BufferKind) -> Result<SpaceCounts, Error> {
        self.space(kind).counts()
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Starts a checkpoint for `thread` in the current generation.
    ///
    /// This is the public way into the buffer protocol: the writer pins the
    /// epoch for its whole lifetime, so its buffers are either still leased or
    /// already visible to the next drain pass.
    pub fn writer(&self, thread: TraceId, kind: BufferKind) -> CheckpointWriter<'_> {
        CheckpointWriter::begin(self, thread, kind, false)
    }

    fn space(&self, kind: BufferKind) -> &MemorySpace {
        match kind {
            BufferKind::Global => &self.global,
            BufferKind::ThreadLocal => &self.thread_local,
            BufferKind::VirtualThreadLocal => &self.virtual_thread_local,
        }
    }

    fn spaces(&self) -> [&MemorySpace; 3] {
        [&self.global, &self.thread_local, &self.virtual_thread_local]
    }

    fn sink(&self) -> Result<MutexGuard<'_, Option<Box<dyn ChunkSink>>>, Error> {
        self.sink.lock().map_err(|_| poisoned("chunk sink"))
    }

    fn rotation(&self) -> Result<MutexGuard<'_, ()>, Error> {
        self.rotation.lock().map_err(|_| poisoned("rotation"))
    }

    fn ensure_live(&self) -> Result<(), Error> {
        if self.is_aborted() {
            return Err(Error::new(ErrorKind::EpochViolation)
                .with_message("checkpoint recorder was aborted"));
        }
        Ok(())
    }

    fn abort(&self, err: Error) -> Error {
        self.aborted.store(true, Ordering::SeqCst);
        tracing::error!(error = %err, "checkpoint recorder aborted");
        err
    }

    pub(crate) fn count_written(&self) {
        Stats::bump(&self.stats.checkpoints_written);
    }

    pub(crate) fn count_dropped(&self, thread: TraceId, kind: BufferKind, err: &Error) {
        Stats::bump(&self.stats.checkpoints_dropped);
        tracing::warn!(thread, kind = kind.as_str(), error = %err, "checkpoint dropped");
    }

    // ---- buffer protocol ----

    fn lease_epoch(&self, previous_epoch: bool) -> Result<Epoch, Error> {
        if !previous_epoch {
            return Ok(self.epoch.current());
        }
        self.epoch.draining().ok_or_else(|| {
            Error::new(ErrorKind::Usage).with_message("previous-epoch lease outside a drain pass")
        })
    }

    fn lease(
        &self,
        kind: BufferKind,
        size: usize,
        epoch: Epoch,
        thread: TraceId,
    ) -> Result<Buffer, Error> {
        let owner = match kind {
            BufferKind::Global => Owner::Global,
            _ => Owner::Thread(thread),
        };
        let (buffer, acquired) = self.space(kind).acquire(size, epoch, owner)?;
        match acquired {
            Acquired::Reused => Stats::bump(&self.stats.buffers_reused),
            Acquired::Allocated { evicted } => {
                Stats::bump(&self.stats.buffers_allocated);
                if evicted {
                    Stats::bump(&self.stats.buffers_deallocated);
                }
            }
        }
        tracing::trace!(
            kind = kind.as_str(),
            buffer = %buffer.id(),
            size,
            epoch = epoch.value(),
            "leased checkpoint buffer"
        );
        Ok(buffer)
    }

    /// Empty buffers go back to the free list; anything committed goes to the full list.
    fn hand_off(&self, buffer: Buffer) -> Result<(), Error> {
        let space = self.space(buffer.kind());
        if buffer.is_empty() {
            let deallocated = space.reclaim([buffer])?;
            Stats::add(&self.stats.buffers_deallocated, deallocated);
            Ok(())
        } else {
            space.register_full(buffer)
        }
    }

    /// Leases a buffer with at least `size` free bytes.
    ///
    /// Carrier threads get their bound buffer back when it is tagged with the
    /// requested generation and still has room. `previous_epoch` tags the
    /// buffer with the generation being drained and is only legal during a
    /// drain pass.
    pub(crate) fn acquire(
        &self,
        thread: TraceId,
        kind: BufferKind,
        previous_epoch: bool,
        size: usize,
    ) -> Result<Buffer, Error> {
        let epoch = self.lease_epoch(previous_epoch)?;
        if kind == BufferKind::ThreadLocal {
            let binding = self.thread_local.binding(thread)?;
            let bound = binding
                .lock()
                .map_err(|_| poisoned("thread binding"))?
                .take();
            if let Some(buffer) = bound {
                if buffer.epoch() == epoch && buffer.free_size() >= size {
                    return Ok(buffer);
                }
                self.hand_off(buffer)?;
            }
        }
        self.lease(kind, size, epoch, thread)
    }

    /// Replaces `old` with a larger buffer and carries its pending bytes over.
    pub(crate) fn renew(
        &self,
        mut old: Buffer,
        thread: TraceId,
        size: usize,
        kind: BufferKind,
    ) -> Result<Buffer, Error> {
        let space = self.space(kind);
        let needed = size + old.pending_len();
        let request = needed
            .max(space.options().buffer_size)
            .saturating_mul(self.options.growth_factor)
            .min(space.options().max_buffer_size)
            .max(needed);
        let mut fresh = match self.lease(kind, request, old.epoch(), thread) {
            Ok(fresh) => fresh,
            Err(err) => {
                old.rewind();
                self.hand_off(old)?;
                return Err(err);
            }
        };
        let carried = old.pending_len();
        if !fresh.carry_pending(&mut old) {
            self.hand_off(old)?;
            self.hand_off(fresh)?;
            return Err(Error::new(ErrorKind::Internal)
                .with_message("renewed buffer cannot hold pending bytes"));
        }
        self.hand_off(old)?;
        Stats::bump(&self.stats.renewals);
        tracing::debug!(
            thread,
            kind = kind.as_str(),
            carried,
            capacity = fresh.capacity(),
            "renewed checkpoint buffer"
        );
        Ok(fresh)
    }

    /// Commits `used` pending bytes of `old`, retires it, and leases a fresh
    /// buffer of at least `requested` bytes in the same generation.
    pub(crate) fn flush(
        &self,
        mut old: Buffer,
        used: usize,
        requested: usize,
        thread: TraceId,
    ) -> Result<Buffer, Error> {
        old.commit(used);
        let kind = old.kind();
        let epoch = old.epoch();
        self.register_full(old, thread)?;
        Stats::bump(&self.stats.flushes);
        self.lease(kind, requested, epoch, thread)
    }

    /// Makes a leased buffer visible to the next drain pass.
    pub(crate) fn register_full(&self, buffer: Buffer, thread: TraceId) -> Result<(), Error> {
        tracing::trace!(
            thread,
            buffer = %buffer.id(),
            used = buffer.used(),
            "registered full checkpoint buffer"
        );
        self.space(buffer.kind()).register_full(buffer)
    }

    /// Returns a leased buffer after its writer finished; pending bytes are discarded.
    pub(crate) fn release(&self, mut buffer: Buffer, thread: TraceId) -> Result<(), Error> {
        buffer.rewind();
        let keep_bound = buffer.kind() == BufferKind::ThreadLocal
            && buffer.epoch() == self.epoch.current()
            && buffer.free_size() >= KEEP_BOUND_MIN_FREE;
        if !keep_bound {
            return self.hand_off(buffer);
        }
        let binding = self.thread_local.binding(thread)?;
        let displaced = binding
            .lock()
            .map_err(|_| poisoned("thread binding"))?
            .replace(buffer);
        match displaced {
            Some(displaced) => self.hand_off(displaced),
            None => Ok(()),
        }
    }

    /// Unbinds an exiting carrier thread; its committed bytes stay drainable.
    pub fn release_thread(&self, thread: TraceId) -> Result<(), Error> {
        // Pinned so a concurrent drain either sees the bound buffer or its full-list entry.
        let _pin = self.epoch.pin();
        let Some(binding) = self.thread_local.unbind(thread)? else {
            return Ok(());
        };
        let bound = binding
            .lock()
            .map_err(|_| poisoned("thread binding"))?
            .take();
        match bound {
            Some(buffer) => self.hand_off(buffer),
            None => Ok(()),
        }
    }

    // ---- drain and rotation ----

    fn take_bound(&self, epoch: Option<Epoch>) -> Result<Vec<Buffer>, Error> {
        let mut taken = Vec::new();
        for (_, binding) in self.thread_local.bindings()? {
            let mut slot = binding.lock().map_err(|_| poisoned("thread binding"))?;
            let matches = slot
                .as_ref()
                .is_some_and(|buffer| epoch.is_none_or(|epoch| buffer.epoch() == epoch));
            if matches {
                taken.extend(slot.take());
            }
        }
        Ok(taken)
    }

    /// Takes every buffer tagged `epoch` out of the spaces. Runs under a quiescence barrier.
    fn detach(&self, epoch: Epoch) -> Result<Detached, Error> {
        let global = self.global.take_full(epoch)?;
        let mut carrier = self.thread_local.take_full(epoch)?;
        carrier.extend(self.take_bound(Some(epoch))?);
        let virtual_thread = self.virtual_thread_local.take_full(epoch)?;
        Ok(Detached {
            epoch,
            spaces: [global, carrier, virtual_thread],
        })
    }

    fn ensure_sink(&self) -> Result<(), Error> {
        if self.sink()?.is_none() {
            return Err(no_sink());
        }
        Ok(())
    }

    /// Appends detached buffers to the sink in space order, then reclaims them.
    ///
    /// Runs after the barrier is released; writers proceed while this does I/O.
    /// The rotation lock keeps emissions in drain order.
    fn emit(&self, detached: Detached) -> Result<usize, Error> {
        let Detached { epoch, spaces } = detached;
        let mut guard = self.sink()?;
        let mut sink = guard.as_deref_mut();
        let mut written = 0;
        let mut failure = None;
        for (space, buffers) in self.spaces().into_iter().zip(spaces) {
            for buffer in &buffers {
                if failure.is_some() || buffer.is_empty() {
                    continue;
                }
                let result = match sink.as_deref_mut() {
                    Some(sink) => sink.append(buffer.committed_bytes()),
                    None => Err(no_sink()),
                };
                match result {
                    Ok(()) => written += buffer.used(),
                    Err(err) => failure = Some(err),
                }
            }
            let deallocated = space.reclaim(buffers)?;
            Stats::add(&self.stats.buffers_deallocated, deallocated);
        }
        if failure.is_none() {
            if let Some(sink) = sink {
                if let Err(err) = sink.flush() {
                    failure = Some(err);
                }
            }
        }
        Stats::add(&self.stats.bytes_written, written);
        if let Some(err) = failure {
            return Err(err);
        }
        if written > 0 {
            tracing::debug!(epoch = epoch.value(), bytes = written, "drained checkpoint buffers");
        }
        Ok(written)
    }

    /// Drains the current generation to the sink without flipping the epoch.
    pub fn write(&self) -> Result<usize, Error> {
        self.ensure_live()?;
        let _rotation = self.rotation()?;
        self.ensure_sink()?;
        let detached = {
            let quiescence = self.epoch.quiesce();
            self.detach(quiescence.retiring())?
        };
        self.emit(detached)
    }

    /// Discards every buffered checkpoint in both generations.
    pub fn clear(&self) -> Result<usize, Error> {
        let _rotation = self.rotation()?;
        let mut taken = Vec::with_capacity(3);
        {
            let _quiescence = self.epoch.quiesce();
            for space in self.spaces() {
                let mut buffers = space.take_all_full()?;
                if space.kind() == BufferKind::ThreadLocal {
                    buffers.extend(self.take_bound(None)?);
                }
                taken.push((space, buffers));
            }
        }
        let mut discarded = 0;
        for (space, buffers) in taken {
            discarded += buffers.iter().map(Buffer::used).sum::<usize>();
            let deallocated = space.reclaim(buffers)?;
            Stats::add(&self.stats.buffers_deallocated, deallocated);
        }
        Stats::add(&self.stats.bytes_discarded, discarded);
        if discarded > 0 {
            tracing::debug!(bytes = discarded, "discarded checkpoint buffers");
        }
        Ok(discarded)
    }

    /// Flips the epoch. Fails, aborting the recorder, if the retiring
    /// generation still holds undrained bytes.
    pub fn shift_epoch(&self) -> Result<Epoch, Error> {
        self.ensure_live()?;
        let _rotation = self.rotation()?;
        let mut quiescence = self.epoch.quiesce();
        self.shift_locked(&mut quiescence)
    }

    fn shift_locked(&self, quiescence: &mut Quiescence<'_>) -> Result<Epoch, Error> {
        let retiring = quiescence.retiring();
        let mut undrained = 0;
        for space in self.spaces() {
            undrained += space.undrained(retiring)?;
        }
        for (_, binding) in self.thread_local.bindings()? {
            let slot = binding.lock().map_err(|_| poisoned("thread binding"))?;
            if slot
                .as_ref()
                .is_some_and(|buffer| buffer.epoch() == retiring && !buffer.is_empty())
            {
                undrained += 1;
            }
        }
        if undrained > 0 {
            let err = Error::new(ErrorKind::EpochViolation).with_message(format!(
                "{undrained} buffers of epoch {} were not drained before the shift",
                retiring.value()
            ));
            return Err(self.abort(err));
        }
        let next = quiescence.flip();
        tracing::debug!(from = retiring.value(), to = next.value(), "shifted checkpoint epoch");
        Ok(next)
    }

    /// Chunk rotation: statics and threads, pending type set, detach, shift, emit, notify.
    ///
    /// Only detaching and the flip happen under the barrier; the retiring
    /// generation reaches the sink after writers have resumed in the new one.
    pub fn on_rotation(&self) -> Result<usize, Error> {
        self.ensure_live()?;
        let _rotation = self.rotation()?;
        self.ensure_sink()?;
        self.write_static_type_set_and_threads()?;
        let detached = {
            let mut quiescence = self.epoch.quiesce();
            let retiring = quiescence.retiring();
            self.write_type_set_in_drain()?;
            let detached = self.detach(retiring)?;
            self.shift_locked(&mut quiescence)?;
            detached
        };
        Stats::bump(&self.stats.rotations);
        let seq = self.notify_threads();
        let drained = self.emit(detached)?;
        tracing::info!(
            bytes = drained,
            epoch = self.epoch.current().value(),
            seq,
            "rotated checkpoint chunk"
        );
        Ok(drained)
    }

    /// Tells epoch-caching threads that a shift happened. Returns the notification sequence.
    pub fn notify_threads(&self) -> u64 {
        let epoch = self.epoch.current();
        let seq = self.notifier.post(epoch);
        tracing::trace!(epoch = epoch.value(), seq, "notified threads of epoch shift");
        seq
    }

    pub fn notification_seq(&self) -> u64 {
        self.notifier.seq()
    }

    pub fn wait_for_epoch_shift(&self, seen: u64, timeout: Duration) -> WaitOutcome {
        self.notifier.wait_after(seen, timeout)
    }

    // ---- type sets ----

    fn write_relations(
        &self,
        thread: TraceId,
        kind: BufferKind,
        previous_epoch: bool,
        relations: Vec<RelationWriter>,
    ) -> Result<usize, Error> {
        let relations: Vec<_> = relations
            .into_iter()
            .filter(|relation| !relation.is_empty())
            .collect();
        if relations.is_empty() {
            return Ok(0);
        }
        let mut writer = CheckpointWriter::begin(self, thread, kind, previous_epoch);
        for relation in relations {
            writer.write_relation(relation)?;
        }
        writer.end()
    }

    pub fn register_serializer(&self, serializer: Arc<dyn Serializer>) -> Result<(), Error> {
        self.serializers
            .write()
            .map_err(|_| poisoned("serializer table"))?
            .push(serializer);
        Ok(())
    }

    /// Queues one constant for the next type-set emission.
    pub fn register_constant(
        &self,
        type_id: TypeId,
        key: u64,
        value: impl Into<Vec<u8>>,
        referent: Option<ClassId>,
    ) -> Result<(), Error> {
        self.type_set.register(type_id, key, value, referent)
    }

    pub fn write_static_type_set(&self, thread: TraceId) -> Result<usize, Error> {
        let serializers = self
            .serializers
            .read()
            .map_err(|_| poisoned("serializer table"))?
            .clone();
        let relations = serializers
            .iter()
            .map(|serializer| {
                let mut relation = RelationWriter::new(serializer.type_id());
                serializer.serialize(&mut relation);
                relation
            })
            .collect();
        self.write_relations(thread, BufferKind::Global, false, relations)
    }

    pub fn write_threads(&self, thread: TraceId) -> Result<usize, Error> {
        let threads = self.host.live_threads();
        self.write_relations(thread, BufferKind::Global, false, thread_table_relations(&threads))
    }

    pub fn write_static_type_set_and_threads(&self) -> Result<usize, Error> {
        let statics = self.write_static_type_set(RECORDER_THREAD)?;
        let threads = self.write_threads(RECORDER_THREAD)?;
        Ok(statics + threads)
    }

    /// Emits and drains the pending type set in the current generation.
    pub fn write_type_set(&self) -> Result<usize, Error> {
        let relations = self.type_set.take()?;
        self.write_relations(RECORDER_THREAD, BufferKind::Global, false, relations)
    }

    fn write_type_set_in_drain(&self) -> Result<usize, Error> {
        let relations = self.type_set.take()?;
        self.write_relations(RECORDER_THREAD, BufferKind::Global, true, relations)
    }

    pub fn clear_type_set(&self) -> Result<usize, Error> {
        self.type_set.clear()
    }

    /// Emits the pending type set without clearing it, then drains.
    /// Returns the bytes that reached the sink.
    pub fn flush_type_set(&self) -> Result<usize, Error> {
        let relations = self.type_set.snapshot()?;
        self.write_relations(RECORDER_THREAD, BufferKind::Global, false, relations)?;
        self.write()
    }

    /// Drops pending type-set entries that refer to classes being unloaded.
    pub fn on_unloading_classes(&self) -> Result<usize, Error> {
        let unloading: HashSet<ClassId> = self.host.unloading_classes().into_iter().collect();
        let purged = self.type_set.purge(&unloading)?;
        Stats::add(&self.stats.type_entries_purged, purged);
        if purged > 0 {
            tracing::debug!(purged, classes = unloading.len(), "purged unloading type-set entries");
        }
        Ok(purged)
    }

    // ---- thread checkpoints ----

    /// Encodes a thread identity as a standalone entry. With `vthread`, the
    /// virtual thread is described and `thread` is recorded as its carrier.
    pub fn create_thread_blob(
        thread: &ThreadInfo,
        tid: Option<TraceId>,
        vthread: Option<&ThreadInfo>,
    ) -> ThreadBlob {
        ThreadBlob::from_relations(thread_identity(thread, tid, vthread))
    }

    pub fn write_checkpoint(
        &self,
        thread: &ThreadInfo,
        tid: Option<TraceId>,
        vthread: Option<&ThreadInfo>,
    ) -> Result<usize, Error> {
        let (kind, owner) = match vthread {
            Some(vthread) => (BufferKind::VirtualThreadLocal, vthread.id),
            None => (BufferKind::ThreadLocal, thread.id),
        };
        self.write_relations(owner, kind, false, thread_identity(thread, tid, vthread))
    }

    pub fn write_simplified_vthread_checkpoint(&self, vtid: TraceId) -> Result<usize, Error> {
        self.write_relations(
            vtid,
            BufferKind::VirtualThreadLocal,
            false,
            vec![simplified_vthread_relation(vtid)],
        )
    }
}

fn thread_identity(
    thread: &ThreadInfo,
    tid: Option<TraceId>,
    vthread: Option<&ThreadInfo>,
) -> Vec<RelationWriter> {
    match vthread {
        Some(vthread) => identity_relations(vthread, tid.unwrap_or(vthread.id), Some(thread.id)),
        None => identity_relations(thread, tid.unwrap_or(thread.id), None),
    }
}

/// Buffers of one generation taken out of the spaces, in global, carrier, virtual order.
struct Detached {
    epoch: Epoch,
    spaces: [Vec<Buffer>; 3],
}

fn no_sink() -> Error {
    Error::new(ErrorKind::Usage)
        .with_message("checkpoint manager has no chunk sink")
        .with_hint("call initialize before draining")
}

#[cfg(test)]
mod tests {
    use super::CheckpointManager;
    use crate::core::buffer::BufferKind;
    use crate::core::error::ErrorKind;
    use crate::core::options::{RecorderOptions, SpaceOptions};
    use crate::core::relation::{RelationWriter, TYPE_SYMBOL};
    use crate::core::sink::MemorySink;
    use crate::core::thread::LocalHost;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    fn small_options() -> RecorderOptions {
        let space = SpaceOptions {
            buffer_size: 64,
            max_buffer_size: 4096,
            cache_count: 4,
            prealloc_count: 0,
            limit: 64,
        };
        RecorderOptions {
            global: space,
            thread_local: space,
            virtual_thread_local: space,
            growth_factor: 2,
        }
    }

    fn manager() -> (CheckpointManager, MemorySink) {
        let manager = CheckpointManager::create(small_options(), Arc::new(LocalHost::new()))
            .expect("create");
        let sink = MemorySink::new();
        manager.initialize(Box::new(sink.clone())).expect("initialize");
        (manager, sink)
    }

    #[test]
    fn previous_epoch_lease_requires_a_drain() {
        let (manager, _) = manager();
        let err = manager
            .acquire(1, BufferKind::Global, true, 16)
            .expect_err("outside drain");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn initialize_twice_is_rejected() {
        let (manager, _) = manager();
        let err = manager
            .initialize(Box::new(MemorySink::new()))
            .expect_err("second sink");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn drain_without_sink_is_usage_error() {
        let manager = CheckpointManager::create(small_options(), Arc::new(LocalHost::new()))
            .expect("create");
        assert_eq!(manager.write().expect_err("no sink").kind(), ErrorKind::Usage);
    }

    #[test]
    fn carrier_buffer_stays_bound_between_checkpoints() {
        let (manager, _) = manager();
        let buffer = manager
            .acquire(7, BufferKind::ThreadLocal, false, 16)
            .expect("acquire");
        let id = buffer.id();
        manager.release(buffer, 7).expect("release");
        let again = manager
            .acquire(7, BufferKind::ThreadLocal, false, 16)
            .expect("acquire");
        assert_eq!(again.id(), id);
        manager.release(again, 7).expect("release");

        manager.release_thread(7).expect("release thread");
        let counts = manager
            .space_counts(BufferKind::ThreadLocal)
            .expect("counts");
        assert_eq!(counts.bound_threads, 0);
        assert_eq!(counts.free, 1);
    }

    #[test]
    fn written_bytes_match_drained_bytes() {
        let (manager, sink) = manager();
        let mut writer = manager.writer(3, BufferKind::ThreadLocal);
        let mut relation = RelationWriter::new(TYPE_SYMBOL);
        relation.add(1, &[7u8; 100]);
        writer.write_relation(relation).expect("write");
        let written = writer.end().expect("end");

        assert_eq!(manager.stats().renewals, 1);
        assert_eq!(manager.write().expect("drain"), written);
        assert_eq!(sink.bytes().len(), written);
        assert_eq!(manager.write().expect("drain again"), 0);
    }

    #[test]
    fn open_writer_holds_off_a_drain() {
        let (manager, sink) = manager();
        let drained = AtomicBool::new(false);
        thread::scope(|scope| {
            let mut writer = manager.writer(4, BufferKind::ThreadLocal);
            let mut relation = RelationWriter::new(TYPE_SYMBOL);
            relation.add(1, b"pending");
            writer.write_relation(relation).expect("write");

            let drain = scope.spawn(|| {
                let written = manager.write().expect("drain");
                drained.store(true, Ordering::SeqCst);
                written
            });
            thread::sleep(Duration::from_millis(50));
            assert!(!drained.load(Ordering::SeqCst));

            let written = writer.end().expect("end");
            assert_eq!(drain.join().expect("join"), written);
        });
        assert!(!sink.bytes().is_empty());
    }

    #[test]
    fn destroy_discards_and_returns_sink() {
        let (manager, sink) = manager();
        manager
            .write_static_type_set(super::RECORDER_THREAD)
            .expect("statics");
        let returned = manager.destroy().expect("destroy");
        assert!(returned.is_some());
        assert!(sink.bytes().is_empty());
    }
}
