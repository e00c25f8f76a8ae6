//! Purpose: Pool checkpoint buffers for one ownership kind with free/full list bookkeeping.
//! Exports: `MemorySpace`, `SpaceCounts`, `Binding`.
//! Role: Backing store for the global, carrier-thread, and virtual-thread spaces of the manager.
//! Invariants: Every live buffer owns one arena slot whose state names where it is held.
//! Invariants: Free/full lists and the arena change together inside one short critical section.
//! Invariants: Live buffers never exceed `SpaceOptions::limit`; reuse is preferred over allocation.
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::core::buffer::{Buffer, BufferId, BufferKind, Owner, TraceId};
use crate::core::epoch::Epoch;
use crate::core::error::{Error, ErrorKind, poisoned};
use crate::core::options::SpaceOptions;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum SlotState {
    Vacant,
    Free,
    /// Held outside the lists: by a writer, a thread binding, or a drain pass.
    Leased,
    Full,
}

#[derive(Debug, Default)]
struct Arena {
    generations: Vec<u32>,
    states: Vec<SlotState>,
    vacant: Vec<u32>,
    live: usize,
}

impl Arena {
    fn insert(&mut self) -> BufferId {
        self.live += 1;
        if let Some(index) = self.vacant.pop() {
            self.states[index as usize] = SlotState::Leased;
            return BufferId {
                index,
                generation: self.generations[index as usize],
            };
        }
        let index = self.states.len() as u32;
        self.states.push(SlotState::Leased);
        self.generations.push(0);
        BufferId {
            index,
            generation: 0,
        }
    }

    fn state(&self, id: BufferId) -> Option<SlotState> {
        let index = id.index as usize;
        if self.generations.get(index) != Some(&id.generation) {
            return None;
        }
        self.states.get(index).copied()
    }

    fn transition(&mut self, id: BufferId, from: SlotState, to: SlotState) -> Result<(), Error> {
        match self.state(id) {
            Some(state) if state == from => {
                self.states[id.index as usize] = to;
                Ok(())
            }
            Some(state) => Err(Error::new(ErrorKind::Internal).with_message(format!(
                "buffer {id} is {state:?}, expected {from:?}"
            ))),
            None => Err(Error::new(ErrorKind::Internal)
                .with_message(format!("stale buffer id {id}"))),
        }
    }

    fn remove(&mut self, id: BufferId, from: SlotState) -> Result<(), Error> {
        self.transition(id, from, SlotState::Vacant)?;
        let index = id.index as usize;
        self.generations[index] = self.generations[index].wrapping_add(1);
        self.vacant.push(id.index);
        self.live -= 1;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Lists {
    arena: Arena,
    free: Vec<Buffer>,
    full: VecDeque<Buffer>,
}

/// Per-thread-identity slot holding at most one bound buffer.
pub type Binding = Mutex<Option<Buffer>>;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SpaceCounts {
    pub live: usize,
    pub free: usize,
    pub full: usize,
    pub bound_threads: usize,
}

/// Outcome of an acquisition, reported so the caller can keep counters.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Acquired {
    Reused,
    Allocated { evicted: bool },
}

#[derive(Debug)]
pub struct MemorySpace {
    kind: BufferKind,
    options: SpaceOptions,
    lists: Mutex<Lists>,
    bindings: Mutex<HashMap<TraceId, Arc<Binding>>>,
}

impl MemorySpace {
    pub fn new(kind: BufferKind, options: SpaceOptions) -> Self {
        let mut lists = Lists::default();
        for _ in 0..options.prealloc_count {
            let id = lists.arena.insert();
            let buffer = Buffer::allocate(id, options.buffer_size, kind);
            lists.arena.states[id.index as usize] = SlotState::Free;
            lists.free.push(buffer);
        }
        Self {
            kind,
            options,
            lists: Mutex::new(lists),
            bindings: Mutex::new(HashMap::new()),
        }
    }

    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    pub fn options(&self) -> &SpaceOptions {
        &self.options
    }

    fn lists(&self) -> Result<MutexGuard<'_, Lists>, Error> {
        self.lists.lock().map_err(|_| poisoned("memory space"))
    }

    /// Returns a buffer with at least `size` free bytes, tagged `epoch`.
    pub fn acquire(
        &self,
        size: usize,
        epoch: Epoch,
        owner: Owner,
    ) -> Result<(Buffer, Acquired), Error> {
        if size > self.options.max_buffer_size {
            return Err(Error::new(ErrorKind::Exhausted).with_message(format!(
                "{} request of {size} bytes exceeds max buffer size",
                self.kind.as_str()
            )));
        }
        let (id, evicted) = {
            let mut lists = self.lists()?;
            if let Some(index) = lists.free.iter().position(|buf| buf.capacity() >= size) {
                let mut buffer = lists.free.swap_remove(index);
                lists
                    .arena
                    .transition(buffer.id(), SlotState::Free, SlotState::Leased)?;
                drop(lists);
                buffer.reinitialize(epoch, owner);
                return Ok((buffer, Acquired::Reused));
            }
            let mut evicted = false;
            if lists.arena.live >= self.options.limit {
                let smallest = lists
                    .free
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, buf)| buf.capacity())
                    .map(|(index, _)| index);
                let Some(index) = smallest else {
                    return Err(Error::new(ErrorKind::Exhausted).with_message(format!(
                        "{} space reached its limit of {} buffers",
                        self.kind.as_str(),
                        self.options.limit
                    )));
                };
                let victim = lists.free.swap_remove(index);
                lists.arena.remove(victim.id(), SlotState::Free)?;
                tracing::debug!(
                    kind = self.kind.as_str(),
                    capacity = victim.capacity(),
                    requested = size,
                    "evicted free checkpoint buffer"
                );
                evicted = true;
            }
            (lists.arena.insert(), evicted)
        };
        let capacity = size.max(self.options.buffer_size);
        let mut buffer = Buffer::allocate(id, capacity, self.kind);
        buffer.reinitialize(epoch, owner);
        Ok((buffer, Acquired::Allocated { evicted }))
    }

    /// Moves a leased buffer onto the full list, making it visible to drain passes.
    pub fn register_full(&self, mut buffer: Buffer) -> Result<(), Error> {
        buffer.rewind();
        buffer.set_retired();
        let mut lists = self.lists()?;
        lists
            .arena
            .transition(buffer.id(), SlotState::Leased, SlotState::Full)?;
        lists.full.push_back(buffer);
        Ok(())
    }

    /// Returns leased buffers to the free list, keeping at most `cache_count`.
    /// Reports how many were deallocated instead.
    pub fn reclaim(&self, buffers: impl IntoIterator<Item = Buffer>) -> Result<usize, Error> {
        let mut deallocated = 0;
        let mut lists = self.lists()?;
        for mut buffer in buffers {
            if lists.free.len() < self.options.cache_count {
                lists
                    .arena
                    .transition(buffer.id(), SlotState::Leased, SlotState::Free)?;
                buffer.reinitialize(buffer.epoch(), Owner::Global);
                lists.free.push(buffer);
            } else {
                lists.arena.remove(buffer.id(), SlotState::Leased)?;
                deallocated += 1;
            }
        }
        Ok(deallocated)
    }

    /// Detaches every full buffer tagged `epoch`, in list order.
    pub fn take_full(&self, epoch: Epoch) -> Result<Vec<Buffer>, Error> {
        self.take_full_matching(|buffer| buffer.epoch() == epoch)
    }

    pub fn take_all_full(&self) -> Result<Vec<Buffer>, Error> {
        self.take_full_matching(|_| true)
    }

    fn take_full_matching(&self, pred: impl Fn(&Buffer) -> bool) -> Result<Vec<Buffer>, Error> {
        let mut lists = self.lists()?;
        let mut taken = Vec::new();
        let mut kept = VecDeque::with_capacity(lists.full.len());
        while let Some(buffer) = lists.full.pop_front() {
            if pred(&buffer) {
                taken.push(buffer);
            } else {
                kept.push_back(buffer);
            }
        }
        lists.full = kept;
        for buffer in &taken {
            lists
                .arena
                .transition(buffer.id(), SlotState::Full, SlotState::Leased)?;
        }
        Ok(taken)
    }

    /// Full-list buffers tagged `epoch` that still hold committed bytes.
    pub fn undrained(&self, epoch: Epoch) -> Result<usize, Error> {
        let lists = self.lists()?;
        Ok(lists
            .full
            .iter()
            .filter(|buffer| buffer.epoch() == epoch && !buffer.is_empty())
            .count())
    }

    pub fn binding(&self, thread: TraceId) -> Result<Arc<Binding>, Error> {
        let mut bindings = self.bindings.lock().map_err(|_| poisoned("binding table"))?;
        Ok(Arc::clone(
            bindings
                .entry(thread)
                .or_insert_with(|| Arc::new(Mutex::new(None))),
        ))
    }

    pub fn unbind(&self, thread: TraceId) -> Result<Option<Arc<Binding>>, Error> {
        let mut bindings = self.bindings.lock().map_err(|_| poisoned("binding table"))?;
        Ok(bindings.remove(&thread))
    }

    pub fn bindings(&self) -> Result<Vec<(TraceId, Arc<Binding>)>, Error> {
        let bindings = self.bindings.lock().map_err(|_| poisoned("binding table"))?;
        let mut out: Vec<_> = bindings
            .iter()
            .map(|(thread, binding)| (*thread, Arc::clone(binding)))
            .collect();
        out.sort_by_key(|(thread, _)| *thread);
        Ok(out)
    }

    pub fn counts(&self) -> Result<SpaceCounts, Error> {
        let bound_threads = self
            .bindings
            .lock()
            .map_err(|_| poisoned("binding table"))?
            .len();
        let lists = self.lists()?;
        Ok(SpaceCounts {
            live: lists.arena.live,
            free: lists.free.len(),
            full: lists.full.len(),
            bound_threads,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{Acquired, Arena, MemorySpace, SlotState};
    use crate::core::buffer::{BufferKind, Owner};
    use crate::core::epoch::Epoch;
    use crate::core::error::ErrorKind;
    use crate::core::options::SpaceOptions;

    fn options(limit: usize, cache_count: usize) -> SpaceOptions {
        SpaceOptions {
            buffer_size: 64,
            max_buffer_size: 4096,
            cache_count,
            prealloc_count: 0,
            limit,
        }
    }

    #[test]
    fn free_buffers_are_reused_before_allocating() {
        let space = MemorySpace::new(BufferKind::Global, options(4, 4));
        let (buffer, how) = space.acquire(32, Epoch::ZERO, Owner::Global).expect("acquire");
        assert_eq!(how, Acquired::Allocated { evicted: false });
        assert_eq!(buffer.capacity(), 64);
        let id = buffer.id();
        space.reclaim([buffer]).expect("reclaim");

        let (buffer, how) = space.acquire(48, Epoch::ONE, Owner::Thread(3)).expect("again");
        assert_eq!(how, Acquired::Reused);
        assert_eq!(buffer.id(), id);
        assert_eq!(buffer.epoch(), Epoch::ONE);
        assert_eq!(buffer.owner(), Owner::Thread(3));
    }

    #[test]
    fn too_small_free_buffers_are_skipped() {
        let space = MemorySpace::new(BufferKind::Global, options(4, 4));
        let (small, _) = space.acquire(8, Epoch::ZERO, Owner::Global).expect("small");
        space.reclaim([small]).expect("reclaim");
        let (big, how) = space.acquire(200, Epoch::ZERO, Owner::Global).expect("big");
        assert_eq!(how, Acquired::Allocated { evicted: false });
        assert_eq!(big.capacity(), 200);
        assert_eq!(space.counts().expect("counts").live, 2);
    }

    #[test]
    fn limit_evicts_free_buffers_then_fails() {
        let space = MemorySpace::new(BufferKind::ThreadLocal, options(1, 1));
        let (buffer, _) = space.acquire(8, Epoch::ZERO, Owner::Global).expect("first");
        let err = space.acquire(8, Epoch::ZERO, Owner::Global).expect_err("exhausted");
        assert_eq!(err.kind(), ErrorKind::Exhausted);

        space.reclaim([buffer]).expect("reclaim");
        let (_, how) = space.acquire(500, Epoch::ZERO, Owner::Global).expect("evict");
        assert_eq!(how, Acquired::Allocated { evicted: true });
        assert_eq!(space.counts().expect("counts").live, 1);
    }

    #[test]
    fn oversized_request_is_exhausted() {
        let space = MemorySpace::new(BufferKind::Global, options(4, 4));
        let err = space
            .acquire(4097, Epoch::ZERO, Owner::Global)
            .expect_err("too big");
        assert_eq!(err.kind(), ErrorKind::Exhausted);
    }

    #[test]
    fn full_list_is_partitioned_by_epoch() {
        let space = MemorySpace::new(BufferKind::Global, options(8, 8));
        for epoch in [Epoch::ZERO, Epoch::ONE, Epoch::ZERO] {
            let (mut buffer, _) = space.acquire(8, epoch, Owner::Global).expect("acquire");
            buffer.append(b"data");
            buffer.commit_all();
            space.register_full(buffer).expect("full");
        }
        assert_eq!(space.undrained(Epoch::ZERO).expect("undrained"), 2);

        let drained = space.take_full(Epoch::ZERO).expect("take");
        assert_eq!(drained.len(), 2);
        assert!(drained.iter().all(|buffer| buffer.retired()));
        assert_eq!(space.undrained(Epoch::ZERO).expect("undrained"), 0);
        assert_eq!(space.counts().expect("counts").full, 1);
        space.reclaim(drained).expect("reclaim");
        assert_eq!(space.counts().expect("counts").free, 2);
    }

    #[test]
    fn reclaim_deallocates_beyond_cache_count() {
        let space = MemorySpace::new(BufferKind::VirtualThreadLocal, options(8, 1));
        let (a, _) = space.acquire(8, Epoch::ZERO, Owner::Thread(1)).expect("a");
        let (b, _) = space.acquire(8, Epoch::ZERO, Owner::Thread(2)).expect("b");
        let deallocated = space.reclaim([a, b]).expect("reclaim");
        assert_eq!(deallocated, 1);
        let counts = space.counts().expect("counts");
        assert_eq!(counts.live, 1);
        assert_eq!(counts.free, 1);
    }

    #[test]
    fn stale_slot_ids_are_rejected() {
        let mut arena = Arena::default();
        let id = arena.insert();
        arena.remove(id, SlotState::Leased).expect("remove");
        let err = arena
            .transition(id, SlotState::Leased, SlotState::Full)
            .expect_err("stale");
        assert_eq!(err.kind(), ErrorKind::Internal);

        let reused = arena.insert();
        assert_eq!(reused.index, id.index);
        assert_ne!(reused.generation, id.generation);
        let err = arena
            .transition(reused, SlotState::Full, SlotState::Free)
            .expect_err("wrong state");
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert_eq!(arena.live, 1);
    }

    #[test]
    fn prealloc_fills_the_free_list() {
        let mut opts = options(4, 4);
        opts.prealloc_count = 3;
        let space = MemorySpace::new(BufferKind::ThreadLocal, opts);
        let counts = space.counts().expect("counts");
        assert_eq!(counts.live, 3);
        assert_eq!(counts.free, 3);
    }

    #[test]
    fn bindings_are_created_once_per_thread() {
        let space = MemorySpace::new(BufferKind::ThreadLocal, options(4, 4));
        let first = space.binding(11).expect("binding");
        let second = space.binding(11).expect("binding");
        assert!(std::sync::Arc::ptr_eq(&first, &second));
        space.binding(5).expect("binding");
        let threads: Vec<_> = space
            .bindings()
            .expect("bindings")
            .into_iter()
            .map(|(thread, _)| thread)
            .collect();
        assert_eq!(threads, vec![5, 11]);
        assert!(space.unbind(11).expect("unbind").is_some());
        assert_eq!(space.counts().expect("counts").bound_threads, 1);
    }
}
