// Append-only checkpoint buffer with a committed cursor, epoch tag, and owner.
use std::fmt;

use crate::core::epoch::Epoch;

pub type TraceId = u64;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum BufferKind {
    ThreadLocal,
    VirtualThreadLocal,
    Global,
}

impl BufferKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BufferKind::ThreadLocal => "thread_local",
            BufferKind::VirtualThreadLocal => "virtual_thread_local",
            BufferKind::Global => "global",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Owner {
    Global,
    Thread(TraceId),
}

/// Stable arena slot of a buffer; the generation changes when the slot is reused.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct BufferId {
    pub index: u32,
    pub generation: u32,
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.index, self.generation)
    }
}

/// Bytes in `[0, committed)` are complete entries visible to a drain pass.
/// Bytes in `[committed, pos)` belong to the entry being written.
pub struct Buffer {
    id: BufferId,
    data: Box<[u8]>,
    committed: usize,
    pos: usize,
    epoch: Epoch,
    owner: Owner,
    kind: BufferKind,
    retired: bool,
}

impl Buffer {
    pub(crate) fn allocate(id: BufferId, capacity: usize, kind: BufferKind) -> Self {
        Self {
            id,
            data: vec![0u8; capacity].into_boxed_slice(),
            committed: 0,
            pos: 0,
            epoch: Epoch::ZERO,
            owner: Owner::Global,
            kind,
            retired: false,
        }
    }

    /// Recycles the buffer for a new lease; the epoch tag changes only here.
    pub(crate) fn reinitialize(&mut self, epoch: Epoch, owner: Owner) {
        self.committed = 0;
        self.pos = 0;
        self.epoch = epoch;
        self.owner = owner;
        self.retired = false;
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Committed bytes.
    pub fn used(&self) -> usize {
        self.committed
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn pending_len(&self) -> usize {
        self.pos - self.committed
    }

    pub fn free_size(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.committed == 0
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn owner(&self) -> Owner {
        self.owner
    }

    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    pub fn retired(&self) -> bool {
        self.retired
    }

    pub(crate) fn set_retired(&mut self) {
        self.retired = true;
    }

    pub fn committed_bytes(&self) -> &[u8] {
        &self.data[..self.committed]
    }

    pub fn pending_bytes(&self) -> &[u8] {
        &self.data[self.committed..self.pos]
    }

    /// Appends at the write position. Returns false when the bytes do not fit.
    pub fn append(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() > self.free_size() {
            return false;
        }
        let end = self.pos + bytes.len();
        self.data[self.pos..end].copy_from_slice(bytes);
        self.pos = end;
        true
    }

    /// Overwrites already-written pending bytes, e.g. a reserved header.
    pub(crate) fn patch(&mut self, offset: usize, bytes: &[u8]) {
        debug_assert!(offset >= self.committed && offset + bytes.len() <= self.pos);
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Publishes `len` pending bytes.
    pub(crate) fn commit(&mut self, len: usize) {
        debug_assert!(len <= self.pending_len());
        self.committed += len.min(self.pending_len());
    }

    pub(crate) fn commit_all(&mut self) {
        self.committed = self.pos;
    }

    /// Discards pending bytes.
    pub(crate) fn rewind(&mut self) {
        self.pos = self.committed;
    }

    /// Moves the pending bytes of `other` to the end of this buffer.
    pub(crate) fn carry_pending(&mut self, other: &mut Buffer) -> bool {
        if !self.append(other.pending_bytes()) {
            return false;
        }
        other.rewind();
        true
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.id)
            .field("capacity", &self.capacity())
            .field("committed", &self.committed)
            .field("pos", &self.pos)
            .field("epoch", &self.epoch)
            .field("owner", &self.owner)
            .field("kind", &self.kind)
            .field("retired", &self.retired)
            .finish()
    }
}
