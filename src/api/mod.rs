//! Purpose: Define the public Rust API boundary for the checkpoint recorder.
//! Exports: Manager, writer, options, sinks, thread model, and chunk reader types.
//! Role: Additive-only surface for the CLI and embedders.
//! Invariants: Arena and list internals of memory spaces stay private to `core`.

pub use crate::core::buffer::{Buffer, BufferId, BufferKind, Owner, TraceId};
pub use crate::core::entry::{CheckpointEntry, ENTRY_HEADER_LEN};
pub use crate::core::epoch::Epoch;
#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::manager::{CheckpointManager, RECORDER_THREAD};
pub use crate::core::mspace::SpaceCounts;
pub use crate::core::notify::WaitOutcome;
pub use crate::core::options::{RecorderOptions, SpaceOptions};
pub use crate::core::reader::{ChunkSummary, ConstantTable, EntryIter, EntryView, TypeCount};
pub use crate::core::relation::{
    FIRST_USER_TYPE, RelationWriter, TYPE_CLASS, TYPE_STACK_FRAME, TYPE_SYMBOL, TYPE_THREAD,
    TYPE_THREAD_GROUP, TYPE_THREAD_STATE, TypeId, ValueReader, ValueWriter,
};
pub use crate::core::serializer::{FnSerializer, Serializer};
pub use crate::core::sink::{ChunkFile, ChunkSink, MappedChunk, MemorySink};
pub use crate::core::stats::StatsSnapshot;
pub use crate::core::thread::{Host, LocalHost, ThreadInfo, ThreadRecord};
pub use crate::core::typeset::ClassId;
pub use crate::core::writer::{CheckpointWriter, ThreadBlob};
