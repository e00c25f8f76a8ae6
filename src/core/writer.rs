//! Purpose: Write one logical checkpoint into leased buffers, growing or flushing on overflow.
//! Exports: `CheckpointWriter`, `ThreadBlob`, `encode_entry`, `ticks`.
//! Role: The only producer of entry headers.
//! Role: Drives the manager's acquire/renew/flush/release protocol under an epoch pin.
//! Invariants: An entry is committed whole; pending bytes never reach a drain pass.
//! Invariants: Overflow before the first segment renews (grows).
//! Invariants: Later overflow commits the entry as a flushpoint and continues in a fresh buffer.
//! Invariants: Allocation failure drops the checkpoint silently; the writer never blocks the host.
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::core::buffer::{Buffer, BufferKind, TraceId};
use crate::core::entry::{CheckpointEntry, ENTRY_HEADER_LEN};
use crate::core::epoch::EpochPin;
use crate::core::error::{Error, ErrorKind};
use crate::core::manager::CheckpointManager;
use crate::core::relation::RelationWriter;

/// Nanoseconds since the Unix epoch; zero if the clock is before it.
pub fn ticks() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as u64)
        .unwrap_or(0)
}

/// Frames already-encoded segments as one complete, standalone entry.
pub fn encode_entry(segments: &[Vec<u8>], start_time: u64, duration: u64) -> Vec<u8> {
    let payload_len: usize = segments.iter().map(Vec::len).sum();
    let header = CheckpointEntry::new(
        payload_len,
        start_time,
        duration,
        false,
        segments.len() as u32,
    );
    let mut out = Vec::with_capacity(ENTRY_HEADER_LEN + payload_len);
    out.extend_from_slice(&header.encode());
    for segment in segments {
        out.extend_from_slice(segment);
    }
    out
}

/// Self-contained checkpoint bytes describing one thread identity.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ThreadBlob(Arc<[u8]>);

impl ThreadBlob {
    pub(crate) fn from_relations(relations: Vec<RelationWriter>) -> Self {
        let start = ticks();
        let segments: Vec<Vec<u8>> = relations.into_iter().map(RelationWriter::finish).collect();
        let bytes = encode_entry(&segments, start, ticks().saturating_sub(start));
        Self(bytes.into())
    }

    pub fn bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

pub struct CheckpointWriter<'a> {
    manager: &'a CheckpointManager,
    thread: TraceId,
    kind: BufferKind,
    buffer: Option<Buffer>,
    entry_start: usize,
    segments: u32,
    pieces: u32,
    start_time: u64,
    written: usize,
    dropped: bool,
    _pin: Option<EpochPin<'a>>,
}

impl<'a> CheckpointWriter<'a> {
    pub(crate) fn begin(
        manager: &'a CheckpointManager,
        thread: TraceId,
        kind: BufferKind,
        previous_epoch: bool,
    ) -> Self {
        // Drain-pass writers run under the barrier and must not pin.
        let pin = (!previous_epoch).then(|| manager.epoch().pin());
        let mut writer = Self {
            manager,
            thread,
            kind,
            buffer: None,
            entry_start: 0,
            segments: 0,
            pieces: 1,
            start_time: ticks(),
            written: 0,
            dropped: false,
            _pin: pin,
        };
        if manager.is_aborted() {
            writer.dropped = true;
            return writer;
        }
        match manager.acquire(thread, kind, previous_epoch, ENTRY_HEADER_LEN) {
            Ok(buffer) => {
                writer.buffer = Some(buffer);
                writer.open_entry();
            }
            Err(err) => writer.drop_checkpoint(&err),
        }
        writer
    }

    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    /// Physical entries used so far; grows by one per flush.
    pub fn pieces(&self) -> u32 {
        self.pieces
    }

    pub fn is_dropped(&self) -> bool {
        self.dropped
    }

    fn open_entry(&mut self) {
        if let Some(buffer) = self.buffer.as_mut() {
            self.entry_start = buffer.pos();
            self.segments = 0;
            // The manager always hands out room for a header.
            let reserved = buffer.append(&[0u8; ENTRY_HEADER_LEN]);
            debug_assert!(reserved);
        }
    }

    fn patch_header(&mut self, flushpoint: bool) -> usize {
        let Some(buffer) = self.buffer.as_mut() else {
            return 0;
        };
        let size = buffer.pos() - self.entry_start;
        let header = CheckpointEntry::new(
            size - ENTRY_HEADER_LEN,
            self.start_time,
            ticks().saturating_sub(self.start_time),
            flushpoint,
            self.segments,
        );
        buffer.patch(self.entry_start, &header.encode());
        size
    }

    pub fn write_relation(&mut self, relation: RelationWriter) -> Result<(), Error> {
        self.write_segment(&relation.finish())
    }

    /// Appends one self-describing segment to the current entry.
    pub fn write_segment(&mut self, segment: &[u8]) -> Result<(), Error> {
        if self.dropped {
            return Ok(());
        }
        let Some(buffer) = self.buffer.take() else {
            return Ok(());
        };
        let buffer = if buffer.free_size() >= segment.len() {
            buffer
        } else if self.segments == 0 {
            match self
                .manager
                .renew(buffer, self.thread, segment.len(), self.kind)
            {
                Ok(renewed) => {
                    self.entry_start = renewed.used();
                    renewed
                }
                Err(err) => return self.fail(err),
            }
        } else {
            self.buffer = Some(buffer);
            let used = self.patch_header(true);
            let Some(old) = self.buffer.take() else {
                return Ok(());
            };
            match self
                .manager
                .flush(old, used, ENTRY_HEADER_LEN + segment.len(), self.thread)
            {
                Ok(fresh) => {
                    self.written += used;
                    self.pieces += 1;
                    self.buffer = Some(fresh);
                    self.open_entry();
                    match self.buffer.take() {
                        Some(fresh) => fresh,
                        None => return Ok(()),
                    }
                }
                Err(err) => return self.fail(err),
            }
        };
        let mut buffer = buffer;
        let appended = buffer.append(segment);
        self.buffer = Some(buffer);
        if !appended {
            return self.fail(
                Error::new(ErrorKind::Internal)
                    .with_message("segment does not fit a buffer sized for it"),
            );
        }
        self.segments += 1;
        Ok(())
    }

    /// Commits the final entry and returns the bytes this checkpoint committed.
    pub fn end(mut self) -> Result<usize, Error> {
        if self.dropped {
            return Ok(0);
        }
        if self.segments == 0 {
            return self.release().map(|_| self.written);
        }
        let size = self.patch_header(false);
        if let Some(buffer) = self.buffer.as_mut() {
            buffer.commit_all();
        }
        self.written += size;
        self.manager.count_written();
        self.release()?;
        Ok(self.written)
    }

    fn release(&mut self) -> Result<(), Error> {
        match self.buffer.take() {
            Some(buffer) => self.manager.release(buffer, self.thread),
            None => Ok(()),
        }
    }

    fn fail(&mut self, err: Error) -> Result<(), Error> {
        if err.is_exhausted() {
            self.drop_checkpoint(&err);
            return Ok(());
        }
        self.dropped = true;
        let _ = self.release();
        Err(err)
    }

    fn drop_checkpoint(&mut self, err: &Error) {
        self.dropped = true;
        self.manager.count_dropped(self.thread, self.kind, err);
        if let Err(release_err) = self.release() {
            tracing::warn!(error = %release_err, "failed to release buffer of dropped checkpoint");
        }
    }
}

impl Drop for CheckpointWriter<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            tracing::warn!(error = %err, "failed to release checkpoint buffer");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ThreadBlob, encode_entry};
    use crate::core::entry::{CheckpointEntry, ENTRY_HEADER_LEN};
    use crate::core::relation::{RelationWriter, TYPE_SYMBOL};

    #[test]
    fn encoded_entry_size_matches_header() {
        let mut relation = RelationWriter::new(TYPE_SYMBOL);
        relation.add(1, b"abc");
        let segment = relation.finish();
        let bytes = encode_entry(&[segment.clone(), segment.clone()], 5, 1);
        let header = CheckpointEntry::decode(&bytes).expect("header");
        assert_eq!(header.size as usize, bytes.len());
        assert_eq!(header.size as usize, ENTRY_HEADER_LEN + 2 * segment.len());
        assert_eq!(header.segment_count, 2);
        assert!(!header.flushpoint);
    }

    #[test]
    fn blob_is_a_complete_entry() {
        let mut relation = RelationWriter::new(TYPE_SYMBOL);
        relation.add(7, b"name");
        let blob = ThreadBlob::from_relations(vec![relation]);
        let header = CheckpointEntry::decode(blob.bytes()).expect("header");
        assert_eq!(header.size as usize, blob.len());
        assert_eq!(header.segment_count, 1);
    }
}
