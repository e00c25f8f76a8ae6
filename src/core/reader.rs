//! Purpose: Walk and summarize chunk bytes produced by drain passes.
//! Exports: `EntryIter`, `EntryView`, `ChunkSummary`, `TypeCount`, `ConstantTable`.
//! Role: Read side used by `inspect` and by tests asserting on emitted checkpoints.
//! Invariants: Every entry is validated against the chunk bounds before its payload is exposed.
//! Invariants: Constant lookups resolve to the last value written for a (type, key) pair.
use std::collections::BTreeMap;

use serde::Serialize;

use crate::core::entry::{CheckpointEntry, ENTRY_HEADER_LEN};
use crate::core::error::Error;
use crate::core::relation::{SegmentIter, TYPE_THREAD, TypeId};
use crate::core::thread::ThreadRecord;

#[derive(Clone, Copy, Debug)]
pub struct EntryView<'a> {
    pub offset: u64,
    pub header: CheckpointEntry,
    pub payload: &'a [u8],
}

impl<'a> EntryView<'a> {
    pub fn segments(&self) -> SegmentIter<'a> {
        SegmentIter::new(self.payload, self.header.segment_count)
    }
}

/// Iterates entries back to back; stops after the first corrupt one.
pub struct EntryIter<'a> {
    chunk: &'a [u8],
    offset: usize,
    failed: bool,
}

impl<'a> EntryIter<'a> {
    pub fn new(chunk: &'a [u8]) -> Self {
        Self {
            chunk,
            offset: 0,
            failed: false,
        }
    }
}

impl<'a> Iterator for EntryIter<'a> {
    type Item = Result<EntryView<'a>, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.chunk.len() {
            return None;
        }
        let rest = &self.chunk[self.offset..];
        let header = match CheckpointEntry::decode(rest).and_then(|header| {
            header.validate(rest.len())?;
            Ok(header)
        }) {
            Ok(header) => header,
            Err(err) => {
                self.failed = true;
                return Some(Err(err.with_offset(self.offset as u64)));
            }
        };
        let view = EntryView {
            offset: self.offset as u64,
            header,
            payload: &rest[ENTRY_HEADER_LEN..header.size as usize],
        };
        self.offset += header.size as usize;
        Some(Ok(view))
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct TypeCount {
    pub segments: u64,
    pub constants: u64,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct ChunkSummary {
    pub bytes: u64,
    pub entries: u64,
    pub flushpoints: u64,
    /// Entries that close a logical checkpoint; flushpoint entries continue one.
    pub checkpoints: u64,
    pub segments: u64,
    pub constants: u64,
    pub types: BTreeMap<TypeId, TypeCount>,
    pub first_start: Option<u64>,
    pub last_end: Option<u64>,
}

impl ChunkSummary {
    pub fn scan(chunk: &[u8]) -> Result<Self, Error> {
        let mut summary = ChunkSummary {
            bytes: chunk.len() as u64,
            ..ChunkSummary::default()
        };
        for entry in EntryIter::new(chunk) {
            let entry = entry?;
            let header = entry.header;
            summary.entries += 1;
            if header.flushpoint {
                summary.flushpoints += 1;
            } else {
                summary.checkpoints += 1;
            }
            let end = header.start_time.saturating_add(header.duration);
            summary.first_start = Some(
                summary
                    .first_start
                    .map_or(header.start_time, |first| first.min(header.start_time)),
            );
            summary.last_end = Some(summary.last_end.map_or(end, |last| last.max(end)));
            for segment in entry.segments() {
                let segment = segment.map_err(|err| rebase(err, entry.offset))?;
                let count = summary.types.entry(segment.type_id).or_default();
                count.segments += 1;
                count.constants += u64::from(segment.count);
                summary.segments += 1;
                summary.constants += u64::from(segment.count);
            }
        }
        Ok(summary)
    }
}

fn rebase(err: Error, entry_offset: u64) -> Error {
    let inner = err.offset().unwrap_or(0);
    err.with_offset(entry_offset + ENTRY_HEADER_LEN as u64 + inner)
}

/// Constants keyed by (type, key); later writes replace earlier ones.
#[derive(Clone, Debug, Default)]
pub struct ConstantTable {
    values: BTreeMap<(TypeId, u64), Vec<u8>>,
}

impl ConstantTable {
    pub fn from_chunk(chunk: &[u8]) -> Result<Self, Error> {
        let mut table = ConstantTable::default();
        for entry in EntryIter::new(chunk) {
            let entry = entry?;
            for segment in entry.segments() {
                let segment = segment.map_err(|err| rebase(err, entry.offset))?;
                for pair in segment.entries() {
                    let (key, value) = pair?;
                    table.values.insert((segment.type_id, key), value.to_vec());
                }
            }
        }
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, type_id: TypeId, key: u64) -> Option<&[u8]> {
        self.values.get(&(type_id, key)).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (TypeId, u64, &[u8])> + '_ {
        self.values
            .iter()
            .map(|((type_id, key), value)| (*type_id, *key, value.as_slice()))
    }

    pub fn of_type(&self, type_id: TypeId) -> impl Iterator<Item = (u64, &[u8])> + '_ {
        self.values
            .range((type_id, 0)..=(type_id, u64::MAX))
            .map(|((_, key), value)| (*key, value.as_slice()))
    }

    pub fn threads(&self) -> Result<Vec<ThreadRecord>, Error> {
        self.of_type(TYPE_THREAD)
            .map(|(key, value)| ThreadRecord::decode(key, value))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::{ChunkSummary, ConstantTable, EntryIter};
    use crate::core::entry::{CheckpointEntry, ENTRY_HEADER_LEN};
    use crate::core::error::ErrorKind;
    use crate::core::relation::{RelationWriter, TYPE_CLASS, TYPE_SYMBOL};
    use crate::core::writer::encode_entry;

    fn relation(type_id: u64, pairs: &[(u64, &[u8])]) -> Vec<u8> {
        let mut relation = RelationWriter::new(type_id);
        for (key, value) in pairs {
            relation.add(*key, value);
        }
        relation.finish()
    }

    #[test]
    fn summary_counts_entries_and_types() {
        let mut chunk = encode_entry(
            &[
                relation(TYPE_SYMBOL, &[(1, b"a"), (2, b"b")]),
                relation(TYPE_CLASS, &[(9, b"c")]),
            ],
            100,
            5,
        );
        let mut flushed = encode_entry(&[relation(TYPE_SYMBOL, &[(3, b"d")])], 90, 1);
        let mut header = CheckpointEntry::decode(&flushed).expect("header");
        header.flushpoint = true;
        flushed[..ENTRY_HEADER_LEN].copy_from_slice(&header.encode());
        chunk.extend_from_slice(&flushed);

        let summary = ChunkSummary::scan(&chunk).expect("scan");
        assert_eq!(summary.entries, 2);
        assert_eq!(summary.flushpoints, 1);
        assert_eq!(summary.checkpoints, 1);
        assert_eq!(summary.segments, 3);
        assert_eq!(summary.constants, 4);
        assert_eq!(summary.types[&TYPE_SYMBOL].segments, 2);
        assert_eq!(summary.first_start, Some(90));
        assert_eq!(summary.last_end, Some(105));
    }

    #[test]
    fn later_constants_replace_earlier_ones() {
        let mut chunk = encode_entry(&[relation(TYPE_SYMBOL, &[(1, b"old")])], 1, 0);
        chunk.extend(encode_entry(&[relation(TYPE_SYMBOL, &[(1, b"new"), (2, b"x")])], 2, 0));
        let table = ConstantTable::from_chunk(&chunk).expect("table");
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(TYPE_SYMBOL, 1), Some(&b"new"[..]));
        assert_eq!(table.of_type(TYPE_CLASS).count(), 0);
    }

    #[test]
    fn truncated_chunk_reports_offset() {
        let first = encode_entry(&[relation(TYPE_SYMBOL, &[(1, b"a")])], 1, 0);
        let mut chunk = first.clone();
        chunk.extend_from_slice(&first[..first.len() - 3]);
        let results: Vec<_> = EntryIter::new(&chunk).collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        let err = results[1].as_ref().expect_err("truncated");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
        assert_eq!(err.offset(), Some(first.len() as u64));
    }

    #[test]
    fn empty_chunk_has_empty_summary() {
        let summary = ChunkSummary::scan(&[]).expect("scan");
        assert_eq!(summary.entries, 0);
        assert_eq!(summary.first_start, None);
    }
}
