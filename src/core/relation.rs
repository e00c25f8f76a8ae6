//! Purpose: Encode and decode type-relation segments (constant-type key/value sets).
//! Exports: `RelationWriter`, `Segment`, `SegmentIter`, `ValueWriter`, `ValueReader`, type ids.
//! Role: Payload codec shared by the checkpoint writer, thread blobs, and the chunk reader.
//! Invariants: A segment is self-describing (`type_id | count | body_len | body`).
//! Invariants: Segments are never split across checkpoint entries.
use crate::core::entry::{read_u32, read_u64, write_u32, write_u64};
use crate::core::error::{Error, ErrorKind};

pub const SEGMENT_HEADER_LEN: usize = 16;
const PAIR_HEADER_LEN: usize = 12;

pub type TypeId = u64;

pub const TYPE_THREAD: TypeId = 1;
pub const TYPE_THREAD_GROUP: TypeId = 2;
pub const TYPE_THREAD_STATE: TypeId = 3;
pub const TYPE_CLASS: TypeId = 4;
pub const TYPE_SYMBOL: TypeId = 5;
pub const TYPE_STACK_FRAME: TypeId = 6;
/// First id available to registered serializers and registry users.
pub const FIRST_USER_TYPE: TypeId = 64;

#[derive(Clone, Debug)]
pub struct RelationWriter {
    type_id: TypeId,
    count: u32,
    body: Vec<u8>,
}

impl RelationWriter {
    pub fn new(type_id: TypeId) -> Self {
        Self {
            type_id,
            count: 0,
            body: Vec::new(),
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn add(&mut self, key: u64, value: &[u8]) {
        self.body.extend_from_slice(&key.to_le_bytes());
        self.body
            .extend_from_slice(&(value.len() as u32).to_le_bytes());
        self.body.extend_from_slice(value);
        self.count += 1;
    }

    pub fn encoded_len(&self) -> usize {
        SEGMENT_HEADER_LEN + self.body.len()
    }

    pub fn finish(self) -> Vec<u8> {
        let mut out = vec![0u8; SEGMENT_HEADER_LEN];
        write_u64(&mut out, 0, self.type_id);
        write_u32(&mut out, 8, self.count);
        write_u32(&mut out, 12, self.body.len() as u32);
        out.extend_from_slice(&self.body);
        out
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Segment<'a> {
    pub type_id: TypeId,
    pub count: u32,
    pub body: &'a [u8],
}

impl<'a> Segment<'a> {
    pub fn entries(&self) -> PairIter<'a> {
        PairIter {
            body: self.body,
            offset: 0,
            remaining: self.count,
        }
    }
}

/// Walks `count` segments packed back to back in an entry payload.
pub struct SegmentIter<'a> {
    payload: &'a [u8],
    offset: usize,
    remaining: u32,
}

impl<'a> SegmentIter<'a> {
    pub fn new(payload: &'a [u8], count: u32) -> Self {
        Self {
            payload,
            offset: 0,
            remaining: count,
        }
    }
}

impl<'a> Iterator for SegmentIter<'a> {
    type Item = Result<Segment<'a>, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let rest = &self.payload[self.offset..];
        if rest.len() < SEGMENT_HEADER_LEN {
            self.remaining = 0;
            return Some(Err(corrupt("segment header truncated", self.offset)));
        }
        let body_len = read_u32(rest, 12) as usize;
        let end = SEGMENT_HEADER_LEN + body_len;
        if end > rest.len() {
            self.remaining = 0;
            return Some(Err(corrupt("segment body exceeds payload", self.offset)));
        }
        let segment = Segment {
            type_id: read_u64(rest, 0),
            count: read_u32(rest, 8),
            body: &rest[SEGMENT_HEADER_LEN..end],
        };
        self.offset += end;
        Some(Ok(segment))
    }
}

pub struct PairIter<'a> {
    body: &'a [u8],
    offset: usize,
    remaining: u32,
}

impl<'a> Iterator for PairIter<'a> {
    type Item = Result<(u64, &'a [u8]), Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let rest = &self.body[self.offset..];
        if rest.len() < PAIR_HEADER_LEN {
            self.remaining = 0;
            return Some(Err(corrupt("relation pair truncated", self.offset)));
        }
        let key = read_u64(rest, 0);
        let len = read_u32(rest, 8) as usize;
        let end = PAIR_HEADER_LEN + len;
        if end > rest.len() {
            self.remaining = 0;
            return Some(Err(corrupt("relation value exceeds body", self.offset)));
        }
        self.offset += end;
        Some(Ok((key, &rest[PAIR_HEADER_LEN..end])))
    }
}

fn corrupt(message: &str, offset: usize) -> Error {
    Error::new(ErrorKind::Corrupt)
        .with_message(message)
        .with_offset(offset as u64)
}

/// Field-level encoder for relation values.
#[derive(Default)]
pub struct ValueWriter {
    buf: Vec<u8>,
}

impl ValueWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u64(mut self, value: u64) -> Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn bool(mut self, value: bool) -> Self {
        self.buf.push(u8::from(value));
        self
    }

    pub fn str(mut self, value: &str) -> Self {
        self.buf
            .extend_from_slice(&(value.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(value.as_bytes());
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

pub struct ValueReader<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> ValueReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    pub fn u64(&mut self) -> Result<u64, Error> {
        let bytes = self.take(8)?;
        Ok(read_u64(bytes, 0))
    }

    pub fn bool(&mut self) -> Result<bool, Error> {
        let bytes = self.take(1)?;
        Ok(bytes[0] != 0)
    }

    pub fn str(&mut self) -> Result<&'a str, Error> {
        let len_bytes = self.take(4)?;
        let len = read_u32(len_bytes, 0) as usize;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes).map_err(|err| {
            Error::new(ErrorKind::Corrupt)
                .with_message("relation string is not utf-8")
                .with_source(err)
        })
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], Error> {
        let end = self.offset + len;
        if end > self.buf.len() {
            return Err(corrupt("relation value truncated", self.offset));
        }
        let out = &self.buf[self.offset..end];
        self.offset = end;
        Ok(out)
    }
}
