// Checkpoint entry header layout and validation.
use crate::core::error::{Error, ErrorKind};

pub const ENTRY_HEADER_LEN: usize = 32;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CheckpointEntry {
    pub size: u64,
    pub start_time: u64,
    pub duration: u64,
    pub flushpoint: bool,
    pub segment_count: u32,
}

impl CheckpointEntry {
    pub fn new(
        payload_len: usize,
        start_time: u64,
        duration: u64,
        flushpoint: bool,
        segment_count: u32,
    ) -> Self {
        Self {
            size: (ENTRY_HEADER_LEN + payload_len) as u64,
            start_time,
            duration,
            flushpoint,
            segment_count,
        }
    }

    pub fn payload_len(&self) -> usize {
        (self.size as usize).saturating_sub(ENTRY_HEADER_LEN)
    }

    pub fn encode(&self) -> [u8; ENTRY_HEADER_LEN] {
        let mut buf = [0u8; ENTRY_HEADER_LEN];
        write_u64(&mut buf, 0, self.size);
        write_u64(&mut buf, 8, self.start_time);
        write_u64(&mut buf, 16, self.duration);
        write_u32(&mut buf, 24, u32::from(self.flushpoint));
        write_u32(&mut buf, 28, self.segment_count);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < ENTRY_HEADER_LEN {
            return Err(Error::new(ErrorKind::Corrupt).with_message("entry header truncated"));
        }
        let flushpoint = match read_u32(buf, 24) {
            0 => false,
            1 => true,
            _ => {
                return Err(Error::new(ErrorKind::Corrupt).with_message("invalid flushpoint flag"));
            }
        };
        Ok(Self {
            size: read_u64(buf, 0),
            start_time: read_u64(buf, 8),
            duration: read_u64(buf, 16),
            flushpoint,
            segment_count: read_u32(buf, 28),
        })
    }

    /// Checks the header against the number of bytes available after it starts.
    pub fn validate(&self, available: usize) -> Result<(), Error> {
        if (self.size as usize) < ENTRY_HEADER_LEN {
            return Err(
                Error::new(ErrorKind::Corrupt).with_message("entry size below header length")
            );
        }
        if self.size > available as u64 {
            return Err(Error::new(ErrorKind::Corrupt).with_message("entry exceeds chunk bounds"));
        }
        if self.segment_count == 0 && self.payload_len() != 0 {
            return Err(
                Error::new(ErrorKind::Corrupt).with_message("payload present without segments")
            );
        }
        Ok(())
    }
}

pub(crate) fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(read_4(buf, offset))
}

pub(crate) fn read_u64(buf: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(read_8(buf, offset))
}

fn read_4(buf: &[u8], offset: usize) -> [u8; 4] {
    let mut out = [0u8; 4];
    out.copy_from_slice(&buf[offset..offset + 4]);
    out
}

fn read_8(buf: &[u8], offset: usize) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&buf[offset..offset + 8]);
    out
}

pub(crate) fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn write_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}
