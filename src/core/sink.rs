// Append-only output sinks (an in-memory chunk, a locked chunk file) and read-side chunk mapping.
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use fs2::FileExt;
use libc::{EACCES, EPERM};
use memmap2::Mmap;

use crate::core::error::{Error, ErrorKind, poisoned};

/// Append-only byte consumer. Already-written bytes are never rewritten.
pub trait ChunkSink: Send {
    fn append(&mut self, bytes: &[u8]) -> Result<(), Error>;

    /// Total bytes accepted so far.
    fn committed(&self) -> u64;

    fn flush(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

/// In-memory chunk. Clones share the same bytes, so a caller can keep a handle
/// while the manager owns the sink.
#[derive(Clone, Debug, Default)]
pub struct MemorySink {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything appended so far.
    pub fn bytes(&self) -> Vec<u8> {
        self.bytes.lock().map(|bytes| bytes.clone()).unwrap_or_default()
    }
}

impl ChunkSink for MemorySink {
    fn append(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.bytes
            .lock()
            .map_err(|_| poisoned("memory sink"))?
            .extend_from_slice(bytes);
        Ok(())
    }

    fn committed(&self) -> u64 {
        self.bytes.lock().map(|bytes| bytes.len() as u64).unwrap_or(0)
    }
}

/// Chunk file held under an exclusive advisory lock for its whole lifetime.
pub struct ChunkFile {
    path: PathBuf,
    writer: BufWriter<File>,
    committed: u64,
}

impl ChunkFile {
    pub fn create(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|err| Error::new(ErrorKind::Io).with_path(&path).with_source(err))?;
        FileExt::try_lock_exclusive(&file).map_err(|err| {
            Error::new(lock_error_kind(&err))
                .with_message("chunk file is locked by another recorder")
                .with_path(&path)
                .with_source(err)
        })?;
        // Truncate only once the lock is held.
        file.set_len(0)
            .map_err(|err| Error::new(ErrorKind::Io).with_path(&path).with_source(err))?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            committed: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ChunkSink for ChunkFile {
    fn append(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.writer
            .write_all(bytes)
            .map_err(|err| Error::new(ErrorKind::Io).with_path(&self.path).with_source(err))?;
        self.committed += bytes.len() as u64;
        Ok(())
    }

    fn committed(&self) -> u64 {
        self.committed
    }

    fn flush(&mut self) -> Result<(), Error> {
        self.writer
            .flush()
            .map_err(|err| Error::new(ErrorKind::Io).with_path(&self.path).with_source(err))
    }
}

impl Drop for ChunkFile {
    fn drop(&mut self) {
        let _ = self.writer.flush();
        let _ = FileExt::unlock(self.writer.get_ref());
    }
}

/// Read-only view of a finished chunk, held under a shared lock.
pub struct MappedChunk {
    path: PathBuf,
    file: File,
    map: Option<Mmap>,
}

impl MappedChunk {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|err| {
            let kind = if err.kind() == io::ErrorKind::NotFound {
                ErrorKind::NotFound
            } else {
                ErrorKind::Io
            };
            Error::new(kind).with_path(&path).with_source(err)
        })?;
        FileExt::try_lock_shared(&file).map_err(|err| {
            Error::new(lock_error_kind(&err))
                .with_message("chunk file is still being written")
                .with_path(&path)
                .with_source(err)
        })?;
        let len = file
            .metadata()
            .map(|meta| meta.len())
            .map_err(|err| Error::new(ErrorKind::Io).with_path(&path).with_source(err))?;
        // Zero-length files cannot be mapped.
        let map = if len == 0 {
            None
        } else {
            let map = unsafe {
                Mmap::map(&file)
                    .map_err(|err| Error::new(ErrorKind::Io).with_path(&path).with_source(err))?
            };
            Some(map)
        };
        Ok(Self { path, file, map })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes(&self) -> &[u8] {
        self.map.as_deref().unwrap_or(&[])
    }
}

impl Drop for MappedChunk {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn lock_error_kind(err: &io::Error) -> ErrorKind {
    let errno = err.raw_os_error().unwrap_or_default();
    if errno == EACCES || errno == EPERM {
        return ErrorKind::Permission;
    }
    match err.kind() {
        io::ErrorKind::WouldBlock => ErrorKind::Busy,
        io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        _ => ErrorKind::Io,
    }
}

#[cfg(test)]
mod tests {
    use super::{ChunkFile, ChunkSink, MappedChunk, MemorySink};
    use crate::core::error::ErrorKind;

    #[test]
    fn memory_sink_counts_bytes() {
        let mut sink = MemorySink::new();
        sink.append(b"abc").expect("append");
        sink.append(b"de").expect("append");
        let handle = sink.clone();
        assert_eq!(sink.committed(), 5);
        assert_eq!(handle.bytes(), b"abcde".to_vec());
    }

    #[test]
    fn chunk_file_appends_and_flushes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("chunk-0001.ckp");
        let mut chunk = ChunkFile::create(&path).expect("create");
        chunk.append(&[1, 2, 3]).expect("append");
        chunk.append(&[4]).expect("append");
        chunk.flush().expect("flush");
        assert_eq!(chunk.committed(), 4);
        drop(chunk);
        assert_eq!(std::fs::read(&path).expect("read"), vec![1, 2, 3, 4]);
    }

    #[test]
    fn second_recorder_on_same_chunk_is_busy() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("chunk.ckp");
        let _first = ChunkFile::create(&path).expect("create");
        match ChunkFile::create(&path) {
            Ok(_) => panic!("expected lock contention"),
            Err(err) => assert_eq!(err.kind(), ErrorKind::Busy),
        }
    }

    #[test]
    fn mapped_chunk_reads_finished_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("chunk.ckp");
        let mut chunk = ChunkFile::create(&path).expect("create");
        chunk.append(b"entry").expect("append");
        assert_eq!(
            MappedChunk::open(&path).err().map(|err| err.kind()),
            Some(ErrorKind::Busy)
        );
        drop(chunk);
        let mapped = MappedChunk::open(&path).expect("open");
        assert_eq!(mapped.bytes(), b"entry");

        let empty = dir.path().join("empty.ckp");
        drop(ChunkFile::create(&empty).expect("create"));
        assert!(MappedChunk::open(&empty).expect("open").bytes().is_empty());

        let missing = MappedChunk::open(dir.path().join("missing.ckp"));
        assert_eq!(missing.err().map(|err| err.kind()), Some(ErrorKind::NotFound));
    }

    #[test]
    fn lock_errors_map_to_expected_kinds() {
        let err = std::io::Error::from_raw_os_error(libc::EAGAIN);
        assert_eq!(super::lock_error_kind(&err), ErrorKind::Busy);

        let err = std::io::Error::from_raw_os_error(libc::EACCES);
        assert_eq!(super::lock_error_kind(&err), ErrorKind::Permission);

        let err = std::io::Error::from_raw_os_error(libc::EPERM);
        assert_eq!(super::lock_error_kind(&err), ErrorKind::Permission);

        let err = std::io::Error::from_raw_os_error(libc::EBADF);
        assert_eq!(super::lock_error_kind(&err), ErrorKind::Io);
    }
}
