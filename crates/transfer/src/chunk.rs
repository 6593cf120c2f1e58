use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::TransferError;

/// A contiguous byte range of the source file, uploaded as one HTTP request.
///
/// Chunks produced by one pass over a file partition `[0, total_size)` with
/// no gaps or overlaps. The final chunk may be shorter than the configured
/// chunk size; a zero-length chunk with `start == end == total_size` signals
/// end-of-file and is never transmitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChunk {
    /// Start byte, inclusive.
    pub start: u64,
    /// End byte, exclusive.
    pub end: u64,
    /// Total file size in bytes.
    pub total_size: u64,
    /// Raw chunk bytes; `end - start` long.
    pub data: Vec<u8>,
}

impl FileChunk {
    /// Length of this chunk in bytes.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// `true` for the zero-length end-of-file marker.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Sequential byte-range reader over a local file.
///
/// Produces one [`FileChunk`] per call, in file order. Not safe for
/// concurrent use; exactly one reader is active at a time, owned by the
/// transfer engine's control path.
pub struct ChunkReader {
    path: PathBuf,
    chunk_size: u64,
    file: Option<File>,
    offset: u64,
    total_size: u64,
}

impl ChunkReader {
    /// Creates a reader for `path`. The file is not touched until
    /// [`open`](Self::open).
    pub fn new(path: impl Into<PathBuf>, chunk_size: u64) -> Self {
        Self {
            path: path.into(),
            chunk_size,
            file: None,
            offset: 0,
            total_size: 0,
        }
    }

    /// Opens the file. No-op if already open.
    pub fn open(&mut self) -> Result<(), TransferError> {
        if self.file.is_some() {
            return Ok(());
        }
        let file = File::open(&self.path)?;
        self.total_size = file.metadata()?.len();
        self.file = Some(file);
        self.offset = 0;
        Ok(())
    }

    /// Repositions the read cursor (for resume). Must be called before the
    /// first read when resuming mid-file. An offset past end-of-file reads
    /// as EOF on the next call.
    pub fn seek(&mut self, offset: u64) -> Result<(), TransferError> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| TransferError::Internal("seek on unopened reader".into()))?;
        file.seek(SeekFrom::Start(offset))?;
        self.offset = offset;
        Ok(())
    }

    /// Reads the next up-to-`chunk_size` bytes.
    ///
    /// At end-of-file returns the zero-length terminal chunk with
    /// `start == end == total_size` rather than failing.
    pub fn read_next_chunk(&mut self) -> Result<FileChunk, TransferError> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| TransferError::Internal("read on unopened reader".into()))?;

        let remaining = self.total_size.saturating_sub(self.offset);
        let read_size = remaining.min(self.chunk_size) as usize;
        if read_size == 0 {
            return Ok(FileChunk {
                start: self.total_size,
                end: self.total_size,
                total_size: self.total_size,
                data: Vec::new(),
            });
        }

        let mut data = vec![0u8; read_size];
        file.read_exact(&mut data)?;

        let chunk = FileChunk {
            start: self.offset,
            end: self.offset + read_size as u64,
            total_size: self.total_size,
            data,
        };
        self.offset = chunk.end;
        Ok(chunk)
    }

    /// Releases the file handle. Idempotent.
    pub fn close(&mut self) {
        self.file = None;
    }

    /// Current byte offset.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Total file size in bytes. Zero until opened.
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Source file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}
