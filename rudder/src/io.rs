//! File source/sink bridges between the engines and the filesystem.
//!
//! The engines only see the `ChunkSource`/`ChunkSink` traits, so tests and
//! other callers can substitute their own endpoints.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;

use crate::error::Result;
use crate::frame::{Frame, MAX_PAYLOAD};

/// Produces the payload chunks of an outbound transfer.
///
/// Every chunk except the last is exactly `MAX_PAYLOAD` bytes.
pub trait ChunkSource {
    fn next_chunk(&mut self) -> io::Result<Option<Bytes>>;
}

/// Consumes the in-order payload bytes of an inbound transfer.
pub trait ChunkSink {
    fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()>;

    /// Flush and keep the output.
    fn commit(&mut self) -> io::Result<()>;

    /// Drop the output, removing anything already written.
    fn discard(&mut self) -> io::Result<()>;
}

/// Reads a file in `MAX_PAYLOAD` chunks.
pub struct FileSource {
    file: File,
}

impl FileSource {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self { file: File::open(path)? })
    }
}

impl ChunkSource for FileSource {
    fn next_chunk(&mut self) -> io::Result<Option<Bytes>> {
        let mut buf = [0u8; MAX_PAYLOAD];
        let mut filled = 0;
        while filled < MAX_PAYLOAD {
            match self.file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        if filled == 0 {
            Ok(None)
        } else {
            Ok(Some(Bytes::copy_from_slice(&buf[..filled])))
        }
    }
}

/// Writes a file created (and truncated) at construction.
pub struct FileSink {
    path: PathBuf,
    file: Option<File>,
}

impl FileSink {
    pub fn create(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().write(true).create(true).truncate(true).open(&path)?;
        Ok(Self { path, file: Some(file) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ChunkSink for FileSink {
    fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.write_all(chunk),
            None => Err(io::Error::other("sink already closed")),
        }
    }

    fn commit(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
            file.sync_all()?;
        }
        Ok(())
    }

    fn discard(&mut self) -> io::Result<()> {
        if self.file.take().is_some() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

/// Enumerate `source` into DATA frames with sequential seqs and precomputed
/// checksums. An I/O error partway through aborts the enumeration before
/// anything reaches the wire.
pub fn enumerate_frames(source: &mut dyn ChunkSource) -> Result<Vec<Frame>> {
    let mut frames = Vec::new();
    while let Some(chunk) = source.next_chunk()? {
        frames.push(Frame::data(frames.len() as u32, chunk));
    }
    Ok(frames)
}
