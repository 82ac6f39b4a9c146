use std::io::{self, prelude::*};

use crc32fast::Hasher;

/// Counts how many bytes have been read and calculates a running CRC32
pub struct CountingCrcReader<R> {
    inner: R,
    hasher: Hasher,
    count: u64,
}

impl<R: Read> CountingCrcReader<R> {
    /// Creates a new `CountingCrcReader` with the given reader.
    ///
    /// This is not used when both `lz4` and `zstd` features are disabled.
    #[allow(dead_code)]
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Hasher::new(),
            count: 0,
        }
    }

    pub fn position(&self) -> u64 {
        self.count
    }

    /// Consumes the reader and returns the checksum
    pub fn finalize(self) -> u32 {
        self.hasher.finalize()
    }
}

impl<R: Read> Read for CountingCrcReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let res = self.inner.read(buf)?;
        self.count += res as u64;
        self.hasher.update(&buf[..res]);
        Ok(res)
    }
}

pub struct CountingCrcWriter<W> {
    inner: W,
    hasher: Hasher,
    count: u64,
}

impl<W: Write> CountingCrcWriter<W> {
    pub fn new(inner: W) -> Self {
        Self::with_start_position(inner, 0)
    }

    /// Creates a `CountingCrcWriter` whose position counter starts at `start`, with a fresh
    /// CRC. Used to track overall file position across a boundary where the hash itself should
    /// restart (e.g. the data section CRC excludes the magic and header).
    pub fn with_start_position(inner: W, start: u64) -> Self {
        Self {
            inner,
            hasher: Hasher::new(),
            count: start,
        }
    }

    pub fn position(&self) -> u64 {
        self.count
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    /// Returns the CRC of everything written so far without consuming the writer.
    pub fn snapshot_crc(&self) -> u32 {
        self.hasher.clone().finalize()
    }

    /// Consumes the reader and returns the inner writer and the checksum
    pub fn finalize(self) -> (W, u32) {
        (self.inner, self.hasher.finalize())
    }
}

impl<W: Write> Write for CountingCrcWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let res = self.inner.write(buf)?;
        self.count += res as u64;
        self.hasher.update(&buf[..res]);
        Ok(res)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Counts how many bytes have been written to a plain [`Write`], without requiring the
/// destination to support [`Seek`](std::io::Seek).
///
/// This lets the writer track file offsets for indexing purposes while only ever appending,
/// which is all the [`Sink`](crate::write::Sink) contract promises.
pub struct CountingWriter<W> {
    writer: W,
    position: u64,
}

impl<W> CountingWriter<W> {
    pub fn new(writer: W) -> Self {
        Self::with_start_position(writer, 0)
    }

    /// Creates a `CountingWriter` whose position counter starts at `start`, for append mode
    /// where the underlying writer is already partway through a file.
    pub fn with_start_position(writer: W, start: u64) -> Self {
        Self {
            writer,
            position: start,
        }
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.writer
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let res = self.writer.write(buf)?;
        self.position += res as u64;
        Ok(res)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}
