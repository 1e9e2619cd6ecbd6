/*!
Pull-based byte chunk streams.

Downloads are exposed as a finite sequence of [`Bytes`] chunks that the
consumer pulls until exhaustion or error. A stream can be reopened from its
source, but cannot be rewound mid-way.
*/

use std::io::{self, Read, Write};

use bytes::{Bytes, BytesMut};

use crate::Result;

/// Default chunk size for archive transfers (64 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Iterator of byte chunks read lazily from an underlying reader
pub struct ChunkStream<R: Read> {
    reader: R,
    chunk_size: usize,
    length: Option<u64>,
    finished: bool,
}

impl<R: Read> ChunkStream<R> {
    /// Create a stream with the default chunk size
    pub fn new(reader: R) -> Self {
        Self::with_chunk_size(reader, DEFAULT_CHUNK_SIZE)
    }

    /// Create a stream yielding chunks of at most `chunk_size` bytes
    pub fn with_chunk_size(reader: R, chunk_size: usize) -> Self {
        Self {
            reader,
            chunk_size: chunk_size.max(1),
            length: None,
            finished: false,
        }
    }

    /// Attach the total length, when the source knows it up front
    pub fn with_length(mut self, length: u64) -> Self {
        self.length = Some(length);
        self
    }

    /// Total length in bytes, if known
    pub fn length(&self) -> Option<u64> {
        self.length
    }

    /// Pull every remaining chunk into `writer`, returning the bytes written
    pub fn copy_to<W: Write>(self, writer: &mut W) -> Result<u64> {
        let mut written = 0u64;
        for chunk in self {
            let chunk = chunk?;
            writer.write_all(&chunk)?;
            written += chunk.len() as u64;
        }
        writer.flush()?;
        Ok(written)
    }

    /// Pull every remaining chunk into one buffer
    pub fn collect_bytes(self) -> Result<Bytes> {
        let mut buffer = BytesMut::with_capacity(self.length.unwrap_or(0) as usize);
        for chunk in self {
            buffer.extend_from_slice(&chunk?);
        }
        Ok(buffer.freeze())
    }
}

impl<R: Read> Iterator for ChunkStream<R> {
    type Item = Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        let mut buffer = vec![0u8; self.chunk_size];
        let mut filled = 0;
        while filled < buffer.len() {
            match self.reader.read(&mut buffer[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e.into()));
                }
            }
        }

        if filled == 0 {
            self.finished = true;
            return None;
        }
        if filled < buffer.len() {
            self.finished = true;
        }
        buffer.truncate(filled);
        Some(Ok(Bytes::from(buffer)))
    }
}
