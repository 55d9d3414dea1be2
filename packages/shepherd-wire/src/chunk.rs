use std::fmt;
use std::io::{Read, SeekFrom, Write};

use thiserror::Error;

/// Chunk tag carrying the message header.
pub const JSON: ChunkTag = ChunkTag(*b"JSON");
/// Chunk tag carrying an opaque binary payload.
pub const BLOB: ChunkTag = ChunkTag(*b"BLOB");

/// A 4-byte ASCII chunk type tag.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkTag(pub [u8; 4]);

impl ChunkTag {
    /// Build a tag from a name, space-padded or truncated to exactly four bytes.
    pub fn from_name(name: &str) -> Self {
        let mut tag = [b' '; 4];
        for (slot, byte) in tag.iter_mut().zip(name.bytes()) {
            *slot = byte;
        }
        Self(tag)
    }

    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }
}

impl fmt::Display for ChunkTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for ChunkTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkTag({})", self)
    }
}

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("chunk stream ended mid-{context}")]
    Truncated { context: &'static str },
    #[error("chunk body of {len} bytes exceeds the 32-bit length field")]
    BodyTooLarge { len: usize },
    #[error("read of {len} bytes is out of chunk bounds (offset {offset}, size {size})")]
    ReadOutOfBounds { offset: u32, len: usize, size: u32 },
    #[error("seek target {target} is outside the chunk body (size {size})")]
    SeekOutOfRange { target: i64, size: u32 },
    #[error("chunk is closed")]
    Closed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Write one chunk: tag, big-endian length, body, and a single zero pad byte
/// when `align` is set and the body length is odd. Flushes the writer.
pub fn write_chunk<W: Write>(
    out: &mut W,
    tag: ChunkTag,
    body: &[u8],
    align: bool,
) -> Result<(), ChunkError> {
    let len = u32::try_from(body.len()).map_err(|_| ChunkError::BodyTooLarge { len: body.len() })?;
    out.write_all(tag.as_bytes())?;
    out.write_all(&len.to_be_bytes())?;
    out.write_all(body)?;
    if align && len % 2 == 1 {
        out.write_all(&[0])?;
    }
    out.flush()?;
    Ok(())
}

/// Reads a single chunk from a byte stream.
///
/// Construction consumes the header; body reads track an offset into the
/// body; `close` skips whatever remains (plus the alignment pad) so the next
/// chunk header is adjacent. A clean end of stream at the header boundary is
/// the terminal signal; end of stream anywhere inside a chunk is an error.
///
/// Body bytes consumed from the underlying stream are retained, so `seek`
/// may address any position in `[0, size]` even though the transport itself
/// is forward-only.
pub struct ChunkReader<'a, R: Read> {
    input: &'a mut R,
    tag: ChunkTag,
    size: u32,
    align: bool,
    /// Body bytes already pulled off the stream, replayed on backward seeks.
    buffered: Vec<u8>,
    offset: u32,
    closed: bool,
}

impl<'a, R: Read> ChunkReader<'a, R> {
    /// Open the next chunk, or `None` when the stream is cleanly exhausted.
    pub fn open(input: &'a mut R, align: bool) -> Result<Option<Self>, ChunkError> {
        let mut header = [0u8; 8];
        let mut filled = 0;
        while filled < header.len() {
            let n = input.read(&mut header[filled..])?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(ChunkError::Truncated { context: "header" });
            }
            filled += n;
        }
        let tag = ChunkTag([header[0], header[1], header[2], header[3]]);
        let size = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        Ok(Some(Self {
            input,
            tag,
            size,
            align,
            buffered: Vec::new(),
            offset: 0,
            closed: false,
        }))
    }

    pub fn tag(&self) -> ChunkTag {
        self.tag
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Current read offset into the chunk body.
    pub fn tell(&self) -> u32 {
        self.offset
    }

    /// Read up to `len` bytes, capped to the bytes remaining in the body.
    /// At or past the body end this returns an empty buffer.
    pub fn read(&mut self, len: usize) -> Result<Vec<u8>, ChunkError> {
        if self.closed {
            return Err(ChunkError::Closed);
        }
        let remaining = (self.size - self.offset) as usize;
        let mut buffer = vec![0u8; len.min(remaining)];
        self.fill(&mut buffer)?;
        Ok(buffer)
    }

    /// Read the remainder of the chunk body.
    pub fn read_to_end(&mut self) -> Result<Vec<u8>, ChunkError> {
        let remaining = (self.size - self.offset) as usize;
        self.read(remaining)
    }

    /// Read exactly `buffer.len()` bytes; reads past the body end fail.
    pub fn read_exact(&mut self, buffer: &mut [u8]) -> Result<(), ChunkError> {
        if self.closed {
            return Err(ChunkError::Closed);
        }
        if buffer.len() > (self.size - self.offset) as usize {
            return Err(ChunkError::ReadOutOfBounds {
                offset: self.offset,
                len: buffer.len(),
                size: self.size,
            });
        }
        self.fill(buffer)
    }

    /// Seek within the chunk body. The target must stay in `[0, size]`;
    /// backward seeks replay the retained body bytes.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u32, ChunkError> {
        if self.closed {
            return Err(ChunkError::Closed);
        }
        let target = match pos {
            SeekFrom::Start(n) => n as i64,
            SeekFrom::Current(n) => i64::from(self.offset) + n,
            SeekFrom::End(n) => i64::from(self.size) + n,
        };
        if target < 0 || target > i64::from(self.size) {
            return Err(ChunkError::SeekOutOfRange {
                target,
                size: self.size,
            });
        }
        let target = target as u32;
        let buffered = self.buffered.len() as u32;
        if target > buffered {
            let mut fresh = vec![0u8; (target - buffered) as usize];
            self.pull(&mut fresh)?;
        }
        self.offset = target;
        Ok(target)
    }

    /// Skip the rest of the body and the alignment pad so the stream sits at
    /// the next chunk header. Idempotent; reads after close fail.
    pub fn close(&mut self) -> Result<(), ChunkError> {
        if self.closed {
            return Ok(());
        }
        let consumed = self.buffered.len() as u32;
        let pad = u64::from(self.align && self.size % 2 == 1);
        self.discard(u64::from(self.size - consumed) + pad)?;
        self.offset = self.size;
        self.closed = true;
        Ok(())
    }

    fn fill(&mut self, buffer: &mut [u8]) -> Result<(), ChunkError> {
        let offset = self.offset as usize;
        let replay = buffer
            .len()
            .min(self.buffered.len().saturating_sub(offset));
        buffer[..replay].copy_from_slice(&self.buffered[offset..offset + replay]);
        if replay < buffer.len() {
            let mut fresh = vec![0u8; buffer.len() - replay];
            self.pull(&mut fresh)?;
            buffer[replay..].copy_from_slice(&fresh);
        }
        self.offset += buffer.len() as u32;
        Ok(())
    }

    /// Read fresh body bytes off the stream and retain them for replay.
    fn pull(&mut self, buffer: &mut [u8]) -> Result<(), ChunkError> {
        self.input
            .read_exact(buffer)
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::UnexpectedEof => ChunkError::Truncated { context: "body" },
                _ => ChunkError::Io(err),
            })?;
        self.buffered.extend_from_slice(buffer);
        Ok(())
    }

    fn discard(&mut self, mut n: u64) -> Result<(), ChunkError> {
        let mut scratch = [0u8; 512];
        while n > 0 {
            let want = scratch.len().min(n as usize);
            let got = self.input.read(&mut scratch[..want])?;
            if got == 0 {
                return Err(ChunkError::Truncated { context: "body" });
            }
            n -= got as u64;
        }
        Ok(())
    }
}

/// Read every chunk in the stream into `(tag, body)` pairs, stopping at a
/// clean end of stream. A mid-stream failure logs the error and returns the
/// chunks accumulated so far.
pub fn read_all<R: Read>(input: &mut R, align: bool) -> Vec<(ChunkTag, Vec<u8>)> {
    let mut chunks = Vec::new();
    loop {
        match ChunkReader::open(input, align) {
            Ok(Some(mut chunk)) => {
                let tag = chunk.tag();
                let body = match chunk.read_to_end() {
                    Ok(body) => body,
                    Err(err) => {
                        tracing::warn!(error = %err, "truncated chunk stream");
                        break;
                    }
                };
                if let Err(err) = chunk.close() {
                    tracing::warn!(error = %err, "truncated chunk stream");
                    break;
                }
                chunks.push((tag, body));
            }
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(error = %err, "unreadable chunk header");
                break;
            }
        }
    }
    chunks
}
