//! Wire format for the shepherd message bus.
//!
//! Every broker message is a stream of typed, length-prefixed chunks: a
//! 4-byte ASCII tag, a 32-bit big-endian body length, and the body. One
//! `JSON` chunk carries the message header; any number of `BLOB` chunks
//! carry opaque binary payloads.

mod chunk;
mod envelope;

pub use chunk::{read_all, write_chunk, ChunkError, ChunkReader, ChunkTag, BLOB, JSON};
pub use envelope::{Envelope, EnvelopeError};
