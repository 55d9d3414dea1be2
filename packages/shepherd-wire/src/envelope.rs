use std::io::Cursor;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::chunk::{read_all, write_chunk, ChunkError, BLOB, JSON};

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("failed to frame message chunks: {0}")]
    Chunk(#[from] ChunkError),
    #[error("invalid message header: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message header is not a JSON object")]
    HeaderNotObject,
}

/// One logical bus message: a JSON header plus ordered binary blobs.
///
/// On the wire the header travels as a single `JSON` chunk and each blob as
/// a `BLOB` chunk, with alignment disabled. When several `JSON` chunks
/// appear in one payload the first wins; unknown chunk tags are skipped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Envelope {
    pub header: Map<String, Value>,
    pub blobs: Vec<Vec<u8>>,
}

impl Envelope {
    pub fn new(header: Map<String, Value>) -> Self {
        Self {
            header,
            blobs: Vec::new(),
        }
    }

    pub fn with_blobs(header: Map<String, Value>, blobs: Vec<Vec<u8>>) -> Self {
        Self { header, blobs }
    }

    /// The `event` verb, when present.
    pub fn event(&self) -> Option<&str> {
        self.str_field("event")
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.header.get(key).and_then(Value::as_str)
    }

    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        let mut out = Vec::new();
        let header = serde_json::to_vec(&self.header)?;
        write_chunk(&mut out, JSON, &header, false)?;
        for blob in &self.blobs {
            write_chunk(&mut out, BLOB, blob, false)?;
        }
        Ok(out)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, EnvelopeError> {
        let mut header = None;
        let mut blobs = Vec::new();
        for (tag, body) in read_all(&mut Cursor::new(payload), false) {
            if tag == JSON {
                if header.is_none() {
                    header = Some(parse_header(&body)?);
                } else {
                    tracing::debug!("ignoring extra JSON chunk in message payload");
                }
            } else if tag == BLOB {
                blobs.push(body);
            } else {
                tracing::debug!(tag = %tag, "skipping unrecognized chunk");
            }
        }
        Ok(Self {
            header: header.unwrap_or_default(),
            blobs,
        })
    }
}

/// Parse a header body, tolerating the non-finite numerals (`NaN`,
/// `Infinity`, `-Infinity`) that scientific agents emit. Non-finite values
/// have no JSON representation and decode as `null`.
fn parse_header(body: &[u8]) -> Result<Map<String, Value>, EnvelopeError> {
    let value: Value = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(err) => {
            let text = String::from_utf8_lossy(body);
            serde_json::from_str(&sanitize_non_finite(&text)).map_err(|_| err)?
        }
    };
    match value {
        Value::Object(header) => Ok(header),
        _ => Err(EnvelopeError::HeaderNotObject),
    }
}

/// Replace bare `NaN`/`Infinity`/`-Infinity` tokens outside string literals
/// with `null`.
fn sanitize_non_finite(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut i = 0;
    while i < bytes.len() {
        let byte = bytes[i];
        if !in_string {
            if byte == b'"' {
                in_string = true;
            } else if bytes[i..].starts_with(b"NaN") {
                out.push_str("null");
                i += 3;
                continue;
            } else if bytes[i..].starts_with(b"Infinity") {
                out.push_str("null");
                i += 8;
                continue;
            } else if bytes[i..].starts_with(b"-Infinity") {
                out.push_str("null");
                i += 9;
                continue;
            }
        } else if escaped {
            escaped = false;
        } else if byte == b'\\' {
            escaped = true;
        } else if byte == b'"' {
            in_string = false;
        }
        let start = i;
        i += 1;
        while i < bytes.len() && bytes[i] & 0xc0 == 0x80 {
            i += 1;
        }
        out.push_str(&text[start..i]);
    }
    out
}
