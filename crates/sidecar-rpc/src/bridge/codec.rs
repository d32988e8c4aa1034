//! Line-delimited JSON codec for worker communication.
//!
//! Each record is one compact JSON document followed by `\n`. Works over any
//! AsyncRead/AsyncWrite (child pipes, duplex streams, sockets).
//!
//! Decoding is lenient per line: a line that is not valid JSON, or does not
//! match the expected shape, is yielded as `Err(DecodeError)` inside a
//! successful frame so the stream keeps going. Only transport failures end
//! the stream.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::DecodeError;

/// Upper bound on a single line, generous enough for large transcripts.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;

/// How much of an undecodable line is kept for diagnostics.
const SNIPPET_LEN: usize = 256;

/// Serialize one record to its wire form, newline included.
///
/// serde_json escapes control characters inside strings and the compact
/// formatter emits no whitespace, so the only newline is the terminator.
pub fn encode_line<T: Serialize>(item: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut line = serde_json::to_vec(item)?;
    line.push(b'\n');
    Ok(line)
}

/// Decode one line, ignoring surrounding whitespace (including `\r`).
pub fn decode_line<T: DeserializeOwned>(line: &[u8]) -> Result<T, DecodeError> {
    let trimmed = line.trim_ascii();
    if trimmed.is_empty() {
        return Err(DecodeError::Empty);
    }
    serde_json::from_slice(trimmed).map_err(|source| DecodeError::Invalid {
        snippet: snippet(trimmed),
        source,
    })
}

fn snippet(line: &[u8]) -> String {
    let end = line.len().min(SNIPPET_LEN);
    let mut text = String::from_utf8_lossy(&line[..end]).into_owned();
    if line.len() > SNIPPET_LEN {
        text.push('…');
    }
    text
}

/// Codec that frames records by newline and serializes with JSON.
pub struct JsonLinesCodec<T> {
    max_line_length: usize,
    /// Offset already scanned for a newline in the current buffer.
    next_index: usize,
    /// Inside an overlong line; drop bytes until the next newline.
    discarding: bool,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonLinesCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonLinesCodec<T> {
    pub fn new() -> Self {
        Self::with_max_line_length(DEFAULT_MAX_LINE_LENGTH)
    }

    pub fn with_max_line_length(max_line_length: usize) -> Self {
        Self {
            max_line_length,
            next_index: 0,
            discarding: false,
            _phantom: PhantomData,
        }
    }

    pub fn max_line_length(&self) -> usize {
        self.max_line_length
    }
}

impl<T: DeserializeOwned> Decoder for JsonLinesCodec<T> {
    type Item = Result<T, DecodeError>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let newline = src[self.next_index..].iter().position(|b| *b == b'\n');
            let Some(offset) = newline else {
                if src.len() > self.max_line_length {
                    src.clear();
                    self.next_index = 0;
                    if !self.discarding {
                        self.discarding = true;
                        return Ok(Some(Err(DecodeError::LineTooLong {
                            max: self.max_line_length,
                        })));
                    }
                } else {
                    self.next_index = src.len();
                }
                return Ok(None);
            };

            let end = self.next_index + offset;
            self.next_index = 0;
            let line = src.split_to(end + 1);

            if self.discarding {
                self.discarding = false;
                continue;
            }
            if end > self.max_line_length {
                return Ok(Some(Err(DecodeError::LineTooLong {
                    max: self.max_line_length,
                })));
            }
            if line.trim_ascii().is_empty() {
                continue;
            }
            return Ok(Some(decode_line(&line[..end])));
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(item) = self.decode(src)? {
            return Ok(Some(item));
        }
        // Final record without a trailing newline.
        let rest = src.split();
        self.next_index = 0;
        if std::mem::take(&mut self.discarding) || rest.trim_ascii().is_empty() {
            return Ok(None);
        }
        Ok(Some(decode_line(&rest)))
    }
}

impl<T: Serialize> Encoder<T> for JsonLinesCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let start = dst.len();
        serde_json::to_writer((&mut *dst).writer(), &item).map_err(|e| {
            dst.truncate(start);
            io::Error::new(io::ErrorKind::InvalidData, e)
        })?;
        dst.put_u8(b'\n');

        let line_len = dst.len() - start;
        tracing::trace!(line_size_bytes = line_len, "Encoding line");
        if line_len > 1_000_000 {
            tracing::info!(
                line_size_bytes = line_len,
                line_size_kb = line_len / 1024,
                "Large line being encoded"
            );
        }
        Ok(())
    }
}
