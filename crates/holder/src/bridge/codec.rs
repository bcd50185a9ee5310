//! Line-delimited JSON codec for the control pipes.
//!
//! One JSON object per line, terminated by a single `\n`. There is no length
//! prefix, so the decoder scans for the delimiter and bounds how much it will
//! buffer while waiting for one. Works over any AsyncRead/AsyncWrite.

use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Smallest free region kept available for the next read.
pub const MIN_BUFFER: usize = 1024;

/// Default ceiling for a single frame (excluding the delimiter).
pub const DEFAULT_MAX_FRAME: usize = 64 * 1024;

const NEWLINE: u8 = b'\n';

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("pipe i/o failed: {0}")]
    Io(#[from] std::io::Error),

    /// Peer sent more than `limit` bytes without a delimiter.
    #[error("frame exceeds {limit} bytes")]
    FrameTooLarge { limit: usize },

    /// Stream closed with a partial frame buffered.
    #[error("stream closed mid-frame ({len} bytes buffered)")]
    Truncated { len: usize },

    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Codec that frames messages with a trailing line feed and serializes with JSON.
pub struct LineJsonCodec<T> {
    max_frame_len: usize,
    /// Bytes of the current partial frame already searched for a delimiter.
    scanned: usize,
    _phantom: PhantomData<T>,
}

impl<T> Default for LineJsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LineJsonCodec<T> {
    pub fn new() -> Self {
        Self::with_max_frame_len(DEFAULT_MAX_FRAME)
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            max_frame_len: max_frame_len.max(MIN_BUFFER),
            scanned: 0,
            _phantom: PhantomData,
        }
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    /// Double the buffer once free space drops below `MIN_BUFFER` or below
    /// half the capacity, never past the frame ceiling plus the delimiter.
    fn grow(&self, src: &mut BytesMut) {
        let capacity = src.capacity();
        let free = capacity - src.len();
        if free >= MIN_BUFFER && free >= capacity / 2 {
            return;
        }

        let ceiling = self.max_frame_len + 1;
        let target = (capacity * 2).max(MIN_BUFFER).min(ceiling);
        if target > src.len() {
            tracing::trace!(from = capacity, to = target, "Growing frame buffer");
            src.reserve(target - src.len());
        }
    }
}

impl<T: DeserializeOwned> Decoder for LineJsonCodec<T> {
    type Item = T;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            // The buffer may not be the one scanned last time.
            let start = self.scanned.min(src.len());
            let Some(offset) = src[start..].iter().position(|b| *b == NEWLINE) else {
                if src.len() >= self.max_frame_len {
                    self.scanned = 0;
                    return Err(CodecError::FrameTooLarge {
                        limit: self.max_frame_len,
                    });
                }
                self.scanned = src.len();
                self.grow(src);
                return Ok(None);
            };

            let end = start + offset;
            self.scanned = 0;
            if end >= self.max_frame_len {
                return Err(CodecError::FrameTooLarge {
                    limit: self.max_frame_len,
                });
            }

            let line = src.split_to(end + 1);
            let frame = &line[..end];
            if frame.is_empty() {
                continue;
            }

            tracing::trace!(frame_size_bytes = frame.len(), "Decoding frame");
            let item = serde_json::from_slice(frame)?;
            return Ok(Some(item));
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(item) => Ok(Some(item)),
            None if src.is_empty() => Ok(None),
            None => {
                self.scanned = 0;
                Err(CodecError::Truncated { len: src.len() })
            }
        }
    }
}

impl<T: Serialize> Encoder<T> for LineJsonCodec<T> {
    type Error = CodecError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&item)?;
        let json_len = json.len();
        tracing::trace!(json_size_bytes = json_len, "Encoding frame");
        // The peer applies the same ceiling; a larger frame would kill the connection.
        if json_len >= self.max_frame_len {
            return Err(CodecError::FrameTooLarge {
                limit: self.max_frame_len,
            });
        }

        dst.reserve(json_len + 1);
        dst.put_slice(&json);
        dst.put_u8(NEWLINE);
        Ok(())
    }
}
