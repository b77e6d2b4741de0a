//! Length-prefixed wire framing.
//!
//! One frame on the wire is `[u32 BE length][u8 version][body]`, where
//! `length` counts the version byte plus the body, and the body is the
//! bincode-serialized [`Envelope`]. The decoder is stateful: one instance
//! per connection, fed raw chunks in stream order. Frames may arrive split
//! across any number of chunks, and one chunk may carry several frames.

use crate::command::Envelope;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tracing::debug;

/// Bump when the frame layout or the body format changes.
pub const PROTOCOL_VERSION: u8 = 1;

/// Ceiling on buffered undecoded bytes per connection. A peer that never
/// completes a frame is cut off here instead of exhausting memory.
pub const MAX_BUFFER: usize = 4 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Unsupported protocol version {0}")]
    BadVersion(u8),
    #[error("Frame length must cover the version byte")]
    BadLength,
    #[error("Inbound buffer overflow ({0} bytes buffered)")]
    Overflow(usize),
    #[error("Frame body encode failed: {0}")]
    Encode(#[source] bincode::Error),
}

/// Serialize one envelope into a complete wire frame.
pub fn encode_frame(envelope: &Envelope) -> Result<Bytes, FrameError> {
    let body = bincode::serialize(envelope).map_err(FrameError::Encode)?;

    let mut frame = BytesMut::with_capacity(4 + 1 + body.len());
    frame.put_u32((1 + body.len()) as u32); // big-endian length prefix
    frame.put_u8(PROTOCOL_VERSION);
    frame.put_slice(&body);

    Ok(frame.freeze())
}

/// Stateful frame decoder. One socket = one instance.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and slice off every complete frame.
    ///
    /// A partial tail stays buffered for the next chunk. A frame whose
    /// body fails to decode is dropped and decoding continues; a version
    /// mismatch or buffer overflow is a protocol error and the connection
    /// is no longer trustworthy.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Envelope>, FrameError> {
        self.buffer.extend_from_slice(chunk);

        if self.buffer.len() > MAX_BUFFER {
            return Err(FrameError::Overflow(self.buffer.len()));
        }

        let mut envelopes = Vec::new();

        while self.buffer.len() >= 4 {
            let len = u32::from_be_bytes([
                self.buffer[0],
                self.buffer[1],
                self.buffer[2],
                self.buffer[3],
            ]) as usize;

            if len == 0 {
                return Err(FrameError::BadLength);
            }
            if self.buffer.len() < 4 + len {
                break;
            }

            let version = self.buffer[4];
            if version != PROTOCOL_VERSION {
                return Err(FrameError::BadVersion(version));
            }

            let frame = self.buffer.split_to(4 + len);
            match bincode::deserialize(&frame[5..]) {
                Ok(envelope) => envelopes.push(envelope),
                // bad body is frame-local: drop it, keep the connection
                Err(e) => debug!("Dropping undecodable frame body: {}", e),
            }
        }

        Ok(envelopes)
    }

    /// Bytes currently buffered (incomplete frame tail).
    pub fn buffered(&self) -> usize {
        self.buffer.remaining()
    }

    /// Discard buffered state. Called when a connection closes so a
    /// decoder is never reused across unrelated connections.
    pub fn reset(&mut self) {
        self.buffer = BytesMut::new();
    }
}
