//! Codec for framing messages on the tunnel byte stream
//!
//! Format: `[length: u16 big-endian][payload: length bytes]`
//!
//! The decoder is resumable: it keeps its position between calls, so a frame
//! (or even its two-byte header) may arrive split across any number of reads.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Size of the frame length header
pub const HEADER_LEN: usize = 2;

/// Codec errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),
}

/// Streaming frame decoder, one per tunnel connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageCodec {
    buffer: BytesMut,
    header_remaining: usize,
    payload_remaining: usize,
}

impl MessageCodec {
    /// Largest payload a 16-bit length header can describe
    pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
            header_remaining: HEADER_LEN,
            payload_remaining: 0,
        }
    }

    /// Encode a payload into a frame
    pub fn encode(payload: &[u8]) -> Result<Bytes, CodecError> {
        if payload.len() > Self::MAX_PAYLOAD_SIZE {
            return Err(CodecError::FrameTooLarge(payload.len()));
        }

        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
        buf.put_u16(payload.len() as u16);
        buf.put_slice(payload);

        Ok(buf.freeze())
    }

    /// Feed a chunk of the stream, calling `on_message` for every frame it completes
    ///
    /// A single call may complete zero, one or many frames. Bytes belonging to
    /// an unfinished frame are kept until the next call.
    pub fn decode<F>(&mut self, mut chunk: &[u8], mut on_message: F)
    where
        F: FnMut(Bytes),
    {
        loop {
            // Length header, most significant byte first
            while self.header_remaining > 0 {
                let Some((&byte, rest)) = chunk.split_first() else {
                    return;
                };
                self.header_remaining -= 1;
                self.payload_remaining |= (byte as usize) << (self.header_remaining * 8);
                chunk = rest;
            }

            if self.payload_remaining > 0 {
                if chunk.is_empty() {
                    return;
                }

                let take = self.payload_remaining.min(chunk.len());
                self.buffer.extend_from_slice(&chunk[..take]);
                self.payload_remaining -= take;
                chunk = &chunk[take..];

                if self.payload_remaining > 0 {
                    return;
                }
            }

            let message = self.buffer.split().freeze();
            self.header_remaining = HEADER_LEN;
            on_message(message);
        }
    }

    /// True when no partial frame is buffered
    pub fn is_idle(&self) -> bool {
        self.header_remaining == HEADER_LEN && self.payload_remaining == 0 && self.buffer.is_empty()
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}
