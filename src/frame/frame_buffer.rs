//! Frame buffer for accumulating partial reads.
//!
//! On a byte-stream transport every frame is preceded by a 3-byte big-endian
//! length. The buffer runs a two-state machine:
//! - `WaitingForLength`: need at least 3 bytes
//! - `WaitingForFrame`: length parsed, need N more bytes
//!
//! # Example
//!
//! ```
//! use rsocket_mux::frame::{Frame, FrameBuffer, encode_length_prefixed};
//!
//! let mut buffer = FrameBuffer::new();
//! let wire = encode_length_prefixed(&Frame::cancel(3));
//!
//! // Data arrives in chunks from the socket
//! assert!(buffer.push(&wire[..2]).unwrap().is_empty());
//! let frames = buffer.push(&wire[2..]).unwrap();
//! assert_eq!(frames, vec![Frame::cancel(3)]);
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use super::body::Frame;
use super::header::{put_u24, read_u24, HEADER_LEN, MAX_U24};
use crate::error::{RSocketError, Result};

/// Size of the transport length prefix.
pub const LENGTH_PREFIX_LEN: usize = 3;

/// State machine for frame parsing.
#[derive(Debug, Clone, Copy)]
enum State {
    /// Waiting for the 3-byte length prefix.
    WaitingForLength,
    /// Length parsed, waiting for the frame bytes.
    WaitingForFrame { remaining: usize },
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
pub struct FrameBuffer {
    buffer: BytesMut,
    state: State,
    max_frame_size: usize,
}

impl FrameBuffer {
    /// Create a new frame buffer. Default capacity: 64KB, max frame: 16MB - 1.
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_U24)
    }

    /// Create a new frame buffer with a custom max frame size.
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::WaitingForLength,
            max_frame_size: max_frame_size.min(MAX_U24),
        }
    }

    /// Push data into the buffer and decode all complete frames.
    ///
    /// Partial data is buffered for the next push.
    ///
    /// # Errors
    ///
    /// `MalformedFrame` if a length exceeds the maximum, is shorter than a
    /// header, or a frame fails to decode. All are connection-fatal.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(raw) = self.try_extract_one()? {
            frames.push(Frame::decode(raw)?);
        }
        Ok(frames)
    }

    /// Try to split off the bytes of one frame.
    fn try_extract_one(&mut self) -> Result<Option<Bytes>> {
        loop {
            match self.state {
                State::WaitingForLength => {
                    if self.buffer.len() < LENGTH_PREFIX_LEN {
                        return Ok(None);
                    }
                    let len = read_u24(&self.buffer[..LENGTH_PREFIX_LEN]);
                    if len > self.max_frame_size {
                        return Err(RSocketError::MalformedFrame(format!(
                            "frame size {} exceeds maximum {}",
                            len, self.max_frame_size
                        )));
                    }
                    if len < HEADER_LEN {
                        return Err(RSocketError::MalformedFrame(format!(
                            "frame size {} is smaller than a header",
                            len
                        )));
                    }
                    let _ = self.buffer.split_to(LENGTH_PREFIX_LEN);
                    self.state = State::WaitingForFrame { remaining: len };
                }
                State::WaitingForFrame { remaining } => {
                    if self.buffer.len() < remaining {
                        return Ok(None);
                    }
                    let raw = self.buffer.split_to(remaining).freeze();
                    self.state = State::WaitingForLength;
                    return Ok(Some(raw));
                }
            }
        }
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match self.state {
            State::WaitingForLength => "WaitingForLength",
            State::WaitingForFrame { .. } => "WaitingForFrame",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode the 3-byte length prefix for a frame of `len` bytes.
#[inline]
pub fn length_prefix(len: usize) -> [u8; LENGTH_PREFIX_LEN] {
    [(len >> 16) as u8, (len >> 8) as u8, len as u8]
}

/// Encode a frame with its length prefix into one buffer.
pub fn encode_length_prefixed(frame: &Frame) -> Bytes {
    let body = frame.encode();
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_LEN + body.len());
    put_u24(&mut buf, body.len());
    buf.put_slice(&body);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::Payload;

    #[test]
    fn test_multiple_frames_in_one_push() {
        let mut buffer = FrameBuffer::new();

        let mut combined = Vec::new();
        combined.extend_from_slice(&encode_length_prefixed(&Frame::request_n(1, 5)));
        combined.extend_from_slice(&encode_length_prefixed(&Frame::cancel(3)));
        combined.extend_from_slice(&encode_length_prefixed(&Frame::next(
            5,
            Payload::from_data("third"),
            false,
        )));

        let frames = buffer.push(&combined).unwrap();

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].stream_id(), 1);
        assert_eq!(frames[1].stream_id(), 3);
        assert_eq!(frames[2].stream_id(), 5);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_fragmented_frame() {
        let mut buffer = FrameBuffer::new();
        let payload = Payload::from_data("this is a longer payload split across reads");
        let wire = encode_length_prefixed(&Frame::next(1, payload.clone(), true));

        let partial = LENGTH_PREFIX_LEN + 10;
        assert!(buffer.push(&wire[..partial]).unwrap().is_empty());
        assert_eq!(buffer.state_name(), "WaitingForFrame");

        let frames = buffer.push(&wire[partial..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_payload_frame().unwrap().payload(), payload);
        assert_eq!(buffer.state_name(), "WaitingForLength");
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut buffer = FrameBuffer::new();
        let wire = encode_length_prefixed(&Frame::request_response(7, Payload::from("hi")));

        let mut all = Vec::new();
        for byte in wire.iter() {
            all.extend(buffer.push(&[*byte]).unwrap());
        }

        assert_eq!(all, vec![Frame::request_response(7, Payload::from("hi"))]);
    }

    #[test]
    fn test_max_frame_size_validation() {
        let mut buffer = FrameBuffer::with_max_frame_size(100);

        let result = buffer.push(&length_prefix(1000));

        assert!(matches!(result, Err(RSocketError::MalformedFrame(_))));
        assert!(result.unwrap_err().to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_length_smaller_than_header() {
        let mut buffer = FrameBuffer::new();
        assert!(buffer.push(&[0, 0, 2, 0, 0]).is_err());
    }

    #[test]
    fn test_undecodable_frame_is_malformed() {
        let mut buffer = FrameBuffer::new();
        let mut wire = length_prefix(HEADER_LEN).to_vec();
        // RESUME_OK type
        wire.extend_from_slice(&[0, 0, 0, 0, 0x0E << 2, 0]);
        assert!(matches!(
            buffer.push(&wire),
            Err(RSocketError::MalformedFrame(_))
        ));
    }
}
