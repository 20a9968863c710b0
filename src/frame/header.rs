//! Frame header encoding and decoding.
//!
//! Implements the 6-byte RSocket header:
//! ```text
//! ┌─┬────────────────────────────┬────────────┬──────────┐
//! │I│ Stream ID                  │ Frame Type │ Flags    │
//! │ │ 31 bits                    │ 6 bits     │ 10 bits  │
//! └─┴────────────────────────────┴────────────┴──────────┘
//! ```
//!
//! All multi-byte integers are Big Endian.

use crate::error::{RSocketError, Result};

/// Header size in bytes (fixed, exactly 6).
pub const HEADER_LEN: usize = 6;

/// Largest value a 24-bit length field can carry.
pub const MAX_U24: usize = 0x00FF_FFFF;

/// Largest valid stream id (31 bits).
pub const MAX_STREAM_ID: u32 = 0x7FFF_FFFF;

/// Request-N at or above this value means "unbounded".
pub const MAX_REQUEST_N: u32 = 0x7FFF_FFFF;

/// Frame types supported by the codec.
///
/// RESUME, RESUME_OK and EXT are not part of this implementation and
/// decode as malformed frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Setup = 0x01,
    Lease = 0x02,
    Keepalive = 0x03,
    RequestResponse = 0x04,
    RequestFnf = 0x05,
    RequestStream = 0x06,
    RequestChannel = 0x07,
    RequestN = 0x08,
    Cancel = 0x09,
    Payload = 0x0A,
    Error = 0x0B,
    MetadataPush = 0x0C,
}

impl FrameType {
    /// Map a raw 6-bit type to a known frame type.
    pub fn from_u8(raw: u8) -> Option<Self> {
        let ty = match raw {
            0x01 => FrameType::Setup,
            0x02 => FrameType::Lease,
            0x03 => FrameType::Keepalive,
            0x04 => FrameType::RequestResponse,
            0x05 => FrameType::RequestFnf,
            0x06 => FrameType::RequestStream,
            0x07 => FrameType::RequestChannel,
            0x08 => FrameType::RequestN,
            0x09 => FrameType::Cancel,
            0x0A => FrameType::Payload,
            0x0B => FrameType::Error,
            0x0C => FrameType::MetadataPush,
            _ => return None,
        };
        Some(ty)
    }

    /// Whether the body starts with a 4-byte initial request-N.
    #[inline]
    pub fn has_initial_request_n(self) -> bool {
        matches!(self, FrameType::RequestStream | FrameType::RequestChannel)
    }

    /// Whether frames of this type may be fragmented.
    #[inline]
    pub fn is_fragmentable(self) -> bool {
        matches!(
            self,
            FrameType::RequestResponse
                | FrameType::RequestFnf
                | FrameType::RequestStream
                | FrameType::RequestChannel
                | FrameType::Payload
        )
    }
}

/// Flag constants (10 bits).
pub mod flags {
    /// Frame may be ignored if not understood.
    pub const IGNORE: u16 = 0x200;
    /// Metadata present.
    pub const METADATA: u16 = 0x100;
    /// More fragments follow.
    pub const FOLLOWS: u16 = 0x80;
    /// Stream completed.
    pub const COMPLETE: u16 = 0x40;
    /// Payload carries a value.
    pub const NEXT: u16 = 0x20;

    /// KEEPALIVE: peer must answer.
    pub const RESPOND: u16 = 0x80;
    /// SETUP: resume token present.
    pub const RESUME_ENABLE: u16 = 0x80;
    /// SETUP: lease will be honored.
    pub const LEASE: u16 = 0x40;

    /// All valid flag bits.
    pub const MASK: u16 = 0x3FF;

    /// Check if a specific flag is set.
    #[inline]
    pub fn has_flag(flags: u16, flag: u16) -> bool {
        flags & flag != 0
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Stream id (0 for connection-level frames).
    pub stream_id: u32,
    /// Frame type.
    pub frame_type: FrameType,
    /// Flags (see `flags` module).
    pub flags: u16,
}

impl FrameHeader {
    /// Create a new header. Out-of-range bits are masked off.
    pub fn new(stream_id: u32, frame_type: FrameType, flags: u16) -> Self {
        Self {
            stream_id: stream_id & MAX_STREAM_ID,
            frame_type,
            flags: flags & flags::MASK,
        }
    }

    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use rsocket_mux::frame::{flags, FrameHeader, FrameType};
    ///
    /// let header = FrameHeader::new(1, FrameType::Payload, flags::NEXT);
    /// let bytes = header.encode();
    /// assert_eq!(bytes, [0, 0, 0, 1, 0x28, 0x20]);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&(self.stream_id & MAX_STREAM_ID).to_be_bytes());
        let type_and_flags = ((self.frame_type as u16) << 10) | (self.flags & flags::MASK);
        buf[4..6].copy_from_slice(&type_and_flags.to_be_bytes());
        buf
    }

    /// Decode header from bytes (Big Endian).
    ///
    /// Fails with `MalformedFrame` if the buffer is too short or the type is
    /// unknown. The reserved high bit of the stream id is ignored.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(RSocketError::MalformedFrame(format!(
                "frame too short: {} bytes",
                buf.len()
            )));
        }
        let stream_id = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) & MAX_STREAM_ID;
        let type_and_flags = u16::from_be_bytes([buf[4], buf[5]]);
        let raw_type = (type_and_flags >> 10) as u8;
        let frame_type = FrameType::from_u8(raw_type).ok_or_else(|| {
            RSocketError::MalformedFrame(format!("unsupported frame type 0x{:02X}", raw_type))
        })?;
        Ok(Self {
            stream_id,
            frame_type,
            flags: type_and_flags & flags::MASK,
        })
    }

    /// Check a flag.
    #[inline]
    pub fn has(&self, flag: u16) -> bool {
        flags::has_flag(self.flags, flag)
    }

    #[inline]
    pub fn has_metadata(&self) -> bool {
        self.has(flags::METADATA)
    }

    #[inline]
    pub fn has_follows(&self) -> bool {
        self.has(flags::FOLLOWS)
    }

    #[inline]
    pub fn has_complete(&self) -> bool {
        self.has(flags::COMPLETE)
    }

    #[inline]
    pub fn has_next(&self) -> bool {
        self.has(flags::NEXT)
    }
}

/// Append a 24-bit big-endian integer.
#[inline]
pub fn put_u24(buf: &mut bytes::BytesMut, value: usize) {
    debug_assert!(value <= MAX_U24);
    buf.extend_from_slice(&[(value >> 16) as u8, (value >> 8) as u8, value as u8]);
}

/// Read a 24-bit big-endian integer from the first three bytes.
#[inline]
pub fn read_u24(buf: &[u8]) -> usize {
    ((buf[0] as usize) << 16) | ((buf[1] as usize) << 8) | buf[2] as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_header() {
        let header = FrameHeader::new(
            42,
            FrameType::RequestStream,
            flags::METADATA | flags::FOLLOWS,
        );
        let bytes = header.encode();
        let decoded = FrameHeader::decode(&bytes).unwrap();
        assert_eq!(decoded, header);
        assert!(decoded.has_metadata());
        assert!(decoded.has_follows());
        assert!(!decoded.has_complete());
    }

    #[test]
    fn test_reserved_bit_ignored() {
        let mut bytes = FrameHeader::new(7, FrameType::Cancel, 0).encode();
        bytes[0] |= 0x80;
        let decoded = FrameHeader::decode(&bytes).unwrap();
        assert_eq!(decoded.stream_id, 7);
    }

    #[test]
    fn test_decode_too_short() {
        let result = FrameHeader::decode(&[0, 0, 0, 1, 0x28]);
        assert!(matches!(result, Err(RSocketError::MalformedFrame(_))));
    }

    #[test]
    fn test_decode_unsupported_type() {
        // RESUME (0x0D)
        let bytes = [0, 0, 0, 0, 0x0D << 2, 0];
        assert!(matches!(
            FrameHeader::decode(&bytes),
            Err(RSocketError::MalformedFrame(_))
        ));
        // type 0 is reserved
        assert!(FrameHeader::decode(&[0, 0, 0, 0, 0, 0]).is_err());
    }

    #[test]
    fn test_flags_masked() {
        let header = FrameHeader::new(1, FrameType::Payload, 0xFFFF);
        assert_eq!(header.flags, flags::MASK);
        assert_eq!(FrameHeader::decode(&header.encode()).unwrap().frame_type, FrameType::Payload);
    }

    #[test]
    fn test_u24_roundtrip_bounds() {
        let mut buf = bytes::BytesMut::new();
        put_u24(&mut buf, MAX_U24);
        put_u24(&mut buf, 0);
        put_u24(&mut buf, 300);
        assert_eq!(read_u24(&buf[0..3]), MAX_U24);
        assert_eq!(read_u24(&buf[3..6]), 0);
        assert_eq!(read_u24(&buf[6..9]), 300);
    }

    #[test]
    fn test_fragmentable_types() {
        assert!(FrameType::Payload.is_fragmentable());
        assert!(FrameType::RequestChannel.is_fragmentable());
        assert!(!FrameType::RequestN.is_fragmentable());
        assert!(FrameType::RequestStream.has_initial_request_n());
        assert!(!FrameType::RequestResponse.has_initial_request_n());
    }
}
