//! Typed frames and their body layouts.
//!
//! Every frame is a 6-byte [`FrameHeader`] followed by a type-specific body:
//!
//! | Type | Fixed fields | Variable part |
//! |---|---|---|
//! | SETUP | version, keepalive, lifetime, [token], mime types | [metadata] + data |
//! | LEASE | ttl, number of requests | metadata (rest of frame) |
//! | KEEPALIVE | last received position | data |
//! | REQUEST_RESPONSE / REQUEST_FNF / PAYLOAD | none | [metadata] + data |
//! | REQUEST_STREAM / REQUEST_CHANNEL | initial request-N | [metadata] + data |
//! | REQUEST_N | request-N | none |
//! | CANCEL | none | none |
//! | ERROR | error code | message |
//! | METADATA_PUSH | none | metadata (rest of frame) |
//!
//! `[metadata]` is a 24-bit length followed by that many bytes, present only
//! when the METADATA flag is set.
//!
//! # Example
//!
//! ```
//! use rsocket_mux::frame::Frame;
//! use rsocket_mux::Payload;
//!
//! let frame = Frame::request_stream(1, 8, Payload::with_metadata("data", "md"));
//! let bytes = frame.encode();
//! let decoded = Frame::decode(bytes).unwrap();
//! assert_eq!(decoded, frame);
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::header::{flags, put_u24, read_u24, FrameHeader, FrameType, HEADER_LEN, MAX_U24};
use crate::error::{ErrorCode, RSocketError, Result};
use crate::payload::Payload;

/// Protocol version sent in SETUP.
pub const VERSION_MAJOR: u16 = 1;
pub const VERSION_MINOR: u16 = 0;

/// Body shared by REQUEST_RESPONSE, REQUEST_FNF, REQUEST_STREAM,
/// REQUEST_CHANNEL and PAYLOAD.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadFrame {
    pub header: FrameHeader,
    /// Present for REQUEST_STREAM and REQUEST_CHANNEL.
    pub initial_request_n: Option<u32>,
    pub metadata: Option<Bytes>,
    pub data: Bytes,
}

impl PayloadFrame {
    /// Build a payload-carrying frame. The METADATA flag follows `payload.metadata`.
    pub fn new(
        stream_id: u32,
        frame_type: FrameType,
        frame_flags: u16,
        initial_request_n: Option<u32>,
        payload: Payload,
    ) -> Self {
        let mut frame_flags = frame_flags & !flags::METADATA;
        if payload.metadata.is_some() {
            frame_flags |= flags::METADATA;
        }
        let initial_request_n = if frame_type.has_initial_request_n() {
            Some(initial_request_n.unwrap_or(0))
        } else {
            None
        };
        Self {
            header: FrameHeader::new(stream_id, frame_type, frame_flags),
            initial_request_n,
            metadata: payload.metadata,
            data: payload.data,
        }
    }

    #[inline]
    pub fn stream_id(&self) -> u32 {
        self.header.stream_id
    }

    /// Copy out the payload (cheap, `Bytes` clones).
    pub fn payload(&self) -> Payload {
        Payload::new(self.data.clone(), self.metadata.clone())
    }

    pub fn into_payload(self) -> Payload {
        Payload::new(self.data, self.metadata)
    }

    /// Size of the encoded frame including the header.
    pub fn encoded_len(&self) -> usize {
        let mut len = HEADER_LEN + self.data.len();
        if self.initial_request_n.is_some() {
            len += 4;
        }
        if self.header.has_metadata() {
            len += 3 + self.metadata.as_ref().map_or(0, |m| m.len());
        }
        len
    }

    /// Wrap into the `Frame` variant matching the header's type.
    pub fn into_frame(self) -> Frame {
        match self.header.frame_type {
            FrameType::RequestResponse => Frame::RequestResponse(self),
            FrameType::RequestFnf => Frame::RequestFnf(self),
            FrameType::RequestStream => Frame::RequestStream(self),
            FrameType::RequestChannel => Frame::RequestChannel(self),
            _ => Frame::Payload(self),
        }
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        if let Some(n) = self.initial_request_n {
            buf.put_u32(n);
        }
        if self.header.has_metadata() {
            let metadata = self.metadata.as_deref().unwrap_or(&[]);
            put_u24(buf, metadata.len());
            buf.extend_from_slice(metadata);
        }
        buf.extend_from_slice(&self.data);
    }

    fn decode(header: FrameHeader, mut body: Bytes) -> Result<Self> {
        let initial_request_n = if header.frame_type.has_initial_request_n() {
            need(&body, 4, "initial request-N")?;
            Some(body.get_u32())
        } else {
            None
        };
        let (metadata, data) = decode_metadata_and_data(&header, body)?;
        Ok(Self {
            header,
            initial_request_n,
            metadata,
            data,
        })
    }
}

/// SETUP: first frame a client sends on a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupFrame {
    pub header: FrameHeader,
    pub major_version: u16,
    pub minor_version: u16,
    pub keepalive_interval_ms: u32,
    pub max_lifetime_ms: u32,
    pub resume_token: Option<Bytes>,
    pub metadata_mime_type: String,
    pub data_mime_type: String,
    pub metadata: Option<Bytes>,
    pub data: Bytes,
}

impl SetupFrame {
    pub fn new(
        keepalive_interval_ms: u32,
        max_lifetime_ms: u32,
        metadata_mime_type: impl Into<String>,
        data_mime_type: impl Into<String>,
        payload: Payload,
    ) -> Self {
        let frame_flags = if payload.metadata.is_some() {
            flags::METADATA
        } else {
            0
        };
        Self {
            header: FrameHeader::new(0, FrameType::Setup, frame_flags),
            major_version: VERSION_MAJOR,
            minor_version: VERSION_MINOR,
            keepalive_interval_ms,
            max_lifetime_ms,
            resume_token: None,
            metadata_mime_type: metadata_mime_type.into(),
            data_mime_type: data_mime_type.into(),
            metadata: payload.metadata,
            data: payload.data,
        }
    }

    pub fn payload(&self) -> Payload {
        Payload::new(self.data.clone(), self.metadata.clone())
    }

    fn encoded_len(&self) -> usize {
        let mut len = HEADER_LEN + 12;
        if let Some(token) = &self.resume_token {
            len += 2 + token.len();
        }
        len += 1 + self.metadata_mime_type.len() + 1 + self.data_mime_type.len();
        if self.header.has_metadata() {
            len += 3 + self.metadata.as_ref().map_or(0, |m| m.len());
        }
        len + self.data.len()
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_u16(self.major_version);
        buf.put_u16(self.minor_version);
        buf.put_u32(self.keepalive_interval_ms);
        buf.put_u32(self.max_lifetime_ms);
        if let Some(token) = &self.resume_token {
            buf.put_u16(token.len() as u16);
            buf.extend_from_slice(token);
        }
        buf.put_u8(self.metadata_mime_type.len() as u8);
        buf.extend_from_slice(self.metadata_mime_type.as_bytes());
        buf.put_u8(self.data_mime_type.len() as u8);
        buf.extend_from_slice(self.data_mime_type.as_bytes());
        if self.header.has_metadata() {
            let metadata = self.metadata.as_deref().unwrap_or(&[]);
            put_u24(buf, metadata.len());
            buf.extend_from_slice(metadata);
        }
        buf.extend_from_slice(&self.data);
    }

    fn decode(header: FrameHeader, mut body: Bytes) -> Result<Self> {
        need(&body, 12, "setup fixed fields")?;
        let major_version = body.get_u16();
        let minor_version = body.get_u16();
        let keepalive_interval_ms = body.get_u32();
        let max_lifetime_ms = body.get_u32();
        let resume_token = if header.has(flags::RESUME_ENABLE) {
            need(&body, 2, "resume token length")?;
            let len = body.get_u16() as usize;
            need(&body, len, "resume token")?;
            Some(body.split_to(len))
        } else {
            None
        };
        let metadata_mime_type = decode_mime(&mut body)?;
        let data_mime_type = decode_mime(&mut body)?;
        let (metadata, data) = decode_metadata_and_data(&header, body)?;
        Ok(Self {
            header,
            major_version,
            minor_version,
            keepalive_interval_ms,
            max_lifetime_ms,
            resume_token,
            metadata_mime_type,
            data_mime_type,
            metadata,
            data,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseFrame {
    pub header: FrameHeader,
    pub ttl_ms: u32,
    pub number_of_requests: u32,
    pub metadata: Option<Bytes>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepaliveFrame {
    pub header: FrameHeader,
    pub last_received_position: u64,
    pub data: Bytes,
}

impl KeepaliveFrame {
    /// Whether the peer asked for an answer.
    #[inline]
    pub fn respond(&self) -> bool {
        self.header.has(flags::RESPOND)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestNFrame {
    pub header: FrameHeader,
    pub n: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorFrame {
    pub header: FrameHeader,
    pub code: ErrorCode,
    pub message: Bytes,
}

impl ErrorFrame {
    pub fn message_utf8(&self) -> String {
        String::from_utf8_lossy(&self.message).into_owned()
    }

    /// Convert into the error delivered to the local caller.
    pub fn into_error(self) -> RSocketError {
        RSocketError::Application {
            code: self.code,
            message: self.message_utf8(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataPushFrame {
    pub header: FrameHeader,
    pub metadata: Bytes,
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Setup(SetupFrame),
    Lease(LeaseFrame),
    Keepalive(KeepaliveFrame),
    RequestResponse(PayloadFrame),
    RequestFnf(PayloadFrame),
    RequestStream(PayloadFrame),
    RequestChannel(PayloadFrame),
    RequestN(RequestNFrame),
    Cancel(FrameHeader),
    Payload(PayloadFrame),
    Error(ErrorFrame),
    MetadataPush(MetadataPushFrame),
}

impl Frame {
    pub fn request_response(stream_id: u32, payload: Payload) -> Self {
        Frame::RequestResponse(PayloadFrame::new(
            stream_id,
            FrameType::RequestResponse,
            0,
            None,
            payload,
        ))
    }

    pub fn request_fnf(stream_id: u32, payload: Payload) -> Self {
        Frame::RequestFnf(PayloadFrame::new(
            stream_id,
            FrameType::RequestFnf,
            0,
            None,
            payload,
        ))
    }

    pub fn request_stream(stream_id: u32, initial_request_n: u32, payload: Payload) -> Self {
        Frame::RequestStream(PayloadFrame::new(
            stream_id,
            FrameType::RequestStream,
            0,
            Some(initial_request_n),
            payload,
        ))
    }

    /// REQUEST_CHANNEL; `complete` marks an outbound leg that has nothing more to send.
    pub fn request_channel(
        stream_id: u32,
        initial_request_n: u32,
        payload: Payload,
        complete: bool,
    ) -> Self {
        let frame_flags = if complete { flags::COMPLETE } else { 0 };
        Frame::RequestChannel(PayloadFrame::new(
            stream_id,
            FrameType::RequestChannel,
            frame_flags,
            Some(initial_request_n),
            payload,
        ))
    }

    /// PAYLOAD with NEXT, optionally also COMPLETE.
    pub fn next(stream_id: u32, payload: Payload, complete: bool) -> Self {
        let mut frame_flags = flags::NEXT;
        if complete {
            frame_flags |= flags::COMPLETE;
        }
        Frame::Payload(PayloadFrame::new(
            stream_id,
            FrameType::Payload,
            frame_flags,
            None,
            payload,
        ))
    }

    /// PAYLOAD with only COMPLETE.
    pub fn complete(stream_id: u32) -> Self {
        Frame::Payload(PayloadFrame::new(
            stream_id,
            FrameType::Payload,
            flags::COMPLETE,
            None,
            Payload::default(),
        ))
    }

    pub fn request_n(stream_id: u32, n: u32) -> Self {
        Frame::RequestN(RequestNFrame {
            header: FrameHeader::new(stream_id, FrameType::RequestN, 0),
            n,
        })
    }

    pub fn cancel(stream_id: u32) -> Self {
        Frame::Cancel(FrameHeader::new(stream_id, FrameType::Cancel, 0))
    }

    pub fn error(stream_id: u32, code: ErrorCode, message: impl Into<String>) -> Self {
        Frame::Error(ErrorFrame {
            header: FrameHeader::new(stream_id, FrameType::Error, 0),
            code,
            message: Bytes::from(message.into()),
        })
    }

    /// ERROR frame describing a local failure.
    pub fn from_error(stream_id: u32, err: &RSocketError) -> Self {
        let (code, message) = err.to_wire();
        Frame::error(stream_id, code, message)
    }

    pub fn keepalive(respond: bool, last_received_position: u64, data: Bytes) -> Self {
        let frame_flags = if respond { flags::RESPOND } else { 0 };
        Frame::Keepalive(KeepaliveFrame {
            header: FrameHeader::new(0, FrameType::Keepalive, frame_flags),
            last_received_position,
            data,
        })
    }

    pub fn metadata_push(metadata: Bytes) -> Self {
        Frame::MetadataPush(MetadataPushFrame {
            header: FrameHeader::new(0, FrameType::MetadataPush, flags::METADATA),
            metadata,
        })
    }

    pub fn lease(ttl_ms: u32, number_of_requests: u32, metadata: Option<Bytes>) -> Self {
        let frame_flags = if metadata.is_some() { flags::METADATA } else { 0 };
        Frame::Lease(LeaseFrame {
            header: FrameHeader::new(0, FrameType::Lease, frame_flags),
            ttl_ms,
            number_of_requests,
            metadata,
        })
    }

    /// Get the header.
    pub fn header(&self) -> &FrameHeader {
        match self {
            Frame::Setup(f) => &f.header,
            Frame::Lease(f) => &f.header,
            Frame::Keepalive(f) => &f.header,
            Frame::RequestResponse(f)
            | Frame::RequestFnf(f)
            | Frame::RequestStream(f)
            | Frame::RequestChannel(f)
            | Frame::Payload(f) => &f.header,
            Frame::RequestN(f) => &f.header,
            Frame::Cancel(h) => h,
            Frame::Error(f) => &f.header,
            Frame::MetadataPush(f) => &f.header,
        }
    }

    #[inline]
    pub fn stream_id(&self) -> u32 {
        self.header().stream_id
    }

    #[inline]
    pub fn frame_type(&self) -> FrameType {
        self.header().frame_type
    }

    /// Borrow the payload-carrying body, if this frame has one.
    pub fn as_payload_frame(&self) -> Option<&PayloadFrame> {
        match self {
            Frame::RequestResponse(f)
            | Frame::RequestFnf(f)
            | Frame::RequestStream(f)
            | Frame::RequestChannel(f)
            | Frame::Payload(f) => Some(f),
            _ => None,
        }
    }

    /// Size of the encoded frame including the header.
    pub fn encoded_len(&self) -> usize {
        match self {
            Frame::Setup(f) => f.encoded_len(),
            Frame::Lease(f) => HEADER_LEN + 8 + f.metadata.as_ref().map_or(0, |m| m.len()),
            Frame::Keepalive(f) => HEADER_LEN + 8 + f.data.len(),
            Frame::RequestResponse(f)
            | Frame::RequestFnf(f)
            | Frame::RequestStream(f)
            | Frame::RequestChannel(f)
            | Frame::Payload(f) => f.encoded_len(),
            Frame::RequestN(_) => HEADER_LEN + 4,
            Frame::Cancel(_) => HEADER_LEN,
            Frame::Error(f) => HEADER_LEN + 4 + f.message.len(),
            Frame::MetadataPush(f) => HEADER_LEN + f.metadata.len(),
        }
    }

    /// Encode to a contiguous buffer (without the transport length prefix).
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.extend_from_slice(&self.header().encode());
        match self {
            Frame::Setup(f) => f.encode_body(&mut buf),
            Frame::Lease(f) => {
                buf.put_u32(f.ttl_ms);
                buf.put_u32(f.number_of_requests);
                if let Some(metadata) = &f.metadata {
                    buf.extend_from_slice(metadata);
                }
            }
            Frame::Keepalive(f) => {
                buf.put_u64(f.last_received_position);
                buf.extend_from_slice(&f.data);
            }
            Frame::RequestResponse(f)
            | Frame::RequestFnf(f)
            | Frame::RequestStream(f)
            | Frame::RequestChannel(f)
            | Frame::Payload(f) => f.encode_body(&mut buf),
            Frame::RequestN(f) => buf.put_u32(f.n),
            Frame::Cancel(_) => {}
            Frame::Error(f) => {
                buf.put_u32(f.code.0);
                buf.extend_from_slice(&f.message);
            }
            Frame::MetadataPush(f) => buf.extend_from_slice(&f.metadata),
        }
        buf.freeze()
    }

    /// Decode one frame occupying all of `bytes`.
    ///
    /// Fails with `MalformedFrame` if the header is invalid or the body is
    /// shorter than its fixed fields or declared metadata length.
    pub fn decode(mut bytes: Bytes) -> Result<Frame> {
        let header = FrameHeader::decode(&bytes)?;
        bytes.advance(HEADER_LEN);
        let mut body = bytes;

        let frame = match header.frame_type {
            FrameType::Setup => Frame::Setup(SetupFrame::decode(header, body)?),
            FrameType::Lease => {
                need(&body, 8, "lease fields")?;
                let ttl_ms = body.get_u32();
                let number_of_requests = body.get_u32();
                let metadata = if header.has_metadata() { Some(body) } else { None };
                Frame::Lease(LeaseFrame {
                    header,
                    ttl_ms,
                    number_of_requests,
                    metadata,
                })
            }
            FrameType::Keepalive => {
                need(&body, 8, "keepalive position")?;
                let last_received_position = body.get_u64();
                Frame::Keepalive(KeepaliveFrame {
                    header,
                    last_received_position,
                    data: body,
                })
            }
            FrameType::RequestResponse
            | FrameType::RequestFnf
            | FrameType::RequestStream
            | FrameType::RequestChannel
            | FrameType::Payload => PayloadFrame::decode(header, body)?.into_frame(),
            FrameType::RequestN => {
                need(&body, 4, "request-N")?;
                Frame::RequestN(RequestNFrame {
                    header,
                    n: body.get_u32(),
                })
            }
            FrameType::Cancel => Frame::Cancel(header),
            FrameType::Error => {
                need(&body, 4, "error code")?;
                let code = ErrorCode(body.get_u32());
                Frame::Error(ErrorFrame {
                    header,
                    code,
                    message: body,
                })
            }
            FrameType::MetadataPush => Frame::MetadataPush(MetadataPushFrame {
                header,
                metadata: body,
            }),
        };
        Ok(frame)
    }
}

fn need(body: &Bytes, len: usize, what: &str) -> Result<()> {
    if body.len() < len {
        return Err(RSocketError::MalformedFrame(format!(
            "truncated {}: need {} bytes, have {}",
            what,
            len,
            body.len()
        )));
    }
    Ok(())
}

fn decode_metadata_and_data(header: &FrameHeader, mut body: Bytes) -> Result<(Option<Bytes>, Bytes)> {
    if !header.has_metadata() {
        return Ok((None, body));
    }
    need(&body, 3, "metadata length")?;
    let len = read_u24(&body[..3]);
    debug_assert!(len <= MAX_U24);
    body.advance(3);
    need(&body, len, "metadata")?;
    let metadata = body.split_to(len);
    Ok((Some(metadata), body))
}

fn decode_mime(body: &mut Bytes) -> Result<String> {
    need(body, 1, "mime type length")?;
    let len = body.get_u8() as usize;
    need(body, len, "mime type")?;
    let raw = body.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|_| RSocketError::MalformedFrame("mime type is not UTF-8".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: Frame) -> Frame {
        let bytes = frame.encode();
        assert_eq!(bytes.len(), frame.encoded_len());
        Frame::decode(bytes).unwrap()
    }

    #[test]
    fn test_request_stream_layout() {
        let frame = Frame::request_stream(5, 16, Payload::with_metadata("abc", "m"));
        let bytes = frame.encode();

        // header
        assert_eq!(&bytes[0..4], &[0, 0, 0, 5]);
        let type_and_flags = u16::from_be_bytes([bytes[4], bytes[5]]);
        assert_eq!(type_and_flags >> 10, FrameType::RequestStream as u16);
        assert_eq!(type_and_flags & flags::MASK, flags::METADATA);
        // initial request-N sits before the metadata length
        assert_eq!(&bytes[6..10], &[0, 0, 0, 16]);
        assert_eq!(&bytes[10..13], &[0, 0, 1]);
        assert_eq!(&bytes[13..14], b"m");
        assert_eq!(&bytes[14..], b"abc");

        assert_eq!(Frame::decode(bytes).unwrap(), frame);
    }

    #[test]
    fn test_payload_without_metadata_has_no_length_field() {
        let frame = Frame::next(3, Payload::from_data("xyz"), true);
        let bytes = frame.encode();
        assert_eq!(bytes.len(), HEADER_LEN + 3);
        let decoded = roundtrip(frame);
        let Frame::Payload(p) = decoded else {
            panic!("expected PAYLOAD");
        };
        assert!(p.metadata.is_none());
        assert!(p.header.has_next());
        assert!(p.header.has_complete());
    }

    #[test]
    fn test_empty_metadata_is_distinct_from_absent() {
        let frame = Frame::request_response(1, Payload::with_metadata("d", Bytes::new()));
        let Frame::RequestResponse(p) = roundtrip(frame) else {
            panic!("expected REQUEST_RESPONSE");
        };
        assert_eq!(p.metadata, Some(Bytes::new()));
    }

    #[test]
    fn test_error_frame() {
        let frame = Frame::error(9, ErrorCode::APPLICATION_ERROR, "boom");
        let Frame::Error(e) = roundtrip(frame) else {
            panic!("expected ERROR");
        };
        assert_eq!(e.code, ErrorCode::APPLICATION_ERROR);
        assert_eq!(e.message_utf8(), "boom");
        assert!(matches!(
            e.into_error(),
            RSocketError::Application { code: ErrorCode::APPLICATION_ERROR, .. }
        ));
    }

    #[test]
    fn test_control_frames_roundtrip() {
        for frame in [
            Frame::request_n(7, 128),
            Frame::cancel(7),
            Frame::keepalive(true, 42, Bytes::from_static(b"ping")),
            Frame::metadata_push(Bytes::from_static(b"route")),
            Frame::lease(1000, 5, Some(Bytes::from_static(b"lm"))),
            Frame::request_fnf(11, Payload::from_data("fire")),
            Frame::request_channel(13, u32::MAX >> 1, Payload::from_data("c"), true),
        ] {
            assert_eq!(roundtrip(frame.clone()), frame);
        }
    }

    #[test]
    fn test_setup_roundtrip() {
        let setup = SetupFrame::new(
            20_000,
            90_000,
            "application/json",
            "application/binary",
            Payload::with_metadata("hello", "auth"),
        );
        let decoded = roundtrip(Frame::Setup(setup.clone()));
        assert_eq!(decoded, Frame::Setup(setup));
    }

    #[test]
    fn test_truncated_bodies_are_malformed() {
        let bytes = Frame::request_n(1, 5).encode();
        assert!(matches!(
            Frame::decode(bytes.slice(..HEADER_LEN + 2)),
            Err(RSocketError::MalformedFrame(_))
        ));

        // metadata length claims more than is present
        let mut raw = BytesMut::new();
        raw.extend_from_slice(
            &FrameHeader::new(1, FrameType::Payload, flags::METADATA | flags::NEXT).encode(),
        );
        put_u24(&mut raw, 100);
        raw.extend_from_slice(b"short");
        assert!(matches!(
            Frame::decode(raw.freeze()),
            Err(RSocketError::MalformedFrame(_))
        ));

        assert!(Frame::decode(Bytes::from_static(&[0, 0, 0])).is_err());
    }
}
