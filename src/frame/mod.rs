//! Frame codec - wire header, typed frames, and stream framing.
//!
//! - 6-byte header encoding/decoding
//! - Typed frame bodies with `encode`/`decode`
//! - Frame buffer for 24-bit length-prefixed byte streams

mod body;
mod frame_buffer;
mod header;

pub use body::{
    ErrorFrame, Frame, KeepaliveFrame, LeaseFrame, MetadataPushFrame, PayloadFrame,
    RequestNFrame, SetupFrame, VERSION_MAJOR, VERSION_MINOR,
};
pub use frame_buffer::{encode_length_prefixed, length_prefix, FrameBuffer, LENGTH_PREFIX_LEN};
pub use header::{
    flags, put_u24, read_u24, FrameHeader, FrameType, HEADER_LEN, MAX_REQUEST_N, MAX_STREAM_ID,
    MAX_U24,
};
