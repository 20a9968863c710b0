//! Error types for rsocket-mux.

use std::fmt;

use thiserror::Error;

use crate::frame::Frame;

/// RSocket error code carried by ERROR frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode(pub u32);

impl ErrorCode {
    pub const INVALID_SETUP: ErrorCode = ErrorCode(0x0000_0001);
    pub const UNSUPPORTED_SETUP: ErrorCode = ErrorCode(0x0000_0002);
    pub const REJECTED_SETUP: ErrorCode = ErrorCode(0x0000_0003);
    pub const REJECTED_RESUME: ErrorCode = ErrorCode(0x0000_0004);
    pub const CONNECTION_ERROR: ErrorCode = ErrorCode(0x0000_0101);
    pub const CONNECTION_CLOSE: ErrorCode = ErrorCode(0x0000_0102);
    pub const APPLICATION_ERROR: ErrorCode = ErrorCode(0x0000_0201);
    pub const REJECTED: ErrorCode = ErrorCode(0x0000_0202);
    pub const CANCELED: ErrorCode = ErrorCode(0x0000_0203);
    pub const INVALID: ErrorCode = ErrorCode(0x0000_0204);

    /// Human readable name, `None` for codes outside the reserved table.
    pub fn name(&self) -> Option<&'static str> {
        let name = match *self {
            Self::INVALID_SETUP => "INVALID_SETUP",
            Self::UNSUPPORTED_SETUP => "UNSUPPORTED_SETUP",
            Self::REJECTED_SETUP => "REJECTED_SETUP",
            Self::REJECTED_RESUME => "REJECTED_RESUME",
            Self::CONNECTION_ERROR => "CONNECTION_ERROR",
            Self::CONNECTION_CLOSE => "CONNECTION_CLOSE",
            Self::APPLICATION_ERROR => "APPLICATION_ERROR",
            Self::REJECTED => "REJECTED",
            Self::CANCELED => "CANCELED",
            Self::INVALID => "INVALID",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{}", name),
            None => write!(f, "0x{:08X}", self.0),
        }
    }
}

/// Main error type for all rsocket-mux operations.
#[derive(Debug, Error)]
pub enum RSocketError {
    /// I/O error on the underlying connection.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error while loading configuration.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Frame could not be decoded (bad length, unknown type, truncated body).
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Fragment unit outside `min..=max`.
    #[error("Invalid fragment size {size}, expected {min}..={max}")]
    InvalidFragmentSize { size: usize, min: usize, max: usize },

    /// Application-level failure, locally produced or received in an ERROR frame.
    #[error("{code}: {message}")]
    Application { code: ErrorCode, message: String },

    /// Connection closed while the operation was in flight.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The pool has no active member.
    #[error("No available connection")]
    NoAvailableConnection,

    /// The pool was given too few targets (two to start, one to rebalance).
    #[error("Insufficient targets: got {0}")]
    InsufficientTargets(usize),

    /// Encoded frame does not fit the 24-bit length prefix.
    #[error("Frame too large: {size} bytes, limit {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// Closing the pool failed for this many members.
    #[error("Failed to close {0} connections")]
    CloseFailed(usize),

    /// Write queue stayed full past the configured timeout.
    #[error("Backpressure timeout")]
    BackpressureTimeout,

    /// Target URI could not be parsed.
    #[error("Invalid URI: {0}")]
    InvalidUri(String),

    /// The operation was cancelled locally.
    #[error("Cancelled")]
    Cancelled,
}

impl RSocketError {
    /// Application error with `APPLICATION_ERROR` code.
    pub fn application(message: impl Into<String>) -> Self {
        RSocketError::Application {
            code: ErrorCode::APPLICATION_ERROR,
            message: message.into(),
        }
    }

    /// Code and message to put on the wire for this error.
    pub fn to_wire(&self) -> (ErrorCode, String) {
        match self {
            RSocketError::Application { code, message } => (*code, message.clone()),
            RSocketError::Cancelled => (ErrorCode::CANCELED, self.to_string()),
            other => (ErrorCode::APPLICATION_ERROR, other.to_string()),
        }
    }

    /// Outbound ERROR frame reporting this error on `stream_id`.
    pub fn to_error_frame(&self, stream_id: u32) -> Frame {
        Frame::from_error(stream_id, self)
    }

    /// Whether the error tears the whole connection down.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            RSocketError::Io(_) | RSocketError::MalformedFrame(_) | RSocketError::ConnectionClosed
        )
    }
}

/// Result type alias using RSocketError.
pub type Result<T> = std::result::Result<T, RSocketError>;
