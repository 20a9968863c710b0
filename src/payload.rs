//! Application payload: data plus optional metadata.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::MsgPackCodec;
use crate::error::Result;

/// A unit of application data exchanged on a stream.
///
/// Both parts are reference-counted `Bytes`, so forwarding a payload into an
/// outbound frame never copies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    /// Data bytes.
    pub data: Bytes,
    /// Metadata bytes, `None` when the METADATA flag is clear.
    pub metadata: Option<Bytes>,
}

impl Payload {
    /// Create a payload from data and optional metadata.
    pub fn new(data: impl Into<Bytes>, metadata: Option<Bytes>) -> Self {
        Self {
            data: data.into(),
            metadata,
        }
    }

    /// Create a data-only payload.
    pub fn from_data(data: impl Into<Bytes>) -> Self {
        Self::new(data, None)
    }

    /// Create a payload with both data and metadata.
    pub fn with_metadata(data: impl Into<Bytes>, metadata: impl Into<Bytes>) -> Self {
        Self::new(data, Some(metadata.into()))
    }

    /// Encode `value` as the data part using MsgPack.
    pub fn from_msgpack<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self::from_data(MsgPackCodec::encode(value)?))
    }

    /// Decode the data part as MsgPack.
    pub fn decode_msgpack<T: DeserializeOwned>(&self) -> Result<T> {
        MsgPackCodec::decode(&self.data)
    }

    /// Data as UTF-8 (lossy).
    pub fn data_utf8(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }

    /// Metadata as UTF-8 (lossy).
    pub fn metadata_utf8(&self) -> Option<String> {
        self.metadata
            .as_ref()
            .map(|m| String::from_utf8_lossy(m).into_owned())
    }

    /// Total bytes of data and metadata.
    pub fn len(&self) -> usize {
        self.data.len() + self.metadata.as_ref().map_or(0, |m| m.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<&'static str> for Payload {
    fn from(s: &'static str) -> Self {
        Payload::from_data(Bytes::from_static(s.as_bytes()))
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Payload::from_data(Bytes::from(s))
    }
}

impl From<Vec<u8>> for Payload {
    fn from(v: Vec<u8>) -> Self {
        Payload::from_data(Bytes::from(v))
    }
}
