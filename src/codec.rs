//! MsgPack codec for typed payload bodies.
//!
//! Structs are written with `rmp_serde::to_vec_named`, i.e. as maps keyed by
//! field name, so peers in other languages can decode them without knowing
//! the field order.
//!
//! # Example
//!
//! ```
//! use rsocket_mux::codec::MsgPackCodec;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Quote {
//!     symbol: String,
//!     price: u64,
//! }
//!
//! let quote = Quote { symbol: "ACME".to_string(), price: 1200 };
//! let encoded = MsgPackCodec::encode(&quote).unwrap();
//! let decoded: Quote = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, quote);
//! ```

use bytes::Bytes;

use crate::error::Result;

/// MessagePack codec for payload data.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MsgPack bytes (struct-as-map).
    #[inline]
    pub fn encode<T: serde::Serialize>(value: &T) -> Result<Bytes> {
        Ok(Bytes::from(rmp_serde::to_vec_named(value)?))
    }

    /// Decode MsgPack bytes to a value.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RSocketError;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Order {
        id: u32,
        side: String,
        filled: bool,
    }

    #[test]
    fn test_encode_decode_struct() {
        let original = Order {
            id: 42,
            side: "buy".to_string(),
            filled: true,
        };

        let encoded = MsgPackCodec::encode(&original).unwrap();
        let decoded: Order = MsgPackCodec::decode(&encoded).unwrap();

        assert_eq!(decoded, original);
    }

    #[test]
    fn test_struct_encoded_as_map() {
        let order = Order {
            id: 1,
            side: "sell".to_string(),
            filled: false,
        };

        let encoded = MsgPackCodec::encode(&order).unwrap();

        // fixmap with 3 entries, not fixarray (0x93)
        assert_eq!(encoded[0], 0x83);
    }

    #[test]
    fn test_decode_error_on_invalid_data() {
        let result: Result<Order> = MsgPackCodec::decode(b"\xc1 not msgpack");
        assert!(matches!(result, Err(RSocketError::MsgPackDecode(_))));
    }

    #[test]
    fn test_option_none_is_nil() {
        let encoded = MsgPackCodec::encode(&Option::<u8>::None).unwrap();
        assert_eq!(&encoded[..], &[0xc0]);
    }
}
