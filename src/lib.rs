//! # rsocket-mux
//!
//! RSocket over a single ordered byte stream: a per-connection stream
//! multiplexer with fragmentation, and a latency-aware pool of connections.
//!
//! ## Architecture
//!
//! - **Frame codec** (`frame`): 6-byte header, typed frame bodies, 24-bit
//!   length-prefixed framing on the byte stream
//! - **Fragmentation** (`fragmentation`): oversized frames are split into
//!   FOLLOWS-chained fragments and joined back on receipt
//! - **Multiplexer** (`multiplexer`): one connection, many logical streams,
//!   request-N flow control, cancellation, keepalive
//! - **Pool** (`balancer`): power-of-two-choices selection over several
//!   multiplexers, driven by latency quantiles and pending counts
//!
//! ## Example
//!
//! ```ignore
//! use rsocket_mux::{Multiplexer, Payload, ResponderBuilder};
//!
//! #[tokio::main]
//! async fn main() -> rsocket_mux::Result<()> {
//!     let (a, b) = tokio::io::duplex(64 * 1024);
//!
//!     let echo = ResponderBuilder::new()
//!         .request_response(|payload| async move { Ok(payload) })
//!         .build();
//!     let _server = Multiplexer::builder().responder(echo).server(b)?;
//!     let client = Multiplexer::builder().client(a)?;
//!
//!     let reply = client.request_response(Payload::from("ping")).await?;
//!     assert_eq!(reply.data_utf8(), "ping");
//!     Ok(())
//! }
//! ```

pub mod balancer;
pub mod codec;
pub mod config;
pub mod error;
pub mod flow;
pub mod fragmentation;
pub mod frame;
pub mod multiplexer;
pub mod payload;
pub mod socket;
pub mod stream;
pub mod transport;

mod writer;

pub use balancer::LoadBalancer;
pub use codec::MsgPackCodec;
pub use config::{BalancerConfig, MultiplexerConfig};
pub use error::{ErrorCode, RSocketError, Result};
pub use multiplexer::{Multiplexer, MultiplexerBuilder};
pub use payload::Payload;
pub use socket::RSocket;
pub use stream::{
    EmptyResponder, PayloadStream, Responder, ResponderBuilder, ResponseFuture, ResponseHandle,
    ResponseStream,
};
pub use transport::{serve, Connector, TransportConnector};
