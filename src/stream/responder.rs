//! Application callbacks invoked for inbound requests.
//!
//! Implement [`Responder`] directly, or assemble one from closures with
//! [`ResponderBuilder`]:
//!
//! ```ignore
//! use futures::StreamExt;
//! use rsocket_mux::{Payload, ResponderBuilder};
//!
//! let responder = ResponderBuilder::new()
//!     .request_response(|p: Payload| async move { Ok(p) })
//!     .request_stream(|p: Payload| {
//!         futures::stream::iter((0..3).map(move |_| Ok(p.clone())))
//!     })
//!     .build();
//! ```

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::PayloadStream;
use crate::error::{RSocketError, Result};
use crate::payload::Payload;

/// Single-item producer returned by a responder.
pub type ResponseFuture = BoxFuture<'static, Result<Payload>>;

/// Multi-item producer returned by a responder.
pub type ResponseStream = BoxStream<'static, Result<Payload>>;

/// Handles requests arriving from the peer.
///
/// Every method has a default. Request methods reply with an
/// APPLICATION_ERROR "... not implemented." when left alone; fire-and-forget
/// and metadata-push are ignored. An `Err` returned from a request method is
/// sent to the peer as an ERROR frame on that stream, and so is a panic.
pub trait Responder: Send + Sync + 'static {
    fn fire_and_forget(&self, _payload: Payload) {}

    fn metadata_push(&self, _payload: Payload) {}

    fn request_response(&self, _payload: Payload) -> Result<ResponseFuture> {
        Err(RSocketError::application("Request-Response not implemented."))
    }

    fn request_stream(&self, _payload: Payload) -> Result<ResponseStream> {
        Err(RSocketError::application("Request-Stream not implemented."))
    }

    /// `inbound` yields the payload of the REQUEST_CHANNEL frame first.
    fn request_channel(&self, _inbound: PayloadStream) -> Result<ResponseStream> {
        Err(RSocketError::application("Request-Channel not implemented."))
    }
}

/// Responder that implements nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyResponder;

impl Responder for EmptyResponder {}

type FnfFn = Box<dyn Fn(Payload) + Send + Sync>;
type ResponseFn = Box<dyn Fn(Payload) -> ResponseFuture + Send + Sync>;
type StreamFn = Box<dyn Fn(Payload) -> ResponseStream + Send + Sync>;
type ChannelFn = Box<dyn Fn(PayloadStream) -> ResponseStream + Send + Sync>;

/// Builder for a closure-backed [`Responder`].
#[derive(Default)]
pub struct ResponderBuilder {
    fire_and_forget: Option<FnfFn>,
    metadata_push: Option<FnfFn>,
    request_response: Option<ResponseFn>,
    request_stream: Option<StreamFn>,
    request_channel: Option<ChannelFn>,
}

impl ResponderBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fire_and_forget<F>(mut self, handler: F) -> Self
    where
        F: Fn(Payload) + Send + Sync + 'static,
    {
        self.fire_and_forget = Some(Box::new(handler));
        self
    }

    pub fn metadata_push<F>(mut self, handler: F) -> Self
    where
        F: Fn(Payload) + Send + Sync + 'static,
    {
        self.metadata_push = Some(Box::new(handler));
        self
    }

    pub fn request_response<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload>> + Send + 'static,
    {
        self.request_response = Some(Box::new(move |p| handler(p).boxed()));
        self
    }

    /// Request-response handler working on MsgPack-encoded bodies.
    ///
    /// A body that fails to decode is answered with an error.
    pub fn request_response_msgpack<F, T, R, Fut>(self, handler: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.request_response(move |payload: Payload| {
            let handler = handler.clone();
            async move {
                let request: T = payload.decode_msgpack()?;
                let reply = handler(request).await?;
                Payload::from_msgpack(&reply)
            }
        })
    }

    pub fn request_stream<F, S>(mut self, handler: F) -> Self
    where
        F: Fn(Payload) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<Payload>> + Send + 'static,
    {
        self.request_stream = Some(Box::new(move |p| handler(p).boxed()));
        self
    }

    pub fn request_channel<F, S>(mut self, handler: F) -> Self
    where
        F: Fn(PayloadStream) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<Payload>> + Send + 'static,
    {
        self.request_channel = Some(Box::new(move |inbound| handler(inbound).boxed()));
        self
    }

    pub fn build(self) -> Arc<dyn Responder> {
        Arc::new(FnResponder(self))
    }
}

struct FnResponder(ResponderBuilder);

impl Responder for FnResponder {
    fn fire_and_forget(&self, payload: Payload) {
        if let Some(handler) = &self.0.fire_and_forget {
            handler(payload);
        }
    }

    fn metadata_push(&self, payload: Payload) {
        if let Some(handler) = &self.0.metadata_push {
            handler(payload);
        }
    }

    fn request_response(&self, payload: Payload) -> Result<ResponseFuture> {
        match &self.0.request_response {
            Some(handler) => Ok(handler(payload)),
            None => EmptyResponder.request_response(payload),
        }
    }

    fn request_stream(&self, payload: Payload) -> Result<ResponseStream> {
        match &self.0.request_stream {
            Some(handler) => Ok(handler(payload)),
            None => EmptyResponder.request_stream(payload),
        }
    }

    fn request_channel(&self, inbound: PayloadStream) -> Result<ResponseStream> {
        match &self.0.request_channel {
            Some(handler) => Ok(handler(inbound)),
            None => EmptyResponder.request_channel(inbound),
        }
    }
}
