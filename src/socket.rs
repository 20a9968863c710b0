//! The requester-side interface shared by single connections and the pool.

use async_trait::async_trait;

use crate::error::Result;
use crate::payload::Payload;
use crate::stream::{PayloadStream, ResponseHandle, ResponseStream};

/// The five RSocket interactions plus lifecycle.
///
/// Request methods return immediately; the returned handle or stream carries
/// the outcome. Fire-and-forget and metadata-push wait only until the frame
/// has been queued for writing.
#[async_trait]
pub trait RSocket: Send + Sync {
    async fn fire_and_forget(&self, payload: Payload) -> Result<()>;

    /// Sends only the payload's metadata.
    async fn metadata_push(&self, payload: Payload) -> Result<()>;

    fn request_response(&self, payload: Payload) -> ResponseHandle;

    fn request_stream(&self, payload: Payload) -> PayloadStream;

    fn request_channel(&self, outbound: ResponseStream) -> PayloadStream;

    /// Between 0.0 (unusable) and 1.0.
    fn availability(&self) -> f64;

    fn is_closed(&self) -> bool;

    async fn close(&self) -> Result<()>;
}
