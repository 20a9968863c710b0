use async_trait::async_trait;

use crate::error::{RSocketError, Result};
use crate::payload::Payload;
use crate::socket::RSocket;
use crate::stream::{PayloadStream, ResponseHandle, ResponseStream};

/// Stands in for a pool with no active member: every call fails with
/// [`RSocketError::NoAvailableConnection`] without any I/O.
#[derive(Debug, Default, Clone, Copy)]
pub struct FailingSocket;

#[async_trait]
impl RSocket for FailingSocket {
    async fn fire_and_forget(&self, _payload: Payload) -> Result<()> {
        Err(RSocketError::NoAvailableConnection)
    }

    async fn metadata_push(&self, _payload: Payload) -> Result<()> {
        Err(RSocketError::NoAvailableConnection)
    }

    fn request_response(&self, _payload: Payload) -> ResponseHandle {
        ResponseHandle::failed(RSocketError::NoAvailableConnection)
    }

    fn request_stream(&self, _payload: Payload) -> PayloadStream {
        PayloadStream::failed(RSocketError::NoAvailableConnection)
    }

    fn request_channel(&self, outbound: ResponseStream) -> PayloadStream {
        drop(outbound);
        PayloadStream::failed(RSocketError::NoAvailableConnection)
    }

    fn availability(&self) -> f64 {
        0.0
    }

    fn is_closed(&self) -> bool {
        false
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_every_call_fails() {
        let socket = FailingSocket;
        assert!(matches!(
            socket.fire_and_forget(Payload::from("x")).await,
            Err(RSocketError::NoAvailableConnection)
        ));
        assert!(matches!(
            socket.request_response(Payload::from("x")).await,
            Err(RSocketError::NoAvailableConnection)
        ));

        let mut stream = socket.request_stream(Payload::from("x"));
        assert!(matches!(
            stream.next().await,
            Some(Err(RSocketError::NoAvailableConnection))
        ));
        assert!(stream.next().await.is_none());

        let outbound = futures::stream::iter(vec![Ok(Payload::from("a"))]).boxed();
        let mut channel = socket.request_channel(outbound);
        assert!(matches!(
            channel.next().await,
            Some(Err(RSocketError::NoAvailableConnection))
        ));
        assert_eq!(socket.availability(), 0.0);
    }
}
