//! Per-stream bookkeeping.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;

use crate::error::{RSocketError, Result};
use crate::flow::Credit;
use crate::payload::Payload;

/// Interaction model of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    Fnf,
    RequestResponse,
    RequestStream,
    RequestChannel,
}

/// Outbound producer side of a stream.
#[derive(Debug)]
pub struct Sending {
    /// Demand granted by the peer.
    pub credit: Arc<Credit>,
    /// Task emitting the producer's items, once spawned.
    pub task: Option<AbortHandle>,
}

impl Sending {
    pub fn new(credit: Credit) -> Self {
        Self {
            credit: Arc::new(credit),
            task: None,
        }
    }

    /// Stop the producer.
    pub fn dispose(self) {
        self.credit.cancel();
        if let Some(task) = self.task {
            task.abort();
        }
    }
}

/// Inbound consumer side of a stream.
#[derive(Debug)]
pub enum Receiving {
    /// Request-response result.
    Single(oneshot::Sender<Result<Payload>>),
    /// Stream or channel items; dropping the sender completes the stream.
    Many(mpsc::UnboundedSender<Result<Payload>>),
}

impl Receiving {
    /// Deliver a terminal error.
    pub fn fail(self, err: RSocketError) {
        match self {
            Receiving::Single(tx) => {
                let _ = tx.send(Err(err));
            }
            Receiving::Many(tx) => {
                let _ = tx.send(Err(err));
            }
        }
    }
}

/// State for one live stream id.
#[derive(Debug)]
pub struct StreamState {
    pub mode: StreamMode,
    pub sending: Option<Sending>,
    pub receiving: Option<Receiving>,
    /// Whether the initiating frame has gone out on the wire.
    pub announced: bool,
}

impl StreamState {
    pub fn new(mode: StreamMode, sending: Option<Sending>, receiving: Option<Receiving>) -> Self {
        Self {
            mode,
            sending,
            receiving,
            announced: false,
        }
    }

    /// Both legs have finished.
    pub fn is_terminated(&self) -> bool {
        self.sending.is_none() && self.receiving.is_none()
    }

    /// Fail the receiving leg and dispose the sending leg.
    pub fn fail(self, err: RSocketError) {
        if let Some(receiving) = self.receiving {
            receiving.fail(err);
        }
        if let Some(sending) = self.sending {
            sending.dispose();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fail_reaches_both_legs() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sending = Sending::new(Credit::new(0));
        let credit = sending.credit.clone();
        let state = StreamState::new(
            StreamMode::RequestChannel,
            Some(sending),
            Some(Receiving::Many(tx)),
        );
        assert!(!state.is_terminated());

        state.fail(RSocketError::ConnectionClosed);

        assert!(matches!(
            rx.recv().await,
            Some(Err(RSocketError::ConnectionClosed))
        ));
        assert!(rx.recv().await.is_none());
        assert!(credit.is_cancelled());
    }

    #[tokio::test]
    async fn test_single_receives_error() {
        let (tx, rx) = oneshot::channel();
        let state = StreamState::new(StreamMode::RequestResponse, None, Some(Receiving::Single(tx)));
        state.fail(RSocketError::application("nope"));
        assert!(matches!(rx.await, Ok(Err(RSocketError::Application { .. }))));
    }
}
