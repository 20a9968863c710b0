//! Inbound frame dispatch.
//!
//! Runs on the read loop: connection-level frames are handled in place,
//! payload-carrying frames go through reassembly first, and requests from the
//! peer are handed to the responder on their own tasks.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tokio::time::Instant;

use super::{panic_error, Shared};
use crate::error::{ErrorCode, RSocketError, Result};
use crate::flow::Credit;
use crate::frame::{flags, ErrorFrame, Frame, FrameType, KeepaliveFrame, PayloadFrame};
use crate::payload::Payload;
use crate::stream::{CancelScope, Receiving, ResponseStream, Sending, StreamMode, StreamState};

impl Shared {
    pub(super) fn handle_frame(self: &Arc<Self>, frame: Frame) {
        *self.last_received.lock() = Instant::now();

        match frame {
            Frame::Setup(setup) => {
                if self.server {
                    tracing::debug!(
                        "SETUP v{}.{} keepalive={}ms lifetime={}ms",
                        setup.major_version,
                        setup.minor_version,
                        setup.keepalive_interval_ms,
                        setup.max_lifetime_ms
                    );
                    *self.peer_setup.lock() = Some(setup);
                } else {
                    tracing::warn!("Ignoring SETUP received by a client");
                }
            }
            Frame::Lease(lease) => {
                tracing::debug!("Ignoring LEASE ttl={}ms", lease.ttl_ms);
            }
            Frame::Keepalive(keepalive) => self.handle_keepalive(keepalive),
            Frame::MetadataPush(push) => {
                self.spawn_fnf(Payload::new(bytes::Bytes::new(), Some(push.metadata)), true);
            }
            Frame::RequestN(frame) => self.handle_request_n(frame.header.stream_id, frame.n),
            Frame::Cancel(header) => self.handle_cancel(header.stream_id),
            Frame::Error(error) => self.handle_error(error),
            Frame::RequestResponse(frame)
            | Frame::RequestFnf(frame)
            | Frame::RequestStream(frame)
            | Frame::RequestChannel(frame)
            | Frame::Payload(frame) => {
                if let Some(frame) = self.reassembler.accept(frame) {
                    self.handle_payload_frame(frame);
                }
            }
        }
    }

    fn handle_keepalive(&self, keepalive: KeepaliveFrame) {
        if !keepalive.respond() {
            return;
        }
        if let Err(e) = self
            .writer
            .send_now(&Frame::keepalive(false, 0, keepalive.data))
        {
            tracing::debug!("KEEPALIVE reply not sent: {}", e);
        }
    }

    fn handle_payload_frame(self: &Arc<Self>, frame: PayloadFrame) {
        match frame.header.frame_type {
            FrameType::Payload => self.handle_payload(frame),
            _ => self.handle_request(frame),
        }
    }

    fn handle_request_n(&self, stream_id: u32, n: u32) {
        match self
            .streams
            .with(stream_id, |s| s.sending.as_ref().map(|x| x.credit.clone()))
        {
            Some(Some(credit)) => credit.grant(n),
            Some(None) => tracing::warn!("stream {}: REQUEST_N without a producer", stream_id),
            None => tracing::warn!("stream {}: REQUEST_N for unknown stream, dropping", stream_id),
        }
    }

    fn handle_cancel(&self, stream_id: u32) {
        self.reassembler.discard(stream_id);

        if self.ids.is_local(stream_id) {
            // The responder stopped consuming our outbound leg.
            let taken = self.streams.update_or_take(stream_id, |state| {
                if let Some(sending) = state.sending.take() {
                    sending.dispose();
                }
                state.is_terminated()
            });
            if let Some(Some(_)) = taken {
                tracing::debug!("stream {}: removed", stream_id);
            }
            return;
        }

        match self.streams.remove(stream_id) {
            Some(state) => {
                tracing::debug!("stream {}: cancelled by peer", stream_id);
                state.fail(RSocketError::Cancelled);
            }
            None => tracing::debug!("stream {}: CANCEL for unknown stream", stream_id),
        }
    }

    fn handle_error(&self, error: ErrorFrame) {
        let stream_id = error.header.stream_id;
        if stream_id == 0 {
            tracing::error!(
                "Connection error {}: {}",
                error.code,
                error.message_utf8()
            );
            self.terminate();
            return;
        }

        match self.streams.remove(stream_id) {
            Some(state) => {
                self.reassembler.discard(stream_id);
                state.fail(error.into_error());
            }
            None => tracing::warn!("stream {}: ERROR for unknown stream, dropping", stream_id),
        }
    }

    fn handle_payload(&self, frame: PayloadFrame) {
        let stream_id = frame.stream_id();
        let next = frame.header.has_next();
        let complete = frame.header.has_complete();
        let payload = frame.into_payload();

        let mut unexpected = false;
        let taken = self.streams.update_or_take(stream_id, |state| {
            match state.receiving.take() {
                Some(Receiving::Single(tx)) => {
                    let _ = tx.send(Ok(payload));
                }
                Some(Receiving::Many(tx)) => {
                    if next {
                        let _ = tx.send(Ok(payload));
                    }
                    if !complete {
                        state.receiving = Some(Receiving::Many(tx));
                    }
                }
                None => unexpected = true,
            }
            state.is_terminated()
        });

        match taken {
            None => tracing::warn!("stream {}: PAYLOAD for unknown stream, dropping", stream_id),
            Some(_) if unexpected => {
                tracing::warn!("stream {}: PAYLOAD on a stream that is not receiving", stream_id)
            }
            Some(Some(_)) => tracing::debug!("stream {}: removed", stream_id),
            Some(None) => {}
        }
    }

    fn handle_request(self: &Arc<Self>, frame: PayloadFrame) {
        let stream_id = frame.stream_id();
        let frame_type = frame.header.frame_type;

        if stream_id == 0 || self.ids.is_local(stream_id) || self.streams.contains(stream_id) {
            tracing::warn!(
                "stream {}: unexpected {:?}, dropping",
                stream_id,
                frame_type
            );
            return;
        }

        if frame_type == FrameType::RequestFnf {
            self.spawn_fnf(frame.into_payload(), false);
            return;
        }

        let Ok(permit) = self.permits.clone().try_acquire_owned() else {
            tracing::warn!(
                "Responder capacity reached, rejecting stream {}",
                stream_id
            );
            let err = Frame::error(stream_id, ErrorCode::REJECTED, "Responder capacity reached.");
            if let Err(e) = self.writer.send_now(&err) {
                tracing::debug!("stream {}: rejection not sent: {}", stream_id, e);
            }
            return;
        };

        match frame_type {
            FrameType::RequestResponse => self.serve_request_response(frame, permit),
            FrameType::RequestStream => self.serve_request_stream(frame, permit),
            FrameType::RequestChannel => self.serve_request_channel(frame, permit),
            other => tracing::warn!("stream {}: unexpected {:?}, dropping", stream_id, other),
        }
    }

    /// Fire-and-forget and metadata-push: run the handler, log failures only.
    fn spawn_fnf(self: &Arc<Self>, payload: Payload, metadata_push: bool) {
        let responder = self.responder.clone();
        tokio::spawn(async move {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                if metadata_push {
                    responder.metadata_push(payload);
                } else {
                    responder.fire_and_forget(payload);
                }
            }));
            if let Err(panic) = outcome {
                panic_error(panic);
            }
        });
    }

    fn reject(&self, stream_id: u32, err: RSocketError) {
        tracing::debug!("stream {}: responder refused: {}", stream_id, err);
        if let Err(e) = self.writer.send_now(&err.to_error_frame(stream_id)) {
            tracing::debug!("stream {}: error not sent: {}", stream_id, e);
        }
    }

    fn serve_request_response(self: &Arc<Self>, frame: PayloadFrame, permit: OwnedSemaphorePermit) {
        let stream_id = frame.stream_id();
        let payload = frame.into_payload();

        let producer = match invoke(|| self.responder.request_response(payload)) {
            Ok(producer) => producer,
            Err(err) => return self.reject(stream_id, err),
        };

        self.register(
            stream_id,
            StreamState::new(
                StreamMode::RequestResponse,
                Some(Sending::new(Credit::unbounded())),
                None,
            ),
        );

        let shared = self.clone();
        let task = tokio::spawn(async move {
            let _permit = permit;
            let result = match AssertUnwindSafe(producer).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => Err(panic_error(panic)),
            };
            if shared.streams.remove(stream_id).is_none() {
                // cancelled meanwhile
                return;
            }
            let sent = match result {
                Ok(payload) => {
                    let frame = PayloadFrame::new(
                        stream_id,
                        FrameType::Payload,
                        flags::NEXT | flags::COMPLETE,
                        None,
                        payload,
                    );
                    match shared.send_payload(frame).await {
                        Err(err @ RSocketError::FrameTooLarge { .. }) => {
                            shared.writer.send_now(&err.to_error_frame(stream_id))
                        }
                        sent => sent,
                    }
                }
                Err(err) => shared.writer.send_now(&err.to_error_frame(stream_id)),
            };
            if let Err(e) = sent {
                tracing::debug!("stream {}: response not sent: {}", stream_id, e);
            }
        });
        self.attach_task(stream_id, task.abort_handle());
    }

    fn serve_request_stream(self: &Arc<Self>, frame: PayloadFrame, permit: OwnedSemaphorePermit) {
        let stream_id = frame.stream_id();
        let initial_request_n = frame.initial_request_n.unwrap_or(0);
        let payload = frame.into_payload();

        let producer = match invoke(|| self.responder.request_stream(payload)) {
            Ok(producer) => producer,
            Err(err) => return self.reject(stream_id, err),
        };

        let sending = Sending::new(Credit::new(initial_request_n));
        let credit = sending.credit.clone();
        self.register(
            stream_id,
            StreamState::new(StreamMode::RequestStream, Some(sending), None),
        );
        self.spawn_producer(stream_id, credit, producer, permit);
    }

    fn serve_request_channel(self: &Arc<Self>, frame: PayloadFrame, permit: OwnedSemaphorePermit) {
        let stream_id = frame.stream_id();
        let initial_request_n = frame.initial_request_n.unwrap_or(0);
        let complete = frame.header.has_complete();
        let first = frame.into_payload();

        // The REQUEST_CHANNEL payload is the first inbound item.
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(Ok(first));
        let receiving = if complete {
            None
        } else {
            Some(Receiving::Many(tx))
        };

        let sending = Sending::new(Credit::new(initial_request_n));
        let credit = sending.credit.clone();
        self.register(
            stream_id,
            StreamState::new(StreamMode::RequestChannel, Some(sending), receiving),
        );

        let inbound = self.payload_stream(stream_id, rx, CancelScope::Inbound, None, 1);
        let producer = match invoke(|| self.responder.request_channel(inbound)) {
            Ok(producer) => producer,
            Err(err) => {
                if let Some(state) = self.streams.remove(stream_id) {
                    state.fail(RSocketError::Cancelled);
                }
                return self.reject(stream_id, err);
            }
        };

        self.streams.with(stream_id, |state| state.announced = true);
        self.spawn_producer(stream_id, credit, producer, permit);
    }

    fn spawn_producer(
        self: &Arc<Self>,
        stream_id: u32,
        credit: Arc<Credit>,
        producer: ResponseStream,
        permit: OwnedSemaphorePermit,
    ) {
        let shared = self.clone();
        let task = tokio::spawn(async move {
            let _permit = permit;
            shared.drive_producer(stream_id, credit, producer).await;
        });
        self.attach_task(stream_id, task.abort_handle());
    }
}

/// Call into the responder, turning a panic into an error.
fn invoke<T>(call: impl FnOnce() -> Result<T>) -> Result<T> {
    match catch_unwind(AssertUnwindSafe(call)) {
        Ok(result) => result,
        Err(panic) => Err(panic_error(panic)),
    }
}
