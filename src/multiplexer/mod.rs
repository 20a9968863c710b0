//! One RSocket connection multiplexing many logical streams.
//!
//! A [`Multiplexer`] owns the read loop, the writer task and the table of live
//! streams for one duplex byte stream. It is both a requester (the methods on
//! [`Multiplexer`] and its [`RSocket`] impl) and a responder (inbound requests
//! are handed to the configured [`Responder`]).
//!
//! ```ignore
//! let (a, b) = tokio::io::duplex(64 * 1024);
//! let server = Multiplexer::builder().responder(echo).server(b)?;
//! let client = Multiplexer::builder().client(a)?;
//!
//! let reply = client.request_response(Payload::from("ping")).await?;
//! ```
//!
//! Lifecycle:
//! 1. Split the transport and spawn the writer task
//! 2. Client mode sends SETUP as the first frame
//! 3. Spawn the read loop (and keepalive ticker in client mode)
//! 4. On EOF, read error, `close()` or missed keepalives, every live stream
//!    fails with `ConnectionClosed` and close callbacks run once

mod id;
mod inbound;
mod keepalive;

pub use id::StreamIdGenerator;

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{FutureExt, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::config::MultiplexerConfig;
use crate::error::{RSocketError, Result};
use crate::flow::Credit;
use crate::fragmentation::{Reassembler, Splitter};
use crate::frame::{flags, Frame, FrameBuffer, FrameType, PayloadFrame, SetupFrame};
use crate::payload::Payload;
use crate::socket::RSocket;
use crate::stream::{
    CancelScope, EmptyResponder, PayloadStream, Receiving, Responder, ResponseHandle,
    ResponseStream, Sending, StartFn, StreamControl, StreamMode, StreamParts, StreamState,
    StreamTable,
};
use crate::writer::{spawn_writer_task, WriterHandle};

/// Read buffer size for the read loop.
const READ_BUFFER_SIZE: usize = 64 * 1024;

type CloseCallback = Box<dyn FnOnce() + Send>;

/// Builder for a [`Multiplexer`].
pub struct MultiplexerBuilder {
    config: MultiplexerConfig,
    responder: Arc<dyn Responder>,
    setup_payload: Payload,
}

impl MultiplexerBuilder {
    pub fn new() -> Self {
        Self {
            config: MultiplexerConfig::default(),
            responder: Arc::new(EmptyResponder),
            setup_payload: Payload::default(),
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: MultiplexerConfig) -> Self {
        self.config = config;
        self
    }

    /// Handler for requests initiated by the peer.
    pub fn responder(mut self, responder: Arc<dyn Responder>) -> Self {
        self.responder = responder;
        self
    }

    /// Fragment outbound frames larger than `size` bytes. 0 disables.
    pub fn fragment_size(mut self, size: usize) -> Self {
        self.config.fragment_size = size;
        self
    }

    /// Demand window for inbound streams.
    ///
    /// Default: 256
    pub fn request_n(mut self, n: u32) -> Self {
        self.config.request_n = n;
        self
    }

    /// Set the maximum pending frames for backpressure.
    ///
    /// Default: 1024
    pub fn max_pending_frames(mut self, limit: usize) -> Self {
        self.config.max_pending_frames = limit;
        self
    }

    /// Set the backpressure timeout.
    ///
    /// Default: 5 seconds
    pub fn backpressure_timeout(mut self, timeout: Duration) -> Self {
        self.config.backpressure_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Keepalive interval and the silence after which the connection is dropped.
    /// A zero interval disables keepalive.
    pub fn keepalive(mut self, interval: Duration, max_lifetime: Duration) -> Self {
        self.config.keepalive_interval_ms = interval.as_millis() as u64;
        self.config.max_lifetime_ms = max_lifetime.as_millis() as u64;
        self
    }

    /// Set the maximum number of concurrently served inbound requests.
    ///
    /// Default: 256
    pub fn max_concurrent_responders(mut self, limit: usize) -> Self {
        self.config.max_concurrent_responders = limit;
        self
    }

    /// Mime types announced in SETUP.
    pub fn mime_types(mut self, metadata: impl Into<String>, data: impl Into<String>) -> Self {
        self.config.metadata_mime_type = metadata.into();
        self.config.data_mime_type = data.into();
        self
    }

    /// Payload carried by the SETUP frame.
    pub fn setup_payload(mut self, payload: Payload) -> Self {
        self.setup_payload = payload;
        self
    }

    /// Start as the connecting side: odd stream ids, sends SETUP and keepalives.
    pub fn client<T>(self, io: T) -> Result<Multiplexer>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Multiplexer::start(self, io, false)
    }

    /// Start as the accepting side: even stream ids.
    pub fn server<T>(self, io: T) -> Result<Multiplexer>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Multiplexer::start(self, io, true)
    }
}

impl Default for MultiplexerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// State shared by the handles, the read loop and the producer tasks.
pub(crate) struct Shared {
    writer: WriterHandle,
    streams: StreamTable<StreamState>,
    reassembler: Reassembler,
    ids: StreamIdGenerator,
    splitter: Option<Splitter>,
    responder: Arc<dyn Responder>,
    permits: Arc<Semaphore>,
    request_n: u32,
    server: bool,
    closed: AtomicBool,
    on_close: Mutex<Vec<CloseCallback>>,
    closed_tx: watch::Sender<bool>,
    last_received: Mutex<Instant>,
    peer_setup: Mutex<Option<SetupFrame>>,
    tasks: Mutex<Vec<AbortHandle>>,
}

/// A running multiplexed connection. Cheap to clone.
///
/// Dropping every clone does not close the connection; call
/// [`Multiplexer::close`].
#[derive(Clone)]
pub struct Multiplexer {
    shared: Arc<Shared>,
}

impl Multiplexer {
    pub fn builder() -> MultiplexerBuilder {
        MultiplexerBuilder::new()
    }

    fn start<T>(builder: MultiplexerBuilder, io: T, server: bool) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let MultiplexerBuilder {
            config,
            responder,
            setup_payload,
        } = builder;
        config.validate()?;

        let splitter = match config.fragment_size {
            0 => None,
            size => Some(Splitter::new(size)?),
        };

        let (reader, write_half) = tokio::io::split(io);
        let (writer, writer_task) = spawn_writer_task(write_half, config.writer_config());
        let (closed_tx, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            writer,
            streams: StreamTable::new(),
            reassembler: Reassembler::new(),
            ids: if server {
                StreamIdGenerator::server()
            } else {
                StreamIdGenerator::client()
            },
            splitter,
            responder,
            permits: Arc::new(Semaphore::new(config.max_concurrent_responders.max(1))),
            request_n: config.request_n.max(1),
            server,
            closed: AtomicBool::new(false),
            on_close: Mutex::new(Vec::new()),
            closed_tx,
            last_received: Mutex::new(Instant::now()),
            peer_setup: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        });

        if !server {
            let setup = SetupFrame::new(
                config.keepalive_interval_ms.min(u32::MAX as u64) as u32,
                config.max_lifetime_ms.min(u32::MAX as u64) as u32,
                config.metadata_mime_type.clone(),
                config.data_mime_type.clone(),
                setup_payload,
            );
            shared.writer.send_now(&Frame::Setup(setup))?;
        }

        let read_task = {
            let shared = shared.clone();
            let max_frame_size = config.max_frame_size;
            tokio::spawn(async move {
                if let Err(e) = read_loop(reader, &shared, max_frame_size).await {
                    tracing::error!("Read loop error: {}", e);
                }
                shared.terminate();
            })
        };

        let watch_task = {
            let weak = Arc::downgrade(&shared);
            tokio::spawn(async move {
                let outcome = writer_task.await;
                if let Ok(Err(e)) = &outcome {
                    tracing::error!("Writer error: {}", e);
                }
                if let Some(shared) = weak.upgrade() {
                    shared.terminate();
                }
            })
        };

        let mut tasks = vec![read_task.abort_handle(), watch_task.abort_handle()];
        if !server {
            if let Some(interval) = config.keepalive_interval() {
                let task = tokio::spawn(keepalive::keepalive_loop(
                    Arc::downgrade(&shared),
                    interval,
                    config.max_lifetime(),
                ));
                tasks.push(task.abort_handle());
            }
        }
        shared.tasks.lock().extend(tasks);

        tracing::debug!(
            "multiplexer started as {}",
            if server { "server" } else { "client" }
        );
        Ok(Self { shared })
    }

    /// Send a request that expects no reply.
    pub async fn fire_and_forget(&self, payload: Payload) -> Result<()> {
        self.shared.ensure_open()?;
        let stream_id = self.shared.next_stream_id();
        let frame = PayloadFrame::new(stream_id, FrameType::RequestFnf, 0, None, payload);
        self.shared.send_payload(frame).await
    }

    /// Push connection-level metadata. Only `payload.metadata` is sent.
    pub async fn metadata_push(&self, payload: Payload) -> Result<()> {
        self.shared.ensure_open()?;
        let metadata = payload.metadata.unwrap_or_default();
        self.shared.writer.send(&Frame::metadata_push(metadata)).await
    }

    /// Send a request and get a handle for its single response.
    pub fn request_response(&self, payload: Payload) -> ResponseHandle {
        let shared = &self.shared;
        if shared.is_closed() {
            return ResponseHandle::failed(RSocketError::ConnectionClosed);
        }

        let stream_id = shared.next_stream_id();
        let (tx, rx) = oneshot::channel();
        let mut state = StreamState::new(
            StreamMode::RequestResponse,
            None,
            Some(Receiving::Single(tx)),
        );
        state.announced = true;
        shared.register(stream_id, state);

        let frame = PayloadFrame::new(stream_id, FrameType::RequestResponse, 0, None, payload);
        if let Err(err) = shared.send_payload_now(frame) {
            if let Some(state) = shared.streams.remove(stream_id) {
                state.fail(err);
            }
        }
        ResponseHandle::pending(stream_id, rx, shared.clone())
    }

    /// Open a request-stream. The request is sent on first poll.
    pub fn request_stream(&self, payload: Payload) -> PayloadStream {
        let shared = &self.shared;
        if shared.is_closed() {
            return PayloadStream::failed(RSocketError::ConnectionClosed);
        }

        let stream_id = shared.next_stream_id();
        let (tx, rx) = mpsc::unbounded_channel();
        shared.register(
            stream_id,
            StreamState::new(StreamMode::RequestStream, None, Some(Receiving::Many(tx))),
        );

        let start: StartFn = {
            let shared = shared.clone();
            Box::new(move |n| {
                let frame =
                    PayloadFrame::new(stream_id, FrameType::RequestStream, 0, Some(n), payload);
                shared.announce(frame)
            })
        };
        shared.payload_stream(stream_id, rx, CancelScope::Stream, Some(start), 0)
    }

    /// Open a request-channel fed by `outbound`.
    ///
    /// The first outbound item travels in the REQUEST_CHANNEL frame, which is
    /// sent once the returned stream is first polled and `outbound` yields.
    /// Later items wait for the peer's REQUEST_N.
    pub fn request_channel<S>(&self, outbound: S) -> PayloadStream
    where
        S: Stream<Item = Result<Payload>> + Send + 'static,
    {
        let shared = &self.shared;
        if shared.is_closed() {
            return PayloadStream::failed(RSocketError::ConnectionClosed);
        }

        let stream_id = shared.next_stream_id();
        let (tx, rx) = mpsc::unbounded_channel();
        shared.register(
            stream_id,
            StreamState::new(
                StreamMode::RequestChannel,
                Some(Sending::new(Credit::new(0))),
                Some(Receiving::Many(tx)),
            ),
        );

        let start: StartFn = {
            let shared = shared.clone();
            let outbound = outbound.boxed();
            Box::new(move |n| {
                shared.spawn_channel_outbound(stream_id, n, outbound);
                Ok(())
            })
        };
        shared.payload_stream(stream_id, rx, CancelScope::Stream, Some(start), 0)
    }

    /// Close the connection. Idempotent.
    pub fn close(&self) {
        self.shared.terminate();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Wait until the connection has closed.
    pub async fn closed(&self) {
        let mut rx = self.shared.closed_tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Run `f` once when the connection closes, immediately if it already has.
    pub fn on_close(&self, f: impl FnOnce() + Send + 'static) {
        let mut callbacks = self.shared.on_close.lock();
        if self.shared.is_closed() {
            drop(callbacks);
            f();
            return;
        }
        callbacks.push(Box::new(f));
    }

    /// SETUP received from the peer (server mode).
    pub fn peer_setup(&self) -> Option<SetupFrame> {
        self.shared.peer_setup.lock().clone()
    }

    /// Number of live streams.
    pub fn active_streams(&self) -> usize {
        self.shared.streams.len()
    }

    pub fn is_server(&self) -> bool {
        self.shared.server
    }

    pub fn availability(&self) -> f64 {
        if self.is_closed() {
            0.0
        } else {
            1.0
        }
    }

    /// Get the current backpressure status.
    pub fn is_backpressure_active(&self) -> bool {
        self.shared.writer.is_backpressure_active()
    }

    /// Get the current pending frame count.
    pub fn pending_frames(&self) -> usize {
        self.shared.writer.pending_count()
    }
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("server", &self.shared.server)
            .field("closed", &self.is_closed())
            .field("streams", &self.active_streams())
            .finish()
    }
}

#[async_trait]
impl RSocket for Multiplexer {
    async fn fire_and_forget(&self, payload: Payload) -> Result<()> {
        Multiplexer::fire_and_forget(self, payload).await
    }

    async fn metadata_push(&self, payload: Payload) -> Result<()> {
        Multiplexer::metadata_push(self, payload).await
    }

    fn request_response(&self, payload: Payload) -> ResponseHandle {
        Multiplexer::request_response(self, payload)
    }

    fn request_stream(&self, payload: Payload) -> PayloadStream {
        Multiplexer::request_stream(self, payload)
    }

    fn request_channel(&self, outbound: ResponseStream) -> PayloadStream {
        Multiplexer::request_channel(self, outbound)
    }

    fn availability(&self) -> f64 {
        Multiplexer::availability(self)
    }

    fn is_closed(&self) -> bool {
        Multiplexer::is_closed(self)
    }

    async fn close(&self) -> Result<()> {
        Multiplexer::close(self);
        Ok(())
    }
}

/// Read frames and dispatch them until EOF, a read error or close.
async fn read_loop<R>(mut reader: R, shared: &Arc<Shared>, max_frame_size: usize) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut frame_buffer = FrameBuffer::with_max_frame_size(max_frame_size);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) => return Err(RSocketError::Io(e)),
        };

        for frame in frame_buffer.push(&buf[..n])? {
            shared.handle_frame(frame);
        }
        if shared.is_closed() {
            return Ok(());
        }
    }
}

/// Turn a caught panic into the error reported on the stream.
fn panic_error(panic: Box<dyn Any + Send>) -> RSocketError {
    let message = if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "responder panicked".to_string()
    };
    tracing::warn!("Responder panicked: {}", message);
    RSocketError::application(message)
}

impl Shared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(RSocketError::ConnectionClosed)
        } else {
            Ok(())
        }
    }

    fn next_stream_id(&self) -> u32 {
        self.ids.next(|id| self.streams.contains(id))
    }

    /// Insert a stream, failing it straight away if the connection closed meanwhile.
    fn register(&self, stream_id: u32, state: StreamState) {
        tracing::debug!("stream {}: registered {:?}", stream_id, state.mode);
        self.streams.insert(stream_id, state);
        if self.is_closed() {
            if let Some(state) = self.streams.remove(stream_id) {
                state.fail(RSocketError::ConnectionClosed);
            }
        }
    }

    fn payload_stream(
        self: &Arc<Self>,
        stream_id: u32,
        rx: mpsc::UnboundedReceiver<Result<Payload>>,
        scope: CancelScope,
        start: Option<StartFn>,
        free: u64,
    ) -> PayloadStream {
        PayloadStream::active(StreamParts {
            stream_id,
            rx,
            control: self.clone(),
            scope,
            window: self.request_n,
            start,
            free,
        })
    }

    /// Send the initiating frame of a locally opened stream.
    fn announce(&self, frame: PayloadFrame) -> Result<()> {
        let stream_id = frame.stream_id();
        if self
            .streams
            .with(stream_id, |state| state.announced = true)
            .is_none()
        {
            // Already failed; the error is waiting in the stream's queue.
            return Ok(());
        }
        if let Err(err) = self.send_payload_now(frame) {
            if let Some(state) = self.streams.remove(stream_id) {
                if let Some(sending) = state.sending {
                    sending.dispose();
                }
            }
            return Err(err);
        }
        Ok(())
    }

    /// Queue a payload-carrying frame, fragmenting it if needed.
    fn send_payload_now(&self, frame: PayloadFrame) -> Result<()> {
        match &self.splitter {
            Some(splitter) if splitter.should_split(frame.encoded_len()) => {
                let mut result = Ok(());
                splitter.split(frame, |fragment| {
                    if result.is_ok() {
                        result = self.writer.send_now(&fragment);
                    }
                });
                result
            }
            _ => self.writer.send_now(&frame.into_frame()),
        }
    }

    /// Like [`Shared::send_payload_now`] but waits while backpressure is active.
    async fn send_payload(&self, frame: PayloadFrame) -> Result<()> {
        match &self.splitter {
            Some(splitter) if splitter.should_split(frame.encoded_len()) => {
                for fragment in splitter.split_to_vec(frame) {
                    self.writer.send(&fragment).await?;
                }
                Ok(())
            }
            _ => self.writer.send(&frame.into_frame()).await,
        }
    }

    /// Emit an outbound producer's items as the peer's credit allows.
    async fn drive_producer(
        self: Arc<Self>,
        stream_id: u32,
        credit: Arc<Credit>,
        mut producer: ResponseStream,
    ) {
        loop {
            let item = match AssertUnwindSafe(producer.next()).catch_unwind().await {
                Ok(item) => item,
                Err(panic) => Some(Err(panic_error(panic))),
            };
            match item {
                Some(Ok(payload)) => {
                    if credit.acquire().await.is_err() {
                        return;
                    }
                    let frame =
                        PayloadFrame::new(stream_id, FrameType::Payload, flags::NEXT, None, payload);
                    match self.send_payload(frame).await {
                        Ok(()) => {}
                        Err(err @ RSocketError::FrameTooLarge { .. }) => {
                            self.error_stream(stream_id, err);
                            return;
                        }
                        Err(err) => {
                            tracing::warn!("stream {}: dropping producer: {}", stream_id, err);
                            self.fail_stream(stream_id, err);
                            return;
                        }
                    }
                }
                Some(Err(err)) => {
                    self.error_stream(stream_id, err);
                    return;
                }
                None => {
                    if self.finish_sending(stream_id) {
                        if let Err(err) = self.writer.send(&Frame::complete(stream_id)).await {
                            tracing::debug!("stream {}: complete not sent: {}", stream_id, err);
                        }
                    }
                    return;
                }
            }
        }
    }

    /// Pull the first outbound item and send REQUEST_CHANNEL, then keep feeding.
    fn spawn_channel_outbound(
        self: &Arc<Self>,
        stream_id: u32,
        initial_request_n: u32,
        mut outbound: ResponseStream,
    ) {
        let credit = match self
            .streams
            .with(stream_id, |s| s.sending.as_ref().map(|x| x.credit.clone()))
        {
            Some(Some(credit)) => credit,
            _ => return,
        };

        let shared = self.clone();
        let task = tokio::spawn(async move {
            let first = match AssertUnwindSafe(outbound.next()).catch_unwind().await {
                Ok(first) => first,
                Err(panic) => Some(Err(panic_error(panic))),
            };
            let (payload, complete) = match first {
                Some(Ok(payload)) => (payload, false),
                None => (Payload::default(), true),
                Some(Err(err)) => {
                    // Nothing went out yet, so only the local side hears about it.
                    if let Some(state) = shared.streams.remove(stream_id) {
                        state.fail(err);
                    }
                    return;
                }
            };

            let frame_flags = if complete { flags::COMPLETE } else { 0 };
            let frame = PayloadFrame::new(
                stream_id,
                FrameType::RequestChannel,
                frame_flags,
                Some(initial_request_n),
                payload,
            );
            if shared
                .streams
                .with(stream_id, |state| state.announced = true)
                .is_none()
            {
                return;
            }
            if let Err(err) = shared.send_payload(frame).await {
                shared.fail_stream(stream_id, err);
                return;
            }

            if complete {
                shared.finish_sending(stream_id);
            } else {
                shared.drive_producer(stream_id, credit, outbound).await;
            }
        });
        self.attach_task(stream_id, task.abort_handle());
    }

    fn attach_task(&self, stream_id: u32, task: AbortHandle) {
        self.streams.with(stream_id, |state| {
            if let Some(sending) = state.sending.as_mut() {
                sending.task = Some(task);
            }
        });
    }

    /// Mark the sending leg done. False if the stream is gone.
    fn finish_sending(&self, stream_id: u32) -> bool {
        let finished = self.streams.update_or_take(stream_id, |state| {
            state.sending = None;
            state.is_terminated()
        });
        match finished {
            Some(Some(_)) => {
                tracing::debug!("stream {}: removed", stream_id);
                true
            }
            Some(None) => true,
            None => false,
        }
    }

    /// Report a producer error to the peer and drop the stream.
    fn error_stream(&self, stream_id: u32, err: RSocketError) {
        let Some(state) = self.streams.remove(stream_id) else {
            return;
        };
        self.reassembler.discard(stream_id);
        let (code, message) = err.to_wire();
        if let Err(e) = self.writer.send_now(&Frame::error(stream_id, code, message.clone())) {
            tracing::debug!("stream {}: error not sent: {}", stream_id, e);
        }
        state.fail(RSocketError::Application { code, message });
    }

    /// Drop the stream locally after a send failure.
    fn fail_stream(&self, stream_id: u32, err: RSocketError) {
        if let Some(state) = self.streams.remove(stream_id) {
            self.reassembler.discard(stream_id);
            state.fail(err);
        }
    }

    /// Close the connection and fail every live stream. Runs once.
    fn terminate(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!("connection closing");

        self.writer.close();
        for (_, state) in self.streams.drain() {
            state.fail(RSocketError::ConnectionClosed);
        }
        self.reassembler.clear();

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        let callbacks = std::mem::take(&mut *self.on_close.lock());
        for callback in callbacks {
            callback();
        }
        self.closed_tx.send_replace(true);
    }
}

impl StreamControl for Shared {
    fn cancel(&self, stream_id: u32, scope: CancelScope) {
        match scope {
            CancelScope::Stream => {
                let Some(state) = self.streams.remove(stream_id) else {
                    return;
                };
                self.reassembler.discard(stream_id);
                if state.announced {
                    if let Err(err) = self.writer.send_now(&Frame::cancel(stream_id)) {
                        tracing::debug!("stream {}: cancel not sent: {}", stream_id, err);
                    }
                }
                if let Some(sending) = state.sending {
                    sending.dispose();
                }
                tracing::debug!("stream {}: cancelled", stream_id);
            }
            CancelScope::Inbound => {
                let mut notify_peer = false;
                let taken = self.streams.update_or_take(stream_id, |state| {
                    notify_peer = state.receiving.take().is_some() && state.announced;
                    state.is_terminated()
                });
                if taken.is_none() {
                    return;
                }
                if notify_peer {
                    self.reassembler.discard(stream_id);
                    if let Err(err) = self.writer.send_now(&Frame::cancel(stream_id)) {
                        tracing::debug!("stream {}: cancel not sent: {}", stream_id, err);
                    }
                }
            }
        }
    }

    fn request_n(&self, stream_id: u32, n: u32) {
        let receiving = self
            .streams
            .with(stream_id, |state| state.receiving.is_some())
            .unwrap_or(false);
        if !receiving {
            return;
        }
        if let Err(err) = self.writer.send_now(&Frame::request_n(stream_id, n)) {
            tracing::debug!("stream {}: request_n not sent: {}", stream_id, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::ResponderBuilder;

    fn pair(
        server_responder: Arc<dyn Responder>,
        fragment_size: usize,
    ) -> (Multiplexer, Multiplexer) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let server = Multiplexer::builder()
            .responder(server_responder)
            .fragment_size(fragment_size)
            .server(b)
            .unwrap();
        let client = Multiplexer::builder()
            .fragment_size(fragment_size)
            .client(a)
            .unwrap();
        (client, server)
    }

    fn echo() -> Arc<dyn Responder> {
        ResponderBuilder::new()
            .request_response(|p: Payload| async move { Ok(p) })
            .build()
    }

    #[tokio::test]
    async fn test_request_response_echo() {
        let (client, _server) = pair(echo(), 0);
        let reply = client
            .request_response(Payload::with_metadata("ping", "meta"))
            .await
            .unwrap();
        assert_eq!(reply.data_utf8(), "ping");
        assert_eq!(reply.metadata_utf8().as_deref(), Some("meta"));
        assert_eq!(client.active_streams(), 0);
    }

    #[tokio::test]
    async fn test_not_implemented_default() {
        let (client, _server) = pair(Arc::new(EmptyResponder), 0);
        let err = client
            .request_response(Payload::from("x"))
            .await
            .unwrap_err();
        match err {
            RSocketError::Application { message, .. } => {
                assert_eq!(message, "Request-Response not implemented.")
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_invalid_fragment_size_rejected() {
        let (a, _b) = tokio::io::duplex(1024);
        let err = Multiplexer::builder().fragment_size(3).client(a).unwrap_err();
        assert!(matches!(err, RSocketError::InvalidFragmentSize { size: 3, .. }));
    }

    #[tokio::test]
    async fn test_close_fails_pending_and_runs_callbacks_once() {
        let responder = ResponderBuilder::new()
            .request_response(|_p: Payload| futures::future::pending())
            .build();
        let (client, _server) = pair(responder, 0);

        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        {
            let calls = calls.clone();
            client.on_close(move || {
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }

        let handle = client.request_response(Payload::from("wait"));
        tokio::task::yield_now().await;
        client.close();
        client.close();

        assert!(matches!(handle.await, Err(RSocketError::ConnectionClosed)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(client.is_closed());
        assert!(matches!(
            client.request_response(Payload::from("late")).await,
            Err(RSocketError::ConnectionClosed)
        ));
        client.closed().await;
    }

    #[tokio::test]
    async fn test_server_records_setup() {
        let (a, b) = tokio::io::duplex(1024);
        let server = Multiplexer::builder().server(b).unwrap();
        let client = Multiplexer::builder()
            .mime_types("text/plain", "application/json")
            .setup_payload(Payload::from("hello"))
            .client(a)
            .unwrap();

        // a round trip guarantees SETUP has been processed
        let _ = client.request_response(Payload::from("x")).await;
        let setup = server.peer_setup().unwrap();
        assert_eq!(setup.data_mime_type, "application/json");
        assert_eq!(setup.payload().data_utf8(), "hello");
        assert!(client.peer_setup().is_none());
    }
}
