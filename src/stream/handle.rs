//! Requester-facing handles for in-flight streams.
//!
//! [`ResponseHandle`] resolves to the single response of a request-response
//! call. [`PayloadStream`] yields the items of a request-stream or the inbound
//! leg of a channel and issues REQUEST_N frames as items are consumed.
//!
//! Both cancel the stream when dropped before reaching a terminal signal.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use futures::future::BoxFuture;
use futures::Stream;
use tokio::sync::{mpsc, oneshot};

use crate::error::{RSocketError, Result};
use crate::frame::MAX_REQUEST_N;
use crate::payload::Payload;

/// Which part of a stream a cancel applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CancelScope {
    /// Tear down the whole stream (requester side).
    Stream,
    /// Stop only the inbound leg (responder side of a channel).
    Inbound,
}

/// Connection operations a handle needs.
pub(crate) trait StreamControl: Send + Sync {
    fn cancel(&self, stream_id: u32, scope: CancelScope);
    fn request_n(&self, stream_id: u32, n: u32);
}

type FinishHook = Box<dyn FnOnce(bool) + Send>;
type FirstHook = Box<dyn FnOnce() + Send>;
pub(crate) type StartFn = Box<dyn FnOnce(u32) -> Result<()> + Send>;

fn chain_finish(a: Option<FinishHook>, b: Option<FinishHook>) -> Option<FinishHook> {
    match (a, b) {
        (Some(a), Some(b)) => Some(Box::new(move |ok| {
            a(ok);
            b(ok);
        })),
        (a, b) => a.or(b),
    }
}

fn chain_first(a: Option<FirstHook>, b: Option<FirstHook>) -> Option<FirstHook> {
    match (a, b) {
        (Some(a), Some(b)) => Some(Box::new(move || {
            a();
            b();
        })),
        (a, b) => a.or(b),
    }
}

// ---------------------------------------------------------------------------
// ResponseHandle
// ---------------------------------------------------------------------------

enum ResponseState {
    Pending {
        stream_id: u32,
        rx: oneshot::Receiver<Result<Payload>>,
        control: Arc<dyn StreamControl>,
    },
    Deferred(BoxFuture<'static, ResponseHandle>),
    Failed(RSocketError),
    Done,
}

/// Pending result of a request-response call.
///
/// Await it for the response. [`ResponseHandle::cancel`] is idempotent and
/// sends at most one CANCEL frame; it has no effect once the response has
/// arrived.
pub struct ResponseHandle {
    state: ResponseState,
    on_finish: Option<FinishHook>,
}

impl ResponseHandle {
    pub(crate) fn pending(
        stream_id: u32,
        rx: oneshot::Receiver<Result<Payload>>,
        control: Arc<dyn StreamControl>,
    ) -> Self {
        Self {
            state: ResponseState::Pending {
                stream_id,
                rx,
                control,
            },
            on_finish: None,
        }
    }

    /// A handle that resolves to `err` without touching the network.
    pub fn failed(err: RSocketError) -> Self {
        Self {
            state: ResponseState::Failed(err),
            on_finish: None,
        }
    }

    /// A handle whose request is issued when `fut` resolves on first poll.
    pub fn deferred<F>(fut: F) -> Self
    where
        F: Future<Output = ResponseHandle> + Send + 'static,
    {
        Self {
            state: ResponseState::Deferred(Box::pin(fut)),
            on_finish: None,
        }
    }

    /// Register a callback run once on the terminal signal with `true` on success.
    pub fn on_finish(mut self, f: impl FnOnce(bool) + Send + 'static) -> Self {
        self.on_finish = chain_finish(self.on_finish.take(), Some(Box::new(f)));
        self
    }

    /// Stream id, once one has been allocated.
    pub fn stream_id(&self) -> Option<u32> {
        match &self.state {
            ResponseState::Pending { stream_id, .. } => Some(*stream_id),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, ResponseState::Done)
    }

    /// Cancel the request.
    pub fn cancel(&mut self) {
        match std::mem::replace(&mut self.state, ResponseState::Done) {
            ResponseState::Done => return,
            ResponseState::Pending {
                stream_id, control, ..
            } => control.cancel(stream_id, CancelScope::Stream),
            ResponseState::Deferred(_) | ResponseState::Failed(_) => {}
        }
        self.finish(false);
    }

    fn finish(&mut self, ok: bool) {
        if let Some(hook) = self.on_finish.take() {
            hook(ok);
        }
    }
}

impl Future for ResponseHandle {
    type Output = Result<Payload>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        loop {
            match &mut this.state {
                ResponseState::Pending { rx, .. } => {
                    let out = match ready!(Pin::new(rx).poll(cx)) {
                        Ok(result) => result,
                        Err(_) => Err(RSocketError::ConnectionClosed),
                    };
                    this.state = ResponseState::Done;
                    this.finish(out.is_ok());
                    return Poll::Ready(out);
                }
                ResponseState::Deferred(fut) => {
                    let mut inner = ready!(fut.as_mut().poll(cx));
                    this.state = std::mem::replace(&mut inner.state, ResponseState::Done);
                    this.on_finish = chain_finish(inner.on_finish.take(), this.on_finish.take());
                }
                ResponseState::Failed(_) => {
                    if let ResponseState::Failed(err) =
                        std::mem::replace(&mut this.state, ResponseState::Done)
                    {
                        this.finish(false);
                        return Poll::Ready(Err(err));
                    }
                }
                ResponseState::Done => return Poll::Ready(Err(RSocketError::Cancelled)),
            }
        }
    }
}

impl Drop for ResponseHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for ResponseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseHandle")
            .field("stream_id", &self.stream_id())
            .field("done", &self.is_done())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// PayloadStream
// ---------------------------------------------------------------------------

struct Active {
    stream_id: u32,
    rx: mpsc::UnboundedReceiver<Result<Payload>>,
    control: Arc<dyn StreamControl>,
    scope: CancelScope,
    /// Sends the initiating frame with the first demand.
    start: Option<StartFn>,
    started: bool,
    window: u32,
    /// Explicit demand requested before the first poll.
    initial: Option<u32>,
    /// Items already queued that were not paid for with credit.
    free: u64,
    outstanding: u64,
    unbounded: bool,
    manual: bool,
}

impl Active {
    fn start(&mut self) -> Result<()> {
        self.started = true;
        let n = self.initial.unwrap_or(self.window).clamp(1, MAX_REQUEST_N);
        self.unbounded = n >= MAX_REQUEST_N;
        self.outstanding = n as u64 + self.free;
        match self.start.take() {
            Some(start) => start(n),
            None => {
                self.control.request_n(self.stream_id, n);
                Ok(())
            }
        }
    }

    fn request(&mut self, n: u32) {
        if n == 0 {
            return;
        }
        if !self.started {
            self.manual = true;
            self.initial = Some(self.initial.unwrap_or(0).saturating_add(n));
            return;
        }
        if self.unbounded {
            return;
        }
        if n >= MAX_REQUEST_N {
            self.unbounded = true;
        }
        self.outstanding = self.outstanding.saturating_add(n as u64);
        self.control.request_n(self.stream_id, n);
    }

    fn delivered(&mut self) {
        if self.unbounded {
            return;
        }
        self.outstanding = self.outstanding.saturating_sub(1);
        let window = self.window as u64;
        if !self.manual && self.outstanding <= window / 2 {
            let add = window - self.outstanding;
            if add > 0 {
                self.outstanding += add;
                self.control.request_n(self.stream_id, add as u32);
            }
        }
    }
}

enum StreamInner {
    Active(Box<Active>),
    Deferred(BoxFuture<'static, PayloadStream>),
    Failed(RSocketError),
    Done,
}

/// Items of a request-stream, or the inbound leg of a request-channel.
///
/// Nothing goes out on the wire for a request-stream until the first poll;
/// that poll's demand becomes the initial request-N. After that the stream
/// keeps a window of outstanding demand topped up as items are consumed,
/// unless [`PayloadStream::request`] was called before the first poll, in
/// which case demand is entirely manual.
pub struct PayloadStream {
    inner: StreamInner,
    deferred_demand: u32,
    on_first: Option<FirstHook>,
    on_finish: Option<FinishHook>,
}

pub(crate) struct StreamParts {
    pub stream_id: u32,
    pub rx: mpsc::UnboundedReceiver<Result<Payload>>,
    pub control: Arc<dyn StreamControl>,
    pub scope: CancelScope,
    pub window: u32,
    pub start: Option<StartFn>,
    pub free: u64,
}

impl PayloadStream {
    pub(crate) fn active(parts: StreamParts) -> Self {
        let window = parts.window.max(1);
        Self::from_inner(StreamInner::Active(Box::new(Active {
            stream_id: parts.stream_id,
            rx: parts.rx,
            control: parts.control,
            scope: parts.scope,
            start: parts.start,
            started: false,
            window,
            initial: None,
            free: parts.free,
            outstanding: 0,
            unbounded: window >= MAX_REQUEST_N,
            manual: false,
        })))
    }

    /// A stream that yields `err` once and ends.
    pub fn failed(err: RSocketError) -> Self {
        Self::from_inner(StreamInner::Failed(err))
    }

    /// A stream whose request is issued when `fut` resolves on first poll.
    pub fn deferred<F>(fut: F) -> Self
    where
        F: Future<Output = PayloadStream> + Send + 'static,
    {
        Self::from_inner(StreamInner::Deferred(Box::pin(fut)))
    }

    fn from_inner(inner: StreamInner) -> Self {
        Self {
            inner,
            deferred_demand: 0,
            on_first: None,
            on_finish: None,
        }
    }

    /// Register a callback run on the first item, error or completion.
    /// Not run when the stream is cancelled first.
    pub fn on_first(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_first = chain_first(self.on_first.take(), Some(Box::new(f)));
        self
    }

    /// Register a callback run once on the terminal signal with `true` on completion.
    pub fn on_finish(mut self, f: impl FnOnce(bool) + Send + 'static) -> Self {
        self.on_finish = chain_finish(self.on_finish.take(), Some(Box::new(f)));
        self
    }

    pub fn stream_id(&self) -> Option<u32> {
        match &self.inner {
            StreamInner::Active(active) => Some(active.stream_id),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self.inner, StreamInner::Done)
    }

    /// Signal demand for `n` more items.
    pub fn request(&mut self, n: u32) {
        match &mut self.inner {
            StreamInner::Active(active) => active.request(n),
            StreamInner::Deferred(_) => {
                self.deferred_demand = self.deferred_demand.saturating_add(n);
            }
            _ => {}
        }
    }

    /// Cancel the stream. Idempotent.
    pub fn cancel(&mut self) {
        match std::mem::replace(&mut self.inner, StreamInner::Done) {
            StreamInner::Done => return,
            StreamInner::Active(active) => active.control.cancel(active.stream_id, active.scope),
            StreamInner::Deferred(_) | StreamInner::Failed(_) => {}
        }
        // cancellation is not a signal from the peer
        self.on_first = None;
        self.finish(false);
    }

    fn first(&mut self) {
        if let Some(hook) = self.on_first.take() {
            hook();
        }
    }

    fn finish(&mut self, ok: bool) {
        self.first();
        if let Some(hook) = self.on_finish.take() {
            hook(ok);
        }
    }
}

enum Step {
    Item(Payload),
    Error(RSocketError),
    End,
}

impl Stream for PayloadStream {
    type Item = Result<Payload>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            let step = match &mut this.inner {
                StreamInner::Active(active) => {
                    if !active.started {
                        if let Err(err) = active.start() {
                            Step::Error(err)
                        } else {
                            continue;
                        }
                    } else {
                        match ready!(active.rx.poll_recv(cx)) {
                            Some(Ok(payload)) => {
                                active.delivered();
                                Step::Item(payload)
                            }
                            Some(Err(err)) => Step::Error(err),
                            None => Step::End,
                        }
                    }
                }
                StreamInner::Deferred(fut) => {
                    let mut resolved = ready!(fut.as_mut().poll(cx));
                    this.inner = std::mem::replace(&mut resolved.inner, StreamInner::Done);
                    this.on_first = chain_first(resolved.on_first.take(), this.on_first.take());
                    this.on_finish = chain_finish(resolved.on_finish.take(), this.on_finish.take());
                    let demand = std::mem::take(&mut this.deferred_demand);
                    if demand > 0 {
                        this.request(demand);
                    }
                    continue;
                }
                StreamInner::Failed(_) => {
                    match std::mem::replace(&mut this.inner, StreamInner::Done) {
                        StreamInner::Failed(err) => Step::Error(err),
                        _ => Step::End,
                    }
                }
                StreamInner::Done => return Poll::Ready(None),
            };

            return match step {
                Step::Item(payload) => {
                    this.first();
                    Poll::Ready(Some(Ok(payload)))
                }
                Step::Error(err) => {
                    this.inner = StreamInner::Done;
                    this.finish(false);
                    Poll::Ready(Some(Err(err)))
                }
                Step::End => {
                    this.inner = StreamInner::Done;
                    this.finish(true);
                    Poll::Ready(None)
                }
            };
        }
    }
}

impl Drop for PayloadStream {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for PayloadStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadStream")
            .field("stream_id", &self.stream_id())
            .field("done", &self.is_done())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        cancels: Mutex<Vec<(u32, CancelScope)>>,
        requests: Mutex<Vec<(u32, u32)>>,
    }

    impl StreamControl for Recorder {
        fn cancel(&self, stream_id: u32, scope: CancelScope) {
            self.cancels.lock().push((stream_id, scope));
        }

        fn request_n(&self, stream_id: u32, n: u32) {
            self.requests.lock().push((stream_id, n));
        }
    }

    fn stream_parts(
        recorder: &Arc<Recorder>,
        window: u32,
        start: Option<StartFn>,
    ) -> (mpsc::UnboundedSender<Result<Payload>>, StreamParts) {
        let (tx, rx) = mpsc::unbounded_channel();
        let parts = StreamParts {
            stream_id: 7,
            rx,
            control: recorder.clone(),
            scope: CancelScope::Stream,
            window,
            start,
            free: 0,
        };
        (tx, parts)
    }

    #[tokio::test]
    async fn test_response_resolves_and_fires_hook() {
        let recorder = Arc::new(Recorder::default());
        let (tx, rx) = oneshot::channel();
        let finished = Arc::new(AtomicUsize::new(0));
        let handle = {
            let finished = finished.clone();
            ResponseHandle::pending(1, rx, recorder.clone()).on_finish(move |ok| {
                assert!(ok);
                finished.fetch_add(1, Ordering::SeqCst);
            })
        };

        tx.send(Ok(Payload::from("pong"))).unwrap();
        let payload = handle.await.unwrap();
        assert_eq!(payload.data_utf8(), "pong");
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert!(recorder.cancels.lock().is_empty());
    }

    #[tokio::test]
    async fn test_response_cancel_is_idempotent() {
        let recorder = Arc::new(Recorder::default());
        let (_tx, rx) = oneshot::channel();
        let mut handle = ResponseHandle::pending(3, rx, recorder.clone());

        handle.cancel();
        handle.cancel();
        drop(handle);

        assert_eq!(*recorder.cancels.lock(), vec![(3, CancelScope::Stream)]);
    }

    #[tokio::test]
    async fn test_deferred_response_keeps_hooks() {
        let recorder = Arc::new(Recorder::default());
        let (tx, rx) = oneshot::channel();
        tx.send(Ok(Payload::from("x"))).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let inner = {
            let calls = calls.clone();
            ResponseHandle::pending(5, rx, recorder.clone()).on_finish(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            })
        };
        let outer = {
            let calls = calls.clone();
            ResponseHandle::deferred(async move { inner }).on_finish(move |_| {
                calls.fetch_add(10, Ordering::SeqCst);
            })
        };

        assert!(outer.await.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 11);
    }

    #[tokio::test]
    async fn test_failed_response() {
        let err = ResponseHandle::failed(RSocketError::NoAvailableConnection)
            .await
            .unwrap_err();
        assert!(matches!(err, RSocketError::NoAvailableConnection));
    }

    #[tokio::test]
    async fn test_stream_starts_lazily_with_window() {
        let recorder = Arc::new(Recorder::default());
        let started = Arc::new(Mutex::new(None));
        let start: StartFn = {
            let started = started.clone();
            Box::new(move |n| {
                *started.lock() = Some(n);
                Ok(())
            })
        };
        let (tx, parts) = stream_parts(&recorder, 4, Some(start));
        let mut stream = PayloadStream::active(parts);
        assert!(started.lock().is_none());

        for i in 0..4 {
            tx.send(Ok(Payload::from(format!("{i}")))).unwrap();
        }
        drop(tx);

        let items: Vec<_> = (&mut stream).collect().await;
        assert_eq!(items.len(), 4);
        assert_eq!(*started.lock(), Some(4));
        // refilled once outstanding dropped to half the window, then again
        assert_eq!(*recorder.requests.lock(), vec![(7, 2), (7, 2)]);
        assert!(stream.is_done());
        drop(stream);
        assert!(recorder.cancels.lock().is_empty());
    }

    #[tokio::test]
    async fn test_manual_demand() {
        let recorder = Arc::new(Recorder::default());
        let started = Arc::new(Mutex::new(None));
        let start: StartFn = {
            let started = started.clone();
            Box::new(move |n| {
                *started.lock() = Some(n);
                Ok(())
            })
        };
        let (tx, parts) = stream_parts(&recorder, 256, Some(start));
        let mut stream = PayloadStream::active(parts);
        stream.request(3);

        tx.send(Ok(Payload::from("a"))).unwrap();
        assert!(stream.next().await.unwrap().is_ok());
        assert_eq!(*started.lock(), Some(3));

        stream.request(2);
        assert_eq!(*recorder.requests.lock(), vec![(7, 2)]);
    }

    #[tokio::test]
    async fn test_stream_error_is_terminal() {
        let recorder = Arc::new(Recorder::default());
        let (tx, parts) = stream_parts(&recorder, 8, None);
        let mut stream = PayloadStream::active(parts);

        tx.send(Err(RSocketError::application("boom"))).unwrap();
        tx.send(Ok(Payload::from("late"))).unwrap();

        assert!(stream.next().await.unwrap().is_err());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_stream_drop_cancels_once() {
        let recorder = Arc::new(Recorder::default());
        let (_tx, parts) = stream_parts(&recorder, 8, None);
        let mut stream = PayloadStream::active(parts);
        stream.cancel();
        drop(stream);
        assert_eq!(*recorder.cancels.lock(), vec![(7, CancelScope::Stream)]);
    }

    #[tokio::test]
    async fn test_on_first_fires_once() {
        let recorder = Arc::new(Recorder::default());
        let (tx, parts) = stream_parts(&recorder, 8, None);
        let firsts = Arc::new(AtomicUsize::new(0));
        let mut stream = {
            let firsts = firsts.clone();
            PayloadStream::active(parts).on_first(move || {
                firsts.fetch_add(1, Ordering::SeqCst);
            })
        };

        tx.send(Ok(Payload::from("a"))).unwrap();
        tx.send(Ok(Payload::from("b"))).unwrap();
        drop(tx);
        while stream.next().await.is_some() {}
        assert_eq!(firsts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_skips_on_first() {
        let recorder = Arc::new(Recorder::default());
        let (_tx, parts) = stream_parts(&recorder, 9, None);
        let firsts = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        let mut stream = {
            let firsts = firsts.clone();
            let finished = finished.clone();
            PayloadStream::active(parts)
                .on_first(move || {
                    firsts.fetch_add(1, Ordering::SeqCst);
                })
                .on_finish(move |ok| {
                    assert!(!ok);
                    finished.fetch_add(1, Ordering::SeqCst);
                })
        };

        stream.cancel();
        drop(stream);
        assert_eq!(firsts.load(Ordering::SeqCst), 0);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }
}
