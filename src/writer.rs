//! Dedicated writer task for outbound frames.
//!
//! All streams on a connection hand encoded frames to one writer task over an
//! mpsc channel. The task batches whatever is queued and writes it with a
//! single vectored write, prefixing each frame with its 3-byte length.
//!
//! ```text
//! Stream 1 ─┐
//! Stream 3 ─┼─► mpsc::UnboundedSender<OutboundFrame> ─► Writer Task ─► Transport
//! Stream N ─┘
//! ```
//!
//! The queue itself is unbounded so control frames (CANCEL, REQUEST_N) can be
//! queued from synchronous contexts such as `Drop`. Data frames go through
//! [`WriterHandle::send`], which waits while more than `max_pending_frames`
//! are queued.

use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::{RSocketError, Result};
use crate::frame::{length_prefix, Frame, LENGTH_PREFIX_LEN, MAX_U24};

/// Default maximum pending frames before backpressure kicks in.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 1024;

/// Default backpressure timeout.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// A frame ready to be written to the transport.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    /// 24-bit length prefix.
    pub prefix: [u8; LENGTH_PREFIX_LEN],
    /// Encoded frame (header + body).
    pub body: Bytes,
}

impl OutboundFrame {
    /// Encode a frame for writing.
    #[inline]
    pub fn new(frame: &Frame) -> Self {
        Self::from_encoded(frame.encode())
    }

    /// Wrap an already encoded frame.
    #[inline]
    pub fn from_encoded(body: Bytes) -> Self {
        Self {
            prefix: length_prefix(body.len()),
            body,
        }
    }

    /// Total bytes on the wire (prefix + frame).
    #[inline]
    pub fn size(&self) -> usize {
        LENGTH_PREFIX_LEN + self.body.len()
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Maximum pending frames before `send` waits.
    pub max_pending_frames: usize,
    /// Timeout when waiting for backpressure to clear.
    pub backpressure_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

/// Handle for sending frames to the writer task. Cheap to clone.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::UnboundedSender<OutboundFrame>,
    pending: Arc<AtomicUsize>,
    max_pending: usize,
    timeout: Duration,
    shutdown: Arc<watch::Sender<bool>>,
}

impl WriterHandle {
    /// Queue a frame, waiting while backpressure is active.
    ///
    /// # Errors
    ///
    /// `BackpressureTimeout` if the queue does not drain in time,
    /// `ConnectionClosed` if the writer task has stopped.
    pub async fn send(&self, frame: &Frame) -> Result<()> {
        if self.pending.load(Ordering::Acquire) >= self.max_pending {
            self.wait_for_backpressure().await?;
        }
        self.send_now(frame)
    }

    /// Queue a frame immediately, ignoring the pending limit.
    ///
    /// # Errors
    ///
    /// `FrameTooLarge` if the frame cannot be length-prefixed; nothing is queued.
    pub fn send_now(&self, frame: &Frame) -> Result<()> {
        let size = frame.encoded_len();
        if size > MAX_U24 {
            return Err(RSocketError::FrameTooLarge { size, max: MAX_U24 });
        }
        self.send_outbound(OutboundFrame::new(frame))
    }

    fn send_outbound(&self, frame: OutboundFrame) -> Result<()> {
        if *self.shutdown.borrow() {
            return Err(RSocketError::ConnectionClosed);
        }
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.tx.send(frame).map_err(|_| {
            self.pending.fetch_sub(1, Ordering::Release);
            RSocketError::ConnectionClosed
        })
    }

    /// Wait for backpressure to clear with timeout.
    async fn wait_for_backpressure(&self) -> Result<()> {
        let start = Instant::now();
        let check_interval = Duration::from_micros(100);

        loop {
            if self.pending.load(Ordering::Acquire) < self.max_pending {
                return Ok(());
            }
            if self.tx.is_closed() {
                return Err(RSocketError::ConnectionClosed);
            }
            if start.elapsed() > self.timeout {
                return Err(RSocketError::BackpressureTimeout);
            }
            tokio::time::sleep(check_interval).await;
        }
    }

    /// Check if backpressure is currently active.
    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.pending.load(Ordering::Acquire) >= self.max_pending
    }

    /// Get current pending frame count.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Ask the writer task to flush what is queued and shut the transport down.
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Spawn the writer task and return a handle for sending frames.
pub fn spawn_writer_task<W>(writer: W, config: WriterConfig) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let pending = Arc::new(AtomicUsize::new(0));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let handle = WriterHandle {
        tx,
        pending: pending.clone(),
        max_pending: config.max_pending_frames,
        timeout: config.backpressure_timeout,
        shutdown: Arc::new(shutdown_tx),
    };

    let task = tokio::spawn(writer_loop(rx, writer, pending, shutdown_rx));

    (handle, task)
}

/// Receive frames and write them in batches until closed.
async fn writer_loop<W>(
    mut rx: mpsc::UnboundedReceiver<OutboundFrame>,
    mut writer: W,
    pending: Arc<AtomicUsize>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let first = tokio::select! {
            biased;
            frame = rx.recv() => frame,
            _ = shutdown.changed() => None,
        };
        let Some(first) = first else {
            break;
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        let batch_size = batch.len();
        let result = write_batch(&mut writer, &batch).await;
        pending.fetch_sub(batch_size, Ordering::Release);
        result?;
    }

    // Flush whatever was queued before the close request.
    let mut rest = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        rest.push(frame);
    }
    if !rest.is_empty() {
        let n = rest.len();
        let result = write_batch(&mut writer, &rest).await;
        pending.fetch_sub(n, Ordering::Release);
        result?;
    }
    writer.shutdown().await?;
    Ok(())
}

/// Write a batch of frames using scatter/gather I/O (write_vectored).
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    let slices = build_remaining_slices(batch, 0);
    let total_size: usize = batch.iter().map(|f| f.size()).sum();

    let mut total_written = writer.write_vectored(&slices).await?;
    if total_written == 0 {
        return Err(write_zero());
    }

    while total_written < total_size {
        let remaining = build_remaining_slices(batch, total_written);
        if remaining.is_empty() {
            break;
        }
        let written = writer.write_vectored(&remaining).await?;
        if written == 0 {
            return Err(write_zero());
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

fn write_zero() -> RSocketError {
    RSocketError::Io(std::io::Error::new(
        std::io::ErrorKind::WriteZero,
        "write_vectored returned 0",
    ))
}

/// Build IoSlice array for the data left after `skip_bytes` were written.
fn build_remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 2);
    let mut offset = 0;

    for frame in batch {
        let prefix_end = offset + LENGTH_PREFIX_LEN;
        if skip_bytes < prefix_end {
            let start = skip_bytes.saturating_sub(offset);
            slices.push(IoSlice::new(&frame.prefix[start..]));
        }
        offset = prefix_end;

        let body_end = offset + frame.body.len();
        if skip_bytes < body_end {
            let start = skip_bytes.saturating_sub(offset);
            slices.push(IoSlice::new(&frame.body[start..]));
        }
        offset = body_end;
    }

    slices
}
