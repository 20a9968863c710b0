use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::ewma::Ewma;
use super::quantile::LatencyBands;
use crate::error::Result;
use crate::multiplexer::Multiplexer;
use crate::payload::Payload;
use crate::socket::RSocket;
use crate::stream::{PayloadStream, ResponseHandle, ResponseStream};

struct Stats {
    pending: AtomicUsize,
    latency: Mutex<Ewma>,
    bands: Arc<LatencyBands>,
}

impl Stats {
    fn observe(&self, start: Instant) {
        let ms = start.elapsed().as_secs_f64() * 1000.0;
        self.latency.lock().insert(ms);
        self.bands.insert(ms);
    }

    fn done(&self) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A pool member: one multiplexer plus the load figures selection reads.
///
/// Every request-response, request-stream and request-channel counts as
/// pending from dispatch until its terminal signal. Latency is sampled at
/// the response (request-response) or the first signal (streams) and fed to
/// both the member's moving average and the pool-wide bands.
pub struct WeightedConnection {
    id: u64,
    uri: String,
    socket: Multiplexer,
    stats: Arc<Stats>,
}

impl WeightedConnection {
    /// The latency estimate starts at the pool's current low band.
    pub fn new(
        id: u64,
        uri: impl Into<String>,
        socket: Multiplexer,
        bands: Arc<LatencyBands>,
        half_life: Duration,
    ) -> Self {
        let initial = bands.lower();
        Self {
            id,
            uri: uri.into(),
            socket,
            stats: Arc::new(Stats {
                pending: AtomicUsize::new(0),
                latency: Mutex::new(Ewma::new(half_life, initial)),
                bands,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn socket(&self) -> &Multiplexer {
        &self.socket
    }

    pub fn pending(&self) -> usize {
        self.stats.pending.load(Ordering::Acquire)
    }

    /// Predicted round trip in milliseconds.
    pub fn predicted_latency(&self) -> f64 {
        self.stats.latency.lock().value()
    }

    fn dispatch(&self) -> (Arc<Stats>, Instant) {
        self.stats.pending.fetch_add(1, Ordering::AcqRel);
        (self.stats.clone(), Instant::now())
    }

    fn track(&self, stream: PayloadStream) -> PayloadStream {
        let (stats, start) = self.dispatch();
        let first = stats.clone();
        stream
            .on_first(move || first.observe(start))
            .on_finish(move |_| stats.done())
    }
}

impl std::fmt::Debug for WeightedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeightedConnection")
            .field("uri", &self.uri)
            .field("pending", &self.pending())
            .field("latency_ms", &self.predicted_latency())
            .field("availability", &self.availability())
            .finish()
    }
}

#[async_trait]
impl RSocket for WeightedConnection {
    async fn fire_and_forget(&self, payload: Payload) -> Result<()> {
        self.socket.fire_and_forget(payload).await
    }

    async fn metadata_push(&self, payload: Payload) -> Result<()> {
        self.socket.metadata_push(payload).await
    }

    fn request_response(&self, payload: Payload) -> ResponseHandle {
        let (stats, start) = self.dispatch();
        self.socket
            .request_response(payload)
            .on_finish(move |ok| {
                if ok {
                    stats.observe(start);
                }
                stats.done();
            })
    }

    fn request_stream(&self, payload: Payload) -> PayloadStream {
        self.track(self.socket.request_stream(payload))
    }

    fn request_channel(&self, outbound: ResponseStream) -> PayloadStream {
        self.track(self.socket.request_channel(outbound))
    }

    fn availability(&self) -> f64 {
        self.socket.availability()
    }

    fn is_closed(&self) -> bool {
        self.socket.is_closed()
    }

    async fn close(&self) -> Result<()> {
        self.socket.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::quantile::FrugalQuantile;
    use crate::stream::ResponderBuilder;
    use futures::StreamExt;

    fn connection() -> WeightedConnection {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let responder = ResponderBuilder::new()
            .request_response(|p: Payload| async move { Ok(p) })
            .request_stream(|_p: Payload| {
                futures::stream::iter(vec![Ok(Payload::from("1")), Ok(Payload::from("2"))])
            })
            .build();
        let _server = Multiplexer::builder().responder(responder).server(b).unwrap();
        let client = Multiplexer::builder().client(a).unwrap();
        let bands = Arc::new(LatencyBands::new(
            FrugalQuantile::with_seed(0.2, 1),
            FrugalQuantile::with_seed(0.8, 2),
        ));
        WeightedConnection::new(1, "tcp://a:1", client, bands, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_pending_tracks_request_response() {
        let conn = connection();
        let handle = conn.request_response(Payload::from("x"));
        assert_eq!(conn.pending(), 1);
        handle.await.unwrap();
        assert_eq!(conn.pending(), 0);
        assert!(conn.predicted_latency() >= 0.0);
    }

    #[tokio::test]
    async fn test_pending_tracks_stream_until_end() {
        let conn = connection();
        let mut stream = conn.request_stream(Payload::from("x"));
        assert_eq!(conn.pending(), 1);
        assert!(stream.next().await.unwrap().is_ok());
        assert_eq!(conn.pending(), 1);
        while stream.next().await.is_some() {}
        assert_eq!(conn.pending(), 0);
    }

    #[tokio::test]
    async fn test_cancel_releases_pending() {
        let conn = connection();
        let handle = conn.request_response(Payload::from("x"));
        drop(handle);
        assert_eq!(conn.pending(), 0);
    }

    #[tokio::test]
    async fn test_closed_connection_unavailable() {
        let conn = connection();
        assert_eq!(conn.availability(), 1.0);
        conn.close().await.unwrap();
        assert_eq!(conn.availability(), 0.0);
        assert!(RSocket::is_closed(&conn));
    }
}
