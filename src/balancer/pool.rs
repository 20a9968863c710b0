//! Latency-aware connection pool.
//!
//! Every call picks one member by power-of-two-choices: draw two distinct
//! members at random and use the one with the higher weight
//!
//! ```text
//! w = availability / (1 + latency' * (pending + 1))
//! ```
//!
//! where `latency'` is the member's predicted latency pushed down when it is
//! under the pool's low latency band and up when it is over the high band.
//!
//! Targets are connected lazily. While fewer than `min_actives` members are
//! up and targets remain in the reserve, a call first connects more of them.
//! A member whose connection closes is evicted and its target goes back to
//! the reserve.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::failing::FailingSocket;
use super::quantile::{FrugalQuantile, LatencyBands};
use super::supplier::{Reserve, Supplier};
use super::weighted::WeightedConnection;
use crate::config::BalancerConfig;
use crate::error::{RSocketError, Result};
use crate::payload::Payload;
use crate::socket::RSocket;
use crate::stream::{PayloadStream, ResponseHandle, ResponseStream};
use crate::transport::Connector;

/// Draws per selection while both candidates are unavailable.
const EFFORT: usize = 5;

struct PoolState {
    actives: Vec<Arc<WeightedConnection>>,
    reserve: Reserve,
    targets: HashSet<String>,
    rng: StdRng,
    closed: bool,
}

struct Inner {
    state: Mutex<PoolState>,
    bands: Arc<LatencyBands>,
    connector: Arc<dyn Connector>,
    config: BalancerConfig,
    next_id: AtomicU64,
}

/// A single logical client spread over several connections.
#[derive(Clone)]
pub struct LoadBalancer {
    inner: Arc<Inner>,
}

fn dedup(uris: impl IntoIterator<Item = impl Into<String>>) -> Vec<String> {
    let mut seen = HashSet::new();
    uris.into_iter()
        .map(Into::into)
        .filter(|uri| seen.insert(uri.clone()))
        .collect()
}

/// Selection weight of one candidate. See the module docs.
pub fn algorithmic_weight(
    availability: f64,
    pending: usize,
    latency: f64,
    low: f64,
    high: f64,
    exp_factor: f64,
) -> f64 {
    if availability <= 0.0 {
        return 0.0;
    }
    let high = high.max(low * 1.001);
    let bandwidth = (high - low).max(1.0);
    let mut latency = latency;
    if latency < low {
        let alpha = (low - latency) / bandwidth;
        latency /= (1.0 + alpha).powf(exp_factor);
    } else if latency > high {
        let alpha = (latency - high) / bandwidth;
        latency *= (1.0 + alpha).powf(exp_factor);
    }
    availability / (1.0 + latency * (pending as f64 + 1.0))
}

impl LoadBalancer {
    /// Create a pool over `uris`. Nothing is connected until the first call.
    ///
    /// Fails with [`RSocketError::InsufficientTargets`] for fewer than two
    /// distinct targets.
    pub fn start(
        uris: impl IntoIterator<Item = impl Into<String>>,
        connector: Arc<dyn Connector>,
        config: BalancerConfig,
    ) -> Result<Self> {
        let uris = dedup(uris);
        if uris.len() < 2 {
            return Err(RSocketError::InsufficientTargets(uris.len()));
        }

        let rng = |offset: u64| match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(offset)),
            None => StdRng::from_entropy(),
        };
        let bands = LatencyBands::new(
            FrugalQuantile::new(config.lower_quantile, 1.0, rng(1)),
            FrugalQuantile::new(config.higher_quantile, 1.0, rng(2)),
        );
        let state = PoolState {
            actives: Vec::new(),
            reserve: Reserve::new(uris.iter().map(|u| Supplier::new(u.clone(), connector.clone()))),
            targets: uris.iter().cloned().collect(),
            rng: rng(0),
            closed: false,
        };

        tracing::debug!("pool started with {} targets", uris.len());
        Ok(Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                bands: Arc::new(bands),
                connector,
                config,
                next_id: AtomicU64::new(1),
            }),
        })
    }

    /// Replace the target set.
    ///
    /// Members whose URI is not in `uris` are evicted and closed, the rest
    /// stay as they are. The reserve becomes the new targets that have no
    /// active member.
    pub async fn rebalance(&self, uris: impl IntoIterator<Item = impl Into<String>>) -> Result<()> {
        let uris = dedup(uris);
        if uris.is_empty() {
            return Err(RSocketError::InsufficientTargets(0));
        }

        let removed = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(RSocketError::ConnectionClosed);
            }
            state.targets = uris.iter().cloned().collect();

            let (survivors, removed): (Vec<_>, Vec<_>) = std::mem::take(&mut state.actives)
                .into_iter()
                .partition(|c| state.targets.contains(c.uri()));
            state.actives = survivors;

            let live: HashSet<String> = state.actives.iter().map(|c| c.uri().to_string()).collect();
            let connector = self.inner.connector.clone();
            state.reserve.reset(
                uris.iter()
                    .filter(|u| !live.contains(*u))
                    .map(|u| Supplier::new(u.clone(), connector.clone())),
            );
            tracing::debug!(
                "rebalance: {} kept, {} removed, reserve {:?}",
                state.actives.len(),
                removed.len(),
                state.reserve.uris()
            );
            removed
        };

        for connection in removed {
            tracing::debug!("closing evicted member {}", connection.uri());
            let _ = connection.close().await;
        }
        Ok(())
    }

    /// Close every member. Fails with the number of members that did not close.
    pub async fn close_all(&self) -> Result<()> {
        let actives = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            state.reserve.clear();
            std::mem::take(&mut state.actives)
        };

        let mut failed = 0;
        for connection in actives {
            if let Err(e) = connection.close().await {
                tracing::warn!("closing {} failed: {}", connection.uri(), e);
                failed += 1;
            }
        }
        if failed > 0 {
            return Err(RSocketError::CloseFailed(failed));
        }
        Ok(())
    }

    /// URIs of the connected members.
    pub fn active_uris(&self) -> Vec<String> {
        let state = self.inner.state.lock();
        state.actives.iter().map(|c| c.uri().to_string()).collect()
    }

    /// URIs waiting to be connected.
    pub fn reserve_uris(&self) -> Vec<String> {
        self.inner.state.lock().reserve.uris()
    }

    /// Current low and high latency bands in milliseconds.
    pub fn latency_bands(&self) -> (f64, f64) {
        (self.inner.bands.lower(), self.inner.bands.higher())
    }

    /// Pick the member for one call, or the failing sentinel when none is up.
    pub async fn select(&self) -> Arc<dyn RSocket> {
        match self.next().await {
            Some(connection) => connection as Arc<dyn RSocket>,
            None => Arc::new(FailingSocket) as Arc<dyn RSocket>,
        }
    }

    async fn next(&self) -> Option<Arc<WeightedConnection>> {
        self.refresh().await;

        let (chosen, acquire) = {
            let mut state = self.inner.state.lock();
            let n = state.actives.len();
            match n {
                0 => return None,
                1 => return Some(state.actives[0].clone()),
                _ => {}
            }

            let mut pair = None;
            let mut acquire = false;
            for attempt in 0..EFFORT {
                let i1 = state.rng.gen_range(0..n);
                let mut i2 = state.rng.gen_range(0..n - 1);
                if i2 >= i1 {
                    i2 += 1;
                }
                let a = state.actives[i1].clone();
                let b = state.actives[i2].clone();
                let usable = a.availability() > 0.0 && b.availability() > 0.0;
                pair = Some((a, b));
                if usable {
                    break;
                }
                if attempt + 1 == EFFORT && !state.reserve.is_empty() {
                    acquire = true;
                }
            }
            let (a, b) = pair?;

            let (low, high) = (self.inner.bands.lower(), self.inner.bands.higher());
            let weight = |c: &WeightedConnection| {
                algorithmic_weight(
                    c.availability(),
                    c.pending(),
                    c.predicted_latency(),
                    low,
                    high,
                    self.inner.config.exp_factor,
                )
            };
            let (wa, wb) = (weight(a.as_ref()), weight(b.as_ref()));
            let chosen = if wa < wb {
                tracing::debug!("choose {} over {} ({:.8} > {:.8})", b.uri(), a.uri(), wb, wa);
                b
            } else {
                tracing::debug!("choose {} over {} ({:.8} >= {:.8})", a.uri(), b.uri(), wa, wb);
                a
            };
            (chosen, acquire)
        };

        if acquire {
            self.acquire().await;
        }
        Some(chosen)
    }

    /// Connect reserve targets while the pool is under `min_actives`.
    /// Each target is tried at most once per refresh.
    async fn refresh(&self) {
        let budget = {
            let state = self.inner.state.lock();
            let config = &self.inner.config;
            let actives = state.actives.len();
            if actives >= config.min_actives.min(config.max_actives) {
                return;
            }
            (config.min_actives - actives).min(state.reserve.len())
        };

        let mut failed = Vec::new();
        for _ in 0..budget {
            match self.try_acquire().await {
                Acquired::Added => {}
                Acquired::Failed(supplier) => failed.push(supplier),
                Acquired::Nothing => break,
            }
        }
        for supplier in failed {
            self.inner.return_supplier(supplier);
        }
    }

    /// Connect one target from the reserve. False if none was added.
    async fn acquire(&self) -> bool {
        match self.try_acquire().await {
            Acquired::Added => true,
            Acquired::Failed(supplier) => {
                self.inner.return_supplier(supplier);
                false
            }
            Acquired::Nothing => false,
        }
    }

    async fn try_acquire(&self) -> Acquired {
        let supplier = {
            let mut state = self.inner.state.lock();
            if state.closed || state.actives.len() >= self.inner.config.max_actives {
                return Acquired::Nothing;
            }
            let PoolState { reserve, rng, .. } = &mut *state;
            match reserve.take(rng) {
                Some(supplier) => supplier,
                None => {
                    tracing::debug!("no supplier available");
                    return Acquired::Nothing;
                }
            }
        };

        tracing::debug!("acquiring {}", supplier.uri());
        let socket = match supplier.connect().await {
            Ok(socket) => socket,
            Err(e) => {
                tracing::warn!("connecting {} failed: {}", supplier.uri(), e);
                return Acquired::Failed(supplier);
            }
        };

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let connection = Arc::new(WeightedConnection::new(
            id,
            supplier.uri(),
            socket,
            self.inner.bands.clone(),
            self.inner.config.latency_half_life(),
        ));

        let admission = {
            let mut state = self.inner.state.lock();
            if state.closed || !state.targets.contains(supplier.uri()) {
                Admission::Unwanted
            } else if state.actives.len() >= self.inner.config.max_actives {
                Admission::Full
            } else {
                state.actives.push(connection.clone());
                Admission::Admitted
            }
        };
        match admission {
            Admission::Admitted => {}
            Admission::Unwanted => {
                tracing::debug!("{} no longer wanted, closing", supplier.uri());
                connection.socket().close();
                return Acquired::Nothing;
            }
            Admission::Full => {
                // Another refresh filled the pool while this one was connecting.
                tracing::debug!("pool full, closing surplus {}", supplier.uri());
                connection.socket().close();
                return Acquired::Failed(supplier);
            }
        }

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        connection.socket().on_close(move || {
            if let Some(inner) = weak.upgrade() {
                inner.unload(id, supplier);
            }
        });
        Acquired::Added
    }
}

enum Acquired {
    Added,
    /// Not added; the supplier goes back to the reserve.
    Failed(Supplier),
    Nothing,
}

enum Admission {
    Admitted,
    Unwanted,
    Full,
}

impl Inner {
    /// Drop a member whose connection closed and make its target connectable again.
    fn unload(&self, id: u64, supplier: Supplier) {
        let mut state = self.state.lock();
        if let Some(idx) = state.actives.iter().position(|c| c.id() == id) {
            state.actives.swap_remove(idx);
            tracing::debug!("unloaded {}", supplier.uri());
        }
        drop(state);
        self.return_supplier(supplier);
    }

    fn return_supplier(&self, supplier: Supplier) {
        let mut state = self.state.lock();
        let uri = supplier.uri();
        if state.closed
            || !state.targets.contains(uri)
            || state.actives.iter().any(|c| c.uri() == uri)
        {
            return;
        }
        state.reserve.give_back(supplier);
    }
}

impl std::fmt::Debug for LoadBalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("LoadBalancer")
            .field("actives", &state.actives)
            .field("reserve", &state.reserve)
            .field("closed", &state.closed)
            .finish()
    }
}

#[async_trait]
impl RSocket for LoadBalancer {
    async fn fire_and_forget(&self, payload: Payload) -> Result<()> {
        self.select().await.fire_and_forget(payload).await
    }

    async fn metadata_push(&self, payload: Payload) -> Result<()> {
        self.select().await.metadata_push(payload).await
    }

    fn request_response(&self, payload: Payload) -> ResponseHandle {
        let pool = self.clone();
        ResponseHandle::deferred(async move { pool.select().await.request_response(payload) })
    }

    fn request_stream(&self, payload: Payload) -> PayloadStream {
        let pool = self.clone();
        PayloadStream::deferred(async move { pool.select().await.request_stream(payload) })
    }

    fn request_channel(&self, outbound: ResponseStream) -> PayloadStream {
        let pool = self.clone();
        PayloadStream::deferred(async move { pool.select().await.request_channel(outbound) })
    }

    /// Mean availability of the members, 0.0 when there are none.
    fn availability(&self) -> f64 {
        let state = self.inner.state.lock();
        if state.actives.is_empty() {
            return 0.0;
        }
        let total: f64 = state.actives.iter().map(|c| c.availability()).sum();
        total / state.actives.len() as f64
    }

    fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    async fn close(&self) -> Result<()> {
        self.close_all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multiplexer::Multiplexer;
    use crate::stream::ResponderBuilder;
    use std::collections::HashMap;

    /// Connects every URI to an in-process server that answers with its URI.
    #[derive(Default)]
    struct Loopback {
        servers: Mutex<HashMap<String, Vec<Multiplexer>>>,
        refuse: Mutex<HashSet<String>>,
        delay: Option<std::time::Duration>,
    }

    impl Loopback {
        fn connects(&self, uri: &str) -> usize {
            self.servers.lock().get(uri).map_or(0, Vec::len)
        }

        fn drop_server(&self, uri: &str) {
            if let Some(servers) = self.servers.lock().get(uri) {
                for server in servers {
                    server.close();
                }
            }
        }
    }

    #[async_trait]
    impl Connector for Loopback {
        async fn connect(&self, uri: &str) -> Result<Multiplexer> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.refuse.lock().contains(uri) {
                return Err(RSocketError::Io(std::io::ErrorKind::ConnectionRefused.into()));
            }
            let (a, b) = tokio::io::duplex(64 * 1024);
            let name = uri.to_string();
            let responder = ResponderBuilder::new()
                .request_response(move |_p: Payload| {
                    let name = name.clone();
                    async move { Ok(Payload::from(name)) }
                })
                .build();
            let server = Multiplexer::builder().responder(responder).server(b)?;
            self.servers
                .lock()
                .entry(uri.to_string())
                .or_default()
                .push(server);
            Multiplexer::builder()
                .keepalive(std::time::Duration::ZERO, std::time::Duration::ZERO)
                .client(a)
        }
    }

    fn config(seed: u64, min_actives: usize) -> BalancerConfig {
        BalancerConfig {
            min_actives,
            seed: Some(seed),
            ..BalancerConfig::default()
        }
    }

    async fn ask(pool: &LoadBalancer) -> String {
        pool.request_response(Payload::from("who"))
            .await
            .unwrap()
            .data_utf8()
    }

    #[test]
    fn test_weight_prefers_fast_and_idle() {
        let fast = algorithmic_weight(1.0, 0, 10.0, 20.0, 80.0, 4.0);
        let slow = algorithmic_weight(1.0, 0, 200.0, 20.0, 80.0, 4.0);
        let busy = algorithmic_weight(1.0, 10, 10.0, 20.0, 80.0, 4.0);
        assert!(fast > slow);
        assert!(fast > busy);
        assert_eq!(algorithmic_weight(0.0, 0, 1.0, 20.0, 80.0, 4.0), 0.0);
    }

    #[test]
    fn test_weight_band_adjustment() {
        // inside the band latency is used as is
        let w = algorithmic_weight(1.0, 0, 50.0, 20.0, 80.0, 4.0);
        assert!((w - 1.0 / 51.0).abs() < 1e-12);
        // one bandwidth above the high band: latency * 2^4
        let w = algorithmic_weight(1.0, 0, 140.0, 20.0, 80.0, 4.0);
        assert!((w - 1.0 / (1.0 + 140.0 * 16.0)).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_p2c_returns_higher_weight_candidate() {
        let connector = Arc::new(Loopback::default());
        let pool = LoadBalancer::start(["a", "b"], connector, config(9, 2)).unwrap();
        // Members start at the low band, so give it a non-zero latency first.
        pool.inner.bands.insert(10.0);
        pool.select().await;
        let actives = pool.inner.state.lock().actives.clone();
        assert_eq!(actives.len(), 2);
        assert_eq!(actives[0].predicted_latency(), 10.0);
        assert_eq!(actives[1].predicted_latency(), 10.0);

        // Replays the pool's draws: first index, then the second from n - 1.
        let first_draw = |rng: &mut StdRng| {
            let i1 = rng.gen_range(0..2);
            let _ = rng.gen_range(0..1);
            i1
        };

        // Equal weights: the first draw wins.
        let mut shadow = pool.inner.state.lock().rng.clone();
        for _ in 0..20 {
            let expected = &actives[first_draw(&mut shadow)];
            let chosen = pool.next().await.unwrap();
            assert_eq!(chosen.id(), expected.id());
        }

        // Unpolled streams count as pending without touching the wire.
        let busy = actives.iter().find(|c| c.uri() == "a").unwrap().clone();
        let held: Vec<_> = (0..8).map(|_| busy.request_stream(Payload::from("x"))).collect();
        assert_eq!(busy.pending(), 8);

        let mut shadow = pool.inner.state.lock().rng.clone();
        let mut busy_drawn_first = 0;
        for _ in 0..20 {
            if actives[first_draw(&mut shadow)].uri() == "a" {
                busy_drawn_first += 1;
            }
            assert_eq!(pool.next().await.unwrap().uri(), "b");
        }
        assert!(busy_drawn_first > 0);

        drop(held);
        assert_eq!(busy.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_refresh_respects_max_actives() {
        let connector = Arc::new(Loopback {
            delay: Some(std::time::Duration::from_millis(10)),
            ..Loopback::default()
        });
        let config = BalancerConfig {
            min_actives: 1,
            max_actives: 1,
            seed: Some(11),
            ..BalancerConfig::default()
        };
        let pool = LoadBalancer::start(["a", "b", "c"], connector, config).unwrap();

        // All three see an empty pool and start connecting.
        tokio::join!(pool.select(), pool.select(), pool.select());

        assert_eq!(pool.active_uris().len(), 1);
        let mut everything = pool.active_uris();
        everything.extend(pool.reserve_uris());
        everything.sort();
        assert_eq!(everything, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_start_needs_two_targets() {
        let connector: Arc<dyn Connector> = Arc::new(Loopback::default());
        let err = LoadBalancer::start(["a", "a"], connector.clone(), BalancerConfig::default())
            .unwrap_err();
        assert!(matches!(err, RSocketError::InsufficientTargets(1)));
        assert!(LoadBalancer::start(["a", "b"], connector, BalancerConfig::default()).is_ok());
    }

    #[tokio::test]
    async fn test_lazy_acquisition_up_to_min_actives() {
        let connector = Arc::new(Loopback::default());
        let pool = LoadBalancer::start(["a", "b", "c"], connector.clone(), config(1, 2)).unwrap();
        assert!(pool.active_uris().is_empty());

        let served = ask(&pool).await;
        assert_eq!(pool.active_uris().len(), 2);
        assert_eq!(pool.reserve_uris().len(), 1);
        assert!(pool.active_uris().contains(&served));
    }

    #[tokio::test]
    async fn test_refused_target_returns_to_reserve() {
        let connector = Arc::new(Loopback::default());
        connector.refuse.lock().insert("bad".to_string());
        let pool = LoadBalancer::start(["bad", "good"], connector.clone(), config(2, 2)).unwrap();

        assert_eq!(ask(&pool).await, "good");
        assert_eq!(pool.active_uris(), vec!["good"]);
        assert_eq!(pool.reserve_uris(), vec!["bad"]);
    }

    #[tokio::test]
    async fn test_all_refused_fails_fast() {
        let connector = Arc::new(Loopback::default());
        connector.refuse.lock().extend(["a".to_string(), "b".to_string()]);
        let pool = LoadBalancer::start(["a", "b"], connector, config(3, 2)).unwrap();

        let err = pool.request_response(Payload::from("x")).await.unwrap_err();
        assert!(matches!(err, RSocketError::NoAvailableConnection));
        assert!(matches!(
            pool.fire_and_forget(Payload::from("x")).await,
            Err(RSocketError::NoAvailableConnection)
        ));
    }

    #[tokio::test]
    async fn test_closed_member_is_evicted_and_reconnected() {
        let connector = Arc::new(Loopback::default());
        let pool = LoadBalancer::start(["a", "b"], connector.clone(), config(4, 2)).unwrap();
        ask(&pool).await;
        assert_eq!(pool.active_uris().len(), 2);

        connector.drop_server("a");
        // wait for the client side to see EOF
        for _ in 0..100 {
            if pool.active_uris() == vec!["b"] {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(pool.active_uris(), vec!["b"]);
        assert_eq!(pool.reserve_uris(), vec!["a"]);

        ask(&pool).await;
        assert_eq!(connector.connects("a"), 2);
        let mut actives = pool.active_uris();
        actives.sort();
        assert_eq!(actives, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_close_all() {
        let connector = Arc::new(Loopback::default());
        let pool = LoadBalancer::start(["a", "b"], connector, config(5, 2)).unwrap();
        ask(&pool).await;

        pool.close().await.unwrap();
        assert!(RSocket::is_closed(&pool));
        assert!(pool.active_uris().is_empty());
        assert!(matches!(
            pool.request_response(Payload::from("x")).await,
            Err(RSocketError::NoAvailableConnection)
        ));
    }
}
