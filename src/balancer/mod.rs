//! Client-side load balancing over several connections.
//!
//! ```ignore
//! let connector = Arc::new(TransportConnector::default());
//! let pool = LoadBalancer::start(
//!     ["tcp://10.0.0.1:7878", "tcp://10.0.0.2:7878"],
//!     connector,
//!     BalancerConfig::default(),
//! )?;
//!
//! let reply = pool.request_response(Payload::from("ping")).await?;
//! pool.rebalance(["tcp://10.0.0.2:7878", "tcp://10.0.0.3:7878"]).await?;
//! ```

mod ewma;
mod failing;
mod pool;
mod quantile;
mod supplier;
mod weighted;

pub use ewma::Ewma;
pub use failing::FailingSocket;
pub use pool::{algorithmic_weight, LoadBalancer};
pub use quantile::{FrugalQuantile, LatencyBands};
pub use supplier::{Reserve, Supplier};
pub use weighted::WeightedConnection;
