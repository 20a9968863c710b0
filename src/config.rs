//! Connection and pool configuration.
//!
//! Both configs deserialize from JSON with every field optional:
//!
//! ```ignore
//! let config = MultiplexerConfig::from_json(r#"{ "fragment_size": 1024 }"#)?;
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RSocketError, Result};
use crate::fragmentation::{MAX_FRAGMENT, MIN_FRAGMENT};
use crate::writer::{WriterConfig, DEFAULT_BACKPRESSURE_TIMEOUT, DEFAULT_MAX_PENDING_FRAMES};

/// Default demand window for inbound streams.
pub const DEFAULT_REQUEST_N: u32 = 256;

pub const DEFAULT_KEEPALIVE_INTERVAL_MS: u64 = 20_000;
pub const DEFAULT_MAX_LIFETIME_MS: u64 = 90_000;
pub const DEFAULT_MIME_TYPE: &str = "application/binary";
pub const DEFAULT_MAX_CONCURRENT_RESPONDERS: usize = 256;

/// Settings for one multiplexed connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiplexerConfig {
    /// Fragment unit in bytes, 0 disables outbound fragmentation.
    pub fragment_size: usize,
    /// Demand window kept outstanding by `PayloadStream`.
    pub request_n: u32,
    /// Largest inbound frame accepted.
    pub max_frame_size: usize,
    pub max_pending_frames: usize,
    pub backpressure_timeout_ms: u64,
    /// 0 disables keepalive.
    pub keepalive_interval_ms: u64,
    pub max_lifetime_ms: u64,
    pub metadata_mime_type: String,
    pub data_mime_type: String,
    /// Inbound requests served at once; further requests are rejected.
    pub max_concurrent_responders: usize,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            fragment_size: 0,
            request_n: DEFAULT_REQUEST_N,
            max_frame_size: MAX_FRAGMENT,
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            backpressure_timeout_ms: DEFAULT_BACKPRESSURE_TIMEOUT.as_millis() as u64,
            keepalive_interval_ms: DEFAULT_KEEPALIVE_INTERVAL_MS,
            max_lifetime_ms: DEFAULT_MAX_LIFETIME_MS,
            metadata_mime_type: DEFAULT_MIME_TYPE.to_string(),
            data_mime_type: DEFAULT_MIME_TYPE.to_string(),
            max_concurrent_responders: DEFAULT_MAX_CONCURRENT_RESPONDERS,
        }
    }
}

impl MultiplexerConfig {
    /// Parse from JSON and validate.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check ranges that would otherwise fail later.
    pub fn validate(&self) -> Result<()> {
        if self.fragment_size != 0 && !(MIN_FRAGMENT..=MAX_FRAGMENT).contains(&self.fragment_size) {
            return Err(RSocketError::InvalidFragmentSize {
                size: self.fragment_size,
                min: MIN_FRAGMENT,
                max: MAX_FRAGMENT,
            });
        }
        Ok(())
    }

    pub fn writer_config(&self) -> WriterConfig {
        WriterConfig {
            max_pending_frames: self.max_pending_frames,
            backpressure_timeout: Duration::from_millis(self.backpressure_timeout_ms),
        }
    }

    pub fn keepalive_interval(&self) -> Option<Duration> {
        (self.keepalive_interval_ms > 0).then(|| Duration::from_millis(self.keepalive_interval_ms))
    }

    pub fn max_lifetime(&self) -> Duration {
        Duration::from_millis(self.max_lifetime_ms)
    }
}

/// Settings for the load-balancing pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    /// Below this many members the pool grows on every selection.
    pub min_actives: usize,
    /// Above this many members the pool never grows.
    pub max_actives: usize,
    pub lower_quantile: f64,
    pub higher_quantile: f64,
    /// Exponent applied to the latency penalty outside the quantile band.
    pub exp_factor: f64,
    /// Seed for every random source in the pool.
    pub seed: Option<u64>,
    /// Half-life of the per-connection latency average.
    pub latency_half_life_ms: u64,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            min_actives: 30,
            max_actives: 100,
            lower_quantile: 0.2,
            higher_quantile: 0.8,
            exp_factor: 4.0,
            seed: None,
            latency_half_life_ms: 5_000,
        }
    }
}

impl BalancerConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn latency_half_life(&self) -> Duration {
        Duration::from_millis(self.latency_half_life_ms)
    }
}
