use std::time::Duration;

use tokio::time::Instant;

/// Exponentially weighted moving average with a time-based half-life.
///
/// A sample's weight halves every `half_life` after it was taken, so sparse
/// traffic still tracks recent latency.
#[derive(Debug, Clone)]
pub struct Ewma {
    tau: f64,
    value: f64,
    stamp: Option<Instant>,
}

impl Ewma {
    pub fn new(half_life: Duration, initial: f64) -> Self {
        let half_life = half_life.as_secs_f64().max(f64::EPSILON);
        Self {
            tau: half_life / std::f64::consts::LN_2,
            value: initial,
            stamp: None,
        }
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn insert(&mut self, x: f64) {
        self.insert_at(x, Instant::now());
    }

    pub fn insert_at(&mut self, x: f64, now: Instant) {
        let w = match self.stamp {
            // first sample replaces the initial guess
            None => 0.0,
            Some(stamp) => {
                let elapsed = now.saturating_duration_since(stamp).as_secs_f64();
                (-elapsed / self.tau).exp()
            }
        };
        self.stamp = Some(now);
        self.value = w * self.value + (1.0 - w) * x;
    }
}
