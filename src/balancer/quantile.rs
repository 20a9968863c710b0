//! Constant-memory streaming quantile estimation.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Frugal streaming estimate of one quantile.
///
/// Each sample moves the estimate toward itself with probability tied to the
/// target quantile; the step grows while consecutive moves go the same way
/// and resets when the direction flips. No history is kept.
#[derive(Debug)]
pub struct FrugalQuantile {
    quantile: f64,
    increment: f64,
    estimate: f64,
    step: f64,
    sign: i8,
    rng: StdRng,
}

impl FrugalQuantile {
    pub fn new(quantile: f64, increment: f64, rng: StdRng) -> Self {
        Self {
            quantile: quantile.clamp(0.0, 1.0),
            increment,
            estimate: 0.0,
            step: 1.0,
            sign: 0,
            rng,
        }
    }

    pub fn with_seed(quantile: f64, seed: u64) -> Self {
        Self::new(quantile, 1.0, StdRng::seed_from_u64(seed))
    }

    pub fn estimation(&self) -> f64 {
        self.estimate
    }

    pub fn insert(&mut self, x: f64) {
        if self.sign == 0 {
            self.estimate = x;
            self.sign = 1;
            return;
        }

        let v: f64 = self.rng.gen();
        if x > self.estimate && v > 1.0 - self.quantile {
            self.higher(x);
        } else if x < self.estimate && v > self.quantile {
            self.lower(x);
        }
    }

    fn higher(&mut self, x: f64) {
        self.step += f64::from(self.sign) * self.increment;
        if self.step > 0.0 {
            self.estimate += self.step;
        } else {
            self.estimate += 1.0;
        }
        // never overshoot the sample
        if self.estimate > x {
            self.step += x - self.estimate;
            self.estimate = x;
        }
        if self.sign < 0 {
            self.step = 1.0;
        }
        self.sign = 1;
    }

    fn lower(&mut self, x: f64) {
        self.step -= f64::from(self.sign) * self.increment;
        if self.step > 0.0 {
            self.estimate -= self.step;
        } else {
            self.estimate -= 1.0;
        }
        if self.estimate < x {
            self.step += self.estimate - x;
            self.estimate = x;
        }
        if self.sign > 0 {
            self.step = 1.0;
        }
        self.sign = -1;
    }
}

/// The pool-wide low/high latency bands, in milliseconds.
#[derive(Debug)]
pub struct LatencyBands {
    lower: Mutex<FrugalQuantile>,
    higher: Mutex<FrugalQuantile>,
}

impl LatencyBands {
    pub fn new(lower: FrugalQuantile, higher: FrugalQuantile) -> Self {
        Self {
            lower: Mutex::new(lower),
            higher: Mutex::new(higher),
        }
    }

    pub fn insert(&self, latency_ms: f64) {
        self.lower.lock().insert(latency_ms);
        self.higher.lock().insert(latency_ms);
    }

    pub fn lower(&self) -> f64 {
        self.lower.lock().estimation()
    }

    pub fn higher(&self) -> f64 {
        self.higher.lock().estimation()
    }
}
