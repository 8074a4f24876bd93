use rand::Rng;
use serde::{Deserialize, Serialize};
use std::thread;
use std::time::Duration;

/// Inclusive millisecond range a pacing delay is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Jitter {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl Jitter {
    pub const fn new(min_ms: u64, max_ms: u64) -> Self {
        Self { min_ms, max_ms }
    }

    pub const fn fixed(ms: u64) -> Self {
        Self { min_ms: ms, max_ms: ms }
    }

    /// Draw one delay. A reversed range is treated as its lower bound.
    pub fn sample(&self) -> Duration {
        let ms = if self.max_ms > self.min_ms {
            rand::thread_rng().gen_range(self.min_ms..=self.max_ms)
        } else {
            self.min_ms
        };
        Duration::from_millis(ms)
    }
}

/// Sleep for a random duration drawn from `jitter`.
pub fn sleep_jitter(jitter: &Jitter) {
    let d = jitter.sample();
    if !d.is_zero() {
        thread::sleep(d);
    }
}

/// Sleep for exact milliseconds (no jitter).
pub fn sleep_ms(ms: u64) {
    if ms > 0 {
        thread::sleep(Duration::from_millis(ms));
    }
}

/// Offset `value` by a uniform random amount in `-spread..=spread`.
pub fn spread(value: i32, spread: i32) -> i32 {
    if spread <= 0 {
        return value;
    }
    value + rand::thread_rng().gen_range(-spread..=spread)
}
