//! Reconnect backoff with bounded jitter.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use k1_core::LinkConfig;

/// Doubling backoff. Each delay is `min(ceiling, backoff + jitter)` with
/// jitter uniform in `[0, min(jitter_cap, backoff / 2)]`.
#[derive(Debug)]
pub struct Backoff {
    floor_ms: u64,
    ceiling_ms: u64,
    jitter_cap_ms: u64,
    current_ms: u64,
    rng: StdRng,
}

impl Backoff {
    pub fn new(floor_ms: u64, ceiling_ms: u64, jitter_cap_ms: u64, rng: StdRng) -> Self {
        let floor_ms = floor_ms.min(ceiling_ms);
        Self {
            floor_ms,
            ceiling_ms,
            jitter_cap_ms,
            current_ms: floor_ms,
            rng,
        }
    }

    pub fn from_config(config: &LinkConfig) -> Self {
        Self::new(
            config.backoff_floor_ms,
            config.backoff_ceiling_ms,
            config.jitter_cap_ms,
            StdRng::from_entropy(),
        )
    }

    /// Deterministic jitter, for tests.
    pub fn with_seed(config: &LinkConfig, seed: u64) -> Self {
        Self::new(
            config.backoff_floor_ms,
            config.backoff_ceiling_ms,
            config.jitter_cap_ms,
            StdRng::seed_from_u64(seed),
        )
    }

    /// Delay for the next reconnect, advancing the backoff.
    pub fn next_delay(&mut self) -> Duration {
        let jitter_max = self.jitter_cap_ms.min(self.current_ms / 2);
        let jitter = if jitter_max == 0 {
            0
        } else {
            self.rng.gen_range(0..=jitter_max)
        };
        let delay = (self.current_ms + jitter).min(self.ceiling_ms);
        self.current_ms = self.current_ms.saturating_mul(2).min(self.ceiling_ms);
        Duration::from_millis(delay)
    }

    /// Back to the floor, after a successful open.
    pub fn reset(&mut self) {
        self.current_ms = self.floor_ms;
    }

    pub fn current(&self) -> Duration {
        Duration::from_millis(self.current_ms)
    }
}
