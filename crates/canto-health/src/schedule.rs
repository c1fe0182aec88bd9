//! Probe scheduling: down-state backoff and jitter.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Floor applied to every jittered delay.
pub const MIN_DELAY: Duration = Duration::from_millis(250);

/// Source of jitter samples, uniformly distributed in `[-1.0, 1.0]`.
pub trait Jitter: Send {
    fn sample(&mut self) -> f64;
}

/// Jitter backed by a seedable non-cryptographic generator.
#[derive(Debug)]
pub struct RandomJitter {
    rng: StdRng,
}

impl RandomJitter {
    pub fn from_entropy() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic jitter for tests and reproducible runs.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Default for RandomJitter {
    fn default() -> Self {
        Self::from_entropy()
    }
}

impl Jitter for RandomJitter {
    fn sample(&mut self) -> f64 {
        self.rng.gen_range(-1.0..=1.0)
    }
}

/// No perturbation at all.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoJitter;

impl Jitter for NoJitter {
    fn sample(&mut self) -> f64 {
        0.0
    }
}

/// Grow the down-state interval by `factor`, capped at `max`.
pub fn next_backoff(current: Duration, factor: f64, max: Duration) -> Duration {
    let grown = (current.as_millis() as f64 * factor).round();
    Duration::from_millis(grown as u64).min(max)
}

/// Apply `± pct` jitter to `base`, floored at [`MIN_DELAY`].
pub fn jittered_delay(base: Duration, pct: f64, jitter: &mut dyn Jitter) -> Duration {
    let base_ms = base.as_millis() as f64;
    let ms = if pct > 0.0 {
        let r = jitter.sample().clamp(-1.0, 1.0);
        (base_ms * (1.0 + r * pct)).round()
    } else {
        base_ms
    };
    Duration::from_millis(ms as u64).max(MIN_DELAY)
}
