//! Deterministic per-client jitter and restart backoff.
//!
//! Implements `delay := min(backoff_max, backoff_initial *
//! multiplier^attempts)` with seeded ±jitter, rather than a failure-window
//! threshold model. The seed discipline (client_id XOR config_seed)
//! guarantees reproducibility across runs and spreads concurrent restarts
//! across clients.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::Config;

/// Derive the seeded RNG for a given client and an extra nonce (so repeat
/// calls for the same client — e.g. successive backoff attempts — don't
/// all draw the same jitter value, while remaining fully deterministic).
fn rng_for(config_seed: u64, client_id: u32, nonce: u64) -> StdRng {
    let seed = (client_id as u64 ^ config_seed) ^ nonce.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    StdRng::seed_from_u64(seed)
}

/// Deterministic jitter in `[0, max)`, keyed by `(config_seed, client_id)`.
/// Used for ramp-start offsets — a fixed nonce of 0 so the value is stable
/// across repeated reads of the same client.
pub fn seeded_jitter(config_seed: u64, client_id: u32, max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    let mut rng = rng_for(config_seed, client_id, 0);
    let max_nanos = max.as_nanos().min(u128::from(u64::MAX)) as u64;
    Duration::from_nanos(rng.gen_range(0..=max_nanos))
}

/// Tracks per-client restart attempts and computes the next backoff delay.
pub struct BackoffState {
    attempts: u32,
    config_seed: u64,
    client_id: u32,
}

impl BackoffState {
    pub fn new(config_seed: u64, client_id: u32) -> Self {
        Self {
            attempts: 0,
            config_seed,
            client_id,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Reset the attempt counter. Called when uptime exceeded the reset
    /// threshold, or the last exit code was 0.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Record a crash and return the delay to wait before restarting.
    pub fn next_delay(&mut self, config: &Config) -> Duration {
        let attempt = self.attempts;
        self.attempts = self.attempts.saturating_add(1);

        let base = config
            .backoff_initial
            .mul_f64(config.backoff_multiplier.powi(attempt as i32))
            .min(config.backoff_max);

        // nonce = attempt + 1 keeps successive backoffs from reusing the
        // ramp-jitter draw (nonce 0).
        let jitter_bound = base.mul_f64(config.backoff_jitter_fraction);
        let mut rng = rng_for(self.config_seed, self.client_id, attempt as u64 + 1);
        let signed: f64 = rng.gen_range(-1.0..=1.0);
        let jitter = jitter_bound.mul_f64(signed.abs());

        if signed < 0.0 {
            base.saturating_sub(jitter)
        } else {
            (base + jitter).min(config.backoff_max.mul_f64(1.2))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config::new(1, std::sync::Arc::new(crate::supervisor::command::NullCommandBuilder))
    }

    #[test]
    fn jitter_is_deterministic_per_seed_and_client() {
        let a = seeded_jitter(42, 0, Duration::from_millis(200));
        let b = seeded_jitter(42, 0, Duration::from_millis(200));
        assert_eq!(a, b);

        let c = seeded_jitter(42, 1, Duration::from_millis(200));
        assert_ne!(a, c, "different clients should (almost always) differ");
    }

    #[test]
    fn backoff_bounds_hold() {
        let config = test_config();
        let mut state = BackoffState::new(7, 3);
        for _ in 0..10 {
            let delay = state.next_delay(&config);
            assert!(delay <= config.backoff_max.mul_f64(1.2));
        }
    }

    #[test]
    fn backoff_grows_then_caps() {
        let config = test_config();
        let mut state = BackoffState::new(7, 3);
        let first = state.next_delay(&config);
        let second = state.next_delay(&config);
        // Not a strict inequality because of jitter, but the underlying
        // base clearly grows; assert the base sequence directly.
        assert!(first <= config.backoff_initial.mul_f64(1.2));
        assert!(second >= config.backoff_initial.mul_f64(0.8));
    }

    #[test]
    fn reset_restarts_from_attempt_zero() {
        let config = test_config();
        let mut state = BackoffState::new(1, 1);
        state.next_delay(&config);
        state.next_delay(&config);
        assert_eq!(state.attempts(), 2);
        state.reset();
        assert_eq!(state.attempts(), 0);
    }
}
