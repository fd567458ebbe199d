//! Reconnect backoff: exponential growth, capped, with symmetric jitter.
//!
//! Delay for attempt `k` (0-indexed) is
//! `min(max_delay, initial_delay * multiplier^k)`, then jittered by
//! ±`jitter_pct` percent. Jitter keeps a fleet of subclients from
//! thundering-herding the endpoint after a shared outage.

use crate::config::ReconnectConfig;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::LazyLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Lock-free xorshift64 PRNG for jitter randomness.
///
/// Atomic compare-exchange keeps it thread-safe without locks; quality is
/// far beyond what jitter needs.
struct Xorshift64 {
    state: AtomicU64,
}

impl Xorshift64 {
    fn new() -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0x853c49e6748fea9b);
        let seed = if seed == 0 { 0x853c49e6748fea9b } else { seed };
        Self {
            state: AtomicU64::new(seed),
        }
    }

    fn next(&self) -> u64 {
        loop {
            let old = self.state.load(Ordering::Acquire);
            let mut x = old;
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            if self
                .state
                .compare_exchange_weak(old, x, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return x;
            }
        }
    }

    /// Random f64 in `[0.0, 1.0)`.
    fn next_f64(&self) -> f64 {
        (self.next() as f64) / (u64::MAX as f64)
    }
}

static JITTER_RNG: LazyLock<Xorshift64> = LazyLock::new(Xorshift64::new);

fn rand_jitter() -> f64 {
    JITTER_RNG.next_f64()
}

/// Backoff parameters, derived from `polaris.reconnect`.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Jitter as a percentage of the capped delay (0-100).
    pub jitter_pct: u32,
}

impl From<&ReconnectConfig> for BackoffConfig {
    fn from(cfg: &ReconnectConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(cfg.initial_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
            multiplier: cfg.backoff_multiplier,
            jitter_pct: cfg.jitter_pct,
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::from(&ReconnectConfig::default())
    }
}

impl BackoffConfig {
    /// Delay before reconnect attempt `attempt` (0-indexed; attempt 0 sleeps
    /// the initial delay).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.delay_for_attempt_with_jitter(attempt, rand_jitter())
    }

    /// Same, with an explicit jitter sample in `[0.0, 1.0]` (for testing;
    /// 0.5 means no jitter).
    pub fn delay_for_attempt_with_jitter(&self, attempt: u32, jitter: f64) -> Duration {
        // Microsecond arithmetic keeps sub-millisecond configs exact.
        let base_us = self.initial_delay.as_micros() as f64 * self.multiplier.powi(attempt as i32);
        let base_us = base_us.min(self.max_delay.as_micros() as f64);

        // Map jitter from [0, 1] to [-1, 1], scale by the jitter percentage.
        let jitter_range = base_us * (self.jitter_pct as f64 / 100.0);
        let jitter_offset = (jitter * 2.0 - 1.0) * jitter_range;
        let final_us = (base_us + jitter_offset).max(1_000.0); // floor 1 ms

        Duration::from_micros(final_us as u64)
    }
}
