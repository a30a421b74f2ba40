//! Reconnect policy and backoff calculation.
//!
//! - [`ReconnectPolicy`]: backoff parameters and attempt cap
//! - [`calculate_backoff_delay`]: the capped exponential, no jitter
//! - [`calculate_backoff_delay_with_random`]: the same with symmetric jitter
//!
//! Attempt `n` (zero-based) waits `min(max, base * 2^n)` scaled by a factor
//! in `[1 - jitter, 1 + jitter]`, then clamped to `max` again. With
//! `jitter <= 1/3` the slowest draw for attempt `n` never exceeds the fastest
//! draw for `n + 1`, so delays are non-decreasing until the cap.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Default cap on backoff rounds before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
/// Default base delay in milliseconds.
pub const DEFAULT_BASE_DELAY_MS: u64 = 1000;
/// Default maximum delay in milliseconds.
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
/// Default jitter fraction.
pub const DEFAULT_JITTER_FRACTION: f64 = 0.2;
/// Largest jitter fraction that keeps consecutive delays non-decreasing.
pub const MAX_JITTER_FRACTION: f64 = 1.0 / 3.0;

/// Reconnect backoff parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectPolicy {
    /// Base delay for exponential backoff in ms (default: 1000).
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Maximum delay between attempts in ms (default: 30000).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Backoff rounds allowed before the client enters `Error` (default: 5).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Symmetric jitter fraction within `[0, 1/3]` (default: 0.2).
    #[serde(default = "default_jitter_fraction")]
    pub jitter_fraction: f64,
}

fn default_base_delay_ms() -> u64 {
    DEFAULT_BASE_DELAY_MS
}
fn default_max_delay_ms() -> u64 {
    DEFAULT_MAX_DELAY_MS
}
fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}
fn default_jitter_fraction() -> f64 {
    DEFAULT_JITTER_FRACTION
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            jitter_fraction: DEFAULT_JITTER_FRACTION,
        }
    }
}

impl ReconnectPolicy {
    /// Whether `attempt` backoff rounds have used up the budget.
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }

    /// Un-jittered delay for zero-based `attempt`.
    pub fn nominal_delay_ms(&self, attempt: u32) -> u64 {
        calculate_backoff_delay(attempt, self.base_delay_ms, self.max_delay_ms)
    }

    /// Inclusive bounds the jittered delay for `attempt` falls within.
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn delay_bounds_ms(&self, attempt: u32) -> (u64, u64) {
        let nominal = self.nominal_delay_ms(attempt) as f64;
        let jitter = self.jitter_fraction.clamp(0.0, MAX_JITTER_FRACTION);
        let low = (nominal * (1.0 - jitter)).round().max(0.0) as u64;
        let high = ((nominal * (1.0 + jitter)).round() as u64).min(self.max_delay_ms);
        (low.min(high), high)
    }

    /// Delay for `attempt` using `random` in `[0.0, 1.0)` as the jitter source.
    pub fn delay_with_random(&self, attempt: u32, random: f64) -> Duration {
        Duration::from_millis(calculate_backoff_delay_with_random(
            attempt,
            self.base_delay_ms,
            self.max_delay_ms,
            self.jitter_fraction,
            random,
        ))
    }

    /// Delay for `attempt` with jitter from the thread-local RNG.
    pub fn delay(&self, attempt: u32) -> Duration {
        let random: f64 = rand::rng().random();
        self.delay_with_random(attempt, random)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Backoff calculation
// ─────────────────────────────────────────────────────────────────────────────

/// Capped exponential backoff without jitter.
///
/// Formula: `min(max_delay, base_delay * 2^attempt)`
#[must_use]
pub fn calculate_backoff_delay(attempt: u32, base_delay_ms: u64, max_delay_ms: u64) -> u64 {
    base_delay_ms
        .saturating_mul(1u64 << attempt.min(31))
        .min(max_delay_ms)
}

/// Capped exponential backoff with explicit randomness.
///
/// `random` should be a value in `[0.0, 1.0)` from a PRNG. It is mapped to a
/// factor in `[1 - jitter, 1 + jitter]`, with `jitter` clamped to
/// [`MAX_JITTER_FRACTION`]. The result never exceeds `max_delay_ms`.
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn calculate_backoff_delay_with_random(
    attempt: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
    jitter_fraction: f64,
    random: f64,
) -> u64 {
    let capped = calculate_backoff_delay(attempt, base_delay_ms, max_delay_ms);

    let jitter_fraction = jitter_fraction.clamp(0.0, MAX_JITTER_FRACTION);
    let jitter = 1.0 + (random.clamp(0.0, 1.0) * 2.0 - 1.0) * jitter_fraction;
    let with_jitter = (capped as f64) * jitter;

    (with_jitter.round().max(0.0) as u64).min(max_delay_ms)
}
