//! Exponential backoff with jitter.
//!
//! [`BackoffConfig`] drives transport retries for LLM calls (429, 5xx,
//! connection errors). The same delay arithmetic ([`scaled_delay`]) is used
//! by the check client between whole-request attempts.

use std::time::Duration;

/// Configuration for transport-level retry with exponential backoff and jitter.
///
/// # Example
///
/// ```
/// use proofread_pipeline::backoff::BackoffConfig;
///
/// let none = BackoffConfig::none();
/// assert_eq!(none.max_retries, 0);
///
/// let standard = BackoffConfig::standard();
/// assert_eq!(standard.max_retries, 3);
/// ```
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Maximum number of transport retries. Default: 0 (no retry).
    pub max_retries: u32,

    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Lower clamp applied after jitter.
    pub min_delay: Duration,

    /// Multiplier applied to the delay after each retry.
    pub multiplier: f64,

    /// Upper clamp applied after jitter.
    pub max_delay: Duration,

    pub jitter: JitterStrategy,

    /// HTTP status codes that trigger retry. Default: `[429, 500, 502, 503, 504]`.
    pub retryable_statuses: Vec<u16>,

    /// Whether to respect `Retry-After` headers from the provider.
    pub respect_retry_after: bool,
}

/// Jitter strategy to prevent thundering herd on shared rate limits.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum JitterStrategy {
    /// Delay is exactly the calculated value.
    None,

    /// Random value in `[0, delay]`.
    Full,

    /// `delay/2 + random in [0, delay/2]`.
    Equal,

    /// `delay + delay * random in [low, high)`. Never shortens the wait.
    Proportional { low: f64, high: f64 },
}

impl JitterStrategy {
    /// The check client's default: add 20% to 50% of the computed delay.
    pub const CLIENT: JitterStrategy = JitterStrategy::Proportional {
        low: 0.2,
        high: 0.5,
    };

    fn apply(self, secs: f64) -> f64 {
        match self {
            JitterStrategy::None => secs,
            JitterStrategy::Full => fastrand::f64() * secs,
            JitterStrategy::Equal => secs / 2.0 + fastrand::f64() * (secs / 2.0),
            JitterStrategy::Proportional { low, high } => {
                let span = (high - low).max(0.0);
                secs + secs * (low + fastrand::f64() * span)
            }
        }
    }
}

/// `base * multiplier^exponent`, jittered, then clamped to `[min, max]`.
pub fn scaled_delay(
    base: Duration,
    multiplier: f64,
    exponent: u32,
    jitter: JitterStrategy,
    min: Duration,
    max: Duration,
) -> Duration {
    let raw = base.as_secs_f64() * multiplier.powi(exponent as i32);
    let jittered = jitter.apply(raw);
    let lo = min.as_secs_f64();
    let hi = max.as_secs_f64().max(lo);
    let clamped = if jittered.is_finite() {
        jittered.clamp(lo, hi)
    } else {
        hi
    };
    Duration::from_secs_f64(clamped)
}

impl BackoffConfig {
    /// No transport retry.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::standard()
        }
    }

    /// Cloud API defaults: 3 retries, 1s initial, 2x multiplier, 60s max,
    /// full jitter, respects Retry-After.
    pub fn standard() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            min_delay: Duration::ZERO,
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: JitterStrategy::Full,
            retryable_statuses: vec![429, 500, 502, 503, 504],
            respect_retry_after: true,
        }
    }

    /// For a user waiting on a proofreading result: 2 retries, 500ms initial,
    /// 5s max.
    pub fn interactive() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(500),
            min_delay: Duration::ZERO,
            multiplier: 1.5,
            max_delay: Duration::from_secs(5),
            jitter: JitterStrategy::Full,
            retryable_statuses: vec![429, 500, 502, 503, 504],
            respect_retry_after: true,
        }
    }

    /// Delay before retry N (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        scaled_delay(
            self.initial_delay,
            self.multiplier,
            attempt,
            self.jitter,
            self.min_delay,
            self.max_delay,
        )
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::none()
    }
}
