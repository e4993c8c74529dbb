//! Retry policy of the check client.

use crate::backoff::{scaled_delay, JitterStrategy};
use crate::sse::codes;
use std::fmt;
use std::time::Duration;

/// How the server is asked to answer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResponseMode {
    /// `Accept: text/event-stream`.
    #[default]
    Stream,
    /// One JSON object.
    Json,
}

/// Why an attempt is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetryReason {
    /// HTTP 5xx.
    Http5xx,
    /// Connect or read failure.
    Network,
    /// Nothing arrived within the idle window.
    Idle,
    /// The body ended without a `final` event.
    EofNoFinal,
    /// The server sent an `error` event with a retryable code.
    ServerRetryable,
}

impl RetryReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryReason::Http5xx => "http_5xx",
            RetryReason::Network => "network",
            RetryReason::Idle => "idle",
            RetryReason::EofNoFinal => "eof_no_final",
            RetryReason::ServerRetryable => "server_retryable",
        }
    }
}

impl fmt::Display for RetryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a server `error` code is worth another attempt.
pub fn is_retryable_code(code: &str) -> bool {
    matches!(code, codes::UPSTREAM_UNAVAILABLE | codes::OVERLOADED)
}

/// Base delay per [`RetryReason`].
#[derive(Debug, Clone, PartialEq)]
pub struct BaseDelays {
    pub http_5xx: Duration,
    pub network: Duration,
    pub idle: Duration,
    pub eof_no_final: Duration,
    pub server_retryable: Duration,
}

impl Default for BaseDelays {
    fn default() -> Self {
        Self {
            http_5xx: Duration::from_millis(1000),
            network: Duration::from_millis(500),
            idle: Duration::from_millis(500),
            eof_no_final: Duration::from_millis(500),
            server_retryable: Duration::from_millis(1500),
        }
    }
}

impl BaseDelays {
    pub fn for_reason(&self, reason: RetryReason) -> Duration {
        match reason {
            RetryReason::Http5xx => self.http_5xx,
            RetryReason::Network => self.network,
            RetryReason::Idle => self.idle,
            RetryReason::EofNoFinal => self.eof_no_final,
            RetryReason::ServerRetryable => self.server_retryable,
        }
    }
}

/// Bounds of the retry loop.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    /// Longest silence tolerated on one read.
    pub idle: Duration,
    /// Hard deadline from the first attempt, backoff waits included.
    pub total_timeout: Duration,
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub base: BaseDelays,
    pub mode: ResponseMode,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            idle: Duration::from_secs(20),
            total_timeout: Duration::from_secs(90),
            min_delay: Duration::from_millis(300),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            base: BaseDelays::default(),
            mode: ResponseMode::Stream,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_idle(mut self, idle: Duration) -> Self {
        self.idle = idle;
        self
    }

    pub fn with_total_timeout(mut self, total: Duration) -> Self {
        self.total_timeout = total;
        self
    }

    pub fn with_delay_bounds(mut self, min: Duration, max: Duration) -> Self {
        self.min_delay = min;
        self.max_delay = max;
        self
    }

    pub fn with_mode(mut self, mode: ResponseMode) -> Self {
        self.mode = mode;
        self
    }

    /// Wait before the attempt after `attempt` failed with `reason`.
    pub fn delay(&self, reason: RetryReason, attempt: u32) -> Duration {
        scaled_delay(
            self.base.for_reason(reason),
            self.multiplier,
            attempt.saturating_sub(1),
            JitterStrategy::CLIENT,
            self.min_delay,
            self.max_delay,
        )
    }
}
