//! Backend trait and normalized request/response types.
//!
//! The [`Backend`] trait abstracts over LLM providers, translating between
//! normalized [`LlmRequest`]/[`LlmResponse`] types and provider HTTP APIs.
//!
//! ```text
//! LlmAgent ──► LlmRequest ──► with_backoff() ──► Backend::complete() ──► LlmResponse
//!                                   │
//!                          ┌────────┴────────┐
//!                    OpenAiBackend       MockBackend
//!                /v1/chat/completions    scripted replies
//!                   SSE streaming
//! ```

pub mod mock;
pub mod openai;

pub use mock::{MockBackend, MockReply};
pub use openai::OpenAiBackend;

use crate::backoff::BackoffConfig;
use crate::cancel::CancelSignal;
use crate::error::Result;
use crate::PipelineError;
use async_trait::async_trait;
use reqwest::Client;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Sampling settings for one LLM request.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Temperature (0.0 = deterministic).
    pub temperature: f64,

    /// Maximum tokens to generate.
    pub max_tokens: u32,

    /// Ask the provider for a JSON object response.
    pub json_mode: bool,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            temperature: 0.2,
            max_tokens: 2048,
            json_mode: false,
        }
    }
}

impl LlmConfig {
    pub fn with_temperature(mut self, temp: f64) -> Self {
        self.temperature = temp;
        self
    }

    pub fn with_max_tokens(mut self, tokens: u32) -> Self {
        self.max_tokens = tokens;
        self
    }

    pub fn with_json_mode(mut self, enabled: bool) -> Self {
        self.json_mode = enabled;
        self
    }
}

/// A normalized, provider-agnostic LLM request.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub model: String,

    /// Optional system prompt, sent as the first chat message.
    pub system_prompt: Option<String>,

    /// The user prompt text.
    pub prompt: String,

    pub config: LlmConfig,

    /// Whether to use the streaming endpoint.
    pub stream: bool,
}

/// A normalized LLM response.
#[derive(Debug)]
pub struct LlmResponse {
    /// The generated text content.
    pub text: String,

    /// HTTP status code (for diagnostics/logging).
    pub status: u16,

    /// Provider-specific metadata (token counts, model info).
    pub metadata: Option<serde_json::Value>,
}

/// Abstraction over LLM providers.
///
/// Object-safe; used as `Arc<dyn Backend>`.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Execute a non-streaming LLM call.
    async fn complete(
        &self,
        client: &Client,
        base_url: &str,
        request: &LlmRequest,
    ) -> Result<LlmResponse>;

    /// Execute a streaming LLM call.
    ///
    /// `on_token` is called for each token as it arrives. The accumulated
    /// text is returned as an [`LlmResponse`].
    async fn complete_streaming(
        &self,
        client: &Client,
        base_url: &str,
        request: &LlmRequest,
        on_token: &mut (dyn FnMut(String) + Send),
    ) -> Result<LlmResponse>;

    /// Human-readable name for logging and diagnostics.
    fn name(&self) -> &'static str;
}

/// Whether `error` should be retried under `config`.
///
/// Retryable: [`PipelineError::HttpError`] with a listed status, and any
/// [`PipelineError::Request`] transport error.
pub fn is_retryable(error: &PipelineError, config: &BackoffConfig) -> bool {
    match error {
        PipelineError::HttpError { status, .. } => config.retryable_statuses.contains(status),
        PipelineError::Request(_) => true,
        _ => false,
    }
}

/// Retry bookkeeping reported back to the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryStats {
    pub retries: u32,
    pub total_backoff: Duration,
}

fn retry_delay(last: &PipelineError, attempt: u32, config: &BackoffConfig) -> Duration {
    match last {
        PipelineError::HttpError {
            retry_after: Some(ra),
            ..
        } if config.respect_retry_after => (*ra).min(config.max_delay),
        _ => config.delay_for_attempt(attempt - 1),
    }
}

/// Drive `call` with transport retry, racing every attempt and every
/// backoff sleep against `cancel`.
async fn retry_loop<F, Fut>(
    config: &BackoffConfig,
    cancel: &CancelSignal,
    stats: &mut RetryStats,
    mut call: F,
) -> Result<LlmResponse>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<LlmResponse>>,
{
    let mut attempt = 0u32;
    loop {
        cancel.check()?;
        let result = tokio::select! {
            biased;
            reason = cancel.cancelled() => return Err(PipelineError::Cancelled(reason)),
            r = call() => r,
        };
        let err = match result {
            Ok(response) => return Ok(response),
            Err(e) => e,
        };
        attempt += 1;
        if attempt > config.max_retries || !is_retryable(&err, config) {
            return Err(err);
        }

        let delay = retry_delay(&err, attempt, config);
        tracing::warn!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying LLM call");
        stats.retries += 1;
        stats.total_backoff += delay;
        tokio::select! {
            biased;
            reason = cancel.cancelled() => return Err(PipelineError::Cancelled(reason)),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Execute a backend call with transport-level retry and exponential backoff.
///
/// Returns the first successful response, or the last error once retries
/// are exhausted. Cancellation drops the in-flight request.
pub async fn with_backoff(
    backend: &Arc<dyn Backend>,
    client: &Client,
    base_url: &str,
    request: &LlmRequest,
    config: &BackoffConfig,
    cancel: &CancelSignal,
    stats: &mut RetryStats,
) -> Result<LlmResponse> {
    retry_loop(config, cancel, stats, || backend.complete(client, base_url, request)).await
}

/// Options for [`with_backoff_streaming`]; bundles the per-call state.
pub struct BackoffStreamOpts<'a> {
    pub cancel: &'a CancelSignal,
    pub stats: &'a mut RetryStats,
    /// Receives each token as it arrives.
    pub on_token: &'a mut (dyn FnMut(String) + Send),
}

/// Streaming variant of [`with_backoff`].
///
/// Each retry restarts the stream from scratch; tokens from a failed
/// attempt have already been delivered, so `on_token` consumers must
/// tolerate a restart.
pub async fn with_backoff_streaming(
    backend: &Arc<dyn Backend>,
    client: &Client,
    base_url: &str,
    request: &LlmRequest,
    config: &BackoffConfig,
    opts: BackoffStreamOpts<'_>,
) -> Result<LlmResponse> {
    let BackoffStreamOpts {
        cancel,
        stats,
        on_token,
    } = opts;
    let mut attempt = 0u32;
    loop {
        cancel.check()?;
        let result = tokio::select! {
            biased;
            reason = cancel.cancelled() => return Err(PipelineError::Cancelled(reason)),
            r = backend.complete_streaming(client, base_url, request, &mut *on_token) => r,
        };
        let err = match result {
            Ok(response) => return Ok(response),
            Err(e) => e,
        };
        attempt += 1;
        if attempt > config.max_retries || !is_retryable(&err, config) {
            return Err(err);
        }
        let delay = retry_delay(&err, attempt, config);
        tracing::warn!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying streaming LLM call");
        stats.retries += 1;
        stats.total_backoff += delay;
        tokio::select! {
            biased;
            reason = cancel.cancelled() => return Err(PipelineError::Cancelled(reason)),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
