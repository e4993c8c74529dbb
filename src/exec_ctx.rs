//! Execution context shared by every LLM-backed producer.
//!
//! [`ExecCtx`] carries the HTTP client, LLM backend, endpoint, transport
//! backoff, shared prompt variables, and the process-local admission
//! semaphore. It is built once at startup and shared behind an `Arc`.

use crate::backend::{Backend, OpenAiBackend};
use crate::backoff::BackoffConfig;
use crate::error::{PipelineError, Result};
use reqwest::Client;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Shared execution context for LLM calls.
///
/// # Example
///
/// ```
/// use proofread_pipeline::ExecCtx;
///
/// let ctx = ExecCtx::builder("https://api.example.com/v1")
///     .var("style", "formal")
///     .max_concurrency(4)
///     .build()
///     .unwrap();
/// assert_eq!(ctx.base_url, "https://api.example.com");
/// ```
pub struct ExecCtx {
    /// HTTP client (cheap to clone).
    pub client: Client,
    /// Provider base URL without a trailing API path.
    pub base_url: String,
    /// LLM backend. Default: [`OpenAiBackend`] without a key.
    pub backend: Arc<dyn Backend>,
    /// Transport retry configuration.
    pub backoff: BackoffConfig,
    /// Template variables available to every prompt.
    pub vars: HashMap<String, String>,
    /// Process-local admission for concurrent LLM calls.
    pub permits: Arc<Semaphore>,
}

impl ExecCtx {
    pub fn builder(base_url: impl Into<String>) -> ExecCtxBuilder {
        ExecCtxBuilder {
            client: None,
            base_url: base_url.into(),
            backend: None,
            backoff: None,
            vars: HashMap::new(),
            max_concurrency: 8,
            timeout: None,
        }
    }

    /// Acquire an LLM admission permit.
    pub async fn admit(&self) -> Result<tokio::sync::OwnedSemaphorePermit> {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PipelineError::Other("LLM admission semaphore closed".into()))
    }
}

impl std::fmt::Debug for ExecCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecCtx")
            .field("base_url", &self.base_url)
            .field("backend", &self.backend.name())
            .field("backoff", &self.backoff)
            .field("vars_count", &self.vars.len())
            .field("available_permits", &self.permits.available_permits())
            .finish()
    }
}

/// Builder for [`ExecCtx`].
pub struct ExecCtxBuilder {
    client: Option<Client>,
    base_url: String,
    backend: Option<Arc<dyn Backend>>,
    backoff: Option<BackoffConfig>,
    vars: HashMap<String, String>,
    max_concurrency: usize,
    timeout: Option<Duration>,
}

impl ExecCtxBuilder {
    /// Set the HTTP client. If not set, a default client is created.
    pub fn client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    pub fn backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Use the OpenAI-compatible backend with API key authentication.
    pub fn openai_with_key(mut self, api_key: impl Into<String>) -> Self {
        self.backend = Some(Arc::new(OpenAiBackend::new().with_api_key(api_key)));
        self
    }

    /// Default: [`BackoffConfig::interactive()`].
    pub fn backoff(mut self, config: BackoffConfig) -> Self {
        self.backoff = Some(config);
        self
    }

    pub fn var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    /// Maximum concurrent LLM calls across all requests. Default: 8.
    pub fn max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n;
        self
    }

    /// Per-request HTTP timeout. Default: 60 seconds.
    ///
    /// Ignored when a custom `Client` is provided via `.client()`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Result<ExecCtx> {
        if self.max_concurrency == 0 {
            return Err(PipelineError::InvalidConfig(
                "LLM max concurrency must be at least 1".into(),
            ));
        }
        let client = match self.client {
            Some(c) => c,
            None => Client::builder()
                .timeout(self.timeout.unwrap_or(Duration::from_secs(60)))
                .build()?,
        };
        Ok(ExecCtx {
            client,
            base_url: normalize_base_url(&self.base_url),
            backend: self
                .backend
                .unwrap_or_else(|| Arc::new(OpenAiBackend::new())),
            backoff: self.backoff.unwrap_or_else(BackoffConfig::interactive),
            vars: self.vars,
            permits: Arc::new(Semaphore::new(self.max_concurrency)),
        })
    }
}

/// Strip known provider path suffixes from a base URL so backends can
/// append their own paths.
fn normalize_base_url(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    // longest first
    for suffix in ["/v1/chat/completions", "/v1/chat", "/v1"] {
        if let Some(stripped) = trimmed.strip_suffix(suffix) {
            return stripped.to_string();
        }
    }
    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(normalize_base_url("https://api.openai.com/v1/"), "https://api.openai.com");
        assert_eq!(
            normalize_base_url("https://api.openai.com/v1/chat/completions"),
            "https://api.openai.com"
        );
        assert_eq!(
            normalize_base_url("https://dashscope.aliyuncs.com/compatible-mode/v1"),
            "https://dashscope.aliyuncs.com/compatible-mode"
        );
        assert_eq!(normalize_base_url("http://localhost:8000"), "http://localhost:8000");
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let err = ExecCtx::builder("http://localhost").max_concurrency(0).build().unwrap_err();
        assert_eq!(err.code(), "invalid_config");
    }

    #[tokio::test]
    async fn test_admission_limits_permits() {
        let ctx = ExecCtx::builder("http://localhost").max_concurrency(1).build().unwrap();
        let permit = ctx.admit().await.unwrap();
        assert_eq!(ctx.permits.available_permits(), 0);
        drop(permit);
        assert_eq!(ctx.permits.available_permits(), 1);
    }
}
