//! Mock backend for testing without a live LLM.
//!
//! [`MockBackend`] plays back a script of [`MockReply`] values in order,
//! cycling when exhausted. It can simulate latency and provider failures
//! and records every prompt it was sent.
//!
//! # Example
//!
//! ```
//! use proofread_pipeline::backend::{MockBackend, MockReply};
//!
//! let mock = MockBackend::new(vec![MockReply::Fail(503), MockReply::text("[]")]);
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use super::{Backend, LlmRequest, LlmResponse};
use crate::error::Result;
use crate::PipelineError;

/// One scripted reply.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Successful completion with this text.
    Text(String),
    /// Provider error with this HTTP status.
    Fail(u16),
}

impl MockReply {
    pub fn text(s: impl Into<String>) -> Self {
        MockReply::Text(s.into())
    }
}

/// A test backend that plays back scripted replies.
#[derive(Debug)]
pub struct MockBackend {
    replies: Vec<MockReply>,
    index: AtomicUsize,
    latency: Duration,
    /// Streaming splits each reply into pieces of this many chars.
    token_chars: usize,
    prompts: Mutex<Vec<String>>,
}

impl MockBackend {
    /// Create a mock backend with the given script.
    ///
    /// An empty script behaves like a single empty-text reply.
    pub fn new(replies: Vec<MockReply>) -> Self {
        Self {
            replies,
            index: AtomicUsize::new(0),
            latency: Duration::ZERO,
            token_chars: 8,
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Create a mock that always returns the same text.
    pub fn fixed(response: impl Into<String>) -> Self {
        Self::new(vec![MockReply::text(response)])
    }

    /// Sleep this long before every reply.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_token_chars(mut self, n: usize) -> Self {
        self.token_chars = n.max(1);
        self
    }

    /// Number of calls made so far.
    pub fn calls(&self) -> usize {
        self.index.load(Ordering::Relaxed)
    }

    /// Prompts received so far, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    async fn next_reply(&self, request: &LlmRequest) -> Result<String> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(request.prompt.clone());
        }
        let idx = self.index.fetch_add(1, Ordering::Relaxed);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.replies.is_empty() {
            return Ok(String::new());
        }
        match &self.replies[idx % self.replies.len()] {
            MockReply::Text(text) => Ok(text.clone()),
            MockReply::Fail(status) => Err(PipelineError::HttpError {
                status: *status,
                body: "mock failure".into(),
                retry_after: None,
            }),
        }
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn complete(
        &self,
        _client: &Client,
        _base_url: &str,
        request: &LlmRequest,
    ) -> Result<LlmResponse> {
        let text = self.next_reply(request).await?;
        Ok(LlmResponse {
            text,
            status: 200,
            metadata: None,
        })
    }

    async fn complete_streaming(
        &self,
        _client: &Client,
        _base_url: &str,
        request: &LlmRequest,
        on_token: &mut (dyn FnMut(String) + Send),
    ) -> Result<LlmResponse> {
        let text = self.next_reply(request).await?;
        let chars: Vec<char> = text.chars().collect();
        for piece in chars.chunks(self.token_chars) {
            on_token(piece.iter().collect());
        }
        Ok(LlmResponse {
            text,
            status: 200,
            metadata: None,
        })
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LlmConfig;

    fn request(prompt: &str) -> LlmRequest {
        LlmRequest {
            model: "test".to_string(),
            system_prompt: None,
            prompt: prompt.to_string(),
            config: LlmConfig::default(),
            stream: false,
        }
    }

    #[tokio::test]
    async fn test_mock_cycles_script() {
        let mock = MockBackend::new(vec![MockReply::text("first"), MockReply::Fail(503)]);
        let client = Client::new();
        let r1 = mock.complete(&client, "http://unused", &request("a")).await.unwrap();
        let r2 = mock.complete(&client, "http://unused", &request("b")).await;
        let r3 = mock.complete(&client, "http://unused", &request("c")).await.unwrap();
        assert_eq!(r1.text, "first");
        assert!(matches!(r2, Err(PipelineError::HttpError { status: 503, .. })));
        assert_eq!(r3.text, "first");
        assert_eq!(mock.calls(), 3);
        assert_eq!(mock.prompts(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_mock_streaming_splits_tokens() {
        let mock = MockBackend::fixed("我今天很高行").with_token_chars(4);
        let mut tokens = Vec::new();
        let resp = mock
            .complete_streaming(&Client::new(), "http://unused", &request("p"), &mut |t| {
                tokens.push(t)
            })
            .await
            .unwrap();
        assert_eq!(resp.text, "我今天很高行");
        assert_eq!(tokens, vec!["我今天很", "高行"]);
    }
}
