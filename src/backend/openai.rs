//! Backend for OpenAI-compatible chat completion APIs.
//!
//! Endpoint: `/v1/chat/completions`. Streaming uses SSE with
//! `data: {"choices": [{"delta": {"content": "token"}}]}` frames.

use super::{Backend, LlmRequest, LlmResponse};
use crate::error::Result;
use crate::sse::SseDecoder;
use crate::PipelineError;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};

/// Backend for any OpenAI-compatible API (OpenAI, DeepSeek, Qwen/DashScope
/// compatible mode, vLLM, Ollama `/v1/`, ...).
///
/// # Example
///
/// ```
/// use proofread_pipeline::backend::OpenAiBackend;
///
/// let backend = OpenAiBackend::new().with_api_key("sk-...");
/// assert!(backend.has_api_key());
/// ```
#[derive(Clone, Default)]
pub struct OpenAiBackend {
    /// Sent as `Authorization: Bearer {key}` when set.
    api_key: Option<String>,
}

impl std::fmt::Debug for OpenAiBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiBackend")
            .field(
                "api_key",
                &self.api_key.as_ref().map(|k| {
                    let prefix: String = k.chars().take(6).collect();
                    if k.chars().count() > 6 {
                        format!("{prefix}***")
                    } else {
                        "***".to_string()
                    }
                }),
            )
            .finish()
    }
}

impl OpenAiBackend {
    pub fn new() -> Self {
        Self { api_key: None }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    fn build_body(request: &LlmRequest, stream: bool) -> Value {
        let mut messages = Vec::new();
        if let Some(sys) = request.system_prompt.as_deref().filter(|s| !s.is_empty()) {
            messages.push(json!({"role": "system", "content": sys}));
        }
        messages.push(json!({"role": "user", "content": request.prompt}));

        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "temperature": request.config.temperature,
            "max_tokens": request.config.max_tokens,
            "stream": stream,
        });
        if request.config.json_mode {
            body["response_format"] = json!({"type": "json_object"});
        }
        body
    }

    fn parse_retry_after(value: &str) -> Option<std::time::Duration> {
        value
            .trim()
            .parse::<u64>()
            .ok()
            .map(std::time::Duration::from_secs)
    }

    fn build_http_request(
        &self,
        client: &Client,
        url: &str,
        body: &Value,
    ) -> reqwest::RequestBuilder {
        let req = client.post(url).json(body);
        match self.api_key {
            Some(ref key) => req.bearer_auth(key),
            None => req,
        }
    }

    async fn send(&self, client: &Client, base_url: &str, body: &Value) -> Result<reqwest::Response> {
        let url = format!("{}/v1/chat/completions", base_url.trim_end_matches('/'));
        let resp = self.build_http_request(client, &url, body).send().await?;
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status().as_u16();
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(Self::parse_retry_after);
        let body = resp.text().await.unwrap_or_default();
        Err(PipelineError::HttpError {
            status,
            body,
            retry_after,
        })
    }

    fn extract_metadata(json_resp: &Value) -> Option<Value> {
        let mut meta = serde_json::Map::new();
        for key in ["usage", "model", "id"] {
            if let Some(v) = json_resp.get(key) {
                meta.insert(key.into(), v.clone());
            }
        }
        (!meta.is_empty()).then_some(Value::Object(meta))
    }

    fn delta_content(frame: &Value) -> Option<&str> {
        frame
            .get("choices")?
            .get(0)?
            .get("delta")?
            .get("content")?
            .as_str()
    }
}

#[async_trait]
impl Backend for OpenAiBackend {
    async fn complete(
        &self,
        client: &Client,
        base_url: &str,
        request: &LlmRequest,
    ) -> Result<LlmResponse> {
        let body = Self::build_body(request, false);
        let resp = self.send(client, base_url, &body).await?;
        let status = resp.status().as_u16();
        let json_resp: Value = resp.json().await?;

        let text = json_resp
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        Ok(LlmResponse {
            text,
            status,
            metadata: Self::extract_metadata(&json_resp),
        })
    }

    async fn complete_streaming(
        &self,
        client: &Client,
        base_url: &str,
        request: &LlmRequest,
        on_token: &mut (dyn FnMut(String) + Send),
    ) -> Result<LlmResponse> {
        let body = Self::build_body(request, true);
        let resp = self.send(client, base_url, &body).await?;
        let status = resp.status().as_u16();

        let mut stream = resp.bytes_stream();
        let mut decoder = SseDecoder::new();
        let mut accumulated = String::new();
        let mut push = |frame: Value, acc: &mut String| {
            if let Some(content) = Self::delta_content(&frame).filter(|c| !c.is_empty()) {
                acc.push_str(content);
                on_token(content.to_string());
            }
        };

        while let Some(chunk) = stream.next().await {
            for frame in decoder.decode_data(&chunk?) {
                push(frame, &mut accumulated);
            }
        }
        for frame in decoder.flush_data() {
            push(frame, &mut accumulated);
        }

        Ok(LlmResponse {
            text: accumulated,
            status,
            metadata: None,
        })
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}
