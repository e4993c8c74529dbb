//! How the check client reaches the server.

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use reqwest::header::ACCEPT;
use reqwest::Client;
use serde_json::Value;
use thiserror::Error;

/// Transport-level failure of one attempt.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClientError {
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("undecodable response: {0}")]
    Decode(String),
}

/// An opened response: status, correlation id and the body as it arrives.
pub struct TransportResponse {
    pub status: u16,
    pub request_id: Option<String>,
    pub body: BoxStream<'static, Result<Vec<u8>, ClientError>>,
}

impl std::fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportResponse")
            .field("status", &self.status)
            .field("request_id", &self.request_id)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one check request. `stream` selects `Accept: text/event-stream`.
    async fn open(&self, body: &Value, stream: bool) -> Result<TransportResponse, ClientError>;
}

/// `reqwest` transport against `{base_url}/api/check`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    url: String,
}

impl HttpTransport {
    pub fn new(base_url: &str) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(client: Client, base_url: &str) -> Self {
        Self {
            client,
            url: format!("{}/api/check", base_url.trim_end_matches('/')),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open(&self, body: &Value, stream: bool) -> Result<TransportResponse, ClientError> {
        let accept = if stream { "text/event-stream" } else { "application/json" };
        let resp = self
            .client
            .post(&self.url)
            .header(ACCEPT, accept)
            .json(body)
            .send()
            .await
            .map_err(|e| ClientError::Network(e.to_string()))?;

        let status = resp.status().as_u16();
        let request_id = resp
            .headers()
            .get(crate::server::REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(|e| ClientError::Network(e.to_string())))
            .boxed();
        Ok(TransportResponse {
            status,
            request_id,
            body,
        })
    }
}
