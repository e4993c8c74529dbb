//! Retrying consumer of `/api/check`.
//!
//! [`CheckClient::check`] sends the request, reads the answer (SSE by
//! default) and retries the whole request on transient failures:
//!
//! ```text
//! attempting(n) ──final──────────────────────────► success
//!      │
//!      ├─ 5xx / network / idle / eof / retryable ─► wait(reason, n) ─► attempting(n+1)
//!      │                                               │
//!      │                                               └─ budget spent ─► terminal(timeout)
//!      └─ cancel / 4xx / fatal server error ───────────────────────────► terminal
//! ```
//!
//! Waits come out of one total budget measured from the first attempt.

pub mod retry;
pub mod transport;

pub use retry::{is_retryable_code, BaseDelays, ResponseMode, RetryPolicy, RetryReason};
pub use transport::{ClientError, HttpTransport, Transport, TransportResponse};

use crate::cancel::{CancelReason, CancelSignal};
use crate::events::{emit, CheckEvent, EventHandler};
use crate::merge::{merge, MergeConfig};
use crate::outcome::CheckResult;
use crate::sse::{SseDecoder, WireEvent};
use crate::types::{CheckOptions, CheckRequest, ErrorItem};
use futures::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use tokio::time::{sleep, sleep_until, timeout, Instant};

/// Why a check gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalKind {
    Canceled,
    TimedOut,
    /// The server reported a non-retryable error code.
    Server { code: String },
    /// A non-5xx HTTP error.
    Http { status: u16 },
    /// Every attempt failed transiently.
    Exhausted { last: RetryReason },
}

/// What the caller gets when a check does not succeed.
#[derive(Debug, Clone, PartialEq)]
pub struct TerminalReport {
    pub kind: TerminalKind,
    pub message: String,
    /// Server correlation id, when one was seen.
    pub request_id: Option<String>,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CheckOutcome {
    Success { result: CheckResult, attempts: u32 },
    Terminal(TerminalReport),
}

impl CheckOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CheckOutcome::Success { .. })
    }
}

/// Result of a single attempt.
#[derive(Debug)]
enum Attempt {
    Done(CheckResult),
    Retry(RetryReason, String),
    Fatal(TerminalKind, String),
}

/// Per-attempt accumulated state, reset on every retry.
#[derive(Debug, Default)]
struct AttemptState {
    request_id: Option<String>,
    merged: Vec<ErrorItem>,
}

/// Client for `POST /api/check`.
pub struct CheckClient {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    merge: MergeConfig,
}

impl std::fmt::Debug for CheckClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckClient")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl CheckClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            policy: RetryPolicy::default(),
            merge: MergeConfig::default(),
        }
    }

    /// HTTP client against `base_url`.
    pub fn http(base_url: &str) -> Self {
        Self::new(Arc::new(HttpTransport::new(base_url)))
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_merge(mut self, merge: MergeConfig) -> Self {
        self.merge = merge;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Check `text`, retrying transient failures within the policy.
    pub async fn check(
        &self,
        text: &str,
        options: CheckOptions,
        cancel: &CancelSignal,
        handler: Option<Arc<dyn EventHandler>>,
    ) -> CheckOutcome {
        let body = match serde_json::to_value(CheckRequest {
            text: text.to_string(),
            options,
        }) {
            Ok(body) => body,
            Err(e) => {
                return CheckOutcome::Terminal(TerminalReport {
                    kind: TerminalKind::Server {
                        code: "bad_request".into(),
                    },
                    message: e.to_string(),
                    request_id: None,
                    attempts: 0,
                })
            }
        };

        let deadline = Instant::now() + self.policy.total_timeout;
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last = RetryReason::Network;
        let mut request_id = None;

        for attempt in 1..=max_attempts {
            emit(&handler, CheckEvent::Attempt { attempt });
            let mut state = AttemptState::default();
            let result = tokio::select! {
                biased;
                reason = cancel.cancelled() => {
                    return terminal_for_cancel(reason, state.request_id.or(request_id), attempt);
                }
                _ = sleep_until(deadline) => {
                    return timed_out(state.request_id.or(request_id), attempt);
                }
                r = self.attempt(text, &body, &mut state, &handler) => r,
            };
            if state.request_id.is_some() {
                request_id = state.request_id;
            }

            let (reason, detail) = match result {
                Attempt::Done(result) => {
                    tracing::debug!(attempt, errors = result.errors.len(), "check succeeded");
                    return CheckOutcome::Success {
                        result,
                        attempts: attempt,
                    };
                }
                Attempt::Fatal(kind, message) => {
                    tracing::warn!(attempt, message = %message, "check failed");
                    return CheckOutcome::Terminal(TerminalReport {
                        kind,
                        message,
                        request_id,
                        attempts: attempt,
                    });
                }
                Attempt::Retry(reason, detail) => (reason, detail),
            };
            last = reason;
            if attempt == max_attempts {
                tracing::warn!(attempt, reason = %reason, detail = %detail, "giving up");
                break;
            }

            let delay = self.policy.delay(reason, attempt);
            if Instant::now() + delay >= deadline {
                return timed_out(request_id, attempt);
            }
            tracing::info!(attempt, reason = %reason, detail = %detail, delay_ms = delay.as_millis() as u64, "retrying check");
            emit(&handler, CheckEvent::Retry { attempt, reason, delay });
            tokio::select! {
                biased;
                reason = cancel.cancelled() => return terminal_for_cancel(reason, request_id, attempt),
                _ = sleep(delay) => {}
            }
        }

        CheckOutcome::Terminal(TerminalReport {
            kind: TerminalKind::Exhausted { last },
            message: format!("service unavailable after {max_attempts} retries"),
            request_id,
            attempts: max_attempts,
        })
    }

    async fn attempt(
        &self,
        text: &str,
        body: &Value,
        state: &mut AttemptState,
        handler: &Option<Arc<dyn EventHandler>>,
    ) -> Attempt {
        let stream = self.policy.mode == ResponseMode::Stream;
        let response = match timeout(self.policy.idle, self.transport.open(body, stream)).await {
            Err(_) => return Attempt::Retry(RetryReason::Idle, "no response headers".into()),
            Ok(Err(e)) => return Attempt::Retry(RetryReason::Network, e.to_string()),
            Ok(Ok(response)) => response,
        };
        state.request_id = response.request_id.clone();

        if response.status >= 500 {
            return Attempt::Retry(RetryReason::Http5xx, format!("HTTP {}", response.status));
        }
        // Any other non-2xx is terminal in both modes.
        if !(200..300).contains(&response.status) {
            let body = read_all(response.body, self.policy.idle).await.unwrap_or_default();
            let message = error_message(&body).unwrap_or_else(|| format!("HTTP {}", response.status));
            return Attempt::Fatal(
                TerminalKind::Http {
                    status: response.status,
                },
                message,
            );
        }

        match self.policy.mode {
            ResponseMode::Stream => self.read_stream(text, response, state, handler).await,
            ResponseMode::Json => match read_all(response.body, self.policy.idle).await {
                Err(reason) => Attempt::Retry(reason, "reading JSON body".into()),
                Ok(bytes) => match serde_json::from_slice::<CheckResult>(&bytes) {
                    Ok(result) => Attempt::Done(result),
                    Err(e) => Attempt::Retry(RetryReason::EofNoFinal, format!("undecodable body: {e}")),
                },
            },
        }
    }

    async fn read_stream(
        &self,
        text: &str,
        mut response: TransportResponse,
        state: &mut AttemptState,
        handler: &Option<Arc<dyn EventHandler>>,
    ) -> Attempt {
        let mut decoder = SseDecoder::new();
        loop {
            let values = match timeout(self.policy.idle, response.body.next()).await {
                Err(_) => return Attempt::Retry(RetryReason::Idle, "stream went quiet".into()),
                Ok(Some(Err(e))) => return Attempt::Retry(RetryReason::Network, e.to_string()),
                Ok(Some(Ok(bytes))) => decoder.decode_data(&bytes),
                Ok(None) => {
                    for value in decoder.flush_data() {
                        if let Some(done) = self.on_wire(text, value, state, handler) {
                            return done;
                        }
                    }
                    return Attempt::Retry(RetryReason::EofNoFinal, "stream ended without final".into());
                }
            };
            for value in values {
                if let Some(done) = self.on_wire(text, value, state, handler) {
                    return done;
                }
            }
        }
    }

    /// Handle one data payload; `Some` ends the attempt.
    fn on_wire(
        &self,
        text: &str,
        value: Value,
        state: &mut AttemptState,
        handler: &Option<Arc<dyn EventHandler>>,
    ) -> Option<Attempt> {
        let event = match serde_json::from_value::<WireEvent>(value) {
            Ok(event) => event,
            Err(e) => {
                tracing::debug!(error = %e, "skipping unknown event");
                return None;
            }
        };
        match event {
            WireEvent::Chunk {
                agent,
                errors,
                run_index,
            } => {
                let merged = merge(
                    text,
                    [std::mem::take(&mut state.merged), errors.clone()],
                    &self.merge,
                );
                state.merged = merged.clone();
                emit(
                    handler,
                    CheckEvent::Chunk {
                        agent,
                        run_index,
                        errors,
                        merged,
                    },
                );
                None
            }
            WireEvent::Warning { agent, message } => {
                emit(handler, CheckEvent::Warning { agent, message });
                None
            }
            WireEvent::Final {
                errors,
                mut meta,
                patched_text,
            } => {
                if meta.patched_text.is_none() {
                    meta.patched_text = patched_text;
                }
                if state.request_id.is_none() && !meta.request_id.is_empty() {
                    state.request_id = Some(meta.request_id.clone());
                }
                Some(Attempt::Done(CheckResult { errors, meta }))
            }
            WireEvent::Error {
                code,
                message,
                request_id,
            } => {
                if request_id.is_some() {
                    state.request_id = request_id;
                }
                if is_retryable_code(&code) {
                    Some(Attempt::Retry(RetryReason::ServerRetryable, format!("{code}: {message}")))
                } else {
                    Some(Attempt::Fatal(TerminalKind::Server { code }, message))
                }
            }
        }
    }
}

fn terminal_for_cancel(reason: CancelReason, request_id: Option<String>, attempts: u32) -> CheckOutcome {
    match reason {
        CancelReason::TimedOut => timed_out(request_id, attempts),
        CancelReason::Aborted => CheckOutcome::Terminal(TerminalReport {
            kind: TerminalKind::Canceled,
            message: "request canceled".into(),
            request_id,
            attempts,
        }),
    }
}

fn timed_out(request_id: Option<String>, attempts: u32) -> CheckOutcome {
    CheckOutcome::Terminal(TerminalReport {
        kind: TerminalKind::TimedOut,
        message: "request timed out".into(),
        request_id,
        attempts,
    })
}

/// Drain a body, each read bounded by `idle`.
async fn read_all(
    mut body: futures::stream::BoxStream<'static, Result<Vec<u8>, ClientError>>,
    idle: std::time::Duration,
) -> Result<Vec<u8>, RetryReason> {
    let mut out = Vec::new();
    loop {
        match timeout(idle, body.next()).await {
            Err(_) => return Err(RetryReason::Idle),
            Ok(Some(Err(_))) => return Err(RetryReason::Network),
            Ok(Some(Ok(bytes))) => out.extend_from_slice(&bytes),
            Ok(None) => return Ok(out),
        }
    }
}

/// `error.message` of a server error body, if it has one.
fn error_message(body: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(body).ok()?;
    value["error"]["message"].as_str().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::FnEventHandler;
    use async_trait::async_trait;
    use futures::stream;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    const TEXT: &str = "我今天很高行。";

    enum Scripted {
        Status(u16, &'static str),
        NetworkDown,
        /// Body chunks; `stall` leaves the body open afterwards.
        Body { chunks: Vec<String>, stall: bool },
    }

    struct ScriptedTransport {
        replies: Mutex<VecDeque<Scripted>>,
        calls: AtomicUsize,
    }

    impl ScriptedTransport {
        fn new(replies: Vec<Scripted>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn open(&self, _body: &Value, _stream: bool) -> Result<TransportResponse, ClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let reply = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Scripted::Status(503, ""));
            let (status, chunks, stall) = match reply {
                Scripted::NetworkDown => return Err(ClientError::Network("connection refused".into())),
                Scripted::Status(status, body) => (status, vec![body.to_string()], false),
                Scripted::Body { chunks, stall } => (200, chunks, stall),
            };
            let body = stream::iter(chunks.into_iter().map(|c| Ok(c.into_bytes())));
            let body = if stall {
                body.chain(stream::pending()).boxed()
            } else {
                body.boxed()
            };
            Ok(TransportResponse {
                status,
                request_id: Some("srv-1".into()),
                body,
            })
        }
    }

    fn final_frame() -> String {
        "data: {\"type\":\"final\",\"errors\":[{\"id\":\"a\",\"start\":4,\"end\":6,\"text\":\"高行\",\"suggestion\":\"高兴\",\"type\":\"spelling\"}],\"meta\":{\"requestId\":\"srv-1\",\"patchedText\":\"我今天很高兴。\"}}\n\n".into()
    }

    fn chunk_frame(agent: &str, start: usize, end: usize, text: &str, suggestion: &str) -> String {
        format!(
            "data: {{\"type\":\"chunk\",\"agent\":\"{agent}\",\"runIndex\":0,\"errors\":[{{\"id\":\"{agent}-{start}\",\"start\":{start},\"end\":{end},\"text\":\"{text}\",\"suggestion\":\"{suggestion}\",\"type\":\"spelling\"}}]}}\n\n"
        )
    }

    fn recorder() -> (Arc<Mutex<Vec<CheckEvent>>>, Option<Arc<dyn EventHandler>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: Arc<dyn EventHandler> = Arc::new(FnEventHandler(move |e: CheckEvent| {
            sink.lock().unwrap().push(e);
        }));
        (seen, Some(handler))
    }

    fn terminal(outcome: CheckOutcome) -> TerminalReport {
        match outcome {
            CheckOutcome::Terminal(report) => report,
            other => panic!("expected terminal, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_5xx_attempts_exactly_max() {
        let transport = ScriptedTransport::new(vec![]);
        let client = CheckClient::new(transport.clone());
        let report = terminal(client.check(TEXT, CheckOptions::default(), &CancelSignal::new(), None).await);

        assert_eq!(transport.calls(), 3);
        assert_eq!(report.attempts, 3);
        assert_eq!(
            report.kind,
            TerminalKind::Exhausted {
                last: RetryReason::Http5xx
            }
        );
        assert_eq!(report.message, "service unavailable after 3 retries");
        assert_eq!(report.request_id.as_deref(), Some("srv-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_stream_is_retried() {
        let transport = ScriptedTransport::new(vec![
            Scripted::Body {
                chunks: vec![":ready\n\n".into()],
                stall: true,
            },
            Scripted::Body {
                chunks: vec![":ready\n\n".into(), final_frame()],
                stall: false,
            },
        ]);
        let (seen, handler) = recorder();
        let client = CheckClient::new(transport.clone());
        let outcome = client.check(TEXT, CheckOptions::default(), &CancelSignal::new(), handler).await;

        let CheckOutcome::Success { result, attempts } = outcome else {
            panic!("expected success");
        };
        assert_eq!(attempts, 2);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.patched_text(), Some("我今天很高兴。"));
        let reasons: Vec<RetryReason> = seen
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                CheckEvent::Retry { reason, .. } => Some(*reason),
                _ => None,
            })
            .collect();
        assert_eq!(reasons, vec![RetryReason::Idle]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eof_without_final_then_success() {
        let transport = ScriptedTransport::new(vec![
            Scripted::Body {
                chunks: vec![
                    ":ready\n\n".into(),
                    chunk_frame("basic", 4, 6, "高行", "高兴"),
                    "data: not json\n\n".into(),
                ],
                stall: false,
            },
            Scripted::Body {
                chunks: vec![
                    ":ready\n\n".into(),
                    chunk_frame("basic", 4, 6, "高行", "高兴"),
                    chunk_frame("reviewer", 0, 1, "我", "你"),
                    ":ping\n\n".into(),
                    final_frame(),
                ],
                stall: false,
            },
        ]);
        let (seen, handler) = recorder();
        let client = CheckClient::new(transport.clone());
        let outcome = client.check(TEXT, CheckOptions::default(), &CancelSignal::new(), handler).await;
        assert!(outcome.is_success());
        assert_eq!(transport.calls(), 2);

        let seen = seen.lock().unwrap();
        let merged_sizes: Vec<usize> = seen
            .iter()
            .filter_map(|e| match e {
                CheckEvent::Chunk { merged, .. } => Some(merged.len()),
                _ => None,
            })
            .collect();
        // second attempt starts from scratch
        assert_eq!(merged_sizes, vec![1, 1, 2]);
        assert!(seen.iter().any(|e| matches!(
            e,
            CheckEvent::Retry {
                reason: RetryReason::EofNoFinal,
                ..
            }
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_4xx_is_terminal() {
        let transport = ScriptedTransport::new(vec![Scripted::Status(
            400,
            "{\"error\":{\"code\":\"bad_request\",\"message\":\"text must not be empty\"},\"requestId\":\"srv-1\"}",
        )]);
        let client = CheckClient::new(transport.clone())
            .with_policy(RetryPolicy::default().with_mode(ResponseMode::Json));
        let report = terminal(client.check("", CheckOptions::default(), &CancelSignal::new(), None).await);
        assert_eq!(transport.calls(), 1);
        assert_eq!(report.kind, TerminalKind::Http { status: 400 });
        assert_eq!(report.message, "text must not be empty");
    }

    #[tokio::test(start_paused = true)]
    async fn test_4xx_is_terminal_when_streaming() {
        let transport = ScriptedTransport::new(vec![
            Scripted::Status(413, "payload too large"),
            Scripted::Status(500, ""),
        ]);
        let client = CheckClient::new(transport.clone())
            .with_policy(RetryPolicy::default().with_mode(ResponseMode::Stream));
        let report = terminal(client.check("好", CheckOptions::default(), &CancelSignal::new(), None).await);
        assert_eq!(transport.calls(), 1);
        assert_eq!(report.kind, TerminalKind::Http { status: 413 });
        assert_eq!(report.message, "HTTP 413");
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_error_codes() {
        let transport = ScriptedTransport::new(vec![
            Scripted::Body {
                chunks: vec!["data: {\"type\":\"error\",\"code\":\"overloaded\",\"message\":\"busy\"}\n\n".into()],
                stall: false,
            },
            Scripted::Body {
                chunks: vec![
                    "data: {\"type\":\"error\",\"code\":\"internal\",\"message\":\"boom\",\"requestId\":\"srv-2\"}\n\n"
                        .into(),
                ],
                stall: false,
            },
        ]);
        let client = CheckClient::new(transport.clone());
        let report = terminal(client.check(TEXT, CheckOptions::default(), &CancelSignal::new(), None).await);
        assert_eq!(transport.calls(), 2);
        assert_eq!(
            report.kind,
            TerminalKind::Server {
                code: "internal".into()
            }
        );
        assert_eq!(report.message, "boom");
        assert_eq!(report.request_id.as_deref(), Some("srv-2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_exits_without_retry() {
        let transport = ScriptedTransport::new(vec![Scripted::Body {
            chunks: vec![":ready\n\n".into()],
            stall: true,
        }]);
        let client = CheckClient::new(transport.clone());
        let cancel = CancelSignal::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(1)).await;
            trigger.cancel(CancelReason::Aborted);
        });
        let report = terminal(client.check(TEXT, CheckOptions::default(), &cancel, None).await);
        assert_eq!(report.kind, TerminalKind::Canceled);
        assert_eq!(report.message, "request canceled");
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhausted_is_timeout() {
        let transport = ScriptedTransport::new(vec![Scripted::NetworkDown]);
        let policy = RetryPolicy::default()
            .with_total_timeout(Duration::from_secs(1))
            .with_delay_bounds(Duration::from_secs(2), Duration::from_secs(5));
        let client = CheckClient::new(transport.clone()).with_policy(policy);
        let report = terminal(client.check(TEXT, CheckOptions::default(), &CancelSignal::new(), None).await);
        assert_eq!(report.kind, TerminalKind::TimedOut);
        assert_eq!(report.message, "request timed out");
        assert_eq!(transport.calls(), 1);
    }
}
