//! SSE response body for `/api/check`.
//!
//! Frames, in order: `:ready`, any number of `chunk` / `warning` events
//! interleaved with `:ping` heartbeats, then exactly one `final` or
//! `error`. An aborted request (client gone) just ends the stream.

use super::AppState;
use crate::cancel::{AbortOnDrop, CancelReason, DeadlineGuard};
use crate::error::{PipelineError, Result};
use crate::executor::{PipelineRequest, StageEvent, StageKind};
use crate::outcome::{AllStagesFailed, OutcomeBuilder};
use crate::sse::{codes, encode_comment, encode_data, WireEvent};
use axum::body::{Body, Bytes};
use axum::http::{header, HeaderValue};
use axum::response::Response;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::VecDeque;
use std::convert::Infallible;
use std::time::Duration;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

/// Start the pipeline and wrap it in an event-stream response.
pub fn sse_response(state: &AppState, request: PipelineRequest, request_id: String) -> Response {
    let settings = &state.settings;
    let outcome = OutcomeBuilder::new(request.text.clone(), request_id.clone(), settings.merge.clone());
    let cancel = request.cancel.clone();
    let deadline = cancel.cancel_after(settings.request_timeout);
    let abort = cancel.abort_on_drop();
    let events = state.executor.run_pipeline(request);

    let body = SseBody::new(events, outcome, settings.heartbeat, abort, Some(deadline), request_id);
    let frames = stream::unfold(body, |mut body| async move {
        body.next_frame()
            .await
            .map(|frame| (Ok::<Bytes, Infallible>(Bytes::from(frame)), body))
    });

    let mut response = Response::new(Body::from_stream(frames));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    response
}

/// Pulls stage events and turns them into encoded SSE frames.
pub struct SseBody {
    events: BoxStream<'static, Result<StageEvent>>,
    outcome: Option<OutcomeBuilder>,
    heartbeat: Interval,
    queue: VecDeque<String>,
    abort: AbortOnDrop,
    _deadline: Option<DeadlineGuard>,
    request_id: String,
    finished: bool,
}

impl SseBody {
    pub fn new(
        events: BoxStream<'static, Result<StageEvent>>,
        outcome: OutcomeBuilder,
        heartbeat: Duration,
        abort: AbortOnDrop,
        deadline: Option<DeadlineGuard>,
        request_id: String,
    ) -> Self {
        let mut heartbeat = interval_at(Instant::now() + heartbeat, heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            events,
            outcome: Some(outcome),
            heartbeat,
            queue: VecDeque::from([encode_comment("ready")]),
            abort,
            _deadline: deadline,
            request_id,
            finished: false,
        }
    }

    /// Next encoded frame, or `None` once the terminal frame has gone out.
    pub async fn next_frame(&mut self) -> Option<String> {
        loop {
            if let Some(frame) = self.queue.pop_front() {
                return Some(frame);
            }
            if self.finished {
                return None;
            }
            tokio::select! {
                biased;
                event = self.events.next() => match event {
                    Some(Ok(event)) => self.on_stage(event),
                    Some(Err(err)) => self.on_abort(err),
                    None => self.on_complete(),
                },
                _ = self.heartbeat.tick() => self.queue.push_back(encode_comment("ping")),
            }
        }
    }

    fn push(&mut self, event: &WireEvent) {
        match encode_data(event) {
            Ok(frame) => self.queue.push_back(frame),
            Err(e) => tracing::error!(request_id = %self.request_id, error = %e, "failed to encode event"),
        }
    }

    fn on_stage(&mut self, event: StageEvent) {
        if let Some(outcome) = self.outcome.as_mut() {
            outcome.observe(&event);
        }
        let wire = match event.kind {
            StageKind::Start => return,
            StageKind::Chunk(output) => WireEvent::Chunk {
                agent: event.role_id,
                errors: output.items,
                run_index: event.run_index,
            },
            StageKind::Final(payload) => WireEvent::Chunk {
                agent: event.role_id,
                errors: payload.output.items,
                run_index: event.run_index,
            },
            StageKind::Error { message, .. } => WireEvent::Warning {
                agent: event.role_id,
                message,
            },
        };
        self.push(&wire);
    }

    fn on_complete(&mut self) {
        self.finished = true;
        self.abort.disarm();
        let Some(outcome) = self.outcome.take() else {
            return;
        };
        let wire = match outcome.finish() {
            Ok(result) => {
                tracing::info!(
                    request_id = %self.request_id,
                    errors = result.errors.len(),
                    fallback = result.meta.fallback,
                    "check stream complete"
                );
                let patched_text = result.meta.patched_text.clone();
                WireEvent::Final {
                    errors: result.errors,
                    meta: result.meta,
                    patched_text,
                }
            }
            Err(failed) => {
                tracing::warn!(request_id = %self.request_id, "every stage failed");
                self.error_event(AllStagesFailed::CODE, failed.message())
            }
        };
        self.push(&wire);
    }

    fn on_abort(&mut self, err: PipelineError) {
        self.finished = true;
        self.outcome = None;
        let wire = match err {
            PipelineError::Cancelled(CancelReason::Aborted) => {
                tracing::info!(request_id = %self.request_id, "client went away");
                return;
            }
            PipelineError::Cancelled(CancelReason::TimedOut) => {
                tracing::warn!(request_id = %self.request_id, "check timed out");
                self.error_event(codes::TIMEOUT, "request timed out".to_string())
            }
            other => {
                tracing::error!(request_id = %self.request_id, error = %other, "pipeline aborted");
                self.error_event(codes::INTERNAL, other.to_string())
            }
        };
        self.push(&wire);
    }

    fn error_event(&self, code: &str, message: String) -> WireEvent {
        WireEvent::Error {
            code: code.to_string(),
            message,
            request_id: Some(self.request_id.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelSignal;
    use crate::executor::FinalPayload;
    use crate::merge::MergeConfig;
    use crate::role::RoleOutput;
    use crate::sse::{SseDecoder, SseFrame};
    use crate::types::{ErrorItem, ErrorType};

    const TEXT: &str = "我今天很高行。";

    fn event(entry: usize, role: &str, kind: StageKind) -> Result<StageEvent> {
        Ok(StageEvent {
            entry_index: entry,
            role_id: role.into(),
            run_index: Some(0),
            kind,
        })
    }

    fn final_kind(items: Vec<ErrorItem>) -> StageKind {
        StageKind::Final(FinalPayload {
            output: RoleOutput::new(items),
            patched_text: String::new(),
            applied: Vec::new(),
            skipped: Vec::new(),
        })
    }

    fn body(events: Vec<Result<StageEvent>>, signal: &CancelSignal) -> SseBody {
        SseBody::new(
            stream::iter(events).boxed(),
            OutcomeBuilder::new(TEXT, "req-9", MergeConfig::default()),
            Duration::from_secs(15),
            signal.abort_on_drop(),
            None,
            "req-9".into(),
        )
    }

    async fn frames(mut body: SseBody) -> Vec<SseFrame> {
        let mut decoder = SseDecoder::new();
        let mut out = Vec::new();
        while let Some(frame) = body.next_frame().await {
            out.extend(decoder.decode(frame.as_bytes()));
        }
        out
    }

    fn data_types(frames: &[SseFrame]) -> Vec<String> {
        frames
            .iter()
            .filter_map(|f| match f {
                SseFrame::Data(v) => v["type"].as_str().map(str::to_string),
                SseFrame::Comment(_) => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_ready_chunks_then_final() {
        let signal = CancelSignal::new();
        let item = ErrorItem::new(4, 6, "高行", "高兴", ErrorType::Spelling);
        let out = frames(body(
            vec![
                event(0, "basic", StageKind::Start),
                event(0, "basic", StageKind::Chunk(RoleOutput::new(vec![item.clone()]))),
                event(0, "basic", final_kind(vec![item.clone()])),
                event(1, "reviewer", StageKind::Start),
                event(
                    1,
                    "reviewer",
                    StageKind::Error {
                        code: "role_failed".into(),
                        message: "upstream 500".into(),
                    },
                ),
            ],
            &signal,
        ))
        .await;

        assert_eq!(out[0], SseFrame::Comment("ready".into()));
        assert_eq!(data_types(&out), vec!["chunk", "chunk", "warning", "final"]);
        let SseFrame::Data(last) = out.last().unwrap() else {
            panic!("expected data frame");
        };
        assert_eq!(last["patchedText"], "我今天很高兴。");
        assert_eq!(last["meta"]["fallback"], true);
        assert_eq!(last["meta"]["requestId"], "req-9");
        assert!(!signal.is_cancelled());
    }

    #[tokio::test]
    async fn test_all_failed_is_error_event() {
        let signal = CancelSignal::new();
        let out = frames(body(
            vec![event(
                0,
                "basic",
                StageKind::Error {
                    code: "role_failed".into(),
                    message: "boom".into(),
                },
            )],
            &signal,
        ))
        .await;
        assert_eq!(data_types(&out), vec!["warning", "error"]);
        let SseFrame::Data(last) = out.last().unwrap() else {
            panic!("expected data frame");
        };
        assert_eq!(last["code"], "upstream_unavailable");
        assert_eq!(last["requestId"], "req-9");
    }

    #[tokio::test]
    async fn test_timeout_and_abort() {
        let signal = CancelSignal::new();
        let out = frames(body(
            vec![Err(PipelineError::Cancelled(CancelReason::TimedOut))],
            &signal,
        ))
        .await;
        assert_eq!(data_types(&out), vec!["error"]);
        let SseFrame::Data(last) = out.last().unwrap() else {
            panic!("expected data frame");
        };
        assert_eq!(last["code"], "timeout");
        assert_eq!(last["message"], "request timed out");

        let signal = CancelSignal::new();
        let out = frames(body(
            vec![Err(PipelineError::Cancelled(CancelReason::Aborted))],
            &signal,
        ))
        .await;
        assert_eq!(out, vec![SseFrame::Comment("ready".into())]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_while_idle() {
        let signal = CancelSignal::new();
        let (tx, rx) = futures::channel::mpsc::unbounded::<Result<StageEvent>>();
        let mut body = SseBody::new(
            rx.boxed(),
            OutcomeBuilder::new(TEXT, "req-9", MergeConfig::default()),
            Duration::from_secs(15),
            signal.abort_on_drop(),
            None,
            "req-9".into(),
        );
        assert_eq!(body.next_frame().await.as_deref(), Some(":ready\n\n"));
        {
            // nothing is due before the heartbeat interval elapses
            let mut next = tokio_test::task::spawn(body.next_frame());
            tokio_test::assert_pending!(next.poll());
        }
        assert_eq!(body.next_frame().await.as_deref(), Some(":ping\n\n"));
        drop(tx);
        let last = body.next_frame().await.unwrap();
        assert!(last.contains("\"type\":\"final\""));
        assert_eq!(body.next_frame().await, None);
    }

    #[tokio::test]
    async fn test_dropping_body_aborts() {
        let signal = CancelSignal::new();
        let (_tx, rx) = futures::channel::mpsc::unbounded::<Result<StageEvent>>();
        let body = SseBody::new(
            rx.boxed(),
            OutcomeBuilder::new(TEXT, "req-9", MergeConfig::default()),
            Duration::from_secs(15),
            signal.abort_on_drop(),
            None,
            "req-9".into(),
        );
        drop(body);
        assert_eq!(signal.reason(), Some(CancelReason::Aborted));
    }
}
