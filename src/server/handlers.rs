//! Route handlers and request validation.

use super::{stream, AppState, ServerSettings, REQUEST_ID_HEADER};
use crate::cancel::CancelReason;
use crate::error::{PipelineError, Result};
use crate::executor::PipelineRequest;
use crate::outcome::{AllStagesFailed, OutcomeBuilder};
use crate::sse::codes;
use crate::text::utf16_len;
use crate::types::{CheckRequest, PipelineEntry};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use serde_json::json;

/// Most entries a request pipeline may have.
pub const MAX_PIPELINE_ENTRIES: usize = 8;
/// Most runs one entry may ask for.
pub const MAX_RUNS: u32 = 5;

/// Use the caller's `x-request-id` if it is sane, otherwise mint one.
pub fn request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|id| !id.is_empty() && id.len() <= 128)
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

pub fn wants_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains("text/event-stream"))
}

/// Check the body and resolve the pipeline to run.
pub fn validate(request: CheckRequest, settings: &ServerSettings) -> Result<(String, Vec<PipelineEntry>)> {
    if request.text.trim().is_empty() {
        return Err(PipelineError::InvalidRequest("text must not be empty".into()));
    }
    let len = utf16_len(&request.text);
    if len > settings.max_text_chars {
        return Err(PipelineError::InvalidRequest(format!(
            "text is {len} characters long; the limit is {}",
            settings.max_text_chars
        )));
    }
    let pipeline = request
        .options
        .pipeline
        .unwrap_or_else(|| settings.default_pipeline.clone());
    if pipeline.len() > MAX_PIPELINE_ENTRIES {
        return Err(PipelineError::InvalidRequest(format!(
            "pipeline has {} entries; the limit is {MAX_PIPELINE_ENTRIES}",
            pipeline.len()
        )));
    }
    for (i, entry) in pipeline.iter().enumerate() {
        if entry.role_id.trim().is_empty() {
            return Err(PipelineError::InvalidRequest(format!("pipeline[{i}].roleId is empty")));
        }
        if entry.runs == 0 || entry.runs > MAX_RUNS {
            return Err(PipelineError::InvalidRequest(format!(
                "pipeline[{i}].runs must be between 1 and {MAX_RUNS}"
            )));
        }
    }
    Ok((request.text, pipeline))
}

/// `{ error: { code, message }, requestId }` with `status`.
pub fn error_response(status: StatusCode, code: &str, message: &str, request_id: &str) -> Response {
    let body = json!({
        "error": { "code": code, "message": message },
        "requestId": request_id,
    });
    (status, Json(body)).into_response()
}

fn with_request_id(mut response: Response, request_id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// `POST /api/check`
pub async fn check(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let request_id = request_id(&headers);
    let parsed = serde_json::from_slice::<CheckRequest>(&body)
        .map_err(|e| PipelineError::InvalidRequest(format!("malformed body: {e}")))
        .and_then(|request| validate(request, &state.settings));
    let (text, entries) = match parsed {
        Ok(ok) => ok,
        Err(err) => {
            tracing::info!(request_id = %request_id, error = %err, "rejected check request");
            let response = error_response(StatusCode::BAD_REQUEST, err.code(), &err.to_string(), &request_id);
            return with_request_id(response, &request_id);
        }
    };

    let streaming = wants_event_stream(&headers);
    tracing::info!(
        request_id = %request_id,
        chars = utf16_len(&text),
        entries = entries.len(),
        streaming,
        "check request"
    );
    let request = PipelineRequest::new(entries, text, crate::cancel::CancelSignal::new())
        .with_metadata("requestId", request_id.clone());

    let response = if streaming {
        stream::sse_response(&state, request, request_id.clone())
    } else {
        check_json(&state, request, &request_id).await
    };
    with_request_id(response, &request_id)
}

/// Run the pipeline to the end and answer with one JSON body.
async fn check_json(state: &AppState, request: PipelineRequest, request_id: &str) -> Response {
    let cancel = request.cancel.clone();
    let _deadline = cancel.cancel_after(state.settings.request_timeout);
    // fires if the handler future is dropped (client went away)
    let mut abort = cancel.abort_on_drop();

    let mut outcome = OutcomeBuilder::new(request.text.clone(), request_id, state.settings.merge.clone());
    let mut events = state.executor.run_pipeline(request);
    while let Some(event) = events.next().await {
        match event {
            Ok(event) => outcome.observe(&event),
            Err(PipelineError::Cancelled(CancelReason::TimedOut)) => {
                tracing::warn!(request_id, "check timed out");
                return error_response(StatusCode::GATEWAY_TIMEOUT, codes::TIMEOUT, "request timed out", request_id);
            }
            Err(err) => {
                tracing::error!(request_id, error = %err, "pipeline aborted");
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, codes::INTERNAL, &err.to_string(), request_id);
            }
        }
    }
    abort.disarm();

    match outcome.finish() {
        Ok(result) => (StatusCode::OK, Json(result)).into_response(),
        Err(failed) => {
            tracing::warn!(request_id, warnings = ?failed.meta.warnings, "every stage failed");
            error_response(StatusCode::BAD_GATEWAY, AllStagesFailed::CODE, &failed.message(), request_id)
        }
    }
}

/// `GET /healthz`
pub async fn healthz(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "roles": state.executor.registry().ids(),
    }))
}
