//! Sequential pipeline executor.
//!
//! [`PipelineExecutor::run_pipeline`] turns a list of [`PipelineEntry`]s into
//! a lazy stream of [`StageEvent`]s. Entries run in order and each run sees
//! the original text; nothing is chained. A failing run becomes an `error`
//! event and the pipeline moves on. Cancellation is the exception: the
//! stream yields `Err(PipelineError::Cancelled)` once and ends, dropping
//! whatever role work was in flight.

use crate::cancel::CancelSignal;
use crate::error::{PipelineError, Result};
use crate::patch::apply_error_items;
use crate::registry::RoleRegistry;
use crate::role::{Role, RoleContext, RoleEvent, RoleInput, RoleOutput};
use crate::types::{meta_keys, ErrorItem, Metadata, PipelineEntry};
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use std::sync::Arc;

/// Codes carried by stage `error` events, besides `role_not_found`.
pub mod codes {
    /// A role run failed; the message carries the cause.
    pub const ROLE_FAILED: &str = "role_failed";
    /// The role's stream ended without a final result.
    pub const NO_FINAL: &str = "no_final";
}

/// One pipeline invocation.
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub entries: Vec<PipelineEntry>,
    pub text: Arc<str>,
    pub cancel: CancelSignal,
    /// Passed to every role; `requestId` is also used for log fields.
    pub metadata: Metadata,
}

impl PipelineRequest {
    pub fn new(entries: Vec<PipelineEntry>, text: impl Into<Arc<str>>, cancel: CancelSignal) -> Self {
        Self {
            entries,
            text: text.into(),
            cancel,
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Final result of one run plus its display-only patch.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalPayload {
    pub output: RoleOutput,
    /// Original text with this run's items applied. Never fed back.
    pub patched_text: String,
    pub applied: Vec<String>,
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StageKind {
    Start,
    Chunk(RoleOutput),
    Final(FinalPayload),
    Error { code: String, message: String },
}

/// Executor output unit.
#[derive(Debug, Clone, PartialEq)]
pub struct StageEvent {
    /// Position of the entry in the request's pipeline.
    pub entry_index: usize,
    pub role_id: String,
    /// `None` only for `role_not_found`.
    pub run_index: Option<u32>,
    pub kind: StageKind,
}

impl StageEvent {
    fn new(entry_index: usize, role_id: &str, run_index: Option<u32>, kind: StageKind) -> Self {
        Self {
            entry_index,
            role_id: role_id.to_string(),
            run_index,
            kind,
        }
    }

    /// `final` or `error`.
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, StageKind::Final(_) | StageKind::Error { .. })
    }
}

/// Runs pipelines against a shared registry.
#[derive(Debug, Clone)]
pub struct PipelineExecutor {
    registry: Arc<RoleRegistry>,
}

impl PipelineExecutor {
    pub fn new(registry: Arc<RoleRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &RoleRegistry {
        &self.registry
    }

    /// Start a pipeline. Nothing runs until the stream is polled.
    pub fn run_pipeline(&self, request: PipelineRequest) -> BoxStream<'static, Result<StageEvent>> {
        let run = Run::new(Arc::clone(&self.registry), request);
        stream::unfold(run, |mut run| async move {
            run.step().await.map(|event| (event, run))
        })
        .boxed()
    }
}

/// Where a pipeline run stands between polls.
enum Phase {
    NextEntry,
    NextRun {
        role: Arc<dyn Role>,
        entry: PipelineEntry,
        run: u32,
    },
    Running {
        role: Arc<dyn Role>,
        entry: PipelineEntry,
        run: u32,
        events: BoxStream<'static, Result<RoleEvent>>,
    },
    Done,
}

struct Run {
    registry: Arc<RoleRegistry>,
    entries: std::iter::Enumerate<std::vec::IntoIter<PipelineEntry>>,
    entry_index: usize,
    text: Arc<str>,
    cancel: CancelSignal,
    metadata: Metadata,
    request_id: String,
    previous: Vec<ErrorItem>,
    phase: Phase,
}

impl Run {
    fn new(registry: Arc<RoleRegistry>, request: PipelineRequest) -> Self {
        let request_id = request
            .metadata
            .get("requestId")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Self {
            registry,
            entries: request.entries.into_iter().enumerate(),
            entry_index: 0,
            text: request.text,
            cancel: request.cancel,
            metadata: request.metadata,
            request_id,
            previous: Vec::new(),
            phase: Phase::NextEntry,
        }
    }

    fn cancelled(&mut self) -> Option<Result<StageEvent>> {
        let reason = self.cancel.reason()?;
        tracing::info!(request_id = %self.request_id, %reason, "pipeline cancelled");
        self.phase = Phase::Done;
        Some(Err(PipelineError::Cancelled(reason)))
    }

    async fn step(&mut self) -> Option<Result<StageEvent>> {
        loop {
            match std::mem::replace(&mut self.phase, Phase::Done) {
                Phase::Done => return None,

                Phase::NextEntry => {
                    if let Some(err) = self.cancelled() {
                        return Some(err);
                    }
                    let (index, entry) = self.entries.next()?;
                    self.entry_index = index;
                    match self.registry.get(&entry.role_id) {
                        Some(role) => self.phase = Phase::NextRun { role, entry, run: 0 },
                        None => {
                            tracing::warn!(request_id = %self.request_id, role = %entry.role_id, "role not registered");
                            self.phase = Phase::NextEntry;
                            let err = PipelineError::RoleNotFound(entry.role_id.clone());
                            return Some(Ok(StageEvent::new(
                                index,
                                &entry.role_id,
                                None,
                                StageKind::Error {
                                    code: err.code().to_string(),
                                    message: err.to_string(),
                                },
                            )));
                        }
                    }
                }

                Phase::NextRun { role, entry, run } => {
                    if run >= entry.run_count() {
                        self.phase = Phase::NextEntry;
                        continue;
                    }
                    if let Some(err) = self.cancelled() {
                        return Some(err);
                    }
                    let model = entry
                        .model_name
                        .clone()
                        .filter(|m| !m.is_empty())
                        .unwrap_or_else(|| role.default_model().to_string());
                    tracing::info!(request_id = %self.request_id, role = %entry.role_id, run_index = run, %model, "stage started");

                    let ctx = RoleContext {
                        cancel: self.cancel.clone(),
                        run_index: run,
                        model,
                        previous: self.previous.clone(),
                        metadata: self.metadata.clone(),
                    };
                    let events = role.run(RoleInput { text: Arc::clone(&self.text) }, ctx).into_stream();
                    let event = StageEvent::new(self.entry_index, &entry.role_id, Some(run), StageKind::Start);
                    self.phase = Phase::Running { role, entry, run, events };
                    return Some(Ok(event));
                }

                Phase::Running { role, entry, run, mut events } => {
                    let next = tokio::select! {
                        biased;
                        reason = self.cancel.cancelled() => Err(reason),
                        event = events.next() => Ok(event),
                    };
                    let event = match next {
                        Ok(event) => event,
                        Err(_) => {
                            // `events` is dropped here with any in-flight call.
                            drop(events);
                            return self.cancelled();
                        }
                    };
                    let role_id = entry.role_id.clone();
                    let entry_index = self.entry_index;
                    let stage = |kind| StageEvent::new(entry_index, &role_id, Some(run), kind);

                    return match event {
                        Some(Ok(RoleEvent::Chunk(output))) => {
                            let output = stamp(output, &role_id, run);
                            let event = stage(StageKind::Chunk(output));
                            self.phase = Phase::Running { role, entry, run, events };
                            Some(Ok(event))
                        }
                        Some(Ok(RoleEvent::Final(output))) => {
                            let output = stamp(output, &role_id, run);
                            let patch = apply_error_items(&self.text, &output.items);
                            tracing::info!(
                                request_id = %self.request_id,
                                role = %role_id,
                                run_index = run,
                                items = output.items.len(),
                                "stage finished"
                            );
                            let event = stage(StageKind::Final(FinalPayload {
                                patched_text: patch.patched_text,
                                applied: patch.applied,
                                skipped: patch.skipped,
                                output: output.clone(),
                            }));
                            self.previous.extend(output.items);
                            self.phase = Phase::NextRun { role, entry, run: run + 1 };
                            Some(Ok(event))
                        }
                        Some(Err(err)) if err.is_cancelled() => {
                            self.phase = Phase::Done;
                            Some(Err(err))
                        }
                        Some(Err(err)) => {
                            tracing::warn!(
                                request_id = %self.request_id,
                                role = %role_id,
                                run_index = run,
                                error = %err,
                                "stage failed"
                            );
                            let event = stage(StageKind::Error {
                                code: codes::ROLE_FAILED.to_string(),
                                message: err.to_string(),
                            });
                            self.phase = Phase::NextRun { role, entry, run: run + 1 };
                            Some(Ok(event))
                        }
                        None => {
                            tracing::warn!(request_id = %self.request_id, role = %role_id, run_index = run, "stage ended without a result");
                            let event = stage(StageKind::Error {
                                code: codes::NO_FINAL.to_string(),
                                message: format!("role '{role_id}' finished without a result"),
                            });
                            self.phase = Phase::NextRun { role, entry, run: run + 1 };
                            Some(Ok(event))
                        }
                    };
                }
            }
        }
    }
}

/// Record which role and run produced each item, keeping existing tags.
fn stamp(mut output: RoleOutput, role_id: &str, run: u32) -> RoleOutput {
    for item in &mut output.items {
        item.metadata
            .entry(meta_keys::ROLE)
            .or_insert_with(|| Value::from(role_id));
        item.metadata
            .entry(meta_keys::RUN_INDEX)
            .or_insert_with(|| Value::from(run));
    }
    output
}
