//! Roles: named pipeline stages.
//!
//! A [`Role`] wraps one candidate-producing capability with an identity.
//! Roles are stateless; everything a run needs arrives in [`RoleContext`].
//! [`Role::run`] returns a [`RoleRun`], which declares up front whether the
//! role answers once or streams partial results.

pub mod producer_role;
pub mod reviewer;

pub use producer_role::ProducerRole;
pub use reviewer::ReviewerRole;

use crate::cancel::CancelSignal;
use crate::diagnostics::ParseDiagnostics;
use crate::error::Result;
use crate::types::{ErrorItem, ErrorType, Metadata};
use futures::stream::{self, BoxStream, StreamExt};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// A boxed, pinned, Send future -- the single-shot form of [`RoleRun`].
pub type BoxFut<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Ids of the built-in roles.
pub mod ids {
    pub const BASIC: &str = "basic";
    pub const RULES: &str = "rules";
    pub const REVIEWER: &str = "reviewer";
}

/// Text a role inspects. Always the original request text.
#[derive(Debug, Clone)]
pub struct RoleInput {
    pub text: Arc<str>,
}

impl RoleInput {
    pub fn new(text: impl Into<Arc<str>>) -> Self {
        Self { text: text.into() }
    }
}

/// Per-run state handed to [`Role::run`].
#[derive(Debug, Clone)]
pub struct RoleContext {
    pub cancel: CancelSignal,
    pub run_index: u32,
    /// Model selected for this entry (entry override or role default).
    pub model: String,
    /// Final items of every earlier run in this request.
    pub previous: Vec<ErrorItem>,
    /// Request metadata (request id and the like).
    pub metadata: Metadata,
}

impl RoleContext {
    pub fn new(cancel: CancelSignal, model: impl Into<String>) -> Self {
        Self {
            cancel,
            run_index: 0,
            model: model.into(),
            previous: Vec::new(),
            metadata: Metadata::new(),
        }
    }

    pub fn with_run_index(mut self, run_index: u32) -> Self {
        self.run_index = run_index;
        self
    }

    pub fn with_previous(mut self, previous: Vec<ErrorItem>) -> Self {
        self.previous = previous;
        self
    }
}

/// Result of one role run (or a partial view of it).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoleOutput {
    pub items: Vec<ErrorItem>,
    pub diagnostics: Option<ParseDiagnostics>,
    /// Model that produced the items, if a model was involved.
    pub model: Option<String>,
}

impl RoleOutput {
    pub fn new(items: Vec<ErrorItem>) -> Self {
        Self {
            items,
            ..Default::default()
        }
    }
}

/// One element of a streaming role run.
#[derive(Debug, Clone, PartialEq)]
pub enum RoleEvent {
    /// Items found so far. Each chunk replaces the previous one.
    Chunk(RoleOutput),
    /// The run's result. Nothing follows it.
    Final(RoleOutput),
}

/// How a role answers.
pub enum RoleRun {
    /// One future resolving to the final output.
    Single(BoxFut<'static, Result<RoleOutput>>),
    /// Zero or more chunks, then one final.
    Streaming(BoxStream<'static, Result<RoleEvent>>),
}

impl RoleRun {
    /// View either form as an event stream.
    pub fn into_stream(self) -> BoxStream<'static, Result<RoleEvent>> {
        match self {
            RoleRun::Single(fut) => stream::once(async move { fut.await.map(RoleEvent::Final) }).boxed(),
            RoleRun::Streaming(events) => events,
        }
    }
}

impl std::fmt::Debug for RoleRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoleRun::Single(_) => f.write_str("RoleRun::Single"),
            RoleRun::Streaming(_) => f.write_str("RoleRun::Streaming"),
        }
    }
}

/// A pluggable pipeline stage.
///
/// The returned [`RoleRun`] must own everything it uses (`'static`), so the
/// executor can hold it across suspension points and drop it on cancel.
pub trait Role: Send + Sync {
    fn id(&self) -> &str;

    fn name(&self) -> &str;

    /// Error categories this role reports.
    fn capabilities(&self) -> &[ErrorType];

    /// Model used when the pipeline entry does not name one.
    fn default_model(&self) -> &str;

    fn run(&self, input: RoleInput, ctx: RoleContext) -> RoleRun;
}
