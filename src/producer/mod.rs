//! Candidate producers.
//!
//! A producer looks at the original text and proposes [`ErrorItem`]s. The
//! deterministic [`RuleProducer`] and the LLM-backed [`LlmProducer`] satisfy
//! the same trait, so a role can wrap either.

pub mod llm;
pub mod locate;
pub mod rules;

pub use llm::LlmProducer;
pub use locate::LocateMode;
pub use rules::RuleProducer;

use crate::cancel::CancelSignal;
use crate::diagnostics::ParseDiagnostics;
use crate::error::Result;
use crate::types::ErrorItem;
use async_trait::async_trait;
use futures::channel::mpsc::UnboundedSender;

/// Per-call inputs for [`CandidateProducer::produce`].
#[derive(Debug, Clone)]
pub struct ProduceRequest {
    /// Model name to use, for producers that call a model.
    pub model: String,
    pub cancel: CancelSignal,
    /// Streaming producers push the items found so far here.
    pub partial: Option<UnboundedSender<Vec<ErrorItem>>>,
}

impl ProduceRequest {
    pub fn new(model: impl Into<String>, cancel: CancelSignal) -> Self {
        Self {
            model: model.into(),
            cancel,
            partial: None,
        }
    }

    pub fn with_partial(mut self, tx: UnboundedSender<Vec<ErrorItem>>) -> Self {
        self.partial = Some(tx);
        self
    }

    /// Forward a partial result, ignoring a receiver that has gone away.
    pub fn send_partial(&self, items: Vec<ErrorItem>) {
        if let Some(tx) = &self.partial {
            let _ = tx.unbounded_send(items);
        }
    }
}

/// What one producer call found.
#[derive(Debug, Clone, Default)]
pub struct Candidates {
    pub items: Vec<ErrorItem>,
    pub diagnostics: Option<ParseDiagnostics>,
}

impl Candidates {
    pub fn new(items: Vec<ErrorItem>) -> Self {
        Self {
            items,
            diagnostics: None,
        }
    }
}

/// Proposes error candidates for a text.
#[async_trait]
pub trait CandidateProducer: Send + Sync {
    /// Provenance tag written to `metadata.source`.
    fn source(&self) -> &'static str;

    /// Whether this producer reports partial results through
    /// [`ProduceRequest::partial`].
    fn streams(&self) -> bool {
        false
    }

    async fn produce(&self, text: &str, request: &ProduceRequest) -> Result<Candidates>;
}
