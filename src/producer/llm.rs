//! LLM-backed candidate producer.

use super::locate::{LocateMode, RawCandidate};
use super::{CandidateProducer, Candidates, ProduceRequest};
use crate::agent::LlmAgent;
use crate::error::Result;
use crate::exec_ctx::ExecCtx;
use crate::text::Utf16Text;
use crate::types::{ErrorItem, ErrorType};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Asks a model for errors of the given categories and locates them.
pub struct LlmProducer {
    agent: LlmAgent,
    ctx: Arc<ExecCtx>,
    locate: LocateMode,
    vars: HashMap<String, String>,
}

impl LlmProducer {
    pub fn new(agent: LlmAgent, ctx: Arc<ExecCtx>, locate: LocateMode) -> Self {
        Self {
            agent,
            ctx,
            locate,
            vars: HashMap::new(),
        }
    }

    /// Limit the prompt to these categories (`{types}` in the template).
    pub fn with_types(mut self, types: &[ErrorType]) -> Self {
        let list = types.iter().map(ErrorType::as_str).collect::<Vec<_>>().join("、");
        self.vars.insert("types".into(), list);
        self
    }

    pub fn locate_mode(&self) -> LocateMode {
        self.locate
    }
}

/// Converted entries, kept so partial and final results share item ids.
#[derive(Default)]
struct EntryCache {
    seen: Vec<(Value, Option<ErrorItem>)>,
    relocated: u32,
    dropped: u32,
}

impl EntryCache {
    fn convert(&mut self, entries: &[Value], text: &Utf16Text, mode: LocateMode) -> Vec<ErrorItem> {
        self.relocated = 0;
        self.dropped = 0;
        let mut items = Vec::with_capacity(entries.len());
        for (i, entry) in entries.iter().enumerate() {
            let cached = self.seen.get(i).filter(|(v, _)| v == entry).map(|(_, item)| item.clone());
            let item = match cached {
                Some(item) => item,
                None => {
                    let item = RawCandidate::from_value(entry)
                        .and_then(|raw| raw.into_item(text, mode, "llm"));
                    if i < self.seen.len() {
                        self.seen[i] = (entry.clone(), item.clone());
                    } else {
                        self.seen.push((entry.clone(), item.clone()));
                    }
                    item
                }
            };
            match item {
                Some(item) => {
                    if item.metadata.get(crate::types::meta_keys::EXACT_LOCATION) == Some(&Value::Bool(false)) {
                        self.relocated += 1;
                    }
                    items.push(item);
                }
                None => self.dropped += 1,
            }
        }
        items
    }
}

impl std::fmt::Debug for LlmProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmProducer")
            .field("agent", &self.agent.name())
            .field("locate", &self.locate)
            .finish()
    }
}

#[async_trait]
impl CandidateProducer for LlmProducer {
    fn source(&self) -> &'static str {
        "llm"
    }

    fn streams(&self) -> bool {
        self.agent.is_streaming()
    }

    async fn produce(&self, text: &str, request: &ProduceRequest) -> Result<Candidates> {
        let utf16 = Utf16Text::new(text);
        let mut cache = EntryCache::default();

        let reply = if request.partial.is_some() && self.agent.is_streaming() {
            let mut sink = |entries: Vec<Value>| {
                let items = cache.convert(&entries, &utf16, self.locate);
                request.send_partial(items);
            };
            self.agent
                .call(&self.ctx, text, &self.vars, &request.model, &request.cancel, Some(&mut sink))
                .await?
        } else {
            self.agent
                .call(&self.ctx, text, &self.vars, &request.model, &request.cancel, None)
                .await?
        };

        let items = cache.convert(&reply.entries, &utf16, self.locate);
        let mut diagnostics = reply.diagnostics;
        diagnostics.relocated = cache.relocated;
        diagnostics.dropped = cache.dropped;
        if cache.dropped > 0 {
            tracing::debug!(dropped = cache.dropped, "model entries could not be located");
        }
        Ok(Candidates {
            items,
            diagnostics: Some(diagnostics),
        })
    }
}
