//! The `reviewer` role: second opinion on earlier stages' candidates.

use super::{Role, RoleContext, RoleInput, RoleOutput, RoleRun};
use crate::agent::LlmAgent;
use crate::error::Result;
use crate::exec_ctx::ExecCtx;
use crate::merge::{dedup, merge, MergeConfig};
use crate::producer::locate::{LocateMode, RawCandidate};
use crate::prompt::numbered_list;
use crate::text::Utf16Text;
use crate::types::{meta_keys, ErrorItem, ErrorType};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// A reviewer's verdict on one candidate.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Accept,
    Reject,
    /// Replacement fields reported by the model.
    Modify(Value),
}

/// Read `[{index, decision, ...}]` entries into 1-based decisions.
///
/// The first decision for an index wins; entries without a usable index or
/// decision are ignored.
pub fn parse_decisions(entries: &[Value]) -> HashMap<usize, Decision> {
    let mut decisions = HashMap::new();
    for entry in entries {
        let index = match entry.get("index").or_else(|| entry.get("id")) {
            Some(Value::Number(n)) => n.as_u64().map(|n| n as usize),
            Some(Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        };
        let Some(index) = index.filter(|i| *i >= 1) else {
            continue;
        };
        let verdict = entry
            .get("decision")
            .or_else(|| entry.get("action"))
            .and_then(Value::as_str)
            .map(|s| s.trim().to_ascii_lowercase());
        let decision = match verdict.as_deref() {
            Some("accept") | Some("keep") => Decision::Accept,
            Some("reject") | Some("drop") => Decision::Reject,
            Some("modify") | Some("edit") => Decision::Modify(entry.clone()),
            _ => continue,
        };
        decisions.entry(index).or_insert(decision);
    }
    decisions
}

/// Candidate line shown to the model.
fn describe(item: &ErrorItem) -> String {
    json!({
        "start": item.start,
        "end": item.end,
        "text": item.text,
        "suggestion": item.suggestion,
        "type": item.error_type.as_str(),
        "explanation": item.explanation,
    })
    .to_string()
}

/// Build the modified item, or `None` if its span does not check out.
fn modified(
    original: &ErrorItem,
    fields: &Value,
    text: &Utf16Text,
    mode: LocateMode,
) -> Option<ErrorItem> {
    let mut merged = json!({
        "start": original.start,
        "end": original.end,
        "text": original.text,
        "suggestion": original.suggestion,
        "type": original.error_type.as_str(),
        "explanation": original.explanation,
    });
    if let (Some(base), Some(update)) = (merged.as_object_mut(), fields.as_object()) {
        for (k, v) in update {
            if !v.is_null() {
                base.insert(k.clone(), v.clone());
            }
        }
    }
    let mut item = RawCandidate::from_value(&merged)?.into_item(text, mode, "reviewer")?;
    item = item
        .with_meta(meta_keys::DECISION, "modify")
        .with_meta(meta_keys::REVIEWED_FROM, original.id.clone());
    if item.confidence().is_none() {
        if let Some(c) = original.confidence() {
            item = item.with_confidence(c);
        }
    }
    Some(item)
}

/// Apply decisions to the numbered candidates.
///
/// Accepted items keep their id. Rejected items are dropped. Modified items
/// get a fresh id and point back at the original; a modification whose span
/// fails validation leaves the original in place as undecided, as does a
/// missing decision.
pub fn apply_decisions(
    text: &str,
    candidates: &[ErrorItem],
    decisions: &HashMap<usize, Decision>,
    mode: LocateMode,
) -> (Vec<ErrorItem>, u32) {
    let utf16 = Utf16Text::new(text);
    let mut kept = Vec::with_capacity(candidates.len());
    let mut invalid = 0;
    for (i, item) in candidates.iter().enumerate() {
        let undecided = || item.clone().with_meta(meta_keys::DECISION, "undecided");
        match decisions.get(&(i + 1)) {
            Some(Decision::Accept) => kept.push(item.clone().with_meta(meta_keys::DECISION, "accept")),
            Some(Decision::Reject) => {}
            Some(Decision::Modify(fields)) => match modified(item, fields, &utf16, mode) {
                Some(m) => kept.push(m),
                None => {
                    invalid += 1;
                    kept.push(undecided());
                }
            },
            None => kept.push(undecided()),
        }
    }
    (kept, invalid)
}

/// One review pass over `ctx.previous`.
async fn review(
    agent: Arc<LlmAgent>,
    exec: Arc<ExecCtx>,
    merge_config: Arc<MergeConfig>,
    mode: LocateMode,
    input: RoleInput,
    ctx: RoleContext,
) -> Result<RoleOutput> {
    let text: &str = &input.text;
    // Overlaps are left for the model to judge and resolved afterwards.
    let candidates = dedup(text, [ctx.previous], &merge_config);
    if candidates.is_empty() {
        return Ok(RoleOutput::new(Vec::new()));
    }

    let lines: Vec<String> = candidates.iter().map(describe).collect();
    let mut vars = HashMap::new();
    vars.insert("candidates".to_string(), numbered_list(&lines));
    let reply = agent
        .call(&exec, text, &vars, &ctx.model, &ctx.cancel, None)
        .await?;

    let decisions = parse_decisions(&reply.entries);
    let (kept, invalid) = apply_decisions(text, &candidates, &decisions, mode);
    tracing::debug!(
        candidates = candidates.len(),
        decided = decisions.len(),
        kept = kept.len(),
        invalid,
        "review applied"
    );
    let mut diagnostics = reply.diagnostics;
    diagnostics.dropped = invalid;
    Ok(RoleOutput {
        items: merge(text, [kept], &merge_config),
        diagnostics: Some(diagnostics),
        model: Some(ctx.model),
    })
}

/// Reviews the union of earlier final items with an LLM.
///
/// With nothing to review the run finishes immediately with no items and
/// no model call.
pub struct ReviewerRole {
    id: String,
    name: String,
    capabilities: Vec<ErrorType>,
    default_model: String,
    agent: Arc<LlmAgent>,
    ctx: Arc<ExecCtx>,
    locate: LocateMode,
    merge: Arc<MergeConfig>,
}

impl ReviewerRole {
    pub fn new(agent: LlmAgent, ctx: Arc<ExecCtx>) -> Self {
        Self {
            id: super::ids::REVIEWER.to_string(),
            name: "审校".to_string(),
            capabilities: ErrorType::builtin(),
            default_model: String::new(),
            agent: Arc::new(agent),
            ctx,
            locate: LocateMode::ExactIndex,
            merge: Arc::new(MergeConfig::default()),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    pub fn with_locate(mut self, mode: LocateMode) -> Self {
        self.locate = mode;
        self
    }

    pub fn with_merge(mut self, config: MergeConfig) -> Self {
        self.merge = Arc::new(config);
        self
    }
}

impl Role for ReviewerRole {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &[ErrorType] {
        &self.capabilities
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    fn run(&self, input: RoleInput, ctx: RoleContext) -> RoleRun {
        let agent = Arc::clone(&self.agent);
        let exec = Arc::clone(&self.ctx);
        let merge_config = Arc::clone(&self.merge);
        let mode = self.locate;

        RoleRun::Single(Box::pin(review(agent, exec, merge_config, mode, input, ctx)))
    }
}

impl std::fmt::Debug for ReviewerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReviewerRole")
            .field("id", &self.id)
            .field("locate", &self.locate)
            .finish()
    }
}
