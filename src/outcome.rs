//! Best-available result for a whole request.
//!
//! [`OutcomeBuilder`] watches a pipeline's stage events and, once the
//! stream is done, produces the response body. The authoritative entry is
//! the last one with a successful run; if something after it failed the
//! result falls back to it and says so in `meta.warnings`.

use crate::executor::{StageEvent, StageKind};
use crate::merge::{merge, MergeConfig};
use crate::patch::apply_error_items;
use crate::types::ErrorItem;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    #[default]
    Final,
    Error,
}

/// One `(role, run)` cell as reported in `meta.stages`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StageSummary {
    pub role_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_index: Option<u32>,
    pub status: StageStatus,
    /// Items in the run's final result.
    pub count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// `meta` of a check response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CheckMeta {
    pub request_id: String,
    pub elapsed_ms: u64,
    /// Role whose results were used.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// A later stage failed and an earlier stage's results were used.
    pub fallback: bool,
    pub warnings: Vec<String>,
    pub stages: Vec<StageSummary>,
    /// Items the patch applied / skipped.
    pub applied: usize,
    pub skipped: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patched_text: Option<String>,
}

/// JSON response body: `{ errors, meta }`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub errors: Vec<ErrorItem>,
    pub meta: CheckMeta,
}

impl CheckResult {
    pub fn patched_text(&self) -> Option<&str> {
        self.meta.patched_text.as_deref()
    }
}

/// Every entry that ran failed; there is nothing to show.
#[derive(Debug, Clone, PartialEq)]
pub struct AllStagesFailed {
    pub meta: CheckMeta,
}

impl AllStagesFailed {
    pub const CODE: &'static str = crate::sse::codes::UPSTREAM_UNAVAILABLE;

    pub fn message(&self) -> String {
        match self.meta.warnings.last() {
            Some(last) => format!("all pipeline stages failed: {last}"),
            None => "all pipeline stages failed".to_string(),
        }
    }
}

#[derive(Debug, Default)]
struct EntryState {
    role_id: String,
    finals: Vec<Vec<ErrorItem>>,
    failures: usize,
}

/// Collects stage events into a [`CheckResult`].
#[derive(Debug)]
pub struct OutcomeBuilder {
    text: Arc<str>,
    request_id: String,
    merge: MergeConfig,
    started: Instant,
    entries: Vec<EntryState>,
    warnings: Vec<String>,
    stages: Vec<StageSummary>,
}

impl OutcomeBuilder {
    pub fn new(text: impl Into<Arc<str>>, request_id: impl Into<String>, merge: MergeConfig) -> Self {
        Self {
            text: text.into(),
            request_id: request_id.into(),
            merge,
            started: Instant::now(),
            entries: Vec::new(),
            warnings: Vec::new(),
            stages: Vec::new(),
        }
    }

    fn entry(&mut self, event: &StageEvent) -> &mut EntryState {
        if self.entries.len() <= event.entry_index {
            self.entries.resize_with(event.entry_index + 1, EntryState::default);
        }
        let entry = &mut self.entries[event.entry_index];
        if entry.role_id.is_empty() {
            entry.role_id = event.role_id.clone();
        }
        entry
    }

    pub fn observe(&mut self, event: &StageEvent) {
        match &event.kind {
            StageKind::Start => {
                self.entry(event);
            }
            StageKind::Chunk(_) => {}
            StageKind::Final(payload) => {
                self.entry(event).finals.push(payload.output.items.clone());
                self.stages.push(StageSummary {
                    role_id: event.role_id.clone(),
                    run_index: event.run_index,
                    status: StageStatus::Final,
                    count: payload.output.items.len(),
                    code: None,
                });
            }
            StageKind::Error { code, message } => {
                self.entry(event).failures += 1;
                self.warnings.push(match event.run_index {
                    Some(run) => format!("{}#{}: {}", event.role_id, run, message),
                    None => format!("{}: {}", event.role_id, message),
                });
                self.stages.push(StageSummary {
                    role_id: event.role_id.clone(),
                    run_index: event.run_index,
                    status: StageStatus::Error,
                    count: 0,
                    code: Some(code.clone()),
                });
            }
        }
    }

    /// Warnings collected so far.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn finish(self) -> Result<CheckResult, AllStagesFailed> {
        let mut meta = CheckMeta {
            request_id: self.request_id,
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            warnings: self.warnings,
            stages: self.stages,
            ..Default::default()
        };

        let Some(auth) = self.entries.iter().rposition(|e| !e.finals.is_empty()) else {
            if self.entries.is_empty() {
                meta.patched_text = Some(self.text.to_string());
                return Ok(CheckResult {
                    errors: Vec::new(),
                    meta,
                });
            }
            return Err(AllStagesFailed { meta });
        };

        let chosen = &self.entries[auth];
        if let Some(failed) = self.entries[auth + 1..]
            .iter()
            .find(|e| e.finals.is_empty() && e.failures > 0)
        {
            meta.fallback = true;
            meta.warnings.push(format!(
                "stage '{}' failed; showing results from '{}'",
                failed.role_id, chosen.role_id
            ));
        }

        let errors = merge(&self.text, chosen.finals.iter().cloned(), &self.merge);
        let patch = apply_error_items(&self.text, &errors);
        meta.source = Some(chosen.role_id.clone());
        meta.applied = patch.applied.len();
        meta.skipped = patch.skipped.len();
        meta.patched_text = Some(patch.patched_text);
        Ok(CheckResult { errors, meta })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::FinalPayload;
    use crate::role::RoleOutput;
    use crate::types::ErrorType;

    const TEXT: &str = "我今天很高行。";

    fn gaoxing() -> ErrorItem {
        ErrorItem::new(4, 6, "高行", "高兴", ErrorType::Spelling)
    }

    fn start(entry: usize, role: &str, run: u32) -> StageEvent {
        StageEvent {
            entry_index: entry,
            role_id: role.into(),
            run_index: Some(run),
            kind: StageKind::Start,
        }
    }

    fn fin(entry: usize, role: &str, run: u32, items: Vec<ErrorItem>) -> StageEvent {
        StageEvent {
            entry_index: entry,
            role_id: role.into(),
            run_index: Some(run),
            kind: StageKind::Final(FinalPayload {
                output: RoleOutput::new(items),
                patched_text: String::new(),
                applied: Vec::new(),
                skipped: Vec::new(),
            }),
        }
    }

    fn err(entry: usize, role: &str, run: Option<u32>, code: &str) -> StageEvent {
        StageEvent {
            entry_index: entry,
            role_id: role.into(),
            run_index: run,
            kind: StageKind::Error {
                code: code.into(),
                message: "boom".into(),
            },
        }
    }

    fn build(events: &[StageEvent]) -> Result<CheckResult, AllStagesFailed> {
        let mut b = OutcomeBuilder::new(TEXT, "req-1", MergeConfig::default());
        for e in events {
            b.observe(e);
        }
        b.finish()
    }

    #[test]
    fn test_last_successful_entry_wins() {
        let accepted = gaoxing();
        let result = build(&[
            start(0, "basic", 0),
            fin(0, "basic", 0, vec![gaoxing(), ErrorItem::new(0, 1, "我", "你", ErrorType::Grammar)]),
            start(1, "reviewer", 0),
            fin(1, "reviewer", 0, vec![accepted.clone()]),
        ])
        .unwrap();
        assert_eq!(result.errors, vec![accepted]);
        assert_eq!(result.meta.source.as_deref(), Some("reviewer"));
        assert!(!result.meta.fallback);
        assert_eq!(result.patched_text(), Some("我今天很高兴。"));
        assert_eq!(result.meta.applied, 1);
        assert_eq!(result.meta.stages.len(), 2);
    }

    #[test]
    fn test_runs_of_one_entry_are_merged() {
        let result = build(&[
            fin(0, "basic", 0, vec![gaoxing()]),
            fin(0, "basic", 1, vec![gaoxing(), ErrorItem::new(6, 7, "。", "！", ErrorType::Punctuation)]),
        ])
        .unwrap();
        assert_eq!(result.errors.len(), 2);
    }

    #[test]
    fn test_reviewer_failure_falls_back() {
        let result = build(&[
            start(0, "basic", 0),
            fin(0, "basic", 0, vec![gaoxing()]),
            start(1, "reviewer", 0),
            err(1, "reviewer", Some(0), "role_failed"),
        ])
        .unwrap();
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.meta.source.as_deref(), Some("basic"));
        assert!(result.meta.fallback);
        assert_eq!(result.meta.warnings.len(), 2);
        assert_eq!(result.meta.stages[1].status, StageStatus::Error);
    }

    #[test]
    fn test_empty_reviewer_result_is_authoritative() {
        let result = build(&[fin(0, "basic", 0, vec![gaoxing()]), fin(1, "reviewer", 0, vec![])]).unwrap();
        assert!(result.errors.is_empty());
        assert_eq!(result.patched_text(), Some(TEXT));
    }

    #[test]
    fn test_all_failed_and_empty_pipeline() {
        let failed = build(&[err(0, "ghost", None, "role_not_found"), err(1, "basic", Some(0), "role_failed")])
            .unwrap_err();
        assert_eq!(failed.meta.warnings.len(), 2);
        assert!(failed.message().starts_with("all pipeline stages failed"));

        let empty = build(&[]).unwrap();
        assert!(empty.errors.is_empty());
        assert_eq!(empty.patched_text(), Some(TEXT));
    }

    #[test]
    fn test_meta_wire_shape() {
        let result = build(&[fin(0, "basic", 0, vec![gaoxing()])]).unwrap();
        let v = serde_json::to_value(&result).unwrap();
        assert_eq!(v["meta"]["requestId"], "req-1");
        assert_eq!(v["meta"]["patchedText"], "我今天很高兴。");
        assert_eq!(v["meta"]["stages"][0]["roleId"], "basic");
        assert_eq!(v["meta"]["stages"][0]["status"], "final");
        let back: CheckResult = serde_json::from_value(v).unwrap();
        assert_eq!(back, result);
    }
}
