use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Open provenance map attached to every [`ErrorItem`].
pub type Metadata = Map<String, Value>;

/// Well-known metadata keys.
pub mod meta_keys {
    pub const CONFIDENCE: &str = "confidence";
    pub const SOURCE: &str = "source";
    pub const RULE_ID: &str = "ruleId";
    pub const EXACT_LOCATION: &str = "exactLocation";
    pub const DECISION: &str = "decision";
    pub const REVIEWED_FROM: &str = "reviewedFrom";
    pub const ROLE: &str = "role";
    pub const RUN_INDEX: &str = "runIndex";
}

/// Error category. The four built-in kinds plus any producer-defined tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ErrorType {
    Spelling,
    Punctuation,
    Grammar,
    Fluency,
    Custom(String),
}

impl ErrorType {
    pub fn as_str(&self) -> &str {
        match self {
            ErrorType::Spelling => "spelling",
            ErrorType::Punctuation => "punctuation",
            ErrorType::Grammar => "grammar",
            ErrorType::Fluency => "fluency",
            ErrorType::Custom(s) => s,
        }
    }

    /// The four built-in categories in default priority order.
    pub fn builtin() -> Vec<ErrorType> {
        vec![
            ErrorType::Spelling,
            ErrorType::Punctuation,
            ErrorType::Grammar,
            ErrorType::Fluency,
        ]
    }
}

impl From<String> for ErrorType {
    fn from(s: String) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "spelling" | "typo" => ErrorType::Spelling,
            "punctuation" => ErrorType::Punctuation,
            "grammar" => ErrorType::Grammar,
            "fluency" | "style" => ErrorType::Fluency,
            _ => ErrorType::Custom(s),
        }
    }
}

impl From<&str> for ErrorType {
    fn from(s: &str) -> Self {
        ErrorType::from(s.to_string())
    }
}

impl From<ErrorType> for String {
    fn from(t: ErrorType) -> Self {
        t.as_str().to_string()
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One error candidate or accepted correction.
///
/// `start`/`end` are UTF-16 offsets into the original input; `text` is the
/// slice at that span and `suggestion` its replacement (empty = delete).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorItem {
    pub id: String,
    pub start: usize,
    pub end: usize,
    pub text: String,
    pub suggestion: String,
    #[serde(rename = "type")]
    pub error_type: ErrorType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl ErrorItem {
    /// Create an item with a fresh id and empty metadata.
    pub fn new(
        start: usize,
        end: usize,
        text: impl Into<String>,
        suggestion: impl Into<String>,
        error_type: ErrorType,
    ) -> Self {
        Self {
            id: new_item_id(),
            start,
            end,
            text: text.into(),
            suggestion: suggestion.into(),
            error_type,
            explanation: None,
            metadata: Metadata::new(),
        }
    }

    pub fn with_explanation(mut self, explanation: impl Into<String>) -> Self {
        self.explanation = Some(explanation.into());
        self
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn with_confidence(self, confidence: f64) -> Self {
        self.with_meta(meta_keys::CONFIDENCE, confidence.clamp(0.0, 1.0))
    }

    /// Confidence score in `0..=1`, if the producer attached one.
    pub fn confidence(&self) -> Option<f64> {
        self.metadata
            .get(meta_keys::CONFIDENCE)
            .and_then(Value::as_f64)
    }

    pub fn source(&self) -> Option<&str> {
        self.metadata.get(meta_keys::SOURCE).and_then(Value::as_str)
    }

    /// Span length in UTF-16 units.
    pub fn span_len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn explanation_len(&self) -> usize {
        self.explanation
            .as_deref()
            .map(|e| e.chars().count())
            .unwrap_or(0)
    }
}

/// Fresh opaque item id.
pub fn new_item_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_runs() -> u32 {
    1
}

/// One step of a pipeline: run `role_id` `runs` times against the original text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineEntry {
    pub role_id: String,
    #[serde(default = "default_runs")]
    pub runs: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
}

impl PipelineEntry {
    pub fn new(role_id: impl Into<String>) -> Self {
        Self {
            role_id: role_id.into(),
            runs: 1,
            model_name: None,
        }
    }

    pub fn with_runs(mut self, runs: u32) -> Self {
        self.runs = runs;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model_name = Some(model.into());
        self
    }

    /// Effective run count (never below one).
    pub fn run_count(&self) -> u32 {
        self.runs.max(1)
    }
}

/// `options` of a check request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckOptions {
    /// Pipeline to run; the server default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<Vec<PipelineEntry>>,
}

/// Body of `POST /api/check`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckRequest {
    pub text: String,
    #[serde(default)]
    pub options: CheckOptions,
}

impl CheckRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            options: CheckOptions::default(),
        }
    }

    pub fn with_pipeline(mut self, pipeline: Vec<PipelineEntry>) -> Self {
        self.options.pipeline = Some(pipeline);
        self
    }
}
