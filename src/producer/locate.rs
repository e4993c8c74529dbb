//! Turning model-reported entries into validated spans.
//!
//! Models often miscount offsets. [`LocateMode::ExactIndex`] trusts the
//! reported span only if it slices to the reported text;
//! [`LocateMode::UniqueSubstring`] additionally accepts the single
//! occurrence of the text anywhere in the input.

use crate::text::{utf16_len, Utf16Text};
use crate::types::{meta_keys, ErrorItem, ErrorType};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocateMode {
    ExactIndex,
    UniqueSubstring,
}

impl FromStr for LocateMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "exact" | "exact_index" => Ok(LocateMode::ExactIndex),
            "unique" | "unique_substring" => Ok(LocateMode::UniqueSubstring),
            other => Err(format!("unknown locate mode '{other}'")),
        }
    }
}

impl fmt::Display for LocateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocateMode::ExactIndex => f.write_str("exact_index"),
            LocateMode::UniqueSubstring => f.write_str("unique_substring"),
        }
    }
}

/// Where a candidate ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Located {
    /// The reported offsets were right.
    Exact { start: usize, end: usize },
    /// Found by searching for the text.
    Relocated { start: usize, end: usize },
}

impl Located {
    pub fn span(self) -> (usize, usize) {
        match self {
            Located::Exact { start, end } | Located::Relocated { start, end } => (start, end),
        }
    }

    pub fn is_exact(self) -> bool {
        matches!(self, Located::Exact { .. })
    }
}

/// Resolve a span for `needle`.
///
/// A missing `end` is derived from the needle's length.
pub fn locate(
    text: &Utf16Text,
    start: Option<usize>,
    end: Option<usize>,
    needle: &str,
    mode: LocateMode,
) -> Option<Located> {
    if needle.is_empty() {
        return None;
    }
    if let Some(start) = start {
        let end = end.or_else(|| start.checked_add(utf16_len(needle)));
        if let Some(end) = end.filter(|&end| text.slice_matches(start, end, needle)) {
            return Some(Located::Exact { start, end });
        }
    }
    match mode {
        LocateMode::ExactIndex => None,
        LocateMode::UniqueSubstring => text.find_unique(needle).map(|start| Located::Relocated {
            start,
            end: start + utf16_len(needle),
        }),
    }
}

/// A candidate as reported by a model, before location.
#[derive(Debug, Clone, PartialEq)]
pub struct RawCandidate {
    pub start: Option<usize>,
    pub end: Option<usize>,
    pub text: String,
    pub suggestion: String,
    pub error_type: ErrorType,
    pub explanation: Option<String>,
    pub confidence: Option<f64>,
}

fn str_field<'a>(v: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| v.get(*k).and_then(Value::as_str))
}

fn index_field(v: &Value, key: &str) -> Option<usize> {
    match v.get(key)? {
        Value::Number(n) => n.as_u64().and_then(|n| usize::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

impl RawCandidate {
    /// Read a model entry. Returns `None` if it has no original text.
    pub fn from_value(v: &Value) -> Option<Self> {
        let text = str_field(v, &["text", "original", "wrong"])?.to_string();
        Some(Self {
            start: index_field(v, "start"),
            end: index_field(v, "end"),
            text,
            suggestion: str_field(v, &["suggestion", "correction", "replacement"])
                .unwrap_or_default()
                .to_string(),
            error_type: str_field(v, &["type", "category"])
                .map(ErrorType::from)
                .unwrap_or(ErrorType::Spelling),
            explanation: str_field(v, &["explanation", "reason"])
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            confidence: v.get("confidence").and_then(Value::as_f64),
        })
    }

    /// Locate and convert into an item. `None` if no span could be found or
    /// the suggestion does not change anything.
    pub fn into_item(self, text: &Utf16Text, mode: LocateMode, source: &str) -> Option<ErrorItem> {
        if self.suggestion == self.text {
            return None;
        }
        let located = locate(text, self.start, self.end, &self.text, mode)?;
        let (start, end) = located.span();
        let mut item = ErrorItem::new(start, end, self.text, self.suggestion, self.error_type)
            .with_meta(meta_keys::SOURCE, source)
            .with_meta(meta_keys::EXACT_LOCATION, located.is_exact());
        if let Some(explanation) = self.explanation {
            item = item.with_explanation(explanation);
        }
        if let Some(confidence) = self.confidence {
            item = item.with_confidence(confidence);
        }
        Some(item)
    }
}
